use std::io::Write;

use sable::{bytecode::disassemble_value, libraries, Error, Runtime, RuntimeOptions, Value};
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

fn report(err: &Error) {
    let mut stderr = StandardStream::stderr(ColorChoice::Auto);
    let _ = stderr.set_color(ColorSpec::new().set_fg(Some(Color::Red)).set_bold(true));
    let _ = write!(stderr, "error");
    let _ = stderr.reset();
    let _ = writeln!(stderr, ": {}", err);
    if let Error::Runtime(e) = err {
        for frame in e.trace.iter().skip(1) {
            let _ = writeln!(stderr, "  called from {}, line {}", frame.file, frame.line);
        }
    }
}

fn main() {
    env_logger::init();
    let options = match RuntimeOptions::parse() {
        Ok(options) => options,
        Err(e) => {
            eprintln!("sable: {}", e);
            std::process::exit(2);
        }
    };
    let Some(path) = options.filename.clone() else {
        eprintln!("sable: no script given");
        std::process::exit(2);
    };
    let src = match std::fs::read(&path) {
        Ok(src) => src,
        Err(e) => {
            eprintln!("sable: cannot read {}: {}", path.display(), e);
            std::process::exit(2);
        }
    };
    let file = path.display().to_string();
    let disassemble = options.disassemble;
    let script_args = options.script_args.clone();

    let rt = Runtime::with_options(options);
    let mut cx = rt.new_context();
    let prepared = cx.with(|ctx| -> Result<(Value, Value, Value), Error> {
        let code = ctx.compile(&src, &file, 1)?;
        let ns = ctx.new_hash();
        libraries::core::register(ctx, &ns)?;
        let args = script_args.iter().map(|a| ctx.new_string(a)).collect();
        let args = ctx.new_vec(args);
        Ok((code, ns, args))
    });
    let (code, ns, args) = match prepared {
        Ok(parts) => parts,
        Err(e) => {
            report(&e);
            std::process::exit(1);
        }
    };
    rt.save(code.clone());
    rt.save(ns.clone());

    if disassemble {
        let mut listing = String::new();
        if disassemble_value(&code, &mut listing).is_ok() {
            print!("{}", listing);
        }
    }

    let arg_list = args.vec_items().unwrap_or_default();
    if let Err(e) = cx.call(&code, &arg_list, Value::Nil, ns) {
        report(&Error::Runtime(e));
        std::process::exit(1);
    }
}
