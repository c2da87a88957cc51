//! The core library: container helpers, type inspection, nested calls and
//! compilation from scripts.
use std::{collections::TryReserveError, io::Write};

use super::arg;
use crate::{
    error::{RtResult, RuntimeError},
    runtime::{object::NativeFn, string::format_num, value::Value},
    throw,
    vm::{
        context::Ctx,
        interpreter::{index_num, num_of},
    },
};

/// Largest length `setsize` will grow a vector to.
const MAX_VEC_LEN: f64 = u32::MAX as f64;

const NATIVES: &[(&str, NativeFn)] = &[
    ("print", print),
    ("size", size),
    ("append", append),
    ("setsize", setsize),
    ("subvec", subvec),
    ("keys", keys),
    ("delete", delete),
    ("contains", contains),
    ("typeof", type_of),
    ("die", die),
    ("call", call),
    ("compile", compile),
    ("bind", bind),
    ("closure", closure),
    ("caller", caller),
    ("int", int),
    ("num", num),
    ("streq", streq),
    ("substr", substr),
    ("chr", chr),
    ("id", id),
];

/// Adds the core natives to `ns`.
pub fn register(ctx: &mut Ctx<'_>, ns: &Value) -> RtResult<()> {
    ctx.gen_lib(ns, NATIVES)?;
    log::trace!(target: "vm", "core library registered ({} natives)", NATIVES.len());
    Ok(())
}

const MAX_RENDER_DEPTH: usize = 8;

fn render(v: &Value, out: &mut Vec<u8>, depth: usize) {
    if let Some(bytes) = v.stringify() {
        out.extend_from_slice(&bytes);
        return;
    }
    if depth >= MAX_RENDER_DEPTH {
        out.extend_from_slice(b"...");
        return;
    }
    if let Some(items) = v.vec_items() {
        out.push(b'[');
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                out.extend_from_slice(b", ");
            }
            render(item, out, depth + 1);
        }
        out.push(b']');
    } else if let Some(entries) = v.with_hash(|h| {
        h.iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<Vec<_>>()
    }) {
        out.push(b'{');
        for (i, (k, v)) in entries.iter().enumerate() {
            if i > 0 {
                out.extend_from_slice(b", ");
            }
            render(k, out, depth + 1);
            out.extend_from_slice(b": ");
            render(v, out, depth + 1);
        }
        out.push(b'}');
    } else if v.is_nil() {
        out.extend_from_slice(b"nil");
    } else {
        out.extend_from_slice(format!("<{}>", v.type_name()).as_bytes());
    }
}

fn print(ctx: &mut Ctx<'_>, _me: Value, args: &[Value]) -> RtResult {
    let mut buf = Vec::new();
    for v in args {
        render(v, &mut buf, 0);
    }
    let written = ctx.unlocked(|| {
        let mut out = std::io::stdout().lock();
        out.write_all(&buf).and_then(|_| out.flush())
    });
    if let Err(e) = written {
        throw!("print: {}", e);
    }
    Ok(ctx.new_str(&buf))
}

fn size(_ctx: &mut Ctx<'_>, _me: Value, args: &[Value]) -> RtResult {
    let v = arg(args, 0);
    let n = v
        .vec_len()
        .or_else(|| v.hash_len())
        .or_else(|| v.with_str(|b| b.len()));
    match n {
        Some(n) => Ok(Value::Num(n as f64)),
        None if v.is_nil() => Ok(Value::Num(0.0)),
        None => throw!("object has no size"),
    }
}

fn append(_ctx: &mut Ctx<'_>, _me: Value, args: &[Value]) -> RtResult {
    let v = arg(args, 0);
    let extra = args.get(1..).unwrap_or(&[]);
    if v.with_vec_mut(|items| items.extend_from_slice(extra)).is_none() {
        throw!("append: not a vector");
    }
    Ok(v)
}

fn setsize(_ctx: &mut Ctx<'_>, _me: Value, args: &[Value]) -> RtResult {
    let v = arg(args, 0);
    let n = index_num(&arg(args, 1))?;
    if n < 0.0 {
        throw!("setsize: negative size");
    }
    if n > MAX_VEC_LEN {
        throw!("setsize: size {} out of range", format_num(n));
    }
    let n = n as usize;
    let grown = v.with_vec_mut(|items| {
        items.try_reserve(n.saturating_sub(items.len()))?;
        items.resize(n, Value::Nil);
        Ok::<_, TryReserveError>(())
    });
    match grown {
        Some(Ok(())) => Ok(v),
        Some(Err(_)) => throw!("setsize: size {} out of range", n),
        None => throw!("setsize: not a vector"),
    }
}

fn subvec(ctx: &mut Ctx<'_>, _me: Value, args: &[Value]) -> RtResult {
    let Some(items) = arg(args, 0).vec_items() else {
        throw!("subvec: not a vector");
    };
    let mut start = index_num(&arg(args, 1))? as i64;
    if start < 0 {
        start += items.len() as i64;
    }
    if start < 0 || start as usize > items.len() {
        throw!("subvec: start {} out of bounds (size {})", start, items.len());
    }
    let start = start as usize;
    let len = match arg(args, 2) {
        Value::Nil => items.len() - start,
        n => (num_of(&n)?.max(0.0) as usize).min(items.len() - start),
    };
    Ok(ctx.new_vec(items[start..start + len].to_vec()))
}

fn keys(ctx: &mut Ctx<'_>, _me: Value, args: &[Value]) -> RtResult {
    match arg(args, 0).hash_keys() {
        Some(keys) => Ok(ctx.new_vec(keys)),
        None => throw!("keys: not a hash"),
    }
}

fn delete(ctx: &mut Ctx<'_>, _me: Value, args: &[Value]) -> RtResult {
    let h = arg(args, 0);
    ctx.hash_delete(&h, &arg(args, 1))?;
    Ok(h)
}

fn contains(_ctx: &mut Ctx<'_>, _me: Value, args: &[Value]) -> RtResult {
    let key = arg(args, 1);
    match arg(args, 0).with_hash(|h| h.contains(&key)) {
        Some(found) => Ok(Value::from_bool(found)),
        None => throw!("contains: not a hash"),
    }
}

fn type_of(ctx: &mut Ctx<'_>, _me: Value, args: &[Value]) -> RtResult {
    let name = match arg(args, 0) {
        v if v.is_ghost() => v.ghost_type().map_or("ghost", |ty| ty.name),
        v => v.type_name(),
    };
    Ok(ctx.new_string(name))
}

fn die(_ctx: &mut Ctx<'_>, _me: Value, args: &[Value]) -> RtResult {
    let v = arg(args, 0);
    let message = match v.stringify() {
        Some(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        None => "die".to_string(),
    };
    Err(RuntimeError::with_value(message, v))
}

/// `call(f, args?, me?, locals?, err?)`. With an error vector the call
/// never fails: the message and the trace are appended to it and nil is
/// returned.
fn call(ctx: &mut Ctx<'_>, _me: Value, args: &[Value]) -> RtResult {
    let func = arg(args, 0);
    let call_args = match arg(args, 1) {
        Value::Nil => Vec::new(),
        v => match v.vec_items() {
            Some(items) => items,
            None => throw!("call: arguments must be a vector"),
        },
    };
    let locals = arg(args, 3);
    if !locals.is_nil() && !locals.is_hash() {
        throw!("call: locals must be a hash");
    }
    let errors = args.get(4).filter(|v| v.is_vec()).cloned();

    let sub = ctx.sub_context()?;
    let result = ctx.call_sub(&sub, &func, &call_args, arg(args, 2), locals);
    ctx.free_child();
    match (result, errors) {
        (Ok(v), _) => Ok(v),
        (Err(err), Some(errors)) => {
            let message = ctx.new_string(&err.message);
            errors.vec_push(message);
            for frame in &err.trace {
                let file = ctx.new_string(&frame.file);
                errors.vec_push(file);
                errors.vec_push(Value::Num(frame.line as f64));
            }
            Ok(Value::Nil)
        }
        (Err(err), None) => Err(ctx.rethrow(err)),
    }
}

fn compile(ctx: &mut Ctx<'_>, _me: Value, args: &[Value]) -> RtResult {
    let Some(src) = arg(args, 0).str_bytes() else {
        throw!("compile: source is not a string");
    };
    let file = arg(args, 1)
        .to_str_lossy()
        .unwrap_or_else(|| "<compile>".to_string());
    let code = ctx
        .compile(&src, &file, 1)
        .map_err(|e| RuntimeError::new(e.to_string()))?;
    ctx.bind_to_caller(&code)
}

/// `bind(f, ns, outer?)`: `f`'s code closed over `ns`, chained to the
/// closure of `outer`.
fn bind(ctx: &mut Ctx<'_>, _me: Value, args: &[Value]) -> RtResult {
    let Some(code) = arg(args, 0).func_code() else {
        throw!("bind: not a function");
    };
    let ns = arg(args, 1);
    if !ns.is_hash() {
        throw!("bind: namespace is not a hash");
    }
    let next = match arg(args, 2) {
        Value::Nil => Value::Nil,
        outer => match outer.func_closure() {
            Some(c) => c,
            None => throw!("bind: outer scope is not a function"),
        },
    };
    let closure = ctx.new_closure(ns, next);
    Ok(ctx.new_func(code, closure))
}

/// `closure(f, level?)`: namespace `level` steps up `f`'s scope chain.
fn closure(_ctx: &mut Ctx<'_>, _me: Value, args: &[Value]) -> RtResult {
    let Some(mut scope) = arg(args, 0).func_closure() else {
        throw!("closure: not a function");
    };
    let level = match arg(args, 1) {
        Value::Nil => 0,
        n => num_of(&n)?.max(0.0) as usize,
    };
    for _ in 0..level {
        scope = match scope.closure_parts() {
            Some((_, next)) => next,
            None => return Ok(Value::Nil),
        };
    }
    Ok(scope.closure_parts().map(|(ns, _)| ns).unwrap_or_default())
}

/// `caller(level?)`: `[locals, func, file, line]` of a running frame, nil
/// past the outermost one.
fn caller(ctx: &mut Ctx<'_>, _me: Value, args: &[Value]) -> RtResult {
    let level = match arg(args, 0) {
        Value::Nil => 1,
        n => num_of(&n)?.max(0.0) as usize,
    };
    let (Some(locals), Some(func), Some(file), Some(line)) = (
        ctx.frame_locals(level),
        ctx.frame_func(level),
        ctx.frame_file(level),
        ctx.frame_line(level),
    ) else {
        return Ok(Value::Nil);
    };
    let file = ctx.new_string(&file);
    Ok(ctx.new_vec(vec![locals, func, file, Value::Num(line as f64)]))
}

fn int(_ctx: &mut Ctx<'_>, _me: Value, args: &[Value]) -> RtResult {
    Ok(arg(args, 0)
        .to_num()
        .map(|n| Value::Num(n.trunc()))
        .unwrap_or_default())
}

fn num(_ctx: &mut Ctx<'_>, _me: Value, args: &[Value]) -> RtResult {
    Ok(arg(args, 0).to_num().map(Value::Num).unwrap_or_default())
}

fn streq(_ctx: &mut Ctx<'_>, _me: Value, args: &[Value]) -> RtResult {
    let a = arg(args, 0).stringify();
    let b = arg(args, 1).stringify();
    Ok(Value::from_bool(a.is_some() && a == b))
}

/// `substr(s, start, len?)` on bytes. A negative start counts from the end.
fn substr(ctx: &mut Ctx<'_>, _me: Value, args: &[Value]) -> RtResult {
    let Some(bytes) = arg(args, 0).stringify() else {
        throw!("substr: not a string");
    };
    let mut start = index_num(&arg(args, 1))? as i64;
    if start < 0 {
        start += bytes.len() as i64;
    }
    if start < 0 || start as usize > bytes.len() {
        throw!("substr: start {} out of bounds (size {})", start, bytes.len());
    }
    let start = start as usize;
    let len = match arg(args, 2) {
        Value::Nil => bytes.len() - start,
        n => (num_of(&n)?.max(0.0) as usize).min(bytes.len() - start),
    };
    Ok(ctx.new_str(&bytes[start..start + len]))
}

fn chr(ctx: &mut Ctx<'_>, _me: Value, args: &[Value]) -> RtResult {
    let n = num_of(&arg(args, 0))?;
    if !(0.0..=255.0).contains(&n) {
        throw!("chr: byte value {} out of range", format_num(n));
    }
    Ok(ctx.new_str(&[n as u8]))
}

/// Identity string of a heap object, e.g. `hash:0x55d0c3a1b2c0`.
fn id(ctx: &mut Ctx<'_>, _me: Value, args: &[Value]) -> RtResult {
    let v = arg(args, 0);
    let text = match (&v, v.as_obj()) {
        (_, Some(o)) => format!("{}:{:#x}", o.ty().name(), o.addr()),
        (Value::Num(n), None) => format!("scalar:{}", format_num(*n)),
        _ => throw!("id: argument is not an object"),
    };
    Ok(ctx.new_string(&text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    fn with_core(f: impl FnOnce(&mut Ctx<'_>)) {
        let rt = Runtime::new();
        let mut cx = rt.new_context();
        cx.with(f);
    }

    fn strs(v: &Value) -> Vec<String> {
        v.vec_items()
            .unwrap()
            .iter()
            .map(|x| x.stringify().map(|b| String::from_utf8(b).unwrap()).unwrap_or_default())
            .collect()
    }

    #[test]
    fn vector_helpers() {
        with_core(|ctx| {
            let v = ctx.new_vec(vec![Value::Num(1.0)]);
            append(ctx, Value::Nil, &[v.clone(), Value::Num(2.0), Value::Num(3.0)]).unwrap();
            assert_eq!(strs(&v), vec!["1", "2", "3"]);
            let part = subvec(ctx, Value::Nil, &[v.clone(), Value::Num(-2.0)]).unwrap();
            assert_eq!(strs(&part), vec!["2", "3"]);
            let part = subvec(ctx, Value::Nil, &[v.clone(), Value::Num(0.0), Value::Num(10.0)]).unwrap();
            assert_eq!(part.vec_len(), Some(3));
            assert!(subvec(ctx, Value::Nil, &[v.clone(), Value::Num(4.0)]).is_err());
            setsize(ctx, Value::Nil, &[v.clone(), Value::Num(5.0)]).unwrap();
            assert_eq!(v.vec_len(), Some(5));
            assert!(v.vec_get(4).unwrap().is_nil());
            let n = size(ctx, Value::Nil, &[v]).unwrap();
            assert_eq!(n.num(), Some(5.0));
        });
    }

    #[test]
    fn hash_helpers() {
        with_core(|ctx| {
            let h = ctx.new_hash();
            let k = ctx.new_str(b"k");
            ctx.hash_set(&h, k.clone(), Value::Num(1.0)).unwrap();
            let found = contains(ctx, Value::Nil, &[h.clone(), k.clone()]).unwrap();
            assert_eq!(found.num(), Some(1.0));
            let ks = keys(ctx, Value::Nil, &[h.clone()]).unwrap();
            assert_eq!(strs(&ks), vec!["k"]);
            delete(ctx, Value::Nil, &[h.clone(), k.clone()]).unwrap();
            let found = contains(ctx, Value::Nil, &[h.clone(), k]).unwrap();
            assert_eq!(found.num(), Some(0.0));
            assert!(keys(ctx, Value::Nil, &[Value::Num(1.0)]).is_err());
        });
    }

    #[test]
    fn scalars() {
        with_core(|ctx| {
            let s = ctx.new_str(b"12.75");
            assert_eq!(int(ctx, Value::Nil, &[s.clone()]).unwrap().num(), Some(12.0));
            assert_eq!(num(ctx, Value::Nil, &[s.clone()]).unwrap().num(), Some(12.75));
            let word = ctx.new_str(b"word");
            assert!(num(ctx, Value::Nil, &[word.clone()]).unwrap().is_nil());
            let part = substr(ctx, Value::Nil, &[word.clone(), Value::Num(1.0), Value::Num(2.0)]).unwrap();
            assert_eq!(part.to_str_lossy().as_deref(), Some("or"));
            let c = chr(ctx, Value::Nil, &[Value::Num(65.0)]).unwrap();
            assert_eq!(c.to_str_lossy().as_deref(), Some("A"));
            let other = ctx.new_str(b"word");
            assert_eq!(streq(ctx, Value::Nil, &[word, other]).unwrap().num(), Some(1.0));
            let t = type_of(ctx, Value::Nil, &[Value::Num(1.0)]).unwrap();
            assert_eq!(t.to_str_lossy().as_deref(), Some("scalar"));
            let h = ctx.new_hash();
            let t = type_of(ctx, Value::Nil, &[h.clone()]).unwrap();
            assert_eq!(t.to_str_lossy().as_deref(), Some("hash"));
            let ident = id(ctx, Value::Nil, &[h]).unwrap().to_str_lossy().unwrap();
            assert!(ident.starts_with("hash:0x"));
        });
    }

    #[test]
    fn out_of_range_sizes_and_bytes() {
        with_core(|ctx| {
            let v = ctx.new_vec(vec![Value::Num(1.0)]);
            for n in [1e300, 1e12, f64::INFINITY, f64::NAN] {
                let err = setsize(ctx, Value::Nil, &[v.clone(), Value::Num(n)]).unwrap_err();
                assert!(err.message.contains("out of range") || err.message.contains("not a finite"));
            }
            assert_eq!(v.vec_len(), Some(1));
            let err = setsize(ctx, Value::Nil, &[v.clone(), Value::Num(-1.0)]).unwrap_err();
            assert_eq!(err.message, "setsize: negative size");

            assert!(subvec(ctx, Value::Nil, &[v.clone(), Value::Num(f64::NAN)]).is_err());
            let word = ctx.new_str(b"word");
            assert!(substr(ctx, Value::Nil, &[word, Value::Num(f64::NEG_INFINITY)]).is_err());

            for n in [256.0, -1.0, 1e20, f64::NAN] {
                let err = chr(ctx, Value::Nil, &[Value::Num(n)]).unwrap_err();
                assert!(err.message.starts_with("chr: byte value"), "{}", err.message);
            }
            let c = chr(ctx, Value::Nil, &[Value::Num(255.0)]).unwrap();
            assert_eq!(c.with_str(|b| b.to_vec()), Some(vec![255]));
        });
    }

    #[test]
    fn rendering() {
        with_core(|ctx| {
            let s = ctx.new_str(b"x");
            let inner = ctx.new_vec(vec![Value::Num(2.0), s]);
            let v = ctx.new_vec(vec![Value::Num(1.5), inner, Value::Nil]);
            let mut out = Vec::new();
            render(&v, &mut out, 0);
            assert_eq!(out, b"[1.5, [2, x], nil]");
        });
    }
}
