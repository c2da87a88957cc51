use std::fmt::Write;

use super::opcodes::*;
use crate::runtime::{
    object::{Body, CodeObj},
    string::format_num,
    value::Value,
};

fn describe_const(v: &Value, out: &mut String) -> std::fmt::Result {
    match v {
        Value::Nil => write!(out, "nil"),
        Value::Num(n) => write!(out, "{}", format_num(*n)),
        Value::Obj(_) if v.is_str() => {
            let s = v.to_str_lossy().unwrap_or_default();
            write!(out, "{:?}", s)
        }
        Value::Obj(_) => write!(out, "<{}>", v.type_name()),
        Value::End => write!(out, "<end>"),
    }
}

/// Writes a listing of `code` and, after it, of every nested code constant.
pub fn disassemble<T: std::fmt::Write>(code: &CodeObj, f: &mut T) -> std::fmt::Result {
    disassemble_nested(code, "<top>", f)
}

fn disassemble_nested<T: std::fmt::Write>(code: &CodeObj, name: &str, f: &mut T) -> std::fmt::Result {
    let ops = code.bytecode();
    let w = ops.len().to_string().len().max(4);
    writeln!(
        f,
        "{} ({}, {} words, {} constants):",
        name,
        code.file(),
        ops.len(),
        code.constants().len()
    )?;

    let mut ip = 0;
    let mut last_line = None;
    while ip < ops.len() {
        let op = ops[ip];
        let start = ip;
        ip += 1;
        let mut tmp = String::new();

        match opcode_name(op) {
            Some(mnemonic) => {
                write!(tmp, "{:<12}", mnemonic)?;
                if operand_count(op) > 0 {
                    let arg = ops.get(ip).copied().unwrap_or(0);
                    ip += 1;
                    write!(tmp, " {}", arg)?;
                    match op {
                        OP_PUSH_CONST | OP_LOCAL | OP_SET_SYM | OP_SET_LOCAL | OP_MEMBER
                        | OP_SET_MEMBER | OP_FUNC => {
                            if let Some(c) = code.constants().get(arg as usize) {
                                write!(tmp, " ; ")?;
                                describe_const(c, &mut tmp)?;
                            }
                        }
                        _ => (),
                    }
                }
            }
            None => write!(tmp, "<invalid {:#x}>", op)?,
        }

        let line = code.line_at(start);
        if last_line != Some(line) {
            last_line = Some(line);
            writeln!(f, "{:0w$}: {:<40} line {}", start, tmp, line, w = w)?;
        } else {
            writeln!(f, "{:0w$}: {}", start, tmp, w = w)?;
        }
    }

    for (i, c) in code.constants().iter().enumerate() {
        if !c.is_code() {
            continue;
        }
        let nested = match c.as_obj().map(|o| o.body()).as_deref() {
            Some(Body::Code(code)) => Some(code.clone()),
            _ => None,
        };
        if let Some(nested) = nested {
            writeln!(f)?;
            disassemble_nested(&nested, &format!("{}/const {}", name, i), f)?;
        }
    }
    Ok(())
}

/// Like [`disassemble`], for a code object or a function bound to one.
pub fn disassemble_value<T: std::fmt::Write>(v: &Value, f: &mut T) -> std::fmt::Result {
    let target = v.func_code().unwrap_or_else(|| v.clone());
    let code = match target.as_obj().map(|o| o.body()).as_deref() {
        Some(Body::Code(code)) => Some(code.clone()),
        _ => None,
    };
    match code {
        Some(code) => disassemble(&code, f),
        None => match v.native_name() {
            Some(name) => writeln!(f, "<native {}>", name),
            None => writeln!(f, "<{} is not compiled code>", v.type_name()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    #[test]
    fn lists_nested_units_and_lines() {
        let rt = Runtime::new();
        let mut cx = rt.new_context();
        let code = cx
            .compile(b"var x = 1;\nvar f = func(a) { a ~ \"!\" };", "dis.nas", 1)
            .unwrap();
        let mut out = String::new();
        disassemble_value(&code, &mut out).unwrap();
        assert!(out.starts_with("<top> (dis.nas,"));
        assert!(out.contains("push-one"));
        assert!(out.contains("set-local"));
        assert!(out.contains("line 2"));
        assert!(out.contains("<top>/const"));
        assert!(out.contains("\"!\""));

        let mut out = String::new();
        disassemble_value(&Value::Num(1.0), &mut out).unwrap();
        assert_eq!(out, "<scalar is not compiled code>\n");
    }

    #[test]
    fn natives_list_by_name() {
        let rt = Runtime::new();
        let mut cx = rt.new_context();
        cx.with(|ctx| {
            let ns = ctx.new_hash();
            crate::runtime::libraries::core::register(ctx, &ns).unwrap();
            let size = ctx.member_get(&ns, "size").unwrap().unwrap();
            let mut out = String::new();
            disassemble_value(&size, &mut out).unwrap();
            assert_eq!(out, "<native size>\n");
            assert_eq!(size.native_name(), Some("size"));
            assert_eq!(Value::Num(1.0).native_name(), None);
        });
    }
}
