//! The bytecode interpreter.
//!
//! Frames, the operand stack and the mark stack live in the context state.
//! Every instruction starts by clearing the temporaries, so a value that must
//! outlive an instruction has to be on the stack, in a frame or reachable
//! from one. Anything an instruction allocates stays rooted through the
//! temporaries until the next instruction.
use std::sync::Arc;

use crate::{
    bytecode::opcodes::*,
    error::{RtResult, RuntimeError},
    runtime::{
        hashtable::{hash_key, keys_equal},
        object::{Body, CodeObj, NativeImpl, ObjType},
        string::{format_num, parse_num},
        value::Value,
    },
    throw,
};

use super::context::{Ctx, Frame};

enum Callee {
    Native(NativeImpl),
    Script { code: Arc<CodeObj>, closure: Value },
    Code(Arc<CodeObj>),
    Uncallable,
}

fn code_of(v: &Value) -> Option<Arc<CodeObj>> {
    let o = v.as_obj().filter(|o| o.ty() == ObjType::Code)?;
    let body = o.body();
    match &*body {
        Body::Code(code) => Some(code.clone()),
        _ => None,
    }
}

fn native_of(v: &Value) -> Option<NativeImpl> {
    let o = v.as_obj().filter(|o| o.ty() == ObjType::Native)?;
    let body = o.body();
    match &*body {
        Body::Native(n) => Some(n.imp.clone()),
        _ => None,
    }
}

fn classify(v: &Value) -> Callee {
    match v.obj_type() {
        Some(ObjType::Func) => {
            let (Some(target), Some(closure)) = (v.func_code(), v.func_closure()) else {
                return Callee::Uncallable;
            };
            if let Some(code) = code_of(&target) {
                Callee::Script { code, closure }
            } else if let Some(imp) = native_of(&target) {
                Callee::Native(imp)
            } else {
                Callee::Uncallable
            }
        }
        Some(ObjType::Native) => native_of(v).map_or(Callee::Uncallable, Callee::Native),
        Some(ObjType::Code) => code_of(v).map_or(Callee::Uncallable, Callee::Code),
        _ => Callee::Uncallable,
    }
}

/// Numeric value of an operand.
pub fn num_of(v: &Value) -> RtResult<f64> {
    match v {
        Value::Num(n) => Ok(*n),
        Value::Nil => throw!("nil used in numeric context"),
        Value::Obj(_) if v.is_str() => match v.with_str(parse_num).flatten() {
            Some(n) => Ok(n),
            None => throw!("non-numeric string in numeric context"),
        },
        _ => throw!("non-scalar in numeric context"),
    }
}

/// Truth value of a condition. Strings are true unless empty or numerically
/// zero.
pub fn truthy(v: &Value) -> RtResult<bool> {
    match v {
        Value::Num(n) => Ok(*n != 0.0),
        Value::Nil => Ok(false),
        Value::Obj(_) if v.is_str() => Ok(v
            .with_str(|b| {
                if b.is_empty() {
                    false
                } else {
                    parse_num(b).map_or(true, |n| n != 0.0)
                }
            })
            .unwrap_or(false)),
        _ => throw!("non-scalar used in boolean context"),
    }
}

/// `num_of` for indices and counts, which must be finite.
pub fn index_num(v: &Value) -> RtResult<f64> {
    let n = num_of(v)?;
    if !n.is_finite() {
        throw!("index {} is not a finite number", format_num(n));
    }
    Ok(n)
}

/// A string element: a number in `0..=255`.
pub fn byte_of(v: &Value) -> RtResult<u8> {
    let n = num_of(v)?;
    if !(0.0..=255.0).contains(&n) {
        throw!("byte value {} out of range", format_num(n));
    }
    Ok(n as u8)
}

/// `==` semantics: numbers and numeric strings compare numerically, strings
/// by content, everything else by identity.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Num(x), Value::Obj(_)) if b.is_str() => b.to_num() == Some(*x),
        (Value::Obj(_), Value::Num(y)) if a.is_str() => a.to_num() == Some(*y),
        _ => keys_equal(a, b),
    }
}

fn stringify(v: &Value) -> RtResult<Vec<u8>> {
    match v.stringify() {
        Some(bytes) => Ok(bytes),
        None if v.is_nil() => throw!("nil used in string context"),
        None => throw!("non-scalar in string context"),
    }
}

/// Resolves a possibly negative index against `len`.
fn index_in(k: &Value, len: usize, what: &str) -> RtResult<usize> {
    let raw = index_num(k)?;
    let mut i = raw as i64;
    if i < 0 {
        i += len as i64;
    }
    if i < 0 || i >= len as i64 {
        throw!("{} index {} out of bounds (size {})", what, raw, len);
    }
    Ok(i as usize)
}

/// Inclusive slice bounds; nil means the respective end.
fn slice_bounds(from: &Value, to: &Value, len: usize) -> RtResult<Option<(usize, usize)>> {
    let bound = |v: &Value, default: i64| -> RtResult<i64> {
        if v.is_nil() {
            return Ok(default);
        }
        let i = index_num(v)? as i64;
        Ok(if i < 0 { i + len as i64 } else { i })
    };
    let a = bound(from, 0)?;
    let b = bound(to, len as i64 - 1)?;
    if a > b {
        return Ok(None);
    }
    if a < 0 || b >= len as i64 {
        throw!("slice [{}:{}] out of bounds (size {})", a, b, len);
    }
    Ok(Some((a as usize, b as usize)))
}

impl<'a> Ctx<'a> {
    /// Runs a call to completion on this context, discarding any previous
    /// state.
    pub(crate) fn call_value(&mut self, func: &Value, args: &[Value], me: Value, locals: Value) -> RtResult {
        self.free_child();
        self.st.clear_stacks();
        self.st.error = None;
        let result = self.start_call(func, args, me, locals);
        self.finish(result)
    }

    fn start_call(&mut self, func: &Value, args: &[Value], me: Value, locals: Value) -> RtResult {
        // Everything passed in stays rooted until the frame owns it.
        self.push(func.clone())?;
        for arg in args {
            self.push(arg.clone())?;
        }
        self.push(me.clone())?;
        self.push(locals.clone())?;

        let callee = classify(func);
        if let Callee::Native(imp) = &callee {
            let v = self.invoke_native(imp, me, args)?;
            self.st.stack.clear();
            return Ok(v);
        }
        let locals = if locals.is_hash() {
            locals
        } else {
            self.new_hash()
        };
        let (code, closure, func) = match callee {
            Callee::Script { code, closure } => (code, closure, func.clone()),
            // Raw code runs directly in the given namespace.
            Callee::Code(code) => {
                let bound = self.new_func(func.clone(), Value::Nil);
                (code, Value::Nil, bound)
            }
            _ => throw!("function/method call on uncallable object"),
        };
        self.bind_args(&code, &locals, args, me)?;
        self.st.stack.clear();
        self.push_frame(func, code, locals, closure, 0)?;
        self.run()
    }

    /// Continues after an error raised by a native call, with `value` as
    /// the call's result.
    pub(crate) fn resume(&mut self, value: Value) -> RtResult {
        let at = match self.st.resume_at.take() {
            Some(at) if !self.st.frames.is_empty() => at,
            _ => throw!("context cannot be resumed"),
        };
        self.free_child();
        self.st.error = None;
        self.st.stack.truncate(at);
        self.push(value)?;
        let result = self.run();
        self.finish(result)
    }

    fn finish(&mut self, result: RtResult) -> RtResult {
        match result {
            Ok(v) => {
                self.st.clear_stacks();
                self.free_child();
                Ok(v)
            }
            Err(mut err) => {
                let mut frames = self.st.trace_frames();
                err.trace.append(&mut frames);
                log::debug!(target: "vm", "runtime error: {}", err);
                self.st.error = Some(err.clone());
                Err(err)
            }
        }
    }

    fn invoke_native(&mut self, imp: &NativeImpl, me: Value, args: &[Value]) -> RtResult {
        match imp {
            NativeImpl::Plain(f) => f(self, me, args),
            NativeImpl::WithData { f, data, .. } => f(self, me, args, &**data),
        }
    }

    fn push_frame(
        &mut self,
        func: Value,
        code: Arc<CodeObj>,
        locals: Value,
        closure: Value,
        bp: usize,
    ) -> RtResult<()> {
        if self.st.frames.len() >= self.rt.options.max_call_depth {
            throw!("call stack overflow");
        }
        let mark_base = self.st.marks.len();
        self.st.frames.push(Frame {
            func,
            code,
            ip: 0,
            locals,
            closure,
            bp,
            mark_base,
        });
        Ok(())
    }

    fn set_const_local(&mut self, code: &CodeObj, locals: &Value, sym: u16, v: Value) -> RtResult<()> {
        let idx = sym as usize;
        self.hash_set_hashed(locals, code.consts[idx].clone(), code.const_hashes[idx], true, v)
    }

    /// Binds positional arguments, defaults and the rest vector.
    fn bind_args(&mut self, code: &CodeObj, locals: &Value, args: &[Value], me: Value) -> RtResult<()> {
        if !me.is_nil() {
            let sym = self.rt.sym_me.clone();
            self.hash_set(locals, sym, me)?;
        }
        if args.len() < code.args.len() {
            throw!(
                "too few function args (have {} need {})",
                args.len(),
                code.args.len()
            );
        }
        for (&sym, arg) in code.args.iter().zip(args) {
            self.set_const_local(code, locals, sym, arg.clone())?;
        }
        let mut next = code.args.len();
        for &(sym, default) in &code.opt_args {
            let v = match args.get(next) {
                Some(v) => v.clone(),
                None => code.consts[default as usize].clone(),
            };
            self.set_const_local(code, locals, sym, v)?;
            next += 1;
        }
        if let Some(rest) = code.rest {
            let extra = args.get(next..).unwrap_or(&[]);
            if code.need_arg_vector || !extra.is_empty() {
                let v = self.new_vec(extra.to_vec());
                self.set_const_local(code, locals, rest, v)?;
            }
        }
        Ok(())
    }

    /// Binds arguments passed by name through a hash.
    fn bind_named(&mut self, code: &CodeObj, locals: &Value, named: &Value, me: Value) -> RtResult<()> {
        let entries: Vec<(Value, Value)> = named
            .with_hash(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        if !me.is_nil() {
            let sym = self.rt.sym_me.clone();
            self.hash_set(locals, sym, me)?;
        }
        for (k, v) in entries {
            self.hash_set(locals, k, v)?;
        }
        for &sym in &code.args {
            let idx = sym as usize;
            let present = locals
                .with_hash(|h| h.get_hashed(&code.consts[idx], code.const_hashes[idx], true).is_some())
                .unwrap_or(false);
            if !present {
                let name = code.consts[idx].to_str_lossy().unwrap_or_default();
                throw!("missing argument: {}", name);
            }
        }
        for &(sym, default) in &code.opt_args {
            let idx = sym as usize;
            let present = locals
                .with_hash(|h| h.get_hashed(&code.consts[idx], code.const_hashes[idx], true).is_some())
                .unwrap_or(false);
            if !present {
                self.set_const_local(code, locals, sym, code.consts[default as usize].clone())?;
            }
        }
        if let Some(rest) = code.rest {
            if code.need_arg_vector {
                let v = self.new_vec(Vec::new());
                self.set_const_local(code, locals, rest, v)?;
            }
        }
        Ok(())
    }

    #[inline]
    fn push(&mut self, v: Value) -> RtResult<()> {
        if self.st.stack.len() >= self.rt.options.max_stack {
            throw!("stack overflow");
        }
        self.st.stack.push(v);
        Ok(())
    }

    #[inline]
    fn pop(&mut self) -> RtResult {
        match self.st.stack.pop() {
            Some(v) => Ok(v),
            None => throw!("operand stack underflow"),
        }
    }

    /// Value `depth` slots below the top.
    #[inline]
    fn peek(&self, depth: usize) -> RtResult {
        let len = self.st.stack.len();
        match len.checked_sub(depth + 1) {
            Some(i) => Ok(self.st.stack[i].clone()),
            None => throw!("operand stack underflow"),
        }
    }

    /// Drops the top `n` values and pushes `v`.
    fn replace_top(&mut self, n: usize, v: Value) -> RtResult<()> {
        let len = self.st.stack.len();
        self.st.stack.truncate(len.saturating_sub(n));
        self.push(v)
    }

    fn frame(&self) -> RtResult<&Frame> {
        match self.st.frames.last() {
            Some(f) => Ok(f),
            None => throw!("no active frame"),
        }
    }

    fn frame_mut(&mut self) -> RtResult<&mut Frame> {
        match self.st.frames.last_mut() {
            Some(f) => Ok(f),
            None => throw!("no active frame"),
        }
    }

    fn lookup_sym(&self, sym: &Value, hash: u32) -> RtResult {
        let frame = self.frame()?;
        let found = frame
            .locals
            .with_hash(|h| h.get_hashed(sym, hash, true))
            .flatten();
        if let Some(v) = found {
            return Ok(v);
        }
        let mut closure = frame.closure.clone();
        while let Some((ns, next)) = closure.closure_parts() {
            if let Some(v) = ns.with_hash(|h| h.get_hashed(sym, hash, true)).flatten() {
                return Ok(v);
            }
            closure = next;
        }
        let name = sym.to_str_lossy().unwrap_or_default();
        throw!("undefined symbol: {}", name)
    }

    /// Assigns to the innermost scope that already defines `sym`, or to the
    /// locals.
    fn set_sym(&mut self, sym: &Value, hash: u32, v: Value) -> RtResult<()> {
        let (locals, mut closure) = {
            let frame = self.frame()?;
            (frame.locals.clone(), frame.closure.clone())
        };
        let defined = |ns: &Value| {
            ns.with_hash(|h| h.get_hashed(sym, hash, true).is_some())
                .unwrap_or(false)
        };
        let mut target = locals.clone();
        if !defined(&locals) {
            while let Some((ns, next)) = closure.closure_parts() {
                if defined(&ns) {
                    target = ns;
                    break;
                }
                closure = next;
            }
        }
        self.hash_set_hashed(&target, sym.clone(), hash, true, v)
    }

    fn find_member(
        &self,
        h: &Value,
        sym: &Value,
        hash: u32,
        interned: bool,
        depth: usize,
        visits: &mut usize,
    ) -> RtResult<Option<Value>> {
        if depth > self.rt.options.max_parents_depth || *visits == 0 {
            return Ok(None);
        }
        *visits -= 1;
        let parents_sym = &self.rt.sym_parents;
        let parents_hash = hash_key(parents_sym).0;
        let Some((found, parents)) = h.with_hash(|t| {
            (
                t.get_hashed(sym, hash, interned),
                t.get_hashed(parents_sym, parents_hash, true),
            )
        }) else {
            return Ok(None);
        };
        if found.is_some() {
            return Ok(found);
        }
        let Some(parents) = parents else {
            return Ok(None);
        };
        let Some(items) = parents.vec_items() else {
            throw!("parents field not vector");
        };
        for parent in &items {
            if let Some(v) = self.find_member(parent, sym, hash, interned, depth + 1, visits)? {
                return Ok(Some(v));
            }
        }
        Ok(None)
    }

    fn member_hashed(&mut self, obj: &Value, sym: &Value, hash: u32, interned: bool) -> RtResult<Option<Value>> {
        match obj.obj_type() {
            Some(ObjType::Hash) => {
                let mut visits = self.rt.options.max_parents_visits;
                self.find_member(obj, sym, hash, interned, 0, &mut visits)
            }
            Some(ObjType::Ghost) => match obj.ghost_type().and_then(|t| t.get_member) {
                Some(get) => {
                    let name = sym.str_bytes().unwrap_or_default();
                    get(self, obj, &name)
                }
                None => throw!("ghost has no members"),
            },
            _ => throw!("non-objects have no members"),
        }
    }

    fn set_member_hashed(&mut self, obj: &Value, sym: &Value, hash: u32, interned: bool, v: Value) -> RtResult<()> {
        match obj.obj_type() {
            Some(ObjType::Hash) => self.hash_set_hashed(obj, sym.clone(), hash, interned, v),
            Some(ObjType::Ghost) => match obj.ghost_type().and_then(|t| t.set_member) {
                Some(set) => {
                    let name = sym.str_bytes().unwrap_or_default();
                    set(self, obj, &name, v)
                }
                None => throw!("ghost members are read-only"),
            },
            _ => throw!("non-objects have no members"),
        }
    }

    /// Looks `name` up in `obj` and its parents. `None` when absent.
    pub fn member_get(&mut self, obj: &Value, name: &str) -> RtResult<Option<Value>> {
        let sym = self.intern(name.as_bytes());
        let (hash, interned) = hash_key(&sym);
        self.member_hashed(obj, &sym, hash, interned)
    }

    pub fn member_set(&mut self, obj: &Value, name: &str, v: Value) -> RtResult<()> {
        let sym = self.intern(name.as_bytes());
        let (hash, interned) = hash_key(&sym);
        self.set_member_hashed(obj, &sym, hash, interned, v)
    }

    /// `box[key]`. Missing hash keys read as nil.
    pub fn extract(&self, container: &Value, key: &Value) -> RtResult {
        match container.obj_type() {
            Some(ObjType::Hash) => {
                if !key.is_scalar() {
                    throw!("container index not scalar");
                }
                Ok(container.hash_get(key).unwrap_or_default())
            }
            Some(ObjType::Vec) => {
                let len = container.vec_len().unwrap_or(0);
                let i = index_in(key, len, "vector")?;
                Ok(container.vec_get(i).unwrap_or_default())
            }
            Some(ObjType::Str) => {
                let bytes = container.str_bytes().unwrap_or_default();
                let i = index_in(key, bytes.len(), "string")?;
                Ok(Value::Num(bytes[i] as f64))
            }
            _ => throw!("extract from non-container"),
        }
    }

    /// `box[key] = v`.
    pub fn insert(&mut self, container: &Value, key: &Value, v: Value) -> RtResult<()> {
        match container.obj_type() {
            Some(ObjType::Hash) => {
                if !key.is_scalar() {
                    throw!("container index not scalar");
                }
                self.hash_set(container, key.clone(), v)
            }
            Some(ObjType::Vec) => {
                let len = container.vec_len().unwrap_or(0);
                let i = index_in(key, len, "vector")?;
                container.vec_set(i, v);
                Ok(())
            }
            Some(ObjType::Str) => {
                let byte = byte_of(&v)?;
                let len = container.with_str(|b| b.len()).unwrap_or(0);
                let i = index_in(key, len, "string")?;
                let Some(o) = container.as_obj() else {
                    throw!("insert into non-container");
                };
                let mut body = o.body();
                let Body::Str(s) = &mut *body else {
                    throw!("insert into non-container");
                };
                s.set_byte(i, byte).map_err(RuntimeError::new)
            }
            _ => throw!("insert into non-container"),
        }
    }

    fn slice(&mut self, container: &Value, from: &Value, to: &Value) -> RtResult {
        match container.obj_type() {
            Some(ObjType::Vec) => {
                let items = container.vec_items().unwrap_or_default();
                let part = match slice_bounds(from, to, items.len())? {
                    Some((a, b)) => items[a..=b].to_vec(),
                    None => Vec::new(),
                };
                Ok(self.new_vec(part))
            }
            Some(ObjType::Str) => {
                let bytes = container.str_bytes().unwrap_or_default();
                let part = match slice_bounds(from, to, bytes.len())? {
                    Some((a, b)) => &bytes[a..=b],
                    None => &[][..],
                };
                Ok(self.new_str(part))
            }
            _ => throw!("slice of non-vector"),
        }
    }

    fn concat(&mut self, a: &Value, b: &Value) -> RtResult {
        if a.is_vec() && b.is_vec() {
            let mut items = a.vec_items().unwrap_or_default();
            items.extend(b.vec_items().unwrap_or_default());
            return Ok(self.new_vec(items));
        }
        let mut bytes = stringify(a)?;
        bytes.extend(stringify(b)?);
        Ok(self.new_str(&bytes))
    }

    fn arith(&mut self, op: u16) -> RtResult<()> {
        let b = num_of(&self.peek(0)?)?;
        let a = num_of(&self.peek(1)?)?;
        let v = match op {
            OP_PLUS => Value::Num(a + b),
            OP_MINUS => Value::Num(a - b),
            OP_MUL => Value::Num(a * b),
            OP_DIV => Value::Num(a / b),
            OP_LT => Value::from_bool(a < b),
            OP_LTE => Value::from_bool(a <= b),
            OP_GT => Value::from_bool(a > b),
            _ => Value::from_bool(a >= b),
        };
        self.replace_top(2, v)
    }

    /// Calls the function at stack slot `fidx`; `base` is where its result
    /// lands. Script calls push a frame, natives run to completion.
    fn do_call(&mut self, base: usize, fidx: usize, me: Value, named: bool) -> RtResult<()> {
        let func = self.st.stack[fidx].clone();
        let args: Vec<Value> = self.st.stack[fidx + 1..].to_vec();
        match classify(&func) {
            Callee::Native(imp) => match self.invoke_native(&imp, me, &args) {
                Ok(v) => {
                    self.st.stack.truncate(base);
                    self.push(v)
                }
                Err(err) => {
                    self.st.resume_at = Some(base);
                    Err(err)
                }
            },
            Callee::Script { code, closure } => {
                let locals = self.new_hash();
                if named {
                    self.bind_named(&code, &locals, &args[0], me)?;
                } else {
                    self.bind_args(&code, &locals, &args, me)?;
                }
                self.st.stack.truncate(base);
                self.push_frame(func, code, locals, closure, base)
            }
            Callee::Code(_) => throw!("function/method call on unbound code"),
            Callee::Uncallable => throw!("function/method call on uncallable object"),
        }
    }

    fn call_op(&mut self, argc: usize, method: bool) -> RtResult<()> {
        let len = self.st.stack.len();
        let needed = argc + 1 + method as usize;
        if len < needed {
            throw!("operand stack underflow");
        }
        let fidx = len - argc - 1;
        let (base, me) = if method {
            (fidx - 1, self.st.stack[fidx - 1].clone())
        } else {
            (fidx, Value::Nil)
        };
        self.do_call(base, fidx, me, false)
    }

    fn call_named_op(&mut self, method: bool) -> RtResult<()> {
        let len = self.st.stack.len();
        if len < 2 + method as usize {
            throw!("operand stack underflow");
        }
        let fidx = len - 2;
        let (base, me) = if method {
            (fidx - 1, self.st.stack[fidx - 1].clone())
        } else {
            (fidx, Value::Nil)
        };
        self.do_call(base, fidx, me, true)
    }

    fn iterate(&mut self, values: bool) -> RtResult<()> {
        let container = self.peek(1)?;
        let i = self.peek(0)?.num().unwrap_or(0.0) as usize;
        let Some(len) = container.vec_len() else {
            throw!("foreach enumeration of non-vector");
        };
        if i >= len {
            return self.push(Value::End);
        }
        let n = self.st.stack.len();
        self.st.stack[n - 1] = Value::Num((i + 1) as f64);
        let item = if values {
            container.vec_get(i).unwrap_or_default()
        } else {
            Value::Num(i as f64)
        };
        self.push(item)
    }

    pub(crate) fn run(&mut self) -> RtResult {
        let mut code = self.frame()?.code.clone();
        loop {
            self.st.temps.clear();
            let ip = self.frame()?.ip;
            let Some(&op) = code.bytecode.get(ip) else {
                throw!("instruction pointer out of range");
            };
            let arg = if operand_count(op) > 0 {
                code.bytecode.get(ip + 1).copied().unwrap_or(0)
            } else {
                0
            };
            self.frame_mut()?.ip = ip + 1 + operand_count(op);

            match op {
                OP_NOP => (),
                OP_POP => {
                    self.pop()?;
                }
                OP_DUP => {
                    let v = self.peek(0)?;
                    self.push(v)?;
                }
                OP_DUP2 => {
                    let a = self.peek(1)?;
                    let b = self.peek(0)?;
                    self.push(a)?;
                    self.push(b)?;
                }
                OP_PUSH_CONST => {
                    let v = code.consts[arg as usize].clone();
                    self.push(v)?;
                }
                OP_PUSH_ONE => self.push(Value::Num(1.0))?,
                OP_PUSH_ZERO => self.push(Value::Num(0.0))?,
                OP_PUSH_NIL => self.push(Value::Nil)?,
                OP_NEW_VEC => {
                    let v = self.new_vec(Vec::new());
                    self.push(v)?;
                }
                OP_VAPPEND => {
                    let v = self.peek(0)?;
                    self.peek(1)?.vec_push(v);
                    self.pop()?;
                }
                OP_NEW_HASH => {
                    let v = self.new_hash();
                    self.push(v)?;
                }
                OP_HAPPEND => {
                    let v = self.peek(0)?;
                    let k = self.peek(1)?;
                    let h = self.peek(2)?;
                    self.hash_set(&h, k, v)?;
                    let len = self.st.stack.len();
                    self.st.stack.truncate(len - 2);
                }
                OP_MARK => {
                    if self.st.marks.len() >= self.rt.options.max_marks {
                        throw!("mark stack overflow");
                    }
                    let height = self.st.stack.len();
                    self.st.marks.push(height);
                }
                OP_UNMARK => {
                    self.st.marks.pop();
                }
                OP_BREAK => {
                    if let Some(&height) = self.st.marks.last() {
                        self.st.stack.truncate(height);
                    }
                }
                OP_BREAK2 => {
                    if let Some(height) = self.st.marks.pop() {
                        self.st.stack.truncate(height);
                    }
                }
                OP_NOT => {
                    let v = !truthy(&self.peek(0)?)?;
                    self.replace_top(1, Value::from_bool(v))?;
                }
                OP_NEG => {
                    let n = num_of(&self.peek(0)?)?;
                    self.replace_top(1, Value::Num(-n))?;
                }
                OP_PLUS | OP_MINUS | OP_MUL | OP_DIV | OP_LT | OP_LTE | OP_GT | OP_GTE => {
                    self.arith(op)?;
                }
                OP_CAT => {
                    let b = self.peek(0)?;
                    let a = self.peek(1)?;
                    let v = self.concat(&a, &b)?;
                    self.replace_top(2, v)?;
                }
                OP_EQ | OP_NEQ => {
                    let eq = values_equal(&self.peek(1)?, &self.peek(0)?);
                    self.replace_top(2, Value::from_bool(eq == (op == OP_EQ)))?;
                }
                OP_JMP => self.frame_mut()?.ip = arg as usize,
                OP_JMP_LOOP => {
                    self.frame_mut()?.ip = arg as usize;
                    self.safepoint();
                }
                OP_JIF_NOT_POP => {
                    let v = self.pop()?;
                    if !truthy(&v)? {
                        self.frame_mut()?.ip = arg as usize;
                    }
                }
                OP_JIF_END => {
                    if self.peek(0)?.is_end() {
                        self.pop()?;
                        self.frame_mut()?.ip = arg as usize;
                    }
                }
                OP_JIF_TRUE => {
                    if truthy(&self.peek(0)?)? {
                        self.frame_mut()?.ip = arg as usize;
                    }
                }
                OP_JIF_NOT => {
                    if !truthy(&self.peek(0)?)? {
                        self.frame_mut()?.ip = arg as usize;
                    }
                }
                OP_FCALL | OP_MCALL => {
                    self.call_op(arg as usize, op == OP_MCALL)?;
                    code = self.frame()?.code.clone();
                }
                OP_FCALLH | OP_MCALLH => {
                    self.call_named_op(op == OP_MCALLH)?;
                    code = self.frame()?.code.clone();
                }
                OP_RETURN => {
                    let v = self.pop()?;
                    let Some(frame) = self.st.frames.pop() else {
                        throw!("no active frame");
                    };
                    self.st.stack.truncate(frame.bp);
                    self.st.marks.truncate(frame.mark_base);
                    if self.st.frames.is_empty() {
                        return Ok(v);
                    }
                    self.push(v)?;
                    code = self.frame()?.code.clone();
                }
                OP_LOCAL => {
                    let idx = arg as usize;
                    let v = self.lookup_sym(&code.consts[idx], code.const_hashes[idx])?;
                    self.push(v)?;
                }
                OP_SET_SYM | OP_SET_LOCAL => {
                    let idx = arg as usize;
                    let v = self.peek(0)?;
                    if op == OP_SET_SYM {
                        self.set_sym(&code.consts[idx], code.const_hashes[idx], v)?;
                    } else {
                        let locals = self.frame()?.locals.clone();
                        self.hash_set_hashed(&locals, code.consts[idx].clone(), code.const_hashes[idx], true, v)?;
                    }
                }
                OP_MEMBER => {
                    let idx = arg as usize;
                    let obj = self.peek(0)?;
                    let sym = &code.consts[idx];
                    match self.member_hashed(&obj, sym, code.const_hashes[idx], true)? {
                        Some(v) => self.replace_top(1, v)?,
                        None => {
                            let name = sym.to_str_lossy().unwrap_or_default();
                            throw!("no such member: {}", name);
                        }
                    }
                }
                OP_SET_MEMBER => {
                    let idx = arg as usize;
                    let v = self.peek(0)?;
                    let obj = self.peek(1)?;
                    self.set_member_hashed(&obj, &code.consts[idx], code.const_hashes[idx], true, v.clone())?;
                    self.replace_top(2, v)?;
                }
                OP_EXTRACT => {
                    let v = self.extract(&self.peek(1)?, &self.peek(0)?)?;
                    self.replace_top(2, v)?;
                }
                OP_INSERT => {
                    let v = self.peek(0)?;
                    let key = self.peek(1)?;
                    let container = self.peek(2)?;
                    self.insert(&container, &key, v.clone())?;
                    self.replace_top(3, v)?;
                }
                OP_SLICE => {
                    let to = self.peek(0)?;
                    let from = self.peek(1)?;
                    let container = self.peek(2)?;
                    let v = self.slice(&container, &from, &to)?;
                    self.replace_top(3, v)?;
                }
                OP_FUNC => {
                    let target = code.consts[arg as usize].clone();
                    let (locals, next) = {
                        let frame = self.frame()?;
                        (frame.locals.clone(), frame.closure.clone())
                    };
                    let closure = self.new_closure(locals, next);
                    let f = self.new_func(target, closure);
                    self.push(f)?;
                }
                OP_EACH | OP_INDEX => self.iterate(op == OP_EACH)?,
                _ => throw!("invalid opcode {:#x}", op),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    #[test]
    fn coercions() {
        let rt = Runtime::new();
        let mut cx = rt.new_context();
        cx.with(|ctx| {
            let ten = ctx.new_str(b"10");
            let word = ctx.new_str(b"abc");
            let empty = ctx.new_str(b"");
            let zero = ctx.new_str(b"0.0");
            assert_eq!(num_of(&ten).unwrap(), 10.0);
            assert_eq!(
                num_of(&word).unwrap_err().message,
                "non-numeric string in numeric context"
            );
            assert_eq!(
                num_of(&Value::Nil).unwrap_err().message,
                "nil used in numeric context"
            );
            let v = ctx.new_vec(vec![]);
            assert_eq!(
                num_of(&v).unwrap_err().message,
                "non-scalar in numeric context"
            );
            assert!(truthy(&word).unwrap());
            assert!(!truthy(&empty).unwrap());
            assert!(!truthy(&zero).unwrap());
            assert!(truthy(&v).is_err());
            assert!(values_equal(&ten, &Value::Num(10.0)));
            assert!(!values_equal(&word, &Value::Num(0.0)));
        });
    }

    #[test]
    fn parents_chain_and_cycle() {
        let rt = Runtime::new();
        let mut cx = rt.new_context();
        cx.with(|ctx| {
            let base = ctx.new_hash();
            let one = Value::Num(1.0);
            ctx.member_set(&base, "x", one).unwrap();
            let obj = ctx.new_hash();
            let parents = ctx.new_vec(vec![base.clone()]);
            ctx.member_set(&obj, "parents", parents).unwrap();
            assert_eq!(ctx.member_get(&obj, "x").unwrap().and_then(|v| v.num()), Some(1.0));
            assert!(ctx.member_get(&obj, "y").unwrap().is_none());

            // a.parents = [a] terminates.
            let a = ctx.new_hash();
            let own = ctx.new_vec(vec![a.clone()]);
            ctx.member_set(&a, "parents", own).unwrap();
            assert!(ctx.member_get(&a, "missing").unwrap().is_none());

            let bad = ctx.new_hash();
            ctx.member_set(&bad, "parents", Value::Num(3.0)).unwrap();
            let err = ctx.member_get(&bad, "x").unwrap_err();
            assert_eq!(err.message, "parents field not vector");
        });
    }

    #[test]
    fn containers() {
        let rt = Runtime::new();
        let mut cx = rt.new_context();
        cx.with(|ctx| {
            let v = ctx.new_vec(vec![Value::Num(1.0), Value::Num(2.0), Value::Num(3.0)]);
            assert_eq!(ctx.extract(&v, &Value::Num(-1.0)).unwrap().num(), Some(3.0));
            assert!(ctx.extract(&v, &Value::Num(3.0)).is_err());
            let h = ctx.new_hash();
            assert!(ctx.extract(&h, &Value::Num(1.0)).unwrap().is_nil());
            let err = ctx.extract(&h, &v).unwrap_err();
            assert_eq!(err.message, "container index not scalar");
            let s = ctx.slice(&v, &Value::Num(1.0), &Value::Nil).unwrap();
            assert_eq!(s.vec_len(), Some(2));
        });
    }
}
