//! Execution contexts.
//!
//! A [`Context`] is the host's handle on one logical call stack. Script code
//! and natives see the same context as a [`Ctx`], which holds the lock on
//! the context state for as long as the thread runs inside it. Every place
//! that may block on the collector releases that lock first.
//!
//! Lock order: global heap lock, then context state, then object payloads.
//! A thread holding a context state never takes the heap lock.
use std::{
    any::Any,
    sync::{Arc, Weak},
};

use parking_lot::{Mutex, MutexGuard};

use crate::{
    error::{CompileError, RtResult, RuntimeError, TraceFrame},
    runtime::{
        hashtable::{hash_key, HashRec},
        object::{
            Body, ClosureObj, CodeObj, FuncObj, Gc, GhostObj, GhostType, NativeFn,
            NativeFnWithData, NativeImpl, NativeObj, ObjType, NUM_TYPES,
        },
        string::StrObj,
        value::Value,
        Runtime,
    },
    throw,
};

/// One active script-level call.
pub(crate) struct Frame {
    pub(crate) func: Value,
    pub(crate) code: Arc<CodeObj>,
    pub(crate) ip: usize,
    pub(crate) locals: Value,
    pub(crate) closure: Value,
    /// Operand stack height at call time, below the callee.
    pub(crate) bp: usize,
    pub(crate) mark_base: usize,
}

pub(crate) struct ContextState {
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<Frame>,
    pub(crate) marks: Vec<usize>,
    pub(crate) temps: Vec<Value>,
    pub(crate) error: Option<RuntimeError>,
    /// Operand stack height to resume at after a failed native call.
    pub(crate) resume_at: Option<usize>,
    cache: Vec<Vec<Gc>>,
    pub(crate) child: Option<Arc<ContextCell>>,
    pub(crate) parent: Option<Weak<ContextCell>>,
    pub(crate) nesting: usize,
}

impl ContextState {
    fn new() -> Self {
        Self {
            stack: Vec::new(),
            frames: Vec::new(),
            marks: Vec::new(),
            temps: Vec::new(),
            error: None,
            resume_at: None,
            cache: (0..NUM_TYPES).map(|_| Vec::new()).collect(),
            child: None,
            parent: None,
            nesting: 0,
        }
    }

    /// Drops cached free cells; the next sweep puts them back in the pools.
    pub(crate) fn release_cache(&mut self) {
        for cache in &mut self.cache {
            cache.clear();
        }
    }

    pub(crate) fn trace(&self, out: &mut Vec<Value>) {
        out.extend(self.stack.iter().cloned());
        out.extend(self.temps.iter().cloned());
        for frame in &self.frames {
            out.push(frame.func.clone());
            out.push(frame.locals.clone());
            out.push(frame.closure.clone());
        }
        if let Some(err) = &self.error {
            out.push(err.value.clone());
        }
    }

    pub(crate) fn clear_stacks(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.marks.clear();
        self.resume_at = None;
    }

    /// Clears everything and detaches the sub-context, which is returned so
    /// the caller can free it too.
    pub(crate) fn reset(&mut self) -> Option<Arc<ContextCell>> {
        self.clear_stacks();
        self.temps.clear();
        self.error = None;
        self.release_cache();
        self.parent = None;
        self.nesting = 0;
        self.child.take()
    }

    pub(crate) fn trace_frames(&self) -> Vec<TraceFrame> {
        self.frames
            .iter()
            .rev()
            .map(|f| TraceFrame {
                file: f.code.file.clone(),
                line: f.code.line_at(f.ip.saturating_sub(1)),
            })
            .collect()
    }
}

pub struct ContextCell {
    pub(crate) state: Mutex<ContextState>,
}

impl ContextCell {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(ContextState::new()),
        }
    }
}

/// Keeps the calling thread registered with the runtime.
struct Registration<'a>(&'a Runtime);

impl<'a> Registration<'a> {
    fn new(rt: &'a Runtime) -> Self {
        rt.mod_lock();
        Self(rt)
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.0.mod_unlock();
    }
}

/// Host handle on an execution context. Returned to the runtime's free list
/// when dropped.
pub struct Context {
    rt: Arc<Runtime>,
    cell: Arc<ContextCell>,
}

impl Context {
    pub(crate) fn new(rt: Arc<Runtime>, cell: Arc<ContextCell>) -> Self {
        Self { rt, cell }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.rt
    }

    /// Enters the runtime and runs `f` with this context.
    pub fn with<R>(&mut self, f: impl FnOnce(&mut Ctx<'_>) -> R) -> R {
        let _registered = Registration::new(&self.rt);
        let mut cx = Ctx::new(&self.rt, &self.cell);
        f(&mut cx)
    }

    /// Calls `func` with `args`, receiver `me` and the locals namespace
    /// `locals` (a fresh one when nil).
    pub fn call(&mut self, func: &Value, args: &[Value], me: Value, locals: Value) -> RtResult {
        self.with(|cx| cx.call_value(func, args, me, locals))
    }

    /// Resumes after an error raised by a native call; `resume` becomes the
    /// result of that call.
    pub fn continue_call(&mut self, resume: Value) -> RtResult {
        self.with(|cx| cx.resume(resume))
    }

    pub fn compile(&mut self, src: &[u8], file: &str, first_line: u32) -> Result<Value, CompileError> {
        self.with(|cx| cx.compile(src, file, first_line))
    }

    pub fn stack_depth(&self) -> usize {
        self.cell.state.lock().frames.len()
    }

    /// Source line of frame `level`, 0 being the innermost.
    pub fn frame_line(&self, level: usize) -> Option<u32> {
        let st = self.cell.state.lock();
        frame_at(&st, level).map(|f| f.code.line_at(f.ip.saturating_sub(1)))
    }

    pub fn frame_file(&self, level: usize) -> Option<String> {
        let st = self.cell.state.lock();
        frame_at(&st, level).map(|f| f.code.file.clone())
    }

    pub fn error(&self) -> Option<RuntimeError> {
        self.cell.state.lock().error.clone()
    }

    pub fn die_value(&self) -> Value {
        self.cell
            .state
            .lock()
            .error
            .as_ref()
            .map(|e| e.value.clone())
            .unwrap_or_default()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.rt.free_context(&self.cell);
    }
}

fn frame_at(st: &ContextState, level: usize) -> Option<&Frame> {
    st.frames.len().checked_sub(level + 1).map(|i| &st.frames[i])
}

/// A child context created by a native for nested or resumable calls. It
/// belongs to its parent and is freed with it.
pub struct SubContext {
    cell: Arc<ContextCell>,
}

impl SubContext {
    pub fn error(&self) -> Option<RuntimeError> {
        self.cell.state.lock().error.clone()
    }

    pub fn stack_depth(&self) -> usize {
        self.cell.state.lock().frames.len()
    }
}

/// A context entered by the current thread.
pub struct Ctx<'a> {
    pub(crate) rt: &'a Runtime,
    pub(crate) cell: &'a Arc<ContextCell>,
    pub(crate) st: MutexGuard<'a, ContextState>,
}

impl<'a> Ctx<'a> {
    pub(crate) fn new(rt: &'a Runtime, cell: &'a Arc<ContextCell>) -> Self {
        Ctx {
            rt,
            cell,
            st: cell.state.lock(),
        }
    }

    pub fn runtime(&self) -> &'a Runtime {
        self.rt
    }

    /// Runs `f` with the context state unlocked. Everything the caller
    /// still needs must be rooted.
    pub(crate) fn outside<R>(&mut self, f: impl FnOnce(&Runtime) -> R) -> R {
        let rt = self.rt;
        MutexGuard::unlocked(&mut self.st, || f(rt))
    }

    #[inline]
    pub(crate) fn safepoint(&mut self) {
        if self.rt.bottleneck_pending() {
            self.outside(|rt| rt.check_bottleneck());
        }
    }

    /// Leaves the runtime while `f` runs, so that blocking host code does
    /// not hold up collections. `f` must not touch script values.
    pub fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        let rt = self.rt;
        MutexGuard::unlocked(&mut self.st, || {
            rt.mod_unlock();
            let r = f();
            rt.mod_lock();
            r
        })
    }

    /// Keeps `v` alive until the next instruction starts.
    pub fn temp_save(&mut self, v: Value) {
        self.st.temps.push(v);
    }

    pub fn clear_temps(&mut self) {
        self.st.temps.clear();
    }

    /// Collects now, waiting for every other registered thread.
    pub fn collect(&mut self) {
        self.outside(|rt| rt.collect_now());
    }

    pub(crate) fn alloc(&mut self, ty: ObjType, body: Body) -> Value {
        let cell = match self.st.cache[ty as usize].pop() {
            Some(cell) => cell,
            None => self.refill(ty, &body),
        };
        cell.install(ty, body);
        let v = Value::Obj(cell);
        self.st.temps.push(v.clone());
        v
    }

    fn refill(&mut self, ty: ObjType, pending: &Body) -> Gc {
        let base = self.st.temps.len();
        pending.trace(&mut self.st.temps);
        let batch = self.rt.options.alloc_batch;
        loop {
            let mut cells = self.outside(|rt| rt.get_cells(ty, batch));
            if let Some(cell) = cells.pop() {
                self.st.temps.truncate(base);
                self.st.cache[ty as usize].extend(cells);
                return cell;
            }
        }
    }

    pub fn new_str(&mut self, bytes: &[u8]) -> Value {
        self.alloc(ObjType::Str, Body::Str(StrObj::from_bytes(bytes)))
    }

    pub fn new_string(&mut self, s: &str) -> Value {
        self.new_str(s.as_bytes())
    }

    pub fn intern(&mut self, name: &[u8]) -> Value {
        self.outside(|rt| rt.intern(name))
    }

    pub fn new_vec(&mut self, items: Vec<Value>) -> Value {
        self.alloc(ObjType::Vec, Body::Vec(items))
    }

    pub fn new_hash(&mut self) -> Value {
        self.alloc(ObjType::Hash, Body::Hash(Default::default()))
    }

    pub(crate) fn new_code(&mut self, code: CodeObj) -> Value {
        self.alloc(ObjType::Code, Body::Code(Arc::new(code)))
    }

    pub(crate) fn new_closure(&mut self, ns: Value, next: Value) -> Value {
        self.alloc(ObjType::Closure, Body::Closure(ClosureObj { ns, next }))
    }

    pub(crate) fn new_func(&mut self, code: Value, closure: Value) -> Value {
        self.alloc(ObjType::Func, Body::Func(FuncObj { code, closure }))
    }

    /// Wraps a host function as a callable value.
    pub fn new_native(&mut self, name: &'static str, f: NativeFn) -> Value {
        let native = self.alloc(
            ObjType::Native,
            Body::Native(NativeObj {
                imp: NativeImpl::Plain(f),
                name,
            }),
        );
        self.new_func(native, Value::Nil)
    }

    /// Like [`Ctx::new_native`], passing `data` to every invocation;
    /// `destroy` runs on it when the function is collected.
    pub fn new_native_with_data(
        &mut self,
        name: &'static str,
        f: NativeFnWithData,
        data: Arc<dyn Any + Send + Sync>,
        destroy: Option<fn(&(dyn Any + Send + Sync))>,
    ) -> Value {
        let native = self.alloc(
            ObjType::Native,
            Body::Native(NativeObj {
                imp: NativeImpl::WithData { f, data, destroy },
                name,
            }),
        );
        self.new_func(native, Value::Nil)
    }

    pub fn new_ghost(&mut self, ty: &'static GhostType, data: Box<dyn Any + Send>) -> Value {
        self.alloc(
            ObjType::Ghost,
            Body::Ghost(GhostObj {
                ty,
                data: Some(data),
            }),
        )
    }

    /// Binds compiled code to a closure over `ns`.
    pub fn bind_function(&mut self, code: &Value, ns: &Value) -> RtResult {
        if !code.is_code() {
            throw!("bind_function: not compiled code");
        }
        if !ns.is_hash() {
            throw!("bind_function: namespace is not a hash");
        }
        let closure = self.new_closure(ns.clone(), Value::Nil);
        Ok(self.new_func(code.clone(), closure))
    }

    /// Binds compiled code to the lexical scope of the innermost running
    /// frame, or to a fresh namespace outside any call.
    pub fn bind_to_caller(&mut self, code: &Value) -> RtResult {
        if !code.is_code() {
            throw!("bind_to_caller: not compiled code");
        }
        let scope = self
            .st
            .frames
            .last()
            .map(|f| (f.locals.clone(), f.closure.clone()));
        let (ns, next) = match scope {
            Some(scope) => scope,
            None => (self.new_hash(), Value::Nil),
        };
        let closure = self.new_closure(ns, next);
        Ok(self.new_func(code.clone(), closure))
    }

    pub fn hash_set(&mut self, h: &Value, key: Value, val: Value) -> RtResult<()> {
        let (hash, interned) = hash_key(&key);
        self.hash_set_hashed(h, key, hash, interned, val)
    }

    pub(crate) fn hash_set_hashed(
        &mut self,
        h: &Value,
        key: Value,
        hash: u32,
        interned: bool,
        val: Value,
    ) -> RtResult<()> {
        let retired = match h.as_obj().filter(|o| o.ty() == ObjType::Hash) {
            Some(o) => match &mut *o.body() {
                Body::Hash(t) => t.set_hashed(key, hash, interned, val),
                _ => None,
            },
            None => throw!("insert into non-hash"),
        };
        if let Some(block) = retired {
            self.retire(block);
        }
        Ok(())
    }

    pub fn hash_delete(&mut self, h: &Value, key: &Value) -> RtResult<Option<Value>> {
        let (old, retired) = match h.as_obj().filter(|o| o.ty() == ObjType::Hash) {
            Some(o) => match &mut *o.body() {
                Body::Hash(t) => t.delete(key),
                _ => (None, None),
            },
            None => throw!("delete from non-hash"),
        };
        if let Some(block) = retired {
            self.retire(block);
        }
        Ok(old)
    }

    fn retire(&mut self, block: Box<HashRec>) {
        if self.rt.retire(block) {
            self.outside(|rt| rt.drain_now());
        }
    }

    /// Adds `name = value` to a namespace, interning the name.
    pub fn add_sym(&mut self, ns: &Value, name: &str, value: Value) -> RtResult<()> {
        let sym = self.intern(name.as_bytes());
        self.hash_set(ns, sym, value)
    }

    /// Registers a table of natives in an existing namespace.
    pub fn gen_lib(&mut self, ns: &Value, funcs: &[(&'static str, NativeFn)]) -> RtResult<()> {
        for &(name, f) in funcs {
            let func = self.new_native(name, f);
            self.add_sym(ns, name, func)?;
        }
        Ok(())
    }

    /// Registers a table of natives in a fresh namespace.
    pub fn new_lib(&mut self, funcs: &[(&'static str, NativeFn)]) -> RtResult {
        let ns = self.new_hash();
        self.gen_lib(&ns, funcs)?;
        Ok(ns)
    }

    /// Creates a sub-context linked under this one, replacing any previous
    /// child.
    pub fn sub_context(&mut self) -> RtResult<SubContext> {
        if self.st.nesting >= self.rt.options.max_nesting {
            throw!("call nesting too deep");
        }
        self.free_child();
        let cell = self.outside(|rt| rt.new_context_cell());
        {
            let mut child = cell.state.lock();
            child.parent = Some(Arc::downgrade(self.cell));
            child.nesting = self.st.nesting + 1;
        }
        self.st.child = Some(cell.clone());
        Ok(SubContext { cell })
    }

    pub(crate) fn free_child(&mut self) {
        if let Some(child) = self.st.child.take() {
            self.outside(|rt| rt.free_context(&child));
        }
    }

    fn check_child(&self, sub: &SubContext) -> RtResult<()> {
        match &self.st.child {
            Some(child) if Arc::ptr_eq(child, &sub.cell) => Ok(()),
            _ => throw!("sub-context does not belong to this context"),
        }
    }

    /// Calls `func` on a sub-context. An error is returned as is; the
    /// sub-context stays resumable through [`Ctx::continue_sub`].
    pub fn call_sub(
        &mut self,
        sub: &SubContext,
        func: &Value,
        args: &[Value],
        me: Value,
        locals: Value,
    ) -> RtResult {
        self.check_child(sub)?;
        let rt = self.rt;
        let cell = sub.cell.clone();
        MutexGuard::unlocked(&mut self.st, || {
            Ctx::new(rt, &cell).call_value(func, args, me, locals)
        })
    }

    pub fn continue_sub(&mut self, sub: &SubContext, resume: Value) -> RtResult {
        self.check_child(sub)?;
        let rt = self.rt;
        let cell = sub.cell.clone();
        MutexGuard::unlocked(&mut self.st, || Ctx::new(rt, &cell).resume(resume))
    }

    /// Nested call from a native. Runs on a temporary sub-context; an error
    /// is copied into this context and returned for the native to propagate.
    pub fn call(&mut self, func: &Value, args: &[Value], me: Value) -> RtResult {
        let sub = self.sub_context()?;
        let result = self.call_sub(&sub, func, args, me, Value::Nil);
        self.free_child();
        result.map_err(|e| self.rethrow(e))
    }

    /// Records an error raised in a sub-context as this context's error.
    pub fn rethrow(&mut self, err: RuntimeError) -> RuntimeError {
        self.st.error = Some(err.clone());
        err
    }

    pub fn stack_depth(&self) -> usize {
        self.st.frames.len()
    }

    /// True while running on a sub-context created by a native.
    pub fn is_sub_context(&self) -> bool {
        self.st.parent.is_some()
    }

    pub fn frame_line(&self, level: usize) -> Option<u32> {
        frame_at(&self.st, level).map(|f| f.code.line_at(f.ip.saturating_sub(1)))
    }

    pub fn frame_file(&self, level: usize) -> Option<String> {
        frame_at(&self.st, level).map(|f| f.code.file.clone())
    }

    pub fn error(&self) -> Option<&RuntimeError> {
        self.st.error.as_ref()
    }

    pub fn die_value(&self) -> Value {
        self.st
            .error
            .as_ref()
            .map(|e| e.value.clone())
            .unwrap_or_default()
    }

    /// Locals namespace of frame `level`.
    pub fn frame_locals(&self, level: usize) -> Option<Value> {
        frame_at(&self.st, level).map(|f| f.locals.clone())
    }

    pub fn frame_func(&self, level: usize) -> Option<Value> {
        frame_at(&self.st, level).map(|f| f.func.clone())
    }
}
