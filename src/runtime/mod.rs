//! The runtime handle shared by every context.
//!
//! A [`Runtime`] owns the allocation pools, the interned-symbol table, the
//! pinned roots and the context lists. All of that lives in [`Heap`] behind
//! the global lock; collection coordination lives in `vm::safepoint` and the
//! collector itself in `gc`.
use std::{
    any::Any,
    collections::HashMap,
    sync::{atomic::AtomicBool, Arc},
};

use parking_lot::Mutex;

use crate::{
    gc::{pool::Pool, GcStats},
    vm::{
        context::{Context, ContextCell},
        options::RuntimeOptions,
        sync::semaphore::Semaphore,
    },
};

use self::{
    object::{Body, Gc, ObjType},
    string::StrObj,
    value::Value,
};

pub mod hashtable;
pub mod libraries;
pub mod object;
pub mod string;
pub mod value;

/// Handle returned by [`Runtime::gc_save`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SaveKey(usize);

pub(crate) struct Heap {
    pub(crate) pools: Vec<Pool>,
    pub(crate) symbols: HashMap<Vec<u8>, Gc>,
    pub(crate) roots: Vec<Value>,
    pub(crate) saved: Vec<Option<Value>>,
    pub(crate) saved_free: Vec<usize>,
    pub(crate) contexts: Vec<Arc<ContextCell>>,
    pub(crate) free_contexts: Vec<Arc<ContextCell>>,
    pub(crate) n_threads: usize,
    pub(crate) wait_count: usize,
    pub(crate) bottleneck: bool,
    pub(crate) need_gc: bool,
    pub(crate) stats: GcStats,
}

impl Heap {
    fn new(options: &RuntimeOptions) -> Self {
        Self {
            pools: ObjType::ALL
                .iter()
                .map(|&ty| Pool::new(ty, options.pool_block))
                .collect(),
            symbols: HashMap::new(),
            roots: Vec::new(),
            saved: Vec::new(),
            saved_free: Vec::new(),
            contexts: Vec::new(),
            free_contexts: Vec::new(),
            n_threads: 0,
            wait_count: 0,
            bottleneck: false,
            need_gc: false,
            stats: GcStats::default(),
        }
    }

    pub(crate) fn intern(&mut self, name: &[u8]) -> Value {
        if let Some(sym) = self.symbols.get(name) {
            return Value::Obj(sym.clone());
        }
        let cell = self.pools[ObjType::Str as usize].take_or_grow();
        cell.install(ObjType::Str, Body::Str(StrObj::interned(name)));
        self.symbols.insert(name.to_vec(), cell.clone());
        Value::Obj(cell)
    }
}

pub struct Runtime {
    pub(crate) options: RuntimeOptions,
    pub(crate) heap: Mutex<Heap>,
    /// Backing buffers retired by hash-table rebuilds.
    pub(crate) dead: Mutex<Vec<Box<dyn Any + Send>>>,
    pub(crate) sem: Semaphore,
    /// Mirrors `Heap::bottleneck` for lock-free safepoint polls.
    pub(crate) pending: AtomicBool,
    pub(crate) sym_me: Value,
    pub(crate) sym_arg: Value,
    pub(crate) sym_parents: Value,
}

impl Runtime {
    pub fn new() -> Arc<Runtime> {
        Self::with_options(RuntimeOptions::from_env())
    }

    pub fn with_options(options: RuntimeOptions) -> Arc<Runtime> {
        let mut heap = Heap::new(&options);
        let sym_me = heap.intern(b"me");
        let sym_arg = heap.intern(b"arg");
        let sym_parents = heap.intern(b"parents");
        log::debug!(
            target: "gc",
            "runtime created: {} cells per block, batch {}",
            options.pool_block,
            options.alloc_batch
        );
        Arc::new(Runtime {
            options,
            heap: Mutex::new(heap),
            dead: Mutex::new(Vec::new()),
            sem: Semaphore::new(0),
            pending: AtomicBool::new(false),
            sym_me,
            sym_arg,
            sym_parents,
        })
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    /// Takes a context from the free list or creates one.
    pub fn new_context(self: &Arc<Self>) -> Context {
        Context::new(self.clone(), self.new_context_cell())
    }

    pub(crate) fn new_context_cell(&self) -> Arc<ContextCell> {
        let mut heap = self.heap.lock();
        match heap.free_contexts.pop() {
            Some(cell) => cell,
            None => {
                let cell = Arc::new(ContextCell::new());
                heap.contexts.push(cell.clone());
                cell
            }
        }
    }

    /// Resets a context and its sub-context chain and returns them to the
    /// free list. Must not be called while holding a context lock.
    pub(crate) fn free_context(&self, cell: &Arc<ContextCell>) {
        let mut heap = self.heap.lock();
        let mut next = Some(cell.clone());
        while let Some(cell) = next.take() {
            next = cell.state.lock().reset();
            if !heap.free_contexts.iter().any(|c| Arc::ptr_eq(c, &cell)) {
                heap.free_contexts.push(cell);
            }
        }
    }

    /// Returns the unique string object for `name`.
    pub fn intern(&self, name: &[u8]) -> Value {
        self.heap.lock().intern(name)
    }

    /// Pins `v` for the lifetime of the runtime.
    pub fn save(&self, v: Value) {
        self.heap.lock().roots.push(v);
    }

    /// Pins `v` until [`Runtime::gc_release`] is called with the returned key.
    pub fn gc_save(&self, v: Value) -> SaveKey {
        let mut heap = self.heap.lock();
        match heap.saved_free.pop() {
            Some(slot) => {
                heap.saved[slot] = Some(v);
                SaveKey(slot)
            }
            None => {
                heap.saved.push(Some(v));
                SaveKey(heap.saved.len() - 1)
            }
        }
    }

    pub fn gc_release(&self, key: SaveKey) {
        let mut heap = self.heap.lock();
        if let Some(slot) = heap.saved.get_mut(key.0) {
            if slot.take().is_some() {
                heap.saved_free.push(key.0);
            }
        }
    }

    /// Queues a retired buffer for release at the next bottleneck. Returns
    /// true once the queue has reached its capacity and must be drained.
    pub(crate) fn retire(&self, block: Box<dyn Any + Send>) -> bool {
        let mut dead = self.dead.lock();
        dead.push(block);
        dead.len() >= self.options.dead_blocks
    }

    /// Runs a full collection. Called from a thread already inside the
    /// runtime (a native, say), the collection is only requested and runs
    /// once that thread reaches a safepoint or leaves.
    pub fn collect(&self) {
        if self.entered() > 0 {
            self.request(&mut self.heap.lock(), true);
            return;
        }
        self.mod_lock();
        self.collect_now();
        self.mod_unlock();
    }

    /// Requests a collection and waits for it. The caller must be
    /// registered through `mod_lock` and hold no context lock.
    pub(crate) fn collect_now(&self) {
        let parks = self.may_park();
        let mut heap = self.heap.lock();
        if parks {
            heap.need_gc = true;
            self.bottleneck(&mut heap);
        } else {
            self.request(&mut heap, true);
        }
    }

    pub fn stats(&self) -> GcStats {
        let heap = self.heap.lock();
        let mut stats = heap.stats;
        stats.total_cells = heap.pools.iter().map(Pool::total).sum();
        stats.free_cells = heap.pools.iter().map(Pool::free_count).sum();
        stats
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let heap = self.heap.get_mut();
        for cell in heap.contexts.drain(..) {
            cell.state.lock().reset();
        }
        heap.free_contexts.clear();
        heap.symbols.clear();
        heap.roots.clear();
        heap.saved.clear();
        for pool in &mut heap.pools {
            pool.clear();
        }
        self.dead.get_mut().clear();
    }
}
