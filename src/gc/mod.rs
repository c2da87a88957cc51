//! Mark/sweep collector.
//!
//! Collection only ever runs inside the bottleneck, on the last thread to
//! arrive, with the global lock held. Marking walks every context (frames,
//! operand stack, temporaries, error slot), the pinned roots and the symbol
//! table with an explicit worklist. Sweeping is delegated to the pools.
use std::time::Instant;

use crate::runtime::{
    object::{Body, Gc, ObjType},
    value::Value,
    Heap, Runtime,
};

pub mod pool;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GcStats {
    pub collections: usize,
    pub reclaimed: usize,
    pub live: usize,
    pub total_cells: usize,
    pub free_cells: usize,
    pub dead_blocks_freed: usize,
}

/// Type-specific cleanup for a reclaimed payload.
fn cleanup(body: Body) {
    match body {
        Body::Ghost(ghost) => {
            if let (Some(destroy), Some(data)) = (ghost.ty.destroy, ghost.data) {
                destroy(data);
            }
        }
        Body::Native(native) => {
            if let crate::runtime::object::NativeImpl::WithData {
                data,
                destroy: Some(destroy),
                ..
            } = &native.imp
            {
                destroy(&**data);
            }
        }
        // Buffers of strings, vectors, hashes and code are released on drop.
        other => drop(other),
    }
}

fn mark(mut work: Vec<Value>) -> usize {
    let mut marked = 0;
    while let Some(v) = work.pop() {
        let Value::Obj(o) = v else { continue };
        if o.ty() == ObjType::Freed {
            debug_assert!(false, "reachable object was reclaimed: {:?}", o);
            continue;
        }
        if o.mark() {
            continue;
        }
        marked += 1;
        o.body().trace(&mut work);
    }
    marked
}

impl Runtime {
    pub(crate) fn garbage_collect(&self, heap: &mut Heap) {
        let start = Instant::now();
        let mut work = Vec::new();

        for cell in &heap.contexts {
            let mut st = cell.state.lock();
            st.release_cache();
            st.trace(&mut work);
        }
        work.extend(heap.roots.iter().cloned());
        work.extend(heap.saved.iter().flatten().cloned());
        work.extend(heap.symbols.values().map(|s| Value::Obj(s.clone())));
        work.push(self.sym_me.clone());
        work.push(self.sym_arg.clone());
        work.push(self.sym_parents.clone());

        let marked = mark(work);

        let mut reclaimed = 0;
        let mut live = 0;
        for pool in &mut heap.pools {
            let stats = pool.reap(&mut cleanup);
            reclaimed += stats.reclaimed;
            live += stats.live;
        }
        debug_assert_eq!(marked, live, "mark and sweep disagree");

        heap.need_gc = false;
        heap.stats.collections += 1;
        heap.stats.reclaimed += reclaimed;
        heap.stats.live = live;
        log::debug!(
            target: "gc",
            "collection #{}: {} live, {} reclaimed in {:.3}ms",
            heap.stats.collections,
            live,
            reclaimed,
            start.elapsed().as_secs_f64() * 1000.0
        );
    }

    /// Hands out up to `n` free cells of type `ty`, collecting once and then
    /// growing the pool when it has run dry. The caller must be registered
    /// and hold no lock on its own context. A thread nested inside another
    /// context grows the pool right away and leaves the collection for later.
    pub(crate) fn get_cells(&self, ty: ObjType, n: usize) -> Vec<Gc> {
        let parks = self.may_park();
        let mut heap = self.heap.lock();
        let mut collected = !parks;
        loop {
            if heap.bottleneck && parks {
                self.bottleneck(&mut heap);
                continue;
            }
            let cells = heap.pools[ty as usize].take(n);
            if !cells.is_empty() {
                return cells;
            }
            if collected {
                heap.need_gc |= !parks;
                let pool = &mut heap.pools[ty as usize];
                let first = pool.take_or_grow();
                let mut cells = pool.take(n.saturating_sub(1));
                cells.push(first);
                return cells;
            }
            log::trace!(target: "gc", "{} pool exhausted", ty.name());
            heap.need_gc = true;
            self.bottleneck(&mut heap);
            collected = true;
        }
    }

    /// Releases retired buffers. Only called inside the bottleneck.
    pub(crate) fn free_dead(&self, heap: &mut Heap) {
        let dead = std::mem::take(&mut *self.dead.lock());
        if !dead.is_empty() {
            log::trace!(target: "gc", "releasing {} dead blocks", dead.len());
            heap.stats.dead_blocks_freed += dead.len();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        any::Any,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Weak,
        },
    };

    use crate::{
        error::RtResult,
        runtime::{
            object::GhostType,
            value::Value,
            Runtime,
        },
        vm::{context::Ctx, options::RuntimeOptions},
    };

    static DESTROYED: AtomicUsize = AtomicUsize::new(0);

    static COUNTED: GhostType = GhostType {
        name: "counted",
        destroy: Some(|_| {
            DESTROYED.fetch_add(1, Ordering::SeqCst);
        }),
        get_member: None,
        set_member: None,
    };

    fn small_runtime() -> std::sync::Arc<Runtime> {
        let mut options = RuntimeOptions::new();
        options.pool_block = 16;
        Runtime::with_options(options)
    }

    #[test]
    fn unreachable_ghost_is_destroyed_once() {
        let rt = small_runtime();
        let mut cx = rt.new_context();
        let ghost = cx.with(|ctx| ctx.new_ghost(&COUNTED, Box::new(42u32)));
        assert_eq!(ghost.with_ghost(|n: &mut u32| *n), Some(42));
        // Temporaries survive until the next call clears them.
        rt.collect();
        assert_eq!(DESTROYED.load(Ordering::SeqCst), 0);

        cx.with(|ctx| ctx.clear_temps());
        drop(ghost);
        rt.collect();
        assert_eq!(DESTROYED.load(Ordering::SeqCst), 1);
        rt.collect();
        assert_eq!(DESTROYED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pinned_values_survive() {
        let rt = small_runtime();
        let mut cx = rt.new_context();
        let (kept, released) = cx.with(|ctx| {
            let a = ctx.new_str(b"kept");
            let b = ctx.new_str(b"released");
            ctx.clear_temps();
            (a, b)
        });
        rt.save(kept.clone());
        let key = rt.gc_save(released.clone());
        rt.collect();
        assert_eq!(released.str_bytes().unwrap(), b"released");
        rt.gc_release(key);
        rt.collect();
        assert_eq!(kept.str_bytes().unwrap(), b"kept");
        assert!(!released.is_str());
        assert!(rt.stats().collections >= 2);
    }

    #[test]
    fn collection_reclaims_garbage() {
        let rt = small_runtime();
        let mut cx = rt.new_context();
        cx.with(|ctx| {
            for i in 0..200 {
                ctx.new_vec(vec![Value::Num(i as f64)]);
                ctx.clear_temps();
            }
        });
        let stats = rt.stats();
        assert!(stats.collections > 0);
        assert!(stats.reclaimed > 0);
    }

    fn collect_from_native(ctx: &mut Ctx<'_>, _me: Value, _args: &[Value]) -> RtResult {
        ctx.runtime().collect();
        Ok(Value::Num(7.0))
    }

    #[test]
    fn collect_requested_inside_a_call_runs_on_leave() {
        let rt = Runtime::new();
        let mut cx = rt.new_context();
        let (code, ns) = cx.with(|ctx| {
            let ns = ctx.new_lib(&[("gc_now", collect_from_native)]).unwrap();
            let code = ctx.compile(b"gc_now() + 1", "gc.nas", 1).unwrap();
            (code, ns)
        });
        let before = rt.stats().collections;
        let v = cx.call(&code, &[], Value::Nil, ns).unwrap();
        assert_eq!(v.num(), Some(8.0));
        assert!(rt.stats().collections > before);
    }

    fn enter_other(ctx: &mut Ctx<'_>, _me: Value, _args: &[Value], data: &(dyn Any + Send + Sync)) -> RtResult {
        let rt = data.downcast_ref::<Weak<Runtime>>().unwrap().upgrade().unwrap();
        let mut other = rt.new_context();
        let made = other.with(|inner| {
            // Outgrows the small pools while the caller's context is held.
            let items: Vec<Value> = (0..100).map(|i| inner.new_vec(vec![Value::Num(i as f64)])).collect();
            inner.collect();
            rt.collect();
            items.len()
        });
        assert_eq!(ctx.stack_depth(), 1);
        Ok(Value::Num(made as f64))
    }

    #[test]
    fn nested_context_on_the_same_thread() {
        let rt = small_runtime();
        let mut cx = rt.new_context();
        let (code, ns) = cx.with(|ctx| {
            let ns = ctx.new_hash();
            let data: Arc<dyn Any + Send + Sync> = Arc::new(Arc::downgrade(&rt));
            let f = ctx.new_native_with_data("enter_other", enter_other, data, None);
            ctx.add_sym(&ns, "enter_other", f).unwrap();
            let code = ctx.compile(b"var n = enter_other(); n + 1", "nested.nas", 1).unwrap();
            (code, ns)
        });
        let before = rt.stats().collections;
        let v = cx.call(&code, &[], Value::Nil, ns).unwrap();
        assert_eq!(v.num(), Some(101.0));
        assert!(rt.stats().collections > before);
        assert!(rt.stats().total_cells > 16);
    }
}
