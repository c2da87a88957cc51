//! Type-segmented cell pools.
//!
//! A pool owns fixed-size blocks of cells of one object type and a free
//! list. Contexts take cells in batches; sweeping rebuilds the free list
//! from scratch by scanning every block.
use crate::runtime::object::{Body, Gc, ObjType};

pub(crate) struct Pool {
    ty: ObjType,
    blocks: Vec<Vec<Gc>>,
    free: Vec<Gc>,
    block_size: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub live: usize,
    pub reclaimed: usize,
}

impl Pool {
    pub(crate) fn new(ty: ObjType, block_size: usize) -> Self {
        let mut pool = Self {
            ty,
            blocks: Vec::new(),
            free: Vec::new(),
            block_size: block_size.max(1),
        };
        pool.new_block(pool.block_size);
        pool
    }

    pub(crate) fn total(&self) -> usize {
        self.blocks.iter().map(Vec::len).sum()
    }

    pub(crate) fn free_count(&self) -> usize {
        self.free.len()
    }

    pub(crate) fn new_block(&mut self, cells: usize) {
        let block: Vec<Gc> = (0..cells).map(|_| Gc::new_free()).collect();
        self.free.extend(block.iter().cloned());
        self.blocks.push(block);
        log::trace!(
            target: "gc",
            "{} pool: new block of {} cells ({} total)",
            self.ty.name(),
            cells,
            self.total()
        );
    }

    /// Hands out up to `n` free cells.
    pub(crate) fn take(&mut self, n: usize) -> Vec<Gc> {
        let keep = self.free.len().saturating_sub(n);
        self.free.split_off(keep)
    }

    /// Takes one cell, growing the pool if it is empty. Used where the
    /// caller cannot enter the bottleneck.
    pub(crate) fn take_or_grow(&mut self) -> Gc {
        loop {
            if let Some(cell) = self.free.pop() {
                return cell;
            }
            let cells = self.block_size.max(self.total() / 8);
            self.new_block(cells);
        }
    }

    /// Reclaims every unmarked live cell, clears marks and rebuilds the free
    /// list. `cleanup` runs once per reclaimed payload.
    pub(crate) fn reap(&mut self, cleanup: &mut impl FnMut(Body)) -> PoolStats {
        let mut stats = PoolStats::default();
        self.free.clear();
        for block in &self.blocks {
            for cell in block {
                stats.total += 1;
                if cell.ty() == ObjType::Freed {
                    self.free.push(cell.clone());
                } else if !cell.is_marked() {
                    cleanup(cell.reclaim());
                    self.free.push(cell.clone());
                    stats.reclaimed += 1;
                } else {
                    cell.clear_mark();
                    stats.live += 1;
                }
            }
        }

        if self.free.len() < stats.total / 4 {
            let grow = self.block_size.max(stats.total / 4);
            self.new_block(grow);
        }
        let want = (stats.live + stats.live / 2).max(self.free.len());
        if self.free.capacity() > want {
            self.free.shrink_to(want);
        }
        stats
    }

    /// Drops every payload. Breaks reference cycles at teardown.
    pub(crate) fn clear(&mut self) {
        for block in &self.blocks {
            for cell in block {
                if cell.ty() != ObjType::Freed {
                    drop(cell.reclaim());
                }
            }
        }
        self.free.clear();
        self.blocks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{string::StrObj, value::Value};

    #[test]
    fn take_hands_out_distinct_cells() {
        let mut pool = Pool::new(ObjType::Vec, 8);
        let a = pool.take(5);
        let b = pool.take(5);
        assert_eq!(a.len(), 5);
        assert_eq!(b.len(), 3);
        assert!(pool.take(1).is_empty());
        assert!(!a[0].ptr_eq(&b[0]));
    }

    #[test]
    fn reap_reclaims_unmarked_and_grows() {
        let mut pool = Pool::new(ObjType::Str, 8);
        let cells = pool.take(8);
        for cell in &cells {
            cell.install(ObjType::Str, Body::Str(StrObj::from_bytes(b"x")));
        }
        cells[0].mark();
        let mut cleaned = 0;
        let stats = pool.reap(&mut |body| {
            assert!(matches!(body, Body::Str(_)));
            cleaned += 1;
        });
        assert_eq!(cleaned, 7);
        assert_eq!(stats, PoolStats { total: 8, live: 1, reclaimed: 7 });
        assert!(!cells[0].is_marked());
        assert_eq!(cells[1].ty(), ObjType::Freed);
        assert_eq!(Value::Obj(cells[0].clone()).str_bytes().unwrap(), b"x");

        // A second sweep with nothing marked frees the survivor only once.
        let mut again = 0;
        pool.reap(&mut |_| again += 1);
        assert_eq!(again, 1);
    }

    #[test]
    fn reap_grows_a_nearly_full_pool() {
        let mut pool = Pool::new(ObjType::Vec, 4);
        for cell in pool.take(4) {
            cell.install(ObjType::Vec, Body::Vec(Vec::new()));
            cell.mark();
        }
        pool.reap(&mut |_| {});
        assert_eq!(pool.total(), 8);
        assert_eq!(pool.free_count(), 4);
    }
}
