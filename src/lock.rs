// Region locks: mutual exclusion keyed by continuous 3D position.
//
// Positions hash to a shard through their coarse grid cell; a proposal
// holds the shard of the region it mutates for the whole stage/commit
// window. Acquisition is try-lock only. The callers' retry discipline is
// to resample, never to block, so no lock ordering is needed to stay
// deadlock-free. Distant regions may share a shard; that costs contention,
// not correctness.

use std::sync::{Mutex, MutexGuard};

use crate::grid::CellLayout;

pub struct RegionLocks {
    layout: CellLayout,
    shards: Vec<Mutex<()>>,
}

/// Holds one shard for the lifetime of a staged proposal; released on drop.
pub struct RegionGuard<'a> {
    _guard: MutexGuard<'a, ()>,
    shard: usize,
}

impl<'a> RegionGuard<'a> {
    pub fn shard(&self) -> usize {
        self.shard
    }
}

impl RegionLocks {
    /// A lock table over the given region layout with at most `max_shards`
    /// shards (cells map onto shards round-robin).
    pub fn new(layout: CellLayout, max_shards: usize) -> Self {
        let n = layout.cell_count().min(max_shards.max(1));
        let shards = (0..n).map(|_| Mutex::new(())).collect();
        Self { layout, shards }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard index covering a world position.
    pub fn shard_of(&self, position: [f64; 3]) -> usize {
        self.layout.cell_of(position) % self.shards.len()
    }

    /// Try to take the shard covering `position` without blocking.
    pub fn try_lock(&self, position: [f64; 3]) -> Option<RegionGuard<'_>> {
        self.try_lock_shard(self.shard_of(position))
    }

    /// Try to take a shard by index without blocking.
    pub fn try_lock_shard(&self, shard: usize) -> Option<RegionGuard<'_>> {
        match self.shards[shard].try_lock() {
            Ok(guard) => Some(RegionGuard {
                _guard: guard,
                shard,
            }),
            Err(_) => None,
        }
    }

    /// Take the shard covering `position` unless `held` already covers it.
    /// `Ok(None)` means the held guard suffices; `Err(())` means the second
    /// shard is contended and the caller should abort.
    pub fn try_lock_second(
        &self,
        held: &RegionGuard<'_>,
        position: [f64; 3],
    ) -> Result<Option<RegionGuard<'_>>, ()> {
        let shard = self.shard_of(position);
        if shard == held.shard() {
            return Ok(None);
        }
        match self.try_lock_shard(shard) {
            Some(guard) => Ok(Some(guard)),
            None => Err(()),
        }
    }
}
