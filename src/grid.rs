// Spatial index owning all live particles.
//
// Storage is a fixed-capacity slot arena; keys carry a generation counter
// so handles held across a removal resolve to nothing. A dense live list
// backs uniform random picks, and coarse occupancy cells back neighborhood
// queries. Slots, cells, and the live list carry their own mutexes so
// workers mutating disjoint regions do not serialize; transactional
// isolation between whole proposals is the region locks' job, not ours.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use rand::Rng;

use crate::particle::{Particle, ParticleEnd, ParticleKey};

const NO_DENSE: u32 = u32::MAX;

/// Uniform partition of a world-space box into cubic cells.
#[derive(Debug, Clone)]
pub struct CellLayout {
    origin: [f64; 3],
    cell_size: f64,
    dims: [usize; 3],
}

impl CellLayout {
    pub fn new(lower: [f64; 3], upper: [f64; 3], cell_size: f64) -> Self {
        let mut dims = [1usize; 3];
        for axis in 0..3 {
            let extent = (upper[axis] - lower[axis]).max(0.0);
            dims[axis] = ((extent / cell_size).ceil() as usize).max(1);
        }
        Self {
            origin: lower,
            cell_size,
            dims,
        }
    }

    pub fn cell_count(&self) -> usize {
        self.dims[0] * self.dims[1] * self.dims[2]
    }

    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    fn coords_of(&self, position: [f64; 3]) -> [usize; 3] {
        let mut c = [0usize; 3];
        for axis in 0..3 {
            let t = ((position[axis] - self.origin[axis]) / self.cell_size).floor();
            c[axis] = (t.max(0.0) as usize).min(self.dims[axis] - 1);
        }
        c
    }

    /// Linear index of the cell containing a position (clamped to bounds).
    pub fn cell_of(&self, position: [f64; 3]) -> usize {
        let [i, j, k] = self.coords_of(position);
        (k * self.dims[1] + j) * self.dims[0] + i
    }
}

struct Slot {
    generation: u32,
    particle: Option<Particle>,
}

struct LiveList {
    keys: Vec<ParticleKey>,
    /// slot index -> position in `keys`, NO_DENSE when the slot is free.
    dense_index: Vec<u32>,
    free: Vec<u32>,
}

/// Owner of all live particles and the single source of truth for
/// membership. Graph links live inside the particles; `connect` and
/// `disconnect` keep the two half-links of an edge consistent.
pub struct ParticleGrid {
    layout: CellLayout,
    slots: Vec<Mutex<Slot>>,
    cells: Vec<Mutex<Vec<ParticleKey>>>,
    live: Mutex<LiveList>,
    count: AtomicUsize,
}

impl ParticleGrid {
    pub fn new(layout: CellLayout, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let slots = (0..capacity)
            .map(|_| {
                Mutex::new(Slot {
                    generation: 0,
                    particle: None,
                })
            })
            .collect();
        let cells = (0..layout.cell_count())
            .map(|_| Mutex::new(Vec::new()))
            .collect();
        let live = LiveList {
            keys: Vec::with_capacity(capacity),
            dense_index: vec![NO_DENSE; capacity],
            free: (0..capacity as u32).rev().collect(),
        };
        Self {
            layout,
            slots,
            cells,
            live: Mutex::new(live),
            count: AtomicUsize::new(0),
        }
    }

    pub fn layout(&self) -> &CellLayout {
        &self.layout
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of live particles.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a new disconnected particle. None when the arena is full.
    pub fn insert(&self, position: [f64; 3], direction: [f64; 3]) -> Option<ParticleKey> {
        let index = self.live.lock().unwrap().free.pop()? as usize;
        let key = {
            let mut slot = self.slots[index].lock().unwrap();
            let key = ParticleKey::new(index as u32, slot.generation);
            slot.particle = Some(Particle::new(position, direction));
            key
        };
        self.cells[self.layout.cell_of(position)]
            .lock()
            .unwrap()
            .push(key);
        {
            let mut live = self.live.lock().unwrap();
            live.dense_index[index] = live.keys.len() as u32;
            live.keys.push(key);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        Some(key)
    }

    /// Copy out the particle a key resolves to, if it is still live.
    pub fn get(&self, key: ParticleKey) -> Option<Particle> {
        let slot = self.slots[key.index()].lock().unwrap();
        if slot.generation != key.generation() {
            return None;
        }
        slot.particle
    }

    /// Remove a disconnected particle. Refuses stale keys and particles
    /// that still hold a link at either end.
    pub fn remove(&self, key: ParticleKey) -> bool {
        // A key whose live-list registration is still pending (insert in
        // flight on another thread) is not removable yet.
        if self.live.lock().unwrap().dense_index[key.index()] == NO_DENSE {
            return false;
        }
        let position = {
            let mut slot = self.slots[key.index()].lock().unwrap();
            if slot.generation != key.generation() {
                return false;
            }
            let particle = match slot.particle.as_ref() {
                Some(p) => *p,
                None => return false,
            };
            if particle.is_connected() {
                return false;
            }
            slot.particle = None;
            slot.generation = slot.generation.wrapping_add(1);
            particle.position
        };

        let mut cell = self.cells[self.layout.cell_of(position)].lock().unwrap();
        if let Some(at) = cell.iter().position(|&k| k == key) {
            cell.swap_remove(at);
        }
        drop(cell);

        let mut live = self.live.lock().unwrap();
        let dense = live.dense_index[key.index()] as usize;
        live.keys.swap_remove(dense);
        if dense < live.keys.len() {
            let moved = live.keys[dense];
            live.dense_index[moved.index()] = dense as u32;
        }
        live.dense_index[key.index()] = NO_DENSE;
        live.free.push(key.index() as u32);
        drop(live);

        self.count.fetch_sub(1, Ordering::Relaxed);
        true
    }

    /// Move a particle in place, updating cell occupancy.
    pub fn relocate(&self, key: ParticleKey, position: [f64; 3], direction: [f64; 3]) -> bool {
        let (old_cell, new_cell) = {
            let mut slot = self.slots[key.index()].lock().unwrap();
            if slot.generation != key.generation() {
                return false;
            }
            let particle = match slot.particle.as_mut() {
                Some(p) => p,
                None => return false,
            };
            let old_cell = self.layout.cell_of(particle.position);
            let new_cell = self.layout.cell_of(position);
            particle.position = position;
            particle.direction = direction;
            (old_cell, new_cell)
        };
        if old_cell != new_cell {
            let mut cell = self.cells[old_cell].lock().unwrap();
            if let Some(at) = cell.iter().position(|&k| k == key) {
                cell.swap_remove(at);
            }
            drop(cell);
            self.cells[new_cell].lock().unwrap().push(key);
        }
        true
    }

    /// Uniform random pick over live particles. None when empty.
    pub fn random<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<ParticleKey> {
        let live = self.live.lock().unwrap();
        if live.keys.is_empty() {
            return None;
        }
        Some(live.keys[rng.gen_range(0..live.keys.len())])
    }

    /// Snapshot of all live keys.
    pub fn keys(&self) -> Vec<ParticleKey> {
        self.live.lock().unwrap().keys.clone()
    }

    fn lock_slot_pair(
        &self,
        a: usize,
        b: usize,
    ) -> (MutexGuard<'_, Slot>, MutexGuard<'_, Slot>) {
        if a < b {
            let ga = self.slots[a].lock().unwrap();
            let gb = self.slots[b].lock().unwrap();
            (ga, gb)
        } else {
            let gb = self.slots[b].lock().unwrap();
            let ga = self.slots[a].lock().unwrap();
            (ga, gb)
        }
    }

    /// Create the bidirectional link `a <-> b`. Refuses self-links, stale
    /// keys, and ends that already hold a link.
    pub fn connect(&self, a: ParticleEnd, b: ParticleEnd) -> bool {
        if a.key == b.key {
            return false;
        }
        let (mut ga, mut gb) = self.lock_slot_pair(a.key.index(), b.key.index());
        if ga.generation != a.key.generation() || gb.generation != b.key.generation() {
            return false;
        }
        let (pa, pb) = match (ga.particle.as_mut(), gb.particle.as_mut()) {
            (Some(pa), Some(pb)) => (pa, pb),
            _ => return false,
        };
        if pa.link_at(a.end).is_some() || pb.link_at(b.end).is_some() {
            return false;
        }
        pa.set_link(a.end, Some(b));
        pb.set_link(b.end, Some(a));
        true
    }

    /// Remove the link attached at `end`, clearing both half-links.
    /// False if no link is present (or the edge changed concurrently).
    pub fn disconnect(&self, end: ParticleEnd) -> bool {
        let partner = {
            let slot = self.slots[end.key.index()].lock().unwrap();
            if slot.generation != end.key.generation() {
                return false;
            }
            match slot.particle.as_ref().and_then(|p| p.link_at(end.end)) {
                Some(partner) => partner,
                None => return false,
            }
        };
        let (mut ga, mut gb) = self.lock_slot_pair(end.key.index(), partner.key.index());
        if ga.generation != end.key.generation() || gb.generation != partner.key.generation() {
            return false;
        }
        let (pa, pb) = match (ga.particle.as_mut(), gb.particle.as_mut()) {
            (Some(pa), Some(pb)) => (pa, pb),
            _ => return false,
        };
        // The edge must still be mutual; a concurrent edit voids the removal.
        if pa.link_at(end.end) != Some(partner) || pb.link_at(partner.end) != Some(end) {
            return false;
        }
        pa.set_link(end.end, None);
        pb.set_link(partner.end, None);
        true
    }

    /// Visit every live particle whose centre lies within `radius` of
    /// `position`. The callback runs without any grid lock held.
    pub fn for_each_neighbor<F>(&self, position: [f64; 3], radius: f64, mut f: F)
    where
        F: FnMut(ParticleKey, &Particle),
    {
        let lo = self
            .layout
            .coords_of([position[0] - radius, position[1] - radius, position[2] - radius]);
        let hi = self
            .layout
            .coords_of([position[0] + radius, position[1] + radius, position[2] + radius]);
        let radius_sq = radius * radius;
        let mut candidates = Vec::new();
        for k in lo[2]..=hi[2] {
            for j in lo[1]..=hi[1] {
                for i in lo[0]..=hi[0] {
                    let cell = (k * self.layout.dims[1] + j) * self.layout.dims[0] + i;
                    candidates.extend(self.cells[cell].lock().unwrap().iter().copied());
                }
            }
        }
        for key in candidates {
            if let Some(p) = self.get(key) {
                let d = crate::math::sub(p.position, position);
                if crate::math::dot(d, d) < radius_sq {
                    f(key, &p);
                }
            }
        }
    }

}
