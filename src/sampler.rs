// Metropolis-Hastings proposal engine.
//
// Each worker thread runs one `MetropolisHastings` instance against the
// shared grid, mask, region locks, energy model, and statistics. A step
// draws a move kind from the unit-interval partition of the configured
// weights, locks the region it intends to mutate, stages the edit against
// the energy model, and commits or discards by the acceptance test.
//
// Rejection is the normal outcome of a step, not an error: precondition
// failures abort before any energy staging (implicit rejection), and a
// failed acceptance draw rolls the staged change back through the
// transaction guard.

use rand::Rng;

use crate::energy::{EnergyModel, EnergyTxn};
use crate::grid::ParticleGrid;
use crate::lock::{RegionGuard, RegionLocks};
use crate::mask::TrackingMask;
use crate::math;
use crate::particle::{Particle, ParticleEnd, ParticleKey, SegmentEnd};
use crate::settings::SamplerSettings;
use crate::stats::{MoveKind, SamplerStats};

/// Resampling attempts before a contended proposal gives up.
const LOCK_RETRIES: usize = 64;

/// Birth acceptance ratio: `exp(-dE/T) * density / (N+1) * p_death / p_birth`
/// with `N` the particle count before insertion.
pub fn birth_ratio(
    delta: f64,
    temperature: f64,
    count_before: u64,
    settings: &SamplerSettings,
) -> f64 {
    (-delta / temperature).exp() * settings.density / (count_before as f64 + 1.0)
        * (settings.p_death / settings.p_birth)
}

/// Death acceptance ratio: `exp(-dE/T) * N / density * p_birth / p_death`
/// with `N` the particle count before removal. The exact algebraic inverse
/// of [`birth_ratio`] on the reverse transition.
pub fn death_ratio(
    delta: f64,
    temperature: f64,
    count_before: u64,
    settings: &SamplerSettings,
) -> f64 {
    (-delta / temperature).exp() * count_before as f64 / settings.density
        * (settings.p_birth / settings.p_death)
}

/// Acceptance ratio of a symmetric proposal: `exp(-dE/T)`.
pub fn metropolis_ratio(delta: f64, temperature: f64) -> f64 {
    (-delta / temperature).exp()
}

/// Optimal-shift acceptance ratio with the Hastings correction for the
/// asymmetric proposal mixture: `exp(-dE/T) * w / (w + p_optshift)` where
/// `w = p_shift * proposal_density` and `proposal_density` is the chance
/// the random-shift kernel would have produced the same target.
pub fn optimal_shift_ratio(
    delta: f64,
    temperature: f64,
    proposal_density: f64,
    settings: &SamplerSettings,
) -> f64 {
    let w = settings.p_shift * proposal_density;
    (-delta / temperature).exp() * w / (w + settings.p_opt_shift)
}

pub struct MetropolisHastings<'a, E: EnergyModel + ?Sized> {
    grid: &'a ParticleGrid,
    mask: &'a TrackingMask,
    locks: &'a RegionLocks,
    energy: &'a E,
    stats: &'a SamplerStats,
    settings: &'a SamplerSettings,
    partition: [f64; 5],
    temperature: f64,
}

impl<'a, E: EnergyModel + ?Sized> MetropolisHastings<'a, E> {
    pub fn new(
        grid: &'a ParticleGrid,
        mask: &'a TrackingMask,
        locks: &'a RegionLocks,
        energy: &'a E,
        stats: &'a SamplerStats,
        settings: &'a SamplerSettings,
    ) -> Self {
        Self {
            grid,
            mask,
            locks,
            energy,
            stats,
            settings,
            partition: settings.move_partition(),
            temperature: settings.t_start,
        }
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn set_temperature(&mut self, temperature: f64) {
        self.temperature = temperature;
    }

    /// Claim iterations from the shared budget until it is exhausted,
    /// annealing the temperature along the way.
    pub fn run<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        while self.stats.next() {
            self.temperature = self.settings.temperature_at(self.stats.progress());
            self.step(rng);
        }
    }

    /// Execute one proposal: draw a move kind and dispatch. A draw beyond
    /// the configured weight sum is a no-op.
    pub fn step<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let p: f64 = rng.gen();
        let edges = &self.partition;
        if p < edges[0] {
            self.propose_birth(rng);
        } else if p < edges[1] {
            self.propose_death(rng);
        } else if p < edges[2] {
            self.propose_random_shift(rng);
        } else if p < edges[3] {
            self.propose_optimal_shift(rng);
        } else if p < edges[4] {
            self.propose_connect(rng);
        }
    }

    /// Sample a live particle and lock its region, resampling on
    /// contention. The particle snapshot is re-read under the lock.
    fn lock_random_particle<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
    ) -> Option<(ParticleKey, Particle, RegionGuard<'a>)> {
        for _ in 0..LOCK_RETRIES {
            let key = self.grid.random(rng)?;
            let snapshot = match self.grid.get(key) {
                Some(p) => p,
                None => continue,
            };
            if let Some(guard) = self.locks.try_lock(snapshot.position) {
                match self.grid.get(key) {
                    Some(p) if self.locks.shard_of(p.position) == guard.shard() => {
                        return Some((key, p, guard));
                    }
                    _ => continue,
                }
            }
        }
        None
    }

    fn propose_birth<R: Rng + ?Sized>(&self, rng: &mut R) {
        self.stats.record_attempt(MoveKind::Birth);
        let mut locked = None;
        for _ in 0..LOCK_RETRIES {
            let position = match self.mask.random_position(rng) {
                Some(p) => p,
                None => return,
            };
            if let Some(guard) = self.locks.try_lock(position) {
                locked = Some((position, guard));
                break;
            }
        }
        let (position, _region) = match locked {
            Some(l) => l,
            None => return,
        };
        let direction = math::random_unit_vector(rng);

        let mut txn = EnergyTxn::begin(self.energy);
        let delta = txn.birth(self.grid, position, direction);
        let ratio = birth_ratio(delta, self.temperature, self.grid.len() as u64, self.settings);
        if ratio > rng.gen::<f64>() && self.grid.insert(position, direction).is_some() {
            txn.commit();
            self.stats.record_accept(MoveKind::Birth);
        }
    }

    fn propose_death<R: Rng + ?Sized>(&self, rng: &mut R) {
        self.stats.record_attempt(MoveKind::Death);
        let (key, particle, _region) = match self.lock_random_particle(rng) {
            Some(l) => l,
            None => return,
        };
        // Death is only legal for fully disconnected particles.
        if particle.is_connected() {
            return;
        }
        let count_before = self.grid.len() as u64;
        let mut txn = EnergyTxn::begin(self.energy);
        let delta = txn.death(self.grid, key);
        let ratio = death_ratio(delta, self.temperature, count_before, self.settings);
        if ratio > rng.gen::<f64>() && self.grid.remove(key) {
            txn.commit();
            self.stats.record_accept(MoveKind::Death);
        }
    }

    fn propose_random_shift<R: Rng + ?Sized>(&self, rng: &mut R) {
        self.stats.record_attempt(MoveKind::RandomShift);
        let (key, particle, _region) = match self.lock_random_particle(rng) {
            Some(l) => l,
            None => return,
        };
        let position = math::add_scaled(
            particle.position,
            1.0,
            math::gaussian_offset(rng, self.settings.sigma_pos),
        );
        let direction = match math::try_normalize(math::add_scaled(
            particle.direction,
            1.0,
            math::gaussian_offset(rng, self.settings.sigma_dir),
        )) {
            Some(d) => d,
            None => return,
        };
        if !self.mask.contains(position) {
            return;
        }

        let mut txn = EnergyTxn::begin(self.energy);
        let delta = txn.shift(self.grid, key, position, direction);
        if metropolis_ratio(delta, self.temperature) > rng.gen::<f64>()
            && self.grid.relocate(key, position, direction)
        {
            txn.commit();
            self.stats.record_accept(MoveKind::RandomShift);
        }
    }

    fn propose_optimal_shift<R: Rng + ?Sized>(&self, rng: &mut R) {
        self.stats.record_attempt(MoveKind::OptimalShift);
        let (key, particle, _region) = match self.lock_random_particle(rng) {
            Some(l) => l,
            None => return,
        };
        // Undefined without at least one neighbor.
        let (position, direction) = match self.optimal_pose(&particle) {
            Some(target) => target,
            None => return,
        };
        if !self.mask.contains(position) {
            return;
        }
        let proposal_density = math::shift_proposal_density(
            particle.position,
            particle.direction,
            position,
            direction,
            self.settings.sigma_pos,
            self.settings.sigma_dir,
        );

        let mut txn = EnergyTxn::begin(self.energy);
        let delta = txn.shift(self.grid, key, position, direction);
        let ratio = optimal_shift_ratio(delta, self.temperature, proposal_density, self.settings);
        if ratio > rng.gen::<f64>() && self.grid.relocate(key, position, direction) {
            txn.commit();
            self.stats.record_accept(MoveKind::OptimalShift);
        }
    }

    /// Target pose implied by the current neighbors: midpoint of the two
    /// adjacent endpoints when both exist, otherwise the pose that puts the
    /// linked end on the single neighbor's adjacent endpoint.
    fn optimal_pose(&self, particle: &Particle) -> Option<([f64; 3], [f64; 3])> {
        let half = self.settings.segment_half_len;
        match (particle.predecessor, particle.successor) {
            (None, None) => None,
            (Some(pred), Some(succ)) => {
                let p = self.grid.get(pred.key)?;
                let s = self.grid.get(succ.key)?;
                let pred_endpoint = p.endpoint(pred.end, half);
                let succ_endpoint = s.endpoint(succ.end, half);
                let direction = math::direction_between(pred_endpoint, succ_endpoint)?;
                Some((math::midpoint(pred_endpoint, succ_endpoint), direction))
            }
            (Some(pred), None) => {
                let p = self.grid.get(pred.key)?;
                let anchor = p.endpoint(pred.end, half);
                Some((
                    math::add_scaled(anchor, half, particle.direction),
                    particle.direction,
                ))
            }
            (None, Some(succ)) => {
                let s = self.grid.get(succ.key)?;
                let anchor = s.endpoint(succ.end, half);
                Some((
                    math::add_scaled(anchor, -half, particle.direction),
                    particle.direction,
                ))
            }
        }
    }

    fn propose_connect<R: Rng + ?Sized>(&self, rng: &mut R) {
        self.stats.record_attempt(MoveKind::Connect);
        let (key, _particle, region) = match self.lock_random_particle(rng) {
            Some(l) => l,
            None => return,
        };
        let end = if rng.gen::<f64>() < 0.5 {
            SegmentEnd::Head
        } else {
            SegmentEnd::Tail
        };
        let this_end = ParticleEnd::new(key, end);

        let mut txn = EnergyTxn::begin(self.energy);
        let outcome = txn.connect(self.grid, this_end);
        // A particle never links to itself.
        if matches!(outcome.partner, Some(partner) if partner.key == key) {
            return;
        }
        if metropolis_ratio(outcome.delta, self.temperature) <= rng.gen::<f64>() {
            return;
        }

        match outcome.partner {
            Some(partner) => {
                let partner_particle = match self.grid.get(partner.key) {
                    Some(p) => p,
                    None => return,
                };
                let _second =
                    match self.locks.try_lock_second(&region, partner_particle.position) {
                        Ok(second) => second,
                        Err(()) => return,
                    };
                // Free both ends, then establish the new edge.
                self.grid.disconnect(this_end);
                self.grid.disconnect(partner);
                if self.grid.connect(this_end, partner) {
                    txn.commit();
                    self.stats.record_accept(MoveKind::Connect);
                }
            }
            None => {
                // No candidate: accepting removes the existing link, if any.
                self.grid.disconnect(this_end);
                txn.commit();
                self.stats.record_accept(MoveKind::Connect);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::energy::{ConnectOutcome, NullEnergy};
    use crate::grid::CellLayout;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Mutex;

    fn fixture(
        settings: &SamplerSettings,
    ) -> (ParticleGrid, TrackingMask, RegionLocks) {
        let mask = TrackingMask::filled([8, 8, 8], [1.0; 3], [0.0; 3]).unwrap();
        let (lo, hi) = mask.bounds();
        let layout = CellLayout::new(lo, hi, 2.0 * settings.segment_half_len);
        let grid = ParticleGrid::new(layout.clone(), 512);
        let locks = RegionLocks::new(layout, 1024);
        (grid, mask, locks)
    }

    #[test]
    fn test_birth_death_ratios_are_inverse() {
        let settings = SamplerSettings::default();
        for (delta, n) in [(0.7, 0u64), (-1.3, 5), (2.4, 99)] {
            let forward = birth_ratio(delta, 1.0, n, &settings);
            let backward = death_ratio(-delta, 1.0, n + 1, &settings);
            assert!(
                (forward * backward - 1.0).abs() < 1e-12,
                "detailed balance violated: {} * {} != 1",
                forward,
                backward
            );
        }
    }

    #[test]
    fn test_ratios_respect_temperature() {
        let settings = SamplerSettings::default();
        let cold = metropolis_ratio(1.0, 0.5);
        let hot = metropolis_ratio(1.0, 2.0);
        assert!(cold < hot);
        assert_eq!(metropolis_ratio(0.0, 0.5), 1.0);

        let b_cold = birth_ratio(1.0, 0.5, 10, &settings);
        let b_hot = birth_ratio(1.0, 2.0, 10, &settings);
        assert!(b_cold < b_hot);
    }

    #[test]
    fn test_optimal_shift_ratio_bounds() {
        let settings = SamplerSettings::default();
        // Zero energy change: the ratio is exactly the Hastings weight,
        // strictly below 1 for a positive optshift weight.
        let r = optimal_shift_ratio(0.0, 1.0, 0.5, &settings);
        assert!(r > 0.0 && r < 1.0);

        let no_opt = SamplerSettings {
            p_opt_shift: 0.0,
            p_connect: 0.55,
            ..Default::default()
        };
        assert!((optimal_shift_ratio(0.0, 1.0, 0.5, &no_opt) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_zero_delta_symmetric_shift_always_accepted() {
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..1000 {
            assert!(metropolis_ratio(0.0, 1.0) > rng.gen::<f64>());
        }
    }

    #[test]
    fn test_birth_populates_grid() {
        let settings = SamplerSettings {
            p_birth: 0.9,
            p_death: 0.1,
            p_shift: 0.0,
            p_opt_shift: 0.0,
            p_connect: 0.0,
            ..Default::default()
        };
        settings.validate().unwrap();
        let (grid, mask, locks) = fixture(&settings);
        let stats = SamplerStats::new(500);
        let mut sampler =
            MetropolisHastings::new(&grid, &mask, &locks, &NullEnergy, &stats, &settings);
        let mut rng = StdRng::seed_from_u64(17);
        sampler.run(&mut rng);

        assert!(grid.len() > 0);
        assert!(stats.accepted(MoveKind::Birth) > 0);
        assert_eq!(
            grid.len() as u64,
            stats.accepted(MoveKind::Birth) - stats.accepted(MoveKind::Death)
        );
        // Everything born lies inside the mask with a unit direction.
        for key in grid.keys() {
            let p = grid.get(key).unwrap();
            assert!(mask.contains(p.position));
            assert!((math::norm(p.direction) - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_death_requires_disconnection() {
        let settings = SamplerSettings {
            p_birth: 0.0,
            p_death: 1.0,
            p_shift: 0.0,
            p_opt_shift: 0.0,
            p_connect: 0.0,
            ..Default::default()
        };
        let (grid, mask, locks) = fixture(&settings);
        let a = grid.insert([1.0, 1.0, 1.0], [0.0, 0.0, 1.0]).unwrap();
        let b = grid.insert([1.0, 1.0, 3.0], [0.0, 0.0, 1.0]).unwrap();
        assert!(grid.connect(
            ParticleEnd::new(a, SegmentEnd::Head),
            ParticleEnd::new(b, SegmentEnd::Tail),
        ));

        let stats = SamplerStats::new(200);
        let mut sampler =
            MetropolisHastings::new(&grid, &mask, &locks, &NullEnergy, &stats, &settings);
        let mut rng = StdRng::seed_from_u64(23);
        sampler.run(&mut rng);

        // Both particles remain linked, so every death is an implicit
        // rejection.
        assert_eq!(grid.len(), 2);
        assert_eq!(stats.attempted(MoveKind::Death), 200);
        assert_eq!(stats.accepted(MoveKind::Death), 0);
    }

    #[test]
    fn test_shift_keeps_directions_normalized_and_in_mask() {
        let settings = SamplerSettings {
            p_birth: 0.0,
            p_death: 0.0,
            p_shift: 0.7,
            p_opt_shift: 0.0,
            p_connect: 0.0,
            sigma_pos: 0.5,
            sigma_dir: 0.5,
            ..Default::default()
        };
        let (grid, mask, locks) = fixture(&settings);
        let mut rng = StdRng::seed_from_u64(31);
        for _ in 0..20 {
            let pos = mask.random_position(&mut rng).unwrap();
            grid.insert(pos, math::random_unit_vector(&mut rng)).unwrap();
        }

        let stats = SamplerStats::new(2000);
        let mut sampler =
            MetropolisHastings::new(&grid, &mask, &locks, &NullEnergy, &stats, &settings);
        sampler.run(&mut rng);

        assert!(stats.accepted(MoveKind::RandomShift) > 0);
        for key in grid.keys() {
            let p = grid.get(key).unwrap();
            assert!(mask.contains(p.position), "particle left mask: {:?}", p.position);
            assert!((math::norm(p.direction) - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_optimal_shift_centres_between_neighbors() {
        let settings = SamplerSettings {
            p_birth: 0.0,
            p_death: 0.0,
            p_shift: 0.2,
            p_opt_shift: 0.8,
            p_connect: 0.0,
            segment_half_len: 0.5,
            ..Default::default()
        };
        let (grid, mask, locks) = fixture(&settings);
        // A three-particle chain with a displaced middle particle.
        let a = grid.insert([2.0, 4.0, 4.0], [1.0, 0.0, 0.0]).unwrap();
        let m = grid.insert([4.0, 5.5, 4.0], [0.0, 1.0, 0.0]).unwrap();
        let b = grid.insert([6.0, 4.0, 4.0], [1.0, 0.0, 0.0]).unwrap();
        assert!(grid.connect(
            ParticleEnd::new(a, SegmentEnd::Head),
            ParticleEnd::new(m, SegmentEnd::Tail),
        ));
        assert!(grid.connect(
            ParticleEnd::new(m, SegmentEnd::Head),
            ParticleEnd::new(b, SegmentEnd::Tail),
        ));

        let stats = SamplerStats::new(1);
        let sampler =
            MetropolisHastings::new(&grid, &mask, &locks, &NullEnergy, &stats, &settings);
        let middle = grid.get(m).unwrap();
        let (position, direction) = sampler.optimal_pose(&middle).unwrap();
        // Midpoint of a's head endpoint (2.5, 4, 4) and b's tail endpoint
        // (5.5, 4, 4), direction along +x.
        assert!((position[0] - 4.0).abs() < 1e-12);
        assert!((position[1] - 4.0).abs() < 1e-12);
        assert!((direction[0] - 1.0).abs() < 1e-12);

        // A lone particle has no defined optimal pose.
        let lone = grid.insert([1.0, 1.0, 1.0], [0.0, 0.0, 1.0]).unwrap();
        assert!(sampler.optimal_pose(&grid.get(lone).unwrap()).is_none());
    }

    /// Energy stub proposing a scripted partner for every connect.
    struct ScriptedConnect {
        partner: Mutex<Option<ParticleEnd>>,
    }

    impl EnergyModel for ScriptedConnect {
        fn stage_birth(&self, _: &ParticleGrid, _: [f64; 3], _: [f64; 3]) -> f64 {
            0.0
        }
        fn stage_death(&self, _: &ParticleGrid, _: ParticleKey) -> f64 {
            0.0
        }
        fn stage_shift(&self, _: &ParticleGrid, _: ParticleKey, _: [f64; 3], _: [f64; 3]) -> f64 {
            0.0
        }
        fn stage_connect(&self, _: &ParticleGrid, _: ParticleEnd) -> ConnectOutcome {
            ConnectOutcome {
                delta: 0.0,
                partner: *self.partner.lock().unwrap(),
            }
        }
        fn accept_staged(&self) {}
        fn discard_staged(&self) {}
    }

    #[test]
    fn test_connect_links_and_unlinks() {
        let settings = SamplerSettings {
            p_birth: 0.0,
            p_death: 0.0,
            p_shift: 0.0,
            p_opt_shift: 0.0,
            p_connect: 1.0,
            ..Default::default()
        };
        let (grid, mask, locks) = fixture(&settings);
        let a = grid.insert([1.0, 1.0, 1.0], [0.0, 0.0, 1.0]).unwrap();
        let b = grid.insert([6.0, 6.0, 6.0], [0.0, 0.0, 1.0]).unwrap();

        let b_tail = ParticleEnd::new(b, SegmentEnd::Tail);
        let energy = ScriptedConnect {
            partner: Mutex::new(Some(b_tail)),
        };
        let stats = SamplerStats::new(64);
        let mut sampler =
            MetropolisHastings::new(&grid, &mask, &locks, &energy, &stats, &settings);
        let mut rng = StdRng::seed_from_u64(41);
        sampler.run(&mut rng);

        // Whichever particle was drawn, an edge to b's tail exists (unless
        // b itself was drawn, whose self-link proposals are all rejected).
        let linked = grid.get(a).unwrap().is_connected() || grid.get(b).unwrap().is_connected();
        assert!(linked);
        // No particle may ever be its own neighbor.
        for key in grid.keys() {
            let p = grid.get(key).unwrap();
            for link in [p.predecessor, p.successor].into_iter().flatten() {
                assert_ne!(link.key, key);
            }
        }

        // Scripting "no partner" removes links on accepted connects.
        *energy.partner.lock().unwrap() = None;
        let stats = SamplerStats::new(64);
        let mut sampler =
            MetropolisHastings::new(&grid, &mask, &locks, &energy, &stats, &settings);
        sampler.run(&mut rng);
        assert!(!grid.get(a).unwrap().is_connected());
        assert!(!grid.get(b).unwrap().is_connected());
    }

    #[test]
    fn test_no_op_draws_outside_weight_sum() {
        let settings = SamplerSettings {
            p_birth: 0.1,
            p_death: 0.1,
            p_shift: 0.1,
            p_opt_shift: 0.1,
            p_connect: 0.1,
            ..Default::default()
        };
        settings.validate().unwrap();
        let (grid, mask, locks) = fixture(&settings);
        let stats = SamplerStats::new(1000);
        let mut sampler =
            MetropolisHastings::new(&grid, &mask, &locks, &NullEnergy, &stats, &settings);
        let mut rng = StdRng::seed_from_u64(53);
        sampler.run(&mut rng);

        let attempted: u64 = MoveKind::ALL.iter().map(|&k| stats.attempted(k)).sum();
        // Roughly half the draws fall in the dead zone of the partition.
        assert!(attempted < 1000);
        assert!(attempted > 300);
    }
}
