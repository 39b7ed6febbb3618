// Run orchestration: sizes the shared state from the mask and settings,
// fans the sampling budget out to a worker pool, and extracts tracks from
// the final particle graph.

use log::{debug, info};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::chain;
use crate::energy::EnergyModel;
use crate::grid::{CellLayout, ParticleGrid};
use crate::lock::RegionLocks;
use crate::mask::TrackingMask;
use crate::sampler::MetropolisHastings;
use crate::settings::SamplerSettings;
use crate::stats::{SamplerStats, Summary};

const MAX_LOCK_SHARDS: usize = 4096;
const CAPACITY_HEADROOM: f64 = 4.0;
const MIN_CAPACITY: usize = 1024;

/// Result of one sampling run: the extracted tracks (polylines of segment
/// endpoints) and the proposal statistics.
#[derive(Debug, Clone)]
pub struct TrackingRun {
    pub tracks: Vec<Vec<[f64; 3]>>,
    pub summary: Summary,
}

/// Owns a validated configuration and the tracking mask, and runs the
/// sampler against an energy model.
pub struct GibbsTracker {
    mask: TrackingMask,
    settings: SamplerSettings,
}

impl GibbsTracker {
    pub fn new(mask: TrackingMask, settings: SamplerSettings) -> Result<Self, String> {
        settings.validate()?;
        if mask.inside_voxels() == 0 {
            return Err("Tracking mask has no inside voxels".to_string());
        }
        Ok(Self { mask, settings })
    }

    pub fn mask(&self) -> &TrackingMask {
        &self.mask
    }

    pub fn settings(&self) -> &SamplerSettings {
        &self.settings
    }

    /// Arena capacity implied by the configured prior intensity.
    pub fn capacity(&self) -> usize {
        ((self.settings.density * CAPACITY_HEADROOM) as usize).max(MIN_CAPACITY)
    }

    /// Run the whole iteration budget against `energy` and extract tracks.
    ///
    /// Workers share one iteration budget; each owns an RNG stream derived
    /// from the base seed, so a single-worker run is fully deterministic.
    pub fn run<E: EnergyModel + ?Sized>(&self, energy: &E) -> TrackingRun {
        let (lower, upper) = self.mask.bounds();
        let layout = CellLayout::new(lower, upper, 2.0 * self.settings.segment_half_len);
        let grid = ParticleGrid::new(layout.clone(), self.capacity());
        let locks = RegionLocks::new(layout, MAX_LOCK_SHARDS);
        let stats = SamplerStats::new(self.settings.iterations);

        info!(
            "sampling {} proposals on {} workers (arena capacity {}, {} lock shards)",
            self.settings.iterations,
            self.settings.workers,
            grid.capacity(),
            locks.shard_count()
        );

        (0..self.settings.workers).into_par_iter().for_each(|worker| {
            let seed = worker_seed(self.settings.seed, worker as u64);
            let mut rng = SmallRng::seed_from_u64(seed);
            let mut sampler = MetropolisHastings::new(
                &grid,
                &self.mask,
                &locks,
                energy,
                &stats,
                &self.settings,
            );
            sampler.run(&mut rng);
            debug!("worker {} done (final temperature {})", worker, sampler.temperature());
        });

        let tracks = chain::extract_tracks(
            &grid,
            self.settings.segment_half_len,
            self.settings.min_track_particles,
        );
        let summary = stats.summary(grid.len());
        info!(
            "sampling done: {} particles, {} tracks",
            summary.particles,
            tracks.len()
        );
        TrackingRun { tracks, summary }
    }
}

/// Decorrelated per-worker seed: one SplitMix64 scramble of the base seed
/// and the worker index.
fn worker_seed(base: u64, worker: u64) -> u64 {
    let mut z = base
        .wrapping_add(worker.wrapping_mul(0x9E37_79B9_7F4A_7C15))
        .wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
