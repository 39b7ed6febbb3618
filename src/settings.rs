use std::fs::File;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Configuration of one sampling run.
///
/// The five move weights partition the unit interval; any remainder up to
/// 1.0 is the probability of a no-op draw. All knobs are validated once by
/// [`SamplerSettings::validate`] before the sampling loop starts; the hot
/// path assumes a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerSettings {
    /// Birth proposal weight.
    pub p_birth: f64,
    /// Death proposal weight.
    pub p_death: f64,
    /// Random shift proposal weight.
    pub p_shift: f64,
    /// Optimal shift proposal weight.
    pub p_opt_shift: f64,
    /// Connect proposal weight.
    pub p_connect: f64,
    /// Prior particle intensity: the expected particle count of the domain
    /// under a flat energy. Baseline of the birth/death acceptance ratios.
    pub density: f64,
    /// Per-axis standard deviation of random position perturbations.
    pub sigma_pos: f64,
    /// Per-axis standard deviation of random direction perturbations.
    pub sigma_dir: f64,
    /// Half-length of a track segment; an end sits at centre +/- half_len.
    pub segment_half_len: f64,
    /// Total proposal budget across all workers.
    pub iterations: u64,
    /// Worker thread count.
    pub workers: usize,
    /// Base RNG seed; per-worker streams derive from it.
    pub seed: u64,
    /// Annealing start temperature.
    pub t_start: f64,
    /// Annealing end temperature.
    pub t_end: f64,
    /// Minimum particles per extracted track.
    pub min_track_particles: usize,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            p_birth: 0.25,
            p_death: 0.05,
            p_shift: 0.15,
            p_opt_shift: 0.10,
            p_connect: 0.45,
            density: 100.0,
            sigma_pos: 0.25,
            sigma_dir: 0.25,
            segment_half_len: 1.0,
            iterations: 100_000,
            workers: 1,
            seed: 0,
            t_start: 1.0,
            t_end: 1.0,
            min_track_particles: 2,
        }
    }
}

impl SamplerSettings {
    /// Check every knob once, before the run. Returns the first problem
    /// found.
    pub fn validate(&self) -> Result<(), String> {
        let weights = [
            ("p_birth", self.p_birth),
            ("p_death", self.p_death),
            ("p_shift", self.p_shift),
            ("p_opt_shift", self.p_opt_shift),
            ("p_connect", self.p_connect),
        ];
        for (name, w) in weights {
            if !(0.0..=1.0).contains(&w) || !w.is_finite() {
                return Err(format!(
                    "Proposal weight {} must lie in [0, 1], got {}",
                    name, w
                ));
            }
        }
        let sum = self.weight_sum();
        if sum <= 0.0 {
            return Err(format!(
                "Proposal weights must sum to a positive value, got {}",
                sum
            ));
        }
        if sum > 1.0 + 1e-12 {
            return Err(format!(
                "Proposal weights must sum to at most 1.0, got {}",
                sum
            ));
        }
        if self.density <= 0.0 || !self.density.is_finite() {
            return Err(format!("density must be positive, got {}", self.density));
        }
        if self.sigma_pos <= 0.0 || !self.sigma_pos.is_finite() {
            return Err(format!("sigma_pos must be positive, got {}", self.sigma_pos));
        }
        if self.sigma_dir <= 0.0 || !self.sigma_dir.is_finite() {
            return Err(format!("sigma_dir must be positive, got {}", self.sigma_dir));
        }
        if self.segment_half_len <= 0.0 || !self.segment_half_len.is_finite() {
            return Err(format!(
                "segment_half_len must be positive, got {}",
                self.segment_half_len
            ));
        }
        if self.iterations == 0 {
            return Err("iterations must be positive".to_string());
        }
        if self.workers == 0 {
            return Err("workers must be positive".to_string());
        }
        if self.t_start <= 0.0 || self.t_end <= 0.0 {
            return Err(format!(
                "Annealing temperatures must be positive, got t_start={} t_end={}",
                self.t_start, self.t_end
            ));
        }
        Ok(())
    }

    pub fn weight_sum(&self) -> f64 {
        self.p_birth + self.p_death + self.p_shift + self.p_opt_shift + self.p_connect
    }

    /// Cumulative move-weight partition of [0, 1): a uniform draw below
    /// entry k selects move kind k; a draw above the last entry is a no-op.
    pub(crate) fn move_partition(&self) -> [f64; 5] {
        let mut edges = [0.0; 5];
        let mut acc = 0.0;
        for (slot, w) in [
            self.p_birth,
            self.p_death,
            self.p_shift,
            self.p_opt_shift,
            self.p_connect,
        ]
        .into_iter()
        .enumerate()
        {
            acc += w;
            edges[slot] = acc;
        }
        edges
    }

    /// Annealing temperature at a given progress in [0, 1]: exponential
    /// interpolation from `t_start` to `t_end`.
    pub fn temperature_at(&self, progress: f64) -> f64 {
        let p = progress.clamp(0.0, 1.0);
        self.t_start * (self.t_end / self.t_start).powf(p)
    }

    /// Load and validate settings from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self, String> {
        let file = File::open(path)
            .map_err(|e| format!("Cannot open settings file {}: {}", path.display(), e))?;
        let settings: SamplerSettings = serde_json::from_reader(file)
            .map_err(|e| format!("Cannot parse settings file {}: {}", path.display(), e))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Dump the settings of a run as pretty JSON next to its outputs.
    pub fn write_json(&self, path: &Path) -> Result<(), String> {
        let file = File::create(path)
            .map_err(|e| format!("Cannot create settings file {}: {}", path.display(), e))?;
        serde_json::to_writer_pretty(file, self)
            .map_err(|e| format!("Cannot write settings file {}: {}", path.display(), e))
    }
}
