// Boundary to the external energy functional.
//
// The model evaluates each proposed graph edit as a staged change (an
// energy delta against its internal accumulated energy) and later commits
// or discards it. Staged state is per calling worker; a worker never holds
// two staged changes at once. `EnergyTxn` pins that protocol down in the
// type system: one staged evaluation, then exactly one commit or discard
// (dropping the transaction discards).

use crate::grid::ParticleGrid;
use crate::particle::{ParticleEnd, ParticleKey};

/// Result of staging a connect proposal: the energy delta plus the partner
/// end the model wants to link to. No partner means the link at the
/// queried end, if any, should be removed.
#[derive(Debug, Clone, Copy)]
pub struct ConnectOutcome {
    pub delta: f64,
    pub partner: Option<ParticleEnd>,
}

/// External energy model consumed by the sampler.
///
/// Contract: exactly one `stage_*` call occurs per `accept_staged` /
/// `discard_staged` pair, staged state is keyed by calling thread, and the
/// grid passed to a staged call is not mutated before the matching accept
/// or discard.
pub trait EnergyModel: Sync {
    /// Energy delta of adding a particle at `position` / `direction`.
    fn stage_birth(&self, grid: &ParticleGrid, position: [f64; 3], direction: [f64; 3]) -> f64;

    /// Energy delta of removing `key`.
    fn stage_death(&self, grid: &ParticleGrid, key: ParticleKey) -> f64;

    /// Energy delta of moving `key` to the given position and direction.
    fn stage_shift(
        &self,
        grid: &ParticleGrid,
        key: ParticleKey,
        position: [f64; 3],
        direction: [f64; 3],
    ) -> f64;

    /// Evaluate a link edit at `end`, proposing the best partner (or none,
    /// meaning: drop the existing link).
    fn stage_connect(&self, grid: &ParticleGrid, end: ParticleEnd) -> ConnectOutcome;

    /// Fold the staged change into the accumulated energy.
    fn accept_staged(&self);

    /// Drop the staged change, restoring the prior accumulated energy.
    fn discard_staged(&self);
}

/// RAII wrapper enforcing the stage/accept/discard protocol for one
/// proposal. At most one staged evaluation per transaction; dropping an
/// uncommitted transaction discards the staged change.
pub struct EnergyTxn<'a, E: EnergyModel + ?Sized> {
    model: &'a E,
    staged: bool,
}

impl<'a, E: EnergyModel + ?Sized> EnergyTxn<'a, E> {
    pub fn begin(model: &'a E) -> Self {
        Self {
            model,
            staged: false,
        }
    }

    fn mark_staged(&mut self) {
        debug_assert!(!self.staged, "a transaction stages at most one change");
        self.staged = true;
    }

    pub fn birth(
        &mut self,
        grid: &ParticleGrid,
        position: [f64; 3],
        direction: [f64; 3],
    ) -> f64 {
        self.mark_staged();
        self.model.stage_birth(grid, position, direction)
    }

    pub fn death(&mut self, grid: &ParticleGrid, key: ParticleKey) -> f64 {
        self.mark_staged();
        self.model.stage_death(grid, key)
    }

    pub fn shift(
        &mut self,
        grid: &ParticleGrid,
        key: ParticleKey,
        position: [f64; 3],
        direction: [f64; 3],
    ) -> f64 {
        self.mark_staged();
        self.model.stage_shift(grid, key, position, direction)
    }

    pub fn connect(&mut self, grid: &ParticleGrid, end: ParticleEnd) -> ConnectOutcome {
        self.mark_staged();
        self.model.stage_connect(grid, end)
    }

    /// Commit the staged change. A transaction that never staged is a no-op.
    pub fn commit(mut self) {
        if self.staged {
            self.staged = false;
            self.model.accept_staged();
        }
    }
}

impl<'a, E: EnergyModel + ?Sized> Drop for EnergyTxn<'a, E> {
    fn drop(&mut self) {
        if self.staged {
            self.model.discard_staged();
        }
    }
}

/// Energy model with zero delta for every edit and no connect partners.
/// Useful for calibration runs and as the sampler's test harness: every
/// mask-valid proposal is accepted with probability governed purely by the
/// dimensional prior terms.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEnergy;

impl EnergyModel for NullEnergy {
    fn stage_birth(&self, _grid: &ParticleGrid, _position: [f64; 3], _direction: [f64; 3]) -> f64 {
        0.0
    }

    fn stage_death(&self, _grid: &ParticleGrid, _key: ParticleKey) -> f64 {
        0.0
    }

    fn stage_shift(
        &self,
        _grid: &ParticleGrid,
        _key: ParticleKey,
        _position: [f64; 3],
        _direction: [f64; 3],
    ) -> f64 {
        0.0
    }

    fn stage_connect(&self, _grid: &ParticleGrid, _end: ParticleEnd) -> ConnectOutcome {
        ConnectOutcome {
            delta: 0.0,
            partner: None,
        }
    }

    fn accept_staged(&self) {}

    fn discard_staged(&self) {}
}
