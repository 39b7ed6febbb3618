// Per-move proposal statistics and the shared stopping rule.
//
// Counters are atomics so all workers record into one instance; the
// iteration budget is drained through `next()`, the sampling loops' only
// exit path.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// The five proposal kinds of the sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MoveKind {
    Birth,
    Death,
    RandomShift,
    OptimalShift,
    Connect,
}

impl MoveKind {
    pub const ALL: [MoveKind; 5] = [
        MoveKind::Birth,
        MoveKind::Death,
        MoveKind::RandomShift,
        MoveKind::OptimalShift,
        MoveKind::Connect,
    ];

    pub fn label(self) -> &'static str {
        match self {
            MoveKind::Birth => "birth",
            MoveKind::Death => "death",
            MoveKind::RandomShift => "randshift",
            MoveKind::OptimalShift => "optshift",
            MoveKind::Connect => "connect",
        }
    }

    fn slot(self) -> usize {
        match self {
            MoveKind::Birth => 0,
            MoveKind::Death => 1,
            MoveKind::RandomShift => 2,
            MoveKind::OptimalShift => 3,
            MoveKind::Connect => 4,
        }
    }
}

/// Shared proposal/acceptance counters plus the iteration budget.
pub struct SamplerStats {
    attempted: [AtomicU64; 5],
    accepted: [AtomicU64; 5],
    budget: u64,
    remaining: AtomicU64,
}

impl SamplerStats {
    pub fn new(iterations: u64) -> Self {
        Self {
            attempted: Default::default(),
            accepted: Default::default(),
            budget: iterations,
            remaining: AtomicU64::new(iterations),
        }
    }

    /// Claim one iteration from the shared budget. Returns false once the
    /// budget is exhausted; the worker loop must then stop.
    pub fn next(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Fraction of the budget consumed so far, in [0, 1].
    pub fn progress(&self) -> f64 {
        if self.budget == 0 {
            return 1.0;
        }
        let remaining = self.remaining.load(Ordering::Relaxed);
        (self.budget - remaining) as f64 / self.budget as f64
    }

    pub fn record_attempt(&self, kind: MoveKind) {
        self.attempted[kind.slot()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_accept(&self, kind: MoveKind) {
        self.accepted[kind.slot()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn attempted(&self, kind: MoveKind) -> u64 {
        self.attempted[kind.slot()].load(Ordering::Relaxed)
    }

    pub fn accepted(&self, kind: MoveKind) -> u64 {
        self.accepted[kind.slot()].load(Ordering::Relaxed)
    }

    pub fn acceptance_rate(&self, kind: MoveKind) -> f64 {
        let attempted = self.attempted(kind);
        if attempted == 0 {
            0.0
        } else {
            self.accepted(kind) as f64 / attempted as f64
        }
    }

    /// Snapshot of the counters for reporting.
    pub fn summary(&self, particles: usize) -> Summary {
        let moves = MoveKind::ALL
            .iter()
            .map(|&kind| MoveSummary {
                kind: kind.label(),
                attempted: self.attempted(kind),
                accepted: self.accepted(kind),
                acceptance_rate: self.acceptance_rate(kind),
            })
            .collect();
        Summary { moves, particles }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MoveSummary {
    pub kind: &'static str,
    pub attempted: u64,
    pub accepted: u64,
    pub acceptance_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub moves: Vec<MoveSummary>,
    pub particles: usize,
}

impl Summary {
    pub fn total_attempted(&self) -> u64 {
        self.moves.iter().map(|m| m.attempted).sum()
    }

    pub fn total_accepted(&self) -> u64 {
        self.moves.iter().map(|m| m.accepted).sum()
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Sampling summary ===")?;
        for m in &self.moves {
            writeln!(
                f,
                "{:<10} {:>10} / {:<10} ({:.2}% accepted)",
                m.kind,
                m.accepted,
                m.attempted,
                100.0 * m.acceptance_rate
            )?;
        }
        write!(f, "particles: {}", self.particles)
    }
}
