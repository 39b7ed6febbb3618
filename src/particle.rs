use crate::math;

/// Stable handle to a particle slot in the grid arena.
///
/// The generation counter distinguishes a live particle from a later reuse
/// of the same slot, so a key held across a removal resolves to nothing
/// instead of to an unrelated particle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParticleKey {
    index: u32,
    generation: u32,
}

impl ParticleKey {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }
}

/// One of the two ends of a track segment.
///
/// `Head` is the end the direction vector points toward, `Tail` the
/// opposite end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentEnd {
    Head,
    Tail,
}

impl SegmentEnd {
    pub fn opposite(self) -> Self {
        match self {
            SegmentEnd::Head => SegmentEnd::Tail,
            SegmentEnd::Tail => SegmentEnd::Head,
        }
    }

    /// Sign of the offset from the segment centre toward this end.
    pub fn sign(self) -> f64 {
        match self {
            SegmentEnd::Head => 1.0,
            SegmentEnd::Tail => -1.0,
        }
    }
}

/// A specific end of a specific particle; the unit of link addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParticleEnd {
    pub key: ParticleKey,
    pub end: SegmentEnd,
}

impl ParticleEnd {
    pub fn new(key: ParticleKey, end: SegmentEnd) -> Self {
        Self { key, end }
    }
}

/// One directed track segment: a centre position, a unit orientation, and
/// up to one link at each end. A maximal chain of linked particles is a
/// candidate streamline.
#[derive(Debug, Clone, Copy)]
pub struct Particle {
    pub position: [f64; 3],
    pub direction: [f64; 3],
    /// Link attached at the tail end.
    pub predecessor: Option<ParticleEnd>,
    /// Link attached at the head end.
    pub successor: Option<ParticleEnd>,
}

impl Particle {
    pub fn new(position: [f64; 3], direction: [f64; 3]) -> Self {
        Self {
            position,
            direction,
            predecessor: None,
            successor: None,
        }
    }

    /// Spatial location of the given end for segments of half-length
    /// `half_len`.
    pub fn endpoint(&self, end: SegmentEnd, half_len: f64) -> [f64; 3] {
        math::add_scaled(self.position, end.sign() * half_len, self.direction)
    }

    pub fn link_at(&self, end: SegmentEnd) -> Option<ParticleEnd> {
        match end {
            SegmentEnd::Head => self.successor,
            SegmentEnd::Tail => self.predecessor,
        }
    }

    pub fn set_link(&mut self, end: SegmentEnd, link: Option<ParticleEnd>) {
        match end {
            SegmentEnd::Head => self.successor = link,
            SegmentEnd::Tail => self.predecessor = link,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.predecessor.is_some() || self.successor.is_some()
    }
}
