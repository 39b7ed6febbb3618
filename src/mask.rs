// Processing-domain mask: a binary voxel volume in scanner coordinates.
// Proposals outside the mask are rejected before any energy evaluation.

use rand::Rng;

/// Binary 3D volume delimiting the valid tracking domain.
///
/// `origin` is the world position of the corner of voxel (0, 0, 0); voxel
/// (i, j, k) covers the half-open box `origin + [i, i+1) * spacing` per
/// axis. A voxel with a nonzero value is inside the domain.
#[derive(Debug, Clone)]
pub struct TrackingMask {
    dims: [usize; 3],
    spacing: [f64; 3],
    origin: [f64; 3],
    data: Vec<u8>,
    /// Linear indices of inside voxels, for uniform position sampling.
    inside: Vec<u32>,
}

impl TrackingMask {
    pub fn new(
        dims: [usize; 3],
        spacing: [f64; 3],
        origin: [f64; 3],
        data: Vec<u8>,
    ) -> Result<Self, String> {
        let n = dims[0] * dims[1] * dims[2];
        if n == 0 {
            return Err(format!(
                "Mask dimensions must all be positive, got {:?}",
                dims
            ));
        }
        if data.len() != n {
            return Err(format!(
                "Mask data length {} does not match dimensions {:?} ({} voxels)",
                data.len(),
                dims,
                n
            ));
        }
        if spacing.iter().any(|&s| s <= 0.0 || !s.is_finite()) {
            return Err(format!(
                "Mask voxel spacing must be positive and finite, got {:?}",
                spacing
            ));
        }
        let inside = data
            .iter()
            .enumerate()
            .filter(|(_, &v)| v != 0)
            .map(|(i, _)| i as u32)
            .collect();
        Ok(Self {
            dims,
            spacing,
            origin,
            data,
            inside,
        })
    }

    /// Build a mask from a predicate over voxel-centre world coordinates.
    pub fn from_fn<F>(
        dims: [usize; 3],
        spacing: [f64; 3],
        origin: [f64; 3],
        f: F,
    ) -> Result<Self, String>
    where
        F: Fn([f64; 3]) -> bool,
    {
        let mut data = vec![0u8; dims[0] * dims[1] * dims[2]];
        for k in 0..dims[2] {
            for j in 0..dims[1] {
                for i in 0..dims[0] {
                    let centre = [
                        origin[0] + (i as f64 + 0.5) * spacing[0],
                        origin[1] + (j as f64 + 0.5) * spacing[1],
                        origin[2] + (k as f64 + 0.5) * spacing[2],
                    ];
                    if f(centre) {
                        data[(k * dims[1] + j) * dims[0] + i] = 1;
                    }
                }
            }
        }
        Self::new(dims, spacing, origin, data)
    }

    /// Mask covering the entire volume.
    pub fn filled(dims: [usize; 3], spacing: [f64; 3], origin: [f64; 3]) -> Result<Self, String> {
        let data = vec![1u8; dims[0] * dims[1] * dims[2]];
        Self::new(dims, spacing, origin, data)
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub fn spacing(&self) -> [f64; 3] {
        self.spacing
    }

    pub fn origin(&self) -> [f64; 3] {
        self.origin
    }

    /// World-space bounding box of the whole volume (inside and outside
    /// voxels alike).
    pub fn bounds(&self) -> ([f64; 3], [f64; 3]) {
        let mut max = self.origin;
        for axis in 0..3 {
            max[axis] += self.dims[axis] as f64 * self.spacing[axis];
        }
        (self.origin, max)
    }

    /// Voxel index containing a world position, or None if out of bounds.
    pub fn voxel_of(&self, position: [f64; 3]) -> Option<[usize; 3]> {
        let mut voxel = [0usize; 3];
        for axis in 0..3 {
            let t = (position[axis] - self.origin[axis]) / self.spacing[axis];
            if t < 0.0 {
                return None;
            }
            let i = t as usize;
            if i >= self.dims[axis] {
                return None;
            }
            voxel[axis] = i;
        }
        Some(voxel)
    }

    /// Whether a world position lies on an inside voxel.
    pub fn contains(&self, position: [f64; 3]) -> bool {
        match self.voxel_of(position) {
            Some([i, j, k]) => self.data[(k * self.dims[1] + j) * self.dims[0] + i] != 0,
            None => false,
        }
    }

    /// Number of inside voxels.
    pub fn inside_voxels(&self) -> usize {
        self.inside.len()
    }

    /// Total inside volume in world units.
    pub fn volume(&self) -> f64 {
        self.inside.len() as f64 * self.spacing[0] * self.spacing[1] * self.spacing[2]
    }

    /// Sample a position uniformly over the inside region: a uniform inside
    /// voxel, then a uniform point within it. None if the mask is empty.
    pub fn random_position<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<[f64; 3]> {
        if self.inside.is_empty() {
            return None;
        }
        let linear = self.inside[rng.gen_range(0..self.inside.len())] as usize;
        let i = linear % self.dims[0];
        let j = (linear / self.dims[0]) % self.dims[1];
        let k = linear / (self.dims[0] * self.dims[1]);
        Some([
            self.origin[0] + (i as f64 + rng.gen::<f64>()) * self.spacing[0],
            self.origin[1] + (j as f64 + rng.gen::<f64>()) * self.spacing[1],
            self.origin[2] + (k as f64 + rng.gen::<f64>()) * self.spacing[2],
        ])
    }
}
