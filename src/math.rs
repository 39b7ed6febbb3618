// Small-vector helpers for particle positions and orientations.
//
// Particle state is stored as plain [f64; 3]; geometry-heavy helpers go
// through nalgebra at the boundary.

use nalgebra::Vector3;
use rand::Rng;
use rand_distr::StandardNormal;

#[inline]
pub fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
pub fn norm(v: [f64; 3]) -> f64 {
    dot(v, v).sqrt()
}

#[inline]
pub fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

/// a + s * b
#[inline]
pub fn add_scaled(a: [f64; 3], s: f64, b: [f64; 3]) -> [f64; 3] {
    [a[0] + s * b[0], a[1] + s * b[1], a[2] + s * b[2]]
}

#[inline]
pub fn midpoint(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        0.5 * (a[0] + b[0]),
        0.5 * (a[1] + b[1]),
        0.5 * (a[2] + b[2]),
    ]
}

/// Normalise to unit length. Returns None for a (near-)zero vector.
#[inline]
pub fn try_normalize(v: [f64; 3]) -> Option<[f64; 3]> {
    let n2 = dot(v, v);
    if n2 <= f64::EPSILON {
        return None;
    }
    let inv = 1.0 / n2.sqrt();
    Some([v[0] * inv, v[1] * inv, v[2] * inv])
}

/// Unit vector pointing from `a` to `b`. None if the points coincide.
#[inline]
pub fn direction_between(a: [f64; 3], b: [f64; 3]) -> Option<[f64; 3]> {
    let d = Vector3::from(b) - Vector3::from(a);
    let n = d.norm();
    if n <= f64::EPSILON {
        return None;
    }
    let u = d / n;
    Some([u.x, u.y, u.z])
}

/// Sample a uniformly distributed unit direction.
///
/// mu = cos(polar angle) uniform in [-1, 1], azimuth uniform in [0, 2pi).
pub fn random_unit_vector<R: Rng + ?Sized>(rng: &mut R) -> [f64; 3] {
    let mu = 2.0 * rng.gen::<f64>() - 1.0;
    let phi = 2.0 * std::f64::consts::PI * rng.gen::<f64>();
    let sin_theta = (1.0 - mu * mu).sqrt();
    [sin_theta * phi.cos(), sin_theta * phi.sin(), mu]
}

/// Independent zero-mean Gaussian offset with standard deviation `sigma`
/// per axis.
pub fn gaussian_offset<R: Rng + ?Sized>(rng: &mut R, sigma: f64) -> [f64; 3] {
    [
        sigma * rng.sample::<f64, _>(StandardNormal),
        sigma * rng.sample::<f64, _>(StandardNormal),
        sigma * rng.sample::<f64, _>(StandardNormal),
    ]
}

#[inline]
fn normal_pdf(x: f64, sigma: f64) -> f64 {
    let z = x / sigma;
    (-0.5 * z * z).exp() / (sigma * (2.0 * std::f64::consts::PI).sqrt())
}

/// Density of the random-shift kernel producing (`to_pos`, `to_dir`) from
/// (`from_pos`, `from_dir`): the product of the per-axis Gaussian densities
/// of the position and direction offsets.
pub fn shift_proposal_density(
    from_pos: [f64; 3],
    from_dir: [f64; 3],
    to_pos: [f64; 3],
    to_dir: [f64; 3],
    sigma_pos: f64,
    sigma_dir: f64,
) -> f64 {
    let dp = sub(to_pos, from_pos);
    let dd = sub(to_dir, from_dir);
    let mut density = 1.0;
    for axis in 0..3 {
        density *= normal_pdf(dp[axis], sigma_pos);
        density *= normal_pdf(dd[axis], sigma_dir);
    }
    density
}
