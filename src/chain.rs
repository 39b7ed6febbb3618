// Track extraction: maximal chains of linked particles become endpoint
// polylines. The particle graph may contain cycles (the connect move does
// not prevent them), so every walk is bounded by a visited set; a cyclic
// chain yields a track that stops where it would close on itself.

use std::collections::HashSet;

use crate::grid::ParticleGrid;
use crate::particle::{ParticleEnd, ParticleKey, SegmentEnd};

/// Walk every maximal chain in the grid into a polyline of segment
/// endpoints, skipping chains with fewer than `min_particles` particles.
pub fn extract_tracks(
    grid: &ParticleGrid,
    half_len: f64,
    min_particles: usize,
) -> Vec<Vec<[f64; 3]>> {
    let keys = grid.keys();
    let mut visited: HashSet<ParticleKey> = HashSet::with_capacity(keys.len());
    let mut tracks = Vec::new();

    // Chains with a free end first, entered from that end.
    for &key in &keys {
        if visited.contains(&key) {
            continue;
        }
        let particle = match grid.get(key) {
            Some(p) => p,
            None => continue,
        };
        let entry = if particle.predecessor.is_none() {
            SegmentEnd::Tail
        } else if particle.successor.is_none() {
            SegmentEnd::Head
        } else {
            continue;
        };
        let (points, particles) = walk(grid, ParticleEnd::new(key, entry), half_len, &mut visited);
        if particles >= min_particles {
            tracks.push(points);
        }
    }

    // Anything left unvisited sits on a cycle; walk it from an arbitrary
    // entry until the cycle closes.
    for &key in &keys {
        if visited.contains(&key) || grid.get(key).is_none() {
            continue;
        }
        let (points, particles) =
            walk(grid, ParticleEnd::new(key, SegmentEnd::Tail), half_len, &mut visited);
        if particles >= min_particles {
            tracks.push(points);
        }
    }

    tracks
}

/// Follow links from `start`, emitting each particle's entry endpoint then
/// exit endpoint. Stops at a free end or when the walk would revisit a
/// particle.
fn walk(
    grid: &ParticleGrid,
    start: ParticleEnd,
    half_len: f64,
    visited: &mut HashSet<ParticleKey>,
) -> (Vec<[f64; 3]>, usize) {
    let mut points = Vec::new();
    let mut particles = 0;
    let mut current = start;
    loop {
        if !visited.insert(current.key) {
            break;
        }
        let particle = match grid.get(current.key) {
            Some(p) => p,
            None => break,
        };
        let exit = current.end.opposite();
        points.push(particle.endpoint(current.end, half_len));
        points.push(particle.endpoint(exit, half_len));
        particles += 1;
        match particle.link_at(exit) {
            Some(next) => current = next,
            None => break,
        }
    }
    (points, particles)
}
