//! Vivaldi network coordinates.
//!
//! An online, decentralized embedding that moves each node's synthetic
//! coordinate a little with every RTT sample, so that Euclidean distance
//! plus heights approximates round-trip latency (Dabek et al., SIGCOMM '04;
//! the force application follows Hashicorp Serf's implementation).

use rand::Rng;
use rand_distr::StandardNormal;

use crate::network::types::Node;

/// Dimensionality of the coordinate space.
pub const DIMENSIONS: usize = 8;

/// Weight of the latest sample error when updating a node's confidence.
const CE: f64 = 0.9;
/// Modulates the force pulling a coordinate toward its measured distance.
const CC: f64 = 0.25;
const MAX_ERROR: f64 = 1.5;
const MIN_HEIGHT: f64 = 1e-5;
/// Heights never drop below this after an update.
const HEIGHT_FLOOR: f64 = 1e-3;

/// A node's position in the coordinate space, with the height and local
/// error terms of the Vivaldi model. Distances are RTT estimates in
/// milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct VivaldiCoordinate {
    /// Position in the embedding space.
    pub position: [f64; DIMENSIONS],
    /// Models the constant access-link cost that no position can express.
    pub height: f64,
    /// Local confidence in `(0, 1.5]`; lower is better.
    pub error: f64,
    /// Number of updates applied to this coordinate.
    pub runs: u64,
}

impl Default for VivaldiCoordinate {
    fn default() -> Self {
        Self {
            position: [0.0; DIMENSIONS],
            height: MIN_HEIGHT,
            error: MAX_ERROR,
            runs: 0,
        }
    }
}

impl VivaldiCoordinate {
    /// A coordinate at the origin with maximal error.
    pub fn new() -> Self {
        Self::default()
    }

    /// Predicted RTT to `other` in milliseconds.
    pub fn distance_to(&self, other: &Self) -> f64 {
        norm(&sub(&self.position, &other.position)) + self.height + other.height
    }

    fn apply_force<R: Rng + ?Sized>(&mut self, force: f64, other: &Self, rng: &mut R) {
        let (unit, magnitude) = unit_vector_at(&self.position, &other.position, rng);
        for (p, u) in self.position.iter_mut().zip(unit) {
            *p += u * force;
        }
        if magnitude > 0.0 {
            self.height += (self.height + other.height) * force / magnitude;
            self.height = self.height.max(HEIGHT_FLOOR);
        }
    }
}

fn sub(a: &[f64; DIMENSIONS], b: &[f64; DIMENSIONS]) -> [f64; DIMENSIONS] {
    let mut out = [0.0; DIMENSIONS];
    for i in 0..DIMENSIONS {
        out[i] = a[i] - b[i];
    }
    out
}

fn norm(v: &[f64; DIMENSIONS]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

/// Unit vector pointing at `a` from `b`. Coinciding positions yield a random
/// direction and a reported magnitude of zero.
fn unit_vector_at<R: Rng + ?Sized>(
    a: &[f64; DIMENSIONS],
    b: &[f64; DIMENSIONS],
    rng: &mut R,
) -> ([f64; DIMENSIONS], f64) {
    let mut diff = sub(a, b);
    let magnitude = norm(&diff);
    if magnitude > 0.0 {
        for d in &mut diff {
            *d /= magnitude;
        }
        return (diff, magnitude);
    }
    let mut random = [0.0; DIMENSIONS];
    for d in &mut random {
        *d = rng.sample(StandardNormal);
    }
    let magnitude = norm(&random);
    for d in &mut random {
        *d /= magnitude;
    }
    (random, 0.0)
}

/// Applies one Vivaldi update to `node` from an RTT sample (milliseconds)
/// against `other`. Coordinates are initialized on first use; non-positive
/// samples are ignored.
pub fn execute<R: Rng + ?Sized>(node: &mut Node, other: &mut Node, rtt: f64, rng: &mut R) {
    if rtt <= 0.0 {
        return;
    }
    let other = other.coordinate.get_or_insert_with(VivaldiCoordinate::new);
    let coord = node.coordinate.get_or_insert_with(VivaldiCoordinate::new);

    // the sample weight balances local and remote confidence
    let weight = coord.error / (coord.error + other.error);
    let old_distance = coord.distance_to(other);
    let sample_error = (old_distance - rtt).abs() / rtt;
    coord.error = (sample_error * CE * weight + coord.error * (1.0 - CE * weight)).min(MAX_ERROR);
    let force = CC * weight * (rtt - old_distance);
    coord.apply_force(force, other, rng);
    coord.runs += 1;
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    use super::*;

    /// Four nodes on a square: sides 10 ms, diagonals ~14.14 ms.
    fn square_rtt(i: usize, j: usize) -> f64 {
        let coords = [(0.0_f64, 0.0_f64), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)];
        let (xi, yi) = coords[i];
        let (xj, yj) = coords[j];
        (xi - xj).hypot(yi - yj)
    }

    #[test]
    fn converges_on_a_square() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut nodes: Vec<Node> = (0..4).map(|i| Node::new(format!("n{i}"))).collect();
        let mut pairs: Vec<(usize, usize)> =
            (0..4_usize).permutations(2).map(|p| (p[0], p[1])).collect();

        let mut updates = 0;
        while updates < 300 {
            pairs.shuffle(&mut rng);
            for &(i, j) in &pairs {
                if updates >= 300 {
                    break;
                }
                let (lo, hi) = (i.min(j), i.max(j));
                let (left, right) = nodes.split_at_mut(hi);
                let (a, b) = if i < j {
                    (&mut left[lo], &mut right[0])
                } else {
                    (&mut right[0], &mut left[lo])
                };
                execute(a, b, square_rtt(i, j), &mut rng);
                updates += 1;
            }
        }

        let mut squared = 0.0;
        let mut count = 0;
        for (i, j) in (0..4_usize).tuple_combinations() {
            let predicted = nodes[i]
                .coordinate
                .as_ref()
                .unwrap()
                .distance_to(nodes[j].coordinate.as_ref().unwrap());
            squared += (predicted - square_rtt(i, j)).powi(2);
            count += 1;
        }
        let rms = (squared / count as f64).sqrt();
        assert!(rms < 2.0, "rms error too high: {rms:.3} ms");
    }

    #[test]
    fn error_and_height_stay_in_bounds() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut a = Node::new("a");
        let mut b = Node::new("b");
        for _ in 0..50 {
            execute(&mut a, &mut b, 25.0, &mut rng);
            execute(&mut b, &mut a, 25.0, &mut rng);
            for node in [&a, &b] {
                let coord = node.coordinate.as_ref().unwrap();
                assert!(coord.error > 0.0 && coord.error <= 1.5);
            }
        }
        // once positions separate, every further update floors the height
        for node in [&a, &b] {
            assert!(node.coordinate.as_ref().unwrap().height >= 1e-3);
        }
    }

    #[test]
    fn non_positive_samples_are_ignored() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut a = Node::new("a");
        let mut b = Node::new("b");
        execute(&mut a, &mut b, 0.0, &mut rng);
        assert!(a.coordinate.is_none());
    }

    #[test]
    fn fresh_coordinates_start_at_the_origin() {
        let coord = VivaldiCoordinate::new();
        assert_eq!(coord.position, [0.0; DIMENSIONS]);
        assert_eq!(coord.error, 1.5);
        assert!(coord.height > 0.0);
        assert_eq!(coord.runs, 0);
    }

    #[test]
    fn distance_includes_both_heights() {
        let mut a = VivaldiCoordinate::new();
        let mut b = VivaldiCoordinate::new();
        a.position[0] = 3.0;
        b.position[0] = -1.0;
        a.height = 0.5;
        b.height = 0.25;
        approx::assert_relative_eq!(a.distance_to(&b), 4.75);
    }
}
