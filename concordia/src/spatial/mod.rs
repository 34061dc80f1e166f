//! Spatial index for nearest-neighbour queries on spot and bead positions.

use std::cmp::Ordering;

use glam::DVec3;
use hashbrown::HashMap;


/// A 3-D k-d tree over a fixed point set.
///
/// Queries are deterministic: among equidistant points the one with the
/// lowest input index wins, and result lists are ordered by
/// (distance, index).
#[derive(Debug)]
pub struct KdTree {
    nodes: Vec<KdNode>,
    points: Vec<DVec3>,
}

#[derive(Debug, Clone)]
struct KdNode {
    /// Index into the points array
    point_idx: usize,
    left: Option<usize>,
    right: Option<usize>,
    split_dim: usize,
}

impl KdTree {
    /// Builds a balanced tree by median splits. `None` for an empty set.
    pub fn build(points: &[DVec3]) -> Option<Self> {
        if points.is_empty() {
            return None;
        }

        let points = points.to_vec();
        let mut indices: Vec<usize> = (0..points.len()).collect();
        let mut nodes = Vec::with_capacity(points.len());
        Self::build_recursive(&points, &mut indices, 0, &mut nodes);

        Some(Self { nodes, points })
    }

    fn build_recursive(
        points: &[DVec3],
        indices: &mut [usize],
        depth: usize,
        nodes: &mut Vec<KdNode>,
    ) -> Option<usize> {
        if indices.is_empty() {
            return None;
        }

        let split_dim = depth % 3;
        indices.sort_by(|&a, &b| {
            points[a][split_dim]
                .total_cmp(&points[b][split_dim])
                .then(a.cmp(&b))
        });

        let median = indices.len() / 2;
        let node_idx = nodes.len();
        nodes.push(KdNode {
            point_idx: indices[median],
            left: None,
            right: None,
            split_dim,
        });

        let (left_indices, right_part) = indices.split_at_mut(median);
        let left = Self::build_recursive(points, left_indices, depth + 1, nodes);
        let right = Self::build_recursive(points, &mut right_part[1..], depth + 1, nodes);

        nodes[node_idx].left = left;
        nodes[node_idx].right = right;
        Some(node_idx)
    }

    /// Nearest point to `query` as (index, squared distance).
    pub fn nearest(&self, query: DVec3) -> Option<(usize, f64)> {
        let mut best = None;
        self.nearest_recursive(0, query, &mut best);
        best
    }

    fn nearest_recursive(&self, node_idx: usize, query: DVec3, best: &mut Option<(usize, f64)>) {
        let node = &self.nodes[node_idx];
        let point = self.points[node.point_idx];

        let candidate = (node.point_idx, query.distance_squared(point));
        let closer = match *best {
            None => true,
            Some(current) => compare_hits(&candidate, &current) == Ordering::Less,
        };
        if closer {
            *best = Some(candidate);
        }

        let diff = query[node.split_dim] - point[node.split_dim];
        let (first, second) = if diff < 0.0 {
            (node.left, node.right)
        } else {
            (node.right, node.left)
        };

        if let Some(first_idx) = first {
            self.nearest_recursive(first_idx, query, best);
        }

        // Equal distances may still hide a lower index on the far side.
        if let Some(second_idx) = second {
            let bound = best.map_or(f64::INFINITY, |(_, d)| d);
            if diff * diff <= bound {
                self.nearest_recursive(second_idx, query, best);
            }
        }
    }

    /// All points within `radius` of `query`, ordered by (distance, index).
    pub fn radius_search(&self, query: DVec3, radius: f64) -> Vec<(usize, f64)> {
        let radius_sq = radius * radius;
        let mut results = Vec::new();
        self.radius_search_recursive(0, query, radius_sq, &mut results);
        results.sort_by(compare_hits);
        results
    }

    fn radius_search_recursive(
        &self,
        node_idx: usize,
        query: DVec3,
        radius_sq: f64,
        results: &mut Vec<(usize, f64)>,
    ) {
        let node = &self.nodes[node_idx];
        let point = self.points[node.point_idx];

        let dist_sq = query.distance_squared(point);
        if dist_sq <= radius_sq {
            results.push((node.point_idx, dist_sq));
        }

        let diff = query[node.split_dim] - point[node.split_dim];
        let diff_sq = diff * diff;

        if let Some(left_idx) = node.left {
            if diff <= 0.0 || diff_sq <= radius_sq {
                self.radius_search_recursive(left_idx, query, radius_sq, results);
            }
        }
        if let Some(right_idx) = node.right {
            if diff >= 0.0 || diff_sq <= radius_sq {
                self.radius_search_recursive(right_idx, query, radius_sq, results);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn get_point(&self, idx: usize) -> DVec3 {
        self.points[idx]
    }
}

fn compare_hits(a: &(usize, f64), b: &(usize, f64)) -> Ordering {
    a.1.total_cmp(&b.1).then(a.0.cmp(&b.0))
}

/// For each query point, its nearest tree point within `max_distance`.
pub fn nearest_within(tree: &KdTree, queries: &[DVec3], max_distance: f64) -> Vec<Option<usize>> {
    let max_sq = max_distance * max_distance;
    queries
        .iter()
        .map(|&q| {
            tree.nearest(q)
                .filter(|&(_, d)| d <= max_sq)
                .map(|(idx, _)| idx)
        })
        .collect()
}

/// Most common displacement from `queries` to tree points within `radius`.
///
/// Every (query, neighbour) pair votes for its displacement rounded to whole
/// voxels; the bin with most votes wins, ties going to the smallest bin. The
/// result is the mean exact displacement of the winning bin. Inactive slots
/// are zeroed before voting.
pub fn dominant_displacement(
    tree: &KdTree,
    queries: &[DVec3],
    radius: f64,
    active: [bool; 3],
) -> Option<DVec3> {
    let mut bins: HashMap<[i64; 3], (usize, DVec3)> = HashMap::new();
    for &q in queries {
        for (idx, _) in tree.radius_search(q, radius) {
            let mut d = tree.get_point(idx) - q;
            for (slot, &on) in active.iter().enumerate() {
                if !on {
                    d[slot] = 0.0;
                }
            }
            let key = [d.x.round() as i64, d.y.round() as i64, d.z.round() as i64];
            let entry = bins.entry(key).or_insert((0, DVec3::ZERO));
            entry.0 += 1;
            entry.1 += d;
        }
    }

    bins.into_iter()
        .max_by(|(ka, (na, _)), (kb, (nb, _))| na.cmp(nb).then(kb.cmp(ka)))
        .map(|(_, (count, sum))| sum / count as f64)
}
