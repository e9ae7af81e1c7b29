//! Coarse topology signatures used to bucket synthons for similarity search.
//!
//! A [`TopoInfo`] records which connector classes a fragment carries, the
//! bond distances between its connectors and its size. A query fragment is
//! only compared against buckets whose signature lies inside a tolerance
//! window around its own, so a position's full synthon set is never scanned.

use std::{
    collections::{BTreeMap, BTreeSet},
    hash::Hash,
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, SpaceError},
    molecule::Molecule,
    utils::cartesian_indices,
};

/// Most pairwise connector distances a signature may carry when generating
/// compatible signatures.
pub const MAX_SUPPORTED_DISTANCES: usize = 3;

/// Allowed replacement range for each exact connector distance. Distances of
/// 32 bonds or more use the last row.
const DISTANCE_TOLERANCE: [(u8, u8); 32] = [
    (0, 0),
    (1, 1),
    (2, 2),
    (2, 4),
    (3, 5),
    (4, 6),
    (5, 7),
    (5, 9),
    (6, 10),
    (7, 11),
    (8, 12),
    (9, 13),
    (10, 14),
    (10, 16),
    (11, 17),
    (12, 18),
    (13, 19),
    (14, 20),
    (15, 21),
    (16, 22),
    (17, 23),
    (17, 25),
    (18, 26),
    (19, 27),
    (20, 28),
    (21, 29),
    (22, 30),
    (23, 31),
    (24, 32),
    (25, 33),
    (26, 34),
    (27, 35),
];

/// Topology signature of a fragment. Field order defines the bucket order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TopoInfo {
    /// Bitset of connector classes present.
    pub connectors: u8,
    /// Sorted shortest-path distances between every pair of connectors.
    pub distances: Vec<u8>,
    /// Number of non-connector atoms.
    pub atom_count: usize,
}

/// Size window around a fragment's atom count.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyTolerance {
    pub size_lower_rel: f64,
    pub size_lower_abs: usize,
    pub size_upper_rel: f64,
    pub size_upper_abs: usize,
}

impl Default for TopologyTolerance {
    fn default() -> Self {
        Self {
            size_lower_rel: 0.8,
            size_lower_abs: 3,
            size_upper_rel: 1.25,
            size_upper_abs: 3,
        }
    }
}

impl TopologyTolerance {
    /// Inclusive atom-count window for a fragment of `size` atoms. Each bound
    /// is the tighter of the relative and the absolute limit.
    pub fn size_window(&self, size: usize) -> (usize, usize) {
        let relative_low = (size as f64 * self.size_lower_rel).floor() as usize;
        let relative_high = (size as f64 * self.size_upper_rel).ceil() as usize;
        let low = relative_low.max(size.saturating_sub(self.size_lower_abs));
        let high = relative_high.min(size + self.size_upper_abs);
        (low.min(size), high.max(size))
    }
}

/// Allowed range for an exact connector distance.
pub fn distance_window(distance: u8) -> (u8, u8) {
    DISTANCE_TOLERANCE[(distance as usize).min(DISTANCE_TOLERANCE.len() - 1)]
}

/// Compute the topology signature of `fragment`.
pub fn compute_topo_info(fragment: &Molecule) -> TopoInfo {
    let connectors = fragment.connectors();
    let mut distances = Vec::new();
    for (i, (a, _)) in connectors.iter().enumerate() {
        for (b, _) in &connectors[i + 1..] {
            let d = fragment.shortest_path(*a, *b).unwrap_or(usize::MAX);
            distances.push(d.min(u8::MAX as usize) as u8);
        }
    }
    distances.sort_unstable();

    TopoInfo {
        connectors: fragment.connector_classes(),
        distances,
        atom_count: fragment.heavy_atom_count(),
    }
}

/// Every signature that should be searched as a similarity match for `topo`.
pub fn compatible_topologies(topo: &TopoInfo, tolerance: &TopologyTolerance) -> Result<Vec<TopoInfo>> {
    if topo.distances.len() > MAX_SUPPORTED_DISTANCES {
        return Err(SpaceError::Unsupported(format!(
            "{} pairwise connector distances (at most {MAX_SUPPORTED_DISTANCES} supported)",
            topo.distances.len()
        )));
    }

    let ranges: Vec<Vec<u8>> = topo
        .distances
        .iter()
        .map(|d| {
            let (low, high) = distance_window(*d);
            (low..=high).collect()
        })
        .collect();
    let sizes: Vec<usize> = ranges.iter().map(Vec::len).collect();
    let (low, high) = tolerance.size_window(topo.atom_count);

    let mut compatible = BTreeSet::new();
    for combo in cartesian_indices(&sizes) {
        let mut distances: Vec<u8> = combo.iter().zip(&ranges).map(|(i, r)| r[*i]).collect();
        distances.sort_unstable();
        for atom_count in low..=high {
            compatible.insert(TopoInfo {
                connectors: topo.connectors,
                distances: distances.clone(),
                atom_count,
            });
        }
    }
    // No distances: the product above is empty but the size window still applies.
    if topo.distances.is_empty() {
        compatible.extend((low..=high).map(|atom_count| TopoInfo {
            connectors: topo.connectors,
            distances: Vec::new(),
            atom_count,
        }));
    }
    Ok(compatible.into_iter().collect())
}

/// Buckets of items by topology signature, grouped under a key such as a
/// (reaction, position) pair. Groups are independent and may be filled from
/// different threads concurrently.
#[derive(Debug)]
pub struct TopologyIndex<K: Eq + Hash, T> {
    groups: DashMap<K, BTreeMap<TopoInfo, Vec<T>>>,
}

impl<K: Eq + Hash, T> Default for TopologyIndex<K, T> {
    fn default() -> Self {
        Self {
            groups: DashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone, T: Clone> TopologyIndex<K, T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: K, topo: TopoInfo, item: T) {
        self.groups
            .entry(key)
            .or_default()
            .entry(topo)
            .or_default()
            .push(item);
    }

    /// Replace a whole group at once.
    pub fn insert_group(&self, key: K, buckets: BTreeMap<TopoInfo, Vec<T>>) {
        self.groups.insert(key, buckets);
    }

    pub fn bucket(&self, key: &K, topo: &TopoInfo) -> Vec<T> {
        self.groups
            .get(key)
            .and_then(|g| g.get(topo).cloned())
            .unwrap_or_default()
    }

    /// Signatures present in group `key`, in order.
    pub fn signatures(&self, key: &K) -> Vec<TopoInfo> {
        self.groups
            .get(key)
            .map(|g| g.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Signatures present in group `key` that are compatible with `topo`.
    pub fn compatible_buckets(
        &self,
        key: &K,
        topo: &TopoInfo,
        tolerance: &TopologyTolerance,
    ) -> Result<Vec<TopoInfo>> {
        let wanted = compatible_topologies(topo, tolerance)?;
        let Some(group) = self.groups.get(key) else {
            return Ok(Vec::new());
        };
        Ok(wanted.into_iter().filter(|t| group.contains_key(t)).collect())
    }

    pub fn len(&self) -> usize {
        self.groups.iter().map(|g| g.values().map(Vec::len).sum::<usize>()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonize::parse_encoding;

    #[test]
    fn signature_of_a_linker() {
        let linker = parse_encoding("U.C.C.Np|0-1,1-2,2-3").unwrap();
        let topo = compute_topo_info(&linker);
        assert_eq!(topo.connectors, 0b11);
        assert_eq!(topo.distances, vec![3]);
        assert_eq!(topo.atom_count, 2);
    }

    #[test]
    fn signature_without_connectors() {
        let topo = compute_topo_info(&parse_encoding("C.O|0-1").unwrap());
        assert_eq!(topo.connectors, 0);
        assert!(topo.distances.is_empty());
    }

    #[test]
    fn table_widens_monotonically() {
        let mut last_width = 0;
        for d in 0..40u8 {
            let (low, high) = distance_window(d);
            let d = d.min(31);
            assert!(low <= d && d <= high);
            let width = high - low;
            assert!(width >= last_width);
            last_width = width;
        }
    }

    #[test]
    fn size_window_uses_tighter_bound() {
        let tol = TopologyTolerance::default();
        assert_eq!(tol.size_window(4), (3, 5));
        assert_eq!(tol.size_window(20), (17, 23));
        assert_eq!(tol.size_window(0), (0, 0));
    }

    #[test]
    fn compatible_set_is_cross_product() {
        let topo = TopoInfo {
            connectors: 0b11,
            distances: vec![3],
            atom_count: 4,
        };
        let all = compatible_topologies(&topo, &TopologyTolerance::default()).unwrap();
        // Distances 2..=4 times sizes 3..=5.
        assert_eq!(all.len(), 9);
        assert!(all.contains(&topo));

        let none = TopoInfo {
            connectors: 0b1,
            distances: vec![],
            atom_count: 4,
        };
        assert_eq!(compatible_topologies(&none, &TopologyTolerance::default()).unwrap().len(), 3);
    }

    #[test]
    fn four_distances_are_unsupported() {
        let topo = TopoInfo {
            connectors: 0b1111,
            distances: vec![2, 3, 3, 4],
            atom_count: 6,
        };
        assert!(matches!(
            compatible_topologies(&topo, &TopologyTolerance::default()),
            Err(SpaceError::Unsupported(_))
        ));
    }

    #[test]
    fn index_filters_to_present_buckets() {
        let index: TopologyIndex<&str, usize> = TopologyIndex::new();
        let near = TopoInfo {
            connectors: 1,
            distances: vec![],
            atom_count: 5,
        };
        let far = TopoInfo {
            atom_count: 12,
            ..near.clone()
        };
        index.insert("r1", near.clone(), 1);
        index.insert("r1", far.clone(), 2);
        index.insert("r1", near.clone(), 3);

        assert_eq!(index.bucket(&"r1", &near), vec![1, 3]);
        assert_eq!(index.len(), 3);
        let query = TopoInfo {
            atom_count: 4,
            ..near.clone()
        };
        let found = index
            .compatible_buckets(&"r1", &query, &TopologyTolerance::default())
            .unwrap();
        assert_eq!(found, vec![near]);
    }
}
