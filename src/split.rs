//! Enumerate the ways of cutting a molecule into connector-marked fragments.
//!
//! Binary cuts are found breadth-first over the number of cut bonds. A bond
//! that is not part of a ring disconnects the molecule immediately; a ring
//! bond does not, so it is removed and the cut stays open until a later bond
//! closes it. Each open state owns its own copy of the graph together with a
//! map from original bond indices to the indices in that copy.
//!
//! Binary cuts are then composed into N-way partitions: a binary cut may be
//! applied to an accumulated partition when its cut bonds are new and all lie
//! inside one existing part, which then splits in two.

use std::collections::{BTreeMap, BTreeSet};

use bit_set::BitSet;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    cancel::{CancellationToken, Outcome},
    error::{Result, SpaceError},
    molecule::{compose_maps, Atom, ConnectorClass, IndexMap, Molecule, NUM_CONNECTOR_CLASSES},
};

/// Cut budget for split enumeration.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    /// Maximum number of bonds cut in total. Each cut consumes one connector
    /// class, so this is at most 4.
    pub max_cuts: usize,
    /// Maximum number of fragments of a composed split.
    pub max_fragments: usize,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            max_cuts: 3,
            max_fragments: 3,
        }
    }
}

impl SplitConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_cuts > NUM_CONNECTOR_CLASSES {
            return Err(SpaceError::Config(format!(
                "max_cuts {} exceeds the {NUM_CONNECTOR_CLASSES} connector classes",
                self.max_cuts
            )));
        }
        Ok(())
    }
}

/// One cut of a molecule into exactly two connected fragments.
#[derive(Debug, Clone)]
pub struct BinarySplitResult {
    /// Cut bonds, as indices into the original molecule.
    pub cutset: BTreeSet<usize>,
    /// Both sides, each carrying one connector marker per cut bond.
    pub fragments: [Molecule; 2],
    /// Original bonds belonging to each side.
    pub bonds_in_split: [BitSet; 2],
}

impl BinarySplitResult {
    fn cut_bits(&self) -> BitSet {
        self.cutset.iter().copied().collect()
    }
}

/// An accumulated multi-way partition of a molecule's bonds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NestedBinarySplits {
    pub cut_set: BitSet,
    /// Original bonds of each part, indexed by part label.
    pub partitions: Vec<BitSet>,
}

impl NestedBinarySplits {
    fn from_binary(split: &BinarySplitResult) -> Self {
        Self {
            cut_set: split.cut_bits(),
            partitions: split.bonds_in_split.to_vec(),
        }
    }

    /// Subdivide one part with `split`, if `split` fits entirely inside it.
    fn refine(&self, split: &BinarySplitResult, config: &SplitConfig) -> Option<Self> {
        let cut = split.cut_bits();
        if !self.cut_set.is_disjoint(&cut) {
            return None;
        }
        if self.cut_set.len() + cut.len() > config.max_cuts
            || self.partitions.len() + 1 > config.max_fragments
        {
            return None;
        }
        let target = self.partitions.iter().position(|p| cut.is_subset(p))?;

        let mut partitions = self.partitions.clone();
        let parent = partitions.swap_remove(target);
        for side in &split.bonds_in_split {
            let mut child = parent.clone();
            child.intersect_with(side);
            partitions.push(child);
        }
        let mut cut_set = self.cut_set.clone();
        cut_set.union_with(&cut);
        Some(Self {
            cut_set,
            partitions,
        })
    }

    fn key(&self) -> Vec<usize> {
        self.cut_set.iter().collect()
    }
}

/// A materialized N-way split.
#[derive(Debug, Clone)]
pub struct SplitResult {
    /// Cut bonds in ascending original index; cut `i` uses connector class `i`.
    pub cut_set: Vec<usize>,
    /// Fragments ordered by their lowest original atom index.
    pub fragments: Vec<Molecule>,
    /// Original bonds belonging to each fragment.
    pub fragment_bonds: Vec<BitSet>,
}

impl SplitResult {
    pub fn classes(&self) -> Vec<ConnectorClass> {
        (0..self.cut_set.len())
            .filter_map(ConnectorClass::from_index)
            .collect()
    }
}

/// An open cut: some ring bonds removed, molecule still connected.
struct PartialSplit {
    cutset: Vec<usize>,
    graph: Molecule,
    map: IndexMap,
}

impl PartialSplit {
    fn root(mol: &Molecule) -> Self {
        Self {
            cutset: Vec::new(),
            graph: mol.clone(),
            map: (0..mol.bond_count()).map(Some).collect(),
        }
    }

    /// Remove original bond `b` from this state's graph.
    fn remove(&self, b: usize) -> Option<(Molecule, IndexMap)> {
        let current = self.map.get(b).copied().flatten()?;
        let (graph, step) = self.graph.without_bond(current);
        Some((graph, compose_maps(&self.map, &step)))
    }

    fn defer(&self, b: usize) -> Option<Self> {
        let (graph, map) = self.remove(b)?;
        let mut cutset = self.cutset.clone();
        cutset.push(b);
        Some(Self { cutset, graph, map })
    }

    fn complete(&self, original: &Molecule, b: usize) -> Option<BinarySplitResult> {
        let (graph, map) = self.remove(b)?;
        let mut cutset = self.cutset.clone();
        cutset.push(b);
        cutset.sort_unstable();

        let (mut fragments, mut bonds) = mark_and_extract(original, graph, &map, &cutset)?;
        if fragments.len() != 2 {
            return None;
        }
        let second = (fragments.pop()?, bonds.pop()?);
        let first = (fragments.pop()?, bonds.pop()?);
        Some(BinarySplitResult {
            cutset: cutset.into_iter().collect(),
            fragments: [first.0, second.0],
            bonds_in_split: [first.1, second.1],
        })
    }
}

/// Attach connector markers for every bond of `cutset` (already removed from
/// `graph`) and extract the connected components.
///
/// Returns `None` unless every cut bond separates two different components.
fn mark_and_extract(
    original: &Molecule,
    mut graph: Molecule,
    map: &IndexMap,
    cutset: &[usize],
) -> Option<(Vec<Molecule>, Vec<BitSet>)> {
    for (rank, &b) in cutset.iter().enumerate() {
        let class = ConnectorClass::from_index(rank)?;
        let (u, v) = original.bond_endpoints(b)?;
        let bond = original.bond(b)?;
        for end in [u, v] {
            let marker = graph.add_atom(Atom::connector(class));
            graph.add_bond(end, marker, bond);
        }
    }

    let components = graph.components();
    let component_of = |atom: usize| components.iter().position(|c| c.contains(atom));
    for &b in cutset {
        let (u, v) = original.bond_endpoints(b)?;
        if component_of(u) == component_of(v) {
            return None;
        }
    }

    let mut bonds = vec![BitSet::with_capacity(original.bond_count()); components.len()];
    for (orig, current) in map.iter().enumerate() {
        if let Some(current) = current {
            let (u, _) = graph.bond_endpoints(*current)?;
            bonds[component_of(u)?].insert(orig);
        }
    }
    let fragments = components.iter().map(|c| graph.induced(c).0).collect();
    Some((fragments, bonds))
}

fn touches_connector(mol: &Molecule, b: usize) -> bool {
    mol.bond_endpoints(b).is_some_and(|(u, v)| {
        [u, v]
            .iter()
            .any(|a| mol.atom(*a).is_some_and(|x| x.is_connector()))
    })
}

/// Enumerate every cut of `mol` into two connected fragments using at most
/// `max_cuts` bonds.
pub fn compute_all_binary_splits(
    mol: &Molecule,
    max_cuts: usize,
    cancel: &CancellationToken,
) -> Outcome<Vec<BinarySplitResult>> {
    let mut results = Vec::new();
    let max_cuts = max_cuts.min(NUM_CONNECTOR_CLASSES);
    let mut frontier = vec![PartialSplit::root(mol)];

    for depth in 1..=max_cuts {
        let mut next = Vec::new();
        for partial in &frontier {
            let start = partial.cutset.last().map_or(0, |b| b + 1);
            for b in start..mol.bond_count() {
                if cancel.is_cancelled() {
                    return Outcome::Cancelled(results);
                }
                if touches_connector(mol, b) {
                    continue;
                }
                let Some(current) = partial.map[b] else {
                    continue;
                };
                if partial.graph.is_bridge(current) {
                    if let Some(split) = partial.complete(mol, b) {
                        results.push(split);
                    }
                } else if depth < max_cuts {
                    next.extend(partial.defer(b));
                }
            }
        }
        debug!(
            "cut depth {depth}: {} binary splits, {} open ring cuts",
            results.len(),
            next.len()
        );
        frontier = next;
    }

    Outcome::Complete(results)
}

/// Fold binary cuts into N-way partitions of at most `max_fragments` parts and
/// `max_cuts` cut bonds. Every distinct cut set appears once.
pub fn compose_splits(
    binaries: &[BinarySplitResult],
    config: &SplitConfig,
    cancel: &CancellationToken,
) -> Outcome<Vec<NestedBinarySplits>> {
    let mut found: BTreeMap<Vec<usize>, NestedBinarySplits> = BTreeMap::new();
    if config.max_fragments < 2 {
        return Outcome::Complete(Vec::new());
    }
    for split in binaries {
        let nested = NestedBinarySplits::from_binary(split);
        found.entry(nested.key()).or_insert(nested);
    }

    let mut level: Vec<NestedBinarySplits> = found.values().cloned().collect();
    for _ in 3..=config.max_fragments {
        let mut next: BTreeMap<Vec<usize>, NestedBinarySplits> = BTreeMap::new();
        for nested in &level {
            for split in binaries {
                if cancel.is_cancelled() {
                    found.extend(next);
                    return Outcome::Cancelled(found.into_values().collect());
                }
                if let Some(child) = nested.refine(split, config) {
                    let key = child.key();
                    if !found.contains_key(&key) {
                        next.entry(key).or_insert(child);
                    }
                }
            }
        }
        if next.is_empty() {
            break;
        }
        level = next.values().cloned().collect();
        found.extend(next);
    }

    Outcome::Complete(found.into_values().collect())
}

/// Enumerate all valid splits of `mol` into 2..=`max_fragments` fragments,
/// keyed by cut set.
pub fn compute_all_valid_splits(
    mol: &Molecule,
    config: &SplitConfig,
    cancel: &CancellationToken,
) -> Outcome<BTreeMap<Vec<usize>, SplitResult>> {
    if config.max_cuts == 0 || config.max_fragments < 2 {
        return Outcome::Complete(BTreeMap::new());
    }

    let binaries = match compute_all_binary_splits(mol, config.max_cuts, cancel) {
        Outcome::Complete(b) => b,
        Outcome::Cancelled(_) => return Outcome::Cancelled(BTreeMap::new()),
    };
    let composed = compose_splits(&binaries, config, cancel);
    let cancelled = composed.is_cancelled();

    let mut splits = BTreeMap::new();
    for nested in composed.into_inner() {
        let key = nested.key();
        match apply_split(mol, &key) {
            Ok(split) if split.fragments.len() == nested.partitions.len() => {
                splits.insert(key, split);
            }
            Ok(split) => debug!(
                "cut set {key:?} yields {} fragments, expected {}",
                split.fragments.len(),
                nested.partitions.len()
            ),
            Err(e) => debug!("cut set {key:?} rejected: {e}"),
        }
    }

    if cancelled {
        Outcome::Cancelled(splits)
    } else {
        Outcome::Complete(splits)
    }
}

/// Cut every bond of `cut_set` (original indices) and return the fragments.
pub fn apply_split(mol: &Molecule, cut_set: &[usize]) -> Result<SplitResult> {
    if cut_set.len() > NUM_CONNECTOR_CLASSES {
        return Err(SpaceError::Unsupported(format!(
            "{} cuts exceed the {NUM_CONNECTOR_CLASSES} connector classes",
            cut_set.len()
        )));
    }
    let mut cut_set = cut_set.to_vec();
    cut_set.sort_unstable();
    cut_set.dedup();

    let mut graph = mol.clone();
    let mut map: IndexMap = (0..mol.bond_count()).map(Some).collect();
    for &b in &cut_set {
        let current = map.get(b).copied().flatten().ok_or_else(|| {
            SpaceError::Inconsistent(format!("bond {b} is not part of the molecule"))
        })?;
        let (next, step) = graph.without_bond(current);
        map = compose_maps(&map, &step);
        graph = next;
    }

    let (fragments, fragment_bonds) = mark_and_extract(mol, graph, &map, &cut_set)
        .ok_or_else(|| {
            SpaceError::Inconsistent(format!("cut set {cut_set:?} does not separate its bonds"))
        })?;
    Ok(SplitResult {
        cut_set,
        fragments,
        fragment_bonds,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonize::parse_encoding;

    fn mol(s: &str) -> Molecule {
        parse_encoding(s).unwrap()
    }

    fn all_bonds(m: &Molecule) -> BitSet {
        (0..m.bond_count()).collect()
    }

    fn methylcyclohexanol() -> Molecule {
        mol("C.C.C.C.C.C.C.O|0-1,1-2,2-3,3-4,4-5,5-0,0-6,6-7")
    }

    #[test]
    fn chain_cuts_every_bond_once() {
        let chain = mol("C.C.C.N|0-1,1-2,2-3");
        let splits = compute_all_binary_splits(&chain, 2, &CancellationToken::new()).into_inner();
        let cutsets: Vec<Vec<usize>> = splits
            .iter()
            .map(|s| s.cutset.iter().copied().collect())
            .collect();
        assert_eq!(cutsets, vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn ring_needs_two_cuts() {
        let ring = mol("C.C.C.C.C.C|0-1,1-2,2-3,3-4,4-5,5-0");
        let token = CancellationToken::new();
        assert!(compute_all_binary_splits(&ring, 1, &token).into_inner().is_empty());
        assert_eq!(compute_all_binary_splits(&ring, 2, &token).into_inner().len(), 15);
    }

    #[test]
    fn binary_splits_partition_bonds() {
        let m = methylcyclohexanol();
        let all = all_bonds(&m);
        let splits = compute_all_binary_splits(&m, 3, &CancellationToken::new()).into_inner();
        assert!(!splits.is_empty());
        for split in &splits {
            let [a, b] = &split.bonds_in_split;
            let cut = split.cut_bits();
            assert!(a.is_disjoint(b));
            assert!(a.is_disjoint(&cut) && b.is_disjoint(&cut));
            let mut union = a.clone();
            union.union_with(b);
            union.union_with(&cut);
            assert_eq!(union, all);
        }
    }

    #[test]
    fn markers_copy_the_cut_bond() {
        let m = mol("C.C.O|0-1,1=2");
        let splits = compute_all_binary_splits(&m, 1, &CancellationToken::new()).into_inner();
        let double_cut = splits
            .iter()
            .find(|s| s.cutset.contains(&1))
            .unwrap();
        for fragment in &double_cut.fragments {
            let (marker, class) = fragment.connectors()[0];
            assert_eq!(class, ConnectorClass::First);
            let (_, _, bond) = fragment.incident_bonds(marker)[0];
            assert_eq!(bond, crate::molecule::Bond::Double);
        }
    }

    #[test]
    fn remapped_indices_refer_to_original_bonds() {
        // Cutting ring bonds first renumbers the tail bonds; the recorded
        // partition must still use the original numbering.
        let m = methylcyclohexanol();
        let splits = compute_all_binary_splits(&m, 3, &CancellationToken::new()).into_inner();
        for split in splits.iter().filter(|s| s.cutset.len() == 2) {
            for (fragment, bonds) in split.fragments.iter().zip(&split.bonds_in_split) {
                assert_eq!(fragment.bond_count(), bonds.len() + 2);
                for b in bonds.iter() {
                    assert!(!split.cutset.contains(&b));
                }
            }
            let tail_side = split
                .bonds_in_split
                .iter()
                .find(|bonds| bonds.contains(7))
                .unwrap();
            assert!(tail_side.contains(6));
        }
    }

    #[test]
    fn nested_partitions_are_valid() {
        let m = methylcyclohexanol();
        let config = SplitConfig {
            max_cuts: 3,
            max_fragments: 3,
        };
        let token = CancellationToken::new();
        let binaries = compute_all_binary_splits(&m, config.max_cuts, &token).into_inner();
        let nested = compose_splits(&binaries, &config, &token).into_inner();
        let all = all_bonds(&m);
        assert!(nested.iter().any(|n| n.partitions.len() == 3));
        for n in &nested {
            assert!(n.cut_set.len() <= config.max_cuts);
            let mut union = n.cut_set.clone();
            for (i, p) in n.partitions.iter().enumerate() {
                assert!(p.is_disjoint(&n.cut_set));
                for q in &n.partitions[i + 1..] {
                    assert!(p.is_disjoint(q));
                }
                union.union_with(p);
            }
            assert_eq!(union, all);
        }
    }

    #[test]
    fn valid_splits_of_a_chain() {
        let chain = mol("C.C.C.C.N|0-1,1-2,2-3,3-4");
        let config = SplitConfig {
            max_cuts: 2,
            max_fragments: 3,
        };
        let splits = compute_all_valid_splits(&chain, &config, &CancellationToken::new());
        let splits = splits.into_inner();
        assert_eq!(splits.len(), 10);
        let three = &splits[&vec![0, 2]];
        assert_eq!(three.fragments.len(), 3);
        assert_eq!(three.classes(), vec![ConnectorClass::First, ConnectorClass::Second]);
        assert_eq!(three.fragments[1].connector_classes(), 0b11);
    }

    #[test]
    fn zero_budget_is_empty() {
        let chain = mol("C.C.C|0-1,1-2");
        let token = CancellationToken::new();
        let none = SplitConfig {
            max_cuts: 0,
            max_fragments: 3,
        };
        assert!(compute_all_valid_splits(&chain, &none, &token).into_inner().is_empty());
        let single = SplitConfig {
            max_cuts: 2,
            max_fragments: 1,
        };
        assert!(compute_all_valid_splits(&chain, &single, &token).into_inner().is_empty());
    }

    #[test]
    fn cancellation_returns_partial() {
        let token = CancellationToken::new();
        token.cancel();
        let outcome = compute_all_valid_splits(&methylcyclohexanol(), &SplitConfig::default(), &token);
        assert!(outcome.is_cancelled());
        assert!(outcome.value().is_empty());
    }

    #[test]
    fn apply_split_rejects_too_many_cuts() {
        let chain = mol("C.C.C.C.C.C|0-1,1-2,2-3,3-4,4-5");
        assert!(matches!(
            apply_split(&chain, &[0, 1, 2, 3, 4]),
            Err(SpaceError::Unsupported(_))
        ));
        let ring = mol("C.C.C|0-1,1-2,2-0");
        assert!(matches!(apply_split(&ring, &[0]), Err(SpaceError::Inconsistent(_))));
    }
}
