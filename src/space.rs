//! Synthon spaces: reactions whose positions each hold interchangeable
//! synthons, and the parallel expansion of combinatorial hits into products.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    hash::{Hash, Hasher},
    path::PathBuf,
};

use bit_set::BitSet;
use clap::ValueEnum;
use dashmap::DashSet;
use log::{debug, error, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    ann::LshConfig,
    assembly::{assemble_with, AssemblyMode},
    cancel::{CancellationToken, Outcome},
    canonize::canonical_encoding,
    error::{Result, SpaceError},
    memoize::FingerprintCache,
    molecule::Molecule,
    topology::{compute_topo_info, TopoInfo},
    utils::cartesian_indices,
};

/// Most positions a combinatorial hit may span.
pub const MAX_HIT_POSITIONS: usize = 3;

/// Identity of a synthon. Equality, ordering and hashing use the reaction,
/// position and canonical encoding only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragId {
    pub reaction: String,
    pub position: String,
    pub encoding: String,
    #[serde(skip)]
    pub fingerprint: Option<BitSet>,
}

impl FragId {
    pub fn new(reaction: impl Into<String>, position: impl Into<String>, encoding: impl Into<String>) -> Self {
        Self {
            reaction: reaction.into(),
            position: position.into(),
            encoding: encoding.into(),
            fingerprint: None,
        }
    }

    fn key(&self) -> (&str, &str, &str) {
        (&self.reaction, &self.position, &self.encoding)
    }
}

impl PartialEq for FragId {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for FragId {}

impl Hash for FragId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for FragId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FragId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for FragId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.reaction, self.position, self.encoding)
    }
}

#[derive(Debug, Clone)]
pub struct Synthon {
    pub id: FragId,
    pub molecule: Molecule,
    pub topo: TopoInfo,
}

#[derive(Debug, Clone)]
pub struct Position {
    pub id: String,
    /// Connector classes carried by this position's synthons.
    pub classes: u8,
    pub synthons: Vec<Synthon>,
    by_encoding: HashMap<String, usize>,
}

impl Position {
    pub fn synthon(&self, encoding: &str) -> Option<&Synthon> {
        self.by_encoding.get(encoding).map(|ix| &self.synthons[*ix])
    }

    pub fn len(&self) -> usize {
        self.synthons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.synthons.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Reaction {
    pub id: String,
    pub positions: Vec<Position>,
}

impl Reaction {
    pub fn position(&self, id: &str) -> Option<&Position> {
        self.positions.iter().find(|p| p.id == id)
    }

    /// Union of all positions' connector classes.
    pub fn classes(&self) -> u8 {
        self.positions.iter().fold(0, |bits, p| bits | p.classes)
    }

    /// Number of products the reaction enumerates.
    pub fn num_products(&self) -> u128 {
        self.positions.iter().map(|p| p.len() as u128).product()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpaceKind {
    Substructure,
    Similarity,
}

impl fmt::Display for SpaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpaceKind::Substructure => f.write_str("substructure"),
            SpaceKind::Similarity => f.write_str("similarity"),
        }
    }
}

/// One row of a space descriptor file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceDescriptor {
    pub name: String,
    pub version: String,
    pub provider: String,
    pub kind: SpaceKind,
    /// Inventory blob, relative to the descriptor file.
    pub file: PathBuf,
}

/// A named inventory of reactions. Fingerprints are only computed for
/// similarity spaces.
#[derive(Debug)]
pub struct SynthonSpace {
    pub descriptor: SpaceDescriptor,
    fingerprints: FingerprintCache,
    lsh: Option<LshConfig>,
    reactions: BTreeMap<String, Reaction>,
}

impl SynthonSpace {
    /// Empty space using the fingerprint handler called `fingerprint`. A
    /// similarity space without an explicit LSH configuration gets the
    /// default one sized to the handler.
    pub fn new(descriptor: SpaceDescriptor, fingerprint: &str, lsh: Option<LshConfig>) -> Result<Self> {
        let fingerprints = FingerprintCache::new(fingerprint)?;
        let lsh = match (descriptor.kind, lsh) {
            (SpaceKind::Substructure, lsh) => lsh,
            (SpaceKind::Similarity, Some(config)) => Some(config),
            (SpaceKind::Similarity, None) => Some(LshConfig {
                num_bits: fingerprints.num_bits(),
                ..LshConfig::default()
            }),
        };
        if let Some(config) = &lsh {
            if config.num_bits != fingerprints.num_bits() {
                return Err(SpaceError::Config(format!(
                    "LSH width {} does not match {} fingerprints of {} bits",
                    config.num_bits,
                    fingerprints.handler_name(),
                    fingerprints.num_bits()
                )));
            }
            config.validate()?;
        }
        Ok(Self {
            descriptor,
            fingerprints,
            lsh,
            reactions: BTreeMap::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn kind(&self) -> SpaceKind {
        self.descriptor.kind
    }

    pub fn lsh(&self) -> Option<&LshConfig> {
        self.lsh.as_ref()
    }

    pub fn fingerprints(&self) -> &FingerprintCache {
        &self.fingerprints
    }

    /// Add a reaction from its positions' synthons. Encodings, topology
    /// signatures and (for similarity spaces) fingerprints are computed here
    /// in parallel; duplicate synthons within a position are dropped.
    pub fn add_reaction(&mut self, id: &str, positions: Vec<(String, Vec<Molecule>)>) -> Result<()> {
        if self.reactions.contains_key(id) {
            return Err(SpaceError::Inconsistent(format!("reaction `{id}` defined twice")));
        }
        let with_fingerprints = self.kind() == SpaceKind::Similarity;

        let mut built = Vec::with_capacity(positions.len());
        for (position_id, molecules) in positions {
            if built.iter().any(|p: &Position| p.id == position_id) {
                return Err(SpaceError::Inconsistent(format!(
                    "position `{position_id}` of reaction `{id}` defined twice"
                )));
            }
            let candidates: Vec<Synthon> = molecules
                .into_par_iter()
                .map(|molecule| {
                    let encoding = canonical_encoding(&molecule);
                    let fingerprint =
                        with_fingerprints.then(|| self.fingerprints.fingerprint_for(&encoding, &molecule));
                    Synthon {
                        id: FragId {
                            fingerprint,
                            ..FragId::new(id, position_id.as_str(), encoding)
                        },
                        topo: compute_topo_info(&molecule),
                        molecule,
                    }
                })
                .collect();

            let mut synthons = Vec::with_capacity(candidates.len());
            let mut by_encoding = HashMap::new();
            for synthon in candidates {
                if by_encoding.contains_key(&synthon.id.encoding) {
                    debug!("dropping duplicate synthon {}", synthon.id);
                    continue;
                }
                by_encoding.insert(synthon.id.encoding.clone(), synthons.len());
                synthons.push(synthon);
            }

            let mut class_sets: Vec<u8> = synthons.iter().map(|s| s.topo.connectors).collect();
            class_sets.sort_unstable();
            class_sets.dedup();
            if class_sets.len() > 1 {
                warn!("synthons of {id}/{position_id} carry differing connector classes {class_sets:?}");
            }
            built.push(Position {
                classes: class_sets.iter().fold(0, |bits, c| bits | c),
                id: position_id,
                synthons,
                by_encoding,
            });
        }

        debug!("reaction {id}: {} positions", built.len());
        self.reactions.insert(
            id.to_string(),
            Reaction {
                id: id.to_string(),
                positions: built,
            },
        );
        Ok(())
    }

    pub fn reaction(&self, id: &str) -> Option<&Reaction> {
        self.reactions.get(id)
    }

    pub fn reactions(&self) -> impl Iterator<Item = &Reaction> {
        self.reactions.values()
    }

    pub fn synthon(&self, id: &FragId) -> Option<&Synthon> {
        self.reaction(&id.reaction)?
            .position(&id.position)?
            .synthon(&id.encoding)
    }

    pub fn num_synthons(&self) -> usize {
        self.reactions()
            .flat_map(|r| &r.positions)
            .map(Position::len)
            .sum()
    }

    pub fn num_products(&self) -> u128 {
        self.reactions().map(Reaction::num_products).sum()
    }
}

/// Candidate synthons per position of one reaction. Stands for every product
/// that takes one synthon from each listed position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CombinatorialHit {
    pub reaction: String,
    pub positions: BTreeMap<String, BTreeSet<FragId>>,
}

impl CombinatorialHit {
    pub fn new(reaction: impl Into<String>) -> Self {
        Self {
            reaction: reaction.into(),
            positions: BTreeMap::new(),
        }
    }

    pub fn num_products(&self) -> u128 {
        if self.positions.is_empty() {
            return 0;
        }
        self.positions.values().map(|s| s.len() as u128).product()
    }
}

/// One concrete product of a combinatorial hit.
#[derive(Debug, Clone)]
pub struct Product {
    /// One synthon per position, in position order.
    pub fragments: Vec<FragId>,
    pub molecule: Molecule,
    pub encoding: String,
}

/// Expand `hit` into at most `max_products` assembled products using a pool
/// of `threads` workers.
pub fn expand_combinatorial_hit(
    space: &SynthonSpace,
    hit: &CombinatorialHit,
    max_products: usize,
    threads: usize,
    cancel: &CancellationToken,
) -> Result<Outcome<Vec<Product>>> {
    expand_hits(space, std::slice::from_ref(hit), max_products, threads, cancel)
}

/// Expand several hits on one pool. A fragment combination reached through
/// more than one hit is assembled once per call; the set of assembled
/// combinations is not kept across calls. `max_products` applies per hit.
pub fn expand_hits(
    space: &SynthonSpace,
    hits: &[CombinatorialHit],
    max_products: usize,
    threads: usize,
    cancel: &CancellationToken,
) -> Result<Outcome<Vec<Product>>> {
    if let Some(hit) = hits.iter().find(|h| h.positions.len() > MAX_HIT_POSITIONS) {
        return Err(SpaceError::Unsupported(format!(
            "expanding a hit over {} positions (at most {MAX_HIT_POSITIONS})",
            hit.positions.len()
        )));
    }

    let mut combinations: Vec<Vec<&FragId>> = Vec::new();
    for hit in hits {
        let sets: Vec<Vec<&FragId>> = hit.positions.values().map(|s| s.iter().collect()).collect();
        let sizes: Vec<usize> = sets.iter().map(Vec::len).collect();
        combinations.extend(
            cartesian_indices(&sizes)
                .take(max_products)
                .map(|combo| combo.iter().zip(&sets).map(|(i, set)| set[*i]).collect::<Vec<_>>()),
        );
    }

    let pool = rayon::ThreadPoolBuilder::new().num_threads(threads.max(1)).build()?;
    let assembled: DashSet<Vec<FragId>> = DashSet::new();
    let mut products: Vec<Product> = pool.install(|| {
        combinations
            .par_iter()
            .filter_map(|combo| {
                if cancel.is_cancelled() {
                    return None;
                }
                let key: Vec<FragId> = combo.iter().map(|f| (*f).clone()).collect();
                if !assembled.insert(key.clone()) {
                    return None;
                }
                assemble_product(space, key)
            })
            .collect()
    });
    products.sort_by(|a, b| a.fragments.cmp(&b.fragments));

    debug!(
        "expanded {} hits into {} products ({} combinations)",
        hits.len(),
        products.len(),
        combinations.len()
    );
    Ok(if cancel.is_cancelled() {
        Outcome::Cancelled(products)
    } else {
        Outcome::Complete(products)
    })
}

fn assemble_product(space: &SynthonSpace, fragments: Vec<FragId>) -> Option<Product> {
    let mut molecules = Vec::with_capacity(fragments.len());
    for id in &fragments {
        match space.synthon(id) {
            Some(s) => molecules.push(s.molecule.clone()),
            None => {
                error!("synthon {id} is not part of space `{}`", space.name());
                return None;
            }
        }
    }
    let assembled = assemble_with(&molecules, AssemblyMode::PerClass, false);
    if !assembled.unresolved.is_empty() {
        debug!("product of {fragments:?} leaves {:?} open", assembled.unresolved);
    }
    Some(Product {
        encoding: canonical_encoding(&assembled.molecule),
        molecule: assembled.molecule,
        fragments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonize::parse_encoding;

    fn descriptor(kind: SpaceKind) -> SpaceDescriptor {
        SpaceDescriptor {
            name: "toy".into(),
            version: "1".into(),
            provider: "test".into(),
            kind,
            file: PathBuf::from("toy.json"),
        }
    }

    fn mols(encodings: &[&str]) -> Vec<Molecule> {
        encodings.iter().map(|e| parse_encoding(e).unwrap()).collect()
    }

    fn toy_space(kind: SpaceKind) -> SynthonSpace {
        let mut space = SynthonSpace::new(descriptor(kind), "path", None).unwrap();
        space
            .add_reaction(
                "amide",
                vec![
                    ("a".into(), mols(&["C.C.U|0-1,1-2", "C.O.U|0-1,0-2"])),
                    ("b".into(), mols(&["U.N|0-1", "U.N.C|0-1,1-2", "N.U|0-1"])),
                ],
            )
            .unwrap();
        space
    }

    fn full_hit(space: &SynthonSpace) -> CombinatorialHit {
        let reaction = space.reaction("amide").unwrap();
        let mut hit = CombinatorialHit::new("amide");
        for p in &reaction.positions {
            hit.positions
                .insert(p.id.clone(), p.synthons.iter().map(|s| s.id.clone()).collect());
        }
        hit
    }

    #[test]
    fn frag_ids_ignore_fingerprints() {
        let mut a = FragId::new("r", "p", "C|");
        let b = FragId::new("r", "p", "C|");
        a.fingerprint = Some(BitSet::from_bytes(&[0xff]));
        assert_eq!(a, b);
        assert_ne!(a, FragId::new("r", "q", "C|"));
    }

    #[test]
    fn inventory_bookkeeping() {
        let space = toy_space(SpaceKind::Similarity);
        let reaction = space.reaction("amide").unwrap();
        // The third synthon of `b` duplicates the first.
        assert_eq!(reaction.position("b").unwrap().len(), 2);
        assert_eq!(space.num_synthons(), 4);
        assert_eq!(space.num_products(), 4);
        assert_eq!(reaction.classes(), 0b1);
        assert!(reaction.positions[0].synthons[0].id.fingerprint.is_some());
        assert_eq!(space.lsh().unwrap().num_bits, 512);

        let substructure = toy_space(SpaceKind::Substructure);
        assert!(substructure.reactions().all(|r| r.positions[0].synthons[0].id.fingerprint.is_none()));
    }

    #[test]
    fn duplicate_reaction_is_rejected() {
        let mut space = toy_space(SpaceKind::Substructure);
        assert!(space.add_reaction("amide", vec![]).is_err());
    }

    #[test]
    fn mismatched_lsh_width_is_a_config_error() {
        let lsh = LshConfig {
            num_bits: 1024,
            ..LshConfig::default()
        };
        assert!(matches!(
            SynthonSpace::new(descriptor(SpaceKind::Similarity), "path", Some(lsh)),
            Err(SpaceError::Config(_))
        ));
    }

    #[test]
    fn two_by_two_hit_gives_four_products() {
        let space = toy_space(SpaceKind::Substructure);
        let hit = full_hit(&space);
        assert_eq!(hit.num_products(), 4);

        let mut per_thread_count = Vec::new();
        for threads in [1, 8] {
            let products = expand_combinatorial_hit(&space, &hit, 100, threads, &CancellationToken::new())
                .unwrap()
                .into_inner();
            let encodings: BTreeSet<String> = products.iter().map(|p| p.encoding.clone()).collect();
            assert_eq!(products.len(), 4);
            assert_eq!(encodings.len(), 4);
            assert!(products.iter().all(|p| p.molecule.connectors().is_empty()));
            per_thread_count.push(encodings);
        }
        assert_eq!(per_thread_count[0], per_thread_count[1]);
    }

    #[test]
    fn overlapping_hits_are_assembled_once() {
        let space = toy_space(SpaceKind::Substructure);
        let hit = full_hit(&space);
        let products = expand_hits(&space, &[hit.clone(), hit], 100, 4, &CancellationToken::new())
            .unwrap()
            .into_inner();
        assert_eq!(products.len(), 4);
    }

    #[test]
    fn expansion_cap_and_cancellation() {
        let space = toy_space(SpaceKind::Substructure);
        let hit = full_hit(&space);
        let capped = expand_combinatorial_hit(&space, &hit, 3, 2, &CancellationToken::new()).unwrap();
        assert_eq!(capped.value().len(), 3);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let cancelled = expand_combinatorial_hit(&space, &hit, 100, 2, &cancel).unwrap();
        assert!(cancelled.is_cancelled());
        assert!(cancelled.value().is_empty());
    }

    #[test]
    fn four_positions_are_unsupported() {
        let space = toy_space(SpaceKind::Substructure);
        let mut hit = CombinatorialHit::new("amide");
        for p in ["w", "x", "y", "z"] {
            hit.positions.insert(p.into(), BTreeSet::new());
        }
        assert!(matches!(
            expand_combinatorial_hit(&space, &hit, 10, 1, &CancellationToken::new()),
            Err(SpaceError::Unsupported(_))
        ));
    }

    #[test]
    fn unknown_synthons_are_skipped() {
        let space = toy_space(SpaceKind::Substructure);
        let mut hit = full_hit(&space);
        if let Some(set) = hit.positions.get_mut("a") {
            set.insert(FragId::new("amide", "a", "Xe|"));
        }
        let products = expand_combinatorial_hit(&space, &hit, 100, 2, &CancellationToken::new())
            .unwrap()
            .into_inner();
        assert_eq!(products.len(), 4);
    }
}
