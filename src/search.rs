//! Substructure and similarity search over registered synthon spaces.
//!
//! A query is cut into one to three fragments. The cut connectors are
//! relabelled onto each reaction's connector classes, and each fragment is
//! assigned to a position whose synthons carry matching classes. Every
//! position is then screened independently (substructure match, or a
//! fingerprint search restricted to compatible topology buckets), the
//! surviving synthons form a [`CombinatorialHit`], and hits are expanded and
//! verified against the whole query in parallel.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    path::Path,
    sync::Arc,
};

use bit_set::BitSet;
use dashmap::DashMap;
use log::{debug, info, warn};
use parking_lot::RwLock;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    ann::AnnIndex,
    cancel::{CancellationToken, Outcome},
    canonize::canonical_encoding,
    error::{Result, SpaceError},
    fingerprint::tanimoto,
    loader,
    molecule::{classes_in, ConnectorClass, Molecule},
    space::{expand_hits, CombinatorialHit, FragId, Product, Reaction, SpaceKind, Synthon, SynthonSpace},
    split::{compute_all_valid_splits, SplitConfig, SplitResult},
    substructure::is_substructure,
    topology::{compute_topo_info, TopoInfo, TopologyIndex, TopologyTolerance},
    utils::permutations,
};

/// Search-wide settings shared by every registered space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Budget for cutting queries into fragments. At most three fragments
    /// are used regardless of this setting.
    pub split: SplitConfig,
    pub tolerance: TopologyTolerance,
    /// Most combinatorial hits formed per query.
    pub max_combinatorial_hits: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            split: SplitConfig::default(),
            tolerance: TopologyTolerance::default(),
            max_combinatorial_hits: 10_000,
        }
    }
}

/// Knobs of a similarity query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityParams {
    /// Minimum Tanimoto similarity of a final hit.
    pub threshold: f64,
    /// Neighbours requested from each bucket's index.
    pub primary_hits_screened: usize,
    /// Closest candidates kept per position.
    pub primary_hits_considered: usize,
    /// Products assembled per combinatorial hit.
    pub num_expansions: usize,
    /// Restrict the search to these reactions.
    pub allowed_reactions: Option<BTreeSet<String>>,
}

impl Default for SimilarityParams {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            primary_hits_screened: 1000,
            primary_hits_considered: 100,
            num_expansions: 1000,
            allowed_reactions: None,
        }
    }
}

/// A verified product.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub space: String,
    pub reaction: String,
    pub fragments: Vec<FragId>,
    pub encoding: String,
    pub molecule: Molecule,
    /// Tanimoto similarity to the query, for similarity searches.
    pub similarity: Option<f64>,
}

type PositionKey = (String, String);

/// Per-(reaction, position) topology buckets, each with its own ANN index.
#[derive(Debug, Default)]
pub struct SimilarityIndices {
    topology: TopologyIndex<PositionKey, String>,
    searchers: DashMap<(PositionKey, TopoInfo), AnnIndex>,
}

impl SimilarityIndices {
    pub fn num_searchers(&self) -> usize {
        self.searchers.len()
    }

    pub fn topology(&self) -> &TopologyIndex<PositionKey, String> {
        &self.topology
    }
}

/// Build one ANN index per `(reaction, position, signature)` bucket of a
/// similarity space. Groups are built concurrently on `threads` workers.
pub fn build_similarity_indices(space: &SynthonSpace, threads: usize) -> Result<SimilarityIndices> {
    let Some(lsh) = space.lsh().copied() else {
        return Err(SpaceError::KindMismatch {
            name: space.name().to_string(),
            expected: SpaceKind::Similarity.to_string(),
            found: space.kind().to_string(),
        });
    };

    let groups: Vec<(&Reaction, usize)> = space
        .reactions()
        .flat_map(|r| (0..r.positions.len()).map(move |p| (r, p)))
        .collect();
    let indices = SimilarityIndices::default();
    let pool = rayon::ThreadPoolBuilder::new().num_threads(threads.max(1)).build()?;

    pool.install(|| {
        groups.par_iter().try_for_each(|(reaction, p)| -> Result<()> {
            let position = &reaction.positions[*p];
            let key = (reaction.id.clone(), position.id.clone());
            let mut buckets: BTreeMap<TopoInfo, Vec<&Synthon>> = BTreeMap::new();
            for synthon in &position.synthons {
                buckets.entry(synthon.topo.clone()).or_default().push(synthon);
            }

            let mut group = BTreeMap::new();
            for (topo, synthons) in buckets {
                let entries = synthons.iter().filter_map(|s| {
                    let fp = s.id.fingerprint.clone();
                    if fp.is_none() {
                        warn!("synthon {} has no fingerprint", s.id);
                    }
                    Some((s.id.encoding.clone(), fp?))
                });
                let index = AnnIndex::in_memory(entries, lsh)?;
                indices.searchers.insert((key.clone(), topo.clone()), index);
                group.insert(topo, synthons.iter().map(|s| s.id.encoding.clone()).collect());
            }
            indices.topology.insert_group(key, group);
            Ok(())
        })
    })?;

    debug!(
        "space `{}`: {} similarity indices over {} positions",
        space.name(),
        indices.searchers.len(),
        groups.len()
    );
    Ok(indices)
}

#[derive(Debug)]
struct RegisteredSpace {
    space: SynthonSpace,
    indices: Option<SimilarityIndices>,
}

/// Owns named spaces and answers queries against them.
#[derive(Debug, Default)]
pub struct SpaceSearchOrchestrator {
    config: SearchConfig,
    spaces: RwLock<BTreeMap<String, Arc<RegisteredSpace>>>,
}

/// Fragments of the query placed on positions of one reaction.
struct Plan<'a> {
    reaction: &'a Reaction,
    /// Relabelled fragment and the index of its position.
    assignments: Vec<(Molecule, usize)>,
}

impl SpaceSearchOrchestrator {
    pub fn new(config: SearchConfig) -> Result<Self> {
        config.split.validate()?;
        Ok(Self {
            config,
            spaces: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Register `space`, building its similarity indices first if it is a
    /// similarity space. Nothing is registered if this fails.
    pub fn register(&self, space: SynthonSpace, threads: usize) -> Result<()> {
        let name = space.name().to_string();
        if self.spaces.read().contains_key(&name) {
            return Err(SpaceError::DuplicateSpace(name));
        }
        let indices = match space.kind() {
            SpaceKind::Similarity => Some(build_similarity_indices(&space, threads)?),
            SpaceKind::Substructure => None,
        };

        let mut spaces = self.spaces.write();
        if spaces.contains_key(&name) {
            return Err(SpaceError::DuplicateSpace(name));
        }
        info!("registered {} space `{name}`", space.kind());
        spaces.insert(name, Arc::new(RegisteredSpace { space, indices }));
        Ok(())
    }

    /// Load and register the space described at `descriptor_path`, which
    /// must be of kind `expected`. Returns the space name.
    pub fn load_space(&self, descriptor_path: &Path, expected: SpaceKind, threads: usize) -> Result<String> {
        let descriptor = loader::read_descriptor(descriptor_path)?;
        if descriptor.kind != expected {
            return Err(SpaceError::KindMismatch {
                name: descriptor.name,
                expected: expected.to_string(),
                found: descriptor.kind.to_string(),
            });
        }
        let space = loader::load_space(descriptor_path)?;
        let name = space.name().to_string();
        self.register(space, threads)?;
        Ok(name)
    }

    pub fn space_names(&self) -> Vec<String> {
        self.spaces.read().keys().cloned().collect()
    }

    fn entry(&self, name: &str) -> Result<Arc<RegisteredSpace>> {
        self.spaces
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SpaceError::UnknownSpace(name.to_string()))
    }

    /// Products of space `space_name` that contain `query`. At most
    /// `max_full_extensions` products are assembled per combinatorial hit.
    /// Cancelling `cancel` stops the search early with
    /// [`Outcome::Cancelled`] and whatever was verified so far.
    pub fn find_substructures(
        &self,
        space_name: &str,
        query: &Molecule,
        max_full_extensions: usize,
        threads: usize,
        cancel: &CancellationToken,
    ) -> Result<Outcome<Vec<SearchHit>>> {
        let entry = self.entry(space_name)?;
        let space = &entry.space;
        let plans = self.plans(space, query, false, None, cancel);
        let pool = rayon::ThreadPoolBuilder::new().num_threads(threads.max(1)).build()?;

        let hits: Vec<CombinatorialHit> = pool.install(|| {
            plans
                .par_iter()
                .filter_map(|plan| {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    let mut screened = HashMap::new();
                    for (fragment, p) in &plan.assignments {
                        let matches: BTreeSet<FragId> = plan.reaction.positions[*p]
                            .synthons
                            .iter()
                            .filter(|s| is_substructure(fragment, &s.molecule))
                            .map(|s| s.id.clone())
                            .collect();
                        if matches.is_empty() {
                            return None;
                        }
                        screened.insert(*p, matches);
                    }
                    Some(hit_for(plan.reaction, screened))
                })
                .collect()
        });

        let products = self.expand(space, hits, max_full_extensions, threads, cancel)?;
        let mut found: Vec<SearchHit> = pool.install(|| {
            products
                .into_par_iter()
                .filter(|p| is_substructure(query, &p.molecule))
                .map(|p| to_hit(space, p, None))
                .collect()
        });
        found.sort_by(|a, b| (&a.reaction, &a.fragments).cmp(&(&b.reaction, &b.fragments)));
        info!("substructure search in `{space_name}`: {} hits", found.len());
        Ok(finish(found, cancel))
    }

    /// Products of similarity space `space_name` with Tanimoto similarity to
    /// `query` of at least `params.threshold`, most similar first.
    pub fn find_similar(
        &self,
        space_name: &str,
        query: &Molecule,
        params: &SimilarityParams,
        threads: usize,
        cancel: &CancellationToken,
    ) -> Result<Outcome<Vec<SearchHit>>> {
        let entry = self.entry(space_name)?;
        let space = &entry.space;
        let Some(indices) = &entry.indices else {
            return Err(SpaceError::KindMismatch {
                name: space_name.to_string(),
                expected: SpaceKind::Similarity.to_string(),
                found: space.kind().to_string(),
            });
        };
        let fingerprints = space.fingerprints();
        let query_fp = fingerprints.get_fingerprint(query);

        let plans = self.plans(space, query, true, params.allowed_reactions.as_ref(), cancel);
        let pool = rayon::ThreadPoolBuilder::new().num_threads(threads.max(1)).build()?;
        let hits: Vec<CombinatorialHit> = pool.install(|| {
            plans
                .par_iter()
                .filter_map(|plan| {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    let mut screened = HashMap::new();
                    for (fragment, p) in &plan.assignments {
                        let candidates = self.screen_similar(space, indices, plan.reaction, *p, fragment, params);
                        if candidates.is_empty() {
                            return None;
                        }
                        screened.insert(*p, candidates);
                    }
                    Some(hit_for(plan.reaction, screened))
                })
                .collect()
        });

        let products = self.expand(space, hits, params.num_expansions, threads, cancel)?;
        let mut found: Vec<SearchHit> = pool.install(|| {
            products
                .into_par_iter()
                .filter_map(|p| {
                    let similarity = tanimoto(&query_fp, &fingerprints.fingerprint_for(&p.encoding, &p.molecule));
                    (similarity >= params.threshold).then(|| to_hit(space, p, Some(similarity)))
                })
                .collect()
        });
        found.sort_by(|a, b| {
            b.similarity
                .unwrap_or(0.0)
                .total_cmp(&a.similarity.unwrap_or(0.0))
                .then_with(|| (&a.reaction, &a.fragments).cmp(&(&b.reaction, &b.fragments)))
        });
        info!("similarity search in `{space_name}`: {} hits", found.len());
        Ok(finish(found, cancel))
    }

    /// Closest synthons of position `p` to `fragment`, searched only in
    /// buckets whose signature is compatible with the fragment's.
    fn screen_similar(
        &self,
        space: &SynthonSpace,
        indices: &SimilarityIndices,
        reaction: &Reaction,
        p: usize,
        fragment: &Molecule,
        params: &SimilarityParams,
    ) -> BTreeSet<FragId> {
        let position = &reaction.positions[p];
        let key = (reaction.id.clone(), position.id.clone());
        let fp = space.fingerprints().get_fingerprint(fragment);
        let topo = compute_topo_info(fragment);
        let buckets = match indices
            .topology
            .compatible_buckets(&key, &topo, &self.config.tolerance)
        {
            Ok(buckets) => buckets,
            Err(e) => {
                debug!("skipping fragment at {}/{}: {e}", reaction.id, position.id);
                return BTreeSet::new();
            }
        };

        let mut best: HashMap<String, usize> = HashMap::new();
        for bucket in buckets {
            let Some(searcher) = indices.searchers.get(&(key.clone(), bucket)) else {
                continue;
            };
            for n in searcher.search(&fp, params.threshold, params.primary_hits_screened) {
                let d = best.entry(n.id).or_insert(n.distance);
                *d = (*d).min(n.distance);
            }
        }

        let mut ranked: Vec<(usize, String)> = best.into_iter().map(|(e, d)| (d, e)).collect();
        ranked.sort();
        ranked.truncate(params.primary_hits_considered);
        ranked
            .into_iter()
            .filter_map(|(_, e)| position.synthon(&e).map(|s| s.id.clone()))
            .collect()
    }

    fn expand(
        &self,
        space: &SynthonSpace,
        mut hits: Vec<CombinatorialHit>,
        max_products: usize,
        threads: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Product>> {
        if hits.len() > self.config.max_combinatorial_hits {
            warn!(
                "{} combinatorial hits, keeping the first {}",
                hits.len(),
                self.config.max_combinatorial_hits
            );
            hits.truncate(self.config.max_combinatorial_hits);
        }
        match expand_hits(space, &hits, max_products, threads, cancel)? {
            Outcome::Complete(products) => Ok(products),
            Outcome::Cancelled(products) => {
                warn!("search cancelled after {} products", products.len());
                Ok(products)
            }
        }
    }

    /// Every placement of query fragments on reaction positions. With
    /// `exact_cover`, fragments must fill every position of the reaction and
    /// carry exactly the position's connector classes; otherwise a fragment's
    /// classes need only be carried by its position.
    fn plans<'a>(
        &self,
        space: &'a SynthonSpace,
        query: &Molecule,
        exact_cover: bool,
        allowed: Option<&BTreeSet<String>>,
        cancel: &CancellationToken,
    ) -> Vec<Plan<'a>> {
        let splits = query_splits(query, &self.config.split, cancel);
        let mut seen: BTreeSet<(String, Vec<(String, usize)>)> = BTreeSet::new();
        let mut plans = Vec::new();

        for reaction in space.reactions() {
            if allowed.is_some_and(|a| !a.contains(&reaction.id)) {
                continue;
            }
            let num_positions = reaction.positions.len();
            for split in &splits {
                let k = split.fragments.len();
                if k > num_positions || (exact_cover && k != num_positions) {
                    continue;
                }
                for labels in relabelings(split.cut_set.len(), reaction.classes()) {
                    let fragments: Vec<Molecule> = split
                        .fragments
                        .iter()
                        .map(|f| f.relabel_connectors(|c| labels.get(c.index()).copied().unwrap_or(c)))
                        .collect();
                    for assignment in placements(&fragments, reaction, exact_cover) {
                        let mut key: Vec<(String, usize)> = fragments
                            .iter()
                            .zip(&assignment)
                            .map(|(f, p)| (canonical_encoding(f), *p))
                            .collect();
                        key.sort();
                        if !seen.insert((reaction.id.clone(), key)) {
                            continue;
                        }
                        plans.push(Plan {
                            reaction,
                            assignments: fragments.iter().cloned().zip(assignment).collect(),
                        });
                    }
                }
            }
        }
        debug!("{} query placements from {} splits", plans.len(), splits.len());
        plans
    }
}

fn finish(found: Vec<SearchHit>, cancel: &CancellationToken) -> Outcome<Vec<SearchHit>> {
    if cancel.is_cancelled() {
        Outcome::Cancelled(found)
    } else {
        Outcome::Complete(found)
    }
}

/// The uncut query followed by every valid split into at most three
/// fragments.
fn query_splits(query: &Molecule, config: &SplitConfig, cancel: &CancellationToken) -> Vec<SplitResult> {
    let whole = SplitResult {
        cut_set: Vec::new(),
        fragments: vec![query.clone()],
        fragment_bonds: vec![(0..query.bond_count()).collect::<BitSet>()],
    };
    let config = SplitConfig {
        max_fragments: config.max_fragments.min(3),
        ..*config
    };
    let splits = compute_all_valid_splits(query, &config, cancel);
    if splits.is_cancelled() {
        warn!("query splitting cancelled");
    }
    std::iter::once(whole)
        .chain(splits.into_inner().into_values())
        .collect()
}

/// Injective maps from the `cuts` query connector classes onto the classes in
/// `reaction_classes`, as lookup tables indexed by query class.
fn relabelings(cuts: usize, reaction_classes: u8) -> Vec<Vec<ConnectorClass>> {
    let available: Vec<ConnectorClass> = classes_in(reaction_classes).collect();
    if cuts > available.len() {
        return Vec::new();
    }
    let unique: BTreeSet<Vec<ConnectorClass>> = permutations(available.len())
        .into_iter()
        .map(|perm| perm[..cuts].iter().map(|i| available[*i]).collect())
        .collect();
    unique.into_iter().collect()
}

/// Injective placements of `fragments` on the reaction's positions.
fn placements(fragments: &[Molecule], reaction: &Reaction, exact_cover: bool) -> Vec<Vec<usize>> {
    let classes: Vec<u8> = fragments.iter().map(Molecule::connector_classes).collect();
    let fits = |f: usize, p: usize| {
        let position = reaction.positions[p].classes;
        if exact_cover {
            classes[f] == position
        } else {
            classes[f] & !position == 0
        }
    };
    let unique: BTreeSet<Vec<usize>> = permutations(reaction.positions.len())
        .into_iter()
        .map(|perm| perm[..fragments.len()].to_vec())
        .filter(|placement| placement.iter().enumerate().all(|(f, p)| fits(f, *p)))
        .collect();
    unique.into_iter().collect()
}

/// Combinatorial hit with the screened positions and, for every other
/// position, all of its synthons.
fn hit_for(reaction: &Reaction, mut screened: HashMap<usize, BTreeSet<FragId>>) -> CombinatorialHit {
    let mut hit = CombinatorialHit::new(reaction.id.clone());
    for (p, position) in reaction.positions.iter().enumerate() {
        let set = screened
            .remove(&p)
            .unwrap_or_else(|| position.synthons.iter().map(|s| s.id.clone()).collect());
        hit.positions.insert(position.id.clone(), set);
    }
    hit
}

fn to_hit(space: &SynthonSpace, product: Product, similarity: Option<f64>) -> SearchHit {
    SearchHit {
        space: space.name().to_string(),
        reaction: product
            .fragments
            .first()
            .map(|f| f.reaction.clone())
            .unwrap_or_default(),
        fragments: product.fragments,
        encoding: product.encoding,
        molecule: product.molecule,
        similarity,
    }
}
