//! Approximate nearest-neighbour search over fingerprints.
//!
//! Candidates come from a bit-sampling LSH index: each hash function reads
//! `num_projection_bits` fixed positions of a fingerprint, and a query probes
//! its own bucket plus every bucket one flipped bit away in each table.
//! Candidates are then verified by exact Hamming distance, so results never
//! exceed the requested radius; recall is approximate.
//!
//! The radius for a Tanimoto threshold `t` is `ceil(popcount(q) * (1 - t))`.
//! This bounds Tanimoto from below for fingerprints of similar popcount and
//! is not an exact Tanimoto filter.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    path::Path,
};

use bit_set::BitSet;
use log::{debug, error};
use rand::{rngs::StdRng, seq::index::sample, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, SpaceError},
    fingerprint::{from_base64, hamming, to_base64},
    shards::{ResettableLines, ShardedStringMap},
};

/// LSH parameters. Persisted with similarity spaces.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LshConfig {
    pub num_hash_functions: usize,
    pub num_bits: usize,
    pub num_projection_bits: usize,
    pub seed: u64,
    /// Indices holding fewer distinct fingerprints than this are scanned
    /// exhaustively instead of through the hash tables.
    pub brute_force_below: usize,
}

impl Default for LshConfig {
    fn default() -> Self {
        Self {
            num_hash_functions: 8,
            num_bits: 512,
            num_projection_bits: 12,
            seed: 0x5eed_1e55,
            brute_force_below: 64,
        }
    }
}

impl LshConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_hash_functions == 0 {
            return Err(SpaceError::Config("num_hash_functions must be positive".into()));
        }
        if self.num_projection_bits == 0 || self.num_projection_bits > 64 {
            return Err(SpaceError::Config(format!(
                "num_projection_bits must be in 1..=64, got {}",
                self.num_projection_bits
            )));
        }
        if self.num_projection_bits > self.num_bits {
            return Err(SpaceError::Config(format!(
                "cannot sample {} of {} fingerprint bits",
                self.num_projection_bits, self.num_bits
            )));
        }
        Ok(())
    }
}

/// Hamming radius used for a query with `popcount` set bits.
pub fn hamming_radius(popcount: usize, threshold: f64) -> usize {
    let t = threshold.clamp(0.0, 1.0);
    (popcount as f64 * (1.0 - t) - 1e-9).ceil().max(0.0) as usize
}

#[derive(Debug)]
struct LshIndex {
    projections: Vec<Vec<usize>>,
    tables: Vec<HashMap<u64, Vec<u32>>>,
}

impl LshIndex {
    fn new(config: &LshConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let projections = (0..config.num_hash_functions)
            .map(|_| {
                let mut bits = sample(&mut rng, config.num_bits, config.num_projection_bits).into_vec();
                bits.sort_unstable();
                bits
            })
            .collect();
        Ok(Self {
            projections,
            tables: vec![HashMap::new(); config.num_hash_functions],
        })
    }

    fn key(projection: &[usize], fp: &BitSet) -> u64 {
        projection
            .iter()
            .enumerate()
            .fold(0, |key, (i, bit)| if fp.contains(*bit) { key | 1 << i } else { key })
    }

    fn insert(&mut self, item: u32, fp: &BitSet) {
        for (projection, table) in self.projections.iter().zip(&mut self.tables) {
            table.entry(Self::key(projection, fp)).or_default().push(item);
        }
    }

    fn candidates(&self, fp: &BitSet) -> BTreeSet<u32> {
        let mut out = BTreeSet::new();
        for (projection, table) in self.projections.iter().zip(&self.tables) {
            let key = Self::key(projection, fp);
            let probes = std::iter::once(key).chain((0..projection.len()).map(|i| key ^ 1 << i));
            for probe in probes {
                if let Some(items) = table.get(&probe) {
                    out.extend(items.iter().copied());
                }
            }
        }
        out
    }
}

#[derive(Debug)]
enum IdStore {
    InMemory(Vec<Vec<String>>),
    OutOfMemory(ShardedStringMap),
}

/// One verified neighbour of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    pub id: String,
    pub distance: usize,
}

/// Similarity index over fingerprints with attached structure identifiers.
/// Identical fingerprints are stored once; their identifiers are grouped.
#[derive(Debug)]
pub struct AnnIndex {
    config: LshConfig,
    lsh: LshIndex,
    fingerprints: Vec<BitSet>,
    ids: IdStore,
    len: usize,
}

impl AnnIndex {
    /// Index `(identifier, fingerprint)` pairs held in memory.
    pub fn in_memory(entries: impl IntoIterator<Item = (String, BitSet)>, config: LshConfig) -> Result<Self> {
        let mut lsh = LshIndex::new(&config)?;
        let mut slots: HashMap<BitSet, usize> = HashMap::new();
        let mut fingerprints = Vec::new();
        let mut ids: Vec<Vec<String>> = Vec::new();
        let mut len = 0;

        for (id, fp) in entries {
            check_width(&fp, &config)?;
            let slot = *slots.entry(fp.clone()).or_insert_with(|| {
                lsh.insert(fingerprints.len() as u32, &fp);
                fingerprints.push(fp);
                ids.push(Vec::new());
                ids.len() - 1
            });
            ids[slot].push(id);
            len += 1;
        }

        Ok(Self {
            config,
            lsh,
            fingerprints,
            ids: IdStore::InMemory(ids),
            len,
        })
    }

    /// Index a file of `encoding \t base64-fingerprint` lines. The file is
    /// streamed twice: once to build the LSH tables, once to write the
    /// identifier shards under `shard_dir`.
    pub fn out_of_memory(
        input: impl AsRef<Path>,
        shard_dir: impl AsRef<Path>,
        num_shards: usize,
        config: LshConfig,
    ) -> Result<Self> {
        let mut lsh = LshIndex::new(&config)?;
        let mut lines = ResettableLines::open(input)?;
        let mut seen: HashSet<BitSet> = HashSet::new();
        let mut fingerprints = Vec::new();
        let mut len = 0;

        for line in lines.by_ref() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let (_, fp) = parse_line(&line)?;
            check_width(&fp, &config)?;
            if seen.insert(fp.clone()) {
                lsh.insert(fingerprints.len() as u32, &fp);
                fingerprints.push(fp);
            }
            len += 1;
        }
        debug!(
            "indexed {len} structures with {} distinct fingerprints from {:?}",
            fingerprints.len(),
            lines.path()
        );

        lines.reset()?;
        let mut failure = None;
        let entries = lines.map_while(|line| {
            let parsed = line
                .map_err(SpaceError::from)
                .and_then(|l| if l.trim().is_empty() { Ok(None) } else { parse_line(&l).map(Some) });
            match parsed {
                Ok(entry) => Some(entry),
                Err(e) => {
                    failure = Some(e);
                    None
                }
            }
        });
        let shards = ShardedStringMap::build(
            shard_dir,
            num_shards,
            entries.flatten().map(|(id, fp)| (to_base64(&fp, config.num_bits), id)),
        )?;
        if let Some(e) = failure {
            return Err(e);
        }

        Ok(Self {
            config,
            lsh,
            fingerprints,
            ids: IdStore::OutOfMemory(shards),
            len,
        })
    }

    pub fn config(&self) -> &LshConfig {
        &self.config
    }

    /// Number of indexed identifiers.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn num_fingerprints(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_out_of_memory(&self) -> bool {
        matches!(self.ids, IdStore::OutOfMemory(_))
    }

    /// Neighbours of `query` within the Hamming radius implied by
    /// `threshold`, closest first, at most `max_results`.
    pub fn search(&self, query: &BitSet, threshold: f64, max_results: usize) -> Vec<Neighbor> {
        self.search_batch(&[(query.clone(), threshold)], max_results)
            .pop()
            .unwrap_or_default()
    }

    /// Search several `(fingerprint, threshold)` queries. Identical queries are
    /// probed once and their result shared. For out-of-memory indices all
    /// identifier lookups of the batch go to disk together; shard read errors
    /// are logged and the affected identifiers are missing from the result.
    pub fn search_batch(&self, queries: &[(BitSet, f64)], max_results: usize) -> Vec<Vec<Neighbor>> {
        let mut distinct: HashMap<(&BitSet, usize), usize> = HashMap::new();
        let mut probes: Vec<Vec<(usize, usize)>> = Vec::new();
        let slots: Vec<usize> = queries
            .iter()
            .map(|(fp, threshold)| {
                let radius = hamming_radius(fp.len(), *threshold);
                *distinct.entry((fp, radius)).or_insert_with(|| {
                    probes.push(self.probe(fp, radius));
                    probes.len() - 1
                })
            })
            .collect();
        debug!("{} queries, {} distinct", queries.len(), probes.len());

        let resolved: Vec<Vec<Neighbor>> = match &self.ids {
            IdStore::InMemory(ids) => probes
                .iter()
                .map(|matches| {
                    matches
                        .iter()
                        .flat_map(|(slot, d)| {
                            ids[*slot].iter().map(|id| Neighbor {
                                id: id.clone(),
                                distance: *d,
                            })
                        })
                        .take(max_results)
                        .collect()
                })
                .collect(),
            IdStore::OutOfMemory(shards) => {
                let keys: BTreeSet<String> = probes
                    .iter()
                    .flatten()
                    .map(|(slot, _)| to_base64(&self.fingerprints[*slot], self.config.num_bits))
                    .collect();
                let lookup = shards.get_batch(keys.iter().map(String::as_str));
                for e in &lookup.errors {
                    error!("identifier lookup failed, returning partial results: {e}");
                }
                probes
                    .iter()
                    .map(|matches| {
                        matches
                            .iter()
                            .flat_map(|(slot, d)| {
                                let key = to_base64(&self.fingerprints[*slot], self.config.num_bits);
                                lookup
                                    .values
                                    .get(&key)
                                    .cloned()
                                    .unwrap_or_default()
                                    .into_iter()
                                    .map(|id| Neighbor { id, distance: *d })
                            })
                            .take(max_results)
                            .collect()
                    })
                    .collect()
            }
        };

        slots.into_iter().map(|s| resolved[s].clone()).collect()
    }

    /// Verified `(slot, distance)` matches, closest first, ties by insertion.
    fn probe(&self, query: &BitSet, radius: usize) -> Vec<(usize, usize)> {
        let candidates: Vec<usize> = if self.fingerprints.len() < self.config.brute_force_below {
            (0..self.fingerprints.len()).collect()
        } else {
            self.lsh.candidates(query).into_iter().map(|slot| slot as usize).collect()
        };
        let mut matches: Vec<(usize, usize)> = candidates
            .into_iter()
            .filter_map(|slot| {
                let d = hamming(query, &self.fingerprints[slot]);
                (d <= radius).then_some((slot, d))
            })
            .collect();
        matches.sort_by_key(|(slot, d)| (*d, *slot));
        matches
    }
}

fn parse_line(line: &str) -> Result<(String, BitSet)> {
    let mut fields = line.split('\t');
    match (fields.next(), fields.next()) {
        (Some(id), Some(fp)) if !id.is_empty() => Ok((id.to_string(), from_base64(fp)?)),
        _ => Err(SpaceError::Config(format!("expected `encoding\\tfingerprint`, got `{line}`"))),
    }
}

fn check_width(fp: &BitSet, config: &LshConfig) -> Result<()> {
    match fp.iter().last() {
        Some(bit) if bit >= config.num_bits => Err(SpaceError::Config(format!(
            "fingerprint bit {bit} exceeds configured width {}",
            config.num_bits
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, io::Write};

    use super::*;

    fn fp(bits: &[usize]) -> BitSet {
        bits.iter().copied().collect()
    }

    fn small_config() -> LshConfig {
        LshConfig {
            num_hash_functions: 8,
            num_bits: 64,
            num_projection_bits: 6,
            seed: 7,
            brute_force_below: 0,
        }
    }

    fn library() -> Vec<(String, BitSet)> {
        vec![
            ("a".to_string(), fp(&[1, 2, 3, 4, 5, 6, 7, 8])),
            ("b".to_string(), fp(&[1, 2, 3, 4, 5, 6, 7, 9])),
            ("c".to_string(), fp(&[1, 2, 3, 4, 5, 6, 7, 8])),
            ("d".to_string(), fp(&[40, 41, 42, 43, 44, 45, 46, 47])),
        ]
    }

    #[test]
    fn radius_follows_threshold() {
        assert_eq!(hamming_radius(10, 1.0), 0);
        assert_eq!(hamming_radius(10, 0.7), 3);
        assert_eq!(hamming_radius(10, 0.75), 3);
        assert_eq!(hamming_radius(0, 0.5), 0);
        let mut last = usize::MAX;
        for step in 0..=20 {
            let r = hamming_radius(37, step as f64 / 20.0);
            assert!(r <= last);
            last = r;
        }
    }

    #[test]
    fn exact_match_groups_identifiers() {
        let index = AnnIndex::in_memory(library(), small_config()).unwrap();
        assert_eq!(index.len(), 4);
        assert_eq!(index.num_fingerprints(), 3);

        let hits = index.search(&fp(&[1, 2, 3, 4, 5, 6, 7, 8]), 1.0, 10);
        let ids: Vec<&str> = hits.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert!(hits.iter().all(|n| n.distance == 0));
    }

    #[test]
    fn results_are_ordered_and_capped() {
        let index = AnnIndex::in_memory(library(), small_config()).unwrap();
        let hits = index.search(&fp(&[1, 2, 3, 4, 5, 6, 7, 8]), 0.7, 10);
        assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
        assert!(hits.iter().all(|n| n.id != "d"));
        assert_eq!(index.search(&fp(&[1, 2, 3, 4, 5, 6, 7, 8]), 0.7, 1).len(), 1);
    }

    #[test]
    fn tighter_threshold_never_returns_more() {
        let index = AnnIndex::in_memory(library(), small_config()).unwrap();
        let query = fp(&[1, 2, 3, 4, 5, 6, 7, 10]);
        let mut last = usize::MAX;
        for step in 0..=10 {
            let n = index.search(&query, step as f64 / 10.0, 100).len();
            assert!(n <= last);
            last = n;
        }
    }

    #[test]
    fn small_indices_are_scanned_exhaustively() {
        let config = LshConfig {
            brute_force_below: 64,
            ..small_config()
        };
        let index = AnnIndex::in_memory(library(), config).unwrap();
        let hits = index.search(&fp(&[1, 2, 3, 4, 60, 61, 62, 63]), 0.0, 10);
        let ids: Vec<&str> = hits.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
        assert!(hits.iter().all(|n| n.distance == 8));
    }

    #[test]
    fn batch_dedups_and_fans_out() {
        let index = AnnIndex::in_memory(library(), small_config()).unwrap();
        let q = fp(&[40, 41, 42, 43, 44, 45, 46, 47]);
        let out = index.search_batch(&[(q.clone(), 1.0), (fp(&[63]), 1.0), (q, 1.0)], 5);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], out[2]);
        assert_eq!(out[0][0].id, "d");
        assert!(out[1].is_empty());
    }

    #[test]
    fn rejects_bad_config_and_width() {
        let config = LshConfig {
            num_projection_bits: 0,
            ..small_config()
        };
        assert!(AnnIndex::in_memory(library(), config).is_err());
        let wide = vec![("x".to_string(), fp(&[64]))];
        assert!(matches!(
            AnnIndex::in_memory(wide, small_config()),
            Err(SpaceError::Config(_))
        ));
    }

    #[test]
    fn out_of_memory_matches_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("fingerprints.tsv");
        let mut file = fs::File::create(&input).unwrap();
        for (id, bits) in library() {
            writeln!(file, "{id}\t{}", to_base64(&bits, 64)).unwrap();
        }
        drop(file);

        let disk = AnnIndex::out_of_memory(&input, dir.path().join("shards"), 3, small_config()).unwrap();
        let memory = AnnIndex::in_memory(library(), small_config()).unwrap();
        assert!(disk.is_out_of_memory());
        assert_eq!(disk.len(), memory.len());
        for (_, bits) in library() {
            assert_eq!(disk.search(&bits, 0.8, 10), memory.search(&bits, 0.8, 10));
        }
    }

    #[test]
    fn out_of_memory_rejects_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("bad.tsv");
        fs::write(&input, "only-one-field\n").unwrap();
        assert!(AnnIndex::out_of_memory(&input, dir.path().join("s"), 2, small_config()).is_err());
    }

    #[test]
    fn lost_shard_degrades_to_partial_results() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("fingerprints.tsv");
        let lines: Vec<String> = library()
            .into_iter()
            .map(|(id, bits)| format!("{id}\t{}", to_base64(&bits, 64)))
            .collect();
        fs::write(&input, lines.join("\n")).unwrap();
        let shards = dir.path().join("shards");
        let index = AnnIndex::out_of_memory(&input, &shards, 1, small_config()).unwrap();
        fs::remove_file(shards.join("shard-0.tsv")).unwrap();
        assert!(index.search(&fp(&[1, 2, 3, 4, 5, 6, 7, 8]), 1.0, 10).is_empty());
    }
}
