//! Disk-backed string maps and resettable line streams for indices that do
//! not fit in memory.

use std::{
    collections::{HashMap, HashSet},
    fs::{self, File},
    io::{self, BufRead, BufReader, BufWriter, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use log::{debug, error};
use rayon::prelude::*;

use crate::{
    error::{Result, SpaceError},
    utils::fnv1a,
};

/// Line iterator over a file that can be rewound for another pass.
#[derive(Debug)]
pub struct ResettableLines {
    path: PathBuf,
    reader: BufReader<File>,
    buf: String,
}

impl ResettableLines {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let reader = BufReader::new(File::open(&path)?);
        Ok(Self {
            path,
            reader,
            buf: String::new(),
        })
    }

    /// Rewind to the first line.
    pub fn reset(&mut self) -> Result<()> {
        self.reader.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Iterator for ResettableLines {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.buf.clear();
        match self.reader.read_line(&mut self.buf) {
            Ok(0) => None,
            Ok(_) => Some(Ok(self.buf.trim_end_matches(['\n', '\r']).to_string())),
            Err(e) => Some(Err(e)),
        }
    }
}

/// Result of a batched lookup. Shards that failed to read are reported in
/// `errors`; `values` holds everything read from the other shards.
#[derive(Debug, Default)]
pub struct BatchLookup {
    pub values: HashMap<String, Vec<String>>,
    pub errors: Vec<SpaceError>,
}

/// Multimap from string keys to string values stored in `num_shards` TSV
/// files (`shard-<i>.tsv`), one `key\tvalue` per line. Keys and values must
/// not contain tabs or newlines.
#[derive(Debug, Clone)]
pub struct ShardedStringMap {
    dir: PathBuf,
    num_shards: usize,
}

impl ShardedStringMap {
    /// Write `entries` into a fresh set of shards under `dir`.
    pub fn build(
        dir: impl AsRef<Path>,
        num_shards: usize,
        entries: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self> {
        if num_shards == 0 {
            return Err(SpaceError::Config("a sharded map needs at least one shard".into()));
        }
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut writers = (0..num_shards)
            .map(|i| -> Result<BufWriter<File>> {
                Ok(BufWriter::new(File::create(shard_path(&dir, i))?))
            })
            .collect::<Result<Vec<_>>>()?;
        let mut count = 0usize;
        for (key, value) in entries {
            let shard = shard_of(&key, num_shards);
            writeln!(writers[shard], "{key}\t{value}")?;
            count += 1;
        }
        for w in &mut writers {
            w.flush()?;
        }
        debug!("wrote {count} entries into {num_shards} shards under {dir:?}");
        Ok(Self { dir, num_shards })
    }

    /// Attach to shards previously written by [`Self::build`].
    pub fn open(dir: impl AsRef<Path>, num_shards: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        for i in 0..num_shards {
            let path = shard_path(&dir, i);
            if !path.is_file() {
                return Err(SpaceError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("missing shard {path:?}"),
                )));
            }
        }
        Ok(Self { dir, num_shards })
    }

    pub fn num_shards(&self) -> usize {
        self.num_shards
    }

    pub fn get(&self, key: &str) -> Result<Vec<String>> {
        let mut lookup = self.get_batch([key]);
        match lookup.errors.pop() {
            Some(e) => Err(e),
            None => Ok(lookup.values.remove(key).unwrap_or_default()),
        }
    }

    /// Look up many keys, reading each involved shard once. Shards are read
    /// in parallel.
    pub fn get_batch<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> BatchLookup {
        let mut per_shard: HashMap<usize, HashSet<&str>> = HashMap::new();
        for key in keys {
            per_shard
                .entry(shard_of(key, self.num_shards))
                .or_default()
                .insert(key);
        }

        let results: Vec<_> = per_shard
            .into_par_iter()
            .map(|(shard, wanted)| self.scan_shard(shard, &wanted))
            .collect();

        let mut lookup = BatchLookup::default();
        for result in results {
            match result {
                Ok(found) => {
                    for (k, mut v) in found {
                        lookup.values.entry(k).or_default().append(&mut v);
                    }
                }
                Err(e) => {
                    error!("shard lookup under {:?} failed: {e}", self.dir);
                    lookup.errors.push(e);
                }
            }
        }
        lookup
    }

    fn scan_shard(&self, shard: usize, wanted: &HashSet<&str>) -> Result<HashMap<String, Vec<String>>> {
        let reader = BufReader::new(File::open(shard_path(&self.dir, shard))?);
        let mut found: HashMap<String, Vec<String>> = HashMap::new();
        for line in reader.lines() {
            let line = line?;
            let Some((key, value)) = line.split_once('\t') else {
                continue;
            };
            if wanted.contains(key) {
                found.entry(key.to_string()).or_default().push(value.to_string());
            }
        }
        Ok(found)
    }
}

fn shard_of(key: &str, num_shards: usize) -> usize {
    (fnv1a(key.as_bytes()) % num_shards as u64) as usize
}

fn shard_path(dir: &Path, shard: usize) -> PathBuf {
    dir.join(format!("shard-{shard}.tsv"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_can_be_read_twice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.tsv");
        fs::write(&path, "a\t1\nb\t2\r\nc\t3").unwrap();

        let mut lines = ResettableLines::open(&path).unwrap();
        let first: Vec<String> = lines.by_ref().map(|l| l.unwrap()).collect();
        assert_eq!(first, vec!["a\t1", "b\t2", "c\t3"]);
        lines.reset().unwrap();
        assert_eq!(lines.count(), 3);
    }

    #[test]
    fn batch_lookup_spans_shards() {
        let dir = tempfile::tempdir().unwrap();
        let entries = (0..50).map(|i| (format!("k{}", i % 20), format!("v{i}")));
        let map = ShardedStringMap::build(dir.path(), 4, entries).unwrap();

        let keys: Vec<String> = (0..25).map(|i| format!("k{i}")).collect();
        let lookup = map.get_batch(keys.iter().map(String::as_str));
        assert!(lookup.errors.is_empty());
        assert_eq!(lookup.values.len(), 20);
        assert_eq!(lookup.values["k3"], vec!["v3", "v23", "v43"]);
        assert!(map.get("k99").unwrap().is_empty());

        let reopened = ShardedStringMap::open(dir.path(), 4).unwrap();
        assert_eq!(reopened.get("k0").unwrap().len(), 3);
    }

    #[test]
    fn missing_shard_is_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let entries = (0..40).map(|i| (format!("k{i}"), format!("v{i}")));
        let map = ShardedStringMap::build(dir.path(), 2, entries).unwrap();
        fs::remove_file(shard_path(dir.path(), 0)).unwrap();

        let keys: Vec<String> = (0..40).map(|i| format!("k{i}")).collect();
        let lookup = map.get_batch(keys.iter().map(String::as_str));
        assert_eq!(lookup.errors.len(), 1);
        assert!(!lookup.values.is_empty());
        assert!(lookup.values.len() < 40);
        assert!(ShardedStringMap::open(dir.path(), 2).is_err());
    }

    #[test]
    fn zero_shards_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ShardedStringMap::build(dir.path(), 0, Vec::<(String, String)>::new()),
            Err(SpaceError::Config(_))
        ));
    }
}
