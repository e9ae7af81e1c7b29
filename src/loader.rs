//! Reading and writing space descriptors, inventory blobs and synthon TSVs.
//!
//! A space on disk is a one-row CSV descriptor (`name,version,provider,kind,file`)
//! next to a JSON blob holding the reaction inventory:
//!
//! ```json
//! { "fingerprint": "path", "lsh": { ... },
//!   "reactions": [ { "id": "r1", "positions": [ { "id": "0", "synthons": ["C.U|0-1"] } ] } ] }
//! ```

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

use log::info;
use serde::{Deserialize, Serialize};

use crate::{
    ann::LshConfig,
    canonize::{canonical_encoding, parse_encoding},
    error::{Result, SpaceError},
    molecule::Molecule,
    space::{SpaceDescriptor, SynthonSpace},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceBlob {
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lsh: Option<LshConfig>,
    pub reactions: Vec<ReactionBlob>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionBlob {
    pub id: String,
    pub positions: Vec<PositionBlob>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionBlob {
    pub id: String,
    pub synthons: Vec<String>,
}

/// Read the single descriptor row of `path`.
pub fn read_descriptor(path: &Path) -> Result<SpaceDescriptor> {
    let malformed = |reason: String| SpaceError::Descriptor {
        path: path.to_path_buf(),
        reason,
    };
    let mut reader = csv::Reader::from_path(path).map_err(|e| malformed(e.to_string()))?;
    let mut rows = Vec::new();
    for row in reader.deserialize::<SpaceDescriptor>() {
        rows.push(row.map_err(|e| malformed(e.to_string()))?);
    }
    match rows.len() {
        1 => Ok(rows.remove(0)),
        0 => Err(malformed("no space described".into())),
        n => Err(malformed(format!("{n} rows, expected exactly one"))),
    }
}

pub fn write_descriptor(path: &Path, descriptor: &SpaceDescriptor) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.serialize(descriptor)?;
    writer.flush()?;
    Ok(())
}

pub fn read_blob(path: &Path) -> Result<SpaceBlob> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

pub fn write_blob(path: &Path, blob: &SpaceBlob) -> Result<()> {
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(writer, blob)?;
    Ok(())
}

/// Location of the blob named by `descriptor`, resolved against the
/// directory of the descriptor file.
pub fn blob_path(descriptor_path: &Path, descriptor: &SpaceDescriptor) -> PathBuf {
    match descriptor_path.parent() {
        Some(dir) if descriptor.file.is_relative() => dir.join(&descriptor.file),
        _ => descriptor.file.clone(),
    }
}

/// Load the space described at `descriptor_path`: parse every synthon and
/// rebuild encodings, topology signatures and fingerprints.
pub fn load_space(descriptor_path: &Path) -> Result<SynthonSpace> {
    let descriptor = read_descriptor(descriptor_path)?;
    let blob = read_blob(&blob_path(descriptor_path, &descriptor))?;
    let space = space_from_blob(descriptor, blob)?;
    info!(
        "loaded space `{}` with {} synthons ({} products)",
        space.name(),
        space.num_synthons(),
        space.num_products()
    );
    Ok(space)
}

pub fn space_from_blob(descriptor: SpaceDescriptor, blob: SpaceBlob) -> Result<SynthonSpace> {
    let mut space = SynthonSpace::new(descriptor, &blob.fingerprint, blob.lsh)?;
    for reaction in blob.reactions {
        let positions = reaction
            .positions
            .into_iter()
            .map(|p| -> Result<(String, Vec<Molecule>)> {
                let molecules = p
                    .synthons
                    .iter()
                    .map(|s| parse_encoding(s))
                    .collect::<std::result::Result<Vec<Molecule>, _>>()?;
                Ok((p.id, molecules))
            })
            .collect::<Result<Vec<_>>>()?;
        space.add_reaction(&reaction.id, positions)?;
    }
    Ok(space)
}

/// Inverse of [`space_from_blob`], with canonical encodings.
pub fn space_to_blob(space: &SynthonSpace) -> SpaceBlob {
    SpaceBlob {
        fingerprint: space.fingerprints().handler_name(),
        lsh: space.lsh().copied(),
        reactions: space
            .reactions()
            .map(|r| ReactionBlob {
                id: r.id.clone(),
                positions: r
                    .positions
                    .iter()
                    .map(|p| PositionBlob {
                        id: p.id.clone(),
                        synthons: p.synthons.iter().map(|s| s.id.encoding.clone()).collect(),
                    })
                    .collect(),
            })
            .collect(),
    }
}

/// Read `reaction \t position \t encoding` lines into reactions, keeping the
/// order in which reactions and positions first appear. Lines starting with
/// `#` are ignored. Encodings are canonicalized.
pub fn read_synthon_tsv(path: &Path) -> Result<Vec<ReactionBlob>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .comment(Some(b'#'))
        .from_path(path)?;

    let mut reactions: Vec<ReactionBlob> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for record in reader.records() {
        let record = record?;
        let (Some(reaction), Some(position), Some(encoding)) = (record.get(0), record.get(1), record.get(2)) else {
            return Err(SpaceError::Config(format!(
                "{path:?}: expected `reaction\\tposition\\tencoding`, got {record:?}"
            )));
        };
        let encoding = canonical_encoding(&parse_encoding(encoding)?);

        let r = *index.entry(reaction.to_string()).or_insert_with(|| {
            reactions.push(ReactionBlob {
                id: reaction.to_string(),
                positions: Vec::new(),
            });
            reactions.len() - 1
        });
        let positions = &mut reactions[r].positions;
        match positions.iter_mut().find(|p| p.id == position) {
            Some(p) => p.synthons.push(encoding),
            None => positions.push(PositionBlob {
                id: position.to_string(),
                synthons: vec![encoding],
            }),
        }
    }
    Ok(reactions)
}

/// Write `descriptor` as `<dir>/<name>.csv` and `blob` to the file it names.
/// Returns the descriptor path.
pub fn write_space(dir: &Path, descriptor: &SpaceDescriptor, blob: &SpaceBlob) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let descriptor_path = dir.join(format!("{}.csv", descriptor.name));
    write_blob(&blob_path(&descriptor_path, descriptor), blob)?;
    write_descriptor(&descriptor_path, descriptor)?;
    Ok(descriptor_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::SpaceKind;

    fn descriptor(kind: SpaceKind) -> SpaceDescriptor {
        SpaceDescriptor {
            name: "toy".into(),
            version: "2024.1".into(),
            provider: "lab".into(),
            kind,
            file: PathBuf::from("toy.json"),
        }
    }

    fn blob() -> SpaceBlob {
        SpaceBlob {
            fingerprint: "path".into(),
            lsh: None,
            reactions: vec![ReactionBlob {
                id: "r1".into(),
                positions: vec![
                    PositionBlob {
                        id: "0".into(),
                        synthons: vec!["C.C.U|0-1,1-2".into(), "O.C.U|0-1,1-2".into()],
                    },
                    PositionBlob {
                        id: "1".into(),
                        synthons: vec!["U.N|0-1".into()],
                    },
                ],
            }],
        }
    }

    #[test]
    fn space_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_space(dir.path(), &descriptor(SpaceKind::Similarity), &blob()).unwrap();
        assert_eq!(read_descriptor(&path).unwrap(), descriptor(SpaceKind::Similarity));

        let space = load_space(&path).unwrap();
        assert_eq!(space.name(), "toy");
        assert_eq!(space.num_synthons(), 3);
        assert_eq!(space.num_products(), 2);
        let again = space_to_blob(&space);
        assert_eq!(again.reactions[0].positions.len(), 2);
        assert_eq!(again.fingerprint, "path-5-512");
        assert!(again.lsh.is_some());
    }

    #[test]
    fn bad_descriptors_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        fs::write(&path, "name,version,provider,kind,file\ntoy,1,lab,exotic,toy.json\n").unwrap();
        assert!(matches!(read_descriptor(&path), Err(SpaceError::Descriptor { .. })));

        fs::write(&path, "name,version,provider,kind,file\n").unwrap();
        assert!(matches!(read_descriptor(&path), Err(SpaceError::Descriptor { .. })));

        assert!(read_descriptor(&dir.path().join("missing.csv")).is_err());
    }

    #[test]
    fn unknown_fingerprint_aborts_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut b = blob();
        b.fingerprint = "mystery".into();
        let path = write_space(dir.path(), &descriptor(SpaceKind::Substructure), &b).unwrap();
        assert!(matches!(load_space(&path), Err(SpaceError::UnknownFingerprint(_))));
    }

    #[test]
    fn malformed_synthon_aborts_load() {
        let mut b = blob();
        b.reactions[0].positions[1].synthons.push("U.N|0-7".into());
        assert!(matches!(
            space_from_blob(descriptor(SpaceKind::Substructure), b),
            Err(SpaceError::Parse(_))
        ));
    }

    #[test]
    fn tsv_import_groups_by_reaction_and_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("synthons.tsv");
        fs::write(
            &path,
            "# reaction\tposition\tencoding\nr2\tb\tN.U|0-1\nr1\ta\tC.U|0-1\nr2\ta\tO.U|0-1\nr2\tb\tU.C.C|0-1,1-2\n",
        )
        .unwrap();
        let reactions = read_synthon_tsv(&path).unwrap();
        assert_eq!(reactions.len(), 2);
        assert_eq!(reactions[0].id, "r2");
        assert_eq!(reactions[0].positions[0].id, "b");
        assert_eq!(reactions[0].positions[0].synthons.len(), 2);
        assert_eq!(reactions[1].positions[0].synthons, vec![canonical_encoding(&parse_encoding("U.C|0-1").unwrap())]);

        fs::write(&path, "r1\ta\n").unwrap();
        assert!(read_synthon_tsv(&path).is_err());
    }
}
