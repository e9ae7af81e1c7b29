//! Reassemble synthons into full molecules by joining matching connectors.
//!
//! All fragments are copied into one working graph. For every connector class
//! that occurs exactly twice, the atoms carrying the two markers are bonded
//! directly and both markers are scheduled for deletion; the deletions happen
//! in one pass at the end. A class occurring once is left open, which is how
//! partially specified combinatorial hits are displayed.

use bit_set::BitSet;
use clap::ValueEnum;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::molecule::{ConnectorClass, IndexMap, Molecule};

/// Strategy for pairing connectors.
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug, Default, Serialize, Deserialize,
)]
pub enum AssemblyMode {
    /// Resolve each connector class once, in class order.
    #[default]
    PerClass,
    /// Repeatedly join the first connectable pair until none remains. Agrees
    /// with `PerClass` whenever each class occurs zero or two times.
    Iterative,
}

/// An assembled molecule.
#[derive(Debug, Clone)]
pub struct Assembled {
    pub molecule: Molecule,
    /// For each input fragment, the final index of each of its atoms (`None`
    /// for consumed connector markers). Only filled when requested.
    pub atom_maps: Option<Vec<IndexMap>>,
    /// Connector classes that could not be joined and remain as markers.
    pub unresolved: Vec<ConnectorClass>,
}

/// Join `fragments` at matching connectors using [`AssemblyMode::PerClass`].
pub fn assemble(fragments: &[Molecule], track_atom_maps: bool) -> Assembled {
    assemble_with(fragments, AssemblyMode::PerClass, track_atom_maps)
}

pub fn assemble_with(fragments: &[Molecule], mode: AssemblyMode, track_atom_maps: bool) -> Assembled {
    let mut working = Molecule::new();
    let maps: Vec<Vec<usize>> = fragments.iter().map(|f| working.append(f)).collect();
    let mut doomed = BitSet::with_capacity(working.atom_count());

    let unresolved = match mode {
        AssemblyMode::PerClass => join_per_class(&mut working, &mut doomed),
        AssemblyMode::Iterative => join_iteratively(&mut working, &mut doomed),
    };

    let (molecule, deletion) = working.without_atoms(&doomed);
    let atom_maps = track_atom_maps.then(|| {
        maps.iter()
            .map(|m| m.iter().map(|ix| deletion[*ix]).collect())
            .collect()
    });
    Assembled {
        molecule,
        atom_maps,
        unresolved,
    }
}

fn connectors_of(working: &Molecule, class: ConnectorClass, doomed: &BitSet) -> Vec<usize> {
    working
        .connectors()
        .into_iter()
        .filter(|(ix, c)| *c == class && !doomed.contains(*ix))
        .map(|(ix, _)| ix)
        .collect()
}

fn join_per_class(working: &mut Molecule, doomed: &mut BitSet) -> Vec<ConnectorClass> {
    let mut unresolved = Vec::new();
    for class in ConnectorClass::ALL {
        let markers = connectors_of(working, class, doomed);
        match markers.len() {
            0 => {}
            2 => {
                if !join(working, markers[0], markers[1], doomed) {
                    unresolved.push(class);
                }
            }
            1 => unresolved.push(class),
            n => {
                warn!("{n} connectors of class {class:?}; leaving them unresolved");
                unresolved.push(class);
            }
        }
    }
    unresolved
}

fn join_iteratively(working: &mut Molecule, doomed: &mut BitSet) -> Vec<ConnectorClass> {
    let mut failed = BitSet::new();
    loop {
        let current: &Molecule = working;
        let consumed: &BitSet = doomed;
        let pair = current
            .connectors()
            .into_iter()
            .filter(|(ix, _)| !consumed.contains(*ix) && !failed.contains(*ix))
            .find_map(|(a, class)| {
                connectors_of(current, class, consumed)
                    .into_iter()
                    .find(|b| *b != a && !failed.contains(*b))
                    .map(|b| (a, b))
            });
        let Some((a, b)) = pair else {
            break;
        };
        if !join(working, a, b, doomed) {
            failed.insert(a);
            failed.insert(b);
        }
    }

    let mut unresolved: Vec<ConnectorClass> = working
        .connectors()
        .into_iter()
        .filter(|(ix, _)| !doomed.contains(*ix))
        .map(|(_, c)| c)
        .collect();
    unresolved.sort();
    unresolved.dedup();
    unresolved
}

/// Bond the atoms behind markers `a` and `b` and schedule both markers for
/// deletion. Returns `false` if the markers are not attached to exactly one
/// atom each.
fn join(working: &mut Molecule, a: usize, b: usize, doomed: &mut BitSet) -> bool {
    let (ends_a, ends_b) = (working.incident_bonds(a), working.incident_bonds(b));
    let (&[(_, na, bond_a)], &[(_, nb, bond_b)]) = (ends_a.as_slice(), ends_b.as_slice()) else {
        warn!("connector atoms {a} and {b} must each have exactly one neighbour");
        return false;
    };

    if bond_a != bond_b {
        warn!("connector bond types differ ({bond_a:?} vs {bond_b:?}); using {bond_a:?}");
    }
    if na == nb || working.bond_between(na, nb).is_some() {
        warn!("joining connectors {a} and {b} would duplicate a bond; skipped");
    } else {
        working.add_bond(na, nb, bond_a);
    }
    doomed.insert(a);
    doomed.insert(b);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        canonize::{canonical_encoding, parse_encoding},
        cancel::CancellationToken,
        molecule::Bond,
        split::{apply_split, compute_all_valid_splits, SplitConfig},
    };

    fn mol(s: &str) -> Molecule {
        parse_encoding(s).unwrap()
    }

    #[test]
    fn joins_two_synthons() {
        let a = mol("C.C.U|0-1,1-2");
        let b = mol("U.O|0-1");
        let out = assemble(&[a, b], false);
        assert!(out.unresolved.is_empty());
        assert_eq!(canonical_encoding(&out.molecule), canonical_encoding(&mol("C.C.O|0-1,1-2")));
    }

    #[test]
    fn split_then_assemble_round_trips() {
        let original = mol("C.C.C.C.C.C.C.O.N|0-1,1=2,2-3,3=4,4-5,5=0,0-6,6-7,3-8");
        let expected = canonical_encoding(&original);
        let config = SplitConfig {
            max_cuts: 3,
            max_fragments: 3,
        };
        let splits = compute_all_valid_splits(&original, &config, &CancellationToken::new());
        let splits = splits.into_inner();
        assert!(!splits.is_empty());
        for split in splits.values() {
            for mode in [AssemblyMode::PerClass, AssemblyMode::Iterative] {
                let out = assemble_with(&split.fragments, mode, false);
                assert!(out.unresolved.is_empty());
                assert_eq!(canonical_encoding(&out.molecule), expected);
            }
        }
    }

    #[test]
    fn single_connector_stays_open() {
        let a = mol("C.C.U.Np|0-1,1-2,0-3");
        let b = mol("U.O|0-1");
        let out = assemble(&[a, b], false);
        assert_eq!(out.unresolved, vec![ConnectorClass::Second]);
        assert_eq!(out.molecule.connectors().len(), 1);
        assert_eq!(out.molecule.atom_count(), 4);
    }

    #[test]
    fn bond_type_mismatch_uses_first() {
        let a = mol("C.U|0=1");
        let b = mol("U.C|0-1");
        let out = assemble(&[a, b], false);
        assert_eq!(out.molecule.bond_count(), 1);
        assert_eq!(out.molecule.bond(0), Some(Bond::Double));
    }

    #[test]
    fn atom_maps_trace_sources() {
        let original = mol("C.C.N.C.O|0-1,1-2,2-3,3-4");
        let split = apply_split(&original, &[1, 3]).unwrap();
        let out = assemble(&split.fragments, true);
        let maps = out.atom_maps.unwrap();
        assert_eq!(maps.len(), 3);
        for (fragment, map) in split.fragments.iter().zip(&maps) {
            for (ix, target) in map.iter().enumerate() {
                let atom = fragment.atom(ix).unwrap();
                match target {
                    Some(t) => assert_eq!(out.molecule.atom(*t), Some(atom)),
                    None => assert!(atom.is_connector()),
                }
            }
        }
        assert_eq!(out.molecule.atom_count(), 5);
    }

    #[test]
    fn modes_agree_on_three_fragments() {
        let fragments = [
            mol("C.U|0-1"),
            mol("U.N.Np|0-1,1-2"),
            mol("Np.C.C|0-1,1=2"),
        ];
        let per_class = assemble_with(&fragments, AssemblyMode::PerClass, false);
        let iterative = assemble_with(&fragments, AssemblyMode::Iterative, false);
        assert_eq!(
            canonical_encoding(&per_class.molecule),
            canonical_encoding(&iterative.molecule)
        );
        assert_eq!(per_class.molecule.atom_count(), 4);
    }

    #[test]
    fn crowded_class_is_reported() {
        let fragments = [mol("C.U|0-1"), mol("N.U|0-1"), mol("O.U|0-1")];
        let per_class = assemble_with(&fragments, AssemblyMode::PerClass, false);
        assert_eq!(per_class.unresolved, vec![ConnectorClass::First]);
        assert_eq!(per_class.molecule.bond_count(), 3);

        let iterative = assemble_with(&fragments, AssemblyMode::Iterative, false);
        assert_eq!(iterative.unresolved, vec![ConnectorClass::First]);
        assert_eq!(iterative.molecule.atom_count(), 4);
        assert_eq!(iterative.molecule.bond_count(), 2);
    }
}
