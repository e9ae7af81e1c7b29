//! Canonical text encoding of molecular graphs.
//!
//! The encoding lists atom symbols separated by `.`, then `|`, then bonds as
//! `i<sym>j` pairs separated by `,` where `<sym>` is `-`, `=` or `#`. For
//! example, acetaldehyde is `C.C.O|0-1,1=2`.
//!
//! Any atom order is accepted when parsing. The canonical form is obtained by
//! colour refinement followed by an individualization search over remaining
//! ties; the lexicographically smallest leaf encoding is chosen, which makes
//! isomorphic molecules encode identically. Candidates of a tied cell that
//! Nauty finds equivalent under an automorphism of the coloured graph lead to
//! identical leaves, so only one of each orbit is expanded.

use std::{
    collections::{BTreeMap, HashSet},
    fmt::Display,
    str::FromStr,
};

use graph_canon::CanonLabeling;
use petgraph::{
    graph::{Graph, NodeIndex},
    Undirected,
};
use thiserror::Error;

use crate::molecule::{Atom, Bond, Element, Molecule};

/// Thrown when a string is not a valid molecule encoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseMoleculeError {
    #[error("missing `|` between atoms and bonds in `{0}`")]
    MissingSeparator(String),
    #[error("unknown element `{0}`")]
    UnknownElement(String),
    #[error("malformed bond `{0}`")]
    MalformedBond(String),
    #[error("bond `{0}` references a missing atom")]
    MissingAtom(String),
}

/// Parse an encoding (canonical or not) into a [`Molecule`].
pub fn parse_encoding(s: &str) -> Result<Molecule, ParseMoleculeError> {
    let (atoms, bonds) = s
        .trim()
        .split_once('|')
        .ok_or_else(|| ParseMoleculeError::MissingSeparator(s.to_string()))?;

    let mut mol = Molecule::new();
    for symbol in atoms.split('.').filter(|t| !t.is_empty()) {
        let element = Element::from_str(symbol)
            .map_err(|_| ParseMoleculeError::UnknownElement(symbol.to_string()))?;
        mol.add_atom(Atom::new(element));
    }

    for token in bonds.split(',').filter(|t| !t.is_empty()) {
        let malformed = || ParseMoleculeError::MalformedBond(token.to_string());
        let (pos, sym) = token
            .char_indices()
            .find(|(_, c)| Bond::from_symbol(*c).is_some())
            .ok_or_else(malformed)?;
        let bond = Bond::from_symbol(sym).ok_or_else(malformed)?;
        let u: usize = token[..pos].parse().map_err(|_| malformed())?;
        let v: usize = token[pos + 1..].parse().map_err(|_| malformed())?;
        if u >= mol.atom_count() || v >= mol.atom_count() || u == v {
            return Err(ParseMoleculeError::MissingAtom(token.to_string()));
        }
        mol.add_bond(u, v, bond);
    }
    Ok(mol)
}

/// Return the canonical encoding of `mol`.
pub fn canonical_encoding(mol: &Molecule) -> String {
    let n = mol.atom_count();
    if n == 0 {
        return "|".to_string();
    }
    let adjacency: Vec<Vec<(usize, usize)>> = (0..n)
        .map(|a| {
            mol.incident_bonds(a)
                .into_iter()
                .map(|(_, other, bond)| (other, bond.order()))
                .collect()
        })
        .collect();

    let initial: Vec<(u8, usize, Vec<usize>)> = (0..n)
        .map(|a| {
            let mut orders: Vec<usize> = adjacency[a].iter().map(|(_, o)| *o).collect();
            orders.sort_unstable();
            let number = mol.atom(a).map_or(0, |atom| atom.element().atomic_number());
            (number, adjacency[a].len(), orders)
        })
        .collect();

    let classes = refine(&adjacency, rank(&initial));
    let mut best: Option<String> = None;
    search(mol, &adjacency, classes, &mut best);
    best.unwrap_or_default()
}

/// Replace each key by its rank among the distinct keys.
fn rank<K: Ord + Clone>(keys: &[K]) -> Vec<usize> {
    let ranks: BTreeMap<K, usize> = {
        let mut sorted = keys.to_vec();
        sorted.sort();
        sorted.dedup();
        sorted.into_iter().enumerate().map(|(i, k)| (k, i)).collect()
    };
    keys.iter().map(|k| ranks[k]).collect()
}

fn distinct(classes: &[usize]) -> usize {
    let mut seen = classes.to_vec();
    seen.sort_unstable();
    seen.dedup();
    seen.len()
}

/// Iterated colour refinement until the partition is stable.
fn refine(adjacency: &[Vec<(usize, usize)>], mut classes: Vec<usize>) -> Vec<usize> {
    loop {
        let signatures: Vec<(usize, Vec<(usize, usize)>)> = adjacency
            .iter()
            .enumerate()
            .map(|(a, nbrs)| {
                let mut sig: Vec<(usize, usize)> =
                    nbrs.iter().map(|(b, o)| (classes[*b], *o)).collect();
                sig.sort_unstable();
                (classes[a], sig)
            })
            .collect();
        let next = rank(&signatures);
        if distinct(&next) == distinct(&classes) {
            return next;
        }
        classes = next;
    }
}

/// Vertex weight of the graph handed to Nauty: `(is_bond, colour or bond
/// order, individualized)`.
type CanonNode = (bool, usize, bool);

/// A graph representation interpretable by Nauty. Bonds become vertices so
/// that bond orders survive as vertex weights.
type CGraph = Graph<CanonNode, (), Undirected, u32>;

fn coloured_cgraph(mol: &Molecule, classes: &[usize], marked: usize) -> CGraph {
    let mut h = CGraph::with_capacity(classes.len() + mol.bond_count(), 2 * mol.bond_count());
    let atoms: Vec<NodeIndex<u32>> = classes
        .iter()
        .enumerate()
        .map(|(a, c)| h.add_node((false, *c, a == marked)))
        .collect();
    for e in 0..mol.bond_count() {
        let (Some((u, v)), Some(bond)) = (mol.bond_endpoints(e), mol.bond(e)) else {
            continue;
        };
        let b = h.add_node((true, bond.order(), false));
        h.add_edge(atoms[u], b, ());
        h.add_edge(atoms[v], b, ());
    }
    h
}

fn search(
    mol: &Molecule,
    adjacency: &[Vec<(usize, usize)>],
    classes: Vec<usize>,
    best: &mut Option<String>,
) {
    // First non-singleton cell, by class rank.
    let mut counts = vec![0usize; classes.len()];
    for c in &classes {
        counts[*c] += 1;
    }
    let Some(target) = counts.iter().position(|&k| k > 1) else {
        let leaf = encode_leaf(mol, &classes);
        if best.as_ref().map_or(true, |b| leaf < *b) {
            *best = Some(leaf);
        }
        return;
    };

    let mut orbits = HashSet::new();
    for chosen in (0..classes.len()).filter(|a| classes[*a] == target) {
        if !orbits.insert(CanonLabeling::new(&coloured_cgraph(mol, &classes, chosen))) {
            continue;
        }
        let keys: Vec<(usize, bool)> = classes
            .iter()
            .enumerate()
            .map(|(a, c)| (*c, a != chosen))
            .collect();
        let individualized = refine(adjacency, rank(&keys));
        search(mol, adjacency, individualized, best);
    }
}

fn encode_leaf(mol: &Molecule, order: &[usize]) -> String {
    let mut atoms = vec![String::new(); order.len()];
    for (a, pos) in order.iter().enumerate() {
        atoms[*pos] = mol.atom(a).map(|x| x.element().to_string()).unwrap_or_default();
    }

    let mut bonds: Vec<(usize, usize, char)> = (0..mol.bond_count())
        .filter_map(|e| {
            let (u, v) = mol.bond_endpoints(e)?;
            let (pu, pv) = (order[u], order[v]);
            Some((pu.min(pv), pu.max(pv), mol.bond(e)?.symbol()))
        })
        .collect();
    bonds.sort_unstable();

    let bonds: Vec<String> = bonds
        .into_iter()
        .map(|(u, v, sym)| format!("{u}{sym}{v}"))
        .collect();
    format!("{}|{}", atoms.join("."), bonds.join(","))
}

impl Display for Molecule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", canonical_encoding(self))
    }
}

impl FromStr for Molecule {
    type Err = ParseMoleculeError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_encoding(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canon(s: &str) -> String {
        canonical_encoding(&parse_encoding(s).unwrap())
    }

    #[test]
    fn parse_simple() {
        let m = parse_encoding("C.C.O|0-1,1=2").unwrap();
        assert_eq!(m.atom_count(), 3);
        assert_eq!(m.bond_count(), 2);
        assert_eq!(m.bond(1), Some(Bond::Double));
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(
            parse_encoding("C.C"),
            Err(ParseMoleculeError::MissingSeparator(_))
        ));
        assert!(matches!(
            parse_encoding("C.Xx|0-1"),
            Err(ParseMoleculeError::UnknownElement(_))
        ));
        assert!(matches!(
            parse_encoding("C.C|0~1"),
            Err(ParseMoleculeError::MalformedBond(_))
        ));
        assert!(matches!(
            parse_encoding("C.C|0-2"),
            Err(ParseMoleculeError::MissingAtom(_))
        ));
    }

    #[test]
    fn atom_order_does_not_matter() {
        assert_eq!(canon("C.C.O|0-1,1=2"), canon("O.C.C|0=1,1-2"));
        assert_eq!(canon("C.N.C.C|0-1,1-2,2-3"), canon("C.C.N.C|0-1,1-2,2-3"));
        assert_ne!(canon("C.C.O|0-1,1=2"), canon("C.C.O|0-1,1-2"));
    }

    #[test]
    fn symmetric_rings_are_canonical() {
        let benzene_a = "C.C.C.C.C.C|0-1,1=2,2-3,3=4,4-5,5=0";
        let benzene_b = "C.C.C.C.C.C|0=1,1-2,2=3,3-4,4=5,5-0";
        assert_eq!(canon(benzene_a), canon(benzene_b));

        // Cyclohexane and two cyclopropanes share every local invariant.
        assert_ne!(
            canon("C.C.C.C.C.C|0-1,1-2,2-3,3-4,4-5,5-0"),
            canon("C.C.C.C.C.C|0-1,1-2,2-0,3-4,4-5,5-3")
        );
    }

    // Benzene carrying `k` tert-butyl groups, atoms listed forwards or
    // backwards.
    fn tert_butyl_benzene(k: usize, reversed: bool) -> Molecule {
        let mut bonds: Vec<(usize, usize, char)> = (0..6)
            .map(|i| (i, (i + 1) % 6, if i % 2 == 0 { '=' } else { '-' }))
            .collect();
        let mut n = 6;
        for ring in 0..k {
            bonds.push((ring, n, '-'));
            for methyl in 1..=3 {
                bonds.push((n, n + methyl, '-'));
            }
            n += 4;
        }
        let ix = |a: usize| if reversed { n - 1 - a } else { a };
        let bonds: Vec<String> = bonds
            .iter()
            .map(|(u, v, sym)| format!("{}{sym}{}", ix(*u), ix(*v)))
            .collect();
        parse_encoding(&format!("{}|{}", vec!["C"; n].join("."), bonds.join(","))).unwrap()
    }

    #[test]
    fn highly_symmetric_molecules_are_canonical() {
        let forward = canonical_encoding(&tert_butyl_benzene(6, false));
        let backward = canonical_encoding(&tert_butyl_benzene(6, true));
        assert_eq!(forward, backward);
        assert_eq!(parse_encoding(&forward).unwrap().atom_count(), 30);
        assert_ne!(forward, canonical_encoding(&tert_butyl_benzene(5, false)));

        let sulfurs = vec!["S"; 12].join(".") + "|";
        assert_eq!(canon(&sulfurs), sulfurs);

        let cubane = "C.C.C.C.C.C.C.C|0-1,1-2,2-3,3-0,4-5,5-6,6-7,7-4,0-4,1-5,2-6,3-7";
        let shuffled = "C.C.C.C.C.C.C.C|0-2,2-4,4-6,6-0,1-3,3-5,5-7,7-1,0-1,2-3,4-5,6-7";
        assert_eq!(canon(cubane), canon(shuffled));
    }

    #[test]
    fn canonical_form_round_trips() {
        let m = parse_encoding("C.U.C.N|0-1,0-2,2-3").unwrap();
        let encoded = m.to_string();
        let again: Molecule = encoded.parse().unwrap();
        assert_eq!(again.to_string(), encoded);
        assert_eq!(again.connectors().len(), 1);
    }

    #[test]
    fn empty_and_single_atom() {
        assert_eq!(canonical_encoding(&Molecule::new()), "|");
        assert_eq!(canon("O|"), "O|");
    }
}
