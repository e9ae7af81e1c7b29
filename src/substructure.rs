//! Non-induced substructure matching between molecular graphs.
//!
//! Atoms match when their elements are equal (connector markers therefore only
//! match markers of the same class) and every query bond must be present in
//! the target with the same type. Extra target bonds are allowed.

use std::collections::{HashMap, VecDeque};

use bit_set::BitSet;

use crate::molecule::{Element, Molecule};

/// Return `true` iff `query` is a substructure of `target`.
pub fn is_substructure(query: &Molecule, target: &Molecule) -> bool {
    find_embedding(query, target).is_some()
}

/// Return one embedding of `query` into `target` as a vector mapping query
/// atoms to target atoms.
pub fn find_embedding(query: &Molecule, target: &Molecule) -> Option<Vec<usize>> {
    if query.atom_count() > target.atom_count() || query.bond_count() > target.bond_count() {
        return None;
    }
    if !element_counts_fit(query, target) {
        return None;
    }

    let order = matching_order(query);
    let mut mapping = vec![usize::MAX; query.atom_count()];
    let mut used = BitSet::with_capacity(target.atom_count());
    extend(query, target, &order, 0, &mut mapping, &mut used).then_some(mapping)
}

fn element_counts_fit(query: &Molecule, target: &Molecule) -> bool {
    let mut counts: HashMap<Element, isize> = HashMap::new();
    for ix in 0..target.atom_count() {
        if let Some(atom) = target.atom(ix) {
            *counts.entry(atom.element()).or_default() += 1;
        }
    }
    for ix in 0..query.atom_count() {
        if let Some(atom) = query.atom(ix) {
            let count = counts.entry(atom.element()).or_default();
            *count -= 1;
            if *count < 0 {
                return false;
            }
        }
    }
    true
}

/// Order query atoms so that each atom after the first of its component has a
/// previously ordered neighbour. Components start at their highest-degree atom.
fn matching_order(query: &Molecule) -> Vec<(usize, Option<usize>)> {
    let mut order = Vec::with_capacity(query.atom_count());
    let mut seen = BitSet::with_capacity(query.atom_count());
    let mut starts: Vec<usize> = (0..query.atom_count()).collect();
    starts.sort_by_key(|a| std::cmp::Reverse(query.degree(*a)));

    for start in starts {
        if seen.contains(start) {
            continue;
        }
        seen.insert(start);
        order.push((start, None));
        let mut queue = VecDeque::from([start]);
        while let Some(a) = queue.pop_front() {
            for b in query.neighbors(a) {
                if seen.insert(b) {
                    order.push((b, Some(a)));
                    queue.push_back(b);
                }
            }
        }
    }
    order
}

fn extend(
    query: &Molecule,
    target: &Molecule,
    order: &[(usize, Option<usize>)],
    depth: usize,
    mapping: &mut Vec<usize>,
    used: &mut BitSet,
) -> bool {
    let Some(&(q, parent)) = order.get(depth) else {
        return true;
    };

    let candidates: Vec<usize> = match parent {
        Some(p) => target.neighbors(mapping[p]).collect(),
        None => (0..target.atom_count()).collect(),
    };

    for t in candidates {
        if used.contains(t) || !compatible(query, target, q, t, mapping) {
            continue;
        }
        mapping[q] = t;
        used.insert(t);
        if extend(query, target, order, depth + 1, mapping, used) {
            return true;
        }
        used.remove(t);
        mapping[q] = usize::MAX;
    }
    false
}

fn compatible(query: &Molecule, target: &Molecule, q: usize, t: usize, mapping: &[usize]) -> bool {
    if query.atom(q) != target.atom(t) || query.degree(q) > target.degree(t) {
        return false;
    }
    query.incident_bonds(q).into_iter().all(|(_, other, bond)| {
        let mapped = mapping[other];
        mapped == usize::MAX
            || target
                .bond_between(t, mapped)
                .is_some_and(|(_, tb)| tb == bond)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonize::parse_encoding;

    fn mol(s: &str) -> Molecule {
        parse_encoding(s).unwrap()
    }

    #[test]
    fn chain_in_ring() {
        let ring = mol("C.C.C.C.C.C|0-1,1-2,2-3,3-4,4-5,5-0");
        assert!(is_substructure(&mol("C.C.C|0-1,1-2"), &ring));
        assert!(!is_substructure(&mol("C.C.C|0=1,1-2"), &ring));
    }

    #[test]
    fn elements_must_match() {
        let ethanol = mol("C.C.O|0-1,1-2");
        assert!(is_substructure(&mol("C.O|0-1"), &ethanol));
        assert!(!is_substructure(&mol("N.O|0-1"), &ethanol));
        assert!(!is_substructure(&mol("O.O|0-1"), &ethanol));
    }

    #[test]
    fn connectors_only_match_their_class() {
        let synthon = mol("U.C.C.O|0-1,1-2,2-3");
        assert!(is_substructure(&mol("U.C|0-1"), &synthon));
        assert!(!is_substructure(&mol("Np.C|0-1"), &synthon));
    }

    #[test]
    fn embedding_is_consistent() {
        let target = mol("C.N.C.O|0-1,1-2,2=3");
        let query = mol("N.C.O|0-1,1=2");
        let emb = find_embedding(&query, &target).unwrap();
        assert_eq!(emb, vec![1, 2, 3]);
    }
}
