//! Fixed-width structural fingerprints and bit-vector helpers.
//!
//! Handlers are resolved once by name (see [`resolve_handler`]) and then
//! cloned per worker thread; a handler may keep scratch buffers between calls,
//! so [`FingerprintHandler::compute`] takes `&mut self`. All feature hashes use
//! FNV-1a, which keeps stored fingerprints valid across builds.

use std::{fmt, str::FromStr};

use base64::{engine::general_purpose::STANDARD, Engine};
use bit_set::BitSet;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, SpaceError},
    molecule::Molecule,
    utils::fnv1a,
};

/// Computes a fingerprint of fixed width `num_bits()` for a molecule.
pub trait FingerprintHandler: Send + Sync {
    /// Name under which this handler can be resolved again.
    fn name(&self) -> String;

    fn num_bits(&self) -> usize;

    fn compute(&mut self, mol: &Molecule) -> BitSet;

    /// Fresh instance for exclusive use by one thread. Shares no mutable
    /// state with `self`.
    fn clone_for_thread(&self) -> Box<dyn FingerprintHandler>;
}

/// Built-in handler names.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintKind {
    /// Linear paths up to 5 bonds, 512 bits.
    Path,
    /// Circular atom environments up to radius 2, 512 bits.
    Sphere,
}

impl FingerprintKind {
    pub fn name(&self) -> &'static str {
        match self {
            FingerprintKind::Path => "path",
            FingerprintKind::Sphere => "sphere",
        }
    }

    pub fn handler(&self) -> Box<dyn FingerprintHandler> {
        match self {
            FingerprintKind::Path => Box::new(PathFp::new(5, 512)),
            FingerprintKind::Sphere => Box::new(SphereFp::new(2, 512)),
        }
    }
}

impl fmt::Display for FingerprintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FingerprintKind {
    type Err = SpaceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "path" => Ok(FingerprintKind::Path),
            "sphere" => Ok(FingerprintKind::Sphere),
            _ => Err(SpaceError::UnknownFingerprint(s.to_string())),
        }
    }
}

/// Resolve a handler by name: a built-in [`FingerprintKind`], or a
/// parameterised `path-<depth>-<bits>` / `sphere-<radius>-<bits>`.
pub fn resolve_handler(name: &str) -> Result<Box<dyn FingerprintHandler>> {
    if let Ok(kind) = name.parse::<FingerprintKind>() {
        return Ok(kind.handler());
    }
    generic_handler(name).ok_or_else(|| SpaceError::UnknownFingerprint(name.to_string()))
}

fn generic_handler(name: &str) -> Option<Box<dyn FingerprintHandler>> {
    let mut parts = name.split('-');
    let family = parts.next()?;
    let size: usize = parts.next()?.parse().ok()?;
    let num_bits: usize = parts.next()?.parse().ok()?;
    if parts.next().is_some() || num_bits == 0 {
        return None;
    }
    match family {
        "path" if size > 0 => Some(Box::new(PathFp::new(size, num_bits))),
        "sphere" => Some(Box::new(SphereFp::new(size, num_bits))),
        _ => None,
    }
}

/// Hashes every simple path of up to `max_depth` bonds. A path and its
/// reverse hash to the same bit.
#[derive(Debug, Clone)]
pub struct PathFp {
    max_depth: usize,
    num_bits: usize,
    scratch: Vec<u8>,
}

impl PathFp {
    pub fn new(max_depth: usize, num_bits: usize) -> Self {
        Self {
            max_depth,
            num_bits,
            scratch: Vec::new(),
        }
    }

    fn walk(&mut self, mol: &Molecule, path: &mut Vec<usize>, visited: &mut BitSet, bits: &mut BitSet) {
        self.set_path_bit(mol, path, bits);
        if path.len() > self.max_depth {
            return;
        }
        let Some(&last) = path.last() else {
            return;
        };
        let next: Vec<usize> = mol.neighbors(last).collect();
        for n in next {
            if visited.insert(n) {
                path.push(n);
                self.walk(mol, path, visited, bits);
                path.pop();
                visited.remove(n);
            }
        }
    }

    fn set_path_bit(&mut self, mol: &Molecule, path: &[usize], bits: &mut BitSet) {
        let forward = self.path_key(mol, path.iter().copied());
        let backward = self.path_key(mol, path.iter().rev().copied());
        let key = forward.min(backward);
        bits.insert((key % self.num_bits as u64) as usize);
    }

    fn path_key(&mut self, mol: &Molecule, atoms: impl Iterator<Item = usize>) -> u64 {
        self.scratch.clear();
        let mut prev = None;
        for a in atoms {
            if let Some(p) = prev {
                let order = mol.bond_between(p, a).map_or(0, |(_, b)| b.order());
                self.scratch.push(order as u8);
            }
            self.scratch.push(mol.atom(a).map_or(0, |x| x.element().atomic_number()));
            prev = Some(a);
        }
        fnv1a(&self.scratch)
    }
}

impl FingerprintHandler for PathFp {
    fn name(&self) -> String {
        format!("path-{}-{}", self.max_depth, self.num_bits)
    }

    fn num_bits(&self) -> usize {
        self.num_bits
    }

    fn compute(&mut self, mol: &Molecule) -> BitSet {
        let mut bits = BitSet::with_capacity(self.num_bits);
        let mut visited = BitSet::with_capacity(mol.atom_count());
        let mut path = Vec::with_capacity(self.max_depth + 1);
        for start in 0..mol.atom_count() {
            visited.insert(start);
            path.push(start);
            self.walk(mol, &mut path, &mut visited, &mut bits);
            path.pop();
            visited.remove(start);
        }
        bits
    }

    fn clone_for_thread(&self) -> Box<dyn FingerprintHandler> {
        Box::new(PathFp::new(self.max_depth, self.num_bits))
    }
}

/// Iteratively refined atom environments (Morgan style). Every identifier of
/// every iteration sets one bit.
#[derive(Debug, Clone)]
pub struct SphereFp {
    radius: usize,
    num_bits: usize,
    ids: Vec<u64>,
    next: Vec<u64>,
}

impl SphereFp {
    pub fn new(radius: usize, num_bits: usize) -> Self {
        Self {
            radius,
            num_bits,
            ids: Vec::new(),
            next: Vec::new(),
        }
    }
}

impl FingerprintHandler for SphereFp {
    fn name(&self) -> String {
        format!("sphere-{}-{}", self.radius, self.num_bits)
    }

    fn num_bits(&self) -> usize {
        self.num_bits
    }

    fn compute(&mut self, mol: &Molecule) -> BitSet {
        let mut bits = BitSet::with_capacity(self.num_bits);
        self.ids.clear();
        for a in 0..mol.atom_count() {
            let element = mol.atom(a).map_or(0, |x| x.element().atomic_number());
            self.ids.push(fnv1a(&[element, mol.degree(a) as u8]));
        }
        for id in &self.ids {
            bits.insert((id % self.num_bits as u64) as usize);
        }

        for _ in 0..self.radius {
            self.next.clear();
            for a in 0..mol.atom_count() {
                let mut env: Vec<(usize, u64)> = mol
                    .incident_bonds(a)
                    .into_iter()
                    .map(|(_, n, bond)| (bond.order(), self.ids[n]))
                    .collect();
                env.sort_unstable();
                let mut bytes = self.ids[a].to_le_bytes().to_vec();
                for (order, id) in env {
                    bytes.push(order as u8);
                    bytes.extend_from_slice(&id.to_le_bytes());
                }
                self.next.push(fnv1a(&bytes));
            }
            std::mem::swap(&mut self.ids, &mut self.next);
            for id in &self.ids {
                bits.insert((id % self.num_bits as u64) as usize);
            }
        }
        bits
    }

    fn clone_for_thread(&self) -> Box<dyn FingerprintHandler> {
        Box::new(SphereFp::new(self.radius, self.num_bits))
    }
}

pub fn hamming(a: &BitSet, b: &BitSet) -> usize {
    a.symmetric_difference(b).count()
}

/// Shared set bits over all set bits. Two empty fingerprints are identical.
pub fn tanimoto(a: &BitSet, b: &BitSet) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 1.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Pack the first `num_bits` bits, most significant bit first.
pub fn to_bytes(bits: &BitSet, num_bits: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; num_bits.div_ceil(8)];
    for bit in bits.iter().filter(|b| *b < num_bits) {
        bytes[bit / 8] |= 0x80 >> (bit % 8);
    }
    bytes
}

pub fn from_bytes(bytes: &[u8]) -> BitSet {
    let mut bits = BitSet::with_capacity(bytes.len() * 8);
    for (i, byte) in bytes.iter().enumerate() {
        for j in 0..8 {
            if byte & (0x80 >> j) != 0 {
                bits.insert(i * 8 + j);
            }
        }
    }
    bits
}

pub fn to_base64(bits: &BitSet, num_bits: usize) -> String {
    STANDARD.encode(to_bytes(bits, num_bits))
}

pub fn from_base64(encoded: &str) -> Result<BitSet> {
    Ok(from_bytes(&STANDARD.decode(encoded.trim())?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonize::parse_encoding;

    fn mol(s: &str) -> Molecule {
        parse_encoding(s).unwrap()
    }

    #[test]
    fn resolves_builtin_and_generic_names() {
        assert_eq!(resolve_handler("path").unwrap().num_bits(), 512);
        assert_eq!(resolve_handler("sphere").unwrap().name(), "sphere-2-512");
        assert_eq!(resolve_handler("path-3-1024").unwrap().num_bits(), 1024);
        assert!(matches!(
            resolve_handler("ecfp4"),
            Err(SpaceError::UnknownFingerprint(_))
        ));
        assert!(resolve_handler("path-3-0").is_err());
        assert!(resolve_handler("path-3-64-1").is_err());
    }

    #[test]
    fn atom_order_does_not_matter() {
        let a = mol("C.C.O.N|0-1,1-2,1-3");
        let b = mol("N.O.C.C|3-2,2-1,2-0");
        for kind in [FingerprintKind::Path, FingerprintKind::Sphere] {
            let mut handler = kind.handler();
            assert_eq!(handler.compute(&a), handler.compute(&b), "{kind}");
        }
    }

    #[test]
    fn substructure_bits_are_contained() {
        let mut handler = FingerprintKind::Path.handler();
        let small = handler.compute(&mol("C.O|0-1"));
        let large = handler.compute(&mol("C.C.O|0-1,1-2"));
        assert!(small.is_subset(&large));
        assert!(tanimoto(&small, &large) < 1.0);
        assert!(!small.is_empty());
    }

    #[test]
    fn clones_compute_the_same_bits() {
        let m = mol("C.C.C.N|0-1,1=2,2-3");
        let mut handler = FingerprintKind::Sphere.handler();
        let mut clone = handler.clone_for_thread();
        assert_eq!(handler.compute(&m), clone.compute(&m));
    }

    #[test]
    fn similarity_metrics() {
        let a: BitSet = [1, 2, 3, 4].into_iter().collect();
        let b: BitSet = [3, 4, 5].into_iter().collect();
        assert_eq!(hamming(&a, &b), 3);
        assert!((tanimoto(&a, &b) - 0.4).abs() < 1e-12);
        assert_eq!(tanimoto(&BitSet::new(), &BitSet::new()), 1.0);
    }

    #[test]
    fn byte_packing_is_msb_first() {
        let bits: BitSet = [0, 9, 15].into_iter().collect();
        assert_eq!(to_bytes(&bits, 16), vec![0x80, 0x41]);
        assert_eq!(from_bytes(&[0x80, 0x41]), bits);
        let encoded = to_base64(&bits, 16);
        assert_eq!(from_base64(&encoded).unwrap(), bits);
        assert!(from_base64("not base64!").is_err());
    }
}
