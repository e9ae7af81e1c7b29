//! Graph-theoretic representation of molecules and synthons.
//!
//! A [`Molecule`] is a simple, undirected graph with [`Atom`]s as nodes and
//! [`Bond`]s as edges. Attachment points of synthons are ordinary atoms whose
//! element lies in a reserved range (uranium through americium); see
//! [`ConnectorClass`].
//!
//! Graphs referenced by in-flight computations are never mutated in place.
//! Every structural edit returns a fresh [`Molecule`] together with an
//! [`IndexMap`] from old to new indices, because petgraph renumbers the
//! remaining atoms or bonds whenever one is removed.

use std::{collections::HashSet, fmt::Display, str::FromStr};

use bit_set::BitSet;
use petgraph::{
    graph::{EdgeIndex, Graph, NodeIndex},
    visit::EdgeRef,
    Undirected,
};
use serde::{Deserialize, Serialize};

use crate::utils::{bfs_distances, edge_induced_subgraph, other_end};

pub(crate) type Index = u32;
pub(crate) type MGraph = Graph<Atom, Bond, Undirected, Index>;

/// Old-to-new index translation produced by a graph mutation. Entry `i` holds
/// the new index of old item `i`, or `None` if the item was deleted.
pub type IndexMap = Vec<Option<usize>>;

/// Compose two index maps: apply `first`, then `second`.
pub fn compose_maps(first: &IndexMap, second: &IndexMap) -> IndexMap {
    first
        .iter()
        .map(|ix| ix.and_then(|i| second.get(i).copied().flatten()))
        .collect()
}

/// Thrown by [`Element::from_str`] if the string does not represent a valid
/// chemical element.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ParseElementError;

macro_rules! periodic_table {
    ( $(($element:ident, $symbol:literal, $number:literal),)* ) => {
        /// Represents a chemical element; the discriminant is the atomic number.
        #[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(u8)]
        pub enum Element {
            $( $element = $number, )*
        }

        impl Element {
            pub fn atomic_number(&self) -> u8 {
                *self as u8
            }

            pub fn from_atomic_number(number: u8) -> Option<Self> {
                match number {
                    $( $number => Some(Element::$element), )*
                    _ => None,
                }
            }
        }

        impl Display for Element {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match &self {
                    $( Element::$element => write!(f, "{}", $symbol), )*
                }
            }
        }

        impl FromStr for Element {
            type Err = ParseElementError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $symbol => Ok(Element::$element), )*
                    _ => Err(ParseElementError),
                }
            }
        }
    };
}

periodic_table!(
    (Hydrogen, "H", 1),
    (Helium, "He", 2),
    (Lithium, "Li", 3),
    (Beryllium, "Be", 4),
    (Boron, "B", 5),
    (Carbon, "C", 6),
    (Nitrogen, "N", 7),
    (Oxygen, "O", 8),
    (Fluorine, "F", 9),
    (Neon, "Ne", 10),
    (Sodium, "Na", 11),
    (Magnesium, "Mg", 12),
    (Aluminum, "Al", 13),
    (Silicon, "Si", 14),
    (Phosphorus, "P", 15),
    (Sulfur, "S", 16),
    (Chlorine, "Cl", 17),
    (Argon, "Ar", 18),
    (Potassium, "K", 19),
    (Calcium, "Ca", 20),
    (Scandium, "Sc", 21),
    (Titanium, "Ti", 22),
    (Vanadium, "V", 23),
    (Chromium, "Cr", 24),
    (Manganese, "Mn", 25),
    (Iron, "Fe", 26),
    (Cobalt, "Co", 27),
    (Nickel, "Ni", 28),
    (Copper, "Cu", 29),
    (Zinc, "Zn", 30),
    (Gallium, "Ga", 31),
    (Germanium, "Ge", 32),
    (Arsenic, "As", 33),
    (Selenium, "Se", 34),
    (Bromine, "Br", 35),
    (Krypton, "Kr", 36),
    (Rubidium, "Rb", 37),
    (Strontium, "Sr", 38),
    (Yttrium, "Y", 39),
    (Zirconium, "Zr", 40),
    (Niobium, "Nb", 41),
    (Molybdenum, "Mo", 42),
    (Technetium, "Tc", 43),
    (Ruthenium, "Ru", 44),
    (Rhodium, "Rh", 45),
    (Palladium, "Pd", 46),
    (Silver, "Ag", 47),
    (Cadmium, "Cd", 48),
    (Indium, "In", 49),
    (Tin, "Sn", 50),
    (Antimony, "Sb", 51),
    (Tellurium, "Te", 52),
    (Iodine, "I", 53),
    (Xenon, "Xe", 54),
    (Cesium, "Cs", 55),
    (Barium, "Ba", 56),
    (Lanthanum, "La", 57),
    (Cerium, "Ce", 58),
    (Praseodymium, "Pr", 59),
    (Neodymium, "Nd", 60),
    (Promethium, "Pm", 61),
    (Samarium, "Sm", 62),
    (Europium, "Eu", 63),
    (Gadolinium, "Gd", 64),
    (Terbium, "Tb", 65),
    (Dysprosium, "Dy", 66),
    (Holmium, "Ho", 67),
    (Erbium, "Er", 68),
    (Thulium, "Tm", 69),
    (Ytterbium, "Yb", 70),
    (Lutetium, "Lu", 71),
    (Hafnium, "Hf", 72),
    (Tantalum, "Ta", 73),
    (Wolfram, "W", 74),
    (Rhenium, "Re", 75),
    (Osmium, "Os", 76),
    (Iridium, "Ir", 77),
    (Platinum, "Pt", 78),
    (Gold, "Au", 79),
    (Mercury, "Hg", 80),
    (Thallium, "Tl", 81),
    (Lead, "Pb", 82),
    (Bismuth, "Bi", 83),
    (Polonium, "Po", 84),
    (Astatine, "At", 85),
    (Radon, "Rn", 86),
    (Francium, "Fr", 87),
    (Radium, "Ra", 88),
    (Actinium, "Ac", 89),
    (Thorium, "Th", 90),
    (Protactinium, "Pa", 91),
    (Uranium, "U", 92),
    (Neptunium, "Np", 93),
    (Plutonium, "Pu", 94),
    (Americium, "Am", 95),
    (Curium, "Cm", 96),
    (Berkelium, "Bk", 97),
    (Californium, "Cf", 98),
    (Einsteinium, "Es", 99),
    (Fermium, "Fm", 100),
    (Mendelevium, "Md", 101),
    (Nobelium, "No", 102),
    (Lawrencium, "Lr", 103),
    (Rutherfordium, "Rf", 104),
    (Dubnium, "Db", 105),
    (Seaborgium, "Sg", 106),
    (Bohrium, "Bh", 107),
    (Hassium, "Hs", 108),
    (Meitnerium, "Mt", 109),
    (Darmstadtium, "Ds", 110),
    (Roentgenium, "Rg", 111),
    (Copernicium, "Cn", 112),
    (Nihonium, "Nh", 113),
    (Flerovium, "Fl", 114),
    (Moscovium, "Mc", 115),
    (Livermorium, "Lv", 116),
    (Tennessine, "Ts", 117),
    (Oganesson, "Og", 118),
);

/// Number of distinct connector classes a synthon can carry.
pub const NUM_CONNECTOR_CLASSES: usize = 4;

/// Attachment-point marker type. Two synthons join at connectors of the same
/// class; each class is carried by a reserved element.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConnectorClass {
    First,
    Second,
    Third,
    Fourth,
}

impl ConnectorClass {
    pub const ALL: [ConnectorClass; NUM_CONNECTOR_CLASSES] = [
        ConnectorClass::First,
        ConnectorClass::Second,
        ConnectorClass::Third,
        ConnectorClass::Fourth,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn from_index(ix: usize) -> Option<Self> {
        Self::ALL.get(ix).copied()
    }

    /// The marker element carrying this class.
    pub fn element(&self) -> Element {
        match self {
            ConnectorClass::First => Element::Uranium,
            ConnectorClass::Second => Element::Neptunium,
            ConnectorClass::Third => Element::Plutonium,
            ConnectorClass::Fourth => Element::Americium,
        }
    }

    pub fn from_element(element: Element) -> Option<Self> {
        let number = element.atomic_number();
        let first = Element::Uranium.atomic_number();
        if number < first {
            return None;
        }
        Self::from_index((number - first) as usize)
    }

    /// Bit of this class inside a connector-class bitset.
    pub fn bit(&self) -> u8 {
        1 << self.index()
    }
}

/// Iterate the classes contained in a connector-class bitset.
pub fn classes_in(bits: u8) -> impl Iterator<Item = ConnectorClass> {
    ConnectorClass::ALL
        .into_iter()
        .filter(move |c| bits & c.bit() != 0)
}

/// The nodes of a [`Molecule`] graph.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Atom {
    element: Element,
}

impl Atom {
    /// Construct an [`Atom`] of type `element`.
    pub fn new(element: Element) -> Self {
        Self { element }
    }

    /// Construct the marker atom of connector class `class`.
    pub fn connector(class: ConnectorClass) -> Self {
        Self::new(class.element())
    }

    /// Return this [`Atom`]'s element.
    pub fn element(&self) -> Element {
        self.element
    }

    pub fn connector_class(&self) -> Option<ConnectorClass> {
        ConnectorClass::from_element(self.element)
    }

    pub fn is_connector(&self) -> bool {
        self.connector_class().is_some()
    }
}

impl From<Element> for Atom {
    fn from(element: Element) -> Self {
        Self::new(element)
    }
}

/// The edges of a [`Molecule`] graph.
///
/// Aromatic systems are represented in a Kekulé form with alternating single
/// and double bonds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Bond {
    Single,
    Double,
    Triple,
}

impl Bond {
    pub fn order(&self) -> usize {
        match self {
            Bond::Single => 1,
            Bond::Double => 2,
            Bond::Triple => 3,
        }
    }

    pub fn symbol(&self) -> char {
        match self {
            Bond::Single => '-',
            Bond::Double => '=',
            Bond::Triple => '#',
        }
    }

    pub fn from_symbol(c: char) -> Option<Self> {
        match c {
            '-' => Some(Bond::Single),
            '=' => Some(Bond::Double),
            '#' => Some(Bond::Triple),
            _ => None,
        }
    }
}

/// A simple, loopless graph with [`Atom`]s as nodes and [`Bond`]s as edges.
///
/// Atom and bond indices are dense (`0..atom_count()`, `0..bond_count()`).
#[derive(Debug, Clone, Default)]
pub struct Molecule {
    graph: MGraph,
}

impl Molecule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct a [`Molecule`] from an existing `MGraph`.
    pub(crate) fn from_graph(g: MGraph) -> Self {
        Self { graph: g }
    }

    /// Return a representation of this molecule as an `MGraph`.
    pub(crate) fn graph(&self) -> &MGraph {
        &self.graph
    }

    pub fn atom_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn bond_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Number of atoms that are not connector markers.
    pub fn heavy_atom_count(&self) -> usize {
        self.graph
            .node_weights()
            .filter(|a| !a.is_connector())
            .count()
    }

    pub fn atom(&self, ix: usize) -> Option<Atom> {
        self.graph.node_weight(NodeIndex::new(ix)).copied()
    }

    pub fn bond(&self, ix: usize) -> Option<Bond> {
        self.graph.edge_weight(EdgeIndex::new(ix)).copied()
    }

    pub fn bond_endpoints(&self, ix: usize) -> Option<(usize, usize)> {
        self.graph
            .edge_endpoints(EdgeIndex::new(ix))
            .map(|(u, v)| (u.index(), v.index()))
    }

    /// Return the index and type of the bond joining atoms `u` and `v`.
    pub fn bond_between(&self, u: usize, v: usize) -> Option<(usize, Bond)> {
        let e = self.graph.find_edge(NodeIndex::new(u), NodeIndex::new(v))?;
        Some((e.index(), self.graph[e]))
    }

    pub fn neighbors(&self, ix: usize) -> impl Iterator<Item = usize> + '_ {
        self.graph.neighbors(NodeIndex::new(ix)).map(|n| n.index())
    }

    pub fn degree(&self, ix: usize) -> usize {
        self.neighbors(ix).count()
    }

    /// Return `(bond, neighbor, bond type)` for every bond incident to `ix`.
    pub fn incident_bonds(&self, ix: usize) -> Vec<(usize, usize, Bond)> {
        let n = NodeIndex::new(ix);
        self.graph
            .edges(n)
            .map(|e| (e.id().index(), other_end(&self.graph, e.id(), n).index(), *e.weight()))
            .collect()
    }

    pub fn add_atom(&mut self, atom: Atom) -> usize {
        self.graph.add_node(atom).index()
    }

    pub fn add_bond(&mut self, u: usize, v: usize, bond: Bond) -> usize {
        self.graph
            .add_edge(NodeIndex::new(u), NodeIndex::new(v), bond)
            .index()
    }

    /// Return all connector atoms with their classes, in atom order.
    pub fn connectors(&self) -> Vec<(usize, ConnectorClass)> {
        self.graph
            .node_indices()
            .filter_map(|n| self.graph[n].connector_class().map(|c| (n.index(), c)))
            .collect()
    }

    /// Bitset of the connector classes present in this molecule.
    pub fn connector_classes(&self) -> u8 {
        self.connectors().iter().fold(0, |bits, (_, c)| bits | c.bit())
    }

    /// Return `true` iff this molecule contains self-loops or multiple edges
    /// between any pair of nodes.
    pub fn is_malformed(&self) -> bool {
        let mut uniq = HashSet::new();
        !self.graph.edge_indices().all(|ix| {
            self.graph.edge_endpoints(ix).is_some_and(|(src, dst)| {
                src != dst && uniq.insert((src.min(dst), src.max(dst)))
            })
        })
    }

    /// Return a copy with every connector marker's class replaced by
    /// `relabel(class)`. Atom and bond indices are unchanged.
    pub fn relabel_connectors(&self, relabel: impl Fn(ConnectorClass) -> ConnectorClass) -> Molecule {
        let graph = self.graph.map(
            |_, atom| match atom.connector_class() {
                Some(class) => Atom::connector(relabel(class)),
                None => *atom,
            },
            |_, bond| *bond,
        );
        Molecule::from_graph(graph)
    }

    /// Return a copy of this molecule without bond `ix`, plus the bond map.
    pub fn without_bond(&self, ix: usize) -> (Molecule, IndexMap) {
        let count = self.bond_count();
        let mut graph = self.graph.clone();
        graph.remove_edge(EdgeIndex::new(ix));

        // petgraph moves the last edge into the vacated slot.
        let map = (0..count)
            .map(|i| {
                if i == ix {
                    None
                } else if i == count - 1 {
                    Some(ix)
                } else {
                    Some(i)
                }
            })
            .collect();
        (Molecule::from_graph(graph), map)
    }

    /// Return a copy of this molecule without the atoms in `atoms` (and their
    /// bonds), plus the atom map. Surviving atoms keep their relative order.
    pub fn without_atoms(&self, atoms: &BitSet) -> (Molecule, IndexMap) {
        let mut map = Vec::with_capacity(self.atom_count());
        let mut next = 0;
        for ix in 0..self.atom_count() {
            if atoms.contains(ix) {
                map.push(None);
            } else {
                map.push(Some(next));
                next += 1;
            }
        }
        let graph = self.graph.filter_map(
            |n, atom| (!atoms.contains(n.index())).then_some(*atom),
            |_, bond| Some(*bond),
        );
        (Molecule::from_graph(graph), map)
    }

    /// Return the subgraph induced by `atoms`, plus the atom map.
    pub fn induced(&self, atoms: &BitSet) -> (Molecule, IndexMap) {
        let complement: BitSet = (0..self.atom_count())
            .filter(|ix| !atoms.contains(*ix))
            .collect();
        self.without_atoms(&complement)
    }

    /// Return the subgraph made of the bonds in `bonds` and their endpoints.
    pub fn bond_induced(&self, bonds: &BitSet) -> Molecule {
        Molecule::from_graph(edge_induced_subgraph(self.graph.clone(), bonds))
    }

    /// Append a copy of `other` into this molecule and return, for each atom
    /// of `other`, its index in `self`.
    pub fn append(&mut self, other: &Molecule) -> Vec<usize> {
        let map: Vec<usize> = other
            .graph
            .node_weights()
            .map(|atom| self.graph.add_node(*atom).index())
            .collect();
        for e in other.graph.edge_indices() {
            if let Some((u, v)) = other.graph.edge_endpoints(e) {
                self.graph.add_edge(
                    NodeIndex::new(map[u.index()]),
                    NodeIndex::new(map[v.index()]),
                    other.graph[e],
                );
            }
        }
        map
    }

    /// Return `true` iff removing bond `ix` disconnects its endpoints, i.e.
    /// the bond is not part of a ring.
    pub fn is_bridge(&self, ix: usize) -> bool {
        let e = EdgeIndex::new(ix);
        let Some((u, v)) = self.graph.edge_endpoints(e) else {
            return false;
        };
        bfs_distances(&self.graph, u, Some(e))[v.index()].is_none()
    }

    /// Shortest path length (in bonds) between atoms `u` and `v`.
    pub fn shortest_path(&self, u: usize, v: usize) -> Option<usize> {
        bfs_distances(&self.graph, NodeIndex::new(u), None)
            .get(v)
            .copied()
            .flatten()
    }

    /// Label connected components. Returns the atom set of each component,
    /// ordered by lowest atom index.
    pub fn components(&self) -> Vec<BitSet> {
        let mut seen = BitSet::with_capacity(self.atom_count());
        let mut components = Vec::new();
        for start in self.graph.node_indices() {
            if seen.contains(start.index()) {
                continue;
            }
            let component: BitSet = bfs_distances(&self.graph, start, None)
                .iter()
                .enumerate()
                .filter_map(|(ix, d)| d.map(|_| ix))
                .collect();
            seen.union_with(&component);
            components.push(component);
        }
        components
    }
}
