use std::collections::VecDeque;

use bit_set::BitSet;
use petgraph::{
    graph::{EdgeIndex, Graph, IndexType, NodeIndex},
    visit::EdgeRef,
    EdgeType,
};

/// Return the endpoint of `e` opposite to `n`.
pub fn other_end<N, E, Ty, Ix>(
    g: &Graph<N, E, Ty, Ix>,
    e: EdgeIndex<Ix>,
    n: NodeIndex<Ix>,
) -> NodeIndex<Ix>
where
    Ty: EdgeType,
    Ix: IndexType,
{
    match g.edge_endpoints(e) {
        Some((src, dst)) if src == n => dst,
        Some((src, _)) => src,
        None => n,
    }
}

/// Breadth-first distances (in edges) from `start`, optionally ignoring the
/// edge `skip`. Unreachable nodes are `None`.
pub fn bfs_distances<N, E, Ty, Ix>(
    g: &Graph<N, E, Ty, Ix>,
    start: NodeIndex<Ix>,
    skip: Option<EdgeIndex<Ix>>,
) -> Vec<Option<usize>>
where
    Ty: EdgeType,
    Ix: IndexType,
{
    let mut dist = vec![None; g.node_count()];
    if start.index() >= dist.len() {
        return dist;
    }
    dist[start.index()] = Some(0);
    let mut queue = VecDeque::from([start]);
    while let Some(n) = queue.pop_front() {
        let d = dist[n.index()].unwrap_or(0);
        for e in g.edges(n) {
            if Some(e.id()) == skip {
                continue;
            }
            let m = other_end(g, e.id(), n);
            if dist[m.index()].is_none() {
                dist[m.index()] = Some(d + 1);
                queue.push_back(m);
            }
        }
    }
    dist
}

/// Keep only the edges in `s` and the nodes they touch.
pub fn edge_induced_subgraph<N, E, Ty, Ix>(
    mut g: Graph<N, E, Ty, Ix>,
    s: &BitSet,
) -> Graph<N, E, Ty, Ix>
where
    Ty: EdgeType,
    Ix: IndexType,
{
    g.retain_edges(|_, e| s.contains(e.index()));
    g.retain_nodes(|f, n| f.neighbors(n).count() != 0);
    g
}

/// Iterate the cartesian product of `sizes`, in lexicographic order, as index
/// tuples.
pub fn cartesian_indices(sizes: &[usize]) -> impl Iterator<Item = Vec<usize>> + '_ {
    let empty = sizes.is_empty() || sizes.contains(&0);
    let mut current = (!empty).then(|| vec![0; sizes.len()]);
    std::iter::from_fn(move || {
        let out = current.clone()?;
        let mut exhausted = true;
        if let Some(next) = current.as_mut() {
            for pos in (0..sizes.len()).rev() {
                next[pos] += 1;
                if next[pos] < sizes[pos] {
                    exhausted = false;
                    break;
                }
                next[pos] = 0;
            }
        }
        if exhausted {
            current = None;
        }
        Some(out)
    })
}

/// All bijections between `0..n` and itself, as permutation vectors.
pub fn permutations(n: usize) -> Vec<Vec<usize>> {
    fn recurse(prefix: &mut Vec<usize>, used: &mut Vec<bool>, out: &mut Vec<Vec<usize>>) {
        if prefix.len() == used.len() {
            out.push(prefix.clone());
            return;
        }
        for i in 0..used.len() {
            if !used[i] {
                used[i] = true;
                prefix.push(i);
                recurse(prefix, used, out);
                prefix.pop();
                used[i] = false;
            }
        }
    }
    let mut out = Vec::new();
    recurse(&mut Vec::with_capacity(n), &mut vec![false; n], &mut out);
    out
}

/// 64-bit FNV-1a, stable across builds and platforms.
pub fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
