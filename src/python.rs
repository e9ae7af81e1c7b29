use std::path::PathBuf;

use pyo3::{exceptions::PyValueError, prelude::*};

use crate::{
    assembly::assemble,
    canonize::{canonical_encoding, parse_encoding},
    cancel::CancellationToken,
    error::SpaceError,
    loader::read_descriptor,
    molecule::Molecule,
    search::{SearchConfig, SimilarityParams, SpaceSearchOrchestrator},
    space::SpaceKind,
    split::{compute_all_valid_splits, SplitConfig},
};

impl From<SpaceError> for PyErr {
    fn from(err: SpaceError) -> PyErr {
        PyValueError::new_err(err.to_string())
    }
}

fn parse(encoding: &str) -> PyResult<Molecule> {
    let mol = parse_encoding(encoding).map_err(SpaceError::from)?;
    if mol.is_malformed() {
        return Err(PyValueError::new_err("Bad input! Molecule has self-loops or doubled edges"));
    }
    Ok(mol)
}

fn threads_or_default(threads: Option<usize>) -> usize {
    threads.unwrap_or_else(rayon::current_num_threads)
}

/// Products of the similarity space at `descriptor` at least `threshold`
/// similar to `query`, as `(encoding, reaction, similarity)`.
#[pyfunction]
#[pyo3(signature = (descriptor, query, threshold=0.7, threads=None))]
fn find_similar(
    descriptor: PathBuf,
    query: String,
    threshold: f64,
    threads: Option<usize>,
) -> PyResult<Vec<(String, String, f64)>> {
    let threads = threads_or_default(threads);
    let orchestrator = SpaceSearchOrchestrator::new(SearchConfig::default())?;
    let name = orchestrator.load_space(&descriptor, SpaceKind::Similarity, threads)?;
    let params = SimilarityParams {
        threshold,
        ..SimilarityParams::default()
    };
    let hits = orchestrator.find_similar(&name, &parse(&query)?, &params, threads, &CancellationToken::new())?;

    Ok(hits
        .into_inner()
        .into_iter()
        .map(|h| (h.encoding, h.reaction, h.similarity.unwrap_or_default()))
        .collect())
}

#[pyfunction]
#[pyo3(signature = (descriptor, query, max_extensions=1000, threads=None))]
fn find_substructures(
    descriptor: PathBuf,
    query: String,
    max_extensions: usize,
    threads: Option<usize>,
) -> PyResult<Vec<(String, String)>> {
    let threads = threads_or_default(threads);
    let kind = read_descriptor(&descriptor)?.kind;
    let orchestrator = SpaceSearchOrchestrator::new(SearchConfig::default())?;
    let name = orchestrator.load_space(&descriptor, kind, threads)?;
    let hits = orchestrator.find_substructures(
        &name,
        &parse(&query)?,
        max_extensions,
        threads,
        &CancellationToken::new(),
    )?;

    Ok(hits.into_inner().into_iter().map(|h| (h.encoding, h.reaction)).collect())
}

/// Every valid split of `query`, each as its fragment encodings.
#[pyfunction]
fn split(query: String) -> PyResult<Vec<Vec<String>>> {
    let mol = parse(&query)?;
    let splits = compute_all_valid_splits(&mol, &SplitConfig::default(), &CancellationToken::new());

    Ok(splits
        .into_inner()
        .into_values()
        .map(|s| s.fragments.iter().map(canonical_encoding).collect())
        .collect())
}

#[pyfunction]
fn assemble_fragments(fragments: Vec<String>) -> PyResult<String> {
    let molecules = fragments.iter().map(|f| parse(f)).collect::<PyResult<Vec<_>>>()?;
    Ok(canonical_encoding(&assemble(&molecules, false).molecule))
}

/// A Python module implemented in Rust. The name of this function must match
/// the `lib.name` setting in the `Cargo.toml`, else Python will not be able to
/// import the module.
#[pymodule]
#[pyo3(name = "synthon_space")]
fn _synthon_space(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(find_similar, m)?)?;
    m.add_function(wrap_pyfunction!(find_substructures, m)?)?;
    m.add_function(wrap_pyfunction!(split, m)?)?;
    m.add_function(wrap_pyfunction!(assemble_fragments, m)?)?;

    Ok(())
}
