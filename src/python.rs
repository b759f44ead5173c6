/// Python bindings
///
/// Every function takes the tree as a list of `(node_id, parent_id)` tuples
/// with one branch length per entry, and the aligned sequences of the
/// leaves as strings. Computations release the GIL.

use numpy::PyArray1;
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

use crate::alignment::{Alphabet, SiteContainer};
use crate::config::{LikelihoodConfig, ParsimonyConfig};
use crate::dr_likelihood::DrTreeLikelihood;
use crate::error::PhyloError;
use crate::mixed_likelihood::MixedTreeLikelihood;
use crate::model::{MixtureModel, TransitionModel, K80};
use crate::model_set::MixedModelSet;
use crate::parsimony::ParsimonyScore;
use crate::rate::RateDistribution;
use crate::tree::{NodeId, Tree};

fn to_py_err(e: PhyloError) -> PyErr {
    PyValueError::new_err(e.to_string())
}

fn alphabet(name: &str) -> PyResult<&'static Alphabet> {
    match name.to_ascii_lowercase().as_str() {
        "dna" => Ok(Alphabet::dna()),
        "binary" => Ok(Alphabet::binary()),
        other => Err(PyValueError::new_err(format!("unknown alphabet '{other}'"))),
    }
}

fn build_inputs(
    tree_structure: Vec<(NodeId, Option<NodeId>)>,
    branch_lengths: Vec<f64>,
    leaf_names: Vec<String>,
    sequences: Vec<String>,
    leaf_node_ids: Vec<NodeId>,
    alphabet_name: &str,
) -> PyResult<(Tree, SiteContainer)> {
    if sequences.len() != leaf_names.len() {
        return Err(PyValueError::new_err(format!(
            "{} sequences for {} leaves",
            sequences.len(),
            leaf_names.len()
        )));
    }
    let pairs: Vec<(String, String)> = leaf_names.iter().cloned().zip(sequences).collect();
    let sites = SiteContainer::from_pairs(alphabet(alphabet_name)?, &pairs).map_err(to_py_err)?;
    let tree = Tree::from_structure(tree_structure, branch_lengths, leaf_names, leaf_node_ids)
        .map_err(to_py_err)?;
    Ok((tree, sites))
}

fn rates(invariant_p: Option<f64>) -> Result<RateDistribution, PhyloError> {
    match invariant_p {
        None => Ok(RateDistribution::Constant),
        Some(p) if p == 0.0 => Ok(RateDistribution::Constant),
        Some(p) => RateDistribution::invariant(p),
    }
}

/// Compute the weighted Fitch parsimony score of an alignment
///
/// Args:
///     tree_structure: List of (node_id, parent_id) tuples
///     branch_lengths: Branch length for each node (to parent)
///     leaf_names: Names of leaf nodes
///     sequences: Aligned sequences, one per leaf
///     leaf_node_ids: Node IDs of the leaves, in the order of leaf_names
///     alphabet: "dna" or "binary"
///
/// Returns:
///     Total parsimony score
#[pyfunction]
#[pyo3(signature = (tree_structure, branch_lengths, leaf_names, sequences, leaf_node_ids, alphabet="dna"))]
fn compute_parsimony_score(
    py: Python<'_>,
    tree_structure: Vec<(NodeId, Option<NodeId>)>,
    branch_lengths: Vec<f64>,
    leaf_names: Vec<String>,
    sequences: Vec<String>,
    leaf_node_ids: Vec<NodeId>,
    alphabet: &str,
) -> PyResult<u64> {
    let (tree, sites) = build_inputs(tree_structure, branch_lengths, leaf_names, sequences, leaf_node_ids, alphabet)?;
    py.allow_threads(|| -> Result<u64, PhyloError> {
        let score = ParsimonyScore::new(tree, &sites, ParsimonyConfig::default())?;
        Ok(score.score())
    })
    .map_err(to_py_err)
}

/// Parsimony score of every alignment column
///
/// Returns:
///     1D numpy array of length n_sites
#[pyfunction]
#[pyo3(signature = (tree_structure, branch_lengths, leaf_names, sequences, leaf_node_ids, alphabet="dna"))]
fn compute_parsimony_site_scores<'py>(
    py: Python<'py>,
    tree_structure: Vec<(NodeId, Option<NodeId>)>,
    branch_lengths: Vec<f64>,
    leaf_names: Vec<String>,
    sequences: Vec<String>,
    leaf_node_ids: Vec<NodeId>,
    alphabet: &str,
) -> PyResult<Bound<'py, PyArray1<u32>>> {
    let (tree, sites) = build_inputs(tree_structure, branch_lengths, leaf_names, sequences, leaf_node_ids, alphabet)?;
    let scores = py
        .allow_threads(|| -> Result<Vec<u32>, PhyloError> {
            let score = ParsimonyScore::new(tree, &sites, ParsimonyConfig::default())?;
            Ok(score.site_scores())
        })
        .map_err(to_py_err)?;
    Ok(PyArray1::from_vec_bound(py, scores))
}

/// Score change of the nearest-neighbor interchange above every eligible node
///
/// Returns:
///     List of (node_id, delta) tuples; negative deltas improve the score
#[pyfunction]
#[pyo3(signature = (tree_structure, branch_lengths, leaf_names, sequences, leaf_node_ids, alphabet="dna"))]
fn compute_nni_deltas(
    py: Python<'_>,
    tree_structure: Vec<(NodeId, Option<NodeId>)>,
    branch_lengths: Vec<f64>,
    leaf_names: Vec<String>,
    sequences: Vec<String>,
    leaf_node_ids: Vec<NodeId>,
    alphabet: &str,
) -> PyResult<Vec<(NodeId, f64)>> {
    let (tree, sites) = build_inputs(tree_structure, branch_lengths, leaf_names, sequences, leaf_node_ids, alphabet)?;
    py.allow_threads(|| -> Result<Vec<(NodeId, f64)>, PhyloError> {
        let score = ParsimonyScore::new(tree, &sites, ParsimonyConfig::default())?;
        score.nni_deltas()
    })
    .map_err(to_py_err)
}

/// Log-likelihood of DNA sequences under K80 on every branch
///
/// Args:
///     kappa: Transition/transversion ratio
///     invariant_p: Proportion of invariant sites (None for a single rate)
#[pyfunction]
#[pyo3(signature = (kappa, tree_structure, branch_lengths, leaf_names, sequences, leaf_node_ids, invariant_p=None))]
fn compute_k80_log_likelihood(
    py: Python<'_>,
    kappa: f64,
    tree_structure: Vec<(NodeId, Option<NodeId>)>,
    branch_lengths: Vec<f64>,
    leaf_names: Vec<String>,
    sequences: Vec<String>,
    leaf_node_ids: Vec<NodeId>,
    invariant_p: Option<f64>,
) -> PyResult<f64> {
    let (tree, sites) = build_inputs(tree_structure, branch_lengths, leaf_names, sequences, leaf_node_ids, "dna")?;
    py.allow_threads(|| -> Result<f64, PhyloError> {
        let mut set = MixedModelSet::new();
        set.add_model(K80::new(kappa)?, &tree.branches_id())?;
        let lik = DrTreeLikelihood::new(tree, set, rates(invariant_p)?, &sites, LikelihoodConfig::default())?;
        Ok(lik.log_likelihood())
    })
    .map_err(to_py_err)
}

/// Log-likelihood with a K80 kappa mixture shared by a set of branches
///
/// The mixture draws one component per site for all of `mixed_nodes`
/// together; every other branch uses K80 with `background_kappa`.
///
/// Args:
///     kappas: Kappa of each mixture component
///     weights: Prior weight of each component
///     mixed_nodes: Node IDs whose branch carries the mixture
///     background_kappa: Kappa of the remaining branches
#[pyfunction]
#[pyo3(signature = (kappas, weights, mixed_nodes, background_kappa, tree_structure, branch_lengths, leaf_names, sequences, leaf_node_ids, invariant_p=None))]
fn compute_k80_mixture_log_likelihood(
    py: Python<'_>,
    kappas: Vec<f64>,
    weights: Vec<f64>,
    mixed_nodes: Vec<NodeId>,
    background_kappa: f64,
    tree_structure: Vec<(NodeId, Option<NodeId>)>,
    branch_lengths: Vec<f64>,
    leaf_names: Vec<String>,
    sequences: Vec<String>,
    leaf_node_ids: Vec<NodeId>,
    invariant_p: Option<f64>,
) -> PyResult<f64> {
    let (tree, sites) = build_inputs(tree_structure, branch_lengths, leaf_names, sequences, leaf_node_ids, "dna")?;
    py.allow_threads(|| -> Result<f64, PhyloError> {
        let components = kappas
            .iter()
            .map(|&k| -> Result<Box<dyn TransitionModel>, PhyloError> { Ok(Box::new(K80::new(k)?)) })
            .collect::<Result<Vec<_>, PhyloError>>()?;
        let mixture = MixtureModel::new("K80 mixture", components, &weights)?;
        let others: Vec<NodeId> = tree
            .branches_id()
            .into_iter()
            .filter(|n| !mixed_nodes.contains(n))
            .collect();
        let mut set = MixedModelSet::new();
        if !others.is_empty() {
            set.add_model(K80::new(background_kappa)?, &others)?;
        }
        set.add_model(mixture, &mixed_nodes)?;
        let lik = MixedTreeLikelihood::new(tree, set, rates(invariant_p)?, &sites, LikelihoodConfig::default())?;
        Ok(lik.log_likelihood())
    })
    .map_err(to_py_err)
}

/// Double-recursive parsimony and mixture likelihoods
#[pymodule]
fn drphylo(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(compute_parsimony_score, m)?)?;
    m.add_function(wrap_pyfunction!(compute_parsimony_site_scores, m)?)?;
    m.add_function(wrap_pyfunction!(compute_nni_deltas, m)?)?;
    m.add_function(wrap_pyfunction!(compute_k80_log_likelihood, m)?)?;
    m.add_function(wrap_pyfunction!(compute_k80_mixture_log_likelihood, m)?)?;
    Ok(())
}
