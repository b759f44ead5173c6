/// Felsenstein pruning building blocks shared by the likelihood engines
///
/// Conditional likelihood arrays are `Array3<f64>` indexed
/// `[pattern, rate class, state]`. Moving an array across a branch is one
/// matrix product per rate class:
///   toward the father: temp[site, x] = (L_child @ P^T)[site, x]
///   toward the son:    temp[site, x] = (L_father @ P)[site, x]
///
/// This module also holds the branch-length parameter bookkeeping and the
/// derivative recursions used when differentiating along a path to the root.

use std::collections::{BTreeSet, HashMap};

use ndarray::prelude::*;
use tracing::warn;

use crate::alignment::{SiteContainer, SitePatterns};
use crate::config::LikelihoodConfig;
use crate::error::{PhyloError, Result};
use crate::model_set::MixedModelSet;
use crate::parameter::{
    branch_length_name, parse_branch_length_name, Parameter, ParameterList, BRLEN_ROOT,
    ROOT_POSITION,
};
use crate::rate::RateDistribution;
use crate::transition::{BranchTransitions, Transitions};
use crate::traversal::terminal_nodes_id;
use crate::tree::{NodeId, Tree};

/// Observed leaf states as indicator arrays, and the pattern weights
#[derive(Debug, Clone)]
pub struct LikelihoodData {
    patterns: SitePatterns,
    /// [pattern, state] per leaf
    leaves: HashMap<NodeId, Array2<f64>>,
}

impl LikelihoodData {
    /// Match every leaf of `tree` to its sequence by name.
    pub fn new(tree: &Tree, sites: &SiteContainer, use_patterns: bool, n_states: usize) -> Result<Self> {
        let patterns = SitePatterns::new(sites, use_patterns);
        let alphabet = patterns.alphabet();
        if alphabet.size() != n_states {
            return Err(PhyloError::dimension(
                format!("states of alphabet {}", alphabet.name()),
                n_states,
                alphabet.size(),
            ));
        }

        let n_patterns = patterns.number_of_patterns();
        let mut leaves = HashMap::new();
        for leaf in terminal_nodes_id(tree)? {
            let name = tree
                .node_name(leaf)?
                .ok_or_else(|| PhyloError::invalid_input(format!("leaf {leaf} has no name")))?;
            let seq = patterns.sequence_index(name)?;
            let mut array = Array2::zeros((n_patterns, n_states));
            for p in 0..n_patterns {
                let symbol = patterns.symbol(seq, p);
                let states = alphabet.states_for(symbol).ok_or_else(|| PhyloError::UnknownState {
                    sequence: name.to_string(),
                    site: p,
                    symbol,
                })?;
                // Ambiguous or missing data: every compatible state has likelihood 1
                for &s in states {
                    array[[p, s]] = 1.0;
                }
            }
            leaves.insert(leaf, array);
        }

        Ok(Self { patterns, leaves })
    }

    pub fn patterns(&self) -> &SitePatterns {
        &self.patterns
    }

    pub fn n_patterns(&self) -> usize {
        self.patterns.number_of_patterns()
    }

    pub fn weights(&self) -> &[f64] {
        self.patterns.weights()
    }

    /// Leaf array broadcast over rate classes: [pattern, class, state]
    pub fn leaf_array(&self, leaf: NodeId, n_classes: usize) -> Result<Array3<f64>> {
        let base = self
            .leaves
            .get(&leaf)
            .ok_or(PhyloError::NodeNotFound(leaf))?;
        let (n_patterns, n_states) = base.dim();
        Ok(Array3::from_shape_fn((n_patterns, n_classes, n_states), |(p, _, s)| base[[p, s]]))
    }
}

/// Move a son's array across its branch: out[p,c,x] = sum_y P_c[x,y] L[p,c,y]
pub fn propagate_to_father(pxy: &[Array2<f64>], child: &Array3<f64>) -> Array3<f64> {
    let mut out = Array3::zeros(child.raw_dim());
    for (c, p) in pxy.iter().enumerate() {
        let child_lnl = child.index_axis(Axis(1), c);
        out.index_axis_mut(Axis(1), c).assign(&child_lnl.dot(&p.t()));
    }
    out
}

/// Move a father-side array down a branch: out[p,c,x] = sum_y A[p,c,y] P_c[y,x]
pub fn propagate_to_son(pxy: &[Array2<f64>], father_side: &Array3<f64>) -> Array3<f64> {
    let mut out = Array3::zeros(father_side.raw_dim());
    for (c, p) in pxy.iter().enumerate() {
        let lnl = father_side.index_axis(Axis(1), c);
        out.index_axis_mut(Axis(1), c).assign(&lnl.dot(p));
    }
    out
}

/// Per-pattern likelihood: sum_c p_c sum_x freq_x A[p,c,x]
pub fn pattern_likelihoods(array: &Array3<f64>, freqs: &Array1<f64>, class_probs: &[f64]) -> Array1<f64> {
    let mut out = Array1::zeros(array.dim().0);
    for (c, &pc) in class_probs.iter().enumerate() {
        out.scaled_add(pc, &array.index_axis(Axis(1), c).dot(freqs));
    }
    out
}

/// Weighted sum of log pattern likelihoods.
pub fn log_likelihood(likelihoods: &Array1<f64>, weights: &[f64]) -> f64 {
    likelihoods
        .iter()
        .zip(weights)
        .map(|(&l, &w)| w * (l + 1e-300).ln())
        .sum()
}

// -------------------------------------------------------------------------
// Branch-length parameters
// -------------------------------------------------------------------------

/// Branch lengths as parameters, clamping short or missing lengths in `tree`.
///
/// With root reparametrisation on a rooted tree, the two root branches
/// become `BrLenRoot` (their sum) and `RootPosition` (share of the first).
pub fn init_branch_parameters(tree: &mut Tree, config: &LikelihoodConfig) -> Result<ParameterList> {
    let min = config.min_branch_length;
    for id in tree.branches_id() {
        match tree.distance_to_father(id)? {
            Some(d) if d >= min => {}
            Some(d) => {
                warn!(node = id, length = d, min, "branch length too short, clamped");
                tree.set_distance_to_father(id, min)?;
            }
            None => {
                warn!(node = id, min, "missing branch length, set to minimum");
                tree.set_distance_to_father(id, min)?;
            }
        }
    }

    let mut list = ParameterList::new();
    let root_sons = root_sons(tree, config)?;
    for id in tree.branches_id() {
        if root_sons.is_some_and(|(s0, s1)| id == s0 || id == s1) {
            continue;
        }
        let length = tree.distance_to_father(id)?.unwrap_or(min);
        list.add(Parameter::new(branch_length_name(id), length));
    }
    if let Some((s0, s1)) = root_sons {
        let l0 = tree.distance_to_father(s0)?.unwrap_or(min);
        let l1 = tree.distance_to_father(s1)?.unwrap_or(min);
        list.add(Parameter::new(BRLEN_ROOT, l0 + l1));
        list.add(Parameter::new(ROOT_POSITION, l0 / (l0 + l1)));
    }
    Ok(list)
}

/// The two root sons, when root reparametrisation applies.
pub fn root_sons(tree: &Tree, config: &LikelihoodConfig) -> Result<Option<(NodeId, NodeId)>> {
    if !config.reparametrize_root {
        return Ok(None);
    }
    if !tree.is_rooted() {
        warn!("root reparametrisation ignored on an unrooted tree");
        return Ok(None);
    }
    let root = tree.root_id();
    Ok(Some((tree.son_id(root, 0)?, tree.son_id(root, 1)?)))
}

/// What a set of changed parameters invalidates.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ParameterChanges {
    /// Rate distribution changed: every branch must be refreshed
    pub rates: bool,
    /// Branches whose transition matrices must be refreshed
    pub nodes: BTreeSet<NodeId>,
    /// Some model parameter changed (hypernode probabilities may move)
    pub models: bool,
}

impl ParameterChanges {
    pub fn is_empty(&self) -> bool {
        !self.rates && !self.models && self.nodes.is_empty()
    }

    /// True when the branch above `node` must be refreshed.
    pub fn affects(&self, node: NodeId) -> bool {
        self.rates || self.nodes.contains(&node)
    }
}

/// Push `changed` values into the tree, the model set and the rate
/// distribution. `all` must already hold the new values.
///
/// The values are written into copies first: if any of them is rejected,
/// `tree`, `model_set` and `rates` are left untouched.
pub fn apply_parameter_changes(
    tree: &mut Tree,
    model_set: &mut MixedModelSet,
    rates: &mut RateDistribution,
    all: &ParameterList,
    changed: &ParameterList,
    config: &LikelihoodConfig,
) -> Result<ParameterChanges> {
    let mut new_tree = tree.clone();
    let mut new_model_set = model_set.clone();
    let mut new_rates = rates.clone();
    let changes = write_parameter_values(
        &mut new_tree,
        &mut new_model_set,
        &mut new_rates,
        all,
        changed,
        config,
    )?;
    *tree = new_tree;
    *model_set = new_model_set;
    *rates = new_rates;
    Ok(changes)
}

fn write_parameter_values(
    tree: &mut Tree,
    model_set: &mut MixedModelSet,
    rates: &mut RateDistribution,
    all: &ParameterList,
    changed: &ParameterList,
    config: &LikelihoodConfig,
) -> Result<ParameterChanges> {
    let mut changes = ParameterChanges::default();
    for p in changed.iter() {
        if let Some(id) = parse_branch_length_name(&p.name) {
            if p.value < config.min_branch_length || !p.value.is_finite() {
                return Err(PhyloError::ParameterOutOfBounds {
                    name: p.name.clone(),
                    value: p.value,
                });
            }
            if tree.is_root(id)? {
                return Err(PhyloError::NodeIsRoot(id));
            }
            tree.set_distance_to_father(id, p.value)?;
            changes.nodes.insert(id);
        } else if p.name == BRLEN_ROOT || p.name == ROOT_POSITION {
            let (s0, s1) = root_sons(tree, config)?
                .ok_or_else(|| PhyloError::UnknownParameter(p.name.clone()))?;
            let total = all.value(BRLEN_ROOT)?;
            let position = all.value(ROOT_POSITION)?;
            if !(0.0..=1.0).contains(&position) {
                return Err(PhyloError::ParameterOutOfBounds {
                    name: ROOT_POSITION.to_string(),
                    value: position,
                });
            }
            tree.set_distance_to_father(s0, total * position)?;
            tree.set_distance_to_father(s1, total * (1.0 - position))?;
            changes.nodes.insert(s0);
            changes.nodes.insert(s1);
        } else if rates.parameters().has(&p.name) {
            rates.set_parameter_value(&p.name, p.value)?;
            changes.rates = true;
        } else if model_set.has_parameter(&p.name) {
            model_set.set_parameter_value(&p.name, p.value)?;
            changes.nodes.extend(model_set.nodes_with_parameter(&p.name));
            changes.models = true;
        } else {
            return Err(PhyloError::UnknownParameter(p.name.clone()));
        }
    }
    if changes.models {
        model_set.compute_hyper_nodes_probabilities();
    }
    Ok(changes)
}

// -------------------------------------------------------------------------
// Derivatives
// -------------------------------------------------------------------------

/// Quantity a likelihood derivative is taken with respect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variable {
    /// Length of the branch above a node
    Branch(NodeId),
    /// Sum of the two root branches
    RootLength,
    /// Share of the root length given to the first root son
    RootPosition,
}

impl Variable {
    pub fn parse(name: &str) -> Result<Self> {
        if name == BRLEN_ROOT {
            Ok(Self::RootLength)
        } else if name == ROOT_POSITION {
            Ok(Self::RootPosition)
        } else {
            parse_branch_length_name(name).map(Self::Branch).ok_or_else(|| {
                PhyloError::invalid_input(format!("no derivative with respect to '{name}'"))
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    First,
    Second,
}

/// Product over the sons of `node` of each son's propagated contribution.
pub fn product_over_sons<F>(tree: &Tree, node: NodeId, mut contribution: F) -> Result<Array3<f64>>
where
    F: FnMut(NodeId) -> Result<Array3<f64>>,
{
    let mut out: Option<Array3<f64>> = None;
    for son in tree.sons_id(node)? {
        let term = contribution(son)?;
        match out.as_mut() {
            Some(acc) => *acc *= &term,
            None => out = Some(term),
        }
    }
    out.ok_or_else(|| PhyloError::invalid_input(format!("node {node} has no son")))
}

/// Arrays needed by the pruning recursions within one region of the tree.
pub struct Pruning<'a> {
    pub tree: &'a Tree,
    pub transitions: &'a Transitions,
    pub likelihoods: &'a HashMap<NodeId, Array3<f64>>,
}

impl Pruning<'_> {
    fn transitions_of(&self, son: NodeId) -> Result<&BranchTransitions> {
        self.transitions.get(&son).ok_or_else(|| {
            PhyloError::invalid_input(format!("no transition matrices for branch above {son}"))
        })
    }

    fn likelihood_of(&self, node: NodeId) -> Result<&Array3<f64>> {
        self.likelihoods.get(&node).ok_or_else(|| {
            PhyloError::invalid_input(format!("no likelihood array for node {node}"))
        })
    }

    /// Conditional likelihood of the subtree below `node` from its sons' arrays.
    pub fn subtree(&self, node: NodeId) -> Result<Array3<f64>> {
        product_over_sons(self.tree, node, |son| {
            Ok(propagate_to_father(
                &self.transitions_of(son)?.pxy,
                self.likelihood_of(son)?,
            ))
        })
    }

    /// Derivative array at the father of `branch`.
    pub fn derivative_at_branch_father(&self, father: NodeId, branch: NodeId, order: Order) -> Result<Array3<f64>> {
        product_over_sons(self.tree, father, |son| {
            let t = self.transitions_of(son)?;
            let matrices = if son != branch {
                &t.pxy
            } else {
                match order {
                    Order::First => &t.dpxy,
                    Order::Second => &t.d2pxy,
                }
            };
            Ok(propagate_to_father(matrices, self.likelihood_of(son)?))
        })
    }

    /// Derivative array at `node` given the derivative array of the son on
    /// the path to the differentiated branch.
    pub fn derivative_from_son(&self, node: NodeId, path_son: NodeId, d_son: &Array3<f64>) -> Result<Array3<f64>> {
        product_over_sons(self.tree, node, |son| {
            let t = self.transitions_of(son)?;
            if son == path_son {
                Ok(propagate_to_father(&t.pxy, d_son))
            } else {
                Ok(propagate_to_father(&t.pxy, self.likelihood_of(son)?))
            }
        })
    }

    /// Derivative array at the root with respect to `BrLenRoot` or
    /// `RootPosition`: with len(s0) = a1-linear and len(s1) = a2-linear,
    ///   d  = a1 dL0 L1 + a2 L0 dL1
    ///   d2 = a1^2 d2L0 L1 + a2^2 L0 d2L1 + 2 a1 a2 dL0 dL1
    pub fn derivative_at_root(&self, variable: Variable, order: Order) -> Result<Array3<f64>> {
        let root = self.tree.root_id();
        let sons = self.tree.sons_id(root)?;
        let (s0, s1) = match sons.as_slice() {
            [s0, s1] => (*s0, *s1),
            _ => return Err(PhyloError::UnrootedTree),
        };
        let l0 = self.tree.distance_to_father(s0)?.unwrap_or(0.0);
        let l1 = self.tree.distance_to_father(s1)?.unwrap_or(0.0);
        let total = l0 + l1;
        let (a1, a2) = match variable {
            Variable::RootLength => {
                let position = if total > 0.0 { l0 / total } else { 0.5 };
                (position, 1.0 - position)
            }
            Variable::RootPosition => (total, -total),
            Variable::Branch(id) => {
                return Err(PhyloError::invalid_input(format!(
                    "branch {id} is not a root reparametrisation variable"
                )))
            }
        };

        let (t0, t1) = (self.transitions_of(s0)?, self.transitions_of(s1)?);
        let (lk0, lk1) = (self.likelihood_of(s0)?, self.likelihood_of(s1)?);
        let p0 = propagate_to_father(&t0.pxy, lk0);
        let p1 = propagate_to_father(&t1.pxy, lk1);
        let dp0 = propagate_to_father(&t0.dpxy, lk0);
        let dp1 = propagate_to_father(&t1.dpxy, lk1);
        match order {
            Order::First => Ok(&dp0 * &p1 * a1 + &p0 * &dp1 * a2),
            Order::Second => {
                let d2p0 = propagate_to_father(&t0.d2pxy, lk0);
                let d2p1 = propagate_to_father(&t1.d2pxy, lk1);
                Ok(&d2p0 * &p1 * (a1 * a1) + &p0 * &d2p1 * (a2 * a2) + &dp0 * &dp1 * (2.0 * a1 * a2))
            }
        }
    }
}
