//! Likelihood of a non-homogeneous model whose branches may carry mixtures.
//!
//! A mixture shared by several branches cannot be averaged branch by branch:
//! the same component must be drawn for every branch of a site. The tree is
//! therefore decomposed into sub-likelihoods. Walking down from its upper
//! node, an instance looks for the shallowest node below which some mixed
//! model spans more than one son subtree (or a son branch and branches
//! deeper in the same subtree). There it spawns one sub-likelihood per
//! combination of the components of those models, each with a HyperNode
//! restricting them to a single component, and stops descending. The array
//! at such an expansion point is the probability-weighted sum of the
//! sub-likelihood arrays.
//!
//! Layout:
//! - The main instance spans the whole tree and expands at the root, once
//!   per HyperNode registered in the model set (the complete one if none).
//! - Each instance owns the transition matrices of the branches in its
//!   region, below its upper node and down to its expansion points.
//! - Sub-likelihoods at an expansion point are independent and computed in
//!   parallel with Rayon.

use std::collections::{BTreeMap, HashMap};

use ndarray::prelude::*;
use rayon::prelude::*;
use tracing::{debug, info, instrument, trace};

use crate::alignment::SiteContainer;
use crate::config::LikelihoodConfig;
use crate::error::{PhyloError, Result};
use crate::likelihood::{
    apply_parameter_changes, init_branch_parameters, log_likelihood, pattern_likelihoods,
    LikelihoodData, Order, ParameterChanges, Pruning, Variable,
};
use crate::model_set::{HyperNode, MixedModelSet};
use crate::parameter::ParameterList;
use crate::rate::RateDistribution;
use crate::transition::{BranchTransitions, Transitions};
use crate::tree::{NodeId, Tree};

/// Read-only state shared by every instance of the decomposition.
struct Context<'a> {
    tree: &'a Tree,
    model_set: &'a MixedModelSet,
    rates: &'a RateDistribution,
    data: &'a LikelihoodData,
    with_derivatives: bool,
}

impl Context<'_> {
    fn dim(&self) -> (usize, usize, usize) {
        (
            self.data.n_patterns(),
            self.rates.number_of_categories(),
            self.model_set.n_states(),
        )
    }
}

/// One node of the decomposition: a likelihood restricted to a HyperNode
/// and to the part of the tree below `upper`.
#[derive(Debug, Clone)]
struct MixedNode {
    upper: NodeId,
    hyper_node: HyperNode,
    main: bool,
    expansions: BTreeMap<NodeId, Vec<MixedNode>>,
    /// Nodes handled here, pre-order from `upper`, expansion points included
    region: Vec<NodeId>,
    transitions: Transitions,
    likelihoods: HashMap<NodeId, Array3<f64>>,
    derivatives: HashMap<NodeId, Array3<f64>>,
}

/// True when the components of a mixed model carried by `model_nodes` can
/// no longer be drawn independently below `node`.
fn must_expand(tree: &Tree, model_nodes: &[NodeId], node: NodeId) -> Result<bool> {
    let mut count = 0;
    for son in tree.sons_id(node)? {
        let on_son = model_nodes.contains(&son);
        let deeper = tree
            .subtree_nodes_id(son)?
            .into_iter()
            .any(|n| n != son && model_nodes.contains(&n));
        count += usize::from(on_son);
        if deeper {
            count += if on_son { 2 } else { 1 };
        }
        if count >= 2 {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Pre-order from `upper`, not descending below expansion points.
fn region_of(tree: &Tree, upper: NodeId, expansions: &BTreeMap<NodeId, Vec<MixedNode>>) -> Result<Vec<NodeId>> {
    let mut out = Vec::new();
    let mut stack = vec![upper];
    while let Some(node) = stack.pop() {
        out.push(node);
        if !expansions.contains_key(&node) {
            stack.extend(tree.sons_id(node)?.into_iter().rev());
        }
    }
    Ok(out)
}

impl MixedNode {
    /// Main instance: one sub-likelihood per HyperNode at the root.
    fn main(ctx: &Context) -> Result<Self> {
        let root = ctx.tree.root_id();
        let hyper_nodes = if ctx.model_set.hyper_nodes().is_empty() {
            let mut complete = HyperNode::complete(ctx.model_set);
            complete.set_probability(ctx.model_set.hyper_node_probability(&complete));
            vec![complete]
        } else {
            ctx.model_set.hyper_nodes().to_vec()
        };
        let children = hyper_nodes
            .into_iter()
            .map(|hn| Self::build(ctx, hn, root))
            .collect::<Result<Vec<_>>>()?;
        let mut expansions = BTreeMap::new();
        expansions.insert(root, children);
        Ok(Self {
            upper: root,
            hyper_node: HyperNode::complete(ctx.model_set),
            main: true,
            expansions,
            region: vec![root],
            transitions: Transitions::new(),
            likelihoods: HashMap::new(),
            derivatives: HashMap::new(),
        })
    }

    /// Sub-likelihood below `upper` restricted to `hyper_node`.
    fn build(ctx: &Context, hyper_node: HyperNode, upper: NodeId) -> Result<Self> {
        let tree = ctx.tree;
        let model_set = ctx.model_set;
        let mut expansions = BTreeMap::new();
        let mut work = vec![upper];

        while let Some(node) = work.pop() {
            let mut flagged = Vec::new();
            for model in 0..model_set.number_of_models() {
                let n = model_set.model(model).number_of_components();
                if hyper_node.active(model, n).len() > 1
                    && must_expand(tree, model_set.nodes_with_model(model), node)?
                {
                    flagged.push(model);
                }
            }

            if flagged.is_empty() {
                work.extend(tree.sons_id(node)?);
                continue;
            }

            let sizes: Vec<Vec<usize>> = flagged
                .iter()
                .map(|&m| hyper_node.active(m, model_set.model(m).number_of_components()))
                .collect();
            let combinations: usize = sizes.iter().map(Vec::len).product();
            debug!(node, models = ?flagged, combinations, "mixture expanded");

            let mut children = Vec::with_capacity(combinations);
            for i in 0..combinations {
                let mut s = i;
                let mut hn = hyper_node.clone();
                for (&model, active) in flagged.iter().zip(&sizes) {
                    hn.set_node(model, vec![active[s % active.len()]]);
                    s /= active.len();
                }
                hn.set_probability(model_set.hyper_node_probability(&hn));
                children.push(Self::build(ctx, hn, node)?);
            }
            expansions.insert(node, children);
        }

        let region = region_of(tree, upper, &expansions)?;
        let mut instance = Self {
            upper,
            hyper_node,
            main: false,
            expansions,
            region,
            transitions: Transitions::new(),
            likelihoods: HashMap::new(),
            derivatives: HashMap::new(),
        };
        instance.compute_transitions(ctx, |_| true)?;
        Ok(instance)
    }

    fn probability(&self) -> f64 {
        self.hyper_node.probability()
    }

    fn sub_likelihoods_mut(&mut self) -> Vec<&mut MixedNode> {
        self.expansions.values_mut().flatten().collect()
    }

    fn compute_transitions<F: Fn(NodeId) -> bool>(&mut self, ctx: &Context, refresh: F) -> Result<()> {
        for &node in &self.region {
            if node == self.upper || !refresh(node) {
                continue;
            }
            let t = BranchTransitions::for_node(
                ctx.tree,
                ctx.model_set,
                &self.hyper_node,
                ctx.rates,
                node,
                ctx.with_derivatives,
            )?;
            trace!(upper = self.upper, node, "transition matrices refreshed");
            self.transitions.insert(node, t);
        }
        Ok(())
    }

    /// Bring HyperNode probabilities and transition matrices up to date.
    fn refresh(&mut self, ctx: &Context, changes: &ParameterChanges) -> Result<()> {
        for child in self.sub_likelihoods_mut() {
            if changes.models {
                let p = ctx.model_set.hyper_node_probability(&child.hyper_node);
                child.hyper_node.set_probability(p);
            }
            child.refresh(ctx, changes)?;
        }
        self.compute_transitions(ctx, |node| changes.affects(node))
    }

    /// Σ_t p_t / p × array_t at `node`, zero when this instance has
    /// probability 0.
    fn weighted_sum<'s, F>(&'s self, ctx: &Context, node: NodeId, array_of: F) -> Result<Array3<f64>>
    where
        F: Fn(&'s MixedNode) -> Option<&'s Array3<f64>>,
    {
        let mut out = Array3::zeros(ctx.dim());
        let total = self.probability();
        if total == 0.0 {
            return Ok(out);
        }
        for child in self.expansions.get(&node).into_iter().flatten() {
            let array = array_of(child).ok_or_else(|| {
                PhyloError::invalid_input(format!("sub-likelihood at {node} has no array"))
            })?;
            out.scaled_add(child.probability() / total, array);
        }
        Ok(out)
    }

    /// Conditional likelihood arrays of every node of the region.
    fn compute(&mut self, ctx: &Context) -> Result<()> {
        if self.probability() != 0.0 {
            self.sub_likelihoods_mut()
                .into_par_iter()
                .try_for_each(|child| child.compute(ctx))?;
        }

        let n_classes = ctx.rates.number_of_categories();
        let mut likelihoods = HashMap::with_capacity(self.region.len());
        for &node in self.region.iter().rev() {
            let array = if self.expansions.contains_key(&node) {
                self.weighted_sum(ctx, node, |c| c.likelihoods.get(&node))?
            } else if ctx.tree.is_leaf(node)? {
                ctx.data.leaf_array(node, n_classes)?
            } else {
                Pruning {
                    tree: ctx.tree,
                    transitions: &self.transitions,
                    likelihoods: &likelihoods,
                }
                .subtree(node)?
            };
            likelihoods.insert(node, array);
        }
        self.likelihoods = likelihoods;
        Ok(())
    }

    /// Derivative arrays from the differentiated branch up to `upper`.
    fn compute_derivative(&mut self, ctx: &Context, variable: Variable, order: Order) -> Result<()> {
        let tree = ctx.tree;
        let start = match variable {
            Variable::Branch(id) if !self.main => {
                tree.father_id(id)?.ok_or(PhyloError::NodeIsRoot(id))?
            }
            _ => tree.root_id(),
        };

        let mut expansion = None;
        let mut current = Some(start);
        while let Some(node) = current {
            if self.expansions.contains_key(&node) {
                expansion = Some(node);
                break;
            }
            if node == self.upper {
                break;
            }
            current = tree.father_id(node)?;
        }

        let (mut node, array) = match expansion {
            Some(e) => {
                if self.probability() != 0.0 {
                    if let Some(children) = self.expansions.get_mut(&e) {
                        children
                            .par_iter_mut()
                            .try_for_each(|child| child.compute_derivative(ctx, variable, order))?;
                    }
                }
                (e, self.weighted_sum(ctx, e, |c| c.derivatives.get(&e))?)
            }
            None => {
                let pruning = Pruning {
                    tree,
                    transitions: &self.transitions,
                    likelihoods: &self.likelihoods,
                };
                let array = match variable {
                    Variable::Branch(id) => pruning.derivative_at_branch_father(start, id, order)?,
                    _ => pruning.derivative_at_root(variable, order)?,
                };
                (start, array)
            }
        };

        let pruning = Pruning {
            tree,
            transitions: &self.transitions,
            likelihoods: &self.likelihoods,
        };
        let mut derivatives = HashMap::new();
        let mut d_node = array;
        while node != self.upper {
            let Some(father) = tree.father_id(node)? else {
                break;
            };
            let d_father = pruning.derivative_from_son(father, node, &d_node)?;
            derivatives.insert(node, d_node);
            node = father;
            d_node = d_father;
        }
        derivatives.insert(node, d_node);
        self.derivatives = derivatives;
        Ok(())
    }

    fn collect_expansion_points(&self, out: &mut Vec<ExpansionPoint>) {
        for (&node, children) in &self.expansions {
            out.push(ExpansionPoint {
                node,
                probability: self.probability(),
                sub_probabilities: children.iter().map(MixedNode::probability).collect(),
            });
        }
        for child in self.expansions.values().flatten() {
            child.collect_expansion_points(out);
        }
    }
}

/// A node where the likelihood is split over mixture components.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpansionPoint {
    pub node: NodeId,
    /// Probability of the instance that expanded here
    pub probability: f64,
    /// HyperNode probability of each sub-likelihood spawned here
    pub sub_probabilities: Vec<f64>,
}

/// Exact likelihood of a model set with mixtures on several branches.
#[derive(Debug, Clone)]
pub struct MixedTreeLikelihood {
    tree: Tree,
    model_set: MixedModelSet,
    rates: RateDistribution,
    data: LikelihoodData,
    config: LikelihoodConfig,
    parameters: ParameterList,
    root_frequencies: Array1<f64>,
    main: MixedNode,
    likelihoods: Array1<f64>,
}

impl MixedTreeLikelihood {
    /// Build the decomposition and compute the likelihood.
    ///
    /// # Errors
    /// `ModelSetNotFullySetUp` when some branch has no model, and the data
    /// errors of [`LikelihoodData::new`].
    pub fn new(
        mut tree: Tree,
        model_set: MixedModelSet,
        rates: RateDistribution,
        sites: &SiteContainer,
        config: LikelihoodConfig,
    ) -> Result<Self> {
        model_set.check_fully_set_up_for(&tree)?;
        let data = LikelihoodData::new(&tree, sites, config.use_patterns, model_set.n_states())?;
        let mut parameters = init_branch_parameters(&mut tree, &config)?;
        parameters.extend(model_set.parameters());
        parameters.extend(rates.parameters());
        let root_frequencies = model_set.root_frequencies(&tree)?;

        let main = MixedNode::main(&Context {
            tree: &tree,
            model_set: &model_set,
            rates: &rates,
            data: &data,
            with_derivatives: config.needs_derivatives(),
        })?;

        let mut lik = Self {
            tree,
            model_set,
            rates,
            data,
            config,
            parameters,
            root_frequencies,
            main,
            likelihoods: Array1::zeros(0),
        };
        lik.compute_tree_likelihood()?;
        info!(
            patterns = lik.data.n_patterns(),
            expansion_points = lik.expansion_points().len(),
            log_likelihood = lik.log_likelihood(),
            "mixed likelihood initialised"
        );
        Ok(lik)
    }

    /// The decomposition tree, mutably, with the shared read-only state.
    fn split(&mut self) -> (&mut MixedNode, Context<'_>) {
        let ctx = Context {
            tree: &self.tree,
            model_set: &self.model_set,
            rates: &self.rates,
            data: &self.data,
            with_derivatives: self.config.needs_derivatives(),
        };
        (&mut self.main, ctx)
    }

    fn root_array<'s>(&'s self, arrays: &'s HashMap<NodeId, Array3<f64>>) -> Result<&'s Array3<f64>> {
        let root = self.tree.root_id();
        arrays
            .get(&root)
            .ok_or_else(|| PhyloError::invalid_input(format!("no array at root {root}")))
    }

    #[instrument(skip_all)]
    pub fn compute_tree_likelihood(&mut self) -> Result<()> {
        let (main, ctx) = self.split();
        main.compute(&ctx)?;
        let root = self.root_array(&self.main.likelihoods)?;
        self.likelihoods = pattern_likelihoods(root, &self.root_frequencies, &self.rates.probabilities());
        Ok(())
    }

    pub fn log_likelihood(&self) -> f64 {
        log_likelihood(&self.likelihoods, self.data.weights())
    }

    /// Likelihood of each distinct pattern
    pub fn pattern_likelihoods(&self) -> &Array1<f64> {
        &self.likelihoods
    }

    /// Likelihood of an original alignment column.
    pub fn likelihood_for_site(&self, site: usize) -> Result<f64> {
        Ok(self.likelihoods[self.data.patterns().pattern_of_site(site)?])
    }

    pub fn log_likelihood_for_site(&self, site: usize) -> Result<f64> {
        Ok(self.likelihood_for_site(site)?.ln())
    }

    pub fn parameters(&self) -> &ParameterList {
        &self.parameters
    }

    /// Set the values of the known parameters among `params`.
    pub fn set_parameters(&mut self, params: &ParameterList) -> Result<()> {
        let changed = self.parameters.clone().match_values(params);
        if changed.is_empty() {
            return Ok(());
        }
        self.fire_parameter_changed(&changed)
    }

    /// Push changed values into the tree and models, then refresh the
    /// HyperNode probabilities and the affected transition matrices of
    /// every sub-likelihood before recomputing.
    pub fn fire_parameter_changed(&mut self, changed: &ParameterList) -> Result<()> {
        let mut all = self.parameters.clone();
        all.match_values(changed);
        let changes = apply_parameter_changes(
            &mut self.tree,
            &mut self.model_set,
            &mut self.rates,
            &all,
            changed,
            &self.config,
        )?;
        self.parameters = all;
        if changes.is_empty() {
            return Ok(());
        }
        if changes.models {
            self.root_frequencies = self.model_set.root_frequencies(&self.tree)?;
        }
        debug!(
            parameters = changed.len(),
            branches = changes.nodes.len(),
            rates = changes.rates,
            "parameters changed"
        );
        let (main, ctx) = self.split();
        main.refresh(&ctx, &changes)?;
        self.compute_tree_likelihood()
    }

    /// Per-pattern dL/dx or d2L/dx2 for a branch-length parameter.
    fn pattern_derivatives(&mut self, name: &str, order: Order) -> Result<Array1<f64>> {
        let enabled = match order {
            Order::First => self.config.compute_first_order_derivatives,
            Order::Second => self.config.compute_second_order_derivatives,
        };
        if !enabled {
            return Err(PhyloError::invalid_input(format!(
                "{order:?} order derivatives are disabled"
            )));
        }
        if !self.parameters.has(name) {
            return Err(PhyloError::UnknownParameter(name.to_string()));
        }
        let variable = Variable::parse(name)?;
        let (main, ctx) = self.split();
        main.compute_derivative(&ctx, variable, order)?;
        let root = self.root_array(&self.main.derivatives)?;
        Ok(pattern_likelihoods(root, &self.root_frequencies, &self.rates.probabilities()))
    }

    /// d log L / dx for a branch-length parameter `name`.
    pub fn d_log_likelihood(&mut self, name: &str) -> Result<f64> {
        let d = self.pattern_derivatives(name, Order::First)?;
        Ok(self
            .likelihoods
            .iter()
            .zip(d.iter())
            .zip(self.data.weights())
            .map(|((&l, &dl), &w)| w * dl / l)
            .sum())
    }

    /// d2 log L / dx2 for a branch-length parameter `name`.
    pub fn d2_log_likelihood(&mut self, name: &str) -> Result<f64> {
        let d = self.pattern_derivatives(name, Order::First)?;
        let d2 = self.pattern_derivatives(name, Order::Second)?;
        Ok(self
            .likelihoods
            .iter()
            .zip(d.iter().zip(d2.iter()))
            .zip(self.data.weights())
            .map(|((&l, (&dl, &d2l)), &w)| {
                let r = dl / l;
                w * (d2l / l - r * r)
            })
            .sum())
    }

    /// Every expansion point of the decomposition, outermost first.
    pub fn expansion_points(&self) -> Vec<ExpansionPoint> {
        let mut out = Vec::new();
        self.main.collect_expansion_points(&mut out);
        out
    }

    /// Probability of the main instance
    pub fn probability(&self) -> f64 {
        self.main.probability()
    }

    /// Replace the alignment and recompute.
    pub fn set_data(&mut self, sites: &SiteContainer) -> Result<()> {
        self.data = LikelihoodData::new(&self.tree, sites, self.config.use_patterns, self.model_set.n_states())?;
        self.compute_tree_likelihood()
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn model_set(&self) -> &MixedModelSet {
        &self.model_set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::Alphabet;
    use crate::dr_likelihood::DrTreeLikelihood;
    use crate::model::{MixtureModel, TransitionModel, K80};
    use crate::parameter::Parameter;
    use approx::assert_abs_diff_eq;

    // ((A,B)4,(C,D)5)6
    fn tree() -> Tree {
        let names = ["A", "B", "C", "D"].iter().map(|s| s.to_string()).collect();
        Tree::from_structure(
            vec![(6, None), (4, Some(6)), (0, Some(4)), (1, Some(4)), (5, Some(6)), (2, Some(5)), (3, Some(5))],
            vec![0.0, 0.1, 0.05, 0.2, 0.15, 0.3, 0.1],
            names,
            vec![0, 1, 2, 3],
        )
        .unwrap()
    }

    fn sites() -> SiteContainer {
        SiteContainer::from_pairs(
            Alphabet::dna(),
            &[("A", "ACGTTAGCA"), ("B", "ACGTCAGCA"), ("C", "ATGCTAGTA"), ("D", "GTGCTACTA")],
        )
        .unwrap()
    }

    fn kappas() -> MixtureModel {
        let components: Vec<Box<dyn TransitionModel>> = vec![
            Box::new(K80::new(1.0).unwrap()),
            Box::new(K80::new(5.0).unwrap()),
        ];
        MixtureModel::new("kappas", components, &[0.3, 0.7]).unwrap()
    }

    fn mixed_on(mixed: &[NodeId]) -> MixedModelSet {
        let others: Vec<NodeId> = tree().branches_id().into_iter().filter(|n| !mixed.contains(n)).collect();
        let mut set = MixedModelSet::new();
        set.add_model(K80::new(2.0).unwrap(), &others).unwrap();
        set.add_model(kappas(), mixed).unwrap();
        set
    }

    fn fixed_on(mixed: &[NodeId], kappa: f64) -> MixedModelSet {
        let others: Vec<NodeId> = tree().branches_id().into_iter().filter(|n| !mixed.contains(n)).collect();
        let mut set = MixedModelSet::new();
        set.add_model(K80::new(2.0).unwrap(), &others).unwrap();
        set.add_model(K80::new(kappa).unwrap(), mixed).unwrap();
        set
    }

    fn mixed(set: MixedModelSet) -> MixedTreeLikelihood {
        MixedTreeLikelihood::new(tree(), set, RateDistribution::Constant, &sites(), LikelihoodConfig::default()).unwrap()
    }

    fn dr(set: MixedModelSet) -> DrTreeLikelihood {
        DrTreeLikelihood::new(tree(), set, RateDistribution::Constant, &sites(), LikelihoodConfig::default()).unwrap()
    }

    #[test]
    fn test_expansion_rule() {
        let t = tree();
        // Both sons of 5 carry the model
        assert!(must_expand(&t, &[2, 3], 5).unwrap());
        // Only one subtree of 6, and not on its son
        assert!(!must_expand(&t, &[2, 3], 6).unwrap());
        // Son branch and a deeper branch in the same subtree
        assert!(must_expand(&t, &[5, 2], 6).unwrap());
        assert!(!must_expand(&t, &[2], 5).unwrap());
    }

    #[test]
    fn test_shared_mixture_is_decomposed() {
        let lik = mixed(mixed_on(&[2, 3]));
        let points = lik.expansion_points();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].node, 6);
        assert_eq!(points[0].sub_probabilities.len(), 1);
        assert_eq!(points[1].node, 5);
        assert_eq!(points[1].sub_probabilities.len(), 2);
        for point in &points {
            let total: f64 = point.sub_probabilities.iter().sum();
            assert_abs_diff_eq!(total, point.probability, epsilon = 1e-12);
        }

        let l1 = dr(fixed_on(&[2, 3], 1.0));
        let l5 = dr(fixed_on(&[2, 3], 5.0));
        let expected = l1.pattern_likelihoods() * 0.3 + l5.pattern_likelihoods() * 0.7;
        for (a, b) in lik.pattern_likelihoods().iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_single_branch_mixture_is_averaged() {
        let lik = mixed(mixed_on(&[2]));
        assert_eq!(lik.expansion_points().len(), 1);
        let averaged = dr(mixed_on(&[2]));
        assert_abs_diff_eq!(lik.log_likelihood(), averaged.log_likelihood(), epsilon = 1e-10);
    }

    #[test]
    fn test_derivatives_match_finite_differences() {
        for name in ["BrLen2", "BrLen5", "BrLen0"] {
            let mut lik = mixed(mixed_on(&[2, 3]));
            let x = lik.parameters().value(name).unwrap();
            let d = lik.d_log_likelihood(name).unwrap();
            let d2 = lik.d2_log_likelihood(name).unwrap();

            let h = 1e-5;
            let mut at = |v: f64| {
                let update: ParameterList = std::iter::once(Parameter::new(name, v)).collect();
                lik.set_parameters(&update).unwrap();
                lik.log_likelihood()
            };
            let (up, mid, down) = (at(x + h), at(x), at(x - h));
            assert_abs_diff_eq!(d, (up - down) / (2.0 * h), epsilon = 1e-5);
            assert_abs_diff_eq!(d2, (up - 2.0 * mid + down) / (h * h), epsilon = 1e-2);
        }
    }

    #[test]
    fn test_mixture_weights_follow_parameters() {
        let mut lik = mixed(mixed_on(&[2, 3]));
        let update: ParameterList = std::iter::once(Parameter::new("relproba1_2", 0.6)).collect();
        lik.set_parameters(&update).unwrap();
        let points = lik.expansion_points();
        assert_abs_diff_eq!(points[1].sub_probabilities[0], 0.6, epsilon = 1e-12);
        assert_abs_diff_eq!(points[1].sub_probabilities[1], 0.4, epsilon = 1e-12);

        let l1 = dr(fixed_on(&[2, 3], 1.0));
        let l5 = dr(fixed_on(&[2, 3], 5.0));
        let expected = l1.pattern_likelihoods() * 0.6 + l5.pattern_likelihoods() * 0.4;
        assert_abs_diff_eq!(lik.pattern_likelihoods()[0], expected[0], epsilon = 1e-12);
    }

    #[test]
    fn test_unknown_parameter_derivative() {
        let mut lik = mixed(mixed_on(&[2, 3]));
        assert!(matches!(
            lik.d_log_likelihood("BrLen42"),
            Err(PhyloError::UnknownParameter(_))
        ));
    }

    #[test]
    fn test_site_accessors() {
        let lik = mixed(mixed_on(&[2, 3]));
        let total: f64 = (0..9).map(|s| lik.log_likelihood_for_site(s).unwrap()).sum();
        assert_abs_diff_eq!(total, lik.log_likelihood(), epsilon = 1e-9);
        assert_eq!(lik.probability(), 1.0);
    }
}
