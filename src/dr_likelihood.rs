//! Double-recursive likelihood over the whole tree for a fixed HyperNode.
//!
//! Each directed edge caches the conditional likelihood of the far side,
//! expressed at the neighbor. The combine moves every input across its
//! branch (down from the father, up from a son) and multiplies them; at the
//! root the equilibrium frequencies are folded in. The log-likelihood can
//! then be read at any node.

use ndarray::prelude::*;
use tracing::{info, instrument, trace};

use crate::alignment::SiteContainer;
use crate::config::LikelihoodConfig;
use crate::error::{PhyloError, Result};
use crate::likelihood::{
    apply_parameter_changes, init_branch_parameters, log_likelihood, pattern_likelihoods,
    propagate_to_father, propagate_to_son, LikelihoodData,
};
use crate::model_set::{HyperNode, MixedModelSet};
use crate::parameter::ParameterList;
use crate::rate::RateDistribution;
use crate::transition::{BranchTransitions, Transitions};
use crate::traversal::{self, CombineOperator, DirectionalCache};
use crate::tree::{NodeId, Tree};

struct LikelihoodOperator<'a> {
    data: &'a LikelihoodData,
    transitions: &'a Transitions,
    root_frequencies: &'a Array1<f64>,
    n_classes: usize,
}

impl LikelihoodOperator<'_> {
    fn branch(&self, node: NodeId) -> Result<&BranchTransitions> {
        self.transitions.get(&node).ok_or_else(|| {
            PhyloError::invalid_input(format!("no transition matrices for branch above {node}"))
        })
    }
}

impl CombineOperator for LikelihoodOperator<'_> {
    type Array = Array3<f64>;

    fn leaf_array(&self, _tree: &Tree, leaf: NodeId) -> Result<Array3<f64>> {
        self.data.leaf_array(leaf, self.n_classes)
    }

    fn combine(&self, tree: &Tree, center: NodeId, inputs: &[(NodeId, &Array3<f64>)]) -> Result<Array3<f64>> {
        let father = tree.father_id(center)?;
        let mut out: Option<Array3<f64>> = None;
        for &(neighbor, array) in inputs {
            let term = if neighbor == center {
                array.clone()
            } else if Some(neighbor) == father {
                propagate_to_son(&self.branch(center)?.pxy, array)
            } else {
                propagate_to_father(&self.branch(neighbor)?.pxy, array)
            };
            match out.as_mut() {
                Some(acc) => *acc *= &term,
                None => out = Some(term),
            }
        }
        let mut out = out.ok_or_else(|| PhyloError::invalid_input("nothing to combine"))?;
        if father.is_none() {
            out *= self.root_frequencies;
        }
        Ok(out)
    }
}

/// Likelihood of a (possibly non-homogeneous) model, readable at every node.
#[derive(Debug, Clone)]
pub struct DrTreeLikelihood {
    tree: Tree,
    model_set: MixedModelSet,
    rates: RateDistribution,
    data: LikelihoodData,
    config: LikelihoodConfig,
    hyper_node: HyperNode,
    transitions: Transitions,
    root_frequencies: Array1<f64>,
    cache: DirectionalCache<Array3<f64>>,
    likelihoods: Array1<f64>,
    parameters: ParameterList,
}

impl DrTreeLikelihood {
    /// Check the model set, build the leaf arrays and compute the likelihood.
    ///
    /// Mixtures are averaged on each branch (complete HyperNode).
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
        let hyper_node = HyperNode::complete(&model_set);

        info!(
            patterns = data.n_patterns(),
            classes = rates.number_of_categories(),
            parameters = parameters.len(),
            "double-recursive likelihood initialised"
        );

        let mut lik = Self {
            tree,
            model_set,
            rates,
            data,
            config,
            hyper_node,
            transitions: Transitions::new(),
            root_frequencies,
            cache: DirectionalCache::new(),
            likelihoods: Array1::zeros(0),
            parameters,
        };
        lik.compute_all_transitions()?;
        lik.compute_tree_likelihood()?;
        Ok(lik)
    }

    /// Restrict the mixtures to the components of `hyper_node` and recompute.
    pub fn set_hyper_node(&mut self, hyper_node: HyperNode) -> Result<()> {
        if hyper_node.number_of_models() != self.model_set.number_of_models() {
            return Err(PhyloError::dimension(
                "hypernode models",
                self.model_set.number_of_models(),
                hyper_node.number_of_models(),
            ));
        }
        self.hyper_node = hyper_node;
        self.compute_all_transitions()?;
        self.compute_tree_likelihood()
    }

    fn refresh_branch(&mut self, node: NodeId) -> Result<()> {
        let t = BranchTransitions::for_node(
            &self.tree,
            &self.model_set,
            &self.hyper_node,
            &self.rates,
            node,
            false,
        )?;
        trace!(node, "transition matrices refreshed");
        self.transitions.insert(node, t);
        Ok(())
    }

    fn compute_all_transitions(&mut self) -> Result<()> {
        for node in self.tree.branches_id() {
            self.refresh_branch(node)?;
        }
        Ok(())
    }

    fn operator(&self) -> LikelihoodOperator<'_> {
        LikelihoodOperator {
            data: &self.data,
            transitions: &self.transitions,
            root_frequencies: &self.root_frequencies,
            n_classes: self.rates.number_of_categories(),
        }
    }

    fn collapse(&self, array: &Array3<f64>) -> Array1<f64> {
        let ones = Array1::ones(array.dim().2);
        pattern_likelihoods(array, &ones, &self.rates.probabilities())
    }

    /// Fill the directional cache and the per-pattern likelihoods.
    #[instrument(skip_all)]
    pub fn compute_tree_likelihood(&mut self) -> Result<()> {
        let mut cache = DirectionalCache::new();
        let op = self.operator();
        traversal::compute_all(&op, &self.tree, &mut cache)?;
        let root = traversal::combine_at(&op, &self.tree, self.tree.root_id(), &cache)?;
        self.likelihoods = self.collapse(&root);
        self.cache = cache;
        Ok(())
    }

    pub fn log_likelihood(&self) -> f64 {
        log_likelihood(&self.likelihoods, self.data.weights())
    }

    /// Likelihood of each distinct pattern
    pub fn pattern_likelihoods(&self) -> &Array1<f64> {
        &self.likelihoods
    }

    /// Likelihood of each original alignment column
    pub fn site_likelihoods(&self) -> Result<Array1<f64>> {
        let patterns = self.data.patterns();
        (0..patterns.number_of_sites())
            .map(|site| Ok(self.likelihoods[patterns.pattern_of_site(site)?]))
            .collect::<Result<Vec<f64>>>()
            .map(Array1::from)
    }

    /// Log-likelihood computed by combining every direction at `node`.
    pub fn log_likelihood_at_node(&self, node: NodeId) -> Result<f64> {
        let array = traversal::combine_at(&self.operator(), &self.tree, node, &self.cache)?;
        Ok(log_likelihood(&self.collapse(&array), self.data.weights()))
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn model_set(&self) -> &MixedModelSet {
        &self.model_set
    }

    pub fn parameters(&self) -> &ParameterList {
        &self.parameters
    }

    /// Apply new parameter values, refreshing only the affected branches.
    pub fn set_parameters(&mut self, params: &ParameterList) -> Result<()> {
        let mut all = self.parameters.clone();
        let changed = all.match_values(params);
        if changed.is_empty() {
            return Ok(());
        }
        let changes = apply_parameter_changes(
            &mut self.tree,
            &mut self.model_set,
            &mut self.rates,
            &all,
            &changed,
            &self.config,
        )?;
        self.parameters = all;
        if changes.rates {
            self.compute_all_transitions()?;
        } else {
            for node in changes.nodes.iter().copied() {
                self.refresh_branch(node)?;
            }
        }
        if changes.models {
            self.root_frequencies = self.model_set.root_frequencies(&self.tree)?;
        }
        self.compute_tree_likelihood()
    }
}
