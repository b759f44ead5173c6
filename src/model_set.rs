//! Assignment of branch models to tree nodes, and the HyperNodes that select
//! which mixture components are active in a computation.

use ndarray::Array1;

use crate::error::{PhyloError, Result};
use crate::model::BranchModel;
use crate::parameter::{Parameter, ParameterList};
use crate::tree::{NodeId, Tree};

/// Active component subset for every model of a set, with its prior weight.
///
/// An empty subset on a mixed model stands for all its components.
#[derive(Debug, Clone, PartialEq)]
pub struct HyperNode {
    nodes: Vec<Vec<usize>>,
    probability: f64,
}

impl HyperNode {
    pub fn new(nodes: Vec<Vec<usize>>) -> Self {
        Self {
            nodes,
            probability: 1.0,
        }
    }

    /// Every component of every model.
    pub fn complete(set: &MixedModelSet) -> Self {
        let nodes = set
            .models
            .iter()
            .map(|m| (0..m.number_of_components()).collect())
            .collect();
        Self::new(nodes)
    }

    pub fn number_of_models(&self) -> usize {
        self.nodes.len()
    }

    /// Active components of `model` as stored (possibly empty).
    pub fn node(&self, model: usize) -> &[usize] {
        &self.nodes[model]
    }

    /// Active components of `model`, expanding an empty subset to all of them.
    pub fn active(&self, model: usize, n_components: usize) -> Vec<usize> {
        if self.nodes[model].is_empty() {
            (0..n_components).collect()
        } else {
            self.nodes[model].clone()
        }
    }

    pub fn set_node(&mut self, model: usize, components: Vec<usize>) {
        self.nodes[model] = components;
    }

    pub fn probability(&self) -> f64 {
        self.probability
    }

    pub fn set_probability(&mut self, probability: f64) {
        self.probability = probability;
    }
}

/// Models of a non-homogeneous process, each attached to a set of nodes.
#[derive(Debug, Clone, Default)]
pub struct MixedModelSet {
    models: Vec<BranchModel>,
    assignments: Vec<Vec<NodeId>>,
    root_frequencies: Option<Array1<f64>>,
    hyper_nodes: Vec<HyperNode>,
}

impl MixedModelSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `model` for the branches above `nodes`. Returns its index.
    pub fn add_model(&mut self, model: impl Into<BranchModel>, nodes: &[NodeId]) -> Result<usize> {
        let model = model.into();
        if let Some(first) = self.models.first() {
            if first.n_states() != model.n_states() {
                return Err(PhyloError::dimension(
                    format!("states of model '{}'", model.name()),
                    first.n_states(),
                    model.n_states(),
                ));
            }
        }
        if let Some(&id) = nodes.iter().find(|&&id| self.model_index_for_node(id).is_some()) {
            return Err(PhyloError::setup(format!(
                "node {id} is already assigned to a model"
            )));
        }
        if !self.hyper_nodes.is_empty() {
            return Err(PhyloError::setup("models must be added before hypernodes"));
        }
        self.models.push(model);
        self.assignments.push(nodes.to_vec());
        Ok(self.models.len() - 1)
    }

    pub fn number_of_models(&self) -> usize {
        self.models.len()
    }

    pub fn model(&self, index: usize) -> &BranchModel {
        &self.models[index]
    }

    pub fn n_states(&self) -> usize {
        self.models.first().map_or(0, BranchModel::n_states)
    }

    pub fn model_index_for_node(&self, node: NodeId) -> Option<usize> {
        self.assignments.iter().position(|nodes| nodes.contains(&node))
    }

    pub fn model_for_node(&self, node: NodeId) -> Option<&BranchModel> {
        self.model_index_for_node(node).map(|i| &self.models[i])
    }

    pub fn nodes_with_model(&self, index: usize) -> &[NodeId] {
        &self.assignments[index]
    }

    /// Indices of the mixture models.
    pub fn mixed_models(&self) -> Vec<usize> {
        (0..self.models.len())
            .filter(|&i| self.models[i].is_mixed())
            .collect()
    }

    pub fn set_root_frequencies(&mut self, frequencies: Array1<f64>) {
        self.root_frequencies = Some(frequencies);
    }

    /// Explicit root frequencies, or those of the model on the root's first son.
    pub fn root_frequencies(&self, tree: &Tree) -> Result<Array1<f64>> {
        if let Some(freqs) = &self.root_frequencies {
            return Ok(freqs.clone());
        }
        let first = tree.son_id(tree.root_id(), 0)?;
        self.model_for_node(first)
            .map(BranchModel::frequencies)
            .ok_or_else(|| PhyloError::setup(format!("no model for node {first}")))
    }

    /// Every non-root node carries exactly one model.
    pub fn check_fully_set_up_for(&self, tree: &Tree) -> Result<()> {
        if self.models.is_empty() {
            return Err(PhyloError::setup("no model in the set"));
        }
        for id in tree.branches_id() {
            let count = self.assignments.iter().filter(|n| n.contains(&id)).count();
            if count != 1 {
                return Err(PhyloError::setup(format!(
                    "node {id} is assigned to {count} models"
                )));
            }
        }
        if let Some(freqs) = &self.root_frequencies {
            if freqs.len() != self.n_states() {
                return Err(PhyloError::dimension("root frequencies", self.n_states(), freqs.len()));
            }
        }
        Ok(())
    }

    pub fn is_fully_set_up_for(&self, tree: &Tree) -> bool {
        self.check_fully_set_up_for(tree).is_ok()
    }

    // ---------------------------------------------------------------------
    // Parameters
    // ---------------------------------------------------------------------

    /// All model parameters, namespaced `<name>_<model index + 1>`.
    pub fn parameters(&self) -> ParameterList {
        let mut list = ParameterList::new();
        for (i, model) in self.models.iter().enumerate() {
            for p in model.parameters().iter() {
                list.add(Parameter::new(format!("{}_{}", p.name, i + 1), p.value));
            }
        }
        list
    }

    /// Model index and local name of a namespaced parameter.
    pub fn parameter_model(&self, name: &str) -> Option<(usize, String)> {
        let (local, index) = name.rsplit_once('_')?;
        let index: usize = index.parse().ok()?;
        (index >= 1 && index <= self.models.len()).then(|| (index - 1, local.to_string()))
    }

    pub fn has_parameter(&self, name: &str) -> bool {
        self.parameter_model(name)
            .is_some_and(|(i, local)| self.models[i].parameters().has(&local))
    }

    /// Set a namespaced parameter and return the index of the model it belongs to.
    pub fn set_parameter_value(&mut self, name: &str, value: f64) -> Result<usize> {
        let (index, local) = self
            .parameter_model(name)
            .ok_or_else(|| PhyloError::UnknownParameter(name.to_string()))?;
        self.models[index].set_parameter_value(&local, value)?;
        Ok(index)
    }

    /// Nodes whose model carries the namespaced parameter.
    pub fn nodes_with_parameter(&self, name: &str) -> Vec<NodeId> {
        match self.parameter_model(name) {
            Some((index, _)) if self.has_parameter(name) => self.assignments[index].clone(),
            _ => Vec::new(),
        }
    }

    // ---------------------------------------------------------------------
    // HyperNodes
    // ---------------------------------------------------------------------

    /// Product over mixed models of the summed weights of the active components.
    pub fn hyper_node_probability(&self, hn: &HyperNode) -> f64 {
        self.models
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_mixed())
            .map(|(i, m)| {
                let weights = m.component_weights();
                hn.active(i, weights.len()).iter().map(|&c| weights[c]).sum::<f64>()
            })
            .product()
    }

    /// Register a hypernode after checking it against the models.
    pub fn add_hyper_node(&mut self, mut hn: HyperNode) -> Result<()> {
        if hn.number_of_models() != self.models.len() {
            return Err(PhyloError::dimension(
                "hypernode models",
                self.models.len(),
                hn.number_of_models(),
            ));
        }
        for (i, model) in self.models.iter().enumerate() {
            let n = model.number_of_components();
            if let Some(&bad) = hn.node(i).iter().find(|&&c| c >= n) {
                return Err(PhyloError::invalid_input(format!(
                    "component {bad} does not exist in model {} ({n} components)",
                    i + 1
                )));
            }
        }
        hn.set_probability(self.hyper_node_probability(&hn));
        self.hyper_nodes.push(hn);
        Ok(())
    }

    /// Register the hypernode made of every component of every model.
    pub fn add_complete_hyper_node(&mut self) {
        let mut hn = HyperNode::complete(self);
        hn.set_probability(self.hyper_node_probability(&hn));
        self.hyper_nodes.push(hn);
    }

    pub fn hyper_nodes(&self) -> &[HyperNode] {
        &self.hyper_nodes
    }

    /// Refresh the stored probabilities after a parameter change.
    pub fn compute_hyper_nodes_probabilities(&mut self) {
        let probs: Vec<f64> = self
            .hyper_nodes
            .iter()
            .map(|hn| self.hyper_node_probability(hn))
            .collect();
        for (hn, p) in self.hyper_nodes.iter_mut().zip(probs) {
            hn.set_probability(p);
        }
    }
}
