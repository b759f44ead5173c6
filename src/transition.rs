//! Per-branch transition matrices for every rate class
//!
//! A branch carrying a mixture uses the probability-weighted average of the
//! active components' matrices. Derivatives are taken with respect to the
//! branch length, so each rate class contributes its rate factor.

use std::collections::HashMap;

use ndarray::prelude::*;

use crate::error::{PhyloError, Result};
use crate::model::BranchModel;
use crate::model_set::{HyperNode, MixedModelSet};
use crate::rate::RateDistribution;
use crate::tree::{NodeId, Tree};

/// Transition matrices of one branch, one entry per rate class
#[derive(Debug, Clone)]
pub struct BranchTransitions {
    pub pxy: Vec<Array2<f64>>,
    pub dpxy: Vec<Array2<f64>>,
    pub d2pxy: Vec<Array2<f64>>,
}

/// Transition matrices of every branch, keyed by the node below the branch
pub type Transitions = HashMap<NodeId, BranchTransitions>;

impl BranchTransitions {
    /// Compute the matrices of a branch of length `length`
    ///
    /// # Arguments
    /// * `model` - Model attached to the branch
    /// * `active` - Active components of the model (all of them when empty)
    /// * `length` - Branch length
    /// * `rates` - Rate classes
    /// * `with_derivatives` - Also compute dP/dt and d2P/dt2
    pub fn compute(
        model: &BranchModel,
        active: &[usize],
        length: f64,
        rates: &RateDistribution,
        with_derivatives: bool,
    ) -> Self {
        let n = model.n_states();
        let all: Vec<usize>;
        let active = if active.is_empty() {
            all = (0..model.number_of_components()).collect();
            all.as_slice()
        } else {
            active
        };

        // Normalised prior weights of the active components
        let weights = model.component_weights();
        let total: f64 = active.iter().map(|&c| weights[c]).sum();
        let mix: Vec<(usize, f64)> = if total > 0.0 {
            active.iter().map(|&c| (c, weights[c] / total)).collect()
        } else {
            active.iter().map(|&c| (c, 1.0 / active.len() as f64)).collect()
        };

        let categories = rates.categories();
        let mut pxy = Vec::with_capacity(categories.len());
        let mut dpxy = Vec::with_capacity(categories.len());
        let mut d2pxy = Vec::with_capacity(categories.len());

        for &rc in &categories {
            let t = length * rc;
            let mut p = Array2::zeros((n, n));
            let mut dp = Array2::zeros((n, n));
            let mut d2p = Array2::zeros((n, n));
            for &(c, w) in &mix {
                let component = model.component(c);
                p.scaled_add(w, &component.pij_t(t));
                if with_derivatives {
                    dp.scaled_add(w * rc, &component.dpij_dt(t));
                    d2p.scaled_add(w * rc * rc, &component.d2pij_dt2(t));
                }
            }
            pxy.push(p);
            dpxy.push(dp);
            d2pxy.push(d2p);
        }

        Self { pxy, dpxy, d2pxy }
    }

    /// Matrices of the branch above `node`, restricted to the components
    /// `hyper_node` keeps active for the node's model
    pub fn for_node(
        tree: &Tree,
        model_set: &MixedModelSet,
        hyper_node: &HyperNode,
        rates: &RateDistribution,
        node: NodeId,
        with_derivatives: bool,
    ) -> Result<Self> {
        let index = model_set
            .model_index_for_node(node)
            .ok_or_else(|| PhyloError::setup(format!("no model for node {node}")))?;
        let model = model_set.model(index);
        let active = hyper_node.active(index, model.number_of_components());
        let length = tree.distance_to_father(node)?.unwrap_or(0.0);
        Ok(Self::compute(model, &active, length, rates, with_derivatives))
    }

    pub fn n_classes(&self) -> usize {
        self.pxy.len()
    }
}
