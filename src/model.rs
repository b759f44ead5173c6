/// Substitution models supplying per-branch transition probabilities
///
/// Models expose P(t) and its first two time derivatives. Mixture-capable
/// models are a list of component models with prior weights.

use ndarray::prelude::*;

use crate::error::{PhyloError, Result};
use crate::parameter::{Parameter, ParameterList};

/// Capability of producing transition probabilities along a branch.
pub trait TransitionModel: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// Number of model states
    fn n_states(&self) -> usize;

    /// Equilibrium frequencies
    fn frequencies(&self) -> Array1<f64>;

    /// Transition probabilities P(t), row = start state
    fn pij_t(&self, t: f64) -> Array2<f64>;

    /// dP(t)/dt
    fn dpij_dt(&self, t: f64) -> Array2<f64>;

    /// d2P(t)/dt2
    fn d2pij_dt2(&self, t: f64) -> Array2<f64>;

    /// Independent parameters, with local names
    fn parameters(&self) -> ParameterList;

    fn set_parameter_value(&mut self, name: &str, value: f64) -> Result<()>;

    fn clone_box(&self) -> Box<dyn TransitionModel>;
}

impl Clone for Box<dyn TransitionModel> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

fn positive(name: &str, value: f64) -> Result<f64> {
    if value > 0.0 && value.is_finite() {
        Ok(value)
    } else {
        Err(PhyloError::ParameterOutOfBounds {
            name: name.to_string(),
            value,
        })
    }
}

/// Kimura 2-parameter nucleotide model (A=0, C=1, G=2, T=3).
///
/// Transitions (A<->G, C<->T) occur `kappa` times faster than transversions;
/// rates are normalised so that branch lengths count expected substitutions.
#[derive(Debug, Clone)]
pub struct K80 {
    kappa: f64,
}

impl K80 {
    pub fn new(kappa: f64) -> Result<Self> {
        Ok(Self {
            kappa: positive("kappa", kappa)?,
        })
    }

    pub fn kappa(&self) -> f64 {
        self.kappa
    }

    /// (k, r) where k = (kappa+1)/2 and r = 4/(kappa+2)
    fn constants(&self) -> (f64, f64) {
        ((self.kappa + 1.0) / 2.0, 4.0 / (self.kappa + 2.0))
    }

    fn is_transition(i: usize, j: usize) -> bool {
        // A<->G and C<->T differ by 2 in the encoding
        i.abs_diff(j) == 2
    }

    /// Fill a 4x4 matrix from the (same, transition, transversion) entries
    fn fill(same: f64, transition: f64, transversion: f64) -> Array2<f64> {
        Array2::from_shape_fn((4, 4), |(i, j)| {
            if i == j {
                same
            } else if Self::is_transition(i, j) {
                transition
            } else {
                transversion
            }
        })
    }
}

impl TransitionModel for K80 {
    fn name(&self) -> &str {
        "K80"
    }

    fn n_states(&self) -> usize {
        4
    }

    fn frequencies(&self) -> Array1<f64> {
        Array1::from_elem(4, 0.25)
    }

    fn pij_t(&self, d: f64) -> Array2<f64> {
        let (k, r) = self.constants();
        let l = r * d;
        let exp1 = (-l).exp();
        let exp2 = (-k * l).exp();
        Self::fill(
            0.25 * (1.0 + exp1) + 0.5 * exp2,
            0.25 * (1.0 + exp1) - 0.5 * exp2,
            0.25 * (1.0 - exp1),
        )
    }

    fn dpij_dt(&self, d: f64) -> Array2<f64> {
        let (k, r) = self.constants();
        let l = r * d;
        let exp1 = (-l).exp();
        let exp2 = (-k * l).exp();
        Self::fill(
            r / 4.0 * (-exp1 - 2.0 * k * exp2),
            r / 4.0 * (-exp1 + 2.0 * k * exp2),
            r / 4.0 * exp1,
        )
    }

    fn d2pij_dt2(&self, d: f64) -> Array2<f64> {
        let (k, r) = self.constants();
        let l = r * d;
        let exp1 = (-l).exp();
        let exp2 = (-k * l).exp();
        let r2 = r * r;
        Self::fill(
            r2 / 4.0 * (exp1 + 2.0 * k * k * exp2),
            r2 / 4.0 * (exp1 - 2.0 * k * k * exp2),
            -r2 / 4.0 * exp1,
        )
    }

    fn parameters(&self) -> ParameterList {
        std::iter::once(Parameter::new("kappa", self.kappa)).collect()
    }

    fn set_parameter_value(&mut self, name: &str, value: f64) -> Result<()> {
        match name {
            "kappa" => {
                self.kappa = positive(name, value)?;
                Ok(())
            }
            _ => Err(PhyloError::UnknownParameter(name.to_string())),
        }
    }

    fn clone_box(&self) -> Box<dyn TransitionModel> {
        Box::new(self.clone())
    }
}

/// Two-state gain/loss model: 0 -> 1 at rate `gain`, 1 -> 0 at rate `loss`.
#[derive(Debug, Clone)]
pub struct BinaryModel {
    gain: f64,
    loss: f64,
}

impl BinaryModel {
    pub fn new(gain: f64, loss: f64) -> Result<Self> {
        Ok(Self {
            gain: positive("gain", gain)?,
            loss: positive("loss", loss)?,
        })
    }
}

impl TransitionModel for BinaryModel {
    fn name(&self) -> &str {
        "Binary"
    }

    fn n_states(&self) -> usize {
        2
    }

    fn frequencies(&self) -> Array1<f64> {
        let total = self.gain + self.loss;
        array![self.loss / total, self.gain / total]
    }

    fn pij_t(&self, t: f64) -> Array2<f64> {
        let (g, l) = (self.gain, self.loss);
        let total = g + l;
        let e = (-total * t).exp();
        array![
            [(l + g * e) / total, (g - g * e) / total],
            [(l - l * e) / total, (g + l * e) / total]
        ]
    }

    fn dpij_dt(&self, t: f64) -> Array2<f64> {
        let (g, l) = (self.gain, self.loss);
        let e = (-(g + l) * t).exp();
        array![[-g * e, g * e], [l * e, -l * e]]
    }

    fn d2pij_dt2(&self, t: f64) -> Array2<f64> {
        let (g, l) = (self.gain, self.loss);
        let total = g + l;
        let e = (-total * t).exp();
        array![
            [g * total * e, -g * total * e],
            [-l * total * e, l * total * e]
        ]
    }

    fn parameters(&self) -> ParameterList {
        vec![
            Parameter::new("gain", self.gain),
            Parameter::new("loss", self.loss),
        ]
        .into_iter()
        .collect()
    }

    fn set_parameter_value(&mut self, name: &str, value: f64) -> Result<()> {
        match name {
            "gain" => self.gain = positive(name, value)?,
            "loss" => self.loss = positive(name, value)?,
            _ => return Err(PhyloError::UnknownParameter(name.to_string())),
        }
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn TransitionModel> {
        Box::new(self.clone())
    }
}

/// Mixture of component models with prior weights.
///
/// Weights are parameterised by relative probabilities `relproba1..n-1`:
/// `w_i = r_i * prod_{j<i}(1 - r_j)`, the last component taking the remainder.
#[derive(Debug, Clone)]
pub struct MixtureModel {
    name: String,
    components: Vec<Box<dyn TransitionModel>>,
    relproba: Vec<f64>,
}

impl MixtureModel {
    pub fn new(
        name: &str,
        components: Vec<Box<dyn TransitionModel>>,
        weights: &[f64],
    ) -> Result<Self> {
        if components.is_empty() {
            return Err(PhyloError::invalid_input("mixture needs at least one component"));
        }
        if weights.len() != components.len() {
            return Err(PhyloError::dimension(
                "mixture weights",
                components.len(),
                weights.len(),
            ));
        }
        let n_states = components[0].n_states();
        if components.iter().any(|c| c.n_states() != n_states) {
            return Err(PhyloError::invalid_input(
                "mixture components must share the same number of states",
            ));
        }
        let total: f64 = weights.iter().sum();
        if weights.iter().any(|&w| w < 0.0) || (total - 1.0).abs() > 1e-9 {
            return Err(PhyloError::invalid_input(format!(
                "mixture weights must be non-negative and sum to 1 (sum = {total})"
            )));
        }

        let mut relproba = Vec::with_capacity(weights.len() - 1);
        let mut remaining = 1.0;
        for &w in &weights[..weights.len() - 1] {
            relproba.push(if remaining > 0.0 { (w / remaining).min(1.0) } else { 0.0 });
            remaining -= w;
        }

        Ok(Self {
            name: name.to_string(),
            components,
            relproba,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn number_of_models(&self) -> usize {
        self.components.len()
    }

    pub fn component(&self, i: usize) -> &dyn TransitionModel {
        self.components[i].as_ref()
    }

    pub fn n_states(&self) -> usize {
        self.components[0].n_states()
    }

    /// Prior weight of every component
    pub fn weights(&self) -> Vec<f64> {
        let mut weights = Vec::with_capacity(self.components.len());
        let mut remaining = 1.0;
        for &r in &self.relproba {
            weights.push(r * remaining);
            remaining *= 1.0 - r;
        }
        weights.push(remaining);
        weights
    }

    /// `relproba*` and the component parameters as `c<k>.<name>`.
    pub fn parameters(&self) -> ParameterList {
        let mut list: ParameterList = self
            .relproba
            .iter()
            .enumerate()
            .map(|(i, &r)| Parameter::new(format!("relproba{}", i + 1), r))
            .collect();
        for (k, component) in self.components.iter().enumerate() {
            for p in component.parameters().iter() {
                list.add(Parameter::new(format!("c{}.{}", k + 1, p.name), p.value));
            }
        }
        list
    }

    pub fn set_parameter_value(&mut self, name: &str, value: f64) -> Result<()> {
        if let Some(index) = name.strip_prefix("relproba").and_then(|i| i.parse::<usize>().ok()) {
            if index == 0 || index > self.relproba.len() {
                return Err(PhyloError::UnknownParameter(name.to_string()));
            }
            if !(0.0..=1.0).contains(&value) {
                return Err(PhyloError::ParameterOutOfBounds {
                    name: name.to_string(),
                    value,
                });
            }
            self.relproba[index - 1] = value;
            return Ok(());
        }
        let (component, local) = name
            .strip_prefix('c')
            .and_then(|rest| rest.split_once('.'))
            .and_then(|(k, local)| Some((k.parse::<usize>().ok()?, local)))
            .ok_or_else(|| PhyloError::UnknownParameter(name.to_string()))?;
        if component == 0 || component > self.components.len() {
            return Err(PhyloError::UnknownParameter(name.to_string()));
        }
        self.components[component - 1].set_parameter_value(local, value)
    }
}

/// Model governing a branch: a single model or a mixture.
#[derive(Debug, Clone)]
pub enum BranchModel {
    Simple(Box<dyn TransitionModel>),
    Mixed(MixtureModel),
}

impl BranchModel {
    pub fn name(&self) -> &str {
        match self {
            Self::Simple(m) => m.name(),
            Self::Mixed(m) => m.name(),
        }
    }

    pub fn is_mixed(&self) -> bool {
        matches!(self, Self::Mixed(_))
    }

    pub fn n_states(&self) -> usize {
        match self {
            Self::Simple(m) => m.n_states(),
            Self::Mixed(m) => m.n_states(),
        }
    }

    /// 1 for a simple model
    pub fn number_of_components(&self) -> usize {
        match self {
            Self::Simple(_) => 1,
            Self::Mixed(m) => m.number_of_models(),
        }
    }

    pub fn component_weights(&self) -> Vec<f64> {
        match self {
            Self::Simple(_) => vec![1.0],
            Self::Mixed(m) => m.weights(),
        }
    }

    /// Component `i`; a simple model is its own single component
    pub fn component(&self, i: usize) -> &dyn TransitionModel {
        match self {
            Self::Simple(m) => m.as_ref(),
            Self::Mixed(m) => m.component(i),
        }
    }

    /// Equilibrium frequencies of the full model (weighted for a mixture)
    pub fn frequencies(&self) -> Array1<f64> {
        let weights = self.component_weights();
        let mut freqs = Array1::zeros(self.n_states());
        for (i, w) in weights.iter().enumerate() {
            freqs.scaled_add(*w, &self.component(i).frequencies());
        }
        freqs
    }

    pub fn parameters(&self) -> ParameterList {
        match self {
            Self::Simple(m) => m.parameters(),
            Self::Mixed(m) => m.parameters(),
        }
    }

    pub fn set_parameter_value(&mut self, name: &str, value: f64) -> Result<()> {
        match self {
            Self::Simple(m) => m.set_parameter_value(name, value),
            Self::Mixed(m) => m.set_parameter_value(name, value),
        }
    }
}

impl From<K80> for BranchModel {
    fn from(model: K80) -> Self {
        Self::Simple(Box::new(model))
    }
}

impl From<BinaryModel> for BranchModel {
    fn from(model: BinaryModel) -> Self {
        Self::Simple(Box::new(model))
    }
}

impl From<MixtureModel> for BranchModel {
    fn from(model: MixtureModel) -> Self {
        Self::Mixed(model)
    }
}
