//! Among-site rate heterogeneity as a small set of discrete rate classes.

use serde::{Deserialize, Serialize};

use crate::error::{PhyloError, Result};
use crate::parameter::{Parameter, ParameterList};

pub const INVARIANT_P: &str = "Invariant.p";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RateDistribution {
    /// Single class of rate 1
    Constant,
    /// Invariant sites with probability `p`, the rest at rate 1/(1-p)
    Invariant { p: f64 },
}

impl RateDistribution {
    /// Invariant-sites distribution, with `p` checked like a parameter update.
    pub fn invariant(p: f64) -> Result<Self> {
        let mut dist = Self::Invariant { p: 0.0 };
        dist.set_parameter_value(INVARIANT_P, p)?;
        Ok(dist)
    }

    pub fn number_of_categories(&self) -> usize {
        match self {
            Self::Constant => 1,
            Self::Invariant { .. } => 2,
        }
    }

    pub fn categories(&self) -> Vec<f64> {
        match self {
            Self::Constant => vec![1.0],
            Self::Invariant { p } => vec![0.0, 1.0 / (1.0 - p)],
        }
    }

    pub fn probabilities(&self) -> Vec<f64> {
        match self {
            Self::Constant => vec![1.0],
            Self::Invariant { p } => vec![*p, 1.0 - p],
        }
    }

    pub fn parameters(&self) -> ParameterList {
        match self {
            Self::Constant => ParameterList::new(),
            Self::Invariant { p } => std::iter::once(Parameter::new(INVARIANT_P, *p)).collect(),
        }
    }

    pub fn set_parameter_value(&mut self, name: &str, value: f64) -> Result<()> {
        match self {
            Self::Invariant { p } if name == INVARIANT_P => {
                if !(0.0..1.0).contains(&value) {
                    return Err(PhyloError::ParameterOutOfBounds {
                        name: name.to_string(),
                        value,
                    });
                }
                *p = value;
                Ok(())
            }
            _ => Err(PhyloError::UnknownParameter(name.to_string())),
        }
    }
}
