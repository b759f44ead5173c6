//! Named real-valued parameters exchanged with optimizers.

use serde::{Deserialize, Serialize};

use crate::error::{PhyloError, Result};
use crate::tree::NodeId;

/// Name of the length parameter of the branch above `node`.
pub fn branch_length_name(node: NodeId) -> String {
    format!("BrLen{node}")
}

/// Node id encoded in a `BrLen<id>` name.
pub fn parse_branch_length_name(name: &str) -> Option<NodeId> {
    name.strip_prefix("BrLen")?.parse().ok()
}

pub const BRLEN_ROOT: &str = "BrLenRoot";
pub const ROOT_POSITION: &str = "RootPosition";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: f64,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Ordered list of parameters, looked up by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterList {
    parameters: Vec<Parameter>,
}

impl ParameterList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.parameters.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.parameters.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn has(&self, name: &str) -> bool {
        self.parameters.iter().any(|p| p.name == name)
    }

    /// Add a parameter, replacing the value of an existing one with the same name.
    pub fn add(&mut self, parameter: Parameter) {
        match self.parameters.iter_mut().find(|p| p.name == parameter.name) {
            Some(existing) => existing.value = parameter.value,
            None => self.parameters.push(parameter),
        }
    }

    pub fn extend(&mut self, other: ParameterList) {
        for p in other.parameters {
            self.add(p);
        }
    }

    pub fn value(&self, name: &str) -> Result<f64> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value)
            .ok_or_else(|| PhyloError::UnknownParameter(name.to_string()))
    }

    pub fn set_value(&mut self, name: &str, value: f64) -> Result<()> {
        let p = self
            .parameters
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| PhyloError::UnknownParameter(name.to_string()))?;
        p.value = value;
        Ok(())
    }

    /// Parameters of `self` whose name also appears in `other`.
    pub fn common_parameters_with(&self, other: &ParameterList) -> ParameterList {
        ParameterList {
            parameters: self
                .parameters
                .iter()
                .filter(|p| other.has(&p.name))
                .cloned()
                .collect(),
        }
    }

    /// Copy the values of `other` into the matching parameters of `self` and
    /// return the subset whose value actually changed.
    pub fn match_values(&mut self, other: &ParameterList) -> ParameterList {
        let mut changed = ParameterList::new();
        for p in self.parameters.iter_mut() {
            if let Some(o) = other.parameters.iter().find(|o| o.name == p.name) {
                if o.value != p.value {
                    p.value = o.value;
                    changed.parameters.push(p.clone());
                }
            }
        }
        changed
    }
}

impl FromIterator<Parameter> for ParameterList {
    fn from_iter<I: IntoIterator<Item = Parameter>>(iter: I) -> Self {
        let mut list = ParameterList::new();
        for p in iter {
            list.add(p);
        }
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_length_names() {
        assert_eq!(branch_length_name(12), "BrLen12");
        assert_eq!(parse_branch_length_name("BrLen12"), Some(12));
        assert_eq!(parse_branch_length_name(BRLEN_ROOT), None);
        assert_eq!(parse_branch_length_name("kappa_1"), None);
    }

    #[test]
    fn test_match_values_returns_changed_subset() {
        let mut list: ParameterList = vec![
            Parameter::new("BrLen0", 0.1),
            Parameter::new("BrLen1", 0.2),
            Parameter::new("kappa_1", 2.0),
        ]
        .into_iter()
        .collect();
        let update: ParameterList = vec![
            Parameter::new("BrLen1", 0.2),
            Parameter::new("kappa_1", 3.0),
            Parameter::new("other", 1.0),
        ]
        .into_iter()
        .collect();
        let changed = list.match_values(&update);
        assert_eq!(changed.names(), vec!["kappa_1"]);
        assert_eq!(list.value("kappa_1").unwrap(), 3.0);
        assert!(!list.has("other"));
        assert_eq!(list.common_parameters_with(&update).len(), 2);
        assert_eq!(
            list.value("missing").unwrap_err(),
            PhyloError::UnknownParameter("missing".into())
        );
    }
}
