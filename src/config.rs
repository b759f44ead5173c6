//! Configuration values passed to the parsimony and likelihood constructors.

use serde::{Deserialize, Serialize};

/// Options for [`crate::parsimony::ParsimonyScore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParsimonyConfig {
    /// Compress identical alignment columns into weighted patterns
    pub use_patterns: bool,
    /// Treat the gap symbol as an extra state instead of "any state"
    pub include_gaps: bool,
}

impl Default for ParsimonyConfig {
    fn default() -> Self {
        Self {
            use_patterns: true,
            include_gaps: false,
        }
    }
}

/// Options for the likelihood computations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LikelihoodConfig {
    /// Compress identical alignment columns into weighted patterns
    pub use_patterns: bool,
    /// Replace the two root branch lengths by `BrLenRoot` and `RootPosition`
    pub reparametrize_root: bool,
    pub compute_first_order_derivatives: bool,
    pub compute_second_order_derivatives: bool,
    /// Branch lengths below this value are clamped
    pub min_branch_length: f64,
}

impl Default for LikelihoodConfig {
    fn default() -> Self {
        Self {
            use_patterns: true,
            reparametrize_root: false,
            compute_first_order_derivatives: true,
            compute_second_order_derivatives: true,
            min_branch_length: 1e-6,
        }
    }
}

impl LikelihoodConfig {
    /// Derivative arrays are only allocated when some derivative is wanted.
    pub fn needs_derivatives(&self) -> bool {
        self.compute_first_order_derivatives || self.compute_second_order_derivatives
    }
}
