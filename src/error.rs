//! Error types shared by the tree, parsimony and likelihood engines.

use thiserror::Error;

use crate::tree::NodeId;

/// Errors raised by tree manipulation and score/likelihood computations.
///
/// Structural and setup errors abort the operation before anything is
/// mutated. Numerical degeneracies (a zero-probability mixture branch) are
/// not errors: they contribute zero.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PhyloError {
    /// No node carries this id
    #[error("no node with id {0}")]
    NodeNotFound(NodeId),

    /// Several nodes carry this id and a unique match was requested
    #[error("non-unique node id {0}")]
    NonUniqueId(NodeId),

    /// The operation needs a node with a father
    #[error("node {0} must not be the root")]
    NodeIsRoot(NodeId),

    /// The operation needs a rooted tree (root with exactly two sons)
    #[error("tree is not rooted")]
    UnrootedTree,

    /// An edit would break the tree structure
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// No leaf with this name
    #[error("no leaf named '{0}'")]
    LeafNotFound(String),

    /// No sequence for a leaf of the tree
    #[error("no sequence named '{0}'")]
    SequenceNotFound(String),

    /// A symbol is not part of the alphabet
    #[error("unknown symbol '{symbol}' in sequence '{sequence}' at site {site}")]
    UnknownState {
        sequence: String,
        site: usize,
        symbol: char,
    },

    /// Model set does not cover the tree
    #[error("model set is not fully specified: {0}")]
    ModelSetNotFullySetUp(String),

    /// Mismatched sizes between collaborators
    #[error("dimension mismatch for {what}: expected {expected}, found {found}")]
    DimensionMismatch {
        what: String,
        expected: usize,
        found: usize,
    },

    /// Parameter name not known to the computation
    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),

    /// Parameter value outside its domain
    #[error("value {value} out of bounds for parameter '{name}'")]
    ParameterOutOfBounds { name: String, value: f64 },

    /// Any other invalid argument
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PhyloError>;

impl PhyloError {
    /// Create an invalid input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create a dimension mismatch error
    pub fn dimension(what: impl Into<String>, expected: usize, found: usize) -> Self {
        Self::DimensionMismatch {
            what: what.into(),
            expected,
            found,
        }
    }

    /// Create a model set setup error
    pub fn setup(message: impl Into<String>) -> Self {
        Self::ModelSetNotFullySetUp(message.into())
    }

    /// True for errors caused by the tree topology or node addressing.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::NodeNotFound(_)
                | Self::NonUniqueId(_)
                | Self::NodeIsRoot(_)
                | Self::UnrootedTree
                | Self::InvalidTopology(_)
                | Self::LeafNotFound(_)
        )
    }
}
