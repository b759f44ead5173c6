/// drphylo
///
/// Double-recursive phylogenetic computations over a rooted, possibly
/// multifurcating tree:
/// - Fitch parsimony with cached directional arrays, so that nearest-neighbor
///   interchanges are scored without traversing the tree again.
/// - Likelihood of non-homogeneous models, including mixtures shared by
///   several branches, decomposed into independent weighted sub-likelihoods
///   computed in parallel with Rayon.
///
/// Python bindings are available behind the `python` feature.

pub mod alignment;
pub mod config;
pub mod dr_likelihood;
pub mod error;
pub mod likelihood;
pub mod mixed_likelihood;
pub mod model;
pub mod model_set;
pub mod parameter;
pub mod parsimony;
pub mod rate;
pub mod transition;
pub mod traversal;
pub mod tree;

#[cfg(feature = "python")]
mod python;

pub use alignment::{Alphabet, SiteContainer, SitePatterns};
pub use config::{LikelihoodConfig, ParsimonyConfig};
pub use dr_likelihood::DrTreeLikelihood;
pub use error::{PhyloError, Result};
pub use mixed_likelihood::{ExpansionPoint, MixedTreeLikelihood};
pub use model::{BinaryModel, BranchModel, MixtureModel, TransitionModel, K80};
pub use model_set::{HyperNode, MixedModelSet};
pub use parameter::{Parameter, ParameterList};
pub use parsimony::ParsimonyScore;
pub use rate::RateDistribution;
pub use tree::{Node, NodeId, Property, Tree};
