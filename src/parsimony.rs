//! Double-recursive Fitch/Sankoff parsimony with nearest-neighbor interchanges.
//!
//! Every directed edge caches, per pattern, the set of states compatible with
//! the far side and the number of changes already forced there. Testing an
//! NNI only recombines the arrays around the edge, so its cost does not depend
//! on the size of the tree.

use std::collections::HashMap;

use fixedbitset::FixedBitSet;
use rayon::prelude::*;
use tracing::{debug, info, instrument};

use crate::alignment::{SiteContainer, SitePatterns};
use crate::config::ParsimonyConfig;
use crate::error::{PhyloError, Result};
use crate::traversal::{self, CombineOperator, DirectionalCache};
use crate::tree::{NodeId, Property, Tree};

/// Name of the node property holding the reconstructed states.
pub const STATE_PROPERTY: &str = "state";

/// Per-pattern state sets and scores for one edge direction.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsimonyArray {
    pub bitsets: Vec<FixedBitSet>,
    pub scores: Vec<u32>,
}

impl ParsimonyArray {
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Fold the inputs pairwise: each new input is intersected with the
    /// running set, or united with it at the cost of one change when the
    /// intersection is empty.
    pub fn combine(arrays: &[&ParsimonyArray]) -> Result<ParsimonyArray> {
        let (first, rest) = arrays
            .split_first()
            .ok_or_else(|| PhyloError::invalid_input("nothing to combine"))?;
        let n = first.len();
        if let Some(bad) = rest.iter().find(|a| a.len() != n) {
            return Err(PhyloError::dimension("parsimony patterns", n, bad.len()));
        }

        let mut bitsets = first.bitsets.clone();
        let mut scores = first.scores.clone();
        for a in rest {
            for i in 0..n {
                scores[i] += a.scores[i];
                if bitsets[i].is_disjoint(&a.bitsets[i]) {
                    bitsets[i].union_with(&a.bitsets[i]);
                    scores[i] += 1;
                } else {
                    bitsets[i].intersect_with(&a.bitsets[i]);
                }
            }
        }
        Ok(ParsimonyArray { bitsets, scores })
    }
}

/// Fitch combine over the neighbor arrays; edges carry no cost.
struct FitchOperator<'a> {
    leaves: &'a HashMap<NodeId, ParsimonyArray>,
}

impl CombineOperator for FitchOperator<'_> {
    type Array = ParsimonyArray;

    fn leaf_array(&self, _tree: &Tree, leaf: NodeId) -> Result<ParsimonyArray> {
        self.leaves
            .get(&leaf)
            .cloned()
            .ok_or(PhyloError::NodeNotFound(leaf))
    }

    fn combine(
        &self,
        _tree: &Tree,
        _center: NodeId,
        inputs: &[(NodeId, &ParsimonyArray)],
    ) -> Result<ParsimonyArray> {
        let arrays: Vec<&ParsimonyArray> = inputs.iter().map(|(_, a)| *a).collect();
        ParsimonyArray::combine(&arrays)
    }
}

/// Parsimony score of a tree, with NNI evaluation.
#[derive(Debug, Clone)]
pub struct ParsimonyScore {
    tree: Tree,
    patterns: SitePatterns,
    config: ParsimonyConfig,
    n_states: usize,
    leaves: HashMap<NodeId, ParsimonyArray>,
    cache: DirectionalCache<ParsimonyArray>,
    root_array: ParsimonyArray,
}

impl ParsimonyScore {
    /// Build the leaf arrays and run both traversals.
    pub fn new(tree: Tree, sites: &SiteContainer, config: ParsimonyConfig) -> Result<Self> {
        let patterns = SitePatterns::new(sites, config.use_patterns);
        let alphabet = patterns.alphabet();
        let n_states = alphabet.size() + usize::from(config.include_gaps);

        // A root with a single son is a sequence like any other leaf
        let mut leaves = HashMap::new();
        for leaf in traversal::terminal_nodes_id(&tree)? {
            let name = tree
                .node_name(leaf)?
                .ok_or_else(|| PhyloError::invalid_input(format!("leaf {leaf} has no name")))?;
            let seq = patterns.sequence_index(name)?;
            let mut bitsets = Vec::with_capacity(patterns.number_of_patterns());
            for p in 0..patterns.number_of_patterns() {
                let symbol = patterns.symbol(seq, p);
                let mut set = FixedBitSet::with_capacity(n_states);
                if config.include_gaps && alphabet.is_gap(symbol) {
                    set.insert(alphabet.size());
                } else {
                    let states = alphabet.states_for(symbol).ok_or_else(|| {
                        PhyloError::UnknownState {
                            sequence: name.to_string(),
                            site: p,
                            symbol,
                        }
                    })?;
                    for &s in states {
                        set.insert(s);
                    }
                }
                bitsets.push(set);
            }
            let scores = vec![0; bitsets.len()];
            leaves.insert(leaf, ParsimonyArray { bitsets, scores });
        }

        info!(
            leaves = leaves.len(),
            patterns = patterns.number_of_patterns(),
            states = n_states,
            "parsimony data initialised"
        );

        let mut score = Self {
            tree,
            patterns,
            config,
            n_states,
            leaves,
            cache: DirectionalCache::new(),
            root_array: ParsimonyArray {
                bitsets: Vec::new(),
                scores: Vec::new(),
            },
        };
        score.compute_scores()?;
        Ok(score)
    }

    fn operator(&self) -> FitchOperator<'_> {
        FitchOperator {
            leaves: &self.leaves,
        }
    }

    /// Run the post-order and pre-order passes and the root combine.
    #[instrument(skip_all)]
    pub fn compute_scores(&mut self) -> Result<()> {
        let mut cache = DirectionalCache::new();
        let op = self.operator();
        traversal::compute_all(&op, &self.tree, &mut cache)?;
        let root_array = traversal::combine_at(&op, &self.tree, self.tree.root_id(), &cache)?;
        self.cache = cache;
        self.root_array = root_array;
        debug!(score = self.score(), "parsimony scores computed");
        Ok(())
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn config(&self) -> &ParsimonyConfig {
        &self.config
    }

    /// Number of parsimony states (one more than the alphabet with gaps as a state)
    pub fn n_states(&self) -> usize {
        self.n_states
    }

    pub fn number_of_distinct_sites(&self) -> usize {
        self.patterns.number_of_patterns()
    }

    /// Sum of pattern scores times pattern multiplicities.
    fn weighted(&self, scores: &[u32]) -> u64 {
        scores
            .iter()
            .zip(self.patterns.weights())
            .map(|(&s, &w)| u64::from(s) * w.round() as u64)
            .sum()
    }

    /// Weighted total at the root.
    pub fn score(&self) -> u64 {
        self.weighted(&self.root_array.scores)
    }

    /// Score of one original alignment column.
    pub fn score_for_site(&self, site: usize) -> Result<u32> {
        Ok(self.root_array.scores[self.patterns.pattern_of_site(site)?])
    }

    /// Score of every original alignment column.
    pub fn site_scores(&self) -> Vec<u32> {
        (0..self.patterns.number_of_sites())
            .filter_map(|site| self.score_for_site(site).ok())
            .collect()
    }

    /// Weighted total obtained by combining every neighbor direction at `id`.
    pub fn score_at_node(&self, id: NodeId) -> Result<u64> {
        let array = traversal::combine_at(&self.operator(), &self.tree, id, &self.cache)?;
        Ok(self.weighted(&array.scores))
    }

    /// (parent, grand father, uncle) of an NNI around the branch above `son`'s father.
    fn nni_nodes(&self, son: NodeId) -> Result<(NodeId, NodeId, NodeId)> {
        let parent = self.tree.father_id(son)?.ok_or(PhyloError::NodeIsRoot(son))?;
        let grand_father = self
            .tree
            .father_id(parent)?
            .ok_or(PhyloError::NodeIsRoot(parent))?;
        // Bifurcation assumed: with more sons, an arbitrary uncle is taken
        let parent_position = self.tree.son_position(grand_father, parent)?;
        let uncle_position = if parent_position > 1 {
            parent_position - 1
        } else {
            1 - parent_position
        };
        let uncle = self.tree.son_id(grand_father, uncle_position)?;
        Ok((parent, grand_father, uncle))
    }

    /// Score change of exchanging `son` with its uncle, without touching the tree.
    pub fn test_nni(&self, son: NodeId) -> Result<f64> {
        let (parent, grand_father, uncle) = self.nni_nodes(son)?;

        // Grand father as if `son` replaced `uncle`
        let mut gf_inputs = Vec::new();
        for n in self.tree.neighbors_id(grand_father)? {
            if n != parent && n != uncle {
                gf_inputs.push(self.cache.get(grand_father, n)?);
            }
        }
        gf_inputs.push(self.cache.get(parent, son)?);
        let gf_array = ParsimonyArray::combine(&gf_inputs)?;

        // Parent as if `uncle` replaced `son`
        let mut p_inputs = Vec::new();
        for n in self.tree.neighbors_id(parent)? {
            if n != grand_father && n != son {
                p_inputs.push(self.cache.get(parent, n)?);
            }
        }
        p_inputs.push(self.cache.get(grand_father, uncle)?);
        p_inputs.push(&gf_array);
        let p_array = ParsimonyArray::combine(&p_inputs)?;

        Ok(self.weighted(&p_array.scores) as f64 - self.score() as f64)
    }

    /// Exchange `son` with its uncle. Cached scores are stale until the next
    /// [`compute_scores`](Self::compute_scores).
    pub fn do_nni(&mut self, son: NodeId) -> Result<()> {
        let (parent, grand_father, uncle) = self.nni_nodes(son)?;
        self.tree.regraft(son, grand_father)?;
        self.tree.regraft(uncle, parent)?;
        debug!(son, uncle, parent, grand_father, "NNI applied");
        Ok(())
    }

    /// Nodes around which an NNI can be tested.
    pub fn nni_candidates(&self) -> Vec<NodeId> {
        self.tree
            .nodes_id()
            .into_iter()
            .filter(|&id| self.nni_nodes(id).is_ok())
            .collect()
    }

    /// Delta of every candidate NNI, evaluated in parallel.
    pub fn nni_deltas(&self) -> Result<Vec<(NodeId, f64)>> {
        self.nni_candidates()
            .par_iter()
            .map(|&id| self.test_nni(id).map(|delta| (id, delta)))
            .collect()
    }

    /// Assign one state per site to every node, stored as the
    /// [`STATE_PROPERTY`] node property.
    ///
    /// Walking from the root, a node keeps its father's state when it is
    /// compatible with its subtree, and the lowest compatible state otherwise.
    pub fn compute_solution(&mut self) -> Result<()> {
        let mut states: HashMap<NodeId, Vec<usize>> = HashMap::new();
        for id in self.tree.nodes_id() {
            let (subtree, father_states) = match self.tree.father_id(id)? {
                Some(f) => (self.cache.get(f, id)?, states.get(&f).cloned()),
                None => (&self.root_array, None),
            };
            let chosen = subtree
                .bitsets
                .iter()
                .enumerate()
                .map(|(p, set)| match &father_states {
                    Some(fs) if set.contains(fs[p]) => fs[p],
                    _ => set.ones().next().unwrap_or(0),
                })
                .collect();
            states.insert(id, chosen);
        }

        let alphabet = self.patterns.alphabet();
        for (id, pattern_states) in states {
            let text: String = (0..self.patterns.number_of_sites())
                .map(|site| {
                    let p = self.patterns.pattern_of_site(site)?;
                    Ok(alphabet.state_char(pattern_states[p]).unwrap_or('-'))
                })
                .collect::<Result<String>>()?;
            self.tree
                .set_node_property(id, STATE_PROPERTY, Property::Text(text))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::Alphabet;

    fn binary_sites(pairs: &[(&str, &str)]) -> SiteContainer {
        SiteContainer::from_pairs(Alphabet::binary(), pairs).unwrap()
    }

    /// ((A,B),C,D) with A=0, B=1, C=2, D=3, AB=4, root=5
    fn unrooted_quartet() -> Tree {
        let names = ["A", "B", "C", "D"].iter().map(|s| s.to_string()).collect();
        Tree::from_structure(
            vec![(5, None), (4, Some(5)), (0, Some(4)), (1, Some(4)), (2, Some(5)), (3, Some(5))],
            vec![0.0, 0.1, 0.1, 0.1, 0.1, 0.1],
            names,
            vec![0, 1, 2, 3],
        )
        .unwrap()
    }

    #[test]
    fn test_combine_rules() {
        let mut a = FixedBitSet::with_capacity(2);
        a.insert(0);
        let mut b = FixedBitSet::with_capacity(2);
        b.insert(1);
        let x = ParsimonyArray { bitsets: vec![a.clone()], scores: vec![2] };
        let y = ParsimonyArray { bitsets: vec![b], scores: vec![1] };
        let z = ParsimonyArray { bitsets: vec![a], scores: vec![0] };

        let disjoint = ParsimonyArray::combine(&[&x, &y]).unwrap();
        assert_eq!(disjoint.scores, vec![4]);
        assert_eq!(disjoint.bitsets[0].count_ones(..), 2);

        let shared = ParsimonyArray::combine(&[&x, &z]).unwrap();
        assert_eq!(shared.scores, vec![2]);
        assert!(shared.bitsets[0].contains(0));
        assert!(ParsimonyArray::combine(&[]).is_err());
    }

    #[test]
    fn test_combine_counts_each_disjoint_input() {
        let single = |state: usize| {
            let mut set = FixedBitSet::with_capacity(4);
            set.insert(state);
            ParsimonyArray { bitsets: vec![set], scores: vec![0] }
        };
        let (a, c, g) = (single(0), single(1), single(2));
        let merged = ParsimonyArray::combine(&[&a, &c, &g]).unwrap();
        assert_eq!(merged.scores, vec![2]);
        assert_eq!(merged.bitsets[0].count_ones(..), 3);

        let again = ParsimonyArray::combine(&[&a, &c, &a]).unwrap();
        assert_eq!(again.scores, vec![1]);
        assert_eq!(again.bitsets[0].ones().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_quartet_score_and_nni() {
        let sites = binary_sites(&[("A", "0"), ("B", "0"), ("C", "1"), ("D", "1")]);
        let mut pars = ParsimonyScore::new(unrooted_quartet(), &sites, ParsimonyConfig::default())
            .unwrap();
        assert_eq!(pars.score(), 1);

        let delta = pars.test_nni(1).unwrap();
        assert_eq!(delta, 1.0);
        // Testing leaves the tree untouched
        assert_eq!(pars.tree().sons_id(4).unwrap(), vec![0, 1]);

        pars.do_nni(1).unwrap();
        assert_eq!(pars.tree().sons_id(4).unwrap(), vec![0, 2]);
        assert_eq!(pars.tree().sons_id(5).unwrap(), vec![4, 3, 1]);
        pars.compute_scores().unwrap();
        assert_eq!(pars.score(), 2);
    }

    fn dna_sites(pairs: &[(&str, &str)]) -> SiteContainer {
        SiteContainer::from_pairs(Alphabet::dna(), pairs).unwrap()
    }

    fn assert_same_everywhere(pars: &ParsimonyScore, expected: u64) {
        assert_eq!(pars.score(), expected);
        for id in pars.tree().nodes_id() {
            assert_eq!(pars.score_at_node(id).unwrap(), expected, "node {id}");
        }
    }

    #[test]
    fn test_trifurcation_counts_every_conflict() {
        // Four different states need three changes whatever the node
        let sites = dna_sites(&[("A", "A"), ("B", "C"), ("C", "G"), ("D", "T")]);
        let pars = ParsimonyScore::new(unrooted_quartet(), &sites, ParsimonyConfig::default())
            .unwrap();
        assert_same_everywhere(&pars, 3);
    }

    #[test]
    fn test_star_tree_counts_every_conflict() {
        let mut tree = Tree::with_root(3, None);
        for (i, name) in ["A", "B", "C"].iter().enumerate() {
            tree.add_son(3, i as NodeId, Some(name), Some(0.1)).unwrap();
        }
        let sites = dna_sites(&[("A", "AA"), ("B", "CA"), ("C", "GC")]);
        let pars = ParsimonyScore::new(tree, &sites, ParsimonyConfig::default()).unwrap();
        assert_eq!(pars.site_scores(), vec![2, 1]);
        assert_same_everywhere(&pars, 3);
    }

    #[test]
    fn test_tree_rooted_at_a_leaf() {
        let sites = dna_sites(&[("A", "AC"), ("B", "CC"), ("C", "GT"), ("D", "TT")]);
        let reference = ParsimonyScore::new(unrooted_quartet(), &sites, ParsimonyConfig::default())
            .unwrap();
        assert_eq!(reference.score(), 4);

        let mut tree = unrooted_quartet();
        tree.root_at(0).unwrap();
        assert_eq!(tree.sons_id(0).unwrap(), vec![4]);
        let pars = ParsimonyScore::new(tree, &sites, ParsimonyConfig::default()).unwrap();
        assert_same_everywhere(&pars, 4);
    }

    #[test]
    fn test_repeated_columns_are_weighted() {
        let sites = binary_sites(&[("A", "0000"), ("B", "0000"), ("C", "1111"), ("D", "1111")]);
        let pars = ParsimonyScore::new(unrooted_quartet(), &sites, ParsimonyConfig::default())
            .unwrap();
        assert_eq!(pars.number_of_distinct_sites(), 1);
        assert_eq!(pars.score(), 4);
        assert_eq!(pars.site_scores(), vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_nni_needs_grand_father() {
        let sites = binary_sites(&[("A", "0"), ("B", "0"), ("C", "1"), ("D", "1")]);
        let pars = ParsimonyScore::new(unrooted_quartet(), &sites, ParsimonyConfig::default())
            .unwrap();
        assert_eq!(pars.test_nni(5).unwrap_err(), PhyloError::NodeIsRoot(5));
        assert_eq!(pars.test_nni(2).unwrap_err(), PhyloError::NodeIsRoot(5));
        assert_eq!(pars.nni_candidates(), vec![0, 1]);
    }

    #[test]
    fn test_star_tree_identical_states() {
        let mut tree = Tree::with_root(0, None);
        for (i, name) in ["A", "B", "C", "D", "E"].iter().enumerate() {
            tree.add_son(0, i as NodeId + 1, Some(name), Some(0.1)).unwrap();
        }
        let sites = SiteContainer::from_pairs(
            Alphabet::dna(),
            &[("A", "ACGT"), ("B", "ACGT"), ("C", "ACGT"), ("D", "ACGT"), ("E", "ACGT")],
        )
        .unwrap();
        let pars = ParsimonyScore::new(tree, &sites, ParsimonyConfig::default()).unwrap();
        assert_eq!(pars.score(), 0);
        assert_eq!(pars.site_scores(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_gap_handling() {
        let sites = binary_sites(&[("A", "0"), ("B", "-"), ("C", "1"), ("D", "1")]);
        let pars = ParsimonyScore::new(unrooted_quartet(), &sites, ParsimonyConfig::default())
            .unwrap();
        assert_eq!(pars.score(), 1);

        let config = ParsimonyConfig {
            include_gaps: true,
            ..ParsimonyConfig::default()
        };
        let pars = ParsimonyScore::new(unrooted_quartet(), &sites, config).unwrap();
        assert_eq!(pars.n_states(), 3);
        assert_eq!(pars.score(), 2);
    }

    #[test]
    fn test_missing_sequence() {
        let sites = binary_sites(&[("A", "0"), ("B", "0"), ("C", "1")]);
        let err = ParsimonyScore::new(unrooted_quartet(), &sites, ParsimonyConfig::default())
            .unwrap_err();
        assert_eq!(err, PhyloError::SequenceNotFound("D".into()));
    }

    #[test]
    fn test_solution_is_consistent_with_leaves() {
        let sites = binary_sites(&[("A", "01"), ("B", "00"), ("C", "11"), ("D", "10")]);
        let mut pars = ParsimonyScore::new(unrooted_quartet(), &sites, ParsimonyConfig::default())
            .unwrap();
        pars.compute_solution().unwrap();
        let tree = pars.tree();
        assert_eq!(
            tree.node_property(0, STATE_PROPERTY).unwrap(),
            Some(&Property::Text("01".into()))
        );
        assert!(matches!(
            tree.node_property(4, STATE_PROPERTY).unwrap(),
            Some(Property::Text(s)) if s.len() == 2
        ));
    }
}
