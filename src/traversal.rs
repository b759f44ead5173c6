//! Double-recursive traversal shared by the parsimony and likelihood engines.
//!
//! For every directed edge `(center, neighbor)` the cache holds the array
//! describing everything on the neighbor's side of the edge, expressed at the
//! neighbor. The post-order pass fills the entries pointing down the tree, the
//! pre-order pass the entries pointing up. Afterwards the total at any node is
//! a single combine over all of its neighbors.

use std::collections::HashMap;

use tracing::trace;

use crate::error::{PhyloError, Result};
use crate::tree::{NodeId, Tree};

/// Local operator merging the arrays arriving at a node.
pub trait CombineOperator {
    type Array: Clone + Send + Sync;

    /// Fixed array of a leaf toward its father.
    fn leaf_array(&self, tree: &Tree, leaf: NodeId) -> Result<Self::Array>;

    /// Merge the arrays seen from each neighbor in `inputs` into the array at
    /// `center`. An input whose neighbor is `center` itself is the leaf's own
    /// base array.
    fn combine(&self, tree: &Tree, center: NodeId, inputs: &[(NodeId, &Self::Array)])
        -> Result<Self::Array>;
}

/// Arrays keyed by directed edge `(center, neighbor)`.
#[derive(Debug, Clone)]
pub struct DirectionalCache<A> {
    arrays: HashMap<(NodeId, NodeId), A>,
}

impl<A> Default for DirectionalCache<A> {
    fn default() -> Self {
        Self {
            arrays: HashMap::new(),
        }
    }
}

impl<A> DirectionalCache<A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, center: NodeId, neighbor: NodeId) -> Result<&A> {
        self.arrays.get(&(center, neighbor)).ok_or_else(|| {
            PhyloError::invalid_input(format!(
                "no cached array at node {center} for neighbor {neighbor}"
            ))
        })
    }

    pub fn insert(&mut self, center: NodeId, neighbor: NodeId, array: A) {
        self.arrays.insert((center, neighbor), array);
    }

    pub fn contains(&self, center: NodeId, neighbor: NodeId) -> bool {
        self.arrays.contains_key(&(center, neighbor))
    }

    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }

    pub fn clear(&mut self) {
        self.arrays.clear();
    }
}

/// True for nodes with a single neighbor: leaves, and a root with one son.
/// Such nodes carry their own base array.
pub fn is_terminal(tree: &Tree, node: NodeId) -> Result<bool> {
    Ok(tree.degree(node)? == 1)
}

/// Every node carrying a base array, in pre-order.
pub fn terminal_nodes_id(tree: &Tree) -> Result<Vec<NodeId>> {
    let mut terminals = Vec::new();
    for id in tree.nodes_id() {
        if is_terminal(tree, id)? {
            terminals.push(id);
        }
    }
    Ok(terminals)
}

fn own_array<C: CombineOperator>(op: &C, tree: &Tree, node: NodeId) -> Result<Option<C::Array>> {
    if is_terminal(tree, node)? {
        Ok(Some(op.leaf_array(tree, node)?))
    } else {
        Ok(None)
    }
}

/// Fill the entries pointing from every node toward its sons, below `node`.
pub fn compute_postorder<C: CombineOperator>(
    op: &C,
    tree: &Tree,
    node: NodeId,
    cache: &mut DirectionalCache<C::Array>,
) -> Result<()> {
    for son in tree.sons_id(node)? {
        let array = if tree.is_leaf(son)? {
            op.leaf_array(tree, son)?
        } else {
            compute_postorder(op, tree, son, cache)?;
            let grandsons = tree.sons_id(son)?;
            let inputs = grandsons
                .iter()
                .map(|&g| Ok((g, cache.get(son, g)?)))
                .collect::<Result<Vec<_>>>()?;
            op.combine(tree, son, &inputs)?
        };
        trace!(center = node, neighbor = son, "postorder array");
        cache.insert(node, son, array);
    }
    Ok(())
}

/// Fill the entries pointing from every node toward its father, below `node`.
///
/// Needs the post-order entries and, unless `node` is the root, the entry of
/// `node` toward its own father. A root with a single son stands in for its
/// missing father with its own base array.
pub fn compute_preorder<C: CombineOperator>(
    op: &C,
    tree: &Tree,
    node: NodeId,
    cache: &mut DirectionalCache<C::Array>,
) -> Result<()> {
    let neighbors = tree.neighbors_id(node)?;
    let own = own_array(op, tree, node)?;
    for son in tree.sons_id(node)? {
        let array = {
            let mut inputs = neighbors
                .iter()
                .filter(|&&n| n != son)
                .map(|&n| Ok((n, cache.get(node, n)?)))
                .collect::<Result<Vec<_>>>()?;
            if let Some(own) = own.as_ref() {
                inputs.push((node, own));
            }
            op.combine(tree, node, &inputs)?
        };
        trace!(center = son, neighbor = node, "preorder array");
        cache.insert(son, node, array);
        compute_preorder(op, tree, son, cache)?;
    }
    Ok(())
}

/// Both passes over the whole tree.
pub fn compute_all<C: CombineOperator>(
    op: &C,
    tree: &Tree,
    cache: &mut DirectionalCache<C::Array>,
) -> Result<()> {
    cache.clear();
    let root = tree.root_id();
    compute_postorder(op, tree, root, cache)?;
    compute_preorder(op, tree, root, cache)
}

/// Combine every neighbor direction at `node`. A terminal node also
/// contributes its own base array.
pub fn combine_at<C: CombineOperator>(
    op: &C,
    tree: &Tree,
    node: NodeId,
    cache: &DirectionalCache<C::Array>,
) -> Result<C::Array> {
    let own = own_array(op, tree, node)?;
    let mut inputs = tree
        .neighbors_id(node)?
        .into_iter()
        .map(|n| Ok((n, cache.get(node, n)?)))
        .collect::<Result<Vec<_>>>()?;
    if let Some(own) = own.as_ref() {
        inputs.push((node, own));
    }
    op.combine(tree, node, &inputs)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Counts the leaves on each side of an edge.
    struct LeafCounter;

    impl CombineOperator for LeafCounter {
        type Array = usize;

        fn leaf_array(&self, _tree: &Tree, _leaf: NodeId) -> Result<usize> {
            Ok(1)
        }

        fn combine(&self, _tree: &Tree, _center: NodeId, inputs: &[(NodeId, &usize)]) -> Result<usize> {
            Ok(inputs.iter().map(|(_, &n)| n).sum())
        }
    }

    fn tree() -> Tree {
        // ((0,1)4,2,3)5 unrooted, with a multifurcating root
        Tree::from_structure(
            vec![(5, None), (4, Some(5)), (0, Some(4)), (1, Some(4)), (2, Some(5)), (3, Some(5))],
            vec![0.0; 6],
            vec![],
            vec![],
        )
        .unwrap()
    }

    #[test]
    fn test_every_direction_is_filled() {
        let tree = tree();
        let mut cache = DirectionalCache::new();
        compute_all(&LeafCounter, &tree, &mut cache).unwrap();
        // One entry per directed edge
        assert_eq!(cache.len(), 2 * (tree.number_of_nodes() - 1));
        assert_eq!(*cache.get(5, 4).unwrap(), 2);
        assert_eq!(*cache.get(4, 5).unwrap(), 2);
        assert_eq!(*cache.get(0, 4).unwrap(), 3);
    }

    #[test]
    fn test_total_is_the_same_everywhere() {
        let tree = tree();
        let mut cache = DirectionalCache::new();
        compute_all(&LeafCounter, &tree, &mut cache).unwrap();
        for id in tree.nodes_id() {
            assert_eq!(combine_at(&LeafCounter, &tree, id, &cache).unwrap(), 4);
        }
    }

    #[test]
    fn test_root_with_single_son_counts_itself() {
        let mut tree = tree();
        tree.root_at(0).unwrap();
        assert_eq!(tree.root_id(), 0);
        assert_eq!(terminal_nodes_id(&tree).unwrap(), vec![0, 1, 2, 3]);

        let mut cache = DirectionalCache::new();
        compute_all(&LeafCounter, &tree, &mut cache).unwrap();
        assert_eq!(*cache.get(4, 0).unwrap(), 1);
        for id in tree.nodes_id() {
            assert_eq!(combine_at(&LeafCounter, &tree, id, &cache).unwrap(), 4);
        }
    }

    #[test]
    fn test_missing_entry_is_reported() {
        let tree = tree();
        let cache: DirectionalCache<usize> = DirectionalCache::new();
        assert!(combine_at(&LeafCounter, &tree, 5, &cache).is_err());
    }
}
