//! Rooted, possibly multifurcating phylogenetic tree.
//!
//! Nodes live in an arena and refer to each other by slot index: the father
//! is stored as an index and the sons as an ordered list of indices, so
//! "neighbors = father + sons" is a computed view and there are no ownership
//! cycles. Public operations address nodes by their integer id, which is
//! distinct from the slot and can be reassigned with [`Tree::reset_nodes_id`].

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{PhyloError, Result};

/// Integer node identifier, unique among the nodes currently in a tree.
pub type NodeId = i32;

/// Opaque value attached to a node or to the branch above it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Property {
    Number(f64),
    Integer(i64),
    Text(String),
    Flag(bool),
}

/// A node record. Topology (father, sons) is only reachable through [`Tree`].
#[derive(Debug, Clone)]
pub struct Node {
    id: NodeId,
    name: Option<String>,
    father: Option<usize>,
    sons: Vec<usize>,
    distance_to_father: Option<f64>,
    node_properties: BTreeMap<String, Property>,
    branch_properties: BTreeMap<String, Property>,
}

impl Node {
    fn new(id: NodeId, name: Option<String>) -> Self {
        Self {
            id,
            name,
            father: None,
            sons: Vec::new(),
            distance_to_father: None,
            node_properties: BTreeMap::new(),
            branch_properties: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn has_father(&self) -> bool {
        self.father.is_some()
    }

    pub fn is_leaf(&self) -> bool {
        self.sons.is_empty()
    }

    pub fn number_of_sons(&self) -> usize {
        self.sons.len()
    }

    /// Neighbor count (father plus sons).
    pub fn degree(&self) -> usize {
        self.sons.len() + usize::from(self.father.is_some())
    }

    pub fn distance_to_father(&self) -> Option<f64> {
        self.distance_to_father
    }

    pub fn node_property(&self, name: &str) -> Option<&Property> {
        self.node_properties.get(name)
    }

    pub fn branch_property(&self, name: &str) -> Option<&Property> {
        self.branch_properties.get(name)
    }
}

/// Rooted tree owning its whole node graph.
///
/// The tree is considered rooted when the root has exactly two sons; a root
/// with three or more sons stores an unrooted tree at an arbitrary point.
#[derive(Debug, Clone)]
pub struct Tree {
    nodes: Vec<Node>,
    root: usize,
    name: Option<String>,
    /// Slot of the first node carrying each id, in pre-order.
    index: HashMap<NodeId, usize>,
    free: Vec<usize>,
}

impl Tree {
    /// Create a tree made of a single root node.
    pub fn with_root(id: NodeId, name: Option<&str>) -> Self {
        let mut tree = Self {
            nodes: vec![Node::new(id, name.map(str::to_string))],
            root: 0,
            name: None,
            index: HashMap::new(),
            free: Vec::new(),
        };
        tree.reindex();
        tree
    }

    /// Create tree from structure
    ///
    /// # Arguments
    /// * `structure` - `(node_id, parent_id)` pairs; exactly one entry has no parent
    /// * `branch_lengths` - Length of the branch above each entry of `structure`
    ///   (the root entry is ignored)
    /// * `leaf_names` - Names of the leaves, parallel to `leaf_node_ids`
    /// * `leaf_node_ids` - Node ids that carry a name
    ///
    /// Sons are ordered by their first appearance in `structure`.
    pub fn from_structure(
        structure: Vec<(NodeId, Option<NodeId>)>,
        branch_lengths: Vec<f64>,
        leaf_names: Vec<String>,
        leaf_node_ids: Vec<NodeId>,
    ) -> Result<Self> {
        if branch_lengths.len() != structure.len() {
            return Err(PhyloError::dimension(
                "branch lengths",
                structure.len(),
                branch_lengths.len(),
            ));
        }
        if leaf_names.len() != leaf_node_ids.len() {
            return Err(PhyloError::dimension(
                "leaf names",
                leaf_node_ids.len(),
                leaf_names.len(),
            ));
        }

        let mut slot_of: HashMap<NodeId, usize> = HashMap::new();
        let mut nodes = Vec::with_capacity(structure.len());
        for (slot, (node_id, _)) in structure.iter().enumerate() {
            if slot_of.insert(*node_id, slot).is_some() {
                return Err(PhyloError::NonUniqueId(*node_id));
            }
            nodes.push(Node::new(*node_id, None));
        }

        let mut root = None;
        for (slot, (node_id, parent_id)) in structure.iter().enumerate() {
            match parent_id {
                Some(p) => {
                    let father = *slot_of.get(p).ok_or(PhyloError::NodeNotFound(*p))?;
                    nodes[slot].father = Some(father);
                    nodes[slot].distance_to_father = Some(branch_lengths[slot]);
                    nodes[father].sons.push(slot);
                }
                None => {
                    if root.is_some() {
                        return Err(PhyloError::InvalidTopology(format!(
                            "several roots found (node {node_id})"
                        )));
                    }
                    root = Some(slot);
                }
            }
        }
        let root = root.ok_or_else(|| {
            PhyloError::InvalidTopology("no root node found (no node without parent)".into())
        })?;

        for (name, id) in leaf_names.into_iter().zip(leaf_node_ids) {
            let slot = *slot_of.get(&id).ok_or(PhyloError::NodeNotFound(id))?;
            nodes[slot].name = Some(name);
        }

        let mut tree = Self {
            nodes,
            root,
            name: None,
            index: HashMap::new(),
            free: Vec::new(),
        };
        if tree.preorder_slots(root).len() != structure.len() {
            return Err(PhyloError::InvalidTopology(
                "structure contains a cycle or a disconnected node".into(),
            ));
        }
        tree.reindex();
        Ok(tree)
    }

    /// Add a new son below `father` and return its id.
    pub fn add_son(
        &mut self,
        father: NodeId,
        id: NodeId,
        name: Option<&str>,
        distance_to_father: Option<f64>,
    ) -> Result<NodeId> {
        if self.index.contains_key(&id) {
            return Err(PhyloError::NonUniqueId(id));
        }
        let father_slot = self.slot(father)?;
        let slot = self.alloc(Node::new(id, name.map(str::to_string)));
        self.nodes[slot].distance_to_father = distance_to_father;
        self.attach(father_slot, slot);
        self.reindex();
        Ok(id)
    }

    // ---------------------------------------------------------------------
    // Slot bookkeeping
    // ---------------------------------------------------------------------

    fn alloc(&mut self, node: Node) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, slot: usize) {
        self.nodes[slot] = Node::new(NodeId::MIN, None);
        self.free.push(slot);
    }

    fn attach(&mut self, father: usize, son: usize) {
        self.nodes[son].father = Some(father);
        self.nodes[father].sons.push(son);
    }

    fn detach(&mut self, father: usize, son: usize) {
        self.nodes[father].sons.retain(|&s| s != son);
        self.nodes[son].father = None;
    }

    fn reindex(&mut self) {
        let mut index = HashMap::with_capacity(self.nodes.len());
        for slot in self.preorder_slots(self.root) {
            index.entry(self.nodes[slot].id).or_insert(slot);
        }
        self.index = index;
    }

    fn slot(&self, id: NodeId) -> Result<usize> {
        self.index.get(&id).copied().ok_or(PhyloError::NodeNotFound(id))
    }

    fn preorder_slots(&self, from: usize) -> Vec<usize> {
        let mut order = Vec::new();
        let mut stack = vec![from];
        while let Some(slot) = stack.pop() {
            order.push(slot);
            stack.extend(self.nodes[slot].sons.iter().rev());
        }
        order
    }

    fn ids(&self, slots: &[usize]) -> Vec<NodeId> {
        slots.iter().map(|&s| self.nodes[s].id).collect()
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = Some(name.to_string());
    }

    pub fn root_id(&self) -> NodeId {
        self.nodes[self.root].id
    }

    /// First node carrying `id` in pre-order.
    pub fn node(&self, id: NodeId) -> Result<&Node> {
        Ok(&self.nodes[self.slot(id)?])
    }

    /// Node carrying `id`, failing when the id is carried by several nodes.
    pub fn node_unique(&self, id: NodeId) -> Result<&Node> {
        let matches: Vec<usize> = self
            .preorder_slots(self.root)
            .into_iter()
            .filter(|&s| self.nodes[s].id == id)
            .collect();
        match matches.as_slice() {
            [] => Err(PhyloError::NodeNotFound(id)),
            [slot] => Ok(&self.nodes[*slot]),
            _ => Err(PhyloError::NonUniqueId(id)),
        }
    }

    pub fn has_node(&self, id: NodeId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn number_of_nodes(&self) -> usize {
        self.preorder_slots(self.root).len()
    }

    pub fn number_of_leaves(&self) -> usize {
        self.preorder_slots(self.root)
            .into_iter()
            .filter(|&s| self.nodes[s].sons.is_empty())
            .count()
    }

    /// All node ids in pre-order (root first, sons in stored order).
    pub fn nodes_id(&self) -> Vec<NodeId> {
        self.ids(&self.preorder_slots(self.root))
    }

    /// Node ids of the subtree rooted at `id`, in pre-order, `id` first.
    pub fn subtree_nodes_id(&self, id: NodeId) -> Result<Vec<NodeId>> {
        Ok(self.ids(&self.preorder_slots(self.slot(id)?)))
    }

    pub fn leaves_id(&self) -> Vec<NodeId> {
        self.preorder_slots(self.root)
            .into_iter()
            .filter(|&s| self.nodes[s].sons.is_empty())
            .map(|s| self.nodes[s].id)
            .collect()
    }

    pub fn inner_nodes_id(&self) -> Vec<NodeId> {
        self.preorder_slots(self.root)
            .into_iter()
            .filter(|&s| !self.nodes[s].sons.is_empty())
            .map(|s| self.nodes[s].id)
            .collect()
    }

    /// Ids of every node that has a branch above it (all but the root).
    pub fn branches_id(&self) -> Vec<NodeId> {
        self.preorder_slots(self.root)
            .into_iter()
            .skip(1)
            .map(|s| self.nodes[s].id)
            .collect()
    }

    pub fn leaves_names(&self) -> Vec<String> {
        self.preorder_slots(self.root)
            .into_iter()
            .filter(|&s| self.nodes[s].sons.is_empty())
            .filter_map(|s| self.nodes[s].name.clone())
            .collect()
    }

    /// Id of the leaf carrying `name`.
    pub fn leaf_id(&self, name: &str) -> Result<NodeId> {
        self.preorder_slots(self.root)
            .into_iter()
            .find(|&s| self.nodes[s].sons.is_empty() && self.nodes[s].name.as_deref() == Some(name))
            .map(|s| self.nodes[s].id)
            .ok_or_else(|| PhyloError::LeafNotFound(name.to_string()))
    }

    pub fn father_id(&self, id: NodeId) -> Result<Option<NodeId>> {
        let slot = self.slot(id)?;
        Ok(self.nodes[slot].father.map(|f| self.nodes[f].id))
    }

    pub fn sons_id(&self, id: NodeId) -> Result<Vec<NodeId>> {
        let slot = self.slot(id)?;
        Ok(self.ids(&self.nodes[slot].sons))
    }

    pub fn son_id(&self, id: NodeId, position: usize) -> Result<NodeId> {
        let slot = self.slot(id)?;
        self.nodes[slot]
            .sons
            .get(position)
            .map(|&s| self.nodes[s].id)
            .ok_or_else(|| {
                PhyloError::invalid_input(format!("node {id} has no son at position {position}"))
            })
    }

    pub fn son_position(&self, father: NodeId, son: NodeId) -> Result<usize> {
        let father_slot = self.slot(father)?;
        let son_slot = self.slot(son)?;
        self.nodes[father_slot]
            .sons
            .iter()
            .position(|&s| s == son_slot)
            .ok_or_else(|| PhyloError::invalid_input(format!("node {son} is not a son of {father}")))
    }

    /// Father (if any) followed by the sons.
    pub fn neighbors_id(&self, id: NodeId) -> Result<Vec<NodeId>> {
        let slot = self.slot(id)?;
        let node = &self.nodes[slot];
        let mut neighbors = Vec::with_capacity(node.degree());
        if let Some(f) = node.father {
            neighbors.push(self.nodes[f].id);
        }
        neighbors.extend(node.sons.iter().map(|&s| self.nodes[s].id));
        Ok(neighbors)
    }

    pub fn degree(&self, id: NodeId) -> Result<usize> {
        Ok(self.node(id)?.degree())
    }

    pub fn is_leaf(&self, id: NodeId) -> Result<bool> {
        Ok(self.node(id)?.is_leaf())
    }

    pub fn is_root(&self, id: NodeId) -> Result<bool> {
        Ok(self.slot(id)? == self.root)
    }

    /// Ids from the father of `id` up to the root.
    pub fn ancestors_id(&self, id: NodeId) -> Result<Vec<NodeId>> {
        let mut slot = self.slot(id)?;
        let mut ancestors = Vec::new();
        while let Some(f) = self.nodes[slot].father {
            ancestors.push(self.nodes[f].id);
            slot = f;
        }
        Ok(ancestors)
    }

    pub fn is_rooted(&self) -> bool {
        self.nodes[self.root].sons.len() == 2
    }

    pub fn is_multifurcating(&self) -> bool {
        if self.nodes[self.root].sons.len() > 3 {
            return true;
        }
        self.preorder_slots(self.root)
            .into_iter()
            .skip(1)
            .any(|s| self.nodes[s].sons.len() > 2)
    }

    /// Largest id plus one.
    pub fn next_id(&self) -> NodeId {
        self.preorder_slots(self.root)
            .into_iter()
            .map(|s| self.nodes[s].id)
            .max()
            .map_or(0, |m| m + 1)
    }

    // ---------------------------------------------------------------------
    // Branch lengths, names and properties
    // ---------------------------------------------------------------------

    pub fn distance_to_father(&self, id: NodeId) -> Result<Option<f64>> {
        Ok(self.node(id)?.distance_to_father)
    }

    pub fn set_distance_to_father(&mut self, id: NodeId, length: f64) -> Result<()> {
        let slot = self.slot(id)?;
        self.nodes[slot].distance_to_father = Some(length);
        Ok(())
    }

    pub fn delete_distance_to_father(&mut self, id: NodeId) -> Result<()> {
        let slot = self.slot(id)?;
        self.nodes[slot].distance_to_father = None;
        Ok(())
    }

    /// Branch lengths in pre-order, root excluded. Missing lengths are `None`.
    pub fn branch_lengths(&self) -> Vec<Option<f64>> {
        self.preorder_slots(self.root)
            .into_iter()
            .skip(1)
            .map(|s| self.nodes[s].distance_to_father)
            .collect()
    }

    pub fn total_length(&self) -> f64 {
        self.branch_lengths().into_iter().flatten().sum()
    }

    pub fn set_branch_lengths(&mut self, length: f64) {
        for slot in self.preorder_slots(self.root).into_iter().skip(1) {
            self.nodes[slot].distance_to_father = Some(length);
        }
    }

    /// Give `length` to every branch that has none.
    pub fn set_void_branch_lengths(&mut self, length: f64) {
        for slot in self.preorder_slots(self.root).into_iter().skip(1) {
            self.nodes[slot].distance_to_father.get_or_insert(length);
        }
    }

    pub fn scale_tree(&mut self, factor: f64) {
        for slot in self.preorder_slots(self.root).into_iter().skip(1) {
            if let Some(d) = self.nodes[slot].distance_to_father.as_mut() {
                *d *= factor;
            }
        }
    }

    pub fn node_name(&self, id: NodeId) -> Result<Option<&str>> {
        Ok(self.node(id)?.name())
    }

    pub fn set_node_name(&mut self, id: NodeId, name: &str) -> Result<()> {
        let slot = self.slot(id)?;
        self.nodes[slot].name = Some(name.to_string());
        Ok(())
    }

    /// Change the id of a node. Does not check for uniqueness.
    pub fn set_node_id(&mut self, id: NodeId, new_id: NodeId) -> Result<()> {
        let slot = self.slot(id)?;
        self.nodes[slot].id = new_id;
        self.reindex();
        Ok(())
    }

    pub fn set_node_property(&mut self, id: NodeId, name: &str, value: Property) -> Result<()> {
        let slot = self.slot(id)?;
        self.nodes[slot].node_properties.insert(name.to_string(), value);
        Ok(())
    }

    pub fn node_property(&self, id: NodeId, name: &str) -> Result<Option<&Property>> {
        Ok(self.node(id)?.node_properties.get(name))
    }

    pub fn remove_node_property(&mut self, id: NodeId, name: &str) -> Result<Option<Property>> {
        let slot = self.slot(id)?;
        Ok(self.nodes[slot].node_properties.remove(name))
    }

    pub fn set_branch_property(&mut self, id: NodeId, name: &str, value: Property) -> Result<()> {
        let slot = self.slot(id)?;
        self.nodes[slot].branch_properties.insert(name.to_string(), value);
        Ok(())
    }

    pub fn branch_property(&self, id: NodeId, name: &str) -> Result<Option<&Property>> {
        Ok(self.node(id)?.branch_properties.get(name))
    }

    pub fn remove_branch_property(&mut self, id: NodeId, name: &str) -> Result<Option<Property>> {
        let slot = self.slot(id)?;
        Ok(self.nodes[slot].branch_properties.remove(name))
    }

    pub fn branch_property_names(&self, id: NodeId) -> Result<Vec<String>> {
        Ok(self.node(id)?.branch_properties.keys().cloned().collect())
    }

    // ---------------------------------------------------------------------
    // Topology edits
    // ---------------------------------------------------------------------

    /// Exchange the sons at positions `i` and `j` of `parent`.
    pub fn swap_nodes(&mut self, parent: NodeId, i: usize, j: usize) -> Result<()> {
        let slot = self.slot(parent)?;
        let n = self.nodes[slot].sons.len();
        if i >= n || j >= n {
            return Err(PhyloError::invalid_input(format!(
                "cannot swap sons {i} and {j} of node {parent} with {n} sons"
            )));
        }
        self.nodes[slot].sons.swap(i, j);
        self.reindex();
        Ok(())
    }

    /// Move the subtree rooted at `id` below `new_father`, as its last son.
    ///
    /// The branch length and branch properties travel with the subtree.
    pub fn regraft(&mut self, id: NodeId, new_father: NodeId) -> Result<()> {
        let slot = self.slot(id)?;
        let target = self.slot(new_father)?;
        let father = self.nodes[slot].father.ok_or(PhyloError::NodeIsRoot(id))?;
        if self.preorder_slots(slot).contains(&target) {
            return Err(PhyloError::InvalidTopology(format!(
                "cannot move node {id} below its own descendant {new_father}"
            )));
        }
        self.detach(father, slot);
        self.attach(target, slot);
        self.reindex();
        Ok(())
    }

    /// Remove the root of a rooted tree, merging the two branches below it.
    ///
    /// Returns `Ok(false)` without touching the tree when the root joins two
    /// leaves, since the result would be a single branch.
    pub fn unroot(&mut self) -> Result<bool> {
        if !self.is_rooted() {
            return Err(PhyloError::UnrootedTree);
        }
        let root = self.root;
        let (mut son1, mut son2) = (self.nodes[root].sons[0], self.nodes[root].sons[1]);
        if self.nodes[son1].sons.is_empty() && self.nodes[son2].sons.is_empty() {
            return Ok(false);
        }
        // Keep a subtree in position 0
        if self.nodes[son1].sons.is_empty() {
            self.nodes[root].sons.swap(0, 1);
            std::mem::swap(&mut son1, &mut son2);
        }
        if let Some(d1) = self.nodes[son1].distance_to_father.take() {
            let merged = self.nodes[son2].distance_to_father.map_or(d1, |d2| d1 + d2);
            self.nodes[son2].distance_to_father = Some(merged);
        }

        self.nodes[root].sons.clear();
        self.nodes[son1].father = None;
        self.attach(son1, son2);
        self.release(root);
        self.root = son1;
        self.reindex();
        Ok(true)
    }

    /// Reroot the tree at `id` by reversing every branch on the path from
    /// the current root. Lengths and branch properties slide along the path.
    pub fn root_at(&mut self, id: NodeId) -> Result<()> {
        let mut new_root = self.slot(id)?;
        if new_root == self.root {
            return Ok(());
        }
        if self.is_rooted() {
            self.unroot()?;
            // The requested node may have been the root that was just removed
            new_root = self.slot(id)?;
            if new_root == self.root {
                return Ok(());
            }
        }

        let mut path = vec![new_root];
        let mut slot = new_root;
        while let Some(f) = self.nodes[slot].father {
            path.push(f);
            slot = f;
        }
        path.reverse();

        for pair in path.windows(2) {
            let (upper, lower) = (pair[0], pair[1]);
            self.nodes[upper].distance_to_father = self.nodes[lower].distance_to_father;
            self.detach(upper, lower);
            self.attach(lower, upper);
            let props = std::mem::take(&mut self.nodes[lower].branch_properties);
            self.nodes[upper].branch_properties = props;
        }
        self.nodes[new_root].distance_to_father = None;
        self.nodes[new_root].branch_properties.clear();
        self.root = new_root;
        self.reindex();
        Ok(())
    }

    /// Reroot so that `id` is one of the two sons of the root. Its former
    /// branch length is split in half between the two root branches.
    pub fn new_out_group(&mut self, id: NodeId) -> Result<()> {
        let out_group = self.slot(id)?;
        if out_group == self.root {
            return Ok(());
        }
        let root_id = if self.is_rooted() {
            if self.nodes[self.root].sons.contains(&out_group) {
                return Ok(());
            }
            let root_id = self.root_id();
            self.unroot()?;
            root_id
        } else {
            self.next_id()
        };

        let father = self.nodes[out_group].father.ok_or(PhyloError::NodeIsRoot(id))?;
        let father_id = self.nodes[father].id;
        self.root_at(father_id)?;

        let old_root = self.root;
        self.detach(old_root, out_group);
        let new_root = self.alloc(Node::new(root_id, None));
        self.attach(new_root, old_root);
        self.attach(new_root, out_group);
        if let Some(d) = self.nodes[out_group].distance_to_father {
            self.nodes[out_group].distance_to_father = Some(d / 2.0);
            self.nodes[old_root].distance_to_father = Some(d / 2.0);
        }
        self.root = new_root;
        self.reindex();
        Ok(())
    }

    /// Assign ids `0..n` in pre-order.
    pub fn reset_nodes_id(&mut self) {
        for (i, slot) in self.preorder_slots(self.root).into_iter().enumerate() {
            self.nodes[slot].id = i as NodeId;
        }
        self.reindex();
    }

    /// Copy of the subtree rooted at `id` as a new tree.
    pub fn clone_subtree(&self, id: NodeId) -> Result<Tree> {
        let from = self.slot(id)?;
        let slots = self.preorder_slots(from);
        let new_slot: HashMap<usize, usize> =
            slots.iter().enumerate().map(|(i, &s)| (s, i)).collect();
        let nodes = slots
            .iter()
            .map(|&s| {
                let mut node = self.nodes[s].clone();
                node.father = node.father.and_then(|f| new_slot.get(&f).copied());
                node.sons = node.sons.iter().map(|c| new_slot[c]).collect();
                node
            })
            .collect();
        let mut tree = Tree {
            nodes,
            root: 0,
            name: self.name.clone(),
            index: HashMap::new(),
            free: Vec::new(),
        };
        tree.reindex();
        Ok(tree)
    }

    // ---------------------------------------------------------------------
    // Topology comparison
    // ---------------------------------------------------------------------

    fn leaf_count(&self, slot: usize) -> usize {
        self.preorder_slots(slot)
            .into_iter()
            .filter(|&s| self.nodes[s].sons.is_empty())
            .count()
    }

    /// Canonical string ignoring son order: names plus the sorted strings of
    /// the sons.
    fn canonical(&self, slot: usize, memo: &mut HashMap<usize, String>) -> String {
        if let Some(s) = memo.get(&slot) {
            return s.clone();
        }
        let node = &self.nodes[slot];
        let mut repr = node.name.clone().unwrap_or_default();
        if !node.sons.is_empty() {
            let mut sons: Vec<String> = node
                .sons
                .clone()
                .into_iter()
                .map(|s| self.canonical(s, memo))
                .collect();
            sons.sort();
            repr = format!("({}){}", sons.join(","), repr);
        }
        memo.insert(slot, repr.clone());
        repr
    }

    /// Sort the sons of every node by (leaf count, canonical subtree string).
    pub fn order_tree(&mut self) {
        let mut memo = HashMap::new();
        for slot in self.preorder_slots(self.root) {
            let mut keyed: Vec<(usize, String, usize)> = self.nodes[slot]
                .sons
                .clone()
                .into_iter()
                .map(|s| (self.leaf_count(s), self.canonical(s, &mut memo), s))
                .collect();
            keyed.sort();
            self.nodes[slot].sons = keyed.into_iter().map(|(_, _, s)| s).collect();
        }
        self.reindex();
    }

    fn same_ordered_topology(&self, a: usize, other: &Tree, b: usize) -> bool {
        let (na, nb) = (&self.nodes[a], &other.nodes[b]);
        na.name == nb.name
            && na.sons.len() == nb.sons.len()
            && na
                .sons
                .iter()
                .zip(&nb.sons)
                .all(|(&sa, &sb)| self.same_ordered_topology(sa, other, sb))
    }

    /// Compare topologies, ignoring ids, lengths and properties. Unless
    /// `ordered`, both trees are copied and canonically ordered first.
    pub fn has_same_topology_as(&self, other: &Tree, ordered: bool) -> bool {
        if ordered {
            return self.same_ordered_topology(self.root, other, other.root);
        }
        let mut t1 = self.clone();
        let mut t2 = other.clone();
        t1.order_tree();
        t2.order_tree();
        t1.same_ordered_topology(t1.root, &t2, t2.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// ((A,B),(C,D)) with ids A=0, B=1, C=2, D=3, AB=4, CD=5, root=6
    fn balanced() -> Tree {
        let structure = vec![
            (6, None),
            (4, Some(6)),
            (0, Some(4)),
            (1, Some(4)),
            (5, Some(6)),
            (2, Some(5)),
            (3, Some(5)),
        ];
        let lengths = vec![0.0, 0.1, 0.2, 0.3, 0.4, 0.5, 0.6];
        let names = ["A", "B", "C", "D"].iter().map(|s| s.to_string()).collect();
        Tree::from_structure(structure, lengths, names, vec![0, 1, 2, 3]).unwrap()
    }

    #[test]
    fn test_from_structure() {
        let tree = balanced();
        assert_eq!(tree.root_id(), 6);
        assert_eq!(tree.number_of_nodes(), 7);
        assert_eq!(tree.number_of_leaves(), 4);
        assert_eq!(tree.sons_id(6).unwrap(), vec![4, 5]);
        assert_eq!(tree.father_id(2).unwrap(), Some(5));
        assert_eq!(tree.neighbors_id(4).unwrap(), vec![6, 0, 1]);
        assert_eq!(tree.leaf_id("C").unwrap(), 2);
        assert!(tree.is_rooted());
        assert!(!tree.is_multifurcating());
    }

    #[test]
    fn test_from_structure_rejects_bad_input() {
        let err = Tree::from_structure(
            vec![(0, None), (1, None)],
            vec![0.0, 0.0],
            vec![],
            vec![],
        )
        .unwrap_err();
        assert!(matches!(err, PhyloError::InvalidTopology(_)));

        let err = Tree::from_structure(
            vec![(0, None), (0, Some(0))],
            vec![0.0, 0.0],
            vec![],
            vec![],
        )
        .unwrap_err();
        assert_eq!(err, PhyloError::NonUniqueId(0));

        let err = Tree::from_structure(vec![(0, None), (1, Some(9))], vec![0.0, 0.1], vec![], vec![])
            .unwrap_err();
        assert_eq!(err, PhyloError::NodeNotFound(9));
    }

    #[test]
    fn test_node_lookup_errors() {
        let mut tree = balanced();
        assert_eq!(tree.node(42).unwrap_err(), PhyloError::NodeNotFound(42));
        tree.set_node_id(3, 2).unwrap();
        assert_eq!(tree.node_unique(2).unwrap_err(), PhyloError::NonUniqueId(2));
        // Non-checked lookup returns the first node in pre-order
        assert_eq!(tree.node(2).unwrap().name(), Some("C"));
    }

    #[test]
    fn test_unroot_merges_root_branches() {
        let mut tree = balanced();
        assert!(tree.unroot().unwrap());
        assert!(!tree.is_rooted());
        assert_eq!(tree.root_id(), 4);
        assert_eq!(tree.sons_id(4).unwrap(), vec![0, 1, 5]);
        approx::assert_abs_diff_eq!(tree.distance_to_father(5).unwrap().unwrap(), 0.5, epsilon = 1e-12);
        assert_eq!(tree.number_of_nodes(), 6);
        assert_eq!(tree.unroot().unwrap_err(), PhyloError::UnrootedTree);
    }

    #[test]
    fn test_unroot_two_leaves_fails() {
        let mut tree = Tree::with_root(0, None);
        tree.add_son(0, 1, Some("A"), Some(0.1)).unwrap();
        tree.add_son(0, 2, Some("B"), Some(0.2)).unwrap();
        assert!(!tree.unroot().unwrap());
        assert_eq!(tree.number_of_nodes(), 3);
        assert_eq!(tree.root_id(), 0);
    }

    #[test]
    fn test_root_at_moves_lengths() {
        let mut tree = balanced();
        tree.unroot().unwrap();
        tree.set_branch_property(5, "label", Property::Text("cd".into()))
            .unwrap();
        tree.root_at(5).unwrap();
        assert_eq!(tree.root_id(), 5);
        assert_eq!(tree.father_id(4).unwrap(), Some(5));
        approx::assert_abs_diff_eq!(tree.distance_to_father(4).unwrap().unwrap(), 0.5, epsilon = 1e-12);
        assert_eq!(tree.distance_to_father(5).unwrap(), None);
        assert_eq!(
            tree.branch_property(4, "label").unwrap(),
            Some(&Property::Text("cd".into()))
        );
        assert_eq!(tree.branch_property(5, "label").unwrap(), None);
        assert_eq!(tree.sons_id(5).unwrap(), vec![2, 3, 4]);
    }

    #[test]
    fn test_new_out_group_splits_length() {
        let mut tree = balanced();
        tree.new_out_group(0).unwrap();
        assert!(tree.is_rooted());
        assert_eq!(tree.root_id(), 6);
        let sons = tree.sons_id(6).unwrap();
        assert!(sons.contains(&0));
        approx::assert_abs_diff_eq!(tree.distance_to_father(0).unwrap().unwrap(), 0.1, epsilon = 1e-12);
        let other = sons.into_iter().find(|&s| s != 0).unwrap();
        approx::assert_abs_diff_eq!(tree.distance_to_father(other).unwrap().unwrap(), 0.1, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(tree.total_length(), 2.1, epsilon = 1e-9);
    }

    #[test]
    fn test_reset_nodes_id_is_dense() {
        let mut tree = balanced();
        tree.new_out_group(2).unwrap();
        tree.reset_nodes_id();
        let mut ids = tree.nodes_id();
        ids.sort();
        assert_eq!(ids, (0..tree.number_of_nodes() as NodeId).collect::<Vec<_>>());
        assert_eq!(tree.root_id(), 0);
    }

    #[test]
    fn test_topology_comparison() {
        let tree = balanced();
        let mut swapped = balanced();
        swapped.swap_nodes(6, 0, 1).unwrap();
        swapped.swap_nodes(4, 0, 1).unwrap();
        assert!(!tree.has_same_topology_as(&swapped, true));
        assert!(tree.has_same_topology_as(&swapped, false));

        let mut moved = balanced();
        moved.regraft(1, 5).unwrap();
        assert!(!tree.has_same_topology_as(&moved, false));
    }

    #[test]
    fn test_regraft_rejects_own_subtree() {
        let mut tree = balanced();
        assert!(matches!(tree.regraft(4, 0), Err(PhyloError::InvalidTopology(_))));
        assert_eq!(tree.regraft(6, 0).unwrap_err(), PhyloError::NodeIsRoot(6));
    }

    #[test]
    fn test_clone_subtree() {
        let tree = balanced();
        let sub = tree.clone_subtree(5).unwrap();
        assert_eq!(sub.root_id(), 5);
        assert_eq!(sub.leaves_names(), vec!["C".to_string(), "D".to_string()]);
        assert_eq!(sub.father_id(5).unwrap(), None);
    }
}
