//! Rooted binary time trees.
//!
//! Nodes live in a flat arena: tips occupy indices `0..tip_count()` in the
//! order of their taxa, internal nodes follow. Topology edits only rewire
//! parent/child links, so node indices stay stable for the whole run.
//! Every node also caches the set of tips below it ([`TipSet`]); the cache
//! is part of the stored state and comes back bit-for-bit on restore.

use serde::{Deserialize, Serialize};

use crate::{
    error::{McmcError, Result},
    state::Stored,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub parent: Option<usize>,
    pub children: [Option<usize>; 2],
    pub height: f64,
}

impl TreeNode {
    fn tip(height: f64) -> TreeNode {
        TreeNode {
            parent: None,
            children: [None, None],
            height,
        }
    }
}

/// Bitset over tip indices, one bit per taxon.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TipSet {
    words: Vec<u64>,
}

impl TipSet {
    pub fn empty(tip_count: usize) -> TipSet {
        TipSet {
            words: vec![0; tip_count.div_ceil(64)],
        }
    }

    pub fn from_tips(tip_count: usize, tips: impl IntoIterator<Item = usize>) -> TipSet {
        let mut set = TipSet::empty(tip_count);
        tips.into_iter().for_each(|tip| set.insert(tip));
        set
    }

    pub fn insert(&mut self, tip: usize) {
        self.words[tip / 64] |= 1u64 << (tip % 64);
    }

    pub fn contains(&self, tip: usize) -> bool {
        self.words
            .get(tip / 64)
            .is_some_and(|word| word & (1u64 << (tip % 64)) != 0)
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    pub fn union_with(&mut self, other: &TipSet) {
        self.words
            .iter_mut()
            .zip(other.words.iter())
            .for_each(|(a, b)| *a |= b);
    }

    pub fn is_subset(&self, other: &TipSet) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .all(|(a, b)| a & !b == 0)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Topology {
    nodes: Vec<TreeNode>,
    root: usize,
    clades: Vec<TipSet>,
}

/// Serializable copy of a tree's topology and heights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub name: String,
    pub taxa: Vec<String>,
    pub nodes: Vec<TreeNode>,
    pub root: usize,
}

#[derive(Debug, Clone)]
pub struct Tree {
    name: String,
    taxa: Vec<String>,
    state: Topology,
    stored: Stored<Topology>,
}

impl Tree {
    /// Build a tree from an arena of nodes. Tips must come first.
    pub fn from_nodes(
        name: impl Into<String>,
        taxa: Vec<String>,
        nodes: Vec<TreeNode>,
        root: usize,
    ) -> Result<Tree> {
        let mut tree = Tree {
            name: name.into(),
            taxa,
            state: Topology {
                nodes,
                root,
                clades: Vec::new(),
            },
            stored: Stored::Committed,
        };
        tree.check_structure()?;
        tree.rebuild_clades();
        Ok(tree)
    }

    /// Parse a rooted binary tree from Newick text.
    ///
    /// Branch lengths are converted to node heights with the deepest tip at
    /// height zero. Missing branch lengths count as zero.
    pub fn from_newick(name: impl Into<String>, newick: &str) -> Result<Tree> {
        let raw = NewickParser::new(newick).parse()?;
        let (taxa, nodes, root) = raw.into_arena()?;
        Tree::from_nodes(name, taxa, nodes, root)
    }

    pub fn from_snapshot(snapshot: &TreeSnapshot) -> Result<Tree> {
        Tree::from_nodes(
            snapshot.name.clone(),
            snapshot.taxa.clone(),
            snapshot.nodes.clone(),
            snapshot.root,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn taxa(&self) -> &[String] {
        &self.taxa
    }

    pub fn taxon_index(&self, taxon: &str) -> Option<usize> {
        self.taxa.iter().position(|t| t == taxon)
    }

    pub fn tip_count(&self) -> usize {
        self.taxa.len()
    }

    pub fn node_count(&self) -> usize {
        self.state.nodes.len()
    }

    pub fn nodes(&self) -> &[TreeNode] {
        &self.state.nodes
    }

    pub fn root(&self) -> usize {
        self.state.root
    }

    pub fn is_root(&self, node: usize) -> bool {
        self.state.root == node
    }

    pub fn is_tip(&self, node: usize) -> bool {
        node < self.taxa.len()
    }

    pub fn internal_nodes(&self) -> std::ops::Range<usize> {
        self.taxa.len()..self.state.nodes.len()
    }

    pub fn parent(&self, node: usize) -> Option<usize> {
        self.state.nodes[node].parent
    }

    pub fn children(&self, node: usize) -> impl Iterator<Item = usize> + '_ {
        self.state.nodes[node].children.iter().flatten().copied()
    }

    pub fn height(&self, node: usize) -> f64 {
        self.state.nodes[node].height
    }

    /// The child of `parent` that is not `child`.
    pub fn other_child(&self, parent: usize, child: usize) -> Option<usize> {
        self.children(parent).find(|&c| c != child)
    }

    /// Tips below (and including) `node`.
    pub fn clade(&self, node: usize) -> &TipSet {
        &self.state.clades[node]
    }

    /// Whether some node has exactly `tips` below it.
    pub fn is_monophyletic(&self, tips: &TipSet) -> bool {
        self.state.clades.iter().any(|clade| clade == tips)
    }

    /// Most recent common ancestor of a set of tips.
    pub fn mrca(&self, tips: &TipSet) -> usize {
        let mut node = self.state.root;
        'descend: loop {
            for child in self.children(node) {
                if tips.is_subset(&self.state.clades[child]) {
                    node = child;
                    continue 'descend;
                }
            }
            return node;
        }
    }

    /// Heights are ordered along every branch and links are consistent.
    pub fn is_valid(&self) -> bool {
        let nodes = &self.state.nodes;
        nodes.iter().enumerate().all(|(idx, node)| {
            if !node.height.is_finite() {
                return false;
            }
            let parent_ok = match node.parent {
                None => idx == self.state.root,
                Some(parent) => nodes[parent].height >= node.height,
            };
            let children_ok = node
                .children
                .iter()
                .flatten()
                .all(|&child| nodes[child].parent == Some(idx));
            parent_ok && children_ok
        })
    }

    pub fn set_height(&mut self, node: usize, height: f64) {
        self.state.nodes[node].height = height;
    }

    /// Detach `child` from `parent`. The parent keeps an empty child slot
    /// until [`Tree::add_child`] fills it again.
    pub fn remove_child(&mut self, parent: usize, child: usize) {
        let slot = self.state.nodes[parent]
            .children
            .iter_mut()
            .find(|slot| **slot == Some(child));
        assert!(slot.is_some(), "node {child} is not a child of {parent}");
        if let Some(slot) = slot {
            *slot = None;
        }
        self.state.nodes[child].parent = None;
    }

    pub fn add_child(&mut self, parent: usize, child: usize) {
        let slot = self.state.nodes[parent]
            .children
            .iter_mut()
            .find(|slot| slot.is_none());
        assert!(slot.is_some(), "node {parent} already has two children");
        if let Some(slot) = slot {
            *slot = Some(child);
        }
        self.state.nodes[child].parent = Some(parent);
    }

    pub fn set_root(&mut self, root: usize) {
        self.state.root = root;
        self.state.nodes[root].parent = None;
    }

    /// Swap the subtrees below `i` and `j`, where `i_parent` and `j_parent`
    /// are their parents.
    pub fn exchange(&mut self, i: usize, j: usize, i_parent: usize, j_parent: usize) {
        self.remove_child(i_parent, i);
        self.remove_child(j_parent, j);
        self.add_child(j_parent, i);
        self.add_child(i_parent, j);
    }

    pub fn snapshot(&self) -> TreeSnapshot {
        TreeSnapshot {
            name: self.name.clone(),
            taxa: self.taxa.clone(),
            nodes: self.state.nodes.clone(),
            root: self.state.root,
        }
    }

    pub fn to_newick(&self) -> String {
        let mut out = String::new();
        self.write_newick(self.state.root, &mut out);
        out.push(';');
        out
    }

    fn write_newick(&self, node: usize, out: &mut String) {
        if !self.is_tip(node) {
            out.push('(');
            for (k, child) in self.children(node).enumerate() {
                if k > 0 {
                    out.push(',');
                }
                self.write_newick(child, out);
            }
            out.push(')');
        } else {
            out.push_str(&self.taxa[node]);
        }
        if let Some(parent) = self.parent(node) {
            out.push_str(&format!(":{}", self.height(parent) - self.height(node)));
        }
    }

    pub(crate) fn rebuild_clades(&mut self) {
        let tip_count = self.taxa.len();
        let mut clades = vec![TipSet::empty(tip_count); self.state.nodes.len()];
        let mut order = Vec::with_capacity(self.state.nodes.len());
        let mut stack = vec![self.state.root];
        while let Some(node) = stack.pop() {
            order.push(node);
            stack.extend(self.children(node));
        }
        for &node in order.iter().rev() {
            if self.is_tip(node) {
                clades[node].insert(node);
            } else {
                let mut set = TipSet::empty(tip_count);
                for child in self.children(node) {
                    set.union_with(&clades[child]);
                }
                clades[node] = set;
            }
        }
        self.state.clades = clades;
    }

    pub(crate) fn load(&mut self, snapshot: &TreeSnapshot) -> Result<()> {
        if snapshot.taxa != self.taxa || snapshot.nodes.len() != self.state.nodes.len() {
            return Err(McmcError::CheckpointLayout(format!(
                "tree {} does not match the stored tree shape",
                self.name
            )));
        }
        self.state.nodes = snapshot.nodes.clone();
        self.state.root = snapshot.root;
        self.check_structure()?;
        self.rebuild_clades();
        Ok(())
    }

    pub(crate) fn store(&mut self) {
        self.stored.store(self.state.clone());
    }

    pub(crate) fn restore(&mut self) -> bool {
        match self.stored.take() {
            Some(shadow) => {
                self.state = shadow;
                true
            }
            None => false,
        }
    }

    pub(crate) fn accept(&mut self) {
        self.stored.accept();
    }

    pub(crate) fn is_stored(&self) -> bool {
        self.stored.is_pending()
    }

    fn check_structure(&self) -> Result<()> {
        let tips = self.taxa.len();
        let nodes = &self.state.nodes;
        if tips < 2 {
            return Err(McmcError::InvalidTree("need at least two tips".into()));
        }
        if nodes.len() != 2 * tips - 1 {
            return Err(McmcError::InvalidTree(format!(
                "a binary tree with {tips} tips has {} nodes, found {}",
                2 * tips - 1,
                nodes.len()
            )));
        }
        if self.state.root >= nodes.len() || nodes[self.state.root].parent.is_some() {
            return Err(McmcError::InvalidTree("root has a parent".into()));
        }
        for (idx, node) in nodes.iter().enumerate() {
            let n_children = node.children.iter().flatten().count();
            let expected = if idx < tips { 0 } else { 2 };
            if n_children != expected {
                return Err(McmcError::InvalidTree(format!(
                    "node {idx} has {n_children} children, expected {expected}"
                )));
            }
            if idx != self.state.root && node.parent.is_none() {
                return Err(McmcError::InvalidTree(format!("node {idx} is detached")));
            }
        }
        if !self.is_valid() {
            return Err(McmcError::InvalidTree(
                "node heights are not ordered along the branches".into(),
            ));
        }
        Ok(())
    }
}

struct RawNode {
    name: Option<String>,
    length: f64,
    children: Vec<usize>,
}

struct RawTree {
    nodes: Vec<RawNode>,
    root: usize,
}

impl RawTree {
    fn into_arena(self) -> Result<(Vec<String>, Vec<TreeNode>, usize)> {
        let tip_ids: Vec<usize> = (0..self.nodes.len())
            .filter(|&i| self.nodes[i].children.is_empty())
            .collect();
        let internal_ids: Vec<usize> = (0..self.nodes.len())
            .filter(|&i| !self.nodes[i].children.is_empty())
            .collect();

        let mut new_index = vec![0usize; self.nodes.len()];
        for (k, &old) in tip_ids.iter().chain(internal_ids.iter()).enumerate() {
            new_index[old] = k;
        }

        let mut taxa = Vec::with_capacity(tip_ids.len());
        for &old in tip_ids.iter() {
            let name = self.nodes[old]
                .name
                .clone()
                .ok_or_else(|| McmcError::Newick("tip without a name".into()))?;
            if taxa.contains(&name) {
                return Err(McmcError::Newick(format!("duplicate taxon {name}")));
            }
            taxa.push(name);
        }

        let mut depth = vec![0f64; self.nodes.len()];
        let mut stack = vec![self.root];
        while let Some(node) = stack.pop() {
            for &child in self.nodes[node].children.iter() {
                depth[child] = depth[node] + self.nodes[child].length;
                stack.push(child);
            }
        }
        let max_depth = tip_ids
            .iter()
            .map(|&i| depth[i])
            .fold(f64::NEG_INFINITY, f64::max);

        let mut nodes = vec![TreeNode::tip(0.); self.nodes.len()];
        for (old, raw) in self.nodes.iter().enumerate() {
            if !raw.children.is_empty() && raw.children.len() != 2 {
                return Err(McmcError::Newick(format!(
                    "node with {} children, only binary trees are supported",
                    raw.children.len()
                )));
            }
            let idx = new_index[old];
            let mut height = max_depth - depth[old];
            if height.abs() < 1e-10 {
                height = 0.;
            }
            nodes[idx].height = height;
            for (slot, &child) in raw.children.iter().enumerate() {
                nodes[idx].children[slot] = Some(new_index[child]);
                nodes[new_index[child]].parent = Some(idx);
            }
        }
        Ok((taxa, nodes, new_index[self.root]))
    }
}

struct NewickParser<'a> {
    input: &'a [u8],
    pos: usize,
    nodes: Vec<RawNode>,
}

impl<'a> NewickParser<'a> {
    fn new(input: &'a str) -> Self {
        NewickParser {
            input: input.as_bytes(),
            pos: 0,
            nodes: Vec::new(),
        }
    }

    fn parse(mut self) -> Result<RawTree> {
        let root = self.parse_subtree()?;
        self.skip_whitespace();
        if self.peek() != Some(b';') {
            return Err(McmcError::Newick("expected ';' at the end".into()));
        }
        Ok(RawTree {
            nodes: self.nodes,
            root,
        })
    }

    fn parse_subtree(&mut self) -> Result<usize> {
        self.skip_whitespace();
        let mut children = Vec::new();
        if self.peek() == Some(b'(') {
            self.pos += 1;
            loop {
                children.push(self.parse_subtree()?);
                self.skip_whitespace();
                match self.peek() {
                    Some(b',') => self.pos += 1,
                    Some(b')') => {
                        self.pos += 1;
                        break;
                    }
                    _ => return Err(McmcError::Newick(format!("unexpected input at {}", self.pos))),
                }
            }
        }
        self.skip_whitespace();
        let name = self.parse_name();
        self.skip_whitespace();
        let length = if self.peek() == Some(b':') {
            self.pos += 1;
            self.parse_length()?
        } else {
            0.
        };
        self.nodes.push(RawNode {
            name,
            length,
            children,
        });
        Ok(self.nodes.len() - 1)
    }

    fn parse_name(&mut self) -> Option<String> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if matches!(c, b':' | b',' | b')' | b'(' | b';') || c.is_ascii_whitespace() {
                break;
            }
            self.pos += 1;
        }
        (self.pos > start)
            .then(|| String::from_utf8_lossy(&self.input[start..self.pos]).into_owned())
    }

    fn parse_length(&mut self) -> Result<f64> {
        self.skip_whitespace();
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || matches!(c, b'.' | b'-' | b'+' | b'e' | b'E') {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = std::str::from_utf8(&self.input[start..self.pos])
            .map_err(|_| McmcError::Newick("branch length is not valid UTF-8".into()))?;
        text.parse::<f64>()
            .map_err(|_| McmcError::Newick(format!("invalid branch length '{text}'")))
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(|c| c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }
}
