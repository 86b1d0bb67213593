#![forbid(unsafe_code)]

//! Node sets for canonicalization and transforms.
//!
//! A `NodeSet` is a subset of nodes from one document, identified by
//! node index.  It supports the set operations needed by XPath Filter
//! 2.0 and the enveloped-signature transform.

use std::collections::HashSet;

/// Stable numeric index of a `roxmltree` node within its document.
pub fn node_index(node: roxmltree::Node<'_, '_>) -> usize {
    node.id().get() as usize
}

/// A set of document nodes.
#[derive(Debug, Clone, Default)]
pub struct NodeSet {
    nodes: HashSet<usize>,
}

impl NodeSet {
    /// Create an empty node set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a node set from raw node indices.
    pub fn from_ids(ids: HashSet<usize>) -> Self {
        Self { nodes: ids }
    }

    /// All nodes in the document.
    pub fn all(doc: &roxmltree::Document<'_>) -> Self {
        Self {
            nodes: doc.descendants().map(node_index).collect(),
        }
    }

    /// All nodes except comments.  Per the W3C DSig spec, `URI=""`
    /// selects the document without comments.
    pub fn all_without_comments(doc: &roxmltree::Document<'_>) -> Self {
        Self {
            nodes: doc
                .descendants()
                .filter(|n| !n.is_comment())
                .map(node_index)
                .collect(),
        }
    }

    /// The subtree rooted at `root`, excluding comment nodes.
    pub fn tree_without_comments(root: roxmltree::Node<'_, '_>) -> Self {
        Self {
            nodes: root
                .descendants()
                .filter(|n| !n.is_comment())
                .map(node_index)
                .collect(),
        }
    }

    /// The subtree rooted at `root`, including comment nodes.
    pub fn tree_with_comments(root: roxmltree::Node<'_, '_>) -> Self {
        Self {
            nodes: root.descendants().map(node_index).collect(),
        }
    }

    pub fn contains(&self, node: &roxmltree::Node<'_, '_>) -> bool {
        self.nodes.contains(&node_index(*node))
    }

    pub fn contains_id(&self, id: usize) -> bool {
        self.nodes.contains(&id)
    }

    pub fn insert(&mut self, node: &roxmltree::Node<'_, '_>) {
        self.nodes.insert(node_index(*node));
    }

    pub fn remove(&mut self, node: &roxmltree::Node<'_, '_>) {
        self.nodes.remove(&node_index(*node));
    }

    pub fn remove_id(&mut self, id: usize) {
        self.nodes.remove(&id);
    }

    pub fn intersection(&self, other: &NodeSet) -> NodeSet {
        NodeSet {
            nodes: self.nodes.intersection(&other.nodes).copied().collect(),
        }
    }

    pub fn union(&self, other: &NodeSet) -> NodeSet {
        NodeSet {
            nodes: self.nodes.union(&other.nodes).copied().collect(),
        }
    }

    /// self − other.
    pub fn subtract(&self, other: &NodeSet) -> NodeSet {
        NodeSet {
            nodes: self.nodes.difference(&other.nodes).copied().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_ids(&self) -> &HashSet<usize> {
        &self.nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_operations() {
        let a = NodeSet::from_ids([1, 2, 3].into_iter().collect());
        let b = NodeSet::from_ids([2, 3, 4].into_iter().collect());
        assert_eq!(a.intersection(&b).len(), 2);
        assert_eq!(a.union(&b).len(), 4);
        assert_eq!(a.subtract(&b).len(), 1);
        assert!(a.subtract(&b).contains_id(1));
    }

    #[test]
    fn tree_collectors_respect_comments() {
        let doc = roxmltree::Document::parse("<a><!--c--><b/></a>").unwrap();
        let root = doc.root_element();
        let with = NodeSet::tree_with_comments(root);
        let without = NodeSet::tree_without_comments(root);
        assert_eq!(with.len(), without.len() + 1);
    }

    #[test]
    fn all_without_comments_drops_top_level_comment() {
        let doc = roxmltree::Document::parse("<!--top--><a/>").unwrap();
        let all = NodeSet::all(&doc);
        let no_comments = NodeSet::all_without_comments(&doc);
        assert_eq!(all.len(), no_comments.len() + 1);
    }
}
