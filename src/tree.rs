//! Document tree model shared by the indexer, router and retriever.
//!
//! A [`DocumentIndex`] owns a single [`TreeNode`] root; every node owns its
//! children by value. There are no parent pointers: ancestry is recovered
//! from dotted section numbers (see [`crate::retriever::ancestry_context`]).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Id conventionally given to the synthetic root of every tree.
pub const ROOT_ID: &str = "root";

/// The five kinds of source document the system knows about.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Rulebook,
    PenaltyGuidelines,
    LegalCardList,
    RulingsCompendium,
    CardDatabase,
}

impl DocumentType {
    pub const ALL: [DocumentType; 5] = [
        DocumentType::Rulebook,
        DocumentType::PenaltyGuidelines,
        DocumentType::LegalCardList,
        DocumentType::RulingsCompendium,
        DocumentType::CardDatabase,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rulebook => "rulebook",
            Self::PenaltyGuidelines => "penalty_guidelines",
            Self::LegalCardList => "legal_card_list",
            Self::RulingsCompendium => "rulings_compendium",
            Self::CardDatabase => "card_database",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DocumentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown document type '{s}'"))
    }
}

/// Section-level annotations attached to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub document_type: DocumentType,
    /// Dotted section number such as `1.2.a`, empty when the heading had none.
    pub section_number: String,
    pub title: String,
}

impl NodeMetadata {
    pub fn new(document_type: DocumentType) -> Self {
        Self {
            document_type,
            section_number: String::new(),
            title: String::new(),
        }
    }
}

/// One section of a document.
///
/// `content` holds only the section's own paragraphs, never its
/// descendants' text, and `token_count` is computed over that content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub id: String,
    pub content: String,
    pub metadata: NodeMetadata,
    pub token_count: usize,
    #[serde(default)]
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    pub fn new(id: impl Into<String>, metadata: NodeMetadata) -> Self {
        Self {
            id: id.into(),
            content: String::new(),
            metadata,
            token_count: 0,
            children: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn is_root(&self) -> bool {
        self.id == ROOT_ID
    }

    /// Iterate over this node and all of its descendants, depth-first,
    /// pre-order.
    ///
    /// # Examples
    ///
    /// ```
    /// use pokeprof::tree::{DocumentType, NodeMetadata, TreeNode};
    ///
    /// let meta = NodeMetadata::new(DocumentType::Rulebook);
    /// let mut root = TreeNode::new("root", meta.clone());
    /// let mut a = TreeNode::new("a", meta.clone());
    /// a.children.push(TreeNode::new("a1", meta.clone()));
    /// root.children.push(a);
    /// root.children.push(TreeNode::new("b", meta));
    ///
    /// let ids: Vec<_> = root.walk().map(|n| n.id.as_str()).collect();
    /// assert_eq!(ids, ["root", "a", "a1", "b"]);
    /// ```
    pub fn walk(&self) -> Walk<'_> {
        Walk { stack: vec![self] }
    }

    /// Find the first node (in walk order) with the given id.
    pub fn find(&self, id: &str) -> Option<&TreeNode> {
        self.walk().find(|node| node.id == id)
    }

    /// Number of nodes in this subtree, including `self`.
    pub fn node_count(&self) -> usize {
        self.walk().count()
    }
}

/// Pre-order iterator returned by [`TreeNode::walk`].
#[derive(Debug, Clone)]
pub struct Walk<'a> {
    stack: Vec<&'a TreeNode>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = &'a TreeNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.children.iter().rev());
        Some(node)
    }
}

/// A complete indexed document, the unit that gets persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentIndex {
    pub document_name: String,
    pub document_type: DocumentType,
    pub total_tokens: usize,
    /// SHA-256 of the markdown that produced this index; empty until stamped.
    #[serde(default)]
    pub source_hash: String,
    pub root: TreeNode,
}

impl DocumentIndex {
    pub fn new(
        document_name: impl Into<String>,
        document_type: DocumentType,
        root: TreeNode,
    ) -> Self {
        let total_tokens = root.walk().map(|n| n.token_count).sum();
        Self {
            document_name: document_name.into(),
            document_type,
            total_tokens,
            source_hash: String::new(),
            root,
        }
    }
}

/// A section selected for a query, borrowed from its owning index.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedSection<'a> {
    pub node: &'a TreeNode,
    /// Relevance, higher is better. Direct card matches score 2.0, descent
    /// hits 1.0, in-document cross-references 0.5.
    pub score: f64,
    pub document_name: String,
    pub errata_context: Vec<String>,
}

impl<'a> RetrievedSection<'a> {
    pub fn new(
        node: &'a TreeNode,
        score: f64,
        document_name: impl Into<String>,
    ) -> Self {
        Self {
            node,
            score,
            document_name: document_name.into(),
            errata_context: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, children: Vec<TreeNode>) -> TreeNode {
        let mut n = TreeNode::new(id, NodeMetadata::new(DocumentType::Rulebook));
        n.children = children;
        n
    }

    fn sample_tree() -> TreeNode {
        node(
            "root",
            vec![
                node("A", vec![node("A1", vec![]), node("A2", vec![])]),
                node("B", vec![node("B1", vec![]), node("B2", vec![])]),
            ],
        )
    }

    #[test]
    fn walk_is_depth_first_pre_order() {
        let root = sample_tree();
        let ids: Vec<_> = root.walk().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, ["root", "A", "A1", "A2", "B", "B1", "B2"]);
    }

    #[test]
    fn walk_is_restartable() {
        let root = sample_tree();
        let first: Vec<_> = root.walk().map(|n| n.id.clone()).collect();
        let second: Vec<_> = root.walk().map(|n| n.id.clone()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn walk_of_leaf_yields_itself() {
        let leaf = node("only", vec![]);
        assert_eq!(leaf.walk().count(), 1);
        assert!(leaf.is_leaf());
    }

    #[test]
    fn find_locates_nested_node() {
        let root = sample_tree();
        assert_eq!(root.find("B2").map(|n| n.id.as_str()), Some("B2"));
        assert!(root.find("C").is_none());
        assert_eq!(root.node_count(), 7);
    }

    #[test]
    fn total_tokens_sums_every_node() {
        let mut root = sample_tree();
        root.children[0].token_count = 3;
        root.children[1].children[1].token_count = 4;
        let index = DocumentIndex::new("rulebook", DocumentType::Rulebook, root);
        assert_eq!(index.total_tokens, 7);
        assert!(index.source_hash.is_empty());
    }

    #[test]
    fn document_type_parses_known_strings_only() {
        for t in DocumentType::ALL {
            assert_eq!(t.as_str().parse::<DocumentType>().unwrap(), t);
        }
        assert!("glossary".parse::<DocumentType>().is_err());
    }

    #[test]
    fn document_type_serializes_as_snake_case() {
        let json = serde_json::to_string(&DocumentType::PenaltyGuidelines).unwrap();
        assert_eq!(json, "\"penalty_guidelines\"");
        assert!(serde_json::from_str::<DocumentType>("\"glossary\"").is_err());
    }
}
