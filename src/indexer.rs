//! Markdown to [`DocumentIndex`] conversion, persistence and validation.
//!
//! Headings `#` through `######` open sections. A heading whose text starts
//! with a dotted number (`3.1.a Retreating`) records that number as the
//! section's id and strips it from the title. Everything between two
//! headings is the content of the nearest open section.

use std::{collections::HashSet, path::Path, sync::LazyLock};

use regex::Regex;
use sha2::{Digest, Sha256};
use tiktoken_rs::CoreBPE;

use crate::{
    error::{Error, Result},
    fs,
    tree::{DocumentIndex, DocumentType, NodeMetadata, ROOT_ID, TreeNode},
};

const MAX_SLUG_CHARS: usize = 40;

static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(#{1,6})\s+(.*)").expect("heading pattern is valid"));
static SECTION_NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,3}(?:\.\d+)*(?:\.[a-z](?:\.\d+)*)?)[.\s]\s*(.*)")
        .expect("section number pattern is valid")
});

/// `o200k_base`, the encoding gpt-4o-mini uses.
static ENCODING: LazyLock<CoreBPE> =
    LazyLock::new(|| tiktoken_rs::o200k_base().expect("o200k_base encoding is bundled"));

/// Number of `o200k_base` tokens in `text`. Special-token markers are
/// counted as ordinary text.
pub fn count_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    ENCODING.encode_ordinary(text).len()
}

/// Hex-encoded SHA-256 of a byte slice.
pub fn content_hash(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Hex-encoded SHA-256 of a file's contents.
pub fn file_hash(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(content_hash(&bytes))
}

/// A section still accepting content and children.
struct OpenSection {
    level: usize,
    node: TreeNode,
    lines: Vec<String>,
}

impl OpenSection {
    fn new(level: usize, node: TreeNode) -> Self {
        Self {
            level,
            node,
            lines: Vec::new(),
        }
    }

    fn push_line(&mut self, line: &str) {
        if !line.trim().is_empty() {
            self.lines.push(line.to_string());
        } else if !self.lines.is_empty() {
            self.lines.push(String::new());
        }
    }

    fn close(mut self) -> TreeNode {
        if !self.lines.is_empty() {
            let content = self.lines.join("\n").trim().to_string();
            self.node.token_count = count_tokens(&content);
            self.node.content = content;
        }
        self.node
    }
}

/// Pop the innermost open section and attach it to its parent.
fn close_innermost(stack: &mut Vec<OpenSection>) {
    if stack.len() < 2 {
        return;
    }
    if let Some(section) = stack.pop() {
        let node = section.close();
        if let Some(parent) = stack.last_mut() {
            parent.node.children.push(node);
        }
    }
}

fn unique_id(base: String, seen: &mut HashSet<String>) -> String {
    if seen.insert(base.clone()) {
        return base;
    }
    let mut counter = 1;
    loop {
        let candidate = format!("{base}_{counter}");
        if seen.insert(candidate.clone()) {
            return candidate;
        }
        counter += 1;
    }
}

fn slug(title: &str) -> String {
    title
        .to_lowercase()
        .replace(' ', "_")
        .chars()
        .take(MAX_SLUG_CHARS)
        .collect()
}

/// Build a tree from parser-produced markdown.
///
/// Text before the first heading belongs to the root. Heading levels that
/// skip (h1 straight to h3) nest under the nearest shallower section.
pub fn index_document(
    markdown: &str,
    document_name: &str,
    document_type: DocumentType,
) -> DocumentIndex {
    let mut root_meta = NodeMetadata::new(document_type);
    root_meta.title = document_name.to_string();
    let mut stack = vec![OpenSection::new(0, TreeNode::new(ROOT_ID, root_meta))];

    let mut seen = HashSet::from([ROOT_ID.to_string()]);

    for line in markdown.split('\n') {
        let Some(caps) = HEADING_RE.captures(line) else {
            if let Some(top) = stack.last_mut() {
                top.push_line(line);
            }
            continue;
        };

        let level = caps[1].len();
        let heading = caps[2].trim().to_string();

        let (section_number, title) = match SECTION_NUMBER_RE.captures(&heading) {
            Some(sc) => {
                let rest = sc[2].trim();
                let title = if rest.is_empty() { heading.clone() } else { rest.to_string() };
                (sc[1].to_string(), title)
            }
            None => (String::new(), heading.clone()),
        };

        let base = if section_number.is_empty() {
            slug(&heading)
        } else {
            section_number.clone()
        };
        let id = unique_id(base, &mut seen);

        while stack.len() > 1 && stack.last().is_some_and(|s| s.level >= level) {
            close_innermost(&mut stack);
        }

        let metadata = NodeMetadata {
            document_type,
            section_number,
            title,
        };
        stack.push(OpenSection::new(level, TreeNode::new(id, metadata)));
    }

    while stack.len() > 1 {
        close_innermost(&mut stack);
    }
    let root = match stack.pop() {
        Some(section) => section.close(),
        None => TreeNode::new(ROOT_ID, NodeMetadata::new(document_type)),
    };

    let index = DocumentIndex::new(document_name, document_type, root);
    tracing::debug!(
        document = document_name,
        nodes = index.root.node_count(),
        tokens = index.total_tokens,
        "indexed document"
    );
    index
}

/// Read a markdown file and index it.
pub fn index_file(
    path: &Path,
    document_name: &str,
    document_type: DocumentType,
) -> Result<DocumentIndex> {
    let markdown = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound {
                kind: "markdown",
                name: path.display().to_string(),
            }
        } else {
            Error::Io(e)
        }
    })?;
    Ok(index_document(&markdown, document_name, document_type))
}

/// Persist an index as pretty JSON, atomically.
pub fn save_tree(index: &DocumentIndex, path: &Path) -> Result<()> {
    fs::write_json_atomic(path, index)
}

/// Load a previously saved index.
pub fn load_tree(path: &Path) -> Result<DocumentIndex> {
    let file = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::NotFound {
                kind: "index",
                name: path.display().to_string(),
            });
        }
        Err(e) => return Err(Error::Io(e)),
    };

    serde_json::from_str(&content).map_err(|e| {
        use serde_json::error::Category;
        match e.classify() {
            Category::Data => Error::InvalidStructure {
                file,
                message: e.to_string(),
            },
            Category::Io | Category::Syntax | Category::Eof => Error::CorruptIndex {
                file,
                message: e.to_string(),
            },
        }
    })
}

/// Check a tree for duplicate ids and, optionally, section numbers that do
/// not match `pattern` at their start. Returns human-readable issues.
pub fn validate_tree(index: &DocumentIndex, pattern: Option<&Regex>) -> Vec<String> {
    let mut issues = Vec::new();
    let mut seen = HashSet::new();

    for node in index.root.walk() {
        if !seen.insert(node.id.as_str()) {
            issues.push(format!("Duplicate node ID: {}", node.id));
        }
        let number = &node.metadata.section_number;
        let Some(re) = pattern else { continue };
        if !number.is_empty() && !re.find(number).is_some_and(|m| m.start() == 0) {
            issues.push(format!(
                "Section number '{number}' doesn't match pattern '{}'",
                re.as_str()
            ));
        }
    }

    issues
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const RULEBOOK: &str = "\
# 1 Game Overview
Two players battle.

## 1.1 Winning
Take all prize cards.

## 1.2 Setup
Shuffle your deck.

# 2 Turn Structure
## 2.1 Draw
Draw a card.
";

    fn ids(index: &DocumentIndex) -> Vec<&str> {
        index.root.walk().map(|n| n.id.as_str()).collect()
    }

    #[test]
    fn builds_nested_sections_from_numbered_headings() {
        let index = index_document(RULEBOOK, "rulebook", DocumentType::Rulebook);

        assert_eq!(ids(&index), ["root", "1", "1.1", "1.2", "2", "2.1"]);
        assert_eq!(index.root.metadata.title, "rulebook");
        assert!(index.root.content.is_empty());

        let overview = &index.root.children[0];
        assert_eq!(overview.metadata.title, "Game Overview");
        assert_eq!(overview.metadata.section_number, "1");
        assert_eq!(overview.content, "Two players battle.");
        assert_eq!(overview.children.len(), 2);
        assert_eq!(index.root.children[1].children[0].content, "Draw a card.");
    }

    #[test]
    fn lettered_subsections_are_recognised() {
        let md = "# 3.1.a Retreating\nPay the cost.\n";
        let index = index_document(md, "rulebook", DocumentType::Rulebook);
        let node = &index.root.children[0];
        assert_eq!(node.id, "3.1.a");
        assert_eq!(node.metadata.title, "Retreating");
    }

    #[test]
    fn unnumbered_headings_get_slug_ids() {
        let md = "# Special Conditions\nasleep\n# Special Conditions\nburned\n";
        let index = index_document(md, "rulebook", DocumentType::Rulebook);
        assert_eq!(ids(&index), ["root", "special_conditions", "special_conditions_1"]);
        assert!(index.root.children[0].metadata.section_number.is_empty());
    }

    #[test]
    fn heading_named_root_does_not_collide() {
        let md = "# Root\ntext\n";
        let index = index_document(md, "rulebook", DocumentType::Rulebook);
        assert_eq!(index.root.children[0].id, "root_1");
    }

    #[test]
    fn slug_is_truncated_to_forty_chars() {
        let heading = "a".repeat(60);
        let index = index_document(&format!("# {heading}\n"), "doc", DocumentType::Rulebook);
        assert_eq!(index.root.children[0].id.len(), 40);
    }

    #[test]
    fn skipped_levels_nest_under_nearest_shallower() {
        let md = "# A\n### Deep\ntext\n## Mid\n";
        let index = index_document(md, "doc", DocumentType::Rulebook);
        let a = &index.root.children[0];
        assert_eq!(a.children.len(), 2);
        assert_eq!(a.children[0].id, "deep");
        assert_eq!(a.children[1].id, "mid");
    }

    #[test]
    fn leading_blank_lines_are_dropped_and_inner_ones_kept() {
        let md = "# A\n\n\nfirst\n\nsecond\n\n";
        let index = index_document(md, "doc", DocumentType::Rulebook);
        assert_eq!(index.root.children[0].content, "first\n\nsecond");
    }

    #[test]
    fn preamble_belongs_to_root() {
        let md = "intro line\n# A\nbody\n";
        let index = index_document(md, "doc", DocumentType::Rulebook);
        assert_eq!(index.root.content, "intro line");
    }

    #[test]
    fn seven_hashes_is_not_a_heading() {
        let md = "# A\n####### not a heading\n";
        let index = index_document(md, "doc", DocumentType::Rulebook);
        assert_eq!(index.root.node_count(), 2);
        assert_eq!(index.root.children[0].content, "####### not a heading");
    }

    #[test]
    fn empty_markdown_is_root_only() {
        let index = index_document("", "doc", DocumentType::LegalCardList);
        assert_eq!(index.root.node_count(), 1);
        assert_eq!(index.total_tokens, 0);
    }

    #[test]
    fn token_counts_follow_o200k_base() {
        assert_eq!(count_tokens(""), 0);
        assert_eq!(count_tokens("hello world"), 2);
        assert_eq!(count_tokens("a b c d e f g h"), 8);
    }

    #[test]
    fn long_words_split_into_several_tokens() {
        assert!(count_tokens("supercalifragilisticexpialidocious") > 1);
    }

    #[test]
    fn special_token_text_is_counted_not_rejected() {
        assert!(count_tokens("<|endoftext|>") > 1);
    }

    #[test]
    fn node_token_count_covers_own_content_only() {
        let md = "# A
hello world
## B
a b c d e f g h
";
        let index = index_document(md, "doc", DocumentType::Rulebook);
        assert_eq!(index.root.children[0].token_count, 2);
        assert_eq!(index.root.children[0].children[0].token_count, 8);
        assert_eq!(index.total_tokens, 10);
    }

    #[test]
    fn save_then_load_preserves_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("indexes").join("rulebook.json");
        let mut index = index_document(RULEBOOK, "rulebook", DocumentType::Rulebook);
        index.source_hash = content_hash(RULEBOOK.as_bytes());

        save_tree(&index, &path).unwrap();
        let loaded = load_tree(&path).unwrap();
        assert_eq!(loaded, index);

        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn load_missing_index_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let err = load_tree(&tmp.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "index", .. }));
    }

    #[test]
    fn load_malformed_json_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("rulebook.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = load_tree(&path).unwrap_err();
        assert!(matches!(err, Error::CorruptIndex { ref file, .. } if file == "rulebook.json"));
    }

    #[test]
    fn load_wrong_shape_is_invalid_structure() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("rulebook.json");
        std::fs::write(&path, r#"{"document_name": "rulebook"}"#).unwrap();
        assert!(matches!(
            load_tree(&path).unwrap_err(),
            Error::InvalidStructure { .. }
        ));
    }

    #[test]
    fn load_unknown_document_type_is_invalid_structure() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("doc.json");
        let index = index_document("# A\n", "doc", DocumentType::Rulebook);
        let json = serde_json::to_string(&index)
            .unwrap()
            .replace("\"rulebook\"", "\"glossary\"");
        std::fs::write(&path, json).unwrap();
        assert!(matches!(
            load_tree(&path).unwrap_err(),
            Error::InvalidStructure { .. }
        ));
    }

    #[test]
    fn validate_reports_duplicate_ids() {
        let mut index = index_document(RULEBOOK, "rulebook", DocumentType::Rulebook);
        index.root.children[1].id = "1".into();
        let issues = validate_tree(&index, None);
        assert_eq!(issues, ["Duplicate node ID: 1"]);
    }

    #[test]
    fn validate_checks_pattern_from_start() {
        let index = index_document(RULEBOOK, "rulebook", DocumentType::Rulebook);
        let only_ones = Regex::new(r"1").unwrap();
        let issues = validate_tree(&index, Some(&only_ones));
        assert_eq!(
            issues,
            [
                "Section number '2' doesn't match pattern '1'",
                "Section number '2.1' doesn't match pattern '1'",
            ]
        );
    }

    #[test]
    fn indexed_tree_is_valid() {
        let index = index_document(RULEBOOK, "rulebook", DocumentType::Rulebook);
        let pattern = Regex::new(r"\d+(\.\d+)*").unwrap();
        assert!(validate_tree(&index, Some(&pattern)).is_empty());
    }

    #[test]
    fn file_hash_matches_content_hash() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.md");
        std::fs::write(&path, "abc").unwrap();
        assert_eq!(
            file_hash(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    proptest! {
        #[test]
        fn indexed_ids_are_unique(
            headings in prop::collection::vec(
                (1usize..=6, prop::sample::select(vec!["Setup", "1.2 Draw", "Attack", "3 Energy"])),
                0..30,
            )
        ) {
            let md: String = headings
                .iter()
                .map(|(level, text)| format!("{} {text}\nbody\n", "#".repeat(*level)))
                .collect();
            let index = index_document(&md, "doc", DocumentType::Rulebook);
            prop_assert!(validate_tree(&index, None).is_empty());
            prop_assert_eq!(index.root.node_count(), headings.len() + 1);
        }

        #[test]
        fn total_tokens_equals_sum_of_node_tokens(
            body in "[a-z \n#]{0,300}"
        ) {
            let index = index_document(&body, "doc", DocumentType::Rulebook);
            let sum: usize = index.root.walk().map(|n| n.token_count).sum();
            prop_assert_eq!(index.total_tokens, sum);
        }
    }

    fn arb_leaf() -> impl Strategy<Value = TreeNode> {
        (
            "[a-z0-9_]{1,12}",
            prop::option::of("[0-9]{1,3}(\\.[0-9]{1,2}){0,2}(\\.[a-z])?"),
            "[A-Za-z ]{0,20}",
            "[a-zA-Z0-9 .,:\n]{0,80}",
            prop::sample::select(DocumentType::ALL.to_vec()),
        )
            .prop_map(|(id, number, title, content, document_type)| {
                let metadata = NodeMetadata {
                    document_type,
                    section_number: number.unwrap_or_default(),
                    title,
                };
                let mut node = TreeNode::new(id, metadata);
                node.token_count = count_tokens(&content);
                node.content = content;
                node
            })
    }

    fn arb_tree() -> impl Strategy<Value = TreeNode> {
        arb_leaf().prop_recursive(6, 64, 4, |inner| {
            (arb_leaf(), prop::collection::vec(inner, 0..4)).prop_map(|(mut node, children)| {
                node.children = children;
                node
            })
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn save_load_round_trips_arbitrary_trees(
            root in arb_tree(),
            hash in prop::option::of("[0-9a-f]{64}"),
        ) {
            let tmp = tempfile::tempdir().unwrap();
            let path = tmp.path().join("doc.json");
            let mut index = DocumentIndex::new("doc", root.metadata.document_type, root);
            index.source_hash = hash.unwrap_or_default();

            save_tree(&index, &path).unwrap();
            let loaded = load_tree(&path).unwrap();

            let before: Vec<&TreeNode> = index.root.walk().collect();
            let after: Vec<&TreeNode> = loaded.root.walk().collect();
            prop_assert_eq!(before, after);
            prop_assert_eq!(loaded.total_tokens, index.total_tokens);
            prop_assert_eq!(&loaded.source_hash, &index.source_hash);
            prop_assert_eq!(loaded, index);
        }
    }
}
