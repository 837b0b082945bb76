//! Building and listing the stored section indexes.

use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::Serialize;

use crate::{
    config::DocumentSource,
    data_dir::{DataDir, NON_INDEX_STEMS},
    error::{Error, Result},
    indexer::{file_hash, index_file, load_tree, save_tree, validate_tree},
    tree::{DocumentType, TreeNode},
};

/// How many validation issues are logged per document.
const LOGGED_ISSUES: usize = 5;

/// What happened to one document during an ingest run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Indexed {
        nodes: usize,
        tokens: usize,
        issues: Vec<String>,
    },
    /// The stored index already matches the markdown hash.
    UpToDate,
    MissingMarkdown,
    Failed(String),
}

impl IngestOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Index every document in `catalog`, or only `selection` when given.
///
/// Documents are processed in parallel and reported in catalog order. A
/// failure in one document is recorded in its outcome and never stops the
/// others.
pub fn ingest_documents(
    data_dir: &DataDir,
    catalog: &BTreeMap<String, DocumentSource>,
    selection: Option<&str>,
    force: bool,
) -> Result<Vec<(String, IngestOutcome)>> {
    let targets: Vec<(&String, &DocumentSource)> = match selection {
        Some(name) => {
            let (key, source) =
                catalog
                    .get_key_value(name)
                    .ok_or_else(|| Error::NotFound {
                        kind: "document",
                        name: name.to_string(),
                    })?;
            vec![(key, source)]
        }
        None => catalog.iter().collect(),
    };

    // Resolve (and create) the indexes folder once, up front.
    data_dir.indexes_dir()?;

    let outcomes = targets
        .par_iter()
        .map(|(name, source)| {
            let outcome = match ingest_one(data_dir, name, source, force) {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(document = %name, error = %e, "ingest failed");
                    IngestOutcome::Failed(e.to_string())
                }
            };
            ((*name).clone(), outcome)
        })
        .collect();
    Ok(outcomes)
}

fn ingest_one(
    data_dir: &DataDir,
    name: &str,
    source: &DocumentSource,
    force: bool,
) -> Result<IngestOutcome> {
    let markdown = data_dir.intermediate_dir().join(&source.markdown);
    if !markdown.exists() {
        tracing::warn!(
            document = %name,
            path = %markdown.display(),
            "markdown not found, skipping"
        );
        return Ok(IngestOutcome::MissingMarkdown);
    }

    let index_path = data_dir.index_path(name)?;
    let current_hash = file_hash(&markdown)?;

    if !force && index_path.exists() {
        match load_tree(&index_path) {
            Ok(existing) if existing.source_hash == current_hash => {
                tracing::info!(document = %name, "up to date");
                return Ok(IngestOutcome::UpToDate);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(document = %name, error = %e, "stored index unreadable, re-indexing");
            }
        }
    }

    tracing::info!(document = %name, "indexing");
    let mut index = index_file(&markdown, name, source.document_type)?;
    index.source_hash = current_hash;
    save_tree(&index, &index_path)?;

    let issues = validate_tree(&index, None);
    if !issues.is_empty() {
        tracing::warn!(document = %name, count = issues.len(), "validation issues");
        for issue in issues.iter().take(LOGGED_ISSUES) {
            tracing::warn!(document = %name, "{issue}");
        }
    }

    let nodes = index.root.node_count();
    tracing::info!(
        document = %name,
        nodes,
        tokens = index.total_tokens,
        path = %index_path.display(),
        "index written"
    );
    Ok(IngestOutcome::Indexed {
        nodes,
        tokens: index.total_tokens,
        issues,
    })
}

/// One persisted index, as shown by `pokeprof indexes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexSummary {
    pub name: String,
    pub document_type: DocumentType,
    pub node_count: usize,
    pub total_tokens: usize,
}

/// Summarise every document tree under the indexes folder, sorted by name.
///
/// Side files (the card-name lookup and the overlay manifest) are skipped.
/// Unreadable trees are logged and left out.
pub fn list_indexes(data_dir: &DataDir) -> Result<Vec<IndexSummary>> {
    let dir = data_dir.indexes_dir()?;
    let mut summaries = Vec::new();

    for entry in std::fs::read_dir(&dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if NON_INDEX_STEMS.contains(&stem) {
            continue;
        }

        match load_tree(&path) {
            Ok(index) => summaries.push(IndexSummary {
                name: stem.to_string(),
                document_type: index.document_type,
                node_count: index.root.node_count(),
                total_tokens: index.total_tokens,
            }),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable index");
            }
        }
    }

    summaries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(summaries)
}

/// Render a subtree as an indented outline, without section content.
pub fn outline(node: &TreeNode) -> String {
    let mut out = String::new();
    push_outline(node, 0, &mut out);
    out
}

fn push_outline(node: &TreeNode, depth: usize, out: &mut String) {
    let meta = &node.metadata;
    let label = match (meta.section_number.is_empty(), meta.title.is_empty()) {
        (true, true) => node.id.clone(),
        (true, false) => meta.title.clone(),
        (false, true) => meta.section_number.clone(),
        (false, false) => format!("{} {}", meta.section_number, meta.title),
    };
    out.push_str(&format!(
        "{:indent$}{label} [{}] ({} tokens)\n",
        "",
        node.id,
        node.token_count,
        indent = depth * 2
    ));
    for child in &node.children {
        push_outline(child, depth + 1, out);
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::indexer::index_document;

    const RULES: &str = "# 1. Setup\nShuffle your deck.\n## 1.1. Mulligan\nReveal and reshuffle.\n";

    fn setup(markdown: &[(&str, &str)]) -> (tempfile::TempDir, DataDir) {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = DataDir::resolve(Some(tmp.path())).unwrap();
        let intermediate = data_dir.intermediate_dir();
        fs::create_dir_all(&intermediate).unwrap();
        for (file, body) in markdown {
            fs::write(intermediate.join(file), body).unwrap();
        }
        (tmp, data_dir)
    }

    fn catalog(entries: &[(&str, &str, DocumentType)]) -> BTreeMap<String, DocumentSource> {
        entries
            .iter()
            .map(|(name, file, ty)| {
                (
                    name.to_string(),
                    DocumentSource {
                        markdown: file.to_string(),
                        document_type: *ty,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn ingest_writes_stamped_index() {
        let (_tmp, data_dir) = setup(&[("rules.md", RULES)]);
        let cat = catalog(&[("rulebook", "rules.md", DocumentType::Rulebook)]);

        let outcomes = ingest_documents(&data_dir, &cat, None, false).unwrap();
        assert_eq!(outcomes.len(), 1);
        match &outcomes[0].1 {
            IngestOutcome::Indexed { nodes, issues, .. } => {
                assert_eq!(*nodes, 3);
                assert!(issues.is_empty());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let saved = load_tree(&data_dir.index_path("rulebook").unwrap()).unwrap();
        let md = data_dir.intermediate_dir().join("rules.md");
        assert_eq!(saved.source_hash, file_hash(&md).unwrap());
    }

    #[test]
    fn second_run_is_up_to_date() {
        let (_tmp, data_dir) = setup(&[("rules.md", RULES)]);
        let cat = catalog(&[("rulebook", "rules.md", DocumentType::Rulebook)]);

        ingest_documents(&data_dir, &cat, None, false).unwrap();
        let outcomes = ingest_documents(&data_dir, &cat, None, false).unwrap();
        assert_eq!(outcomes[0].1, IngestOutcome::UpToDate);
    }

    #[test]
    fn force_reindexes_unchanged_markdown() {
        let (_tmp, data_dir) = setup(&[("rules.md", RULES)]);
        let cat = catalog(&[("rulebook", "rules.md", DocumentType::Rulebook)]);

        ingest_documents(&data_dir, &cat, None, false).unwrap();
        let outcomes = ingest_documents(&data_dir, &cat, None, true).unwrap();
        assert!(matches!(outcomes[0].1, IngestOutcome::Indexed { .. }));
    }

    #[test]
    fn changed_markdown_is_reindexed() {
        let (_tmp, data_dir) = setup(&[("rules.md", RULES)]);
        let cat = catalog(&[("rulebook", "rules.md", DocumentType::Rulebook)]);
        ingest_documents(&data_dir, &cat, None, false).unwrap();

        let md = data_dir.intermediate_dir().join("rules.md");
        fs::write(&md, format!("{RULES}## 1.2. Prizes\nSet aside six cards.\n")).unwrap();

        let outcomes = ingest_documents(&data_dir, &cat, None, false).unwrap();
        match &outcomes[0].1 {
            IngestOutcome::Indexed { nodes, .. } => assert_eq!(*nodes, 4),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn corrupt_index_is_rebuilt() {
        let (_tmp, data_dir) = setup(&[("rules.md", RULES)]);
        let cat = catalog(&[("rulebook", "rules.md", DocumentType::Rulebook)]);
        fs::write(data_dir.index_path("rulebook").unwrap(), "{ not json").unwrap();

        let outcomes = ingest_documents(&data_dir, &cat, None, false).unwrap();
        assert!(matches!(outcomes[0].1, IngestOutcome::Indexed { .. }));
        assert!(load_tree(&data_dir.index_path("rulebook").unwrap()).is_ok());
    }

    #[test]
    fn missing_markdown_does_not_stop_other_documents() {
        let (_tmp, data_dir) = setup(&[("rules.md", RULES)]);
        let cat = catalog(&[
            ("rulebook", "rules.md", DocumentType::Rulebook),
            ("penalty_guidelines", "absent.md", DocumentType::PenaltyGuidelines),
        ]);

        let outcomes = ingest_documents(&data_dir, &cat, None, false).unwrap();
        let by_name: BTreeMap<_, _> = outcomes.into_iter().collect();
        assert_eq!(by_name["penalty_guidelines"], IngestOutcome::MissingMarkdown);
        assert!(matches!(by_name["rulebook"], IngestOutcome::Indexed { .. }));
    }

    #[test]
    fn selection_limits_ingest_to_one_document() {
        let (_tmp, data_dir) = setup(&[("rules.md", RULES), ("pg.md", RULES)]);
        let cat = catalog(&[
            ("rulebook", "rules.md", DocumentType::Rulebook),
            ("penalty_guidelines", "pg.md", DocumentType::PenaltyGuidelines),
        ]);

        let outcomes = ingest_documents(&data_dir, &cat, Some("rulebook"), false).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].0, "rulebook");
        assert!(!data_dir.index_path("penalty_guidelines").unwrap().exists());
    }

    #[test]
    fn unknown_selection_is_an_error() {
        let (_tmp, data_dir) = setup(&[]);
        let cat = catalog(&[("rulebook", "rules.md", DocumentType::Rulebook)]);

        let err = ingest_documents(&data_dir, &cat, Some("glossary"), false).unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "document", .. }));
    }

    #[test]
    fn list_indexes_skips_side_files_and_corrupt_trees() {
        let (_tmp, data_dir) = setup(&[]);
        let index = index_document(RULES, "rulebook", DocumentType::Rulebook);
        save_tree(&index, &data_dir.index_path("rulebook").unwrap()).unwrap();
        fs::write(data_dir.card_name_index().unwrap(), r#"{"pikachu":"card_db_pokemon"}"#).unwrap();
        fs::write(data_dir.overlay_manifest().unwrap(), r#"{"card_errata":{}}"#).unwrap();
        fs::write(data_dir.index_path("broken").unwrap(), "[").unwrap();
        fs::write(data_dir.indexes_dir().unwrap().join("notes.txt"), "x").unwrap();

        let summaries = list_indexes(&data_dir).unwrap();
        assert_eq!(
            summaries,
            vec![IndexSummary {
                name: "rulebook".into(),
                document_type: DocumentType::Rulebook,
                node_count: 3,
                total_tokens: index.total_tokens,
            }]
        );
    }

    #[test]
    fn outline_indents_by_depth_and_omits_content() {
        let index = index_document(RULES, "rulebook", DocumentType::Rulebook);
        let text = outline(&index.root);
        let lines: Vec<_> = text.lines().collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("rulebook [root]"));
        assert!(lines[1].starts_with("  1 Setup"));
        assert!(lines[2].starts_with("    1.1 Mulligan"));
        assert!(!text.contains("Shuffle your deck"));
    }

    #[test]
    fn outline_has_one_terminated_line_per_node() {
        let index = index_document(RULES, "rulebook", DocumentType::Rulebook);
        let text = outline(&index.root);

        assert!(text.ends_with('\n'));
        assert_eq!(text.lines().count(), index.root.node_count());
        for node in index.root.walk() {
            let expected = format!("[{}] ({} tokens)", node.id, node.token_count);
            assert!(text.lines().any(|l| l.ends_with(&expected)), "missing {expected}");
        }
    }
}
