//! Tree-descent retrieval over one or more [`DocumentIndex`]es.
//!
//! With an oracle, search starts at the root and repeatedly asks which
//! children are relevant, broadening breadth-first. Without one, every
//! section is scored by query-word overlap. Either way the results are then
//! expanded with the sections they reference by number.

use std::{
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    sync::{Arc, LazyLock},
};

use regex::Regex;

use crate::{
    error::{Error, Result},
    oracle::{RankingOracle, child_previews, default_model},
    tree::{DocumentIndex, DocumentType, RetrievedSection, TreeNode},
};

const DESCENT_SCORE: f64 = 1.0;
const CROSS_REFERENCE_SCORE: f64 = 0.5;
const CARD_MATCH_SCORE: f64 = 2.0;
const CROSS_DOCUMENT_DISCOUNT: f64 = 0.7;
const CROSS_DOCUMENT_PULL: usize = 3;
const FALLBACK_CHILDREN: usize = 3;
const MIN_PER_DOCUMENT: usize = 3;

static CROSS_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:see\s+)?(?:rule|section)\s+(\d{1,3}(?:\.\d+)*(?:\.[a-z](?:\.\d+)*)?)")
        .expect("cross reference pattern is valid")
});

static CROSS_DOC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)(?:as\s+(?:defined|described|outlined|specified)\s+in\s+(?:the\s+)?",
        r"|see\s+(?:the\s+)?|refer\s+to\s+(?:the\s+)?)",
        r"(rulebook|rules?\s+(?:and\s+)?regulations|penalty\s+guidelines",
        r"|legal\s+card\s+list|standard\s+(?:legal\s+)?list)",
    ))
    .expect("cross document pattern is valid")
});

/// Canonical document name for a phrase matched by the cross-document
/// pattern.
fn canonical_document(phrase: &str) -> Option<&'static str> {
    match phrase.trim().to_lowercase().as_str() {
        "rulebook" | "rule and regulations" | "rules and regulations" | "rules regulations" => {
            Some("rulebook")
        }
        "penalty guidelines" => Some("penalty_guidelines"),
        "legal card list" | "standard list" | "standard legal list" => Some("legal_card_list"),
        _ => None,
    }
}

/// Section number to node. Later duplicates shadow earlier ones.
pub type SectionLookup<'a> = HashMap<&'a str, &'a TreeNode>;

pub fn build_lookup(index: &DocumentIndex) -> SectionLookup<'_> {
    index
        .root
        .walk()
        .filter(|node| !node.metadata.section_number.is_empty())
        .map(|node| (node.metadata.section_number.as_str(), node))
        .collect()
}

/// Breadcrumb such as `1. Setup > 1.2. Draw` built from the node's dotted
/// section number. Unnumbered nodes have no breadcrumb.
pub fn ancestry_context(node: &TreeNode, lookup: &SectionLookup<'_>) -> String {
    let number = &node.metadata.section_number;
    if number.is_empty() {
        return String::new();
    }

    let parts: Vec<&str> = number.split('.').collect();
    (1..=parts.len())
        .map(|depth| {
            let prefix = parts[..depth].join(".");
            match lookup.get(prefix.as_str()) {
                Some(ancestor) if !ancestor.metadata.title.is_empty() => {
                    format!("{prefix}. {}", ancestor.metadata.title)
                }
                _ => prefix,
            }
        })
        .collect::<Vec<_>>()
        .join(" > ")
}

fn query_words(query: &str) -> HashSet<String> {
    query.to_lowercase().split_whitespace().map(str::to_string).collect()
}

fn word_matches(words: &HashSet<String>, node: &TreeNode) -> usize {
    let text = format!("{} {}", node.metadata.title, node.content).to_lowercase();
    words.iter().filter(|w| text.contains(w.as_str())).count()
}

/// Deterministic child selection: children sharing at least one query word
/// with their title or content, most matches first, at most three.
pub fn keyword_select_children<'a>(node: &'a TreeNode, query: &str) -> Vec<&'a TreeNode> {
    let words = query_words(query);
    let mut scored: Vec<(usize, &TreeNode)> = node
        .children
        .iter()
        .map(|child| (word_matches(&words, child), child))
        .filter(|(matches, _)| *matches > 0)
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored
        .into_iter()
        .take(FALLBACK_CHILDREN)
        .map(|(_, child)| child)
        .collect()
}

/// Append sections referenced by number from the existing results.
///
/// Referenced nodes already present are skipped, and expansion stops once
/// `max_sections` results exist.
pub fn resolve_cross_references<'a>(
    mut sections: Vec<RetrievedSection<'a>>,
    lookup: &SectionLookup<'a>,
    document_name: &str,
    max_sections: usize,
) -> Vec<RetrievedSection<'a>> {
    let mut present: HashSet<&str> = sections.iter().map(|s| s.node.id.as_str()).collect();
    let mut added = Vec::new();

    'sections: for section in &sections {
        for caps in CROSS_REF_RE.captures_iter(&section.node.content) {
            if sections.len() + added.len() >= max_sections {
                break 'sections;
            }
            let Some(target) = lookup.get(&caps[1]).copied() else {
                continue;
            };
            if present.insert(target.id.as_str()) {
                tracing::debug!(from = %section.node.id, to = %target.id, "following cross reference");
                added.push(RetrievedSection::new(target, CROSS_REFERENCE_SCORE, document_name));
            }
        }
    }

    sections.extend(added);
    sections
}

/// Documents named in the results' content that none of the results come
/// from.
pub fn detect_cross_doc_references(sections: &[RetrievedSection<'_>]) -> BTreeSet<String> {
    let represented: HashSet<&str> = sections.iter().map(|s| s.document_name.as_str()).collect();
    sections
        .iter()
        .flat_map(|s| CROSS_DOC_RE.captures_iter(&s.node.content))
        .filter_map(|caps| canonical_document(&caps[1]))
        .filter(|name| !represented.contains(name))
        .map(str::to_string)
        .collect()
}

/// Sections whose title equals one of `names`, ignoring case.
pub fn search_by_card_names<'a>(
    names: &[String],
    index: &'a DocumentIndex,
) -> Vec<RetrievedSection<'a>> {
    let wanted: HashSet<String> = names.iter().map(|n| n.to_lowercase()).collect();
    index
        .root
        .walk()
        .filter(|node| !node.is_root())
        .filter(|node| wanted.contains(&node.metadata.title.to_lowercase()))
        .map(|node| RetrievedSection::new(node, CARD_MATCH_SCORE, &index.document_name))
        .collect()
}

/// Drop repeated `(document_name, node id)` pairs, keeping the first, then
/// order by score and truncate.
pub fn merge_sections<'a>(
    sections: Vec<RetrievedSection<'a>>,
    max_sections: usize,
) -> Vec<RetrievedSection<'a>> {
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut unique: Vec<RetrievedSection<'a>> = sections
        .into_iter()
        .filter(|s| seen.insert((s.document_name.clone(), s.node.id.clone())))
        .collect();
    unique.sort_by(|a, b| b.score.total_cmp(&a.score));
    unique.truncate(max_sections);
    unique
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub max_sections: usize,
    pub model: String,
    /// Descend with the ranking oracle rather than scoring every section.
    pub use_llm: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            max_sections: 5,
            model: default_model(),
            use_llm: true,
        }
    }
}

impl SearchOptions {
    fn with_max(&self, max_sections: usize) -> Self {
        Self {
            max_sections,
            ..self.clone()
        }
    }
}

#[derive(Clone, Default)]
pub struct Retriever {
    oracle: Option<Arc<dyn RankingOracle>>,
}

impl Retriever {
    pub fn new(oracle: Option<Arc<dyn RankingOracle>>) -> Self {
        Self { oracle }
    }

    /// Find the sections of one document most relevant to `query`, best
    /// first.
    ///
    /// Only an oracle authentication failure is returned as an error; other
    /// oracle failures fall back to keyword selection at the failing node.
    pub fn search<'a>(
        &self,
        query: &str,
        index: &'a DocumentIndex,
        options: &SearchOptions,
    ) -> Result<Vec<RetrievedSection<'a>>> {
        let lookup = build_lookup(index);
        let results = match (&self.oracle, options.use_llm) {
            (Some(oracle), true) => {
                self.descend(oracle.as_ref(), query, index, &lookup, options)?
            }
            (None, true) => {
                tracing::debug!(
                    document = %index.document_name,
                    "no ranking oracle configured, using keyword search"
                );
                keyword_search(query, index, &lookup, options.max_sections)
            }
            (_, false) => keyword_search(query, index, &lookup, options.max_sections),
        };
        Ok(results)
    }

    fn descend<'a>(
        &self,
        oracle: &dyn RankingOracle,
        query: &str,
        index: &'a DocumentIndex,
        lookup: &SectionLookup<'a>,
        options: &SearchOptions,
    ) -> Result<Vec<RetrievedSection<'a>>> {
        let mut results = Vec::new();
        let mut frontier: VecDeque<&TreeNode> = VecDeque::from([&index.root]);
        let mut visited: HashSet<&str> = HashSet::new();

        while results.len() < options.max_sections {
            let Some(node) = frontier.pop_front() else {
                break;
            };
            if !visited.insert(node.id.as_str()) {
                continue;
            }

            if node.is_leaf() {
                if !node.is_root() {
                    results.push(RetrievedSection::new(node, DESCENT_SCORE, &index.document_name));
                }
                continue;
            }

            for child in select_children(oracle, node, query, &options.model)? {
                if child.is_leaf() {
                    results.push(RetrievedSection::new(child, DESCENT_SCORE, &index.document_name));
                } else {
                    frontier.push_back(child);
                }
            }
        }

        let mut results =
            resolve_cross_references(results, lookup, &index.document_name, options.max_sections);
        results.truncate(options.max_sections);
        Ok(results)
    }

    /// Search several documents and merge the results.
    ///
    /// Card databases are searched by title first when `card_names` is not
    /// empty. Each document's scores are multiplied by its weight (default
    /// 1.0). Documents referenced by name from the results but not yet
    /// represented contribute up to three extra sections at a discount.
    pub fn search_multi<'a>(
        &self,
        query: &str,
        indexes: &'a [DocumentIndex],
        options: &SearchOptions,
        weights: &HashMap<String, f64>,
        card_names: &[String],
    ) -> Result<Vec<RetrievedSection<'a>>> {
        let per_document = if indexes.is_empty() {
            options.max_sections
        } else {
            MIN_PER_DOCUMENT.max(options.max_sections / indexes.len())
        };

        let mut all = Vec::new();
        for index in indexes {
            let mut results = if !card_names.is_empty()
                && index.document_type == DocumentType::CardDatabase
            {
                let mut found = search_by_card_names(card_names, index);
                if found.len() < per_document {
                    let top_up = options.with_max(per_document - found.len());
                    found.extend(self.search(query, index, &top_up)?);
                }
                found
            } else {
                self.search(query, index, &options.with_max(per_document))?
            };

            let weight = weights.get(&index.document_name).copied().unwrap_or(1.0);
            for section in &mut results {
                section.score *= weight;
            }
            all.extend(results);
        }

        for name in detect_cross_doc_references(&all) {
            let Some(index) = indexes.iter().find(|i| i.document_name == name) else {
                continue;
            };
            tracing::debug!(document = %name, "pulling cross-document reference");
            let mut extra = self.search(query, index, &options.with_max(CROSS_DOCUMENT_PULL))?;
            for section in &mut extra {
                section.score *= CROSS_DOCUMENT_DISCOUNT;
            }
            all.extend(extra);
        }

        Ok(merge_sections(all, options.max_sections))
    }
}

fn select_children<'a>(
    oracle: &dyn RankingOracle,
    node: &'a TreeNode,
    query: &str,
    model: &str,
) -> Result<Vec<&'a TreeNode>> {
    let previews = child_previews(node);
    match oracle.select_sections(query, &previews, model) {
        Ok(indices) => {
            let mut seen = HashSet::new();
            let selected: Vec<&TreeNode> = indices
                .into_iter()
                .filter(|&i| seen.insert(i))
                .filter_map(|i| node.children.get(i))
                .collect();
            if selected.is_empty() {
                tracing::warn!(node = %node.id, "oracle selected no valid sections, using keywords");
                return Ok(keyword_select_children(node, query));
            }
            Ok(selected)
        }
        Err(e) if e.is_fatal() => Err(Error::Oracle(e)),
        Err(e) => {
            tracing::warn!(node = %node.id, error = %e, "oracle navigation failed, using keywords");
            Ok(keyword_select_children(node, query))
        }
    }
}

/// Score every non-root section by the share of distinct query words it
/// contains.
fn keyword_search<'a>(
    query: &str,
    index: &'a DocumentIndex,
    lookup: &SectionLookup<'a>,
    max_sections: usize,
) -> Vec<RetrievedSection<'a>> {
    let words = query_words(query);
    if words.is_empty() {
        return Vec::new();
    }

    let mut scored: Vec<(f64, &TreeNode)> = index
        .root
        .walk()
        .filter(|node| !node.is_root())
        .filter_map(|node| {
            let matches = word_matches(&words, node);
            (matches > 0).then(|| (matches as f64 / words.len() as f64, node))
        })
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));

    let results = scored
        .into_iter()
        .take(max_sections)
        .map(|(score, node)| RetrievedSection::new(node, score, &index.document_name))
        .collect();

    let mut results = resolve_cross_references(results, lookup, &index.document_name, max_sections);
    results.truncate(max_sections);
    results
}
