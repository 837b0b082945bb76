//! The query pipeline shared by the `search` command and the MCP server.

use std::collections::HashMap;

use serde::Serialize;

use crate::{
    config::DomainConfig,
    data_dir::DataDir,
    error::{Error, Result},
    indexer::load_tree,
    overlay::{annotate_sections, load_overlay},
    retriever::{Retriever, SearchOptions, ancestry_context, build_lookup},
    router::{Persona, RouteDecision, Router},
    tree::{DocumentIndex, RetrievedSection},
};

/// Sections returned when only one document is searched.
pub const SINGLE_DOCUMENT_SECTIONS: usize = 5;
/// Sections returned when several documents are searched together.
pub const MULTI_DOCUMENT_SECTIONS: usize = 10;

const PREVIEW_CHARS: usize = 500;

#[derive(Debug, Clone)]
pub struct SearchParams {
    pub query: String,
    pub persona: Persona,
    /// Descend with the ranking oracle during retrieval.
    pub use_llm: bool,
    pub model: String,
    /// Overrides the single/multi document defaults.
    pub max_sections: Option<usize>,
}

/// One retrieved section, detached from the index it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub rank: usize,
    pub document_name: String,
    pub node_id: String,
    pub section_number: String,
    pub title: String,
    pub score: f64,
    /// `1. Setup > 1.2. Draw` style path to the section.
    pub breadcrumb: String,
    pub content: String,
    pub errata_context: Vec<String>,
}

impl SearchHit {
    fn from_section(rank: usize, section: &RetrievedSection<'_>, breadcrumb: String) -> Self {
        let meta = &section.node.metadata;
        Self {
            rank,
            document_name: section.document_name.clone(),
            node_id: section.node.id.clone(),
            section_number: meta.section_number.clone(),
            title: meta.title.clone(),
            score: section.score,
            breadcrumb,
            content: section.node.content.clone(),
            errata_context: section.errata_context.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub routing: RouteDecision,
    /// Routed documents with no usable stored index.
    pub missing_indexes: Vec<String>,
    pub hits: Vec<SearchHit>,
}

/// Load the stored indexes for `documents`, in order.
///
/// Documents whose index is absent, corrupt or malformed are logged and
/// returned separately so the caller can suggest running `ingest`. I/O
/// failures are errors.
pub fn load_indexes(
    data_dir: &DataDir,
    documents: &[String],
) -> Result<(Vec<DocumentIndex>, Vec<String>)> {
    let mut loaded = Vec::new();
    let mut missing = Vec::new();
    for name in documents {
        match load_tree(&data_dir.index_path(name)?) {
            Ok(index) => loaded.push(index),
            Err(Error::NotFound { .. }) => {
                tracing::warn!(document = %name, "no index found, run `pokeprof ingest` first");
                missing.push(name.clone());
            }
            Err(e @ (Error::CorruptIndex { .. } | Error::InvalidStructure { .. })) => {
                tracing::warn!(document = %name, error = %e, "skipping unreadable index");
                missing.push(name.clone());
            }
            Err(e) => return Err(e),
        }
    }
    Ok((loaded, missing))
}

/// Run the full retrieval pipeline.
///
/// 1. Route the query (keyword routing, no oracle classification)
/// 2. Load the routed documents' indexes
/// 3. Retrieve sections from one document, or merge across several
/// 4. Attach card errata from the overlay manifest, when one exists
pub fn execute_search(
    params: &SearchParams,
    data_dir: &DataDir,
    config: &DomainConfig,
    router: &Router,
    retriever: &Retriever,
) -> Result<SearchResponse> {
    let routing = router.route(&params.query, config, params.persona, false, &params.model)?;
    let (indexes, missing_indexes) = load_indexes(data_dir, &routing.documents)?;

    let default_max = if indexes.len() > 1 {
        MULTI_DOCUMENT_SECTIONS
    } else {
        SINGLE_DOCUMENT_SECTIONS
    };
    let options = SearchOptions {
        max_sections: params.max_sections.unwrap_or(default_max),
        model: params.model.clone(),
        use_llm: params.use_llm,
    };

    let mut sections = match indexes.as_slice() {
        [] => Vec::new(),
        [index] => retriever.search(&params.query, index, &options)?,
        many => retriever.search_multi(
            &params.query,
            many,
            &options,
            &HashMap::new(),
            &routing.card_names,
        )?,
    };

    let manifest_path = data_dir.overlay_manifest()?;
    if manifest_path.exists() {
        match load_overlay(&manifest_path) {
            Ok(manifest) => annotate_sections(&mut sections, &manifest, &params.query),
            Err(e) => tracing::warn!(error = %e, "ignoring unreadable overlay manifest"),
        }
    }

    let lookups: HashMap<&str, _> = indexes
        .iter()
        .map(|index| (index.document_name.as_str(), build_lookup(index)))
        .collect();
    let hits = sections
        .iter()
        .enumerate()
        .map(|(i, section)| {
            let breadcrumb = lookups
                .get(section.document_name.as_str())
                .map(|lookup| ancestry_context(section.node, lookup))
                .unwrap_or_default();
            SearchHit::from_section(i + 1, section, breadcrumb)
        })
        .collect();

    Ok(SearchResponse {
        query: params.query.clone(),
        routing,
        missing_indexes,
        hits,
    })
}

fn preview(content: &str) -> &str {
    match content.char_indices().nth(PREVIEW_CHARS) {
        Some((cut, _)) => &content[..cut],
        None => content,
    }
}

/// Format results for human-readable terminal output.
pub fn format_human(response: &SearchResponse) {
    if response.hits.is_empty() {
        if response.routing.documents.len() == response.missing_indexes.len() {
            println!("No indexes found. Build them first with `pokeprof ingest`.");
        } else {
            println!("No relevant sections found. Try rephrasing the query.");
        }
        return;
    }

    for hit in &response.hits {
        println!(
            "{:>3}. [{:.2}] {} {} {}",
            hit.rank, hit.score, hit.document_name, hit.section_number, hit.title
        );
        if !hit.breadcrumb.is_empty() {
            println!("     {}", hit.breadcrumb);
        }
        for note in &hit.errata_context {
            println!("     ! {note}");
        }
        for line in preview(&hit.content).lines() {
            println!("     {line}");
        }
        println!();
    }
    println!("{} section(s)", response.hits.len());
}

/// Format results as JSON output.
pub fn format_json(response: &SearchResponse) -> Result<()> {
    let json = serde_json::to_string_pretty(response)
        .map_err(|e| Error::Config(format!("failed to serialize results: {e}")))?;
    println!("{json}");
    Ok(())
}
