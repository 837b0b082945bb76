//! Card errata overlay.
//!
//! The manifest maps lower-cased card names to known errata. Retrieved
//! card-database sections are annotated with the errata of any card the
//! query mentions, so a stale printed text is never presented alone.

use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
    sync::LazyLock,
};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    fs,
    tree::{DocumentType, RetrievedSection},
};

const MAX_ERRATA_NOTES: usize = 3;
const NOTE_TEXT_CHARS: usize = 150;
const DEFAULT_COMPENDIUM_SOURCE: &str = "Compendium Errata";

static SOURCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Source:\s*(.+?)(?:\n|$)").expect("source pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrataOverlay {
    pub card_name: String,
    pub new_text: String,
    pub old_text: String,
    pub source: String,
}

impl ErrataOverlay {
    /// One-line note attached to annotated sections.
    pub fn note(&self) -> String {
        let old: String = self.old_text.chars().take(NOTE_TEXT_CHARS).collect();
        let new: String = self.new_text.chars().take(NOTE_TEXT_CHARS).collect();
        format!("{}: OLD: {old} → NEW: {new}", self.card_name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayManifest {
    #[serde(default)]
    pub card_errata: BTreeMap<String, Vec<ErrataOverlay>>,
}

impl OverlayManifest {
    pub fn insert(&mut self, errata: ErrataOverlay) {
        self.card_errata
            .entry(errata.card_name.to_lowercase())
            .or_default()
            .push(errata);
    }

    pub fn entry_count(&self) -> usize {
        self.card_errata.values().map(Vec::len).sum()
    }
}

/// An errata file entry; `source` defaults to the file stem.
#[derive(Debug, Deserialize)]
struct ErrataEntry {
    card_name: String,
    new_text: String,
    old_text: String,
    source: Option<String>,
}

fn read_errata_file(path: &Path) -> Result<Vec<serde_json::Value>> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| Error::CorruptIndex {
        file: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Build a manifest from errata files, each a JSON array of entries.
///
/// Unreadable files and malformed entries are logged and skipped.
pub fn build_overlay(paths: &[PathBuf]) -> OverlayManifest {
    let mut manifest = OverlayManifest::default();

    for path in paths {
        let entries = match read_errata_file(path) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to read errata file");
                continue;
            }
        };

        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        for (i, value) in entries.into_iter().enumerate() {
            match serde_json::from_value::<ErrataEntry>(value) {
                Ok(entry) => manifest.insert(ErrataOverlay {
                    card_name: entry.card_name,
                    new_text: entry.new_text,
                    old_text: entry.old_text,
                    source: entry.source.unwrap_or_else(|| stem.clone()),
                }),
                Err(e) => tracing::warn!(
                    entry = i,
                    path = %path.display(),
                    error = %e,
                    "skipping malformed errata entry"
                ),
            }
        }
    }

    manifest
}

#[derive(Debug, Deserialize)]
struct Compendium {
    #[serde(default)]
    posts: Vec<CompendiumPost>,
}

#[derive(Debug, Deserialize)]
struct CompendiumPost {
    #[serde(default)]
    category_name: Option<String>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
}

/// Errata posts from a scraped rulings compendium.
///
/// The post title names the card and the content is the new text. Old text
/// is not published there, so it stays empty.
pub fn extract_errata_from_compendium(path: &Path) -> Result<Vec<ErrataOverlay>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::NotFound {
                kind: "compendium",
                name: path.display().to_string(),
            });
        }
        Err(e) => return Err(Error::Io(e)),
    };
    let compendium: Compendium =
        serde_json::from_str(&content).map_err(|e| Error::CorruptIndex {
            file: path.display().to_string(),
            message: e.to_string(),
        })?;

    let entries: Vec<ErrataOverlay> = compendium
        .posts
        .into_iter()
        .filter(|post| post.category_name.as_deref() == Some("Errata"))
        .filter_map(|post| {
            let title = post.title.trim();
            let text = post.content.trim();
            if title.is_empty() || text.is_empty() {
                return None;
            }
            let source = SOURCE_RE
                .captures(text)
                .map(|caps| caps[1].trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_COMPENDIUM_SOURCE.to_string());
            Some(ErrataOverlay {
                card_name: title.to_string(),
                new_text: text.to_string(),
                old_text: String::new(),
                source,
            })
        })
        .collect();

    tracing::info!(count = entries.len(), "extracted errata from compendium");
    Ok(entries)
}

pub fn save_overlay(manifest: &OverlayManifest, path: &Path) -> Result<()> {
    fs::write_json_atomic(path, manifest)
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    #[serde(default)]
    card_errata: BTreeMap<String, serde_json::Value>,
}

/// Load a manifest. Cards whose errata list is malformed are logged and
/// dropped; the rest of the manifest is kept.
pub fn load_overlay(path: &Path) -> Result<OverlayManifest> {
    let file = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::NotFound {
                kind: "overlay manifest",
                name: path.display().to_string(),
            });
        }
        Err(e) => return Err(Error::Io(e)),
    };

    let raw: RawManifest = serde_json::from_str(&content).map_err(|e| {
        if e.classify() == serde_json::error::Category::Data {
            Error::InvalidStructure {
                file: file.clone(),
                message: e.to_string(),
            }
        } else {
            Error::CorruptIndex {
                file: file.clone(),
                message: e.to_string(),
            }
        }
    })?;

    let mut manifest = OverlayManifest::default();
    for (card, value) in raw.card_errata {
        match serde_json::from_value::<Vec<ErrataOverlay>>(value) {
            Ok(list) => {
                manifest.card_errata.insert(card, list);
            }
            Err(e) => tracing::warn!(card = %card, error = %e, "skipping corrupt errata"),
        }
    }
    Ok(manifest)
}

/// Errata for every manifest card whose name appears anywhere in the query.
///
/// This is a plain substring test with no word-boundary check, so it is
/// looser than card detection in the router.
pub fn lookup_card_errata<'m>(manifest: &'m OverlayManifest, query: &str) -> Vec<&'m ErrataOverlay> {
    let q = query.to_lowercase();
    let mut seen: HashSet<&str> = HashSet::new();
    manifest
        .card_errata
        .iter()
        .filter(|(key, _)| q.contains(key.as_str()))
        .flat_map(|(_, list)| list)
        .filter(|errata| seen.insert(errata.card_name.as_str()))
        .collect()
}

/// Attach errata notes for cards mentioned in `query` to every
/// card-database section.
pub fn annotate_sections(
    sections: &mut [RetrievedSection<'_>],
    manifest: &OverlayManifest,
    query: &str,
) {
    if query.is_empty() {
        return;
    }
    let notes: Vec<String> = lookup_card_errata(manifest, query)
        .into_iter()
        .take(MAX_ERRATA_NOTES)
        .map(ErrataOverlay::note)
        .collect();
    if notes.is_empty() {
        return;
    }

    for section in sections
        .iter_mut()
        .filter(|s| s.node.metadata.document_type == DocumentType::CardDatabase)
    {
        section.errata_context = notes.clone();
    }
}
