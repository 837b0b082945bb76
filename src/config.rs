//! Domain configuration loaded from `domain_config.yaml`.
//!
//! ```yaml
//! domain_name: pokemon_tcg
//! routing_hints:
//!   rulebook: [rule, attack, energy, evolve, retreat]
//!   penalty_guidelines: [penalty, infraction, warning, game loss]
//! documents:            # optional, defaults to the built-in catalog
//!   rulebook:
//!     markdown: rulebook.md
//!     document_type: rulebook
//! ```

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    data_dir::{DataDir, check_document_name},
    error::{Error, Result},
    tree::DocumentType,
};

pub const CONFIG_ENV_VAR: &str = "POKEPROF_CONFIG";
pub const CONFIG_FILE_NAME: &str = "domain_config.yaml";

/// Where a document's intermediate markdown lives and what kind it is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSource {
    /// File name relative to the data directory's `intermediate/` folder.
    pub markdown: String,
    pub document_type: DocumentType,
}

impl DocumentSource {
    fn new(markdown: &str, document_type: DocumentType) -> Self {
        Self {
            markdown: markdown.to_string(),
            document_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainConfig {
    pub domain_name: String,
    /// Document name to the keywords that suggest a query concerns it.
    pub routing_hints: BTreeMap<String, Vec<String>>,
    #[serde(default = "default_catalog")]
    pub documents: BTreeMap<String, DocumentSource>,
}

impl DomainConfig {
    pub fn new(
        domain_name: impl Into<String>,
        routing_hints: BTreeMap<String, Vec<String>>,
    ) -> Self {
        Self {
            domain_name: domain_name.into(),
            routing_hints,
            documents: default_catalog(),
        }
    }

    /// Load a YAML configuration file from the given path.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::NotFound {
                kind: "domain config",
                name: path.display().to_string(),
            });
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Parse YAML configuration from a string.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: DomainConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.domain_name.trim().is_empty() {
            return Err(Error::Config("domain_name must not be empty".into()));
        }
        if self.routing_hints.is_empty() {
            return Err(Error::Config(
                "routing_hints must name at least one document".into(),
            ));
        }
        for name in self.routing_hints.keys().chain(self.documents.keys()) {
            check_document_name(name)?;
        }
        Ok(())
    }

    pub fn document(&self, name: &str) -> Option<&DocumentSource> {
        self.documents.get(name)
    }
}

/// The seven documents a full ingest produces.
pub fn default_catalog() -> BTreeMap<String, DocumentSource> {
    [
        ("rulebook", "rulebook.md", DocumentType::Rulebook),
        (
            "penalty_guidelines",
            "penalty_guidelines.md",
            DocumentType::PenaltyGuidelines,
        ),
        (
            "legal_card_list",
            "legal_card_list.md",
            DocumentType::LegalCardList,
        ),
        (
            "card_db_pokemon",
            "card_db_pokemon.md",
            DocumentType::CardDatabase,
        ),
        (
            "card_db_trainers",
            "card_db_trainers.md",
            DocumentType::CardDatabase,
        ),
        (
            "card_db_energy",
            "card_db_energy.md",
            DocumentType::CardDatabase,
        ),
        (
            "rulings_compendium",
            "rulings_compendium.md",
            DocumentType::RulingsCompendium,
        ),
    ]
    .into_iter()
    .map(|(name, markdown, t)| (name.to_string(), DocumentSource::new(markdown, t)))
    .collect()
}

/// Resolve the config file path from, in order of priority:
/// 1. An explicit path (from --config)
/// 2. The POKEPROF_CONFIG environment variable
/// 3. `domain_config.yaml` inside the data directory
pub fn resolve_config_path(explicit: Option<&Path>, data_dir: &DataDir) -> PathBuf {
    if let Some(path) = explicit {
        path.to_path_buf()
    } else if let Ok(val) = std::env::var(CONFIG_ENV_VAR) {
        PathBuf::from(val)
    } else {
        data_dir.root().join(CONFIG_FILE_NAME)
    }
}
