use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const DATA_DIR_ENV_VAR: &str = "POKEPROF_DATA_DIR";
pub const CARD_NAME_INDEX_FILE: &str = "card_name_index.json";
pub const OVERLAY_MANIFEST_FILE: &str = "overlay_manifest.json";

/// File stems inside `indexes/` that are not document trees.
pub const NON_INDEX_STEMS: &[&str] = &["card_name_index", "overlay_manifest"];

#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Resolve the data directory from, in order of priority:
    /// 1. An explicit path (from --data-dir)
    /// 2. The POKEPROF_DATA_DIR environment variable
    /// 3. The XDG data directory (~/.local/share/pokeprof/)
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = if let Some(path) = explicit {
            path.to_path_buf()
        } else if let Ok(val) = std::env::var(DATA_DIR_ENV_VAR) {
            PathBuf::from(val)
        } else {
            xdg::BaseDirectories::with_prefix("pokeprof")
                .get_data_home()
                .ok_or_else(|| {
                    Error::Config(
                        "could not determine XDG data home directory".into(),
                    )
                })?
        };

        std::fs::create_dir_all(&root)
            .map_err(|_| Error::DataDir(root.clone()))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Folder holding the parser-produced markdown for each document.
    pub fn intermediate_dir(&self) -> PathBuf {
        self.root.join("intermediate")
    }

    pub fn indexes_dir(&self) -> Result<PathBuf> {
        let path = self.root.join("indexes");
        std::fs::create_dir_all(&path)
            .map_err(|_| Error::DataDir(path.clone()))?;
        Ok(path)
    }

    pub fn index_path(&self, document_name: &str) -> Result<PathBuf> {
        check_document_name(document_name)?;
        Ok(self.indexes_dir()?.join(format!("{document_name}.json")))
    }

    pub fn card_name_index(&self) -> Result<PathBuf> {
        Ok(self.indexes_dir()?.join(CARD_NAME_INDEX_FILE))
    }

    pub fn overlay_manifest(&self) -> Result<PathBuf> {
        Ok(self.indexes_dir()?.join(OVERLAY_MANIFEST_FILE))
    }
}

/// Document names become file stems under `indexes/`, so they must not be
/// empty or contain path separators or `..`.
pub fn check_document_name(name: &str) -> Result<()> {
    if name.trim().is_empty() || name.contains(['/', '\\']) || name.contains("..") {
        return Err(Error::Config(format!("invalid document name {name:?}")));
    }
    Ok(())
}
