use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid pattern: {0}")]
    Regex(#[from] regex::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("corrupt file {file}: {message}")]
    CorruptIndex { file: String, message: String },

    #[error("invalid index structure in {file}: {message}")]
    InvalidStructure { file: String, message: String },

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),

    #[error("ranking oracle error: {0}")]
    Oracle(#[from] OracleError),
}

/// Failure modes of a ranking oracle call.
///
/// Only [`OracleError::AuthFailure`] is allowed to escape the router and
/// retriever; the other kinds are recovered locally.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OracleError {
    #[error("oracle unavailable: {0}")]
    Unavailable(String),

    #[error("oracle authentication failed: {0}")]
    AuthFailure(String),

    #[error("oracle response unparseable: {0}")]
    Unparseable(String),
}

impl OracleError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthFailure(_))
    }
}
