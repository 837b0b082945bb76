//! pokeprof - section retrieval for trading-card-game rules questions.
//!
//! pokeprof turns parser-produced markdown (rulebook, penalty guidelines,
//! card databases, rulings) into persisted section trees, routes a question
//! to the documents most likely to answer it, and retrieves the relevant
//! sections either by keyword scoring or by letting a language model walk
//! the tree. Card errata from an overlay manifest are attached to
//! card-database results.
//!
//! # Quick start
//!
//! ```no_run
//! use pokeprof::{DataDir, DomainConfig, Retriever, Router};
//! use pokeprof::router::{CardNameIndex, Persona};
//! use pokeprof::search::{self, SearchParams};
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let config = DomainConfig::from_file(&data_dir.root().join("domain_config.yaml")).unwrap();
//! let router = Router::new(CardNameIndex::from_file(data_dir.card_name_index().unwrap()));
//!
//! let params = SearchParams {
//!     query: "can I retreat after attaching energy?".to_string(),
//!     persona: Persona::Player,
//!     use_llm: false,
//!     model: pokeprof::oracle::default_model(),
//!     max_sections: None,
//! };
//!
//! let response =
//!     search::execute_search(&params, &data_dir, &config, &router, &Retriever::default())
//!         .unwrap();
//! for hit in &response.hits {
//!     println!("{} {} (score: {:.2})", hit.document_name, hit.breadcrumb, hit.score);
//! }
//! ```

pub mod cli;
pub mod config;
pub mod data_dir;
pub mod error;
pub mod fs;
pub mod indexer;
pub mod ingest;
pub mod mcp;
pub mod oracle;
pub mod overlay;
pub mod retriever;
pub mod router;
pub mod search;
pub mod tree;

pub use config::DomainConfig;
pub use data_dir::DataDir;
pub use error::{Error, Result};
pub use retriever::Retriever;
pub use router::Router;
pub use tree::{DocumentIndex, DocumentType, TreeNode};
