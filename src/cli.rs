use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use crate::router::Persona;

#[derive(Debug, Parser)]
#[command(
    name = "pokeprof",
    about = "Route and retrieve trading-card-game rules sections"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Path to the domain config (defaults to <data-dir>/domain_config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Build document indexes from intermediate markdown
    Ingest {
        /// Index only this document
        document: Option<String>,
        /// Re-index even when the markdown is unchanged
        #[arg(long)]
        force: bool,
    },
    /// Show which documents a query would be routed to
    Route(RouteArgs),
    /// Route a query and print the retrieved sections
    Search(SearchArgs),
    /// Check stored indexes for duplicate ids and malformed section numbers
    Validate {
        /// Validate only this document
        document: Option<String>,
        /// Regex every section number must match at its start
        #[arg(long)]
        pattern: Option<String>,
    },
    /// List stored indexes
    Indexes {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the outline of an index, or one node in full
    Show {
        /// Document name
        name: String,
        /// Print this node's content instead of the outline
        #[arg(long)]
        node: Option<String>,
    },
    /// Build the errata overlay manifest
    Overlay(OverlayArgs),
    /// Start MCP server for AI agent integration
    Mcp,
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Route --

#[derive(Debug, Parser)]
pub struct RouteArgs {
    /// The question to route
    pub query: String,

    /// Audience the answer is written for
    #[arg(long, value_enum, default_value_t = Persona::Judge)]
    pub persona: Persona,

    /// Let the language model refine the query classification
    #[arg(long)]
    pub llm: bool,

    /// Override the language model id
    #[arg(long)]
    pub model: Option<String>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The question to answer
    pub query: String,

    /// Audience the answer is written for
    #[arg(long, value_enum, default_value_t = Persona::Judge)]
    pub persona: Persona,

    /// Keyword search only, no language model calls
    #[arg(long)]
    pub no_llm: bool,

    /// Override the language model id
    #[arg(long)]
    pub model: Option<String>,

    /// Maximum number of sections to return
    #[arg(short = 'n', long)]
    pub count: Option<usize>,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Overlay --

#[derive(Debug, Parser)]
pub struct OverlayArgs {
    /// Errata JSON files (arrays of card_name/new_text/old_text/source)
    pub errata: Vec<PathBuf>,

    /// Rulings compendium JSON to pull errata posts from
    #[arg(long)]
    pub compendium: Option<PathBuf>,
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "pokeprof",
            &mut std::io::stdout(),
        );
    }
}
