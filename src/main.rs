use std::{collections::BTreeMap, path::Path, sync::Arc};

use clap::Parser;
use pokeprof::{
    DataDir,
    DomainConfig,
    Retriever,
    Router,
    cli::{Cli, Command, OverlayArgs, RouteArgs, SearchArgs},
    config::{self, DocumentSource},
    error::{self, Error},
    indexer::{load_tree, validate_tree},
    ingest::{self, IngestOutcome},
    mcp,
    oracle::{self, AnthropicOracle, RankingOracle},
    overlay,
    router::CardNameIndex,
    search::{self, SearchParams},
};
use regex::Regex;
use tracing_subscriber::EnvFilter;

const LOG_ENV_VAR: &str = "POKEPROF_LOG";

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var(LOG_ENV_VAR) {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> error::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let config_path = config::resolve_config_path(cli.config.as_deref(), &data_dir);

    match cli.command {
        Command::Ingest { document, force } => {
            let catalog = load_catalog(&config_path)?;
            cmd_ingest(&data_dir, &catalog, document.as_deref(), force)?;
        }
        Command::Route(args) => {
            let config = DomainConfig::from_file(&config_path)?;
            cmd_route(&data_dir, &config, &args)?;
        }
        Command::Search(args) => {
            let config = DomainConfig::from_file(&config_path)?;
            cmd_search(&data_dir, &config, &args)?;
        }
        Command::Validate { document, pattern } => {
            cmd_validate(&data_dir, document.as_deref(), pattern.as_deref())?;
        }
        Command::Indexes { json } => {
            cmd_indexes(&data_dir, json)?;
        }
        Command::Show { name, node } => {
            cmd_show(&data_dir, &name, node.as_deref())?;
        }
        Command::Overlay(args) => {
            cmd_overlay(&data_dir, &args)?;
        }
        Command::Mcp => {
            let config = DomainConfig::from_file(&config_path)?;
            let ranking = build_oracle(true)?;
            let router = build_router(&data_dir, ranking.clone())?;
            mcp::run_mcp(
                data_dir,
                config,
                router,
                Retriever::new(ranking),
                oracle::default_model(),
            )?;
        }
        Command::Completions(args) => {
            args.generate();
        }
    }

    Ok(())
}

/// The document catalog from the config file, or the built-in one when no
/// config exists yet.
fn load_catalog(
    config_path: &Path,
) -> error::Result<BTreeMap<String, DocumentSource>> {
    match DomainConfig::from_file(config_path) {
        Ok(config) => Ok(config.documents),
        Err(Error::NotFound { .. }) => {
            tracing::debug!(path = %config_path.display(), "no domain config, using built-in catalog");
            Ok(config::default_catalog())
        }
        Err(e) => Err(e),
    }
}

fn build_oracle(wanted: bool) -> error::Result<Option<Arc<dyn RankingOracle>>> {
    if !wanted {
        return Ok(None);
    }
    match AnthropicOracle::from_env()? {
        Some(oracle) => Ok(Some(Arc::new(oracle))),
        None => {
            tracing::warn!(
                "{} is not set, language model features fall back to keywords",
                oracle::API_KEY_ENV_VAR
            );
            Ok(None)
        }
    }
}

fn build_router(
    data_dir: &DataDir,
    oracle: Option<Arc<dyn RankingOracle>>,
) -> error::Result<Router> {
    let router = Router::new(CardNameIndex::from_file(data_dir.card_name_index()?));
    Ok(match oracle {
        Some(oracle) => router.with_oracle(oracle),
        None => router,
    })
}

fn cmd_ingest(
    data_dir: &DataDir,
    catalog: &BTreeMap<String, DocumentSource>,
    document: Option<&str>,
    force: bool,
) -> error::Result<()> {
    let outcomes = ingest::ingest_documents(data_dir, catalog, document, force)?;

    for (name, outcome) in &outcomes {
        match outcome {
            IngestOutcome::Indexed { nodes, tokens, issues } => {
                if issues.is_empty() {
                    eprintln!("{name}: {nodes} nodes, {tokens} tokens");
                } else {
                    eprintln!("{name}: {nodes} nodes, {tokens} tokens, {} issue(s)", issues.len());
                }
            }
            IngestOutcome::UpToDate => eprintln!("{name}: up to date"),
            IngestOutcome::MissingMarkdown => eprintln!("{name}: markdown missing, skipped"),
            IngestOutcome::Failed(message) => eprintln!("{name}: failed: {message}"),
        }
    }

    let failures = outcomes.iter().filter(|(_, o)| o.is_failure()).count();

    if failures > 0 {
        return Err(Error::Config(format!("{failures} document(s) failed to index")));
    }
    Ok(())
}

fn cmd_route(data_dir: &DataDir, config: &DomainConfig, args: &RouteArgs) -> error::Result<()> {
    let router = build_router(data_dir, build_oracle(args.llm)?)?;
    let model = args.model.clone().unwrap_or_else(oracle::default_model);
    let decision = router.route(&args.query, config, args.persona, args.llm, &model)?;

    if args.json {
        let json = serde_json::to_string_pretty(&decision)
            .map_err(|e| Error::Config(format!("failed to serialize route decision: {e}")))?;
        println!("{json}");
    } else {
        println!("Documents: {}", decision.documents.join(", "));
        println!("Confidence: {:.2}", decision.confidence);
        if !decision.card_names.is_empty() {
            println!("Cards: {}", decision.card_names.join(", "));
        }
        println!("Reasoning: {}", decision.reasoning);
    }
    Ok(())
}

fn cmd_search(data_dir: &DataDir, config: &DomainConfig, args: &SearchArgs) -> error::Result<()> {
    let router = build_router(data_dir, None)?;
    let retriever = Retriever::new(build_oracle(!args.no_llm)?);

    let params = SearchParams {
        query: args.query.clone(),
        persona: args.persona,
        use_llm: !args.no_llm,
        model: args.model.clone().unwrap_or_else(oracle::default_model),
        max_sections: args.count,
    };
    let response = search::execute_search(&params, data_dir, config, &router, &retriever)?;

    if args.json {
        search::format_json(&response)?;
    } else {
        tracing::info!(
            documents = ?response.routing.documents,
            confidence = response.routing.confidence,
            "routed"
        );
        search::format_human(&response);
    }
    Ok(())
}

fn cmd_validate(
    data_dir: &DataDir,
    document: Option<&str>,
    pattern: Option<&str>,
) -> error::Result<()> {
    let pattern = pattern.map(Regex::new).transpose()?;
    let names: Vec<String> = match document {
        Some(name) => vec![name.to_string()],
        None => ingest::list_indexes(data_dir)?
            .into_iter()
            .map(|summary| summary.name)
            .collect(),
    };

    if names.is_empty() {
        eprintln!("No indexes to validate.");
        return Ok(());
    }

    let mut total = 0;
    for name in &names {
        let index = load_tree(&data_dir.index_path(name)?)?;
        let issues = validate_tree(&index, pattern.as_ref());
        if issues.is_empty() {
            println!("{name}: ok");
        } else {
            println!("{name}: {} issue(s)", issues.len());
            for issue in &issues {
                println!("  - {issue}");
            }
        }
        total += issues.len();
    }

    if total > 0 {
        return Err(Error::InvalidStructure {
            file: names.join(", "),
            message: format!("{total} validation issue(s)"),
        });
    }
    Ok(())
}

fn cmd_indexes(data_dir: &DataDir, json: bool) -> error::Result<()> {
    let indexes = ingest::list_indexes(data_dir)?;

    if json {
        let out = serde_json::to_string_pretty(&indexes)
            .map_err(|e| Error::Config(format!("failed to serialize index list: {e}")))?;
        println!("{out}");
    } else if indexes.is_empty() {
        println!("No indexes found. Run `pokeprof ingest` first.");
    } else {
        for summary in &indexes {
            println!(
                "{}\t{}\t{} nodes\t{} tokens",
                summary.name, summary.document_type, summary.node_count, summary.total_tokens
            );
        }
    }
    Ok(())
}

fn cmd_show(data_dir: &DataDir, name: &str, node: Option<&str>) -> error::Result<()> {
    let index = load_tree(&data_dir.index_path(name)?)?;

    let Some(id) = node else {
        print!("{}", ingest::outline(&index.root));
        return Ok(());
    };

    let found = index.root.find(id).ok_or_else(|| Error::NotFound {
        kind: "node",
        name: format!("{name}:{id}"),
    })?;
    let meta = &found.metadata;
    println!("id: {}", found.id);
    println!("section: {}", meta.section_number);
    println!("title: {}", meta.title);
    println!("tokens: {}", found.token_count);
    println!("children: {}", found.children.len());
    if !found.content.is_empty() {
        println!();
        println!("{}", found.content);
    }
    Ok(())
}

fn cmd_overlay(data_dir: &DataDir, args: &OverlayArgs) -> error::Result<()> {
    let mut manifest = overlay::build_overlay(&args.errata);
    if let Some(path) = &args.compendium {
        for errata in overlay::extract_errata_from_compendium(path)? {
            manifest.insert(errata);
        }
    }

    let path = data_dir.overlay_manifest()?;
    overlay::save_overlay(&manifest, &path)?;
    eprintln!(
        "Wrote {} errata for {} card(s) to {}",
        manifest.entry_count(),
        manifest.card_errata.len(),
        path.display()
    );
    Ok(())
}
