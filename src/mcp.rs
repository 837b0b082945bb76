use std::sync::Arc;

use rmcp::{
    ServerHandler,
    ServiceExt,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{
        CallToolResult,
        Content,
        Implementation,
        ServerCapabilities,
        ServerInfo,
    },
    tool,
    tool_handler,
    tool_router,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    config::DomainConfig,
    data_dir::DataDir,
    error,
    ingest::{IndexSummary, list_indexes},
    retriever::Retriever,
    router::{Persona, RouteDecision, Router},
    search::{self, SearchParams as PipelineParams, SearchResponse},
};

struct PokeprofState {
    data_dir: DataDir,
    config: DomainConfig,
    router: Router,
    retriever: Retriever,
    model: String,
}

#[derive(Clone)]
pub struct PokeprofMcpServer {
    state: Arc<PokeprofState>,
    tool_router: ToolRouter<Self>,
}

impl PokeprofMcpServer {
    fn new(state: PokeprofState) -> Self {
        Self {
            state: Arc::new(state),
            tool_router: Self::tool_router(),
        }
    }

    /// Run blocking pipeline work off the async executor.
    async fn blocking<T, F>(&self, f: F) -> Result<T, rmcp::ErrorData>
    where
        T: Send + 'static,
        F: FnOnce(&PokeprofState) -> error::Result<T> + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        tokio::task::spawn_blocking(move || f(&state))
            .await
            .map_err(|e| mcp_error("worker task failed", e))?
            .map_err(|e| mcp_error("request failed", e))
    }
}

#[tool_router(router = tool_router)]
impl PokeprofMcpServer {
    /// Decide which rules documents a question concerns.
    #[tool(
        name = "pokeprof_route",
        description = "Route a trading-card-game rules question to the documents most likely to answer it. Returns documents best first, a confidence and detected card names."
    )]
    pub async fn pokeprof_route(
        &self,
        params: Parameters<RouteParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let params = params.0;
        let decision: RouteDecision = self
            .blocking(move |state| {
                state.router.route(
                    &params.query,
                    &state.config,
                    params.persona.unwrap_or_default(),
                    params.use_llm.unwrap_or(false),
                    &state.model,
                )
            })
            .await?;

        let summary = format!(
            "Documents: {} (confidence {:.2})\n{}",
            decision.documents.join(", "),
            decision.confidence,
            decision.reasoning
        );
        let structured = serde_json::to_value(&decision)
            .map_err(|e| mcp_error("failed to serialize route decision", e))?;

        let mut result = CallToolResult::success(vec![Content::text(summary)]);
        result.structured_content = Some(structured);
        Ok(result)
    }

    /// Route, retrieve and annotate sections for a question.
    #[tool(
        name = "pokeprof_search",
        description = "Retrieve the rules sections most relevant to a question, with breadcrumbs and card errata notes. Set useLlm to false for keyword-only retrieval."
    )]
    pub async fn pokeprof_search(
        &self,
        params: Parameters<SearchParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let params = params.0;
        let response: SearchResponse = self
            .blocking(move |state| {
                let pipeline = PipelineParams {
                    query: params.query,
                    persona: params.persona.unwrap_or_default(),
                    use_llm: params.use_llm.unwrap_or(true),
                    model: state.model.clone(),
                    max_sections: params.limit,
                };
                search::execute_search(
                    &pipeline,
                    &state.data_dir,
                    &state.config,
                    &state.router,
                    &state.retriever,
                )
            })
            .await?;

        let summary = format_search_summary(&response);
        let structured = serde_json::to_value(&response)
            .map_err(|e| mcp_error("failed to serialize search results", e))?;

        let mut result = CallToolResult::success(vec![Content::text(summary)]);
        result.structured_content = Some(structured);
        Ok(result)
    }

    /// List the stored document indexes.
    #[tool(
        name = "pokeprof_list_indexes",
        description = "List the indexed rules documents with their type, node count and token total."
    )]
    pub async fn pokeprof_list_indexes(&self) -> Result<CallToolResult, rmcp::ErrorData> {
        let indexes: Vec<IndexSummary> =
            self.blocking(|state| list_indexes(&state.data_dir)).await?;

        let summary = if indexes.is_empty() {
            "No indexes found. Run `pokeprof ingest` first.".to_string()
        } else {
            indexes
                .iter()
                .map(|i| {
                    format!(
                        "{} ({}): {} nodes, {} tokens",
                        i.name, i.document_type, i.node_count, i.total_tokens
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        };
        let list = serde_json::to_value(&indexes)
            .map_err(|e| mcp_error("failed to serialize index list", e))?;
        let structured = json!({ "indexes": list });

        let mut result = CallToolResult::success(vec![Content::text(summary)]);
        result.structured_content = Some(structured);
        Ok(result)
    }
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for PokeprofMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo::new(ServerCapabilities::builder().enable_tools().build())
            .with_server_info(
                Implementation::new("pokeprof", env!("CARGO_PKG_VERSION"))
                    .with_title("pokeprof MCP"),
            )
            .with_instructions(
                "Use pokeprof_search to find rules, penalty and card sections for a question. Use pokeprof_route to see which documents a question targets.",
            )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteParams {
    /// The rules question.
    pub query: String,
    /// Audience: judge (default), professor or player.
    pub persona: Option<Persona>,
    /// Let the language model classify ambiguous questions (default: false).
    pub use_llm: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchParams {
    /// The rules question.
    pub query: String,
    /// Audience: judge (default), professor or player.
    pub persona: Option<Persona>,
    /// Navigate documents with the language model (default: true).
    pub use_llm: Option<bool>,
    /// Maximum number of sections (default: 5 for one document, 10 for several).
    pub limit: Option<usize>,
}

fn format_search_summary(response: &SearchResponse) -> String {
    if response.hits.is_empty() {
        return format!("No sections found for \"{}\"", response.query);
    }

    let mut lines = Vec::with_capacity(response.hits.len() + 1);
    let suffix = if response.hits.len() == 1 { "" } else { "s" };
    lines.push(format!(
        "Found {} section{} for \"{}\":",
        response.hits.len(),
        suffix,
        response.query
    ));
    for hit in &response.hits {
        let label = if hit.breadcrumb.is_empty() {
            hit.title.as_str()
        } else {
            hit.breadcrumb.as_str()
        };
        lines.push(format!("{:.2} {} {}", hit.score, hit.document_name, label));
    }
    lines.join("\n")
}

fn mcp_error(message: &str, error: impl std::fmt::Display) -> rmcp::ErrorData {
    rmcp::ErrorData::internal_error(
        message.to_string(),
        Some(json!({ "error": error.to_string() })),
    )
}

pub fn run_mcp(
    data_dir: DataDir,
    config: DomainConfig,
    router: Router,
    retriever: Retriever,
    model: String,
) -> error::Result<()> {
    let state = Arc::new(PokeprofState {
        data_dir,
        config,
        router,
        retriever,
        model,
    });
    let server = PokeprofMcpServer {
        state: Arc::clone(&state),
        tool_router: PokeprofMcpServer::tool_router(),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| {
            error::Error::Config(format!("failed to start tokio runtime: {e}"))
        })?;

    let outcome = runtime.block_on(async move {
        let transport = rmcp::transport::stdio();
        let running = server.serve(transport).await.map_err(|e| {
            error::Error::Config(format!(
                "MCP server initialization failed: {e}"
            ))
        })?;
        running.waiting().await.map_err(|e| {
            error::Error::Config(format!("MCP server error: {e}"))
        })?;
        Ok(())
    });

    // The oracle's blocking HTTP client must not be dropped on an async
    // worker thread.
    drop(state);
    outcome
}
