//! The ranking oracle: an external judge that picks relevant sections and
//! classifies ambiguous queries.
//!
//! [`AnthropicOracle`] talks to the Anthropic Messages API over a blocking
//! HTTP client. Callers inside an async runtime must run it on a blocking
//! worker thread.

use std::time::Duration;

use reqwest::{StatusCode, blocking::Client};
use serde::Deserialize;

use crate::{error::OracleError, router::QueryType, tree::TreeNode};

pub const DEFAULT_MODEL: &str = "claude-haiku-4-5-20251001";
pub const MODEL_ENV_VAR: &str = "POKEPROF_MODEL";
pub const API_KEY_ENV_VAR: &str = "ANTHROPIC_API_KEY";

const MESSAGES_ENDPOINT: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PREVIEW_CHARS: usize = 100;
const SELECT_MAX_TOKENS: u32 = 50;
const CLASSIFY_MAX_TOKENS: u32 = 20;

const SELECT_SYSTEM_PROMPT: &str = "You navigate the section index of Pokémon TCG \
reference documents. Given a question and a numbered list of sections, reply with \
ONLY the numbers of the most relevant sections, comma-separated (for example \
'0,2'). Choose between 1 and 3 sections.";

const CLASSIFY_SYSTEM_PROMPT: &str = "You classify Pokémon TCG rules questions. \
Reply with ONLY one of these labels:\n\
- rules_lookup: game mechanics and general rules\n\
- penalty: infractions, penalties, warnings, judge calls\n\
- format_legality: legal or banned cards, Standard and Expanded formats\n\
- card_specific: errata or the exact text of a card\n\
- card_interaction: how two or more specific cards, abilities or attacks interact\n\
Reply with the label and nothing else.";

/// Model id to use when none is given explicitly.
pub fn default_model() -> String {
    std::env::var(MODEL_ENV_VAR)
        .ok()
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_MODEL.to_string())
}

/// One numbered line in a section-selection prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionPreview {
    pub index: usize,
    /// Section number, or the node id when the section is unnumbered.
    pub label: String,
    pub title: String,
    /// First hundred characters of the section's own content.
    pub excerpt: String,
}

impl SectionPreview {
    pub fn from_node(index: usize, node: &TreeNode) -> Self {
        let label = if node.metadata.section_number.is_empty() {
            node.id.clone()
        } else {
            node.metadata.section_number.clone()
        };
        let title = if node.metadata.title.is_empty() {
            "(no title)".to_string()
        } else {
            node.metadata.title.clone()
        };
        Self {
            index,
            label,
            title,
            excerpt: node.content.chars().take(PREVIEW_CHARS).collect(),
        }
    }

    pub fn render(&self) -> String {
        format!("{}. [{}] {}: {}", self.index, self.label, self.title, self.excerpt)
    }
}

/// Previews for every child of `node`, numbered from zero.
pub fn child_previews(node: &TreeNode) -> Vec<SectionPreview> {
    node.children
        .iter()
        .enumerate()
        .map(|(i, child)| SectionPreview::from_node(i, child))
        .collect()
}

pub trait RankingOracle: Send + Sync {
    /// Pick the indices of the previews most relevant to `query`.
    fn select_sections(
        &self,
        query: &str,
        previews: &[SectionPreview],
        model: &str,
    ) -> Result<Vec<usize>, OracleError>;

    /// Label `query` with exactly one query type.
    fn classify_query(&self, query: &str, model: &str) -> Result<QueryType, OracleError>;
}

/// Parse a reply such as `"0, 2,5"` into in-range indices.
///
/// Parts that are not plain digits or that fall outside `0..count` are
/// dropped, so an unusable reply yields an empty vector.
pub fn parse_selection(reply: &str, count: usize) -> Vec<usize> {
    reply
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
        .filter_map(|part| part.parse::<usize>().ok())
        .filter(|&idx| idx < count)
        .collect()
}

/// Map a non-success HTTP status to an oracle failure kind.
pub fn status_error(status: StatusCode) -> OracleError {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        OracleError::AuthFailure(format!("status {status}"))
    } else {
        OracleError::Unavailable(format!("status {status}"))
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

/// Ranking oracle backed by the Anthropic Messages API.
#[derive(Debug, Clone)]
pub struct AnthropicOracle {
    client: Client,
    api_key: String,
    endpoint: String,
}

impl AnthropicOracle {
    pub fn new(api_key: impl Into<String>) -> Result<Self, OracleError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| OracleError::Unavailable(format!("client build failed: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            endpoint: MESSAGES_ENDPOINT.to_string(),
        })
    }

    /// Build from `ANTHROPIC_API_KEY`, or `None` when the key is unset.
    pub fn from_env() -> Result<Option<Self>, OracleError> {
        match std::env::var(API_KEY_ENV_VAR) {
            Ok(key) if !key.trim().is_empty() => Self::new(key).map(Some),
            _ => Ok(None),
        }
    }

    /// Point the client at a different Messages endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn complete(
        &self,
        model: &str,
        system: &str,
        user: &str,
        max_tokens: u32,
    ) -> Result<String, OracleError> {
        let payload = serde_json::json!({
            "model": model,
            "system": system,
            "messages": [{"role": "user", "content": user}],
            "temperature": 0,
            "max_tokens": max_tokens,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&payload)
            .send()
            .map_err(|e| OracleError::Unavailable(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status));
        }

        let body: MessagesResponse = response
            .json()
            .map_err(|e| OracleError::Unparseable(format!("invalid json response: {e}")))?;

        Ok(body
            .content
            .into_iter()
            .find_map(|block| block.text)
            .unwrap_or_default())
    }
}

impl RankingOracle for AnthropicOracle {
    fn select_sections(
        &self,
        query: &str,
        previews: &[SectionPreview],
        model: &str,
    ) -> Result<Vec<usize>, OracleError> {
        let listing = previews
            .iter()
            .map(SectionPreview::render)
            .collect::<Vec<_>>()
            .join("\n");
        let user = format!("Query: {query}\n\nSections:\n{listing}");
        let reply = self.complete(model, SELECT_SYSTEM_PROMPT, &user, SELECT_MAX_TOKENS)?;

        let selected = parse_selection(&reply, previews.len());
        if selected.is_empty() {
            let head: String = reply.chars().take(80).collect();
            return Err(OracleError::Unparseable(format!("no section indices in '{head}'")));
        }
        Ok(selected)
    }

    fn classify_query(&self, query: &str, model: &str) -> Result<QueryType, OracleError> {
        let reply = self.complete(model, CLASSIFY_SYSTEM_PROMPT, query, CLASSIFY_MAX_TOKENS)?;
        let label = reply.trim().to_lowercase();
        label
            .parse()
            .map_err(|_| OracleError::Unparseable(format!("unknown query type '{label}'")))
    }
}


#[cfg(test)]
mod tests {
    use httpmock::prelude::*;

    use super::*;
    use crate::tree::{DocumentType, NodeMetadata};

    /// A mock Messages endpoint answering every authenticated request with
    /// `status` and `body`.
    fn messages_server(status: u16, body: &str) -> MockServer {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST)
                .path("/v1/messages")
                .header("x-api-key", "test-key")
                .header("anthropic-version", API_VERSION);
            then.status(status)
                .header("content-type", "application/json")
                .body(body);
        });
        server
    }

    fn oracle(server: &MockServer) -> AnthropicOracle {
        AnthropicOracle::new("test-key")
            .unwrap()
            .with_endpoint(server.url("/v1/messages"))
    }

    fn previews(n: usize) -> Vec<SectionPreview> {
        (0..n)
            .map(|i| SectionPreview {
                index: i,
                label: i.to_string(),
                title: format!("Section {i}"),
                excerpt: String::new(),
            })
            .collect()
    }

    #[test]
    fn parse_selection_keeps_in_range_digits() {
        assert_eq!(parse_selection("0, 2,5", 4), [0, 2]);
        assert_eq!(parse_selection(" 1 ", 2), [1]);
        assert!(parse_selection("sections one and two", 3).is_empty());
        assert!(parse_selection("-1,+2,1.5", 3).is_empty());
        assert!(parse_selection("", 3).is_empty());
    }

    #[test]
    fn preview_uses_id_and_placeholder_when_unnumbered() {
        let mut node = TreeNode::new("special", NodeMetadata::new(DocumentType::Rulebook));
        node.content = "x".repeat(150);
        let preview = SectionPreview::from_node(3, &node);
        assert_eq!(preview.label, "special");
        assert_eq!(preview.title, "(no title)");
        assert_eq!(preview.excerpt.len(), 100);
        assert!(preview.render().starts_with("3. [special] (no title): xxx"));
    }

    #[test]
    fn status_mapping() {
        assert!(status_error(StatusCode::UNAUTHORIZED).is_fatal());
        assert!(status_error(StatusCode::FORBIDDEN).is_fatal());
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS),
            OracleError::Unavailable(_)
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY),
            OracleError::Unavailable(_)
        ));
    }

    #[test]
    fn selects_sections_from_reply() {
        let server = messages_server(200, r#"{"content":[{"type":"text","text":"2, 0"}]}"#);
        let selected = oracle(&server)
            .select_sections("energy", &previews(3), DEFAULT_MODEL)
            .unwrap();
        assert_eq!(selected, [2, 0]);
    }

    #[test]
    fn unusable_reply_is_unparseable() {
        let server = messages_server(200, r#"{"content":[{"type":"text","text":"none"}]}"#);
        let err = oracle(&server)
            .select_sections("energy", &previews(3), DEFAULT_MODEL)
            .unwrap_err();
        assert!(matches!(err, OracleError::Unparseable(_)));
    }

    #[test]
    fn unauthorized_is_auth_failure() {
        let server = messages_server(401, r#"{"error":"bad key"}"#);
        let err = oracle(&server)
            .classify_query("what is a prize card", DEFAULT_MODEL)
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn server_error_is_unavailable() {
        let server = messages_server(503, "{}");
        let err = oracle(&server)
            .classify_query("what is a prize card", DEFAULT_MODEL)
            .unwrap_err();
        assert!(matches!(err, OracleError::Unavailable(_)));
    }

    #[test]
    fn classification_label_is_parsed() {
        let server =
            messages_server(200, r#"{"content":[{"type":"text","text":" Penalty\n"}]}"#);
        let label = oracle(&server)
            .classify_query("what happens if I draw extra cards", DEFAULT_MODEL)
            .unwrap();
        assert_eq!(label, QueryType::Penalty);
    }

    #[test]
    fn malformed_body_is_unparseable() {
        let server = messages_server(200, "not json");
        let err = oracle(&server)
            .classify_query("what is a prize card", DEFAULT_MODEL)
            .unwrap_err();
        assert!(matches!(err, OracleError::Unparseable(_)));
    }

    #[test]
    fn request_carries_model_and_previews() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/messages")
                .body_contains(DEFAULT_MODEL)
                .body_contains("Section 1");
            then.status(200)
                .body(r#"{"content":[{"type":"text","text":"1"}]}"#);
        });

        let selected = oracle(&server)
            .select_sections("energy", &previews(2), DEFAULT_MODEL)
            .unwrap();
        assert_eq!(selected, [1]);
        mock.assert();
    }

    #[test]
    fn connection_refused_is_unavailable() {
        // Nothing listens on a port once its listener is dropped.
        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let err = AnthropicOracle::new("test-key")
            .unwrap()
            .with_endpoint(format!("http://{addr}/v1/messages"))
            .classify_query("anything", DEFAULT_MODEL)
            .unwrap_err();
        assert!(matches!(err, OracleError::Unavailable(_)));
    }
}
