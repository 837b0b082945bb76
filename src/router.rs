//! Query routing: decide which documents a question concerns.
//!
//! Scoring is additive. Each document starts from the number of its routing
//! hints found in the query, gains a boost for every card name detected in
//! it, and then picks up persona and query-type biases.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::SystemTime,
};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    config::DomainConfig,
    error::{Error, Result},
    oracle::RankingOracle,
};

const AMBIGUITY_THRESHOLD: f64 = 1.0;
const AMBIGUITY_GAP: f64 = 0.5;
const CARD_MATCH_BOOST: f64 = 3.0;
const SINGLE_DOCUMENT_CONFIDENCE: f64 = 0.8;

const INTERACTION_KEYWORDS: &[&str] = &[
    "how does",
    "play off",
    "interact",
    "affect",
    "work with",
    "work together",
    "prevent",
    "block",
    "stack",
    "combo",
    "combined",
    "does it",
    "override",
    "negate",
];

const PENALTY_KEYWORDS: &[&str] = &[
    "penalty",
    "infraction",
    "marked card",
    "game loss",
    "warning",
    "disqualif",
    "slow play",
    "deck error",
    "drawing extra",
    "unsporting",
    "caution",
];

const FORMAT_KEYWORDS: &[&str] = &[
    "legal", "banned", "standard", "expanded", "format", "rotation", "allowed", "playable",
];

const CARD_SPECIFIC_KEYWORDS: &[&str] = &["errata", "card text", "errata'd"];

/// Who the eventual answer is written for.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
    clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum Persona {
    #[default]
    Judge,
    Professor,
    Player,
}

impl Persona {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Judge => "judge",
            Self::Professor => "professor",
            Self::Player => "player",
        }
    }

    fn bias(self) -> &'static [(&'static str, f64)] {
        match self {
            Self::Judge => &[("rulebook", 0.5), ("penalty_guidelines", 0.5)],
            Self::Professor => &[("rulebook", 0.5), ("penalty_guidelines", 0.3)],
            Self::Player => &[("rulebook", 0.5), ("penalty_guidelines", -0.5)],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    RulesLookup,
    Penalty,
    FormatLegality,
    CardSpecific,
    CardInteraction,
}

impl QueryType {
    pub const ALL: [QueryType; 5] = [
        QueryType::RulesLookup,
        QueryType::Penalty,
        QueryType::FormatLegality,
        QueryType::CardSpecific,
        QueryType::CardInteraction,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RulesLookup => "rules_lookup",
            Self::Penalty => "penalty",
            Self::FormatLegality => "format_legality",
            Self::CardSpecific => "card_specific",
            Self::CardInteraction => "card_interaction",
        }
    }

    fn bias(self) -> &'static [(&'static str, f64)] {
        match self {
            Self::Penalty => &[("penalty_guidelines", 2.0)],
            Self::RulesLookup => &[("rulebook", 1.0)],
            Self::FormatLegality => &[("legal_card_list", 2.0)],
            Self::CardSpecific => &[("rulebook", 0.5)],
            Self::CardInteraction => &[("rulebook", 1.0), ("rulings_compendium", 1.5)],
        }
    }
}

impl std::fmt::Display for QueryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueryType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown query type '{s}'"))
    }
}

/// Router output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteDecision {
    /// Target documents, best first.
    pub documents: Vec<String>,
    pub persona: Persona,
    pub confidence: f64,
    pub reasoning: String,
    pub card_names: Vec<String>,
}

/// A small memoisation table.
///
/// Concurrent writers may race on the same key; the last write wins, which
/// is harmless because values are deterministic per key.
pub trait MemoCache<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Option<V>;
    fn put(&self, key: K, value: V);
    fn invalidate(&self);
}

/// `(query, model)` to the label the oracle gave it.
pub type ClassificationKey = (String, String);

/// Process-lifetime cache of successful oracle classifications.
#[derive(Debug, Default)]
pub struct ClassificationCache {
    entries: Mutex<HashMap<ClassificationKey, QueryType>>,
}

impl ClassificationCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<ClassificationKey, QueryType>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MemoCache<ClassificationKey, QueryType> for ClassificationCache {
    fn get(&self, key: &ClassificationKey) -> Option<QueryType> {
        self.entries().get(key).copied()
    }

    fn put(&self, key: ClassificationKey, value: QueryType) {
        self.entries().insert(key, value);
    }

    fn invalidate(&self) {
        self.entries().clear();
    }
}

/// A card name found in a query, and the card database it lives in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardMatch {
    pub name: String,
    pub document: String,
}

#[derive(Debug, Default)]
struct CardNameState {
    loaded: bool,
    mtime: Option<SystemTime>,
    /// Sorted longest name first, ties alphabetical.
    entries: Arc<Vec<(String, String)>>,
}

/// Lower-cased card name to card-database document, produced by card
/// ingestion.
///
/// A file-backed index reloads itself whenever the file's modification time
/// changes. A missing or unreadable file behaves as an empty index.
#[derive(Debug)]
pub struct CardNameIndex {
    source: Option<PathBuf>,
    state: Mutex<CardNameState>,
}

impl CardNameIndex {
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            source: Some(path.into()),
            state: Mutex::new(CardNameState::default()),
        }
    }

    /// A fixed in-memory index that never reloads.
    pub fn from_map<I, K, V>(names: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> = names
            .into_iter()
            .map(|(k, v)| (k.into().to_lowercase(), v.into()))
            .collect();
        Self {
            source: None,
            state: Mutex::new(CardNameState {
                loaded: true,
                mtime: None,
                entries: Arc::new(sorted_entries(map)),
            }),
        }
    }

    pub fn empty() -> Self {
        Self::from_map(Vec::<(String, String)>::new())
    }

    /// Current entries, reloading from disk if the file changed.
    pub fn entries(&self) -> Arc<Vec<(String, String)>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(path) = &self.source else {
            return Arc::clone(&state.entries);
        };

        let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        if !state.loaded || state.mtime != mtime {
            state.entries = Arc::new(sorted_entries(load_card_names(path)));
            state.mtime = mtime;
            state.loaded = true;
        }
        Arc::clone(&state.entries)
    }

    /// Force the next access to reread the file.
    pub fn invalidate(&self) {
        if self.source.is_some() {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.loaded = false;
        }
    }

    pub fn detect(&self, query: &str) -> Vec<CardMatch> {
        detect_card_names(query, &self.entries())
    }
}

fn load_card_names(path: &Path) -> HashMap<String, String> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no card name index yet");
            return HashMap::new();
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read card name index");
            return HashMap::new();
        }
    };
    match serde_json::from_str(&content) {
        Ok(map) => map,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to parse card name index");
            HashMap::new()
        }
    }
}

fn sorted_entries(map: HashMap<String, String>) -> Vec<(String, String)> {
    let mut entries: Vec<_> = map.into_iter().collect();
    entries.sort_by(|a, b| {
        b.0.chars()
            .count()
            .cmp(&a.0.chars().count())
            .then_with(|| a.0.cmp(&b.0))
    });
    entries
}

/// Find card names in `query`, longest first.
///
/// Only the first occurrence of each name is considered. It is accepted
/// when it sits on word boundaries and does not overlap an earlier match.
/// `entries` must already be sorted longest first.
pub fn detect_card_names(query: &str, entries: &[(String, String)]) -> Vec<CardMatch> {
    let q = query.to_lowercase();
    let mut matches = Vec::new();
    let mut spans: Vec<(usize, usize)> = Vec::new();

    for (name, document) in entries {
        if name.is_empty() {
            continue;
        }
        let Some(start) = q.find(name.as_str()) else {
            continue;
        };
        let end = start + name.len();

        let before = q[..start].chars().next_back();
        let after = q[end..].chars().next();
        if before.is_some_and(char::is_alphanumeric) || after.is_some_and(char::is_alphanumeric) {
            continue;
        }
        if spans.iter().any(|&(s, e)| start < e && s < end) {
            continue;
        }

        spans.push((start, end));
        matches.push(CardMatch {
            name: name.clone(),
            document: document.clone(),
        });
    }

    matches
}

pub fn has_interaction_intent(query: &str) -> bool {
    let q = query.to_lowercase();
    INTERACTION_KEYWORDS.iter().any(|kw| q.contains(kw))
}

/// Keyword classification. Penalty wins over format, format over card
/// text; card interactions are inferred from detected card names.
pub fn classify(query: &str, cards: &[CardMatch]) -> QueryType {
    let q = query.to_lowercase();
    let any_of = |keywords: &[&str]| keywords.iter().any(|kw| q.contains(kw));

    if any_of(PENALTY_KEYWORDS) {
        QueryType::Penalty
    } else if any_of(FORMAT_KEYWORDS) {
        QueryType::FormatLegality
    } else if any_of(CARD_SPECIFIC_KEYWORDS) {
        QueryType::CardSpecific
    } else if (!cards.is_empty() && has_interaction_intent(&q)) || cards.len() >= 2 {
        QueryType::CardInteraction
    } else {
        QueryType::RulesLookup
    }
}

/// Whether keyword scores are too flat to trust.
pub fn is_ambiguous(scores: &BTreeMap<String, f64>) -> bool {
    let mut ranked: Vec<f64> = scores.values().copied().collect();
    ranked.sort_by(|a, b| b.total_cmp(a));
    match ranked.as_slice() {
        [] => true,
        [top, ..] if *top <= AMBIGUITY_THRESHOLD => true,
        [top, second, ..] => top - second <= AMBIGUITY_GAP,
        [_] => false,
    }
}

fn add(scores: &mut BTreeMap<String, f64>, document: &str, amount: f64) {
    if let Some(score) = scores.get_mut(document) {
        *score += amount;
    }
}

fn confidence(ranked: &[(String, f64)]) -> f64 {
    let raw = match ranked {
        [(_, top), _, ..] => {
            let total: f64 = ranked.iter().map(|(_, s)| s.max(0.0)).sum();
            let total = if total == 0.0 { 1.0 } else { total };
            (top / total).min(1.0)
        }
        _ => SINGLE_DOCUMENT_CONFIDENCE,
    };
    ((raw.clamp(0.0, 1.0) * 100.0).round() / 100.0).clamp(0.0, 1.0)
}

pub struct Router {
    card_names: CardNameIndex,
    cache: Arc<dyn MemoCache<ClassificationKey, QueryType>>,
    oracle: Option<Arc<dyn RankingOracle>>,
}

impl Router {
    pub fn new(card_names: CardNameIndex) -> Self {
        Self {
            card_names,
            cache: Arc::new(ClassificationCache::new()),
            oracle: None,
        }
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn RankingOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn MemoCache<ClassificationKey, QueryType>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn card_names(&self) -> &CardNameIndex {
        &self.card_names
    }

    pub fn oracle(&self) -> Option<&Arc<dyn RankingOracle>> {
        self.oracle.as_ref()
    }

    pub fn detect_card_names(&self, query: &str) -> Vec<CardMatch> {
        self.card_names.detect(query)
    }

    /// Ask the oracle for a label. Recoverable failures yield `None` and are
    /// not cached, so the next call retries.
    fn llm_classify(&self, query: &str, model: &str) -> Result<Option<QueryType>> {
        let key = (query.to_string(), model.to_string());
        if let Some(hit) = self.cache.get(&key) {
            return Ok(Some(hit));
        }
        let Some(oracle) = &self.oracle else {
            return Ok(None);
        };

        match oracle.classify_query(query, model) {
            Ok(query_type) => {
                self.cache.put(key, query_type);
                Ok(Some(query_type))
            }
            Err(e) if e.is_fatal() => Err(Error::Oracle(e)),
            Err(e) => {
                tracing::warn!(error = %e, "llm classification failed, keeping keyword type");
                Ok(None)
            }
        }
    }

    pub fn route(
        &self,
        query: &str,
        config: &DomainConfig,
        persona: Persona,
        use_llm: bool,
        model: &str,
    ) -> Result<RouteDecision> {
        let q = query.to_lowercase();

        let mut scores: BTreeMap<String, f64> = config
            .routing_hints
            .iter()
            .map(|(document, keywords)| {
                let hits = keywords
                    .iter()
                    .filter(|kw| q.contains(kw.to_lowercase().as_str()))
                    .count();
                (document.clone(), hits as f64)
            })
            .collect();

        let cards = self.card_names.detect(query);
        let card_documents: BTreeSet<&str> = cards.iter().map(|c| c.document.as_str()).collect();
        for document in card_documents {
            add(&mut scores, document, CARD_MATCH_BOOST);
        }
        if !cards.is_empty() && has_interaction_intent(query) {
            add(&mut scores, "rulebook", 1.0);
            add(&mut scores, "rulings_compendium", 2.0);
        }

        let mut query_type = classify(query, &cards);
        let mut llm_used = false;
        if use_llm && is_ambiguous(&scores) {
            if let Some(llm_type) = self.llm_classify(query, model)? {
                query_type = llm_type;
                llm_used = true;
            }
        }

        for &(document, amount) in persona.bias() {
            add(&mut scores, document, amount);
        }
        for &(document, amount) in query_type.bias() {
            add(&mut scores, document, amount);
        }

        let mut ranked: Vec<(String, f64)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

        let mut documents: Vec<String> = ranked
            .iter()
            .filter(|(_, score)| *score > 0.0)
            .map(|(name, _)| name.clone())
            .collect();
        if documents.is_empty() {
            if let Some((_, max)) = ranked.first() {
                documents = ranked
                    .iter()
                    .filter(|(_, score)| score == max)
                    .map(|(name, _)| name.clone())
                    .collect();
            }
        }

        let card_names: Vec<String> = cards.into_iter().map(|c| c.name).collect();

        let mut reasoning = vec![format!("query_type={query_type}")];
        if llm_used {
            reasoning.push("llm_classified".to_string());
        }
        if !card_names.is_empty() {
            reasoning.push(format!("cards_detected={}", card_names.join(",")));
        }
        reasoning.extend(
            ranked
                .iter()
                .filter(|(_, score)| *score > 0.0)
                .map(|(name, score)| format!("{name}={score:.1}")),
        );

        let decision = RouteDecision {
            documents,
            persona,
            confidence: confidence(&ranked),
            reasoning: reasoning.join(", "),
            card_names,
        };
        tracing::debug!(
            documents = ?decision.documents,
            confidence = decision.confidence,
            reasoning = %decision.reasoning,
            "routed query"
        );
        Ok(decision)
    }
}
