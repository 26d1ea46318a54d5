//! Second-stage reranking of fused candidates.
//!
//! Strategies are tried in order: a cross-encoder scoring service, an LLM
//! listwise ranking, then the incoming order unchanged. Every failure is
//! absorbed and logged, so reranking itself never fails.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lodestone_core::{LlmConfig, LodestoneError, RerankConfig, MAX_LLM_WINDOW};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::llm::{ChatMessage, ChatModel, LlmClient};

/// Characters of each passage shown to the LLM ranker.
const LLM_PASSAGE_CHARS: usize = 600;

/// A candidate passage handed to the reranker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RerankCandidate {
    /// Caller identifier echoed back in the result.
    pub id: String,
    /// Passage text.
    pub text: String,
}

/// Which strategy produced a ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RerankStrategy {
    /// Pairwise cross-encoder scores.
    CrossEncoder,
    /// LLM listwise ranking.
    Llm,
    /// Incoming order preserved.
    Identity,
}

impl fmt::Display for RerankStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RerankStrategy::CrossEncoder => write!(f, "cross-encoder"),
            RerankStrategy::Llm => write!(f, "llm"),
            RerankStrategy::Identity => write!(f, "identity"),
        }
    }
}

/// A pairwise relevance model.
#[async_trait]
pub trait CrossEncoder: Send + Sync {
    /// Score each passage against `query`; one score per passage, in order.
    ///
    /// # Errors
    ///
    /// Returns [`LodestoneError::RerankUnavailable`] if scoring fails.
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, LodestoneError>;
}

#[derive(Serialize)]
struct TeiRequest<'a> {
    query: &'a str,
    texts: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    truncate: bool,
}

#[derive(Deserialize)]
struct TeiScore {
    index: usize,
    score: f32,
}

/// Client for a TEI-compatible `/rerank` endpoint.
#[derive(Debug)]
pub struct HttpCrossEncoder {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl HttpCrossEncoder {
    /// Create a client.
    ///
    /// # Errors
    ///
    /// Returns [`LodestoneError::RerankUnavailable`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self, LodestoneError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LodestoneError::RerankUnavailable(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl CrossEncoder for HttpCrossEncoder {
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, LodestoneError> {
        let request = TeiRequest {
            query,
            texts: passages,
            model: Some(&self.model),
            truncate: true,
        };
        let response = self
            .client
            .post(format!("{}/rerank", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| LodestoneError::RerankUnavailable(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LodestoneError::RerankUnavailable(format!(
                "cross-encoder returned {status}: {body}"
            )));
        }

        let parsed: Vec<TeiScore> = response.json().await.map_err(|e| {
            LodestoneError::RerankUnavailable(format!("failed to parse response: {e}"))
        })?;

        let mut scores = vec![f32::NAN; passages.len()];
        for item in parsed {
            if let Some(slot) = scores.get_mut(item.index) {
                *slot = item.score;
            }
        }
        if scores.iter().any(|s| !s.is_finite()) {
            return Err(LodestoneError::RerankUnavailable(
                "cross-encoder did not score every passage".into(),
            ));
        }
        Ok(scores)
    }
}

/// Reranker with lazily-built model handles.
///
/// # Examples
///
/// ```
/// use lodestone_core::{LlmConfig, RerankConfig};
/// use lodestone_retrieval::rerank::{RerankCandidate, Reranker, RerankStrategy};
///
/// # #[tokio::main]
/// # async fn main() {
/// let reranker = Reranker::new(RerankConfig::default(), LlmConfig::default());
/// let candidates = vec![
///     RerankCandidate { id: "a".into(), text: "first".into() },
///     RerankCandidate { id: "b".into(), text: "second".into() },
/// ];
/// let (ranked, strategy) = reranker.rerank("query", &candidates, 1).await;
/// assert_eq!(strategy, RerankStrategy::Identity);
/// assert_eq!(ranked, vec![("a".to_string(), 1.0)]);
/// # }
/// ```
pub struct Reranker {
    config: RerankConfig,
    llm_config: LlmConfig,
    cross_encoder: OnceCell<Option<Arc<dyn CrossEncoder>>>,
    chat_model: OnceCell<Option<Arc<dyn ChatModel>>>,
}

impl fmt::Debug for Reranker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reranker")
            .field("cross_encoder_url", &self.config.cross_encoder_url)
            .field("llm_fallback", &self.config.llm_fallback)
            .finish_non_exhaustive()
    }
}

impl Reranker {
    /// Create a reranker from the `[rerank]` and `[llm]` config sections.
    pub fn new(config: RerankConfig, llm_config: LlmConfig) -> Self {
        Self {
            config,
            llm_config,
            cross_encoder: OnceCell::new(),
            chat_model: OnceCell::new(),
        }
    }

    /// Use `encoder` instead of building one from config.
    pub fn with_cross_encoder(mut self, encoder: Arc<dyn CrossEncoder>) -> Self {
        self.cross_encoder = OnceCell::new_with(Some(Some(encoder)));
        self
    }

    /// Use `model` for the listwise fallback instead of building one from config.
    pub fn with_chat_model(mut self, model: Arc<dyn ChatModel>) -> Self {
        self.chat_model = OnceCell::new_with(Some(Some(model)));
        self
    }

    async fn cross_encoder(&self) -> Option<Arc<dyn CrossEncoder>> {
        self.cross_encoder
            .get_or_init(|| async {
                let url = self.config.cross_encoder_url.as_deref()?;
                match HttpCrossEncoder::new(
                    url,
                    &self.config.cross_encoder_model,
                    Duration::from_secs(self.llm_config.timeout_secs),
                ) {
                    Ok(encoder) => Some(Arc::new(encoder) as Arc<dyn CrossEncoder>),
                    Err(e) => {
                        warn!(error = %e, "cross-encoder unavailable");
                        None
                    }
                }
            })
            .await
            .clone()
    }

    async fn chat_model(&self) -> Option<Arc<dyn ChatModel>> {
        self.chat_model
            .get_or_init(|| async {
                if !self.config.llm_fallback {
                    return None;
                }
                if self.llm_config.api_key.is_none() && self.llm_config.base_url.is_none() {
                    warn!("llm rerank fallback enabled without credentials");
                    return None;
                }
                match LlmClient::new(&self.llm_config) {
                    Ok(client) => Some(Arc::new(client) as Arc<dyn ChatModel>),
                    Err(e) => {
                        warn!(error = %e, "llm reranker unavailable");
                        None
                    }
                }
            })
            .await
            .clone()
    }

    /// Rank `candidates` against `query`, returning at most `top_k`
    /// `(id, score)` pairs and the strategy that produced them.
    pub async fn rerank(
        &self,
        query: &str,
        candidates: &[RerankCandidate],
        top_k: usize,
    ) -> (Vec<(String, f32)>, RerankStrategy) {
        if candidates.is_empty() || top_k == 0 {
            return (Vec::new(), RerankStrategy::Identity);
        }

        if let Some(encoder) = self.cross_encoder().await {
            match cross_encoder_rank(encoder.as_ref(), query, candidates, top_k).await {
                Ok(ranked) => return (ranked, RerankStrategy::CrossEncoder),
                Err(e) => warn!(error = %e, "cross-encoder rerank failed, falling back"),
            }
        }

        if let Some(model) = self.chat_model().await {
            let window = self.config.llm_window.min(MAX_LLM_WINDOW);
            match llm_rank(model.as_ref(), query, candidates, window, top_k).await {
                Ok(ranked) => return (ranked, RerankStrategy::Llm),
                Err(e) => warn!(error = %e, "llm rerank failed, falling back"),
            }
        }

        debug!("rerank using incoming order");
        (identity_rank(candidates, top_k), RerankStrategy::Identity)
    }
}

async fn cross_encoder_rank(
    encoder: &dyn CrossEncoder,
    query: &str,
    candidates: &[RerankCandidate],
    top_k: usize,
) -> Result<Vec<(String, f32)>, LodestoneError> {
    let texts: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
    let scores = encoder.score(query, &texts).await?;
    if scores.len() != candidates.len() || scores.iter().any(|s| !s.is_finite()) {
        return Err(LodestoneError::RerankUnavailable(format!(
            "expected {} finite scores, got {}",
            candidates.len(),
            scores.len()
        )));
    }

    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(order
        .into_iter()
        .take(top_k)
        .map(|i| (candidates[i].id.clone(), scores[i]))
        .collect())
}

async fn llm_rank(
    model: &dyn ChatModel,
    query: &str,
    candidates: &[RerankCandidate],
    window: usize,
    top_k: usize,
) -> Result<Vec<(String, f32)>, LodestoneError> {
    let window = window.clamp(1, candidates.len());
    let shown = &candidates[..window];

    let mut passages = String::new();
    for (i, candidate) in shown.iter().enumerate() {
        let text: String = candidate.text.chars().take(LLM_PASSAGE_CHARS).collect();
        passages.push_str(&format!("[{i}] {}\n\n", text.replace('\n', " ")));
    }

    let messages = vec![
        ChatMessage::system(
            "You rank passages by how well they answer a question. \
             Respond with JSON of the form {\"ranking\": [i, ...]} listing \
             passage indices (0-based) from most to least relevant.",
        ),
        ChatMessage::user(format!("Question: {query}\n\nPassages:\n{passages}")),
    ];

    let raw = model.chat(messages).await?;
    let ranked = parse_ranking(&raw, window);
    if ranked.is_empty() {
        return Err(LodestoneError::RerankUnavailable(format!(
            "no usable indices in ranking: {raw}"
        )));
    }

    let seen: HashSet<usize> = ranked.iter().copied().collect();
    let order = ranked
        .into_iter()
        .chain((0..candidates.len()).filter(|i| !seen.contains(i)));

    Ok(order
        .take(top_k)
        .enumerate()
        .map(|(rank, i)| (candidates[i].id.clone(), reciprocal(rank)))
        .collect())
}

fn identity_rank(candidates: &[RerankCandidate], top_k: usize) -> Vec<(String, f32)> {
    candidates
        .iter()
        .take(top_k)
        .enumerate()
        .map(|(rank, c)| (c.id.clone(), reciprocal(rank)))
        .collect()
}

fn reciprocal(rank: usize) -> f32 {
    1.0 / (rank as f32 + 1.0)
}

/// Extract a ranking of indices below `len` from an LLM reply.
///
/// Accepts `{"ranking": [...]}`, a bare JSON array, or any text containing
/// integers. Duplicates and out-of-range indices are dropped.
///
/// # Examples
///
/// ```
/// use lodestone_retrieval::rerank::parse_ranking;
///
/// assert_eq!(parse_ranking(r#"{"ranking": [2, 0, 2, 9]}"#, 3), vec![2, 0]);
/// assert_eq!(parse_ranking("[1, 0]", 2), vec![1, 0]);
/// assert_eq!(parse_ranking("best is 1, then 0", 2), vec![1, 0]);
/// assert!(parse_ranking("none", 2).is_empty());
/// ```
pub fn parse_ranking(raw: &str, len: usize) -> Vec<usize> {
    let values: Vec<u64> = match serde_json::from_str::<serde_json::Value>(raw.trim()) {
        Ok(serde_json::Value::Object(map)) => map
            .get("ranking")
            .and_then(|v| v.as_array())
            .map(|items| items.iter().filter_map(json_index).collect())
            .unwrap_or_else(|| loose_integers(raw)),
        Ok(serde_json::Value::Array(items)) => items.iter().filter_map(json_index).collect(),
        _ => loose_integers(raw),
    };

    let mut seen = HashSet::new();
    values
        .into_iter()
        .filter_map(|v| usize::try_from(v).ok())
        .filter(|&i| i < len && seen.insert(i))
        .collect()
}

fn json_index(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64)),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn loose_integers(raw: &str) -> Vec<u64> {
    raw.split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingEncoder;

    #[async_trait]
    impl CrossEncoder for FailingEncoder {
        async fn score(&self, _query: &str, _passages: &[String]) -> Result<Vec<f32>, LodestoneError> {
            Err(LodestoneError::RerankUnavailable("model offline".into()))
        }
    }

    struct LengthEncoder;

    #[async_trait]
    impl CrossEncoder for LengthEncoder {
        async fn score(&self, _query: &str, passages: &[String]) -> Result<Vec<f32>, LodestoneError> {
            Ok(passages.iter().map(|p| p.len() as f32).collect())
        }
    }

    struct ScriptedChat {
        reply: Result<String, String>,
        calls: AtomicUsize,
    }

    impl ScriptedChat {
        fn replying(reply: &str) -> Self {
            Self {
                reply: Ok(reply.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedChat {
        async fn chat(&self, _messages: Vec<ChatMessage>) -> Result<String, LodestoneError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone().map_err(LodestoneError::Llm)
        }
    }

    fn candidates(texts: &[&str]) -> Vec<RerankCandidate> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| RerankCandidate {
                id: format!("c{i}"),
                text: t.to_string(),
            })
            .collect()
    }

    fn ids(ranked: &[(String, f32)]) -> Vec<&str> {
        ranked.iter().map(|(id, _)| id.as_str()).collect()
    }

    fn llm_enabled() -> RerankConfig {
        RerankConfig {
            llm_fallback: true,
            ..RerankConfig::default()
        }
    }

    #[tokio::test]
    async fn identity_when_nothing_configured() {
        let reranker = Reranker::new(RerankConfig::default(), LlmConfig::default());
        let (ranked, strategy) = reranker.rerank("q", &candidates(&["a", "b", "c"]), 2).await;
        assert_eq!(strategy, RerankStrategy::Identity);
        assert_eq!(ids(&ranked), vec!["c0", "c1"]);
        assert_eq!(ranked[1].1, 0.5);
    }

    #[tokio::test]
    async fn cross_encoder_orders_by_score() {
        let reranker = Reranker::new(RerankConfig::default(), LlmConfig::default())
            .with_cross_encoder(Arc::new(LengthEncoder));
        let (ranked, strategy) = reranker
            .rerank("q", &candidates(&["aa", "aaaa", "a"]), 3)
            .await;
        assert_eq!(strategy, RerankStrategy::CrossEncoder);
        assert_eq!(ids(&ranked), vec!["c1", "c0", "c2"]);
    }

    #[tokio::test]
    async fn failing_cross_encoder_falls_back_to_llm() {
        let chat = Arc::new(ScriptedChat::replying(r#"{"ranking":[2,0]}"#));
        let reranker = Reranker::new(llm_enabled(), LlmConfig::default())
            .with_cross_encoder(Arc::new(FailingEncoder))
            .with_chat_model(chat.clone());

        let (ranked, strategy) = reranker.rerank("q", &candidates(&["a", "b", "c"]), 3).await;
        assert_eq!(strategy, RerankStrategy::Llm);
        assert_eq!(ids(&ranked), vec!["c2", "c0", "c1"]);
        assert_eq!(ranked[0].1, 1.0);
        assert_eq!(chat.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unusable_llm_reply_falls_back_to_identity() {
        let reranker = Reranker::new(llm_enabled(), LlmConfig::default())
            .with_cross_encoder(Arc::new(FailingEncoder))
            .with_chat_model(Arc::new(ScriptedChat::replying("{\"ranking\": [7, 8]}")));
        let (ranked, strategy) = reranker.rerank("q", &candidates(&["a", "b"]), 5).await;
        assert_eq!(strategy, RerankStrategy::Identity);
        assert_eq!(ids(&ranked), vec!["c0", "c1"]);
    }

    #[tokio::test]
    async fn llm_error_falls_back_to_identity() {
        let chat = ScriptedChat {
            reply: Err("timeout".into()),
            calls: AtomicUsize::new(0),
        };
        let reranker = Reranker::new(llm_enabled(), LlmConfig::default())
            .with_chat_model(Arc::new(chat));
        let (_, strategy) = reranker.rerank("q", &candidates(&["a"]), 1).await;
        assert_eq!(strategy, RerankStrategy::Identity);
    }

    #[tokio::test]
    async fn llm_window_limits_what_is_ranked() {
        let config = RerankConfig {
            llm_window: 2,
            ..llm_enabled()
        };
        // Index 3 is outside the window and must be ignored
        let reranker = Reranker::new(config, LlmConfig::default())
            .with_chat_model(Arc::new(ScriptedChat::replying("[3, 1]")));
        let (ranked, strategy) = reranker
            .rerank("q", &candidates(&["a", "b", "c", "d"]), 4)
            .await;
        assert_eq!(strategy, RerankStrategy::Llm);
        assert_eq!(ids(&ranked), vec!["c1", "c0", "c2", "c3"]);
    }

    #[tokio::test]
    async fn empty_input_or_zero_k() {
        let reranker = Reranker::new(RerankConfig::default(), LlmConfig::default());
        assert!(reranker.rerank("q", &[], 3).await.0.is_empty());
        assert!(reranker.rerank("q", &candidates(&["a"]), 0).await.0.is_empty());
    }

    #[test]
    fn parse_ranking_variants() {
        assert_eq!(parse_ranking(r#"{"ranking":["1", 0]}"#, 2), vec![1, 0]);
        assert_eq!(parse_ranking(r#"{"order":[1]}"#, 2), vec![1]);
        assert_eq!(parse_ranking("```json\n[0, 0, 1]\n```", 2), vec![0, 1]);
        assert_eq!(parse_ranking("[2.0, 1]", 3), vec![2, 1]);
    }
}
