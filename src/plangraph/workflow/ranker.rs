// SPDX-License-Identifier: MIT

//! Capability ranking
//!
//! Picks the top-K capabilities for a task. Semantic similarity through an
//! `Embedder` is preferred; lexical overlap is the fallback whenever the
//! embedder is missing, misbehaves, or does not answer within the timeout.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::adk::capability::Capability;
use crate::adk::embedding::{cosine_similarity, Embedder};
use crate::adk::retry::{retry_with_backoff, RetryPolicy};

/// Bonus per task token found inside the capability name
const NAME_MATCH_BONUS: f64 = 0.3;

/// Per-attempt limit for an embedding batch
pub const DEFAULT_EMBED_TIMEOUT: Duration = Duration::from_secs(10);

/// How the scores of a ranking were computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RankingMethod {
    Embedding,
    Lexical,
}

/// Result of ranking a capability pool against a task
#[derive(Clone)]
pub struct Ranking {
    /// Top-K capabilities, best first
    pub selected: Vec<Arc<dyn Capability>>,
    /// Score of every ranked capability by name
    pub scores: BTreeMap<String, f64>,
    pub method: RankingMethod,
}

impl Ranking {
    pub fn names(&self) -> Vec<&str> {
        self.selected.iter().map(|c| c.name()).collect()
    }
}

impl std::fmt::Debug for Ranking {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ranking")
            .field("selected", &self.names())
            .field("scores", &self.scores)
            .field("method", &self.method)
            .finish()
    }
}

/// Stateless ranker; safe to share across threads
#[derive(Clone)]
pub struct CapabilityRanker {
    embedder: Option<Arc<dyn Embedder>>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl Default for CapabilityRanker {
    fn default() -> Self {
        Self::lexical()
    }
}

impl CapabilityRanker {
    /// Embedding calls are not retried by default and give up after
    /// `DEFAULT_EMBED_TIMEOUT`
    pub fn new(embedder: Option<Arc<dyn Embedder>>) -> Self {
        Self {
            embedder,
            retry: RetryPolicy::none(),
            timeout: DEFAULT_EMBED_TIMEOUT,
        }
    }

    /// Ranker that only uses lexical scoring
    pub fn lexical() -> Self {
        Self::new(None)
    }

    /// Retry transient embedding failures with `policy`
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Per-attempt limit for the embedding call
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Rank `capabilities` against `task` and keep the best `top_k`
    pub async fn rank(
        &self,
        task: &str,
        capabilities: &[Arc<dyn Capability>],
        top_k: usize,
    ) -> Ranking {
        if capabilities.is_empty() || top_k == 0 {
            return Ranking {
                selected: Vec::new(),
                scores: BTreeMap::new(),
                method: RankingMethod::Lexical,
            };
        }

        let (scores, method) = match self.embedding_scores(task, capabilities).await {
            Some(scores) => (scores, RankingMethod::Embedding),
            None => (
                capabilities
                    .iter()
                    .map(|c| lexical_score(task, c.name(), c.description()))
                    .collect(),
                RankingMethod::Lexical,
            ),
        };

        let mut order: Vec<usize> = (0..capabilities.len()).collect();
        // Stable sort keeps declaration order for equal scores
        order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

        let selected = order
            .iter()
            .take(top_k)
            .map(|&i| capabilities[i].clone())
            .collect();
        let scores = capabilities
            .iter()
            .zip(&scores)
            .map(|(c, s)| (c.name().to_string(), *s))
            .collect();

        Ranking {
            selected,
            scores,
            method,
        }
    }

    async fn embedding_scores(
        &self,
        task: &str,
        capabilities: &[Arc<dyn Capability>],
    ) -> Option<Vec<f64>> {
        let embedder = self.embedder.as_ref()?;

        let mut texts = Vec::with_capacity(capabilities.len() + 1);
        texts.push(task.to_string());
        texts.extend(
            capabilities
                .iter()
                .map(|c| format!("{}: {}", c.name(), c.description())),
        );

        let embedded = retry_with_backoff(&self.retry, "embed", self.timeout, || {
            embedder.embed(&texts)
        })
        .await;
        let vectors = match embedded {
            Ok(vectors) => vectors,
            Err(e) => {
                log::warn!("Embedding failed, falling back to lexical ranking: {}", e);
                return None;
            }
        };
        if vectors.len() != texts.len() {
            log::warn!(
                "Embedder returned {} vectors for {} texts, falling back to lexical ranking",
                vectors.len(),
                texts.len()
            );
            return None;
        }

        let (task_vec, cap_vecs) = vectors.split_first()?;
        Some(
            cap_vecs
                .iter()
                .map(|v| cosine_similarity(task_vec, v))
                .collect(),
        )
    }
}

fn tokens(text: &str) -> HashSet<String> {
    text.split_whitespace().map(|t| t.to_lowercase()).collect()
}

/// Jaccard overlap of task tokens with the capability text (name and
/// description) plus a bonus for task tokens contained in the name, clamped
/// to [0, 1]
pub fn lexical_score(task: &str, name: &str, description: &str) -> f64 {
    let task_tokens = tokens(task);
    let capability_tokens = tokens(&format!("{} {}", name, description));

    let union = task_tokens.union(&capability_tokens).count();
    let jaccard = if union == 0 {
        0.0
    } else {
        task_tokens.intersection(&capability_tokens).count() as f64 / union as f64
    };

    let name = name.to_lowercase();
    let name_hits = task_tokens
        .iter()
        .filter(|t| !t.is_empty() && name.contains(t.as_str()))
        .count();

    (jaccard + NAME_MATCH_BONUS * name_hits as f64).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adk::error::ExternalError;
    use async_trait::async_trait;
    use serde_json::Value;

    struct MockCapability {
        name: String,
        description: String,
    }

    #[async_trait]
    impl Capability for MockCapability {
        fn name(&self) -> &str {
            &self.name
        }

        fn description(&self) -> &str {
            &self.description
        }

        async fn invoke(&self, _args: Value) -> Result<Value, ExternalError> {
            Ok(Value::Null)
        }
    }

    fn cap(name: &str, description: &str) -> Arc<dyn Capability> {
        Arc::new(MockCapability {
            name: name.to_string(),
            description: description.to_string(),
        })
    }

    fn pool() -> Vec<Arc<dyn Capability>> {
        vec![
            cap("web_search", "search the web for pages"),
            cap("calculator", "evaluate arithmetic expressions"),
            cap("weather", "current weather for a city"),
            cap("send_email", "send an email message"),
        ]
    }

    /// Maps each text to a fixed vector chosen by keyword
    struct KeywordEmbedder;

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ExternalError> {
            Ok(texts
                .iter()
                .map(|t| {
                    if t.contains("weather") || t.contains("rain") {
                        vec![1.0, 0.0, 0.0]
                    } else if t.contains("arithmetic") || t.contains("sum") {
                        vec![0.0, 1.0, 0.0]
                    } else {
                        vec![0.0, 0.0, 1.0]
                    }
                })
                .collect())
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ExternalError> {
            Err(ExternalError::network("embed", "connection refused"))
        }
    }

    struct ShortEmbedder;

    #[async_trait]
    impl Embedder for ShortEmbedder {
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ExternalError> {
            Ok(vec![vec![1.0]])
        }
    }

    /// Never answers within any reasonable timeout
    struct StalledEmbedder;

    #[async_trait]
    impl Embedder for StalledEmbedder {
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ExternalError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_embedding_ranking() {
        let ranker = CapabilityRanker::new(Some(Arc::new(KeywordEmbedder)));
        let ranking = ranker.rank("will it rain today", &pool(), 1).await;

        assert_eq!(ranking.method, RankingMethod::Embedding);
        assert_eq!(ranking.names(), vec!["weather"]);
        assert_eq!(ranking.scores.len(), 4);
        assert!((ranking.scores["weather"] - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_returns_min_of_k_and_pool() {
        let ranker = CapabilityRanker::lexical();
        assert_eq!(ranker.rank("search", &pool(), 2).await.selected.len(), 2);
        assert_eq!(ranker.rank("search", &pool(), 10).await.selected.len(), 4);
        assert!(ranker.rank("search", &[], 3).await.selected.is_empty());
    }

    #[tokio::test]
    async fn test_ties_keep_declaration_order() {
        let ranker = CapabilityRanker::lexical();
        let ranking = ranker.rank("zzz", &pool(), 4).await;

        assert!(ranking.scores.values().all(|s| *s == 0.0));
        assert_eq!(
            ranking.names(),
            vec!["web_search", "calculator", "weather", "send_email"]
        );
    }

    #[tokio::test]
    async fn test_deterministic() {
        let ranker = CapabilityRanker::lexical();
        let a = ranker.rank("search the web", &pool(), 3).await;
        let b = ranker.rank("search the web", &pool(), 3).await;
        assert_eq!(a.names(), b.names());
        assert_eq!(a.scores, b.scores);
        assert_eq!(a.names()[0], "web_search");
    }

    #[tokio::test]
    async fn test_fallback_on_embedder_failure() {
        let ranker = CapabilityRanker::new(Some(Arc::new(FailingEmbedder)));
        let ranking = ranker.rank("weather in paris", &pool(), 1).await;
        assert_eq!(ranking.method, RankingMethod::Lexical);
        assert_eq!(ranking.names(), vec!["weather"]);

        let ranker = CapabilityRanker::new(Some(Arc::new(ShortEmbedder)));
        let ranking = ranker.rank("weather in paris", &pool(), 1).await;
        assert_eq!(ranking.method, RankingMethod::Lexical);
    }

    #[tokio::test]
    async fn test_fallback_when_embedder_stalls() {
        let ranker = CapabilityRanker::new(Some(Arc::new(StalledEmbedder)))
            .with_timeout(Duration::from_millis(20));

        let started = std::time::Instant::now();
        let ranking = ranker.rank("weather in paris", &pool(), 1).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(ranking.method, RankingMethod::Lexical);
        assert_eq!(ranking.names(), vec!["weather"]);
    }

    #[test]
    fn test_lexical_score() {
        // {send, message} against {mailer, send, a, message}, no name hit
        let score = lexical_score("send message", "mailer", "send a message");
        assert!((score - 0.5).abs() < 1e-9);

        // The name counts as capability text as well as earning the bonus
        let score = lexical_score("weather", "weather", "forecast lookup");
        assert!((score - (1.0 / 3.0 + 0.3)).abs() < 1e-9);

        // Name bonus, clamped
        let score = lexical_score("email email send", "send_email", "send an email message");
        assert!(score <= 1.0);
        assert_eq!(lexical_score("", "anything", ""), 0.0);
    }
}
