// SPDX-License-Identifier: MIT

//! OpenAI Embedder - `/embeddings` API implementation

use super::Embedder;
use crate::adk::error::ExternalError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::env;
use std::time::Duration;

const DEFAULT_MODEL: &str = "text-embedding-3-small";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// OpenAI-compatible embedding client
pub struct OpenAIEmbedder {
    client: Client,
    api_key: String,
    model_name: String,
    base_url: String,
}

impl OpenAIEmbedder {
    /// Create a new OpenAIEmbedder
    ///
    /// Requires `OPENAI_API_KEY` environment variable to be set.
    /// Optionally uses `OPENAI_BASE_URL` for custom endpoints.
    pub fn new(model_name: Option<String>) -> Result<Self, ExternalError> {
        let api_key = env::var("OPENAI_API_KEY")
            .map_err(|_| ExternalError::rejected("embeddings", "OPENAI_API_KEY must be set"))?;
        let base_url =
            env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string());

        Ok(Self {
            client: Client::builder().timeout(REQUEST_TIMEOUT).build()?,
            api_key,
            model_name: model_name.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url,
        })
    }

    /// Parse an embeddings response, ordering vectors by their `index`
    fn parse_embeddings_response(
        response: &serde_json::Value,
        expected: usize,
    ) -> Result<Vec<Vec<f32>>, ExternalError> {
        let data = response["data"]
            .as_array()
            .ok_or_else(|| ExternalError::rejected("embeddings", "no data in response"))?;

        let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
        for (position, item) in data.iter().enumerate() {
            let index = item["index"]
                .as_u64()
                .map(|i| i as usize)
                .unwrap_or(position);
            let vector = item["embedding"]
                .as_array()
                .ok_or_else(|| ExternalError::rejected("embeddings", "missing embedding vector"))?
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect();
            indexed.push((index, vector));
        }
        indexed.sort_by_key(|(index, _)| *index);

        if indexed.len() != expected {
            return Err(ExternalError::rejected(
                "embeddings",
                format!("expected {} vectors, got {}", expected, indexed.len()),
            ));
        }

        Ok(indexed.into_iter().map(|(_, v)| v).collect())
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ExternalError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/embeddings", self.base_url);
        let body = json!({
            "model": self.model_name,
            "input": texts,
        });

        log::debug!(
            "Requesting {} embeddings from {} ({})",
            texts.len(),
            url,
            self.model_name
        );

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let message = format!("OpenAI API error {}: {}", status, text);
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                ExternalError::network("embeddings", message)
            } else {
                ExternalError::rejected("embeddings", message)
            });
        }

        let resp_json: serde_json::Value = resp.json().await?;
        Self::parse_embeddings_response(&resp_json, texts.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_embeddings_response_orders_by_index() {
        let response = json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });

        let vectors = OpenAIEmbedder::parse_embeddings_response(&response, 2).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_parse_embeddings_response_count_mismatch() {
        let response = json!({
            "data": [{"index": 0, "embedding": [1.0]}]
        });

        let err = OpenAIEmbedder::parse_embeddings_response(&response, 2).unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_parse_embeddings_response_missing_data() {
        let err = OpenAIEmbedder::parse_embeddings_response(&json!({}), 1).unwrap_err();
        assert!(err.to_string().contains("no data"));
    }
}
