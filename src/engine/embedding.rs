// RU-PATH Engine — Embedding Client
//
// Calls Ollama or OpenAI-compatible embedding APIs to produce vector
// representations of text. Used by the embedding index for semantic
// retrieval of fact records.

use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::config::EmbeddingConfig;
use log::info;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

/// Embedding client — calls Ollama or an OpenAI-compatible embedding API.
pub struct EmbeddingClient {
    client: Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl EmbeddingClient {
    /// Build from config. Returns `None` when embeddings are disabled
    /// (`base_url` unset) — the orchestrator then uses keyword retrieval.
    pub fn from_config(config: &EmbeddingConfig) -> Option<Self> {
        let base_url = config.base_url.clone()?;
        Some(EmbeddingClient {
            client: Client::builder()
                .connect_timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
            base_url,
            model: config.model.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    /// Get the embedding vector for a text string.
    /// Tries the Ollama API formats first, then the OpenAI format.
    /// Every failure maps to `EmbeddingUnavailable` — recoverable by
    /// falling back to keyword retrieval.
    pub async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        let ollama_err = match self.embed_ollama(text).await {
            Ok(vec) => return Ok(vec),
            Err(e) => e,
        };

        match self.embed_openai(text).await {
            Ok(vec) => Ok(vec),
            Err(openai_err) => Err(EngineError::EmbeddingUnavailable(format!(
                "Ollama: {ollama_err} | OpenAI: {openai_err}"
            ))),
        }
    }

    /// Ollama current API: POST /api/embed { model, input } → { embeddings: [[f32...]] }
    /// Falls back to legacy: POST /api/embeddings { model, prompt } → { embedding: [f32...] }
    async fn embed_ollama(&self, text: &str) -> Result<Vec<f32>, String> {
        let new_url = format!("{}/api/embed", self.base_url.trim_end_matches('/'));
        let new_body = json!({ "model": self.model, "input": text });

        let new_result = self
            .client
            .post(&new_url)
            .json(&new_body)
            .timeout(self.timeout)
            .send()
            .await;

        if let Ok(resp) = new_result {
            if resp.status().is_success() {
                if let Ok(v) = resp.json::<Value>().await {
                    if let Some(first) = v["embeddings"]
                        .as_array()
                        .and_then(|e| e.first())
                        .and_then(|e| e.as_array())
                    {
                        let vec = to_f32_vec(first);
                        if !vec.is_empty() {
                            return Ok(vec);
                        }
                    }
                    // Some Ollama versions return singular "embedding" even on /api/embed
                    if let Some(embedding) = v["embedding"].as_array() {
                        let vec = to_f32_vec(embedding);
                        if !vec.is_empty() {
                            return Ok(vec);
                        }
                    }
                }
            } else {
                info!(
                    "[embedding] /api/embed returned {} — trying legacy endpoint",
                    resp.status()
                );
            }
        }

        let legacy_url = format!("{}/api/embeddings", self.base_url.trim_end_matches('/'));
        let legacy_body = json!({ "model": self.model, "prompt": text });

        let resp = self
            .client
            .post(&legacy_url)
            .json(&legacy_body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| format!("embedding endpoint not reachable at {}: {e}", self.base_url))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(format!("embed {status} — {text}"));
        }

        let v: Value = resp.json().await.map_err(|e| e.to_string())?;
        let embedding = v["embedding"]
            .as_array()
            .ok_or_else(|| "no 'embedding' array in response".to_string())?;
        let vec = to_f32_vec(embedding);
        if vec.is_empty() {
            return Err("empty embedding vector".into());
        }
        Ok(vec)
    }

    /// OpenAI-compatible format: POST /v1/embeddings { model, input }
    async fn embed_openai(&self, text: &str) -> Result<Vec<f32>, String> {
        let url = format!("{}/v1/embeddings", self.base_url.trim_end_matches('/'));
        let body = json!({ "model": self.model, "input": text });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(format!("embed {status} — {text}"));
        }

        let v: Value = resp.json().await.map_err(|e| e.to_string())?;
        let embedding = v["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| "no 'data[0].embedding' array in response".to_string())?;
        let vec = to_f32_vec(embedding);
        if vec.is_empty() {
            return Err("empty embedding vector".into());
        }
        Ok(vec)
    }
}

fn to_f32_vec(values: &[Value]) -> Vec<f32> {
    values.iter().filter_map(|v| v.as_f64().map(|f| f as f32)).collect()
}
