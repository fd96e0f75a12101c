// RU-PATH Engine — Generation Client
//
// Calls an OpenAI-compatible chat completions API to phrase replies. The
// model only ever words answers from facts the orchestrator validated —
// decisions (eligibility, routing, intent) are never delegated to it.
// Every failure maps to `Generation`, which the composer recovers from
// with a deterministic reply.

use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::config::GenerationConfig;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

pub struct GenerationClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    timeout: Duration,
}

impl GenerationClient {
    /// Build from config. `None` when no API key is configured — the
    /// composer then uses deterministic phrasing only.
    pub fn from_config(config: &GenerationConfig) -> Option<Self> {
        let api_key = config.api_key.clone().filter(|k| !k.trim().is_empty())?;
        Some(GenerationClient {
            client: Client::builder()
                .connect_timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
            base_url: config.base_url.clone(),
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    /// One-shot completion: system prompt + user message → assistant text.
    pub async fn complete(&self, system: &str, user: &str) -> EngineResult<String> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
        });

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| EngineError::Generation(format!("completion request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(EngineError::Generation(format!("completion {status} — {text}")));
        }

        let v: Value = resp
            .json()
            .await
            .map_err(|e| EngineError::Generation(format!("invalid completion response: {e}")))?;
        let content = v["choices"][0]["message"]["content"]
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| EngineError::Generation("empty completion content".into()))?;
        Ok(content.to_string())
    }
}
