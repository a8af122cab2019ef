//! HTTP execution service client
//!
//! Talks to an Ollama-style local inference server: `GET /api/ps` for the
//! resident set and `POST /api/generate` (non-streaming) for inference.
//! Warm-up and unload are both expressed through `keep_alive` on an
//! empty-prompt generate call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::exec::{ExecutionService, GenerateOptions, GenerateOutcome, ResidentModelInfo};
use crate::types::FleetError;

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Client for an Ollama-compatible execution service.
pub struct HttpExecutionService {
    client: reqwest::Client,
    base_url: String,
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    keep_alive: i64,
    options: WireOptions,
}

#[derive(Debug, Serialize)]
struct WireOptions {
    num_ctx: u32,
    num_predict: u32,
    temperature: f32,
    top_p: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    /// Total wall time in nanoseconds, as reported by the service.
    #[serde(default)]
    total_duration: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PsResponse {
    #[serde(default)]
    models: Vec<PsModel>,
}

#[derive(Debug, Deserialize)]
struct PsModel {
    name: String,
    /// Resident size in bytes.
    #[serde(default)]
    size: u64,
}

impl HttpExecutionService {
    pub fn new(base_url: Option<String>, timeout: Duration) -> Result<Self, FleetError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FleetError::Unknown(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        })
    }

    fn classify_status(status: reqwest::StatusCode, model: &str, body: &str) -> FleetError {
        let detail = format!("{} ({}): {}", model, status, body);
        match status.as_u16() {
            404 => FleetError::NotFound(detail),
            401 | 403 => FleetError::Auth(detail),
            429 => FleetError::Transient(detail),
            507 => FleetError::ResourceExhausted(detail),
            code if code >= 500 => FleetError::Transient(detail),
            _ => {
                if body.contains("no space") || body.contains("out of memory") {
                    FleetError::ResourceExhausted(detail)
                } else {
                    FleetError::Unknown(detail)
                }
            }
        }
    }

    fn classify_request_error(e: reqwest::Error, subject: &str) -> FleetError {
        let detail = format!("{}: {}", subject, e);
        if e.is_timeout() || e.is_connect() {
            FleetError::Transient(detail)
        } else {
            FleetError::Unknown(detail)
        }
    }
}

#[async_trait]
impl ExecutionService for HttpExecutionService {
    async fn list(&self) -> Result<Vec<ResidentModelInfo>, FleetError> {
        let url = format!("{}/api/ps", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::classify_request_error(e, "list"))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Self::classify_request_error(e, "list"))?;
        if !status.is_success() {
            return Err(Self::classify_status(status, "list", &body));
        }

        let ps: PsResponse = serde_json::from_str(&body)
            .map_err(|e| FleetError::Unknown(format!("list: bad response body: {}", e)))?;
        Ok(ps
            .models
            .into_iter()
            .map(|m| ResidentModelInfo {
                name: m.name,
                ram_gb: m.size as f64 / 1024.0 / 1024.0 / 1024.0,
            })
            .collect())
    }

    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<GenerateOutcome, FleetError> {
        let url = format!("{}/api/generate", self.base_url);
        let request = GenerateRequest {
            model,
            prompt,
            stream: false,
            keep_alive: options.keep_alive_secs,
            options: WireOptions {
                num_ctx: options.context_size,
                num_predict: options.max_tokens,
                temperature: options.temperature,
                top_p: options.top_p,
            },
        };

        let started = Instant::now();
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Self::classify_request_error(e, model))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Self::classify_request_error(e, model))?;
        if !status.is_success() {
            return Err(Self::classify_status(status, model, &body));
        }

        let parsed: GenerateResponse = serde_json::from_str(&body)
            .map_err(|e| FleetError::Unknown(format!("{}: bad response body: {}", model, e)))?;

        // Prefer the service's own duration hint over wall time.
        let duration = parsed
            .total_duration
            .map(Duration::from_nanos)
            .unwrap_or_else(|| started.elapsed());

        Ok(GenerateOutcome {
            text: parsed.response,
            duration,
            eval_tokens: parsed.eval_count,
        })
    }

    async fn warm(&self, model: &str, keep_alive_secs: i64) -> Result<(), FleetError> {
        let url = format!("{}/api/generate", self.base_url);
        // An empty prompt loads (or, with keep_alive 0, unloads) the model
        // without generating anything.
        let request = GenerateRequest {
            model,
            prompt: "",
            stream: false,
            keep_alive: keep_alive_secs,
            options: WireOptions {
                num_ctx: 2048,
                num_predict: 1,
                temperature: 0.0,
                top_p: 1.0,
            },
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Self::classify_request_error(e, model))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, model, &body));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorKind;

    #[test]
    fn test_status_classification() {
        let cases = [
            (404, ErrorKind::NotFound),
            (401, ErrorKind::Auth),
            (403, ErrorKind::Auth),
            (429, ErrorKind::Transient),
            (500, ErrorKind::Transient),
            (503, ErrorKind::Transient),
            (507, ErrorKind::ResourceExhausted),
            (418, ErrorKind::Unknown),
        ];
        for (code, expected) in cases {
            let status = reqwest::StatusCode::from_u16(code).unwrap();
            let err = HttpExecutionService::classify_status(status, "m", "");
            assert_eq!(err.kind(), expected, "status {}", code);
        }
    }

    #[test]
    fn test_oom_body_classified_as_exhausted() {
        let status = reqwest::StatusCode::from_u16(400).unwrap();
        let err = HttpExecutionService::classify_status(status, "m", "model ran out of memory");
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    }

    #[test]
    fn test_error_message_names_model() {
        let status = reqwest::StatusCode::from_u16(404).unwrap();
        let err = HttpExecutionService::classify_status(status, "qwen2.5:14b", "no such model");
        assert!(format!("{}", err).contains("qwen2.5:14b"));
    }

    #[test]
    fn test_ps_response_parsing() {
        let body = r#"{"models":[{"name":"llama3.2:3b","size":2147483648,"size_vram":0}]}"#;
        let ps: PsResponse = serde_json::from_str(body).unwrap();
        assert_eq!(ps.models.len(), 1);
        assert_eq!(ps.models[0].name, "llama3.2:3b");
        assert_eq!(ps.models[0].size, 2147483648);
    }

    #[test]
    fn test_generate_response_parsing_defaults() {
        let body = r#"{"response":"hi"}"#;
        let parsed: GenerateResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.response, "hi");
        assert!(parsed.total_duration.is_none());
        assert!(parsed.eval_count.is_none());
    }
}
