//! Registry of model providers and the unified streaming client over their
//! wire dialects.
//!
//! Providers can be defined in two places:
//!   1. Built-in defaults compiled into the binary so sable works
//!      out-of-the-box.
//!   2. User-defined entries in `<home>/<app>_config.json` under the
//!      `providers` key. These override or extend the defaults at runtime.

mod anthropic;
mod gemini;
mod openai;

use std::collections::HashMap;
use std::io::BufRead;
use std::time::Duration;

use futures::TryStreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tracing::debug;
use tracing::warn;

use crate::client_common::Prompt;
use crate::client_common::ResponseChunk;
use crate::client_common::ResponseStream;
use crate::error::Result;
use crate::error::SableErr;
use crate::flags::SABLE_REQUEST_MAX_RETRIES;
use crate::flags::SABLE_SSE_FIXTURE;
use crate::util::backoff;

/// Wire protocol spoken by a provider endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// OpenAI-style chat completions.
    OpenAiChat,
    /// Chat-completions compatible endpoints (DeepSeek, Xiaomi, ...) that
    /// stream `reasoning_content` and take `thinking.type`.
    OpenAiCompat,
    AnthropicMessages,
    GeminiGenerateContent,
}

/// Serializable representation of a provider definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelProviderInfo {
    /// Friendly display name.
    pub name: String,
    /// Base URL for the provider's API.
    pub base_url: String,
    /// Environment variable that stores the user's API key for this provider.
    pub env_key: String,
    pub dialect: Dialect,
    pub default_model: String,

    /// Gemini-style key-in-URL auth; Bearer is used when false.
    #[serde(default)]
    pub api_key_in_query: bool,
}

impl ModelProviderInfo {
    /// Returns the API key for this provider if present in the environment.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.env_key).ok()
    }
}

/// Built-in default provider list.
pub fn built_in_model_providers() -> HashMap<String, ModelProviderInfo> {
    use ModelProviderInfo as P;

    [
        (
            "openai",
            P {
                name: "OpenAI".into(),
                base_url: "https://api.openai.com/v1".into(),
                env_key: "OPENAI_API_KEY".into(),
                dialect: Dialect::OpenAiChat,
                default_model: "gpt-4.1".into(),
                api_key_in_query: false,
            },
        ),
        (
            "anthropic",
            P {
                name: "Anthropic".into(),
                base_url: "https://api.anthropic.com".into(),
                env_key: "ANTHROPIC_API_KEY".into(),
                dialect: Dialect::AnthropicMessages,
                default_model: "claude-sonnet-4-20250514".into(),
                api_key_in_query: false,
            },
        ),
        (
            "gemini",
            P {
                name: "Gemini".into(),
                base_url: "https://generativelanguage.googleapis.com/v1beta".into(),
                env_key: "GEMINI_API_KEY".into(),
                dialect: Dialect::GeminiGenerateContent,
                default_model: "gemini-2.5-pro".into(),
                api_key_in_query: true,
            },
        ),
        (
            "deepseek",
            P {
                name: "DeepSeek".into(),
                base_url: "https://api.deepseek.com".into(),
                env_key: "DEEPSEEK_API_KEY".into(),
                dialect: Dialect::OpenAiCompat,
                default_model: "deepseek-chat".into(),
                api_key_in_query: false,
            },
        ),
        (
            "xiaomi",
            P {
                name: "Xiaomi MiMo".into(),
                base_url: "https://api.xiaomimimo.com/v1".into(),
                env_key: "MIMO_API_KEY".into(),
                dialect: Dialect::OpenAiCompat,
                default_model: "mimo-7b-rl".into(),
                api_key_in_query: false,
            },
        ),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

/// A model name advertised by a provider's listing endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteModel {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
}

/// Unified client: one `generate` over every dialect.
#[derive(Clone)]
pub struct ModelClient {
    provider: ModelProviderInfo,
    model: String,
    client: reqwest::Client,
}

impl ModelClient {
    pub fn new(provider: ModelProviderInfo, model: impl ToString) -> Self {
        Self {
            provider,
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn provider(&self) -> &ModelProviderInfo {
        &self.provider
    }

    /// Kick off one model turn and return the stream of response chunks.
    pub async fn generate(&self, prompt: &Prompt) -> Result<ResponseStream> {
        if let Some(path) = &*SABLE_SSE_FIXTURE {
            // Short circuit for offline tests.
            warn!(path, "streaming from fixture");
            return stream_from_fixture(path, &self.provider);
        }

        match self.provider.dialect {
            Dialect::OpenAiChat | Dialect::OpenAiCompat => {
                openai::generate(prompt, &self.model, &self.client, &self.provider).await
            }
            Dialect::AnthropicMessages => {
                anthropic::generate(prompt, &self.model, &self.client, &self.provider).await
            }
            Dialect::GeminiGenerateContent => {
                gemini::generate(prompt, &self.model, &self.client, &self.provider).await
            }
        }
    }

    /// List the models the provider advertises, with whatever limits its
    /// listing endpoint reports.
    pub async fn discover(&self) -> Result<Vec<RemoteModel>> {
        match self.provider.dialect {
            Dialect::OpenAiChat | Dialect::OpenAiCompat => {
                openai::discover(&self.client, &self.provider).await
            }
            Dialect::AnthropicMessages => anthropic::discover(&self.client, &self.provider).await,
            Dialect::GeminiGenerateContent => gemini::discover(&self.client, &self.provider).await,
        }
    }
}

/// POST with the provider-shared retry schedule: 429 and 5xx retry with
/// `Retry-After` honored, anything else surfaces as `ProviderHttp` with the
/// body attached so users see the provider's actual complaint.
pub(crate) async fn send_with_retries<F>(build: F) -> Result<reqwest::Response>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut attempt = 0u64;
    loop {
        attempt += 1;
        let res = build().send().await;
        match res {
            Ok(resp) if resp.status().is_success() => return Ok(resp),
            Ok(resp) => {
                let status = resp.status();
                if !(status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()) {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(SableErr::ProviderHttp(status, body));
                }
                if attempt > *SABLE_REQUEST_MAX_RETRIES {
                    return Err(SableErr::RetryLimit(status));
                }
                let retry_after = resp
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok());
                let delay = retry_after
                    .map(|s| Duration::from_millis(s * 1_000))
                    .unwrap_or_else(|| backoff(attempt));
                debug!("retrying provider request after {delay:?} (status {status})");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if attempt > *SABLE_REQUEST_MAX_RETRIES {
                    return Err(e.into());
                }
                tokio::time::sleep(backoff(attempt)).await;
            }
        }
    }
}

/// Used in tests to stream from a text SSE file through the dialect decoder.
fn stream_from_fixture(path: &str, provider: &ModelProviderInfo) -> Result<ResponseStream> {
    let (tx_chunk, rx_chunk) = mpsc::channel::<Result<ResponseChunk>>(16);
    let f = std::fs::File::open(path)?;
    let lines = std::io::BufReader::new(f).lines();

    // Insert \n\n after each line for proper SSE parsing.
    let mut content = String::new();
    for line in lines {
        content.push_str(&line?);
        content.push_str("\n\n");
    }

    let rdr = std::io::Cursor::new(content);
    let stream = ReaderStream::new(rdr).map_err(SableErr::Io);
    match provider.dialect {
        Dialect::AnthropicMessages => tokio::spawn(anthropic::process_sse(stream, tx_chunk)),
        Dialect::GeminiGenerateContent => tokio::spawn(gemini::process_sse(stream, tx_chunk)),
        _ => tokio::spawn(openai::process_sse(stream, tx_chunk)),
    };
    Ok(ResponseStream { rx_chunk })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn built_ins_cover_all_dialects() {
        let providers = built_in_model_providers();
        let dialects: std::collections::HashSet<Dialect> =
            providers.values().map(|p| p.dialect).collect();
        assert!(dialects.contains(&Dialect::OpenAiChat));
        assert!(dialects.contains(&Dialect::OpenAiCompat));
        assert!(dialects.contains(&Dialect::AnthropicMessages));
        assert!(dialects.contains(&Dialect::GeminiGenerateContent));
    }

    #[test]
    fn gemini_uses_query_key_auth() {
        let providers = built_in_model_providers();
        assert!(providers["gemini"].api_key_in_query);
        assert!(!providers["openai"].api_key_in_query);
    }
}
