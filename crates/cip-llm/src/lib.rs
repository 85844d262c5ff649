use anyhow::{Result, anyhow};
use cip_core::ModelConfig;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde_json::{Value, json};
use std::thread;
use std::time::Duration;

const REQUEST_TIMEOUT_SECS: u64 = 60;
const MAX_RETRIES: u8 = 3;
const RETRY_BASE_MS: u64 = 400;

/// Text-completion capability injected into the repair loop. Stages that
/// need a model take this as a parameter; nothing reaches for process-wide
/// state.
pub trait CompletionClient {
    fn complete(&self, prompt: &str) -> Result<String>;
}

/// Default capability: fails loudly until a real provider is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredClient;

impl CompletionClient for UnconfiguredClient {
    fn complete(&self, _prompt: &str) -> Result<String> {
        Err(anyhow!(
            "no completion client configured; set model.provider and model.name in the config"
        ))
    }
}

/// Blocking chat-completions client for an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct HttpCompletionClient {
    endpoint: String,
    api_key: String,
    model: String,
    client: Client,
}

impl HttpCompletionClient {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        })
    }

    /// Resolve a provider name to its endpoint and API-key environment
    /// variable.
    pub fn provider_route(provider: &str) -> Result<(&'static str, &'static str)> {
        match provider {
            "openai" => Ok(("https://api.openai.com/v1/chat/completions", "OPENAI_API_KEY")),
            "deepseek" => Ok(("https://api.deepseek.com/chat/completions", "DEEPSEEK_API_KEY")),
            other => Err(anyhow!("unknown completion provider: {other}")),
        }
    }

    pub fn from_model_config(model: &ModelConfig) -> Result<Self> {
        let provider = model
            .provider
            .as_deref()
            .ok_or_else(|| anyhow!("model.provider is not set"))?;
        let name = model
            .name
            .as_deref()
            .ok_or_else(|| anyhow!("model.name is not set"))?;
        let (endpoint, key_env) = Self::provider_route(provider)?;
        let api_key = std::env::var(key_env)
            .map_err(|_| anyhow!("environment variable {key_env} is not set"))?;
        Self::new(endpoint, api_key, name)
    }
}

impl CompletionClient for HttpCompletionClient {
    fn complete(&self, prompt: &str) -> Result<String> {
        let payload = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
        });

        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 0..=MAX_RETRIES {
            let response = self
                .client
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&payload)
                .send();
            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text()?;
                    if status.is_success() {
                        return extract_content(&body);
                    }
                    last_err = Some(anyhow!("completion request failed ({status}): {body}"));
                    if !should_retry(status) || attempt == MAX_RETRIES {
                        break;
                    }
                }
                Err(e) => {
                    last_err = Some(anyhow!("completion transport error: {e}"));
                    if attempt == MAX_RETRIES {
                        break;
                    }
                }
            }
            thread::sleep(Duration::from_millis(RETRY_BASE_MS << attempt));
        }
        Err(last_err.unwrap_or_else(|| anyhow!("completion request failed without detail")))
    }
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn extract_content(body: &str) -> Result<String> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| anyhow!("completion response is not JSON: {e}"))?;
    value["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("completion response missing choices[0].message.content"))
}

/// Build the run's completion client from config: a real provider when one
/// is named, the loud-failing default otherwise.
pub fn build_client(model: &ModelConfig) -> Result<Box<dyn CompletionClient + Send + Sync>> {
    if model.provider.is_none() && model.name.is_none() {
        return Ok(Box::new(UnconfiguredClient));
    }
    Ok(Box::new(HttpCompletionClient::from_model_config(model)?))
}
