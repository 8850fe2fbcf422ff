use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ProviderError;
use crate::types::TokenUsage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
	pub model: String,
	#[serde(default)]
	pub temperature: f64,
	#[serde(default = "default_max_tokens")]
	pub max_tokens: u32,
}

fn default_max_tokens() -> u32 {
	4096
}

impl Default for SamplingParams {
	fn default() -> Self {
		Self {
			model: "default".to_string(),
			temperature: 0.0,
			max_tokens: default_max_tokens(),
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
	pub system: String,
	pub user: String,
	pub params: SamplingParams,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResponse {
	pub raw_text: String,
	pub usage: TokenUsage,
	pub latency: Duration,
}

impl CompletionResponse {
	/// Response with no usage accounting, handy for scripted providers.
	pub fn text(raw_text: impl Into<String>) -> Self {
		Self {
			raw_text: raw_text.into(),
			usage: TokenUsage::default(),
			latency: Duration::ZERO,
		}
	}
}

/// The text-completion capability the workflow calls during EXTRACT.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
	async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ProviderError>;
}

/// Wrap an async closure as a `CompletionProvider`.
pub fn from_async_fn<F, Fut>(f: F) -> Arc<dyn CompletionProvider>
where
	F: Send + Sync + 'static + Fn(&CompletionRequest) -> Fut,
	Fut: Future<Output = Result<CompletionResponse, ProviderError>> + Send + 'static,
{
	struct ClosureProvider<F, Fut>
	where
		F: Send + Sync + 'static + Fn(&CompletionRequest) -> Fut,
		Fut: Future<Output = Result<CompletionResponse, ProviderError>> + Send + 'static,
	{
		f: F,
	}

	#[async_trait]
	impl<F, Fut> CompletionProvider for ClosureProvider<F, Fut>
	where
		F: Send + Sync + 'static + Fn(&CompletionRequest) -> Fut,
		Fut: Future<Output = Result<CompletionResponse, ProviderError>> + Send + 'static,
	{
		async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ProviderError> {
			(self.f)(request).await
		}
	}

	Arc::new(ClosureProvider { f })
}

/// OpenAI-compatible `/chat/completions` endpoint (OpenAI, Ollama, llama.cpp server, ...).
pub struct OpenAiCompatProvider {
	client: reqwest::Client,
	base_url: String,
	api_key: Option<String>,
}

impl OpenAiCompatProvider {
	pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
		let base_url: String = base_url.into();
		Self {
			client: reqwest::Client::new(),
			base_url: base_url.trim_end_matches('/').to_string(),
			api_key,
		}
	}
}

#[async_trait]
impl CompletionProvider for OpenAiCompatProvider {
	async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ProviderError> {
		let started = Instant::now();
		let mut builder = self
			.client
			.post(format!("{}/chat/completions", self.base_url))
			.json(&json!({
				"model": request.params.model,
				"messages": [
					{"role": "system", "content": request.system},
					{"role": "user", "content": request.user}
				],
				"temperature": request.params.temperature,
				"max_tokens": request.params.max_tokens,
			}));
		if let Some(key) = &self.api_key {
			builder = builder.bearer_auth(key);
		}

		let resp = builder.send().await.map_err(classify_transport_error)?;
		let status = resp.status();
		if !status.is_success() {
			let body = resp.text().await.unwrap_or_default();
			let message = format!("HTTP {}: {}", status.as_u16(), body);
			return Err(if is_retryable_status(status.as_u16()) {
				ProviderError::Transient(message)
			} else {
				ProviderError::Permanent(message)
			});
		}

		let v: Value = resp.json().await.map_err(classify_transport_error)?;
		let raw_text = v["choices"][0]["message"]["content"]
			.as_str()
			.ok_or_else(|| ProviderError::Permanent(format!("unexpected completion response shape: {v}")))?
			.to_string();
		let usage = usage_from_response(&v);

		Ok(CompletionResponse {
			raw_text,
			usage,
			latency: started.elapsed(),
		})
	}
}

/// Token counts from an OpenAI-style `usage` block; counts beyond `u32` saturate.
fn usage_from_response(v: &Value) -> TokenUsage {
	let count = |key: &str| {
		v["usage"][key]
			.as_u64()
			.map(|n| u32::try_from(n).unwrap_or(u32::MAX))
			.unwrap_or(0)
	};
	TokenUsage::new(count("prompt_tokens"), count("completion_tokens"))
}

fn is_retryable_status(status: u16) -> bool {
	status == 408 || status == 429 || (500..600).contains(&status)
}

fn classify_transport_error(err: reqwest::Error) -> ProviderError {
	if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
		ProviderError::Transient(err.to_string())
	} else {
		ProviderError::Permanent(err.to_string())
	}
}
