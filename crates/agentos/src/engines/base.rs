use std::time::Duration;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::errors::{AgentError, AgentResult};

/// Upper bound for a single batch call against a backend
pub const INFERENCE_TIMEOUT: Duration = Duration::from_secs(600);

/// A remote compute backend serving completions and/or embeddings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InferenceEngine {
    pub endpoint_url: String,
    pub embeddings_endpoint_url: String,
    pub max_batch_size: usize,
    pub max_requests: usize,
    /// Generated tokens per second, averaged over the engine's lifetime
    pub performance: f32,
    pub models: Vec<String>,
    pub requests_served: u64,
    pub time_consumed: Duration,
    pub tokens_processed: u64,
    pub tokens_generated: u64,
    pub prompt_tokens: u64,
    pub leased_at: Option<DateTime<Utc>>,
    pub busy: bool,
    pub embeddings_dims: Option<usize>,
    pub completion_failed: bool,
    pub embeddings_failed: bool,
}

impl InferenceEngine {
    pub fn new<S: Into<String>>(endpoint_url: S) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            max_batch_size: 1,
            max_requests: 1,
            ..Default::default()
        }
    }

    pub fn with_embeddings_endpoint<S: Into<String>>(mut self, url: S) -> Self {
        self.embeddings_endpoint_url = url.into();
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn with_max_requests(mut self, max_requests: usize) -> Self {
        self.max_requests = max_requests;
        self
    }

    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }

    pub fn supports_completions(&self) -> bool {
        !self.endpoint_url.is_empty() && !self.completion_failed
    }

    pub fn supports_embeddings(&self) -> bool {
        !self.embeddings_endpoint_url.is_empty() && !self.embeddings_failed
    }

    /// Record a served model, filling an empty placeholder slot when one exists
    pub fn upsert_model(&mut self, model: &str) {
        match self
            .models
            .iter_mut()
            .find(|existing| existing.as_str() == model || existing.is_empty())
        {
            Some(slot) => *slot = model.to_string(),
            None => self.models.push(model.to_string()),
        }
    }

    /// Fold one finished batch into the engine's performance counters
    pub fn record_usage(&mut self, prompt_tokens: u64, completion_tokens: u64, elapsed: Duration) {
        self.requests_served += 1;
        self.prompt_tokens += prompt_tokens;
        self.tokens_generated += completion_tokens;
        self.tokens_processed += prompt_tokens + completion_tokens;
        self.time_consumed += elapsed;

        let seconds = self.time_consumed.as_secs_f32();
        if seconds > 0.0 {
            self.performance = self.tokens_generated as f32 / seconds;
        }
    }
}

/// Sampling parameters and prompt for one unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationSettings {
    pub raw_prompt: String,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    /// Retry budget; enforced by the transport, not by the executors
    pub max_retries: u32,
}

impl GenerationSettings {
    pub fn new<S: Into<String>>(raw_prompt: S) -> Self {
        Self {
            raw_prompt: raw_prompt.into(),
            temperature: 0.7,
            max_tokens: None,
            stop: Vec::new(),
            max_retries: 1,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_stop<S: Into<String>>(mut self, stop: S) -> Self {
        self.stop.push(stop.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// An embedding together with the normalized name of the model that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingVector {
    pub vector: Vec<f64>,
    pub model: Option<String>,
}

/// One request inside a batch plus the private paths its result is returned on
#[derive(Debug)]
pub struct JobTask {
    pub req: GenerationSettings,
    pub res_embeddings: Option<oneshot::Sender<EmbeddingVector>>,
    pub res_completion: Option<oneshot::Sender<String>>,
}

impl JobTask {
    pub fn new(req: GenerationSettings) -> Self {
        Self {
            req,
            res_embeddings: None,
            res_completion: None,
        }
    }

    pub fn with_embeddings_return(req: GenerationSettings) -> (Self, oneshot::Receiver<EmbeddingVector>) {
        let (tx, rx) = oneshot::channel();
        let task = Self {
            res_embeddings: Some(tx),
            ..Self::new(req)
        };
        (task, rx)
    }

    pub fn with_completion_return(req: GenerationSettings) -> (Self, oneshot::Receiver<String>) {
        let (tx, rx) = oneshot::channel();
        let task = Self {
            res_completion: Some(tx),
            ..Self::new(req)
        };
        (task, rx)
    }
}

lazy_static! {
    // one pooled client for every executor
    static ref HTTP_CLIENT: Result<Client, String> = Client::builder()
        .timeout(INFERENCE_TIMEOUT)
        .build()
        .map_err(|err| err.to_string());
}

pub(crate) fn http_client() -> AgentResult<&'static Client> {
    HTTP_CLIENT
        .as_ref()
        .map_err(|err| AgentError::Transport(format!("failed to build http client: {}", err)))
}
