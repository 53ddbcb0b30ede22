use serde::{Deserialize, Serialize};

/// Priority class understood by the admission scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Kernel,
    User,
    Background,
}

/// How the transport routes a request upstream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    #[default]
    Default,
    /// Request-reply through the I/O path
    Io,
}

/// One generation spec inside a client request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub raw_prompt: String,
    pub min_results: usize,
}

impl CompletionRequest {
    pub fn new<S: Into<String>>(raw_prompt: S, min_results: usize) -> Self {
        Self {
            raw_prompt: raw_prompt.into(),
            min_results,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub process_name: String,
    pub priority: Priority,
    pub completion_requests: Vec<CompletionRequest>,
}

impl ClientRequest {
    pub fn new<S: Into<String>>(process_name: S, priority: Priority) -> Self {
        Self {
            process_name: process_name.into(),
            priority,
            completion_requests: Vec::new(),
        }
    }

    pub fn with_completion<S: Into<String>>(mut self, raw_prompt: S, min_results: usize) -> Self {
        self.completion_requests
            .push(CompletionRequest::new(raw_prompt, min_results));
        self
    }
}

/// Choices produced for a single generation spec
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub choices: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerResponse {
    pub correlation_id: String,
    #[serde(default)]
    pub completion_responses: Vec<CompletionResponse>,
}

impl ServerResponse {
    /// All choices across every generation spec, in response order
    pub fn choices(&self) -> impl Iterator<Item = &str> {
        self.completion_responses
            .iter()
            .flat_map(|response| response.choices.iter().map(String::as_str))
    }
}
