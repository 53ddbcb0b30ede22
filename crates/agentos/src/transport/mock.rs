use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use super::Transport;
use crate::errors::{AgentError, AgentResult};
use crate::models::request::{ClientRequest, CompletionResponse, RoutingMode, ServerResponse};

/// A mock transport that returns pre-configured responses and counts its calls
pub struct MockTransport {
    responses: Mutex<VecDeque<AgentResult<ServerResponse>>>,
    requests: Mutex<Vec<ClientRequest>>,
    calls: AtomicUsize,
    cancelled: AtomicUsize,
    delay: Option<Duration>,
    gate: Option<Arc<Semaphore>>,
}

/// Counts a call as cancelled when its future is dropped before answering
struct InFlight<'a> {
    cancelled: &'a AtomicUsize,
    answered: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.answered {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl MockTransport {
    pub fn new(responses: Vec<AgentResult<ServerResponse>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
            delay: None,
            gate: None,
        }
    }

    /// Every call answers with the same choices under the given correlation id
    pub fn repeating(correlation_id: &str, choices: &[&str], times: usize) -> Self {
        let response = ServerResponse {
            correlation_id: correlation_id.to_string(),
            completion_responses: vec![CompletionResponse {
                choices: choices.iter().map(|c| c.to_string()).collect(),
            }],
        };
        Self::new((0..times).map(|_| Ok(response.clone())).collect())
    }

    /// Sleep this long before answering; the request timeout is ignored
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Each call waits for one permit of `gate` before answering
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls dropped before they produced an answer
    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ClientRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn run_request(
        &self,
        request: ClientRequest,
        _timeout: Duration,
        _mode: RoutingMode,
    ) -> AgentResult<ServerResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);

        let mut in_flight = InFlight {
            cancelled: &self.cancelled,
            answered: false,
        };
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        in_flight.answered = true;

        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(AgentError::Transport("no more mock responses".to_string())))
    }
}
