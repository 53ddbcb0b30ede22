use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use super::base::{GenerationSettings, JobTask};
use super::completion::run_completion_request;
use super::registry::{Capability, EngineRegistry};
use crate::errors::{AgentError, AgentResult};
use crate::models::request::{
    ClientRequest, CompletionRequest, CompletionResponse, RoutingMode, ServerResponse,
};
use crate::transport::Transport;

/// Serves client requests straight from the local engine registry
///
/// Each generation spec is sampled `min_results` times on one leased engine, split into
/// batches no larger than the engine accepts. Priority and routing mode are passed through
/// untouched: admission belongs to the upstream scheduler.
pub struct DirectTransport {
    registry: Arc<EngineRegistry>,
}

impl DirectTransport {
    pub fn new(registry: Arc<EngineRegistry>) -> Self {
        Self { registry }
    }

    async fn sample(&self, spec: &CompletionRequest) -> AgentResult<CompletionResponse> {
        let mut lease = self
            .registry
            .lease_when_idle(Capability::Completions)
            .await?;
        let batch_limit = lease.max_batch_size.max(1);

        let mut remaining = spec.min_results.max(1);
        let mut choices = Vec::with_capacity(remaining);
        while remaining > 0 {
            let size = remaining.min(batch_limit);
            let batch = (0..size)
                .map(|_| JobTask::new(GenerationSettings::new(spec.raw_prompt.as_str())))
                .collect();
            choices.extend(run_completion_request(&mut lease, batch).await?);
            remaining -= size;
        }

        Ok(CompletionResponse { choices })
    }
}

#[async_trait]
impl Transport for DirectTransport {
    async fn run_request(
        &self,
        request: ClientRequest,
        timeout: Duration,
        mode: RoutingMode,
    ) -> AgentResult<ServerResponse> {
        let correlation_id = Uuid::new_v4().to_string();
        debug!(
            correlation_id = %correlation_id,
            process = %request.process_name,
            priority = ?request.priority,
            ?mode,
            "dispatching client request"
        );

        let work = async {
            let mut completion_responses = Vec::with_capacity(request.completion_requests.len());
            for spec in &request.completion_requests {
                completion_responses.push(self.sample(spec).await?);
            }
            Ok::<_, AgentError>(completion_responses)
        };

        let completion_responses = tokio::time::timeout(timeout, work)
            .await
            .map_err(|_| {
                AgentError::Transport(format!(
                    "request from {} timed out after {:?}",
                    request.process_name, timeout
                ))
            })??;

        Ok(ServerResponse {
            correlation_id,
            completion_responses,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::base::InferenceEngine;
    use crate::models::request::Priority;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_samples_are_batched() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [
                    {"index": 0, "text": "candidate"},
                    {"index": 1, "text": "candidate"}
                ]
            })))
            .expect(2)
            .mount(&server)
            .await;

        let registry = Arc::new(EngineRegistry::new());
        registry
            .register(
                InferenceEngine::new(format!("{}/v1/completions", server.uri()))
                    .with_max_batch_size(2),
            )
            .await;

        let transport = DirectTransport::new(registry.clone());
        let request = ClientRequest::new("test", Priority::User).with_completion("2 + 2 =", 4);
        let response = transport
            .run_request(request, Duration::from_secs(5), RoutingMode::Io)
            .await
            .unwrap();

        assert!(!response.correlation_id.is_empty());
        assert_eq!(response.completion_responses.len(), 1);
        assert_eq!(response.choices().count(), 4);

        let engines = registry.snapshot().await;
        assert_eq!(engines[0].requests_served, 2);
        assert!(!engines[0].busy);
    }

    #[tokio::test]
    async fn test_without_engines() {
        let transport = DirectTransport::new(Arc::new(EngineRegistry::new()));
        let request = ClientRequest::new("test", Priority::User).with_completion("hi", 1);
        let result = transport
            .run_request(request, Duration::from_secs(1), RoutingMode::Default)
            .await;
        assert!(matches!(result, Err(AgentError::Transport(_))));
    }

    #[tokio::test]
    async fn test_timeout_while_engine_is_leased() {
        let registry = Arc::new(EngineRegistry::new());
        registry
            .register(InferenceEngine::new("http://127.0.0.1:9/v1/completions"))
            .await;
        let _held = registry.lease(Capability::Completions).await.unwrap();

        let transport = DirectTransport::new(registry.clone());
        let request = ClientRequest::new("test", Priority::User).with_completion("hi", 1);
        let result = transport
            .run_request(request, Duration::from_millis(150), RoutingMode::Default)
            .await;
        assert!(matches!(result, Err(AgentError::Transport(ref msg)) if msg.contains("timed out")));
    }
}
