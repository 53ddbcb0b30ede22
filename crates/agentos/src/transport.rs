use std::time::Duration;

use async_trait::async_trait;

use crate::errors::AgentResult;
use crate::models::request::{ClientRequest, RoutingMode, ServerResponse};

#[cfg(test)]
pub mod mock;

/// The path every generation request takes out of the agent host
///
/// Implementations own the network call, request level retries and admission; callers only
/// see a correlation id and the choices produced for each generation spec.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn run_request(
        &self,
        request: ClientRequest,
        timeout: Duration,
        mode: RoutingMode,
    ) -> AgentResult<ServerResponse>;
}
