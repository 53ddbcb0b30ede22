use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{oneshot, Mutex as AsyncMutex, OwnedMutexGuard, RwLock};
use tracing::{debug, warn};

use super::base::InferenceEngine;
use super::bootstrap::start_inference_engine;
use crate::errors::{AgentError, AgentResult};

const LEASE_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Completions,
    Embeddings,
}

impl Capability {
    fn supported_by(self, engine: &InferenceEngine) -> bool {
        match self {
            Capability::Completions => engine.supports_completions(),
            Capability::Embeddings => engine.supports_embeddings(),
        }
    }
}

/// One registered engine
///
/// `gate` grants exclusive use and is held for the whole lease. `record` is only locked for
/// short reads and writes, so snapshots never wait on a running batch.
#[derive(Debug)]
pub struct EngineSlot {
    gate: Arc<AsyncMutex<()>>,
    record: Mutex<InferenceEngine>,
}

impl EngineSlot {
    fn new(engine: InferenceEngine) -> Self {
        Self {
            gate: Arc::new(AsyncMutex::new(())),
            record: Mutex::new(engine),
        }
    }

    fn record(&self) -> MutexGuard<'_, InferenceEngine> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> InferenceEngine {
        self.record().clone()
    }
}

pub type SharedEngine = Arc<EngineSlot>;

/// Exclusive use of one engine
///
/// The lease works on a copy of the engine record. Dropping it writes the copy back, with
/// the counters it gathered, and marks the engine idle again.
pub struct EngineLease {
    slot: SharedEngine,
    engine: InferenceEngine,
    _gate: OwnedMutexGuard<()>,
}

impl EngineLease {
    /// Mark the slot busy and take a working copy; the caller already holds the gate
    fn begin(slot: SharedEngine, gate: OwnedMutexGuard<()>) -> Self {
        let engine = {
            let mut record = slot.record();
            record.busy = true;
            record.leased_at = Some(Utc::now());
            record.clone()
        };
        debug!(endpoint = %engine.endpoint_url, "engine leased");
        Self {
            slot,
            engine,
            _gate: gate,
        }
    }
}

impl Deref for EngineLease {
    type Target = InferenceEngine;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

impl DerefMut for EngineLease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.engine
    }
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        let mut engine = std::mem::take(&mut self.engine);
        engine.busy = false;
        *self.slot.record() = engine;
    }
}

/// All inference engines known to this host
#[derive(Default)]
pub struct EngineRegistry {
    engines: RwLock<Vec<SharedEngine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, engine: InferenceEngine) -> SharedEngine {
        let shared = Arc::new(EngineSlot::new(engine));
        self.engines.write().await.push(shared.clone());
        shared
    }

    pub async fn len(&self) -> usize {
        self.engines.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.engines.read().await.is_empty()
    }

    /// Run the canary bootstrap for every registered engine concurrently
    ///
    /// Each engine is probed by its own task under an exclusive lease. Returns once every
    /// engine has signalled `done` and its probed record is written back.
    pub async fn bootstrap_all(&self) {
        let engines = self.engines.read().await.clone();
        let mut pending = Vec::with_capacity(engines.len());

        for slot in engines {
            let (done_tx, done_rx) = oneshot::channel();
            let task = tokio::spawn(async move {
                let gate = slot.gate.clone().lock_owned().await;
                let mut lease = EngineLease::begin(slot, gate);
                start_inference_engine(&mut lease, done_tx).await;
            });
            pending.push(async move {
                let signalled = done_rx.await.is_ok();
                if let Err(err) = task.await {
                    warn!(error = %err, "engine bootstrap task ended abnormally");
                }
                signalled
            });
        }

        let signalled = join_all(pending).await;
        debug!(
            engines = signalled.len(),
            signalled = signalled.iter().filter(|done| **done).count(),
            "bootstrap finished"
        );
    }

    /// Point-in-time copies of every engine record, leased ones included
    pub async fn snapshot(&self) -> Vec<InferenceEngine> {
        self.engines
            .read()
            .await
            .iter()
            .map(|slot| slot.snapshot())
            .collect()
    }

    /// Hand out an idle engine supporting `capability`, if one is available right now
    pub async fn lease(&self, capability: Capability) -> Option<EngineLease> {
        let engines = self.engines.read().await.clone();
        for slot in engines {
            let Ok(gate) = slot.gate.clone().try_lock_owned() else {
                continue;
            };
            if !capability.supported_by(&slot.record()) {
                continue;
            }
            return Some(EngineLease::begin(slot, gate));
        }
        None
    }

    /// Wait until an engine supporting `capability` becomes idle
    ///
    /// Fails straight away when no registered engine supports the capability at all; callers
    /// bound the wait with their own timeout.
    pub async fn lease_when_idle(&self, capability: Capability) -> AgentResult<EngineLease> {
        loop {
            if let Some(lease) = self.lease(capability).await {
                return Ok(lease);
            }
            if !self.any_capable(capability).await {
                return Err(AgentError::Transport(format!(
                    "no inference engine supports {:?}",
                    capability
                )));
            }
            tokio::time::sleep(LEASE_POLL_INTERVAL).await;
        }
    }

    async fn any_capable(&self, capability: Capability) -> bool {
        self.engines
            .read()
            .await
            .iter()
            .any(|slot| capability.supported_by(&slot.record()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_lease_is_exclusive() {
        let registry = EngineRegistry::new();
        registry
            .register(InferenceEngine::new("http://127.0.0.1:9/v1/completions"))
            .await;

        let lease = registry.lease(Capability::Completions).await.unwrap();
        assert!(lease.busy);
        assert!(lease.leased_at.is_some());
        assert!(registry.lease(Capability::Completions).await.is_none());

        drop(lease);
        let again = registry.lease(Capability::Completions).await.unwrap();
        assert!(again.busy);
    }

    #[tokio::test]
    async fn test_lease_respects_capability() {
        let registry = EngineRegistry::new();
        registry
            .register(InferenceEngine::new("http://127.0.0.1:9/v1/completions"))
            .await;

        assert!(registry.lease(Capability::Embeddings).await.is_none());
        let result = registry.lease_when_idle(Capability::Embeddings).await;
        assert!(matches!(result, Err(AgentError::Transport(_))));
    }

    #[tokio::test]
    async fn test_lease_when_idle_waits_for_release() {
        let registry = Arc::new(EngineRegistry::new());
        registry
            .register(InferenceEngine::new("http://127.0.0.1:9/v1/completions"))
            .await;

        let lease = registry.lease(Capability::Completions).await.unwrap();
        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.lease_when_idle(Capability::Completions).await })
        };

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!waiter.is_finished());
        drop(lease);

        let acquired = waiter.await.unwrap().unwrap();
        assert!(acquired.busy);
    }

    #[tokio::test]
    async fn test_snapshot_sees_active_lease() {
        let registry = EngineRegistry::new();
        registry
            .register(InferenceEngine::new("http://127.0.0.1:9/v1/completions"))
            .await;

        let mut lease = registry.lease(Capability::Completions).await.unwrap();
        let engines = tokio::time::timeout(Duration::from_secs(1), registry.snapshot())
            .await
            .unwrap();
        assert!(engines[0].busy);
        assert!(engines[0].leased_at.is_some());

        lease.record_usage(10, 20, Duration::from_secs(2));
        drop(lease);

        let engines = registry.snapshot().await;
        assert!(!engines[0].busy);
        assert_eq!(engines[0].requests_served, 1);
        assert_eq!(engines[0].tokens_generated, 20);
    }

    #[tokio::test]
    async fn test_incapable_registry_fails_fast_while_leased() {
        let registry = EngineRegistry::new();
        registry
            .register(InferenceEngine::new("http://127.0.0.1:9/v1/completions"))
            .await;
        let _held = registry.lease(Capability::Completions).await.unwrap();

        let result = tokio::time::timeout(
            Duration::from_millis(200),
            registry.lease_when_idle(Capability::Embeddings),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(AgentError::Transport(_))));
    }

    #[tokio::test]
    async fn test_bootstrap_all() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"index": 0, "text": "4"}]
            })))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let registry = EngineRegistry::new();
        registry
            .register(
                InferenceEngine::new(format!("{}/v1/completions", server.uri()))
                    .with_embeddings_endpoint(format!("{}/v1/embeddings", server.uri())),
            )
            .await;
        registry
            .register(InferenceEngine::new(format!("{}/v1/completions", server.uri())))
            .await;

        registry.bootstrap_all().await;

        let engines = registry.snapshot().await;
        assert_eq!(engines.len(), 2);
        assert!(engines.iter().all(|engine| !engine.completion_failed));
        assert!(engines.iter().all(|engine| engine.embeddings_failed));
        assert!(registry.lease(Capability::Completions).await.is_some());
    }
}
