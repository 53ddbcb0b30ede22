use tokio::sync::oneshot;
use tracing::{info, warn};

use super::base::{GenerationSettings, InferenceEngine, JobTask};
use super::completion::run_completion_request;
use super::embeddings::run_embeddings_request;

const CANARY_COMPLETION_PROMPT: &str = "### Instruction\nProvide an answer. 2 + 2 = ?\n### Assistant: ";
const CANARY_EMBEDDINGS_TEXT: &str = "Hello world";

fn canary(prompt: &str) -> JobTask {
    JobTask::new(
        GenerationSettings::new(prompt)
            .with_temperature(0.1)
            .with_max_retries(1),
    )
}

/// Probe a freshly registered engine for its capabilities and identity
///
/// One completion and one embeddings canary are sent through the regular executors. Each
/// modality is judged on its own: a failing canary sets the matching `*_failed` flag and the
/// other probe still runs. `done` is signalled whatever the outcome.
pub async fn start_inference_engine(engine: &mut InferenceEngine, done: oneshot::Sender<()>) {
    if let Err(err) = run_completion_request(engine, vec![canary(CANARY_COMPLETION_PROMPT)]).await {
        warn!(endpoint = %engine.endpoint_url, error = %err, "completion canary failed");
        engine.completion_failed = true;
    }

    match run_embeddings_request(engine, vec![canary(CANARY_EMBEDDINGS_TEXT)]).await {
        Ok(vectors) => {
            if let Some(first) = vectors.first() {
                if let Some(model) = &first.model {
                    engine.upsert_model(model);
                }
                if !first.vector.is_empty() {
                    engine.embeddings_dims = Some(first.vector.len());
                }
            }
        }
        Err(err) => {
            warn!(endpoint = %engine.endpoint_url, error = %err, "embeddings canary failed");
            engine.embeddings_failed = true;
        }
    }

    info!(
        endpoint = %engine.endpoint_url,
        completions = !engine.completion_failed,
        embeddings = !engine.embeddings_failed,
        embeddings_dims = ?engine.embeddings_dims,
        models = ?engine.models,
        "inference engine bootstrapped"
    );

    let _ = done.send(());
}
