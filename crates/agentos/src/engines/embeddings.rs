use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::base::{http_client, EmbeddingVector, InferenceEngine, JobTask};
use super::model_name::normalize_model_name;
use crate::errors::{AgentError, AgentResult};

#[derive(Serialize)]
struct EmbeddingsCommand<'a> {
    input: Vec<&'a str>,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingData>,
    #[serde(default)]
    model: String,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f64>,
}

/// Embed every prompt of the batch with a single call to the engine
///
/// The batch fails as a whole: on any transport or decoding error no task receives a result.
/// On success each task's return path (if any) gets its vector, and the full ordered set is
/// returned to the caller as well.
pub async fn run_embeddings_request(
    engine: &InferenceEngine,
    batch: Vec<JobTask>,
) -> AgentResult<Vec<EmbeddingVector>> {
    if batch.is_empty() {
        return Err(AgentError::Configuration(format!(
            "empty batch for inference engine {}",
            engine.endpoint_url
        )));
    }
    if engine.embeddings_endpoint_url.is_empty() {
        return Err(AgentError::Configuration(format!(
            "embeddings endpoint is not configured for inference engine {}",
            engine.endpoint_url
        )));
    }

    let command = EmbeddingsCommand {
        input: batch.iter().map(|task| task.req.raw_prompt.as_str()).collect(),
    };

    let response = http_client()?
        .post(&engine.embeddings_endpoint_url)
        .json(&command)
        .send()
        .await?;

    let status = response.status();
    if status != StatusCode::OK {
        warn!(
            endpoint = %engine.embeddings_endpoint_url,
            status = status.as_u16(),
            "embeddings request failed"
        );
        return Err(AgentError::Transport(format!(
            "embeddings request failed with http status {}",
            status
        )));
    }

    let body = response.text().await?;
    let parsed: EmbeddingsResponse = serde_json::from_str(&body).map_err(|err| {
        warn!(endpoint = %engine.embeddings_endpoint_url, response = %body, "malformed embeddings response");
        AgentError::Parse(format!("malformed embeddings response: {}", err))
    })?;

    if parsed.data.len() != batch.len() {
        return Err(AgentError::Parse(format!(
            "embeddings response carries {} vectors for a batch of {}",
            parsed.data.len(),
            batch.len()
        )));
    }

    let model = Some(normalize_model_name(&parsed.model)).filter(|name| !name.is_empty());
    debug!(
        endpoint = %engine.embeddings_endpoint_url,
        batch_size = batch.len(),
        model = model.as_deref().unwrap_or_default(),
        "embeddings batch finished"
    );

    let mut results = Vec::with_capacity(batch.len());
    for (task, data) in batch.into_iter().zip(parsed.data) {
        let vector = EmbeddingVector {
            vector: data.embedding,
            model: model.clone(),
        };
        if let Some(tx) = task.res_embeddings {
            // the receiver may have given up waiting; the caller still gets the vector below
            let _ = tx.send(vector.clone());
        }
        results.push(vector);
    }

    Ok(results)
}
