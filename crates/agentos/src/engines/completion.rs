use std::time::Instant;

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::base::{http_client, InferenceEngine, JobTask};
use crate::errors::{AgentError, AgentResult};

#[derive(Deserialize)]
struct CompletionsResponse {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    index: Option<usize>,
    text: String,
}

#[derive(Deserialize, Default)]
struct CompletionUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Build the request body; the batch shares the sampling parameters of its first task
fn completions_payload(batch: &[JobTask]) -> Value {
    let prompts: Vec<&str> = batch.iter().map(|task| task.req.raw_prompt.as_str()).collect();
    let lead = &batch[0].req;

    let mut payload = json!({
        "prompt": prompts,
        "n": 1,
        "temperature": lead.temperature,
    });
    if let Some(max_tokens) = lead.max_tokens {
        payload["max_tokens"] = json!(max_tokens);
    }
    if !lead.stop.is_empty() {
        payload["stop"] = json!(lead.stop);
    }
    payload
}

/// Complete every prompt of the batch with a single call to the engine
///
/// Choices are routed back to tasks by their `index`. Like embeddings, the batch succeeds or
/// fails as a unit, and a successful batch is folded into the engine's counters.
pub async fn run_completion_request(
    engine: &mut InferenceEngine,
    batch: Vec<JobTask>,
) -> AgentResult<Vec<String>> {
    if batch.is_empty() {
        return Err(AgentError::Configuration(format!(
            "empty batch for inference engine {}",
            engine.endpoint_url
        )));
    }
    if engine.endpoint_url.is_empty() {
        return Err(AgentError::Configuration(
            "completion endpoint is not configured for inference engine".to_string(),
        ));
    }

    let payload = completions_payload(&batch);
    let started = Instant::now();

    let response = http_client()?
        .post(&engine.endpoint_url)
        .json(&payload)
        .send()
        .await?;

    let status = response.status();
    if status != StatusCode::OK {
        warn!(
            endpoint = %engine.endpoint_url,
            status = status.as_u16(),
            "completion request failed"
        );
        return Err(AgentError::Transport(format!(
            "completion request failed with http status {}",
            status
        )));
    }

    let body = response.text().await?;
    let parsed: CompletionsResponse = serde_json::from_str(&body).map_err(|err| {
        warn!(endpoint = %engine.endpoint_url, response = %body, "malformed completion response");
        AgentError::Parse(format!("malformed completion response: {}", err))
    })?;

    let mut texts: Vec<Option<String>> = vec![None; batch.len()];
    for (position, choice) in parsed.choices.into_iter().enumerate() {
        let index = choice.index.unwrap_or(position);
        let slot = texts.get_mut(index).ok_or_else(|| {
            AgentError::Parse(format!(
                "choice index {} is out of range for a batch of {}",
                index,
                batch.len()
            ))
        })?;
        *slot = Some(choice.text);
    }
    let texts = texts
        .into_iter()
        .enumerate()
        .map(|(idx, text)| {
            text.ok_or_else(|| AgentError::Parse(format!("no choice returned for task {}", idx)))
        })
        .collect::<AgentResult<Vec<String>>>()?;

    let usage = parsed.usage.unwrap_or_default();
    engine.record_usage(usage.prompt_tokens, usage.completion_tokens, started.elapsed());
    debug!(
        endpoint = %engine.endpoint_url,
        batch_size = batch.len(),
        completion_tokens = usage.completion_tokens,
        "completion batch finished"
    );

    for (task, text) in batch.into_iter().zip(texts.iter()) {
        if let Some(tx) = task.res_completion {
            let _ = tx.send(text.clone());
        }
    }

    Ok(texts)
}
