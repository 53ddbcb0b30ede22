//! The per-agent runtime pipeline
//!
//! Four stages run as long-lived tasks connected by bounded queues:
//!
//! 1. **dispatch** hands each submitted request to the transport
//! 2. **receive** fans every server response out into one message per choice
//! 3. **processing** applies the agent's response parsers
//! 4. **history** appends to the ordered history and keeps terminal bookkeeping
//!
//! Every queue blocks its producer when full. Stopping closes the dispatch queue; each stage
//! then drains what it already holds and exits once its upstream is gone, so a stop loses
//! nothing that was accepted before it.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex, Notify, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::errors::{AgentError, AgentResult};
use crate::models::message::Message;
use crate::models::request::{ClientRequest, RoutingMode, ServerResponse};
use crate::prompt_template::load_prompt;
use crate::settings::{AgentSettings, ResponseParserResult};
use crate::transport::Transport;
use crate::voting::{ActionVoter, VoteCache, VotingConfig};

/// Extraction tag marking a reply as a leaf of the exploration tree
pub const TERMINAL_TAG: &str = "terminal";
/// Extraction tag whose value is forwarded on the final report channel
pub const FINAL_REPORT_TAG: &str = "final-report";

/// Queue capacities and timeouts of one agent pipeline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineConfig {
    /// Requests waiting for dispatch; a full queue blocks `submit`
    pub dispatch_capacity: usize,
    /// Transport results waiting for fan-out; a full queue blocks the finished request task
    pub results_capacity: usize,
    pub processing_capacity: usize,
    pub history_capacity: usize,
    /// Requests handed to the transport at once; while at the limit the dispatch queue fills
    pub max_in_flight: usize,
    pub request_timeout: Duration,
    pub routing_mode: RoutingMode,
    /// Grace `stop` grants the stages on top of the time queued requests may take
    pub shutdown_timeout: Duration,
}

impl PipelineConfig {
    /// Upper bound `stop` waits for: every queued and in-flight request may use its full
    /// request timeout, one wave of `max_in_flight` requests at a time
    pub fn drain_timeout(&self) -> Duration {
        let waves = 1 + self.dispatch_capacity.div_ceil(self.max_in_flight.max(1));
        self.request_timeout * waves as u32 + self.shutdown_timeout
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dispatch_capacity: 1,
            results_capacity: 100,
            processing_capacity: 100,
            history_capacity: 100,
            max_in_flight: 16,
            request_timeout: Duration::from_secs(600),
            routing_mode: RoutingMode::Io,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// A fanned-out reply together with what the response parsers found in it
#[derive(Debug, Clone)]
pub struct ProcessedMessage {
    pub message: Message,
    pub extracted: Vec<ResponseParserResult>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub submitted: u64,
    pub received: u64,
    pub failed: u64,
    pub fanned_out: u64,
    pub historized: u64,
}

#[derive(Default)]
struct History {
    messages: Vec<Message>,
    positions: HashMap<String, usize>,
}

impl History {
    /// Append a message; a known id only gains the new parents
    fn append(&mut self, message: Message) -> bool {
        match self.positions.get(&message.id) {
            Some(&position) => {
                self.messages[position].reply_to.extend(message.reply_to);
                false
            }
            None => {
                self.positions
                    .insert(message.id.clone(), self.messages.len());
                self.messages.push(message);
                true
            }
        }
    }
}

#[derive(Default)]
struct Terminals {
    visits: HashMap<String, usize>,
    votes: HashMap<String, f32>,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    received: AtomicU64,
    failed: AtomicU64,
    /// Transport results the receive stage is done with, failures included
    handled: AtomicU64,
    fanned_out: AtomicU64,
    historized: AtomicU64,
}

impl Counters {
    /// Every submitted request is answered and all its messages are in the history
    fn settled(&self) -> bool {
        // handled first: a response's fan-out count is published before it counts as handled
        let submitted = self.submitted.load(Ordering::SeqCst);
        let handled = self.handled.load(Ordering::SeqCst);
        let fanned_out = self.fanned_out.load(Ordering::SeqCst);
        let historized = self.historized.load(Ordering::SeqCst);
        handled >= submitted && historized >= fanned_out
    }
}

struct AgentState {
    settings: AgentSettings,
    history: RwLock<History>,
    terminals: RwLock<Terminals>,
    input_variables: RwLock<HashMap<String, Value>>,
    counters: Counters,
    progress: Notify,
}

impl AgentState {
    async fn append(&self, message: Message) -> bool {
        self.history.write().await.append(message)
    }
}

/// A running agent: its history, its pipeline stages and its voter
pub struct GeneralAgent {
    state: Arc<AgentState>,
    jobs_tx: mpsc::Sender<ClientRequest>,
    stop_tx: watch::Sender<bool>,
    stages: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    final_reports: Mutex<Option<mpsc::Receiver<String>>>,
    transport: Arc<dyn Transport>,
    voter: ActionVoter,
    config: PipelineConfig,
}

impl GeneralAgent {
    /// Create the agent and spawn its four pipeline stages
    pub fn start(
        settings: AgentSettings,
        transport: Arc<dyn Transport>,
        config: PipelineConfig,
    ) -> Self {
        let state = Arc::new(AgentState {
            settings,
            history: RwLock::new(History::default()),
            terminals: RwLock::new(Terminals::default()),
            input_variables: RwLock::new(HashMap::new()),
            counters: Counters::default(),
            progress: Notify::new(),
        });

        let (jobs_tx, jobs_rx) = mpsc::channel(config.dispatch_capacity.max(1));
        let (results_tx, results_rx) = mpsc::channel(config.results_capacity.max(1));
        let (processing_tx, processing_rx) = mpsc::channel(config.processing_capacity.max(1));
        let (history_tx, history_rx) = mpsc::channel(config.history_capacity.max(1));
        let (final_tx, final_rx) = mpsc::channel(config.history_capacity.max(1));
        let (stop_tx, stop_rx) = watch::channel(false);

        let dispatch = DispatchStage {
            state: state.clone(),
            transport: transport.clone(),
            timeout: config.request_timeout,
            mode: config.routing_mode,
            max_in_flight: config.max_in_flight.max(1),
        };

        let stages = vec![
            (
                "dispatch",
                tokio::spawn(dispatch.run(jobs_rx, results_tx, stop_rx)),
            ),
            (
                "receive",
                tokio::spawn(receive_stage(state.clone(), results_rx, processing_tx)),
            ),
            (
                "processing",
                tokio::spawn(processing_stage(state.clone(), processing_rx, history_tx)),
            ),
            (
                "history",
                tokio::spawn(history_stage(state.clone(), history_rx, final_tx)),
            ),
        ];
        info!(agent = %state.settings.name(), "agent pipeline started");

        let voter = ActionVoter::new(
            transport.clone(),
            Arc::new(VoteCache::new()),
            VotingConfig::default(),
        );

        Self {
            state,
            jobs_tx,
            stop_tx,
            stages: Mutex::new(stages),
            final_reports: Mutex::new(Some(final_rx)),
            transport,
            voter,
            config,
        }
    }

    /// Share a vote cache with other agents
    pub fn with_vote_cache(self, cache: Arc<VoteCache>, config: VotingConfig) -> Self {
        let voter = ActionVoter::new(self.transport.clone(), cache, config);
        Self { voter, ..self }
    }

    pub fn name(&self) -> &str {
        self.state.settings.name()
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.state.settings
    }

    /// Queue a request for dispatch, waiting while the dispatch queue is full
    pub async fn submit(&self, request: ClientRequest) -> AgentResult<()> {
        self.jobs_tx
            .send(request)
            .await
            .map_err(|_| AgentError::Shutdown)?;
        self.state.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Append a message directly, bypassing the pipeline
    pub async fn append_message(&self, message: Message) -> bool {
        self.state.append(message).await
    }

    pub async fn history(&self) -> Vec<Message> {
        self.state.history.read().await.messages.clone()
    }

    pub async fn history_len(&self) -> usize {
        self.state.history.read().await.messages.len()
    }

    /// Messages that answer the given message or correlation id
    pub async fn replies_to(&self, parent: &str) -> Vec<Message> {
        self.state
            .history
            .read()
            .await
            .messages
            .iter()
            .filter(|message| message.is_reply_to(parent))
            .cloned()
            .collect()
    }

    pub async fn set_input_variable<V: Serialize>(&self, key: &str, value: V) -> AgentResult<()> {
        let value = serde_json::to_value(value)?;
        self.state
            .input_variables
            .write()
            .await
            .insert(key.to_string(), value);
        Ok(())
    }

    /// Render the agent prompt from the input variables and append the response format
    pub async fn system_message(&self) -> AgentResult<Message> {
        let settings = &self.state.settings;
        let context = {
            let variables = self.state.input_variables.read().await;
            load_prompt(&settings.agent.prompt_based.prompt, &*variables)?
        };
        let response_format = settings.response_json_format()?;

        Ok(Message::system(format!(
            "{}\nRespond always in JSON format:\n{}\n",
            context, response_format
        )))
    }

    pub async fn vote_for_action(&self, goal: &str, action: &str) -> AgentResult<f32> {
        self.voter.vote_for_action(goal, action).await
    }

    pub async fn record_terminal_vote(&self, key: &str, rating: f32) {
        self.state
            .terminals
            .write()
            .await
            .votes
            .insert(key.to_string(), rating);
    }

    pub async fn terminal_vote(&self, key: &str) -> Option<f32> {
        self.state.terminals.read().await.votes.get(key).copied()
    }

    pub async fn terminal_visits(&self, key: &str) -> usize {
        self.state
            .terminals
            .read()
            .await
            .visits
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// The receiving end of the final report channel; available once
    pub async fn take_final_reports(&self) -> Option<mpsc::Receiver<String>> {
        self.final_reports.lock().await.take()
    }

    pub fn stats(&self) -> PipelineStats {
        let counters = &self.state.counters;
        PipelineStats {
            submitted: counters.submitted.load(Ordering::Relaxed),
            received: counters.received.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            fanned_out: counters.fanned_out.load(Ordering::Relaxed),
            historized: counters.historized.load(Ordering::Relaxed),
        }
    }

    /// Wait until every submitted request has been answered and its replies historized
    pub async fn wait_settled(&self, limit: Duration) -> AgentResult<()> {
        let settled = async {
            loop {
                let progressed = self.state.progress.notified();
                tokio::pin!(progressed);
                progressed.as_mut().enable();
                if self.state.counters.settled() {
                    return;
                }
                progressed.await;
            }
        };
        tokio::time::timeout(limit, settled)
            .await
            .map_err(|_| AgentError::ReplyTimeout(limit))
    }

    /// Stop accepting requests and wait for every stage to drain and exit
    ///
    /// Queued and in-flight requests get their full request timeout (see
    /// [`PipelineConfig::drain_timeout`]). Stages still running after that are aborted, which
    /// cancels their in-flight requests. Calling `stop` again is a no-op.
    pub async fn stop(&self) -> AgentResult<()> {
        let _ = self.stop_tx.send(true);

        let limit = self.config.drain_timeout();
        let mut stages = self.stages.lock().await;
        let drained = tokio::time::timeout(limit, async {
            for (name, handle) in stages.iter_mut() {
                if let Err(err) = handle.await {
                    warn!(stage = *name, error = %err, "pipeline stage ended abnormally");
                }
                debug!(stage = *name, "pipeline stage drained");
            }
        })
        .await;

        match drained {
            Ok(()) => {
                stages.clear();
                info!(agent = %self.name(), "agent pipeline stopped");
                Ok(())
            }
            Err(_) => {
                for (name, handle) in stages.drain(..) {
                    if !handle.is_finished() {
                        warn!(stage = name, "aborting pipeline stage after shutdown timeout");
                        handle.abort();
                    }
                }
                Err(AgentError::ShutdownTimeout(limit))
            }
        }
    }
}

struct DispatchStage {
    state: Arc<AgentState>,
    transport: Arc<dyn Transport>,
    timeout: Duration,
    mode: RoutingMode,
    max_in_flight: usize,
}

impl DispatchStage {
    async fn run(
        self,
        mut jobs: mpsc::Receiver<ClientRequest>,
        results: mpsc::Sender<AgentResult<ServerResponse>>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                request = jobs.recv(), if in_flight.len() < self.max_in_flight => match request {
                    Some(request) => self.dispatch(&mut in_flight, request, &results),
                    None => break,
                },
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(err) = joined {
                        warn!(error = %err, "dispatch task ended abnormally");
                    }
                }
            }
        }

        // no new requests from here on; everything already queued still goes out
        jobs.close();
        loop {
            if in_flight.len() >= self.max_in_flight {
                if let Some(Err(err)) = in_flight.join_next().await {
                    warn!(error = %err, "dispatch task ended abnormally");
                }
                continue;
            }
            match jobs.recv().await {
                Some(request) => self.dispatch(&mut in_flight, request, &results),
                None => break,
            }
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "dispatch task ended abnormally");
            }
        }
    }

    fn dispatch(
        &self,
        in_flight: &mut JoinSet<()>,
        request: ClientRequest,
        results: &mpsc::Sender<AgentResult<ServerResponse>>,
    ) {
        let transport = self.transport.clone();
        let state = self.state.clone();
        let results = results.clone();
        let timeout = self.timeout;
        let mode = self.mode;

        in_flight.spawn(async move {
            let process = request.process_name.clone();
            let result = transport.run_request(request, timeout, mode).await;
            match &result {
                Ok(response) => {
                    state.counters.received.fetch_add(1, Ordering::Relaxed);
                    debug!(correlation_id = %response.correlation_id, %process, "request served");
                }
                Err(err) => {
                    state.counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %err, %process, "request dispatch failed");
                }
            }
            if results.send(result).await.is_err() {
                warn!(%process, "result dropped, receive stage is gone");
            }
        });
    }
}

/// One assistant message per choice, each replying to the response's correlation id
pub fn fan_out(response: &ServerResponse) -> Vec<Message> {
    response
        .choices()
        .map(|choice| Message::assistant(choice).replying_to(response.correlation_id.as_str()))
        .collect()
}

async fn receive_stage(
    state: Arc<AgentState>,
    mut results: mpsc::Receiver<AgentResult<ServerResponse>>,
    processing: mpsc::Sender<Message>,
) {
    while let Some(result) = results.recv().await {
        // failures were already counted and logged by the dispatch task
        if let Ok(response) = result {
            let messages = fan_out(&response);
            if messages.is_empty() {
                debug!(
                    agent = %state.settings.name(),
                    correlation_id = %response.correlation_id,
                    "response without choices"
                );
            }
            state
                .counters
                .fanned_out
                .fetch_add(messages.len() as u64, Ordering::SeqCst);
            for message in messages {
                if processing.send(message).await.is_err() {
                    return;
                }
            }
        }
        state.counters.handled.fetch_add(1, Ordering::SeqCst);
        state.progress.notify_waiters();
    }
}

async fn processing_stage(
    state: Arc<AgentState>,
    mut messages: mpsc::Receiver<Message>,
    history: mpsc::Sender<ProcessedMessage>,
) {
    while let Some(message) = messages.recv().await {
        let extracted = if state.settings.has_response_parsers() {
            state
                .settings
                .parse_response(&message.content)
                .unwrap_or_else(|err| {
                    debug!(message_id = %message.id, error = %err, "reply not parsable, passing through");
                    Vec::new()
                })
        } else {
            Vec::new()
        };

        if history
            .send(ProcessedMessage { message, extracted })
            .await
            .is_err()
        {
            return;
        }
    }
}

async fn history_stage(
    state: Arc<AgentState>,
    mut processed: mpsc::Receiver<ProcessedMessage>,
    final_reports: mpsc::Sender<String>,
) {
    while let Some(ProcessedMessage { message, extracted }) = processed.recv().await {
        let id = message.id.clone();
        state.append(message).await;

        if extracted
            .iter()
            .any(|result| result.has_any_tags(&[TERMINAL_TAG]))
        {
            *state
                .terminals
                .write()
                .await
                .visits
                .entry(id.clone())
                .or_insert(0) += 1;
        }

        for report in extracted
            .iter()
            .filter(|result| result.has_any_tags(&[FINAL_REPORT_TAG]))
        {
            let text = match &report.value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            if let Err(err) = final_reports.try_send(text) {
                warn!(message_id = %id, error = %err, "final report not delivered");
            }
        }

        state.counters.historized.fetch_add(1, Ordering::SeqCst);
        state.progress.notify_waiters();
    }
}
