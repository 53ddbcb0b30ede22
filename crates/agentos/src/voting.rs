//! Self-critique scoring of candidate actions
//!
//! A goal and an action description are put in front of several independent voters (samples
//! of the same critique prompt). Their ratings are averaged, and averages backed by a quorum
//! of valid votes are memoized per action description.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::errors::{AgentError, AgentResult};
use crate::models::request::{ClientRequest, Priority, RoutingMode};
use crate::prompt_template::load_prompt;
use crate::transport::Transport;
use crate::utils::parse_json;

const VOTE_PROMPT: &str = include_str!("prompts/vote.md");
const VOTER_PROCESS_NAME: &str = "action-voter";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VotingConfig {
    pub timeout: Duration,
    /// Completions requested per vote
    pub min_results: usize,
    /// Valid ratings required before an average is cached
    pub quorum: usize,
}

impl Default for VotingConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            min_results: 5,
            quorum: 5,
        }
    }
}

/// Memoized consensus ratings keyed by action description
///
/// Entries are written once and never invalidated. The lookup and the insert take the lock
/// separately, so two concurrent misses may both compute a rating; the later write wins.
#[derive(Debug, Default)]
pub struct VoteCache {
    votes: RwLock<HashMap<String, f32>>,
}

impl VoteCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, action: &str) -> Option<f32> {
        self.votes.read().await.get(action).copied()
    }

    pub async fn insert(&self, action: String, rating: f32) {
        self.votes.write().await.insert(action, rating);
    }

    pub async fn len(&self) -> usize {
        self.votes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.votes.read().await.is_empty()
    }
}

/// A voter's rating as it appears on the wire: a JSON number or a numeric string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Rate {
    Number(f64),
    Text(String),
}

impl Rate {
    pub fn value(&self) -> AgentResult<f32> {
        let value = match self {
            Rate::Number(number) => *number as f32,
            Rate::Text(text) => text
                .trim()
                .parse::<f32>()
                .map_err(|err| AgentError::Parse(format!("invalid rate {:?}: {}", text, err)))?,
        };
        if !value.is_finite() {
            return Err(AgentError::Parse(format!("rate {} is not finite", value)));
        }
        Ok(value)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoterResponse {
    #[serde(default)]
    pub thought: String,
    #[serde(default)]
    pub criticism: String,
    #[serde(default)]
    pub feedback: String,
    pub rate: Rate,
}

fn parse_vote(choice: &str) -> AgentResult<f32> {
    let vote: VoterResponse = parse_json(choice)?;
    vote.rate.value()
}

#[derive(Serialize)]
struct VoteContext<'a> {
    goal: &'a str,
    action: &'a str,
}

/// Scores actions through the dispatch path and a shared cache
#[derive(Clone)]
pub struct ActionVoter {
    transport: Arc<dyn Transport>,
    cache: Arc<VoteCache>,
    config: VotingConfig,
}

impl ActionVoter {
    pub fn new(transport: Arc<dyn Transport>, cache: Arc<VoteCache>, config: VotingConfig) -> Self {
        Self {
            transport,
            cache,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<VoteCache> {
        &self.cache
    }

    /// Rate on a 0..10 scale how likely `action` moves toward `goal`
    ///
    /// A below-quorum average is still returned, just not cached. When no voter produced a
    /// usable rating the result is `QuorumNotMet`.
    pub async fn vote_for_action(&self, goal: &str, action: &str) -> AgentResult<f32> {
        if let Some(rating) = self.cache.get(action).await {
            debug!(action, rating, "vote cache hit");
            return Ok(rating);
        }

        let prompt = load_prompt(VOTE_PROMPT, &VoteContext { goal, action })?;
        let request = ClientRequest::new(VOTER_PROCESS_NAME, Priority::User)
            .with_completion(prompt, self.config.min_results);

        let response = self
            .transport
            .run_request(request, self.config.timeout, RoutingMode::Io)
            .await
            .map_err(|err| match err {
                AgentError::Transport(msg) => {
                    AgentError::Transport(format!("error running voters inference request: {}", msg))
                }
                other => other,
            })?;

        if response.completion_responses.is_empty() {
            return Err(AgentError::Transport("no completions returned".to_string()));
        }

        let mut total = 0.0f32;
        let mut votes = 0usize;
        for choice in response.choices() {
            match parse_vote(choice) {
                Ok(rating) => {
                    total += rating;
                    votes += 1;
                }
                Err(err) => warn!(error = %err, "skipping malformed vote"),
            }
        }

        if votes == 0 {
            return Err(AgentError::QuorumNotMet {
                valid: 0,
                required: self.config.quorum,
            });
        }

        let rating = total / votes as f32;
        if votes >= self.config.quorum {
            self.cache.insert(action.to_string(), rating).await;
        } else {
            warn!(
                votes,
                quorum = self.config.quorum,
                rating,
                "vote below quorum, not caching"
            );
        }

        Ok(rating)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::request::{CompletionResponse, ServerResponse};
    use crate::transport::mock::MockTransport;

    const GOAL: &str = "Book a table for two in Lisbon";
    const ACTION: &str = "{\"command\": \"search\", \"args\": {\"query\": \"Lisbon restaurants\"}}";

    fn vote(rate: &str) -> String {
        format!(
            r#"{{"thought": "seems useful", "criticism": "none", "feedback": "go", "rate": {}}}"#,
            rate
        )
    }

    fn voter(transport: Arc<MockTransport>) -> ActionVoter {
        ActionVoter::new(transport, Arc::new(VoteCache::new()), VotingConfig::default())
    }

    #[tokio::test]
    async fn test_average_is_cached() {
        let choices = [vote("\"8\""), vote("7.5"), vote("9"), vote("6"), vote("\"5\"")];
        let choices: Vec<&str> = choices.iter().map(String::as_str).collect();
        let transport = Arc::new(MockTransport::repeating("corr-vote", &choices, 2));
        let voter = voter(transport.clone());

        let rating = voter.vote_for_action(GOAL, ACTION).await.unwrap();
        assert!((rating - 7.1).abs() < 1e-5);
        assert_eq!(transport.calls(), 1);

        let cached = voter.vote_for_action(GOAL, ACTION).await.unwrap();
        assert_eq!(cached, rating);
        assert_eq!(transport.calls(), 1);
        assert_eq!(voter.cache().len().await, 1);
    }

    #[tokio::test]
    async fn test_request_shape() {
        let choices = [vote("5")];
        let choices: Vec<&str> = choices.iter().map(String::as_str).collect();
        let transport = Arc::new(MockTransport::repeating("corr-vote", &choices, 1));
        voter(transport.clone())
            .vote_for_action(GOAL, ACTION)
            .await
            .unwrap();

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].process_name, "action-voter");
        assert_eq!(requests[0].priority, Priority::User);
        let spec = &requests[0].completion_requests[0];
        assert_eq!(spec.min_results, 5);
        assert!(spec.raw_prompt.contains(GOAL));
        assert!(spec.raw_prompt.contains(ACTION));
    }

    #[tokio::test]
    async fn test_below_quorum_is_not_cached() {
        let choices = [
            vote("8"),
            vote("6"),
            "I think this is a great idea, 10/10".to_string(),
            vote("\"4\""),
            vote("2"),
        ];
        let choices: Vec<&str> = choices.iter().map(String::as_str).collect();
        let transport = Arc::new(MockTransport::repeating("corr-vote", &choices, 2));
        let voter = voter(transport.clone());

        let rating = voter.vote_for_action(GOAL, ACTION).await.unwrap();
        assert!((rating - 5.0).abs() < 1e-5);
        assert!(voter.cache().is_empty().await);

        voter.vote_for_action(GOAL, ACTION).await.unwrap();
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_no_valid_votes() {
        let choices = ["no json here", r#"{"rate": true}"#, r#"{"rate": "high"}"#];
        let transport = Arc::new(MockTransport::repeating("corr-vote", &choices, 1));

        let result = voter(transport).vote_for_action(GOAL, ACTION).await;
        assert_eq!(
            result,
            Err(AgentError::QuorumNotMet {
                valid: 0,
                required: 5
            })
        );
    }

    #[tokio::test]
    async fn test_transport_failure() {
        let transport = Arc::new(MockTransport::new(vec![Err(AgentError::Transport(
            "connection refused".to_string(),
        ))]));
        let result = voter(transport).vote_for_action(GOAL, ACTION).await;
        assert!(matches!(result, Err(AgentError::Transport(ref msg)) if msg.contains("connection refused")));
    }

    #[tokio::test]
    async fn test_empty_response() {
        let transport = Arc::new(MockTransport::new(vec![Ok(ServerResponse {
            correlation_id: "corr-vote".to_string(),
            completion_responses: vec![],
        })]));
        let result = voter(transport).vote_for_action(GOAL, ACTION).await;
        assert!(matches!(result, Err(AgentError::Transport(_))));
    }

    #[tokio::test]
    async fn test_shared_cache_across_voters() {
        let choices = [vote("3"), vote("3"), vote("3"), vote("3"), vote("3")];
        let choices: Vec<&str> = choices.iter().map(String::as_str).collect();
        let transport = Arc::new(MockTransport::repeating("corr-vote", &choices, 1));
        let cache = Arc::new(VoteCache::new());

        let first = ActionVoter::new(transport.clone(), cache.clone(), VotingConfig::default());
        let second = ActionVoter::new(transport.clone(), cache, VotingConfig::default());

        assert_eq!(first.vote_for_action(GOAL, ACTION).await.unwrap(), 3.0);
        assert_eq!(second.vote_for_action(GOAL, ACTION).await.unwrap(), 3.0);
        assert_eq!(transport.calls(), 1);
    }

    #[test]
    fn test_rate_shapes() {
        let number: Rate = serde_json::from_str("7").unwrap();
        let float: Rate = serde_json::from_str("7.5").unwrap();
        let text: Rate = serde_json::from_str("\" 6 \"").unwrap();
        assert_eq!(number.value().unwrap(), 7.0);
        assert_eq!(float.value().unwrap(), 7.5);
        assert_eq!(text.value().unwrap(), 6.0);
        assert!(Rate::Text("NaN".to_string()).value().is_err());
        assert!(serde_json::from_str::<Rate>("[1]").is_err());
    }

    #[test]
    fn test_response_with_two_groups() {
        let response = ServerResponse {
            correlation_id: "corr".to_string(),
            completion_responses: vec![
                CompletionResponse {
                    choices: vec!["a".to_string()],
                },
                CompletionResponse {
                    choices: vec!["b".to_string(), "c".to_string()],
                },
            ],
        };
        assert_eq!(response.choices().collect::<Vec<_>>(), vec!["a", "b", "c"]);
    }
}
