use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{AgentError, AgentResult};
use crate::utils::parse_json;

/// One entry of an agency definition file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    pub agent: GeneralAgentSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GeneralAgentSettings {
    pub name: String,
    #[serde(default)]
    pub input_sink: Option<Value>,
    pub prompt_based: PromptBasedAgentSettings,
    #[serde(default)]
    pub life_cycle_type: Option<String>,
    #[serde(default)]
    pub life_cycle_length: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PromptBasedAgentSettings {
    pub prompt: String,
    #[serde(default)]
    pub response_format: Map<String, Value>,
    #[serde(default)]
    pub response_parsers: Vec<ResponseParser>,
}

/// Where to find a value in the agent's JSON reply: a top level key or a path of keys
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParserPath {
    Key(String),
    Keys(Vec<String>),
}

impl ParserPath {
    fn lookup<'a>(&self, response: &'a Map<String, Value>) -> Option<&'a Value> {
        let found = match self {
            ParserPath::Key(key) => response.get(key),
            ParserPath::Keys(keys) => {
                let (first, rest) = keys.split_first()?;
                rest.iter()
                    .try_fold(response.get(first)?, |value, key| value.as_object()?.get(key))
            }
        };
        found.filter(|value| !value.is_null())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseParser {
    pub path: ParserPath,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A value picked out of a reply by one of the configured parsers
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseParserResult {
    pub tags: Vec<String>,
    pub value: Value,
    pub path: ParserPath,
}

impl ResponseParserResult {
    pub fn has_any_tags(&self, tags: &[&str]) -> bool {
        self.tags.iter().any(|tag| tags.contains(&tag.as_str()))
    }
}

/// Parse a YAML agency file holding a list of agent definitions
pub fn parse_agency(yaml: &str) -> AgentResult<Vec<AgentSettings>> {
    Ok(serde_yaml::from_str(yaml)?)
}

impl AgentSettings {
    pub fn name(&self) -> &str {
        &self.agent.name
    }

    pub fn has_response_parsers(&self) -> bool {
        !self.agent.prompt_based.response_parsers.is_empty()
    }

    /// The response format as the JSON description shown to the model
    pub fn response_json_format(&self) -> AgentResult<String> {
        Ok(serde_json::to_string_pretty(
            &self.agent.prompt_based.response_format,
        )?)
    }

    /// Apply the configured parsers to a model reply
    pub fn parse_response(&self, response: &str) -> AgentResult<Vec<ResponseParserResult>> {
        let parsed: Value = parse_json(response)?;
        let parsed = parsed
            .as_object()
            .ok_or_else(|| AgentError::Parse("agent response is not a JSON object".to_string()))?;

        Ok(self
            .agent
            .prompt_based
            .response_parsers
            .iter()
            .filter_map(|parser| {
                parser.path.lookup(parsed).map(|value| ResponseParserResult {
                    tags: parser.tags.clone(),
                    value: value.clone(),
                    path: parser.path.clone(),
                })
            })
            .collect())
    }
}
