use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::role::Role;

/// Derive the content-addressed id of a message body
pub fn generate_message_id(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A turn in a conversation
///
/// `reply_to` is a set: every candidate a server produces for one request points back at the
/// same correlation id, so the history forms a DAG rather than a list.
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub reply_to: BTreeSet<String>,
}

impl Message {
    fn new<S: Into<String>>(role: Role, content: S) -> Self {
        let content = content.into();
        Message {
            id: generate_message_id(&content),
            role,
            content,
            reply_to: BTreeSet::new(),
        }
    }

    pub fn system<S: Into<String>>(content: S) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user<S: Into<String>>(content: S) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant<S: Into<String>>(content: S) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Mark this message as a reply to the given message or correlation id
    pub fn replying_to<S: Into<String>>(mut self, parent: S) -> Self {
        self.reply_to.insert(parent.into());
        self
    }

    pub fn is_reply_to(&self, parent: &str) -> bool {
        self.reply_to.contains(parent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_is_deterministic() {
        let first = generate_message_id("2 + 2 = 4");
        let second = generate_message_id("2 + 2 = 4");
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert_ne!(first, generate_message_id("2 + 2 = 5"));
    }

    #[test]
    fn test_id_ignores_role_and_parents() {
        let user = Message::user("hello");
        let assistant = Message::assistant("hello").replying_to("corr-1");
        assert_eq!(user.id, assistant.id);
        assert!(assistant.is_reply_to("corr-1"));
        assert!(!user.is_reply_to("corr-1"));
    }

    #[test]
    fn test_serialization_skips_empty_parents() {
        let json = serde_json::to_value(Message::system("be brief")).unwrap();
        assert_eq!(json["role"], "system");
        assert!(json.get("reply_to").is_none());
    }
}
