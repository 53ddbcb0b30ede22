use serde::Serialize;
use tera::{Context, Tera};

use crate::errors::AgentResult;
use crate::models::message::Message;
use crate::models::role::Role;

/// Render an inline tera template against any serializable context
pub fn load_prompt<T: Serialize>(template: &str, context_data: &T) -> AgentResult<String> {
    let mut tera = Tera::default();
    tera.add_raw_template("inline_template", template)?;
    let context = Context::from_serialize(context_data)?;
    let rendered = tera.render("inline_template", &context)?;
    Ok(rendered)
}

/// Flatten a chat into the `### Instruction / ### User / ### Assistant` raw prompt format,
/// leaving the prompt open for the assistant's next turn
pub fn chat_to_raw_prompt(chat: &[Message]) -> String {
    let mut raw_prompt = String::new();
    for message in chat {
        let header = match message.role {
            Role::System => "### Instruction:",
            Role::User => "### User:",
            Role::Assistant => "### Assistant:",
        };
        raw_prompt.push_str(header);
        raw_prompt.push('\n');
        raw_prompt.push_str(&message.content);
        raw_prompt.push('\n');
    }
    raw_prompt.push_str("### Assistant:\n");
    raw_prompt
}

/// Identify a chat by the ids of its messages
pub fn chat_signature(chat: &[Message]) -> String {
    chat.iter().map(|message| format!("{}:", message.id)).collect()
}
