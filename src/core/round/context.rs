use serde_json::{Map, Value};

use crate::api::ChatMessage;
use crate::core::message::{Conversation, Message, Role};
use crate::mcp::client::CallResult;
use crate::utils::text::truncate_chars;

/// Role of the stored message that carries a round's tool results back to
/// the model. It is sent to the provider as a user message.
pub const TOOL_RESULTS_ROLE: &str = "tool_results";

#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub server_id: String,
    pub tool_name: String,
    pub arguments: Map<String, Value>,
    pub result: CallResult,
}

/// Conversation history in provider form, led by the optional system prompt.
/// Empty messages and roles the provider does not understand are skipped.
pub fn provider_messages(conversation: &Conversation, system_prompt: Option<&str>) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(conversation.messages.len() + 1);
    if let Some(prompt) = system_prompt.filter(|prompt| !prompt.trim().is_empty()) {
        messages.push(ChatMessage::new("system", prompt));
    }
    for message in &conversation.messages {
        if message.content.trim().is_empty() {
            continue;
        }
        let role = match &message.role {
            Role::Other(role) if role == TOOL_RESULTS_ROLE => Some("user"),
            role => role.to_api_role(),
        };
        if let Some(role) = role {
            messages.push(ChatMessage::new(role, message.content.clone()));
        }
    }
    messages
}

/// Summarises one round of tool outputs for the next model pass.
pub fn tool_results_message(
    outcomes: &[ToolOutcome],
    result_limit: usize,
    context_limit: usize,
) -> Message {
    let mut text = String::from("Tool results:\n");
    for outcome in outcomes {
        let arguments = serde_json::to_string(&outcome.arguments).unwrap_or_default();
        text.push_str(&format!(
            "\n[{}/{}] {}\n",
            outcome.server_id, outcome.tool_name, arguments
        ));
        let result = &outcome.result;
        if result.success {
            text.push_str("status: success\n");
        } else {
            let error = result.error.as_deref().unwrap_or("unknown error");
            text.push_str(&format!("status: error: {}\n", truncate_chars(error, result_limit)));
        }
        if !result.content.trim().is_empty() {
            text.push_str(&truncate_chars(result.content.trim(), result_limit));
            text.push('\n');
        }
    }
    text.push_str("\nContinue the answer using these results. Call another tool only if it is still needed.");

    Message::new(
        Role::Other(TOOL_RESULTS_ROLE.to_string()),
        truncate_chars(&text, context_limit),
    )
}
