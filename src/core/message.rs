use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const TAG_KIND_TOOL_CALL: &str = "tool_call";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    User,
    Assistant,
    System,
    Other(String),
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Other(role) => role.as_str(),
        }
    }

    /// Roles that are forwarded to the model provider.
    pub fn to_api_role(&self) -> Option<&'static str> {
        match self {
            Role::User => Some("user"),
            Role::Assistant => Some("assistant"),
            Role::System => Some("system"),
            Role::Other(_) => None,
        }
    }
}

impl From<String> for Role {
    fn from(value: String) -> Self {
        match value.as_str() {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            "system" => Role::System,
            _ => Role::Other(value),
        }
    }
}

impl From<&str> for Role {
    fn from(value: &str) -> Self {
        Role::from(value.to_string())
    }
}

impl From<Role> for String {
    fn from(value: Role) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagStatus {
    Running,
    Success,
    Error,
    Info,
}

impl TagStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TagStatus::Success | TagStatus::Error)
    }

    /// Whether moving from `self` to `next` respects `running -> {success|error}`.
    /// A terminal status never goes back to `running`.
    pub fn can_transition_to(self, next: TagStatus) -> bool {
        !(self.is_terminal() && next == TagStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    pub kind: String,
    pub title: String,
    /// Usually a JSON-encoded [`TagPayload`].
    pub content: String,
    pub status: TagStatus,
    pub created_at: DateTime<Utc>,
}

impl Tag {
    pub fn new(kind: &str, title: &str, content: String, status: TagStatus) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            title: title.to_string(),
            content,
            status,
            created_at: Utc::now(),
        }
    }

    pub fn payload(&self) -> Option<TagPayload> {
        TagPayload::decode(&self.content)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            reasoning: None,
            tags: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tag(&self, tag_id: &str) -> Option<&Tag> {
        self.tags.iter().find(|tag| tag.id == tag_id)
    }

    /// Inserts `tag` or replaces the tag with the same id in place.
    /// Returns false (and leaves the message untouched) when the update would
    /// move a terminal tag back to `running`.
    pub fn upsert_tag(&mut self, tag: Tag) -> bool {
        match self.tags.iter_mut().find(|existing| existing.id == tag.id) {
            Some(existing) => {
                if !existing.status.can_transition_to(tag.status) {
                    return false;
                }
                *existing = tag;
                true
            }
            None => {
                self.tags.push(tag);
                true
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
        }
    }

    pub fn message(&self, message_id: &str) -> Option<&Message> {
        self.messages.iter().find(|message| message.id == message_id)
    }

    pub fn message_mut(&mut self, message_id: &str) -> Option<&mut Message> {
        self.messages
            .iter_mut()
            .find(|message| message.id == message_id)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Structured side-channel payload stored in [`Tag::content`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagPayload {
    pub name: String,
    #[serde(default, alias = "description")]
    pub subtitle: String,
    pub status: TagStatus,
    #[serde(default)]
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(
        default,
        rename = "serverId",
        alias = "server_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub server_id: Option<String>,
    #[serde(
        default,
        rename = "toolName",
        alias = "tool_name",
        skip_serializing_if = "Option::is_none"
    )]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    #[serde(
        default,
        rename = "elapsedMs",
        alias = "elapsed_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub elapsed_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl TagPayload {
    pub fn new(name: impl Into<String>, subtitle: impl Into<String>, status: TagStatus) -> Self {
        Self {
            name: name.into(),
            subtitle: subtitle.into(),
            status,
            progress: if status.is_terminal() { 100 } else { 0 },
            error: None,
            server_id: None,
            tool_name: None,
            arguments: None,
            elapsed_ms: None,
            result: None,
        }
    }

    pub fn encode(&self) -> String {
        let mut payload = self.clone();
        payload.progress = payload.progress.min(100);
        serde_json::to_string(&payload).unwrap_or_else(|_| "{}".to_string())
    }

    /// Lenient decode: progress may arrive as any JSON number and is clamped
    /// to `0..=100`.
    pub fn decode(content: &str) -> Option<Self> {
        let mut value: Value = serde_json::from_str(content).ok()?;
        let object = value.as_object_mut()?;
        if let Some(progress) = object.get("progress").and_then(Value::as_f64) {
            let clamped = progress.clamp(0.0, 100.0).round() as u8;
            object.insert("progress".to_string(), Value::from(clamped));
        } else {
            object.remove("progress");
        }
        serde_json::from_value(value).ok()
    }
}
