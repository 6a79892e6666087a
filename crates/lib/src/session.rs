//! Conversation session and message history.
//!
//! A session holds an ordered list of messages (user/assistant/system), the rolling
//! memory prompt that stands in for older turns, and the model configuration used
//! for every request made on its behalf.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique session identifier (opaque string).
pub type SessionId = String;

/// Identifier of a message, unique within its session.
pub type MessageId = u64;

/// Topic shown until the conversation is long enough to be summarized.
pub const DEFAULT_TOPIC: &str = "New Conversation";

pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A single message in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    /// Text sent to the model in place of `content` (e.g. a search-augmented prompt).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub augmented_content: Option<String>,
    pub date: DateTime<Utc>,
    /// Attached media (image URLs).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<String>,
    /// True while an assistant message is still receiving deltas.
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub is_error: bool,
    /// Model that produced an assistant message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: 0,
            role,
            content: content.into(),
            augmented_content: None,
            date: Utc::now(),
            media: Vec::new(),
            streaming: false,
            is_error: false,
            model: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Text to send to the model: augmented content when present, else display content.
    pub fn prompt_content(&self) -> &str {
        self.augmented_content.as_deref().unwrap_or(&self.content)
    }
}

/// Model parameters plus memory thresholds for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub presence_penalty: f32,
    /// Character budget for the history folded into a summarization request.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// Send the long-term memory prompt with each request and keep it up to date.
    #[serde(default = "default_true")]
    pub send_memory: bool,
    /// Number of most recent messages sent as short-term context.
    #[serde(default = "default_history_message_count")]
    pub history_message_count: usize,
    /// Character count above which history is compressed into the memory prompt.
    #[serde(default = "default_compress_threshold")]
    pub compress_message_length_threshold: usize,
    /// Augment user prompts with web-search results.
    #[serde(default)]
    pub web_search: bool,
    /// Size used for image generation requests.
    #[serde(default = "default_image_size")]
    pub image_size: String,
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_temperature() -> f32 {
    1.0
}

fn default_max_tokens() -> usize {
    2000
}

fn default_true() -> bool {
    true
}

pub(crate) fn default_history_message_count() -> usize {
    4
}

pub(crate) fn default_compress_threshold() -> usize {
    1000
}

fn default_image_size() -> String {
    "1024x1024".to_string()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            presence_penalty: 0.0,
            max_tokens: default_max_tokens(),
            send_memory: true,
            history_message_count: default_history_message_count(),
            compress_message_length_threshold: default_compress_threshold(),
            web_search: false,
            image_size: default_image_size(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStat {
    /// Total characters of finished assistant replies.
    #[serde(default)]
    pub char_count: usize,
}

/// A session: id, topic, message history, memory, and configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub topic: String,
    /// Rolling summary of messages before `last_summarize_index`.
    #[serde(default)]
    pub memory_prompt: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub stat: SessionStat,
    pub last_update: DateTime<Utc>,
    #[serde(default)]
    pub last_summarize_index: usize,
    #[serde(default)]
    pub model_config: ModelConfig,
    /// Messages always sent ahead of the history (e.g. a persona system prompt).
    #[serde(default)]
    pub context: Vec<Message>,
    #[serde(default)]
    pub next_message_id: MessageId,
}

impl Session {
    pub fn new(model_config: ModelConfig) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            topic: DEFAULT_TOPIC.to_string(),
            memory_prompt: String::new(),
            messages: Vec::new(),
            stat: SessionStat::default(),
            last_update: Utc::now(),
            last_summarize_index: 0,
            model_config,
            context: Vec::new(),
            next_message_id: 0,
        }
    }

    /// Append a message, assigning it the next id. Returns the id.
    pub fn push_message(&mut self, mut message: Message) -> MessageId {
        let id = self.next_message_id;
        self.next_message_id += 1;
        message.id = id;
        self.messages.push(message);
        self.last_update = Utc::now();
        id
    }

    pub fn message_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    pub fn message(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Clear history and memory, keeping id, topic, and configuration.
    pub fn reset(&mut self) {
        self.messages.clear();
        self.memory_prompt.clear();
        self.last_summarize_index = 0;
        self.last_update = Utc::now();
    }

    pub fn has_default_topic(&self) -> bool {
        self.topic == DEFAULT_TOPIC
    }
}

/// Total character count of the given messages.
pub fn count_chars<'a>(messages: impl IntoIterator<Item = &'a Message>) -> usize {
    messages.into_iter().map(|m| m.content.chars().count()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_message_assigns_increasing_ids() {
        let mut s = Session::new(ModelConfig::default());
        let a = s.push_message(Message::user("hi"));
        let b = s.push_message(Message::assistant("hello"));
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(s.message(1).map(|m| m.content.as_str()), Some("hello"));
    }

    #[test]
    fn reset_keeps_identity_and_topic() {
        let mut s = Session::new(ModelConfig::default());
        s.topic = "Rust questions".to_string();
        s.memory_prompt = "summary".to_string();
        s.push_message(Message::user("hi"));
        s.last_summarize_index = 1;
        let id = s.id.clone();
        s.reset();
        assert_eq!(s.id, id);
        assert_eq!(s.topic, "Rust questions");
        assert!(s.messages.is_empty());
        assert!(s.memory_prompt.is_empty());
        assert_eq!(s.last_summarize_index, 0);
    }

    #[test]
    fn prompt_content_prefers_augmented() {
        let mut m = Message::user("weather?");
        assert_eq!(m.prompt_content(), "weather?");
        m.augmented_content = Some("search results ... weather?".to_string());
        assert_eq!(m.prompt_content(), "search results ... weather?");
    }

    #[test]
    fn model_config_deserializes_with_defaults() {
        let c: ModelConfig = serde_json::from_str(r#"{"model":"gpt-4"}"#).unwrap();
        assert_eq!(c.model, "gpt-4");
        assert_eq!(c.history_message_count, 4);
        assert_eq!(c.compress_message_length_threshold, 1000);
        assert!(c.send_memory);
    }
}
