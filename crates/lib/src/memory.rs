//! Conversation memory: which messages go into each request, and background summaries.
//!
//! Each request carries the session's context messages, the long-term memory prompt (a
//! rolling summary of older turns), and a short-term window of recent messages. Once the
//! unsummarized history grows past `compress_message_length_threshold`, it is folded into
//! the memory prompt by a streamed summarization request and `last_summarize_index`
//! advances. Sessions with the default topic get a generated title.

use crate::controller::{ControllerKey, ControllerRegistry};
use crate::llm::{ChatClient, ChatError, StreamEvent};
use crate::session::{count_chars, Message, MessageId, ModelConfig, Session};
use crate::store::ChatStore;
use tokio_util::sync::CancellationToken;

/// Characters of conversation needed before a topic is generated.
pub const SUMMARIZE_MIN_LEN: usize = 50;

/// Model used for topic generation.
pub const SUMMARIZE_MODEL: &str = "gpt-3.5-turbo";

const TOPIC_PROMPT: &str = "Please generate a four to five word title summarizing our conversation \
without any lead-in, punctuation, quotation marks, periods, symbols, or additional text. \
Remove enclosing quotation marks.";

const SUMMARIZE_PROMPT: &str = "Summarize the discussion briefly in 200 words or less \
to use as a prompt for future context.";

const MEMORY_PREFIX: &str = "This is a summary of the chat history as a recap: ";

// Registry slots for background requests; chat messages never reach these ids.
const TOPIC_SLOT: MessageId = MessageId::MAX - 1;
const MEMORY_SLOT: MessageId = MessageId::MAX;

/// System message carrying the session's memory prompt.
pub fn memory_message(session: &Session) -> Message {
    Message::system(format!("{}{}", MEMORY_PREFIX, session.memory_prompt))
}

/// Messages to send ahead of a new user message: context messages, the memory prompt when
/// enabled, then recent non-error messages in chronological order.
///
/// The recent window starts at `max(n - history_message_count, last_summarize_index)` and is
/// walked from the newest message back, stopping once the collected text exceeds
/// `compress_message_length_threshold`.
pub fn select_context(session: &Session) -> Vec<Message> {
    let config = &session.model_config;
    let mut out = session.context.clone();
    if config.send_memory && !session.memory_prompt.is_empty() {
        out.push(memory_message(session));
    }

    let n = session.messages.len();
    let start = n
        .saturating_sub(config.history_message_count)
        .max(session.last_summarize_index)
        .min(n);
    let mut recent = Vec::new();
    let mut total = 0;
    for m in session.messages[start..].iter().rev() {
        if m.is_error {
            continue;
        }
        total += m.content.chars().count();
        recent.push(m.clone());
        if total > config.compress_message_length_threshold {
            break;
        }
    }
    recent.reverse();
    out.extend(recent);
    out
}

/// Strip enclosing quotes and trailing punctuation from a generated topic.
pub fn trim_topic(raw: &str) -> String {
    const QUOTES: &[char] = &['"', '\'', '“', '”', '「', '」', '`'];
    const TRAILING: &[char] = &['，', '。', '！', '？', '”', '“', '"', '、', ',', '.', '!', '?'];
    raw.trim()
        .trim_matches(QUOTES)
        .trim()
        .trim_end_matches(TRAILING)
        .trim()
        .to_string()
}

/// Non-error messages from `last_summarize_index` on, cut to the most recent
/// `history_message_count` when they exceed the `max_tokens` budget. Also returns the
/// character count of the uncut history, which decides whether compaction is due.
fn messages_to_summarize(session: &Session) -> (Vec<Message>, usize) {
    let config = &session.model_config;
    let start = session.last_summarize_index.min(session.messages.len());
    let mut msgs: Vec<Message> = session.messages[start..]
        .iter()
        .filter(|m| !m.is_error)
        .cloned()
        .collect();
    let history_len = count_chars(&msgs);
    if history_len > config.max_tokens {
        let keep_from = msgs.len().saturating_sub(config.history_message_count);
        msgs.drain(..keep_from);
    }
    (msgs, history_len)
}

/// What a summarization pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SummaryOutcome {
    pub topic_updated: bool,
    pub memory_updated: bool,
}

/// Runs topic and memory summaries for sessions in a [`ChatStore`].
#[derive(Clone)]
pub struct MemoryManager {
    client: ChatClient,
    controllers: ControllerRegistry,
}

impl MemoryManager {
    pub fn new(client: ChatClient, controllers: ControllerRegistry) -> Self {
        Self {
            client,
            controllers,
        }
    }

    /// Generate the topic and compress memory if due. Failures are logged and leave the
    /// session's topic and memory prompt as they were.
    pub async fn maybe_summarize(&self, store: &ChatStore, session_id: &str) -> SummaryOutcome {
        let topic_updated = match self.summarize_topic(store, session_id).await {
            Ok(updated) => updated,
            Err(e) => {
                log::warn!("memory: topic for session {}: {}", session_id, e);
                false
            }
        };
        let memory_updated = match self.compress_memory(store, session_id).await {
            Ok(updated) => updated,
            Err(e) => {
                log::warn!("memory: compression for session {}: {}", session_id, e);
                false
            }
        };
        SummaryOutcome {
            topic_updated,
            memory_updated,
        }
    }

    /// Ask for a short title once the conversation reaches [`SUMMARIZE_MIN_LEN`] characters
    /// and the topic is still the default. Returns whether the topic changed.
    pub async fn summarize_topic(&self, store: &ChatStore, session_id: &str) -> Result<bool, ChatError> {
        let Some(session) = store.session(session_id).await else {
            return Ok(false);
        };
        let history: Vec<Message> = session
            .messages
            .iter()
            .filter(|m| !m.is_error)
            .cloned()
            .collect();
        if !session.has_default_topic() || count_chars(&history) < SUMMARIZE_MIN_LEN {
            return Ok(false);
        }

        let mut request = history;
        request.push(Message::user(TOPIC_PROMPT));
        let config = ModelConfig {
            model: SUMMARIZE_MODEL.to_string(),
            ..session.model_config.clone()
        };
        let key = ControllerKey::new(session_id, TOPIC_SLOT);
        let token = CancellationToken::new();
        let registration = self.controllers.register(key.clone(), token.clone()).await;
        let res = self.client.chat_with_cancel(&request, &config, &token).await;
        self.controllers.remove(&key, registration).await;

        let res = res.map_err(|e| ChatError::Summarization(e.to_string()))?;
        let topic = trim_topic(res.content());
        if topic.is_empty() {
            return Ok(false);
        }
        log::info!("memory: session {} topic set to {:?}", session_id, topic);
        let updated = store
            .update_session(session_id, |s| s.topic = topic)
            .await
            .is_some();
        Ok(updated)
    }

    /// Fold unsummarized history into the memory prompt when it exceeds the threshold and
    /// long-term memory is enabled. Partial summaries are written as they stream in; on
    /// success `last_summarize_index` becomes the message count seen when the call started.
    pub async fn compress_memory(&self, store: &ChatStore, session_id: &str) -> Result<bool, ChatError> {
        let Some(session) = store.session(session_id).await else {
            return Ok(false);
        };
        let config = session.model_config.clone();
        let (to_summarize, length) = messages_to_summarize(&session);
        if !config.send_memory || length <= config.compress_message_length_threshold {
            return Ok(false);
        }
        let summarized_count = session.messages.len();

        let mut request = Vec::with_capacity(to_summarize.len() + 2);
        request.push(memory_message(&session));
        request.extend(to_summarize);
        request.push(Message::system(SUMMARIZE_PROMPT));
        log::debug!(
            "memory: summarizing {} chars of session {} (through message {})",
            length,
            session_id,
            summarized_count
        );

        let key = ControllerKey::new(session_id, MEMORY_SLOT);
        let mut stream = self.client.send_streaming(&request, &config);
        let token = stream.cancel_token();
        let registration = self.controllers.register(key.clone(), token.clone()).await;
        let mut result = Err(ChatError::Aborted);
        while let Some(ev) = stream.next().await {
            // Events queued before a stop must not touch the session any more.
            if token.is_cancelled() {
                result = Err(ChatError::Aborted);
                break;
            }
            match ev {
                StreamEvent::Message { text, done: false } => {
                    store
                        .update_session(session_id, |s| {
                            // A reset since the snapshot makes this summary stale.
                            if s.messages.len() >= summarized_count {
                                s.memory_prompt = text;
                            }
                        })
                        .await;
                }
                StreamEvent::Message { text, done: true } => {
                    let updated = store
                        .update_session(session_id, |s| {
                            if s.messages.len() < summarized_count {
                                return false;
                            }
                            s.memory_prompt = text;
                            s.last_summarize_index = summarized_count;
                            true
                        })
                        .await
                        .unwrap_or(false);
                    if !updated {
                        log::debug!("memory: session {} changed during summary, dropped", session_id);
                    }
                    result = Ok(updated);
                }
                StreamEvent::Error(e) => {
                    result = Err(e);
                }
            }
        }
        self.controllers.remove(&key, registration).await;
        let result = result.map_err(|e| ChatError::Summarization(e.to_string()));
        if result.is_ok() {
            if let Err(e) = store.save().await {
                log::warn!("memory: saving after summary: {}", e);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_with(contents: &[&str], config: ModelConfig) -> Session {
        let mut s = Session::new(config);
        for (i, c) in contents.iter().enumerate() {
            let m = if i % 2 == 0 {
                Message::user(*c)
            } else {
                Message::assistant(*c)
            };
            s.push_message(m);
        }
        s
    }

    fn contents(msgs: &[Message]) -> Vec<&str> {
        msgs.iter().map(|m| m.content.as_str()).collect()
    }

    #[test]
    fn selects_last_history_count_messages() {
        let config = ModelConfig {
            history_message_count: 4,
            compress_message_length_threshold: 1000,
            ..ModelConfig::default()
        };
        let s = session_with(
            &["0123456789", "1123456789", "2123456789", "3123456789", "4123456789", "5123456789"],
            config,
        );
        let ctx = select_context(&s);
        assert_eq!(
            contents(&ctx),
            vec!["2123456789", "3123456789", "4123456789", "5123456789"]
        );
    }

    #[test]
    fn fewer_messages_than_window_are_all_sent() {
        let s = session_with(&["a", "b"], ModelConfig::default());
        assert_eq!(contents(&select_context(&s)), vec!["a", "b"]);
    }

    #[test]
    fn skips_errors_and_summarized_messages() {
        let config = ModelConfig {
            history_message_count: 10,
            ..ModelConfig::default()
        };
        let mut s = session_with(&["old", "older reply", "q", "bad", "r"], config);
        s.messages[3].is_error = true;
        s.last_summarize_index = 2;
        assert_eq!(contents(&select_context(&s)), vec!["q", "r"]);
    }

    #[test]
    fn stops_after_threshold_is_exceeded() {
        let config = ModelConfig {
            history_message_count: 10,
            compress_message_length_threshold: 15,
            ..ModelConfig::default()
        };
        let s = session_with(&["aaaaaaaaaa", "bbbbbbbbbb", "cccccccccc", "dddddddddd"], config);
        assert_eq!(contents(&select_context(&s)), vec!["cccccccccc", "dddddddddd"]);
    }

    #[test]
    fn memory_prompt_follows_context_when_enabled() {
        let mut s = session_with(&["q"], ModelConfig::default());
        s.context = vec![Message::system("You are terse.")];
        s.memory_prompt = "talked about crabs".into();
        let ctx = select_context(&s);
        assert_eq!(ctx.len(), 3);
        assert_eq!(ctx[0].content, "You are terse.");
        assert_eq!(ctx[1].content, format!("{}talked about crabs", MEMORY_PREFIX));
        assert_eq!(ctx[2].content, "q");

        s.model_config.send_memory = false;
        assert_eq!(select_context(&s).len(), 2);
    }

    #[test]
    fn over_budget_history_keeps_most_recent() {
        let config = ModelConfig {
            max_tokens: 25,
            history_message_count: 2,
            ..ModelConfig::default()
        };
        let mut s = session_with(&["aaaaaaaaaa", "bbbbbbbbbb", "cccccccccc", "dddddddddd"], config);
        s.messages[2].is_error = true;
        let (msgs, history_len) = messages_to_summarize(&s);
        assert_eq!(contents(&msgs), vec!["bbbbbbbbbb", "dddddddddd"]);
        assert_eq!(history_len, 30);
    }

    #[test]
    fn compaction_length_counts_history_before_the_budget_cut() {
        let config = ModelConfig {
            max_tokens: 15,
            history_message_count: 1,
            compress_message_length_threshold: 25,
            ..ModelConfig::default()
        };
        let s = session_with(&["aaaaaaaaaa", "bbbbbbbbbb", "cccccccccc"], config);
        let (msgs, history_len) = messages_to_summarize(&s);
        assert_eq!(contents(&msgs), vec!["cccccccccc"]);
        // The cut window alone is under the threshold; the full history is not.
        assert_eq!(history_len, 30);
        assert!(history_len > s.model_config.compress_message_length_threshold);
    }

    #[test]
    fn trim_topic_strips_quotes_and_punctuation() {
        assert_eq!(trim_topic("  \"Rust Async Basics.\"  "), "Rust Async Basics");
        assert_eq!(trim_topic("“深入理解所有权”。"), "深入理解所有权");
        assert_eq!(trim_topic("Plain title"), "Plain title");
    }
}
