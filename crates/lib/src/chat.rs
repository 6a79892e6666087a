//! Chat turn: append the user message, stream the reply into a placeholder assistant
//! message, finalize it, release the controller, and kick off background summaries.

use crate::config::{self, Config};
use crate::controller::{ControllerKey, ControllerRegistry};
use crate::llm::{ChatClient, ChatError, ImageData, ImageRequest, StreamEvent};
use crate::memory::{self, MemoryManager, SummaryOutcome};
use crate::search::{self, SearchClient};
use crate::session::{Message, MessageId, SessionId};
use crate::store::ChatStore;
use anyhow::{Context, Result};
use tokio::task::JoinHandle;

/// Appended to the partial reply when the server rejects the credentials.
pub const UNAUTHORIZED_NOTICE: &str =
    "Unauthorized access: set an API key or access code in the config and try again.";

/// Result of one chat turn.
pub struct TurnOutcome {
    pub session_id: SessionId,
    /// The finalized assistant message.
    pub message: Message,
    /// Terminal error of the stream, including `Aborted` when the user stopped it.
    pub error: Option<ChatError>,
    /// Background topic/memory summarization started after the turn.
    pub summary: JoinHandle<SummaryOutcome>,
}

/// Ties the store, the completion client, the controller registry, and memory together.
#[derive(Clone)]
pub struct ChatService {
    store: ChatStore,
    client: ChatClient,
    controllers: ControllerRegistry,
    memory: MemoryManager,
    search: Option<SearchClient>,
    search_template: String,
}

impl ChatService {
    pub fn new(store: ChatStore, client: ChatClient) -> Self {
        let controllers = ControllerRegistry::new();
        let memory = MemoryManager::new(client.clone(), controllers.clone());
        Self {
            store,
            client,
            controllers,
            memory,
            search: None,
            search_template: search::DEFAULT_SEARCH_TEMPLATE.to_string(),
        }
    }

    /// Client, credentials, and search proxy from the config.
    pub fn from_config(config: &Config, store: ChatStore) -> Self {
        let client = ChatClient::new(
            config::resolve_base_url(config),
            config::resolve_bearer(config),
        );
        let mut service = Self::new(store, client);
        if let Some(base) = config.search.base_url.as_deref().filter(|b| !b.trim().is_empty()) {
            service = service.with_search(SearchClient::new(base), config.search.template.clone());
        }
        service
    }

    pub fn with_search(mut self, client: SearchClient, template: impl Into<String>) -> Self {
        self.search = Some(client);
        self.search_template = template.into();
        self
    }

    pub fn store(&self) -> &ChatStore {
        &self.store
    }

    pub fn controllers(&self) -> &ControllerRegistry {
        &self.controllers
    }

    /// Send `content` in the active session. `on_update` receives the accumulated reply text.
    pub async fn on_user_input(
        &self,
        content: &str,
        on_update: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<TurnOutcome> {
        let session = self.store.current_session().await;
        let session_id = session.id.clone();
        let config = session.model_config.clone();
        let context = memory::select_context(&session);

        let mut user = Message::user(content);
        if config.web_search {
            user.augmented_content = self.augment(content).await;
        }
        let mut bot = Message::assistant("");
        bot.streaming = true;
        bot.model = Some(config.model.clone());

        let user_for_request = user.clone();
        let (user_id, bot_id) = self
            .store
            .update_session(&session_id, |s| (s.push_message(user), s.push_message(bot)))
            .await
            .context("active session disappeared")?;

        let mut request = context;
        request.push(user_for_request);

        let key = ControllerKey::new(session_id.clone(), bot_id);
        let mut stream = self.client.send_streaming(&request, &config);
        let registration = self.controllers.register(key.clone(), stream.cancel_token()).await;

        let mut error = None;
        let mut last_text = String::new();
        while let Some(ev) = stream.next().await {
            if let StreamEvent::Message { text, .. } = &ev {
                last_text.clone_from(text);
            }
            match ev {
                StreamEvent::Message { text, done: false } => {
                    self.store
                        .update_session(&session_id, |s| {
                            if let Some(m) = s.message_mut(bot_id).filter(|m| m.streaming) {
                                m.content.clone_from(&text);
                            }
                        })
                        .await;
                    on_update(&text);
                }
                StreamEvent::Message { text, done: true } => {
                    self.store
                        .update_session(&session_id, |s| {
                            let finalized = match s.message_mut(bot_id).filter(|m| m.streaming) {
                                Some(m) => {
                                    m.content.clone_from(&text);
                                    m.streaming = false;
                                    m.date = chrono::Utc::now();
                                    true
                                }
                                None => false,
                            };
                            if finalized {
                                s.stat.char_count += text.chars().count();
                            }
                            s.last_update = chrono::Utc::now();
                        })
                        .await;
                    on_update(&text);
                }
                StreamEvent::Error(e) => {
                    self.finish_with_error(&session_id, user_id, bot_id, &e).await;
                    error = Some(e);
                }
            }
        }
        self.controllers.remove(&key, registration).await;

        if let Err(e) = self.store.save().await {
            log::warn!("chat: saving session {}: {}", session_id, e);
        }
        let stored = self
            .store
            .session(&session_id)
            .await
            .and_then(|s| s.message(bot_id).cloned());
        let message = match stored {
            Some(m) => m,
            None => {
                // Session deleted or reset mid-reply; the request was stopped with it.
                log::debug!("chat: reply {} left session {} while streaming", bot_id, session_id);
                error.get_or_insert(ChatError::Aborted);
                let mut m = Message::assistant(last_text);
                m.id = bot_id;
                m.model = Some(config.model.clone());
                m
            }
        };

        let memory = self.memory.clone();
        let store = self.store.clone();
        let id = session_id.clone();
        let summary = tokio::spawn(async move { memory.maybe_summarize(&store, &id).await });

        Ok(TurnOutcome {
            session_id,
            message,
            error,
            summary,
        })
    }

    async fn augment(&self, query: &str) -> Option<String> {
        let client = self.search.as_ref()?;
        match client.search(query).await {
            Ok(results) => Some(search::augment_prompt(&self.search_template, query, &results)),
            Err(e) => {
                log::warn!("chat: web search failed, sending plain prompt: {}", e);
                None
            }
        }
    }

    /// Finalize the reply after a terminal error. An abort keeps the partial text as-is;
    /// anything else appends the error and flags both messages of the turn.
    async fn finish_with_error(&self, session_id: &str, user_id: MessageId, bot_id: MessageId, err: &ChatError) {
        let aborted = err.is_aborted();
        if aborted {
            log::debug!("chat: reply {} in session {} stopped", bot_id, session_id);
        } else {
            log::warn!("chat: reply {} in session {} failed: {}", bot_id, session_id, err);
        }
        let notice = error_notice(err);
        self.store
            .update_session(session_id, |s| {
                if let Some(m) = s.message_mut(bot_id).filter(|m| m.streaming) {
                    m.streaming = false;
                    m.date = chrono::Utc::now();
                    if !aborted {
                        if !m.content.is_empty() {
                            m.content.push_str("\n\n");
                        }
                        m.content.push_str(&notice);
                        m.is_error = true;
                    }
                }
                if !aborted {
                    if let Some(u) = s.message_mut(user_id) {
                        u.is_error = true;
                    }
                }
                s.last_update = chrono::Utc::now();
            })
            .await;
    }

    /// Stop one in-flight reply.
    pub async fn stop(&self, session_id: &str, message_id: MessageId) -> bool {
        self.controllers
            .stop(&ControllerKey::new(session_id, message_id))
            .await
    }

    /// Stop every in-flight request, including background summaries.
    pub async fn stop_all(&self) -> usize {
        self.controllers.stop_all().await
    }

    /// Stop every in-flight request, then clear the active session's messages and memory.
    pub async fn reset_session(&self) -> Result<()> {
        self.controllers.stop_all().await;
        self.store.reset_session().await
    }

    /// Stop the session's requests and delete it (undoable for a few seconds).
    pub async fn delete_session(&self, index: usize) -> Result<bool> {
        if let Some(s) = self.store.sessions().await.get(index) {
            for key in self.controllers.pending_for_session(&s.id).await {
                self.controllers.stop(&key).await;
            }
        }
        self.store.delete_session(index).await
    }

    /// Stop everything and wipe persisted state.
    pub async fn clear_all_data(&self) -> Result<()> {
        self.controllers.stop_all().await;
        self.store.clear_all_data().await
    }

    /// Generate an image for `prompt` in the active session; the result is appended as an
    /// assistant message whose media holds the image URLs (or data URLs).
    pub async fn generate_image(&self, prompt: &str) -> Result<Vec<ImageData>, ChatError> {
        let session = self.store.current_session().await;
        let request = ImageRequest::new(prompt, session.model_config.image_size.clone());
        let images = self.client.generate_image(&request).await?;
        let media: Vec<String> = images
            .iter()
            .filter_map(|img| {
                img.url
                    .clone()
                    .or_else(|| img.b64_json.as_ref().map(|b| format!("data:image/png;base64,{}", b)))
            })
            .collect();
        let model = session.model_config.model.clone();
        self.store
            .update_session(&session.id, |s| {
                s.push_message(Message::user(prompt));
                let mut reply = Message::assistant("");
                reply.media = media;
                reply.model = Some(model);
                s.push_message(reply);
            })
            .await;
        if let Err(e) = self.store.save().await {
            log::warn!("chat: saving session {}: {}", session.id, e);
        }
        Ok(images)
    }
}

fn error_notice(err: &ChatError) -> String {
    match err {
        ChatError::Unauthorized => UNAUTHORIZED_NOTICE.to_string(),
        other => format!("```\n{}\n```", other),
    }
}
