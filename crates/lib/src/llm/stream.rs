//! Cancellable stream of chat events.
//!
//! The request task is the only producer. It sends any number of non-final
//! `Message` events followed by exactly one terminal event: `Message { done: true }`
//! or `Error`. [`ChatStream`] stops yielding after the terminal event, and reports
//! `Aborted` if the producer goes away without sending one.

use super::decoder::DecodedEvent;
use super::error::ChatError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub(crate) const STREAM_CHANNEL_CAPACITY: usize = 256;

/// One event of a streamed reply.
#[derive(Debug)]
pub enum StreamEvent {
    /// Accumulated reply text; `done` marks the final event.
    Message { text: String, done: bool },
    Error(ChatError),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        match self {
            StreamEvent::Message { done, .. } => *done,
            StreamEvent::Error(_) => true,
        }
    }
}

/// Callback form of stream consumption. Exactly one of `on_message(.., true)` or
/// `on_error` is called, once, at the end.
pub trait StreamCallbacks {
    fn on_message(&mut self, text: &str, done: bool);
    fn on_error(&mut self, err: &ChatError);
}

/// Receiving side of a streamed chat request.
pub struct ChatStream {
    rx: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
    terminated: bool,
}

impl ChatStream {
    pub(crate) fn new(rx: mpsc::Receiver<StreamEvent>, cancel: CancellationToken) -> Self {
        Self {
            rx,
            cancel,
            terminated: false,
        }
    }

    /// Handle that aborts the request. Valid for the whole request lifetime.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Next event, or None after the terminal event.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.terminated {
            return None;
        }
        match self.rx.recv().await {
            Some(ev) => {
                if ev.is_terminal() {
                    self.terminated = true;
                    self.rx.close();
                }
                Some(ev)
            }
            None => {
                self.terminated = true;
                log::warn!("stream: producer ended without a terminal event");
                Some(StreamEvent::Error(ChatError::Aborted))
            }
        }
    }

    /// Consume the stream through callbacks. Returns the final text, or the terminal error.
    pub async fn drive<C: StreamCallbacks + ?Sized>(
        mut self,
        callbacks: &mut C,
    ) -> Result<String, ChatError> {
        while let Some(ev) = self.next().await {
            match ev {
                StreamEvent::Message { text, done } => {
                    callbacks.on_message(&text, done);
                    if done {
                        return Ok(text);
                    }
                }
                StreamEvent::Error(e) => {
                    callbacks.on_error(&e);
                    return Err(e);
                }
            }
        }
        Err(ChatError::Aborted)
    }
}

impl Drop for ChatStream {
    fn drop(&mut self) {
        if !self.terminated {
            self.cancel.cancel();
        }
    }
}

/// Producing side, owned by the request task. Calls after the terminal event are ignored.
pub(crate) struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
    terminated: bool,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            tx,
            terminated: false,
        }
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub(crate) async fn emit(&mut self, ev: DecodedEvent) {
        self.send(StreamEvent::Message {
            text: ev.text,
            done: ev.done,
        })
        .await;
    }

    pub(crate) async fn fail(&mut self, err: ChatError) {
        self.send(StreamEvent::Error(err)).await;
    }

    async fn send(&mut self, ev: StreamEvent) {
        if self.terminated {
            return;
        }
        self.terminated = ev.is_terminal();
        // A dropped receiver means nobody is listening; the request still winds down.
        let _ = self.tx.send(ev).await;
    }
}
