//! OpenAI-compatible completion client.
//!
//! Streaming chat (SSE decoded into accumulated text), non-streaming chat for one-shot
//! calls such as summaries, and image generation.

mod client;
pub mod decoder;
mod error;
mod stream;

pub use client::{
    ChatClient, ChatResponse, ImageData, ImageRequest, ImageResponseFormat, IDLE_TIMEOUT,
    REQUEST_TIMEOUT,
};
pub use decoder::{DecodeError, DecodedEvent, SseDecoder};
pub use error::ChatError;
pub use stream::{ChatStream, StreamCallbacks, StreamEvent};
