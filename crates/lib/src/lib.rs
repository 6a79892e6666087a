//! Parley core library: sessions, streaming chat against OpenAI-compatible APIs,
//! conversation memory, and persistence. Used by the CLI.

pub mod chat;
pub mod config;
pub mod controller;
pub mod llm;
pub mod memory;
pub mod persist;
pub mod search;
pub mod session;
pub mod store;
