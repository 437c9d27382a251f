//! Model endpoint abstraction.
//!
//! The pipeline talks to two Gemini-format endpoints (text and vision)
//! through the [`ChatClient`] trait, and to the provider's file store
//! through [`FileStore`]. [`CachedChatClient`] layers deterministic replay
//! on top of any client.

mod cache;
mod client;
mod types;

pub(crate) use client::build_http_client;

pub use cache::{CacheKey, CacheStats, CachedChatClient, ResponseCache};
pub use client::{
    ChatClient, ClientConfig, FileStore, GeminiClient, GeminiFileStore, StoredFile,
};
pub use types::{
    Candidate, Content, FileData, GenerateRequest, GenerateResponse, GenerationConfig,
    InlineData, Part,
};
