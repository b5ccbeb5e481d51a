//! Model access: the provider boundary, the bundled HTTP client and the
//! model catalogue with per-token pricing.

pub mod catalog;
pub mod client;

pub use catalog::{ModelCatalog, TokenPrice};
pub use client::{
    HttpModelClient, HttpModelConfig, ModelClient, ModelError, ModelRequest, ModelResponse,
    TokenUsage,
};
