//! aoai-relay - OpenAI-compatible front end for Azure OpenAI deployments
//!
//! Accepts `/v1/chat/completions`, `/v1/completions` and `/v1/models` requests,
//! rewrites them for the configured Azure resource, and relays the answers.
//! Streamed answers are re-emitted as whole SSE frames with adaptive pacing.

pub mod config;
pub mod error;
pub mod proxy;

pub use error::RelayError;
