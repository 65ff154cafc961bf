//! sandpreview: chat with an AI assistant and preview the app it writes in an
//! ephemeral E2B sandbox.
//!
//! The pieces, leaves first:
//! - [`extract`] pulls the first fenced code block out of a reply
//! - [`sandbox`] talks to the sandbox provider
//! - [`preview`] reuses or creates a sandbox for new code and probes readiness
//! - [`llm`] streams chat completions
//! - [`conversation`] holds conversation state and drives each turn
//! - [`gateway`] exposes it all over HTTP

pub mod config;
pub mod conversation;
pub mod extract;
pub mod gateway;
pub mod llm;
pub mod preview;
pub mod repl;
pub mod sandbox;

pub use config::Config;
