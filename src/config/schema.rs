//! Configuration schema for sandpreview.
//!
//! Every section has serde defaults, so an empty or partial TOML file is valid.

use crate::sandbox::e2b::{E2B_API_BASE, E2B_DOMAIN};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an expert Python developer. \
When the user describes an app, reply with a complete single-file Streamlit app \
in one ```python fenced code block, followed by a short explanation. \
Do not split the app across multiple files or code blocks.";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Config {
    /// Log filter used when `RUST_LOG` is unset (e.g. `info`, `sandpreview=debug`).
    pub log_level: Option<String>,
    pub gateway: GatewayConfig,
    pub llm: LlmConfig,
    pub sandbox: SandboxConfig,
    pub readiness: ReadinessConfig,
    pub proxy: ProxyConfig,
}

/// HTTP gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Time allowed until a response starts. A streamed chat turn is bounded
    /// only until its event stream opens.
    pub request_timeout_secs: u64,
    pub max_body_bytes: usize,
    /// Conversations untouched for this long are dropped from memory.
    pub session_idle_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            request_timeout_secs: 300,
            max_body_bytes: 1024 * 1024,
            session_idle_secs: 60 * 60,
        }
    }
}

/// OpenAI-compatible chat completions provider.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    /// Overridden by `OPENAI_API_KEY`.
    pub api_key: String,
    pub model: String,
    /// Seed message for every conversation. Never shown in the UI.
    pub system_prompt: String,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-4o".to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            timeout_secs: 120,
        }
    }
}

/// E2B sandbox provisioning.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SandboxConfig {
    pub api_base: String,
    /// Overridden by `E2B_API_KEY`.
    pub api_key: String,
    /// Public domain used to build preview hosts (`{port}-{id}.{domain}`).
    pub domain: String,
    pub template: String,
    /// Lifetime of a newly created sandbox. There is no renewal.
    pub timeout_ms: u64,
    pub preview_port: u16,
    /// File the extracted code is written to, relative to `workdir`.
    pub source_path: String,
    pub workdir: String,
    /// Launched in the background after the source file is first written.
    pub start_command: String,
    /// Pass the LLM key into the sandbox as `OPENAI_API_KEY`.
    pub inject_llm_key: bool,
    pub request_timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            api_base: E2B_API_BASE.to_string(),
            api_key: String::new(),
            domain: E2B_DOMAIN.to_string(),
            template: "pgzzes7f1ztbdszadv6x".to_string(),
            timeout_ms: 5 * 60 * 1000,
            preview_port: 5000,
            source_path: "app.py".to_string(),
            workdir: "/home/user".to_string(),
            start_command: "streamlit run app.py --server.port=5000 \
                --server.enableCORS=false --server.enableXsrfProtection=false"
                .to_string(),
            inject_llm_key: true,
            request_timeout_secs: 120,
        }
    }
}

/// Backoff schedule for probing a freshly deployed preview.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ReadinessConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    pub request_timeout_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 4_000,
            max_attempts: 8,
            request_timeout_ms: 5_000,
        }
    }
}

/// Remote content proxy.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ProxyConfig {
    pub timeout_secs: u64,
    /// Hosts the proxy may fetch from. Empty allows any host.
    pub allowed_hosts: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            allowed_hosts: Vec::new(),
        }
    }
}
