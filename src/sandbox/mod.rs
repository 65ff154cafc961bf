//! Sandbox abstraction layer for sandpreview.
//!
//! Defines the [`SandboxProvider`] trait and the value types exchanged with a
//! hosted sandbox service. The only production provider is
//! [`e2b::E2bSandboxClient`] (requires `E2B_API_KEY`); tests plug in fakes.
//!
//! Providers are stateless with respect to sandbox ids: every call names the
//! sandbox it targets, so one provider can serve many conversations.

pub mod e2b;

use async_trait::async_trait;
use std::collections::HashMap;

/// Output from a command executed inside a sandbox.
///
/// Background commands return immediately; `stdout`/`stderr` are then
/// whatever the service reported at launch time and `pid` is set when known.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub pid: Option<u64>,
}

/// One entry of the provider's running-sandbox listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxInfo {
    pub sandbox_id: String,
    pub template_id: Option<String>,
}

/// Provider-agnostic sandbox interface.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// All sandboxes currently running under this account.
    async fn list_sandboxes(&self) -> anyhow::Result<Vec<SandboxInfo>>;

    /// Create a sandbox from `template` that lives for `timeout_ms`, with
    /// `envs` set in its environment. Returns the new sandbox ID.
    async fn create_sandbox(
        &self,
        template: &str,
        timeout_ms: u64,
        envs: &HashMap<String, String>,
    ) -> anyhow::Result<String>;

    /// Verify that `sandbox_id` is reachable before operating on it.
    async fn connect(&self, sandbox_id: &str) -> anyhow::Result<()>;

    /// Write content to a file path inside the sandbox, replacing it.
    async fn write_file(&self, sandbox_id: &str, path: &str, content: &str) -> anyhow::Result<()>;

    /// Run a shell command inside the sandbox. With `background`, return as
    /// soon as the process has been started.
    async fn run_command(
        &self,
        sandbox_id: &str,
        command: &str,
        workdir: &str,
        background: bool,
    ) -> anyhow::Result<CommandOutput>;

    /// Public host name that routes to `port` inside the sandbox.
    fn host(&self, sandbox_id: &str, port: u16) -> String;

    /// HTTPS address of `port` inside the sandbox.
    fn preview_url(&self, sandbox_id: &str, port: u16) -> String {
        format!("https://{}", self.host(sandbox_id, port))
    }
}
