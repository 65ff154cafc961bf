//! E2B sandbox provider - HTTP client for the E2B REST API.
//!
//! Lifecycle calls go to the control plane at `api_base`. Preview hosts are
//! computed locally as `{port}-{sandbox_id}.{domain}`, which is how E2B routes
//! traffic to an exposed port.

use super::{CommandOutput, SandboxInfo, SandboxProvider};
use crate::config::SandboxConfig;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Base URL for the E2B REST API.
pub const E2B_API_BASE: &str = "https://api.e2b.dev";

/// Domain serving sandbox ports.
pub const E2B_DOMAIN: &str = "e2b.app";

/// Shared HTTP client for E2B API calls.
pub struct E2bSandboxClient {
    api_key: String,
    api_base: String,
    domain: String,
    http: reqwest::Client,
}

impl E2bSandboxClient {
    pub fn from_config(config: &SandboxConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build E2B HTTP client: {e}"))?;

        Ok(Self {
            api_key: config.api_key.clone(),
            api_base: String::new(),
            domain: config.domain.clone(),
            http,
        }
        .with_api_base(&config.api_base))
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    fn api_key(&self) -> anyhow::Result<&str> {
        anyhow::ensure!(!self.api_key.is_empty(), "E2B_API_KEY is not set");
        Ok(&self.api_key)
    }

    fn sandbox_url(&self, sandbox_id: &str, suffix: &str) -> String {
        format!(
            "{}/v0/sandboxes/{}{suffix}",
            self.api_base,
            urlencoding::encode(sandbox_id)
        )
    }

    /// Send a request and return the body of a successful response.
    async fn send(&self, request: reqwest::RequestBuilder, op: &str) -> anyhow::Result<String> {
        let resp = request
            .header("Authorization", format!("Bearer {}", self.api_key()?))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("E2B {op} request failed: {e}"))?;

        let status = resp.status();
        let body_text = resp
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable>".to_string());

        anyhow::ensure!(
            status.is_success(),
            "E2B API returned {status} for {op}: {body_text}"
        );

        Ok(body_text)
    }
}

fn parse_json(body_text: &str) -> anyhow::Result<serde_json::Value> {
    serde_json::from_str(body_text)
        .map_err(|e| anyhow::anyhow!("Failed to parse E2B response: {e}\nBody: {body_text}"))
}

/// E2B has used both `sandboxID` and `sandbox_id` in responses.
fn sandbox_id_of(value: &serde_json::Value) -> Option<&str> {
    value["sandboxID"]
        .as_str()
        .or_else(|| value["sandbox_id"].as_str())
        .filter(|id| !id.is_empty())
}

#[async_trait]
impl SandboxProvider for E2bSandboxClient {
    async fn list_sandboxes(&self) -> anyhow::Result<Vec<SandboxInfo>> {
        let url = format!("{}/v0/sandboxes", self.api_base);
        let body_text = self.send(self.http.get(&url), "list").await?;
        let parsed = parse_json(&body_text)?;

        let entries = parsed
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("E2B list returned a non-array body: {body_text}"))?;

        Ok(entries
            .iter()
            .filter_map(|entry| {
                let sandbox_id = sandbox_id_of(entry)?.to_string();
                let template_id = entry["templateID"].as_str().map(str::to_string);
                Some(SandboxInfo {
                    sandbox_id,
                    template_id,
                })
            })
            .collect())
    }

    async fn create_sandbox(
        &self,
        template: &str,
        timeout_ms: u64,
        envs: &HashMap<String, String>,
    ) -> anyhow::Result<String> {
        let url = format!("{}/v0/sandboxes", self.api_base);
        let body = serde_json::json!({
            "templateID": template,
            "timeout": timeout_ms / 1000,
            "envVars": envs,
        });

        let body_text = self.send(self.http.post(&url).json(&body), "create").await?;
        let parsed = parse_json(&body_text)?;

        let sandbox_id = sandbox_id_of(&parsed)
            .ok_or_else(|| anyhow::anyhow!("E2B returned no sandbox_id. Response: {body_text}"))?;

        tracing::info!(sandbox_id, template, "E2B sandbox created");
        Ok(sandbox_id.to_string())
    }

    async fn connect(&self, sandbox_id: &str) -> anyhow::Result<()> {
        let url = self.sandbox_url(sandbox_id, "");
        self.send(self.http.get(&url), "connect").await?;
        Ok(())
    }

    async fn write_file(&self, sandbox_id: &str, path: &str, content: &str) -> anyhow::Result<()> {
        let url = self.sandbox_url(sandbox_id, "/files");

        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();

        let form = reqwest::multipart::Form::new()
            .text("path", path.to_string())
            .part(
                "file",
                reqwest::multipart::Part::bytes(content.as_bytes().to_vec())
                    .file_name(file_name)
                    .mime_str("text/plain")
                    .map_err(|e| anyhow::anyhow!("MIME type error: {e}"))?,
            );

        self.send(self.http.post(&url).multipart(form), "write_file")
            .await?;
        Ok(())
    }

    async fn run_command(
        &self,
        sandbox_id: &str,
        command: &str,
        workdir: &str,
        background: bool,
    ) -> anyhow::Result<CommandOutput> {
        let url = self.sandbox_url(sandbox_id, "/commands");
        let body = serde_json::json!({
            "cmd": command,
            "workdir": workdir,
            "background": background,
        });

        let body_text = self
            .send(self.http.post(&url).json(&body), "run_command")
            .await?;

        // Background launches may answer with an empty body.
        if body_text.trim().is_empty() {
            return Ok(CommandOutput::default());
        }
        let parsed = parse_json(&body_text)?;

        Ok(CommandOutput {
            stdout: parsed["stdout"].as_str().unwrap_or("").to_string(),
            stderr: parsed["stderr"].as_str().unwrap_or("").to_string(),
            exit_code: parsed["exitCode"]
                .as_i64()
                .or_else(|| parsed["exit_code"].as_i64())
                .unwrap_or(0),
            pid: parsed["pid"].as_u64(),
        })
    }

    fn host(&self, sandbox_id: &str, port: u16) -> String {
        format!("{port}-{sandbox_id}.{}", self.domain)
    }
}
