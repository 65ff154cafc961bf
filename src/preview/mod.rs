//! Sandbox acquire-or-create: deploy a single source file to a live preview.
//!
//! A caller passes the sandbox id it last received (if any) together with the
//! new source. When that sandbox is still running it is reused and only the
//! file is rewritten; otherwise a new sandbox is provisioned, the file is
//! written and the preview server is launched in the background.

pub mod readiness;

pub use readiness::{Readiness, ReadinessProbe};

use crate::config::Config;
use crate::sandbox::SandboxProvider;
use anyhow::Context;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A deployed preview: which sandbox serves it and where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxHandle {
    pub sandbox_id: String,
    pub url: String,
    /// Set for newly created sandboxes only; the remaining lifetime of a
    /// reused sandbox is not known locally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Everything needed to provision and populate a sandbox.
#[derive(Debug, Clone)]
pub struct PreviewSettings {
    pub template: String,
    pub timeout_ms: u64,
    pub port: u16,
    /// Absolute path of the source file inside the sandbox.
    pub source_path: String,
    pub workdir: String,
    pub start_command: String,
    pub envs: HashMap<String, String>,
}

impl PreviewSettings {
    pub fn from_config(config: &Config) -> Self {
        let sandbox = &config.sandbox;

        let source_path = if sandbox.source_path.starts_with('/') {
            sandbox.source_path.clone()
        } else {
            format!(
                "{}/{}",
                sandbox.workdir.trim_end_matches('/'),
                sandbox.source_path
            )
        };

        let mut envs = HashMap::new();
        if sandbox.inject_llm_key && !config.llm.api_key.is_empty() {
            envs.insert("OPENAI_API_KEY".to_string(), config.llm.api_key.clone());
        }

        Self {
            template: sandbox.template.clone(),
            timeout_ms: sandbox.timeout_ms,
            port: sandbox.preview_port,
            source_path,
            workdir: sandbox.workdir.clone(),
            start_command: sandbox.start_command.clone(),
            envs,
        }
    }
}

pub struct PreviewService {
    provider: Arc<dyn SandboxProvider>,
    settings: PreviewSettings,
    /// Single-flight guards keyed by sandbox id.
    guards: DashMap<String, Arc<Mutex<()>>>,
}

impl PreviewService {
    pub fn new(provider: Arc<dyn SandboxProvider>, settings: PreviewSettings) -> Self {
        Self {
            provider,
            settings,
            guards: DashMap::new(),
        }
    }

    /// Deploy `code`, reusing `sandbox_id` when it names a running sandbox.
    ///
    /// Calls naming the same sandbox are serialized. Calls without an id are
    /// not; callers that need one sandbox per conversation serialize their
    /// own deploys.
    pub async fn ensure_sandbox(
        &self,
        sandbox_id: Option<&str>,
        code: &str,
    ) -> anyhow::Result<SandboxHandle> {
        let requested = sandbox_id.map(str::trim).filter(|id| !id.is_empty());

        let Some(id) = requested else {
            return self.acquire_or_create(None, code).await;
        };

        let guard = self
            .guards
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let held = guard.lock().await;
        let result = self.acquire_or_create(Some(id), code).await;
        drop(held);
        drop(guard);
        self.guards
            .remove_if(id, |_, guard| Arc::strong_count(guard) == 1);

        result
    }

    async fn acquire_or_create(
        &self,
        requested: Option<&str>,
        code: &str,
    ) -> anyhow::Result<SandboxHandle> {
        let running = self
            .provider
            .list_sandboxes()
            .await
            .context("Failed to list running sandboxes")?;

        let live = requested.and_then(|id| running.iter().find(|s| s.sandbox_id == id));

        match live {
            Some(info) => {
                let template = info.template_id.as_deref();
                if template.is_some_and(|t| t != self.settings.template) {
                    tracing::warn!(
                        sandbox_id = %info.sandbox_id,
                        template = ?template,
                        expected = %self.settings.template,
                        "Reusing a sandbox built from a different template"
                    );
                }
                self.reuse(&info.sandbox_id, code).await
            }
            None => {
                if let Some(stale) = requested {
                    tracing::info!(sandbox_id = stale, "Sandbox no longer running, creating a new one");
                }
                self.create(code).await
            }
        }
    }

    async fn reuse(&self, sandbox_id: &str, code: &str) -> anyhow::Result<SandboxHandle> {
        tracing::info!(sandbox_id, "Using existing sandbox");

        self.provider
            .connect(sandbox_id)
            .await
            .with_context(|| format!("Failed to connect to sandbox {sandbox_id}"))?;
        self.provider
            .write_file(sandbox_id, &self.settings.source_path, code)
            .await
            .context("Failed to write source file")?;

        Ok(SandboxHandle {
            sandbox_id: sandbox_id.to_string(),
            url: self.provider.preview_url(sandbox_id, self.settings.port),
            expires_at: None,
        })
    }

    async fn create(&self, code: &str) -> anyhow::Result<SandboxHandle> {
        tracing::info!(template = %self.settings.template, "Creating new sandbox");

        let created_at = Utc::now();
        let sandbox_id = self
            .provider
            .create_sandbox(
                &self.settings.template,
                self.settings.timeout_ms,
                &self.settings.envs,
            )
            .await
            .context("Failed to create sandbox")?;

        self.provider
            .write_file(&sandbox_id, &self.settings.source_path, code)
            .await
            .context("Failed to write source file")?;

        let launch = self
            .provider
            .run_command(
                &sandbox_id,
                &self.settings.start_command,
                &self.settings.workdir,
                true,
            )
            .await
            .context("Failed to start preview server")?;

        // Launch output is informational only; startup failures show up as
        // a preview that never becomes ready.
        tracing::info!(sandbox_id = %sandbox_id, pid = ?launch.pid, "Preview server launched");
        if !launch.stdout.is_empty() {
            tracing::debug!(sandbox_id = %sandbox_id, "preview stdout: {}", launch.stdout);
        }
        if !launch.stderr.is_empty() {
            tracing::debug!(sandbox_id = %sandbox_id, "preview stderr: {}", launch.stderr);
        }

        let lifetime = chrono::Duration::milliseconds(self.settings.timeout_ms as i64);
        Ok(SandboxHandle {
            url: self.provider.preview_url(&sandbox_id, self.settings.port),
            expires_at: Some(created_at + lifetime),
            sandbox_id,
        })
    }
}
