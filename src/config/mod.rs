//! Configuration loading: TOML file, defaults, then environment overrides.

pub mod schema;

pub use schema::{
    Config, GatewayConfig, LlmConfig, ProxyConfig, ReadinessConfig, SandboxConfig,
};

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

const CONFIG_DIR: &str = ".sandpreview";
const CONFIG_FILE: &str = "config.toml";
const REDACTED: &str = "***";

/// `~/.sandpreview/config.toml`, if a home directory can be determined.
pub fn default_config_path() -> Option<PathBuf> {
    directories::UserDirs::new().map(|dirs| dirs.home_dir().join(CONFIG_DIR).join(CONFIG_FILE))
}

impl Config {
    /// Load configuration from `path` (or the default location), then apply
    /// process environment overrides.
    ///
    /// An explicit path that does not exist is an error; a missing default
    /// file just yields defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(raw) => {
                let expanded = PathBuf::from(shellexpand::tilde(raw).into_owned());
                Self::from_file(&expanded)?
            }
            None => match default_config_path() {
                Some(default) if default.exists() => Self::from_file(&default)?,
                _ => Self::default(),
            },
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply overrides from an environment lookup. Empty values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = get("OPENAI_API_KEY") {
            self.llm.api_key = key;
        }
        if let Some(url) = get("OPENAI_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Some(key) = get("E2B_API_KEY") {
            self.sandbox.api_key = key;
        }
        if let Some(port) = get("SANDPREVIEW_PORT") {
            match port.parse() {
                Ok(port) => self.gateway.port = port,
                Err(_) => tracing::warn!("Ignoring invalid SANDPREVIEW_PORT={port}"),
            }
        }
    }

    /// Copy of the config with secrets masked, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        for secret in [&mut copy.llm.api_key, &mut copy.sandbox.api_key] {
            if !secret.is_empty() {
                *secret = REDACTED.to_string();
            }
        }
        copy
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// JSON Schema of the config file format.
    pub fn json_schema() -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(Config)).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn defaults_match_observed_sandbox_settings() {
        let config = Config::default();
        assert_eq!(config.sandbox.timeout_ms, 300_000);
        assert_eq!(config.sandbox.preview_port, 5000);
        assert_eq!(config.sandbox.source_path, "app.py");
        assert!(config.sandbox.start_command.contains("--server.port=5000"));
        assert!(config.proxy.allowed_hosts.is_empty());
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config = Config::from_toml(
            r#"
            [gateway]
            port = 8080

            [sandbox]
            template = "custom-template"
            "#,
        )
        .unwrap();

        assert_eq!(config.gateway.port, 8080);
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.sandbox.template, "custom-template");
        assert_eq!(config.sandbox.preview_port, 5000);
        assert_eq!(config.llm.model, "gpt-4o");
        assert_eq!(config.gateway.session_idle_secs, 3600);
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "log_level = \"debug\"\n[readiness]\nmax_attempts = 3").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.readiness.max_attempts, 3);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(Config::load(missing.to_str()).is_err());
    }

    #[test]
    fn env_overrides_apply_and_ignore_blanks() {
        let env: HashMap<&str, &str> = [
            ("OPENAI_API_KEY", "sk-test"),
            ("E2B_API_KEY", "   "),
            ("SANDPREVIEW_PORT", "4100"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.sandbox.api_key = "from-file".to_string();
        config.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.llm.api_key, "sk-test");
        assert_eq!(config.sandbox.api_key, "from-file");
        assert_eq!(config.gateway.port, 4100);
    }

    #[test]
    fn invalid_port_override_is_ignored() {
        let mut config = Config::default();
        config.apply_env_overrides(|k| (k == "SANDPREVIEW_PORT").then(|| "abc".to_string()));
        assert_eq!(config.gateway.port, 3000);
    }

    #[test]
    fn redacted_masks_secrets_only_when_set() {
        let mut config = Config::default();
        config.llm.api_key = "sk-secret".to_string();

        let shown = config.redacted();
        assert_eq!(shown.llm.api_key, "***");
        assert_eq!(shown.sandbox.api_key, "");
        assert!(!shown.to_toml().unwrap().contains("sk-secret"));
    }

    #[test]
    fn schema_describes_sections() {
        let schema = Config::json_schema().to_string();
        assert!(schema.contains("gateway"));
        assert!(schema.contains("readiness"));
    }
}
