//! Engine configuration.
//!
//! The recognized options, their defaults, and the `WARDEN_*` environment
//! overrides. Configuration can also be loaded from a YAML file.

use crate::domain::WebhookFailMode;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_webhook_timeout_ms() -> u64 {
    2000
}

fn default_true() -> bool {
    true
}

/// Runtime configuration of the workflow engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Filesystem path of the checkpoint database.
    pub database_path: PathBuf,
    /// Path to the policy declaration. Absent means deny-all.
    #[serde(default)]
    pub policy_path: Option<PathBuf>,
    /// Webhook notified when a workflow pauses at an approval gate.
    /// Absent means pauses must be resumed out-of-band.
    #[serde(default)]
    pub approval_webhook_url: Option<String>,
    /// Per-request webhook timeout.
    #[serde(default = "default_webhook_timeout_ms")]
    pub webhook_timeout_ms: u64,
    /// What an approval gate does when webhook delivery fails.
    #[serde(default)]
    pub webhook_fail_mode: WebhookFailMode,
    /// Recover RUNNING and PAUSED workflows when the engine starts.
    #[serde(default = "default_true")]
    pub auto_resume_on_startup: bool,
    /// Directory the audit trail is written to.
    #[serde(default)]
    pub audit_dir: Option<PathBuf>,
}

impl EngineConfig {
    /// Defaults rooted at the warden home directory.
    pub fn new() -> Result<Self> {
        Ok(Self {
            database_path: crate::paths::default_database_path()?,
            policy_path: None,
            approval_webhook_url: None,
            webhook_timeout_ms: default_webhook_timeout_ms(),
            webhook_fail_mode: WebhookFailMode::default(),
            auto_resume_on_startup: true,
            audit_dir: None,
        })
    }

    /// Loads configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file as YAML: {}", path.display()))?;
        Ok(config)
    }

    /// Defaults overridden by `WARDEN_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::new()?;
        if let Ok(path) = std::env::var("WARDEN_DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("WARDEN_POLICY_PATH") {
            config.policy_path = Some(PathBuf::from(path));
        }
        if let Ok(url) = std::env::var("WARDEN_APPROVAL_WEBHOOK_URL") {
            config.approval_webhook_url = Some(url);
        }
        if let Ok(timeout) = std::env::var("WARDEN_WEBHOOK_TIMEOUT_MS") {
            config.webhook_timeout_ms = timeout
                .parse()
                .context("WARDEN_WEBHOOK_TIMEOUT_MS must be an integer")?;
        }
        if let Ok(mode) = std::env::var("WARDEN_WEBHOOK_FAIL_MODE") {
            config.webhook_fail_mode = match mode.as_str() {
                "ALLOW" => WebhookFailMode::Allow,
                "DENY" => WebhookFailMode::Deny,
                "PAUSE" => WebhookFailMode::Pause,
                other => anyhow::bail!("unknown WARDEN_WEBHOOK_FAIL_MODE: {}", other),
            };
        }
        if let Ok(flag) = std::env::var("WARDEN_AUTO_RESUME_ON_STARTUP") {
            config.auto_resume_on_startup = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        Ok(config)
    }
}
