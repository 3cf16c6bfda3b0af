//! System configuration: `~/.moonbot/config.json` with camelCase keys,
//! atomic writes with rolling backups, and environment overrides
//! (env > config > built-in defaults).

use crate::utils::{atomic_write, ensure_dir, moonbot_home};
use anyhow::{Context, Result};
use fs2::FileExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use subtle::ConstantTimeEq;
use tracing::warn;

pub const DEFAULT_GATEWAY_HOST: &str = "127.0.0.1";
pub const DEFAULT_GATEWAY_PORT: u16 = 18789;
const MAX_CONFIG_BACKUPS: usize = 10;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Salted SHA-256 of the gateway token; the plaintext is never stored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_salt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_hash: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_GATEWAY_HOST.to_string(),
            port: DEFAULT_GATEWAY_PORT,
            token_salt: None,
            token_hash: None,
        }
    }
}

pub fn hash_token(salt: &str, token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

impl GatewayConfig {
    pub fn set_token(&mut self, token: &str) {
        let salt = uuid::Uuid::new_v4().simple().to_string();
        self.token_hash = Some(hash_token(&salt, token));
        self.token_salt = Some(salt);
    }

    pub fn has_token(&self) -> bool {
        self.token_hash.is_some()
    }

    /// Constant-time comparison against the stored hash.
    pub fn verify_token(&self, presented: &str) -> bool {
        let (Some(salt), Some(hash)) = (&self.token_salt, &self.token_hash) else {
            return false;
        };
        let computed = hash_token(salt, presented);
        computed.as_bytes().ct_eq(hash.as_bytes()).into()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueConfig {
    pub bound: usize,
    pub workers: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            bound: crate::queue::DEFAULT_QUEUE_BOUND,
            workers: crate::queue::DEFAULT_WORKER_POOL,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolsConfig {
    pub max_bytes: usize,
    pub timeout_secs: u64,
    pub concurrency: usize,
    pub approval_timeout_secs: u64,
    pub allowed_commands: Vec<String>,
    /// Workspace root for tool execution. Defaults to `~/.moonbot/workspace`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            max_bytes: crate::safety::DEFAULT_MAX_BYTES,
            timeout_secs: 30,
            concurrency: crate::tools::runtime::DEFAULT_CONCURRENCY,
            approval_timeout_secs: 300,
            allowed_commands: [
                "git", "ls", "cat", "grep", "echo", "find", "head", "tail", "wc",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            workspace: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionsConfig {
    /// Session log directory. Defaults to `~/.moonbot/sessions`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub compact_keep: usize,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            path: None,
            compact_keep: crate::session::DEFAULT_COMPACT_KEEP,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub queue: QueueConfig,
    pub tools: ToolsConfig,
    pub sessions: SessionsConfig,
    pub channels: HashMap<String, ChannelConfig>,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.queue.bound == 0 {
            anyhow::bail!("queue.bound must be at least 1");
        }
        if self.queue.workers == 0 {
            anyhow::bail!("queue.workers must be at least 1");
        }
        if self.tools.concurrency == 0 {
            anyhow::bail!("tools.concurrency must be at least 1");
        }
        if self.tools.max_bytes == 0 {
            anyhow::bail!("tools.maxBytes must be at least 1");
        }
        Ok(())
    }

    pub fn workspace_path(&self) -> Result<PathBuf> {
        match &self.tools.workspace {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(moonbot_home()?.join("workspace")),
        }
    }

    pub fn sessions_path(&self) -> Result<PathBuf> {
        match &self.sessions.path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(moonbot_home()?.join("sessions")),
        }
    }
}

pub fn config_path() -> Result<PathBuf> {
    Ok(moonbot_home()?.join("config.json"))
}

/// Apply `MOONBOT_*` environment overrides. Environment wins over the file.
fn apply_env_overrides(config: &mut Config) {
    if let Ok(host) = std::env::var("MOONBOT_GATEWAY_HOST")
        && !host.is_empty()
    {
        config.gateway.host = host;
    }
    if let Ok(port) = std::env::var("MOONBOT_GATEWAY_PORT") {
        match port.parse() {
            Ok(port) => config.gateway.port = port,
            Err(_) => warn!("ignoring invalid MOONBOT_GATEWAY_PORT={}", port),
        }
    }
    if let Ok(token) = std::env::var("MOONBOT_GATEWAY_TOKEN")
        && !token.is_empty()
    {
        config.gateway.set_token(&token);
    }
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let default_path = config_path().unwrap_or_else(|_| PathBuf::from("config.json"));
    let path = path.unwrap_or(default_path.as_path());

    let mut config = if path.exists() {
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open config at {}", path.display()))?;
        file.lock_shared()
            .with_context(|| "failed to acquire shared lock on config file")?;
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config JSON from {}", path.display()))?
    } else {
        Config::default()
    };

    apply_env_overrides(&mut config);
    config
        .validate()
        .with_context(|| "configuration validation failed")?;
    Ok(config)
}

fn rotate_backups(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let home = path.parent().context("config path has no parent")?;
    let backups_dir = ensure_dir(home.join("backups"))?;
    let stamp = chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S%.3fZ");
    let backup = backups_dir.join(format!("config-{}.json", stamp));
    std::fs::copy(path, &backup)
        .with_context(|| format!("failed to back up config to {}", backup.display()))?;

    let mut backups: Vec<PathBuf> = std::fs::read_dir(&backups_dir)?
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("config-") && n.ends_with(".json"))
        })
        .collect();
    if backups.len() > MAX_CONFIG_BACKUPS {
        backups.sort();
        for old in &backups[..backups.len() - MAX_CONFIG_BACKUPS] {
            let _ = std::fs::remove_file(old);
        }
    }
    Ok(())
}

pub fn save_config(config: &Config, path: Option<&Path>) -> Result<()> {
    let default_path = config_path().unwrap_or_else(|_| PathBuf::from("config.json"));
    let path = path.unwrap_or(default_path.as_path());
    ensure_dir(path.parent().context("config path has no parent")?)?;

    // Separate lockfile: atomic_write renames over the config inode, which
    // would invalidate a lock held on the config file itself.
    let lock_path = path.with_extension("json.lock");
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&lock_path)
        .with_context(|| format!("failed to create lock file at {}", lock_path.display()))?;
    lock_file
        .lock_exclusive()
        .with_context(|| "failed to acquire exclusive lock on config lock file")?;

    rotate_backups(path)?;
    let content = serde_json::to_string_pretty(config)?;
    atomic_write(path, &content)
        .with_context(|| format!("failed to write config to {}", path.display()))?;
    Ok(())
}

// --- Exec approvals ledger -------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecAllowlist {
    pub commands: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecDenylist {
    pub patterns: Vec<String>,
}

/// Pre-approved command ledger (`~/.moonbot/exec-approvals.json`). Consulted
/// by the tool runtime before raising an approval request: an exec invocation
/// that matches the allowlist and no denylist pattern runs without a human
/// gate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecApprovals {
    pub allowlist: ExecAllowlist,
    pub denylist: ExecDenylist,
}

impl ExecApprovals {
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("ignoring malformed {}: {}", path.display(), e);
                Self::default()
            }),
            Err(e) => {
                warn!("failed to read {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn is_pre_approved(&self, tool_id: &str, input: &Value) -> bool {
        if tool_id != "system.run" {
            return false;
        }
        let Some(argv) = input["argv"].as_array() else {
            return false;
        };
        let Some(program) = argv.first().and_then(|v| v.as_str()) else {
            return false;
        };
        let name = program.rsplit('/').next().unwrap_or(program);
        if !self.allowlist.commands.iter().any(|c| c == name) {
            return false;
        }
        if let Some(prefix) = &self.allowlist.cwd_prefix {
            let cwd = input["cwd"].as_str().unwrap_or("");
            if !cwd.starts_with(prefix.as_str()) {
                return false;
            }
        }
        let joined: Vec<&str> = argv.iter().filter_map(|v| v.as_str()).collect();
        let joined = joined.join(" ");
        for pattern in &self.denylist.patterns {
            match Regex::new(pattern) {
                Ok(re) if re.is_match(&joined) => return false,
                Ok(_) => {}
                Err(e) => {
                    warn!("invalid denylist pattern '{}': {}", pattern, e);
                    return false;
                }
            }
        }
        true
    }
}
