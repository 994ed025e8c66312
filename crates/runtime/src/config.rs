//! Live settings
//!
//! The host owns the settings; the core only reads them. `SharedSettings`
//! lets the host swap a new `Settings` in without blocking readers, and the
//! core re-polls `current()` on every readiness check.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use vaultpilot_protocol::{McpServerConfig, PermissionMode};

pub const DEFAULT_MODEL: &str = "sonnet";

/// One configured MCP server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServerEntry {
    #[serde(flatten)]
    pub config: McpServerConfig,
    /// Enabled servers are always active; disabled ones only when a request names them.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub model: String,
    pub max_thinking_tokens: Option<u64>,
    pub permission_mode: PermissionMode,
    pub system_prompt: String,
    pub disallowed_tools: Vec<String>,
    /// Substrings that make a shell command be refused outright.
    pub blocked_commands: Vec<String>,
    pub mcp_servers: BTreeMap<String, McpServerEntry>,
    pub plugins: Vec<PathBuf>,
    pub external_context_paths: Vec<PathBuf>,
    pub allowed_export_paths: Vec<PathBuf>,
    pub setting_sources: Vec<String>,
    pub cli_path: Option<PathBuf>,
    /// `KEY=VALUE` lines passed to the agent process.
    pub environment: String,
    pub vault_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_thinking_tokens: None,
            permission_mode: PermissionMode::Default,
            system_prompt: String::new(),
            disallowed_tools: Vec::new(),
            blocked_commands: Vec::new(),
            mcp_servers: BTreeMap::new(),
            plugins: Vec::new(),
            external_context_paths: Vec::new(),
            allowed_export_paths: Vec::new(),
            setting_sources: vec!["user".to_string(), "project".to_string()],
            cli_path: None,
            environment: String::new(),
            vault_path: None,
        }
    }
}

impl Settings {
    /// Parse the environment block, skipping blanks, comments and malformed lines.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.environment
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| {
                let line = line.strip_prefix("export ").unwrap_or(line);
                let (key, value) = line.split_once('=')?;
                let key = key.trim();
                if key.is_empty() {
                    return None;
                }
                let value = value.trim().trim_matches('"');
                Some((key.to_string(), value.to_string()))
            })
            .collect()
    }

    /// Servers active for a request: every enabled server plus any explicitly named one.
    pub fn active_mcp_servers(&self, requested: &[String]) -> BTreeMap<String, McpServerConfig> {
        self.mcp_servers
            .iter()
            .filter(|(name, entry)| entry.enabled || requested.iter().any(|r| r == *name))
            .map(|(name, entry)| (name.clone(), entry.config.clone()))
            .collect()
    }

    /// Read settings from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut settings = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            toml::from_str(&raw)?
        } else {
            Settings::default()
        };
        settings.apply_env_overrides();
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(model) = std::env::var("VAULTPILOT_MODEL") {
            if !model.is_empty() {
                self.model = model;
            }
        }
        if let Ok(path) = std::env::var("VAULTPILOT_CLI_PATH") {
            if !path.is_empty() {
                self.cli_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(vault) = std::env::var("VAULTPILOT_VAULT") {
            if !vault.is_empty() {
                self.vault_path = Some(PathBuf::from(vault));
            }
        }
    }
}

/// Default settings file: `~/.vaultpilot/settings.toml`.
pub fn default_settings_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".vaultpilot")
        .join("settings.toml")
}

/// Read-only view of the host's settings.
pub trait SettingsSource: Send + Sync {
    fn current(&self) -> Arc<Settings>;
}

/// Settings cell the host can update while the core keeps reading.
pub struct SharedSettings {
    inner: ArcSwap<Settings>,
}

impl SharedSettings {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: ArcSwap::from_pointee(settings),
        }
    }

    pub fn replace(&self, settings: Settings) {
        self.inner.store(Arc::new(settings));
    }

    pub fn update(&self, f: impl FnOnce(&mut Settings)) {
        let mut next = (*self.inner.load_full()).clone();
        f(&mut next);
        self.inner.store(Arc::new(next));
    }
}

impl SettingsSource for SharedSettings {
    fn current(&self) -> Arc<Settings> {
        self.inner.load_full()
    }
}
