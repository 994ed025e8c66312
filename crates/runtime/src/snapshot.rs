//! Connection configuration snapshots
//!
//! A `ConnectionSnapshot` is the set of parameters a running connection was
//! started with. Comparing two snapshots tells the lifecycle manager whether
//! it can keep the connection, patch it live, or must restart it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use ring::digest;
use tokio_util::sync::CancellationToken;
use vaultpilot_connectors::{resolve_claude_binary, LaunchConfig, ToolPermissionHandler};
use vaultpilot_protocol::{McpServerConfig, PermissionMode};

use crate::config::Settings;
use crate::lifecycle::LifecycleError;
use crate::query::QueryOptions;

/// Fields that can be changed on a running connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveField {
    Model,
    ThinkingTokens,
    PermissionMode,
    McpServers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub model: Option<String>,
    pub max_thinking_tokens: Option<u64>,
    pub permission_mode: PermissionMode,
    pub system_prompt_key: String,
    pub disallowed_tools_key: String,
    pub mcp_servers_key: String,
    pub plugins_key: String,
    pub external_context_paths: Vec<PathBuf>,
    pub allowed_export_paths: Vec<PathBuf>,
    pub setting_sources: Vec<String>,
    pub executable: PathBuf,
}

impl ConnectionSnapshot {
    /// Live-updatable fields that differ between `self` (running) and `desired`.
    pub fn live_differences(&self, desired: &ConnectionSnapshot) -> Vec<LiveField> {
        let mut fields = Vec::new();
        if self.model != desired.model {
            fields.push(LiveField::Model);
        }
        if self.max_thinking_tokens != desired.max_thinking_tokens {
            fields.push(LiveField::ThinkingTokens);
        }
        if self.permission_mode != desired.permission_mode {
            fields.push(LiveField::PermissionMode);
        }
        if self.mcp_servers_key != desired.mcp_servers_key {
            fields.push(LiveField::McpServers);
        }
        fields
    }

    /// Any difference at all means a fresh connection is needed.
    pub fn requires_restart(&self, desired: &ConnectionSnapshot) -> bool {
        self != desired
    }

    /// Copy one live field from `desired` after it was applied to the connection.
    pub fn adopt(&mut self, field: LiveField, desired: &ConnectionSnapshot) {
        match field {
            LiveField::Model => self.model = desired.model.clone(),
            LiveField::ThinkingTokens => self.max_thinking_tokens = desired.max_thinking_tokens,
            LiveField::PermissionMode => self.permission_mode = desired.permission_mode,
            LiveField::McpServers => self.mcp_servers_key = desired.mcp_servers_key.clone(),
        }
    }
}

/// Fully resolved parameters for starting a connection.
#[derive(Debug, Clone)]
pub struct DesiredConnection {
    pub snapshot: ConnectionSnapshot,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub system_prompt: String,
    pub disallowed_tools: Vec<String>,
    pub mcp_servers: BTreeMap<String, McpServerConfig>,
    pub plugins: Vec<PathBuf>,
}

impl DesiredConnection {
    /// Resolve settings (plus optional per-request overrides) into launch
    /// parameters. Fails when the working directory or executable cannot be found.
    pub fn resolve(
        settings: &Settings,
        options: Option<&QueryOptions>,
    ) -> Result<Self, LifecycleError> {
        let cwd = settings
            .vault_path
            .clone()
            .filter(|p| p.is_dir())
            .ok_or(LifecycleError::NoWorkingDirectory)?;
        let executable = resolve_claude_binary(settings.cli_path.as_deref())
            .map_err(|e| LifecycleError::ExecutableNotFound(e.to_string()))?;

        let model = options
            .and_then(|o| o.model.clone())
            .or_else(|| Some(settings.model.clone()))
            .filter(|m| !m.is_empty());

        let requested_servers = options.map(|o| o.mcp_servers.as_slice()).unwrap_or(&[]);
        let mcp_servers = settings.active_mcp_servers(requested_servers);

        let mut external_context_paths = settings.external_context_paths.clone();
        if let Some(options) = options {
            for path in &options.external_context_paths {
                if !external_context_paths.contains(path) {
                    external_context_paths.push(path.clone());
                }
            }
        }

        let snapshot = ConnectionSnapshot {
            model,
            max_thinking_tokens: settings.max_thinking_tokens,
            permission_mode: settings.permission_mode,
            system_prompt_key: fingerprint_text(&settings.system_prompt),
            disallowed_tools_key: fingerprint_list(&settings.disallowed_tools),
            mcp_servers_key: fingerprint_mcp(&mcp_servers),
            plugins_key: fingerprint_list(
                &settings
                    .plugins
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>(),
            ),
            external_context_paths,
            allowed_export_paths: settings.allowed_export_paths.clone(),
            setting_sources: settings.setting_sources.clone(),
            executable,
        };

        Ok(Self {
            snapshot,
            cwd,
            env: settings.env_pairs(),
            system_prompt: settings.system_prompt.clone(),
            disallowed_tools: settings.disallowed_tools.clone(),
            mcp_servers,
            plugins: settings.plugins.clone(),
        })
    }

    pub fn launch_config(
        &self,
        resume_session_id: Option<String>,
        permission_handler: Arc<dyn ToolPermissionHandler>,
        abort: CancellationToken,
    ) -> LaunchConfig {
        let mut additional_directories = self.snapshot.external_context_paths.clone();
        for path in &self.snapshot.allowed_export_paths {
            if !additional_directories.contains(path) {
                additional_directories.push(path.clone());
            }
        }

        LaunchConfig {
            cwd: self.cwd.clone(),
            executable: self.snapshot.executable.clone(),
            env: self.env.clone(),
            model: self.snapshot.model.clone(),
            max_thinking_tokens: self.snapshot.max_thinking_tokens,
            permission_mode: self.snapshot.permission_mode,
            resume_session_id,
            system_prompt: Some(self.system_prompt.clone()).filter(|p| !p.is_empty()),
            disallowed_tools: self.disallowed_tools.clone(),
            mcp_servers: self.mcp_servers.clone(),
            plugin_dirs: self.plugins.clone(),
            additional_directories,
            setting_sources: self.snapshot.setting_sources.clone(),
            permission_handler,
            abort,
        }
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    digest::digest(&digest::SHA256, bytes)
        .as_ref()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn fingerprint_text(text: &str) -> String {
    hex_digest(text.as_bytes())
}

/// Order-insensitive fingerprint of a list of names.
fn fingerprint_list(items: &[String]) -> String {
    let mut sorted: Vec<&str> = items.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    hex_digest(sorted.join("\n").as_bytes())
}

fn fingerprint_mcp(servers: &BTreeMap<String, McpServerConfig>) -> String {
    let canonical = serde_json::to_string(servers).unwrap_or_default();
    hex_digest(canonical.as_bytes())
}
