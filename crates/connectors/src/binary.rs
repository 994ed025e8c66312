//! Locating the agent executable

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::ConnectorError;

/// Resolve the claude binary path.
/// 1. Explicit override (settings)
/// 2. CLAUDE_BIN env var
/// 3. ~/.claude/local/claude
/// 4. Search PATH
pub fn resolve_claude_binary(override_path: Option<&Path>) -> Result<PathBuf, ConnectorError> {
    if let Some(path) = override_path {
        if is_executable_file(path) {
            return Ok(path.to_path_buf());
        }
        warn!(
            component = "claude_connector",
            event = "claude.binary.override_not_found",
            path = %path.display(),
            "Configured CLI path does not exist, trying fallbacks"
        );
    }

    if let Ok(path) = std::env::var("CLAUDE_BIN") {
        let path = PathBuf::from(path);
        if is_executable_file(&path) {
            return Ok(path);
        }
        warn!(
            component = "claude_connector",
            event = "claude.binary.env_not_found",
            path = %path.display(),
            "CLAUDE_BIN path does not exist, trying fallbacks"
        );
    }

    if let Some(home) = dirs::home_dir() {
        let local_path = home.join(".claude").join("local").join("claude");
        if is_executable_file(&local_path) {
            return Ok(local_path);
        }
    }

    if let Some(path) = search_path("claude") {
        return Ok(path);
    }

    Err(ConnectorError::ProviderError(
        "Claude CLI binary not found. Install Claude Code or set the CLI path.".to_string(),
    ))
}

fn search_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable_file(candidate))
}

fn is_executable_file(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_wins_when_it_exists() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("claude");
        std::fs::write(&bin, "#!/bin/sh\n").unwrap();

        let resolved = resolve_claude_binary(Some(&bin)).unwrap();
        assert_eq!(resolved, bin);
    }

    #[test]
    fn search_path_ignores_missing_entries() {
        assert!(search_path("definitely-not-a-real-binary-name").is_none());
    }
}
