//! Resolution of the per-user config and state directories, plus the path expansion helpers
//! shared by the submission pipeline and the rsync engine.

use std::path::{Path, PathBuf};

use crate::{OsmoError, Result};

/// Overrides the config directory entirely when set.
pub const OSMO_CONFIG_OVERRIDE: &str = "OSMO_CONFIG_OVERRIDE";
/// Overrides the state directory entirely when set.
pub const OSMO_STATE_OVERRIDE: &str = "OSMO_STATE_OVERRIDE";

/// Get the path of the directory where config files (login.yaml, config.yaml) are stored.
///
/// Resolution order: `OSMO_CONFIG_OVERRIDE`, then `$XDG_CONFIG_HOME/osmo`, then the platform
/// config dir (`~/.config/osmo` on Linux).
pub fn client_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(OSMO_CONFIG_OVERRIDE) {
        return PathBuf::from(dir);
    }
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("osmo");
    }
    dirs::config_dir()
        .map(|v| v.join("osmo"))
        .unwrap_or_else(|| "./osmo".into())
}

/// Get the path of the directory where state (logs, rsync daemon PID files) is stored.
///
/// Resolution order: `OSMO_STATE_OVERRIDE`, then `$XDG_STATE_HOME/osmo`, then
/// `~/.local/state/osmo`.
pub fn client_state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(OSMO_STATE_OVERRIDE) {
        return PathBuf::from(dir);
    }
    if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
        return PathBuf::from(xdg).join("osmo");
    }
    dirs::state_dir()
        .map(|v| v.join("osmo"))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .map(|h| h.join(".local/state/osmo"))
                .unwrap_or_else(|| "./osmo-state".into())
        })
}

/// Path of the persisted login file.
pub fn login_file() -> PathBuf {
    client_config_dir().join("login.yaml")
}

/// Path of the client log file.
pub fn client_log_file() -> PathBuf {
    client_state_dir().join("client.log")
}

/// Expands a leading `~` and resolves symlinks to get the canonical local form of a
/// user-supplied path. The path must exist.
pub fn resolve_local_path(path: &str) -> Result<PathBuf> {
    let expanded = expand_user(path);
    expanded
        .canonicalize()
        .map_err(|_| OsmoError::user(format!("Source path does not exist: {}", path)))
}

/// Expands `~` and `~/...` against the user's home directory.
pub fn expand_user(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Resolves a path from a workflow document against a base directory (usually the directory
/// containing the workflow file). Absolute paths are returned unchanged.
pub fn absolute_path(path: &str, base_dir: &Path) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        return p.to_owned();
    }
    normalize(&base_dir.join(p))
}

/// Lexically normalizes a path, removing `.` and resolving `..` components without touching
/// the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_absolute_path_resolves_relative_to_base_dir() {
        let base = Path::new("/work/flows");
        assert_eq!(
            absolute_path("data/input.txt", base),
            PathBuf::from("/work/flows/data/input.txt")
        );
        assert_eq!(
            absolute_path("../shared/in.txt", base),
            PathBuf::from("/work/shared/in.txt")
        );
        assert_eq!(absolute_path("/abs/x", base), PathBuf::from("/abs/x"));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(
            normalize(Path::new("/a/b/./c/../d")),
            PathBuf::from("/a/b/d")
        );
        assert_eq!(normalize(Path::new("a/../../b")), PathBuf::from("../b"));
    }
}
