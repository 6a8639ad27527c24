use std::path::Path;
use std::sync::{OnceLock, RwLock};

use tracing::{info, warn};

use crate::config::AppConfig;

/// Where ADB commands go: which binary, and optionally which remote server.
/// Set rarely (apply_environment), read on every invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEnv {
    pub adb_program: String,
    pub remote: Option<(String, u16)>,
}

impl Default for CommandEnv {
    fn default() -> Self {
        Self {
            adb_program: "adb".to_string(),
            remote: None,
        }
    }
}

impl CommandEnv {
    /// Expands an arg vector into the full invocation, inserting the remote
    /// server redirect when one is configured.
    pub fn adb_invocation(&self, args: &[String]) -> (String, Vec<String>) {
        let mut full = Vec::with_capacity(args.len() + 4);
        if let Some((host, port)) = &self.remote {
            full.push("-H".to_string());
            full.push(host.clone());
            full.push("-P".to_string());
            full.push(port.to_string());
        }
        full.extend_from_slice(args);
        (self.adb_program.clone(), full)
    }
}

fn env_slot() -> &'static RwLock<CommandEnv> {
    static SLOT: OnceLock<RwLock<CommandEnv>> = OnceLock::new();
    SLOT.get_or_init(|| RwLock::new(CommandEnv::default()))
}

/// Rebuilds the command environment from settings and ambient variables.
/// Every later invocation picks this up; callers never pass paths around.
pub fn apply_environment(config: &AppConfig) -> CommandEnv {
    let program = resolve_adb_program(&config.adb.command_path);
    if let Err(reason) = validate_adb_program(&program) {
        warn!(program = %program, reason = %reason, "ADB program failed validation");
    }
    let remote = if config.adb.remote_host.trim().is_empty() {
        None
    } else {
        Some((
            config.adb.remote_host.trim().to_string(),
            config.adb.remote_port,
        ))
    };
    let env = CommandEnv {
        adb_program: program,
        remote,
    };
    if let Ok(mut slot) = env_slot().write() {
        if *slot != env {
            info!(
                program = %env.adb_program,
                remote = env.remote.is_some(),
                "command environment applied"
            );
        }
        *slot = env.clone();
    }
    env
}

pub fn current_env() -> CommandEnv {
    env_slot()
        .read()
        .map(|slot| slot.clone())
        .unwrap_or_default()
}

pub fn normalize_command_path(value: &str) -> String {
    let trimmed = value.trim();
    if let Some(inner) = trimmed
        .strip_prefix('"')
        .and_then(|candidate| candidate.strip_suffix('"'))
    {
        return inner.trim().to_string();
    }
    if let Some(inner) = trimmed
        .strip_prefix('\'')
        .and_then(|candidate| candidate.strip_suffix('\''))
    {
        return inner.trim().to_string();
    }
    trimmed.to_string()
}

/// Resolution order: configured path, DROIDGLASS_ADB / ADB variables,
/// well-known install locations, bare `adb` from PATH.
pub fn resolve_adb_program(config_command_path: &str) -> String {
    let normalized = normalize_command_path(config_command_path);
    if !normalized.is_empty() {
        return normalized;
    }
    for var in ["DROIDGLASS_ADB", "ADB"] {
        if let Ok(value) = std::env::var(var) {
            let candidate = normalize_command_path(&value);
            if !candidate.is_empty() {
                return candidate;
            }
        }
    }
    for path in well_known_adb_paths() {
        let expanded = expand_home(path);
        if Path::new(&expanded).exists() {
            return expanded;
        }
    }
    "adb".to_string()
}

fn well_known_adb_paths() -> Vec<&'static str> {
    if std::env::consts::OS == "macos" {
        vec![
            "/opt/homebrew/bin/adb",
            "/usr/local/bin/adb",
            "~/Library/Android/sdk/platform-tools/adb",
        ]
    } else {
        vec![
            "/usr/bin/adb",
            "/usr/local/bin/adb",
            "/opt/android-sdk/platform-tools/adb",
            "~/Android/Sdk/platform-tools/adb",
            "~/.local/bin/adb",
        ]
    }
}

pub fn validate_adb_program(program: &str) -> Result<(), String> {
    if program.trim().is_empty() {
        return Err("ADB command is empty".to_string());
    }
    if !program.contains('/') && !program.contains('\\') {
        // Bare names resolve through PATH at spawn time.
        return Ok(());
    }
    let path = Path::new(program);
    if path.is_dir() {
        return Err("ADB path must point to an executable file".to_string());
    }
    if !path.exists() {
        return Err("ADB executable not found at the configured path".to_string());
    }
    Ok(())
}

pub(crate) fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().to_string();
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_wrapping_quotes() {
        assert_eq!(
            normalize_command_path("  \"/opt/android/platform-tools/adb\"  "),
            "/opt/android/platform-tools/adb"
        );
        assert_eq!(
            normalize_command_path("  '/opt/android/platform-tools/adb'  "),
            "/opt/android/platform-tools/adb"
        );
    }

    #[test]
    fn configured_path_wins_over_everything() {
        assert_eq!(
            resolve_adb_program("/custom/adb"),
            "/custom/adb".to_string()
        );
    }

    #[test]
    fn validates_nonexistent_path() {
        let err = validate_adb_program("/this/path/should/not/exist/adb").unwrap_err();
        assert!(err.to_lowercase().contains("not found"));
    }

    #[test]
    fn bare_program_names_pass_validation() {
        assert!(validate_adb_program("adb").is_ok());
    }

    #[test]
    fn remote_redirect_prefixes_server_flags() {
        let env = CommandEnv {
            adb_program: "adb".to_string(),
            remote: Some(("10.0.0.9".to_string(), 5037)),
        };
        let (program, args) = env.adb_invocation(&[
            "-s".to_string(),
            "SER".to_string(),
            "shell".to_string(),
            "true".to_string(),
        ]);
        assert_eq!(program, "adb");
        assert_eq!(
            args,
            vec!["-H", "10.0.0.9", "-P", "5037", "-s", "SER", "shell", "true"]
        );
    }

    #[test]
    fn local_env_leaves_args_untouched() {
        let env = CommandEnv::default();
        let (_, args) = env.adb_invocation(&["devices".to_string(), "-l".to_string()]);
        assert_eq!(args, vec!["devices", "-l"]);
    }
}
