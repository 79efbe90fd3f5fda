//! User settings persistence.
//!
//! Stores user preferences in `~/.picoclaw/config.toml`.
//! Settings are resolved with env var > config.toml > default priority
//! (see [`crate::config`]).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::bootstrap::picoclaw_home;

/// User settings persisted to disk. Every field is optional; unset fields
/// fall back to built-in defaults during config resolution.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub backend: BackendSettings,

    #[serde(default)]
    pub identity: IdentitySettings,

    #[serde(default)]
    pub wallet: WalletSettings,

    #[serde(default)]
    pub repl: ReplSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BackendSettings {
    /// Base URL of the backend gateway.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Principal text of the backend service (allowed service for wallets).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,

    /// Per-call transport timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct IdentitySettings {
    /// Identity provider base URL (the `/authorize` page lives under it).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_url: Option<String>,

    /// Where the delegated identity is persisted between runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_path: Option<PathBuf>,

    /// Loopback port for the login callback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct WalletSettings {
    /// Local wallet bridge URL. Unset means no wallet extension.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ReplSettings {
    /// Messages of backend history shown after login.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_limit: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct LoggingSettings {
    /// `text` or `json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl Settings {
    /// Default TOML config file path (~/.picoclaw/config.toml).
    pub fn default_toml_path() -> PathBuf {
        picoclaw_home().join("config.toml")
    }

    /// Load settings from a TOML file.
    ///
    /// Returns `None` if the file doesn't exist. Returns an error only
    /// if the file exists but can't be parsed.
    pub fn load_toml(path: &Path) -> Result<Option<Self>, String> {
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(format!("failed to read {}: {}", path.display(), e)),
        };

        let settings: Self = toml::from_str(&data)
            .map_err(|e| format!("invalid TOML in {}: {}", path.display(), e))?;
        Ok(Some(settings))
    }

    /// Write a commented TOML config file with current settings.
    pub fn save_toml(&self, path: &Path) -> Result<(), String> {
        let raw = toml::to_string_pretty(self)
            .map_err(|e| format!("failed to serialize settings: {}", e))?;

        let content = format!(
            "# PicoClaw client configuration file.\n\
             #\n\
             # Priority: env var > this file > defaults.\n\
             # Run `picoclaw config init` to regenerate this file.\n\
             #\n\
             # [backend]     url, service_id, call_timeout_secs\n\
             # [identity]    provider_url, session_path, callback_port\n\
             # [wallet]      bridge_url\n\
             # [repl]        history_limit\n\
             # [logging]     format = \"text\" | \"json\"\n\
             \n\
             {raw}"
        );

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("failed to create {}: {}", parent.display(), e))?;
        }

        std::fs::write(path, content)
            .map_err(|e| format!("failed to write {}: {}", path.display(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn missing_toml_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = Settings::load_toml(&dir.path().join("absent.toml")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let settings = Settings {
            backend: BackendSettings {
                url: Some("https://agent.example".to_string()),
                call_timeout_secs: Some(30),
                ..Default::default()
            },
            wallet: WalletSettings {
                bridge_url: Some("http://127.0.0.1:7777".to_string()),
            },
            ..Default::default()
        };

        settings.save_toml(&path).unwrap();
        let loaded = Settings::load_toml(&path).unwrap().unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[backend\nurl = ").unwrap();

        let err = Settings::load_toml(&path).unwrap_err();
        assert!(err.contains("invalid TOML"));
    }

    #[test]
    fn default_toml_path_under_picoclaw() {
        let path = Settings::default_toml_path();
        assert!(path.to_string_lossy().contains(".picoclaw"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }
}
