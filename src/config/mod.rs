//! Configuration for PicoClaw.
//!
//! Settings are loaded with priority: env var > TOML config file > default.
//! `.env` files are loaded via dotenvy early in startup (see
//! [`crate::bootstrap`]), so values placed there behave like env vars.

pub(crate) mod helpers;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bootstrap::picoclaw_home;
use crate::error::ConfigError;
use crate::principal::Principal;
use crate::settings::Settings;

use self::helpers::{optional_env, parse_optional_env, validate_http_url};

pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:4943";
pub const DEFAULT_SERVICE_ID: &str = "rrkah-fqaaa-aaaaa-aaaaq-cai";
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_IDENTITY_URL: &str = "https://identity.ic0.app";
pub const DEFAULT_CALLBACK_PORT: u16 = 9876;
pub const DEFAULT_HISTORY_LIMIT: u64 = 20;

/// Main configuration for the client.
#[derive(Debug, Clone)]
pub struct Config {
    pub backend: BackendConfig,
    pub identity: IdentityConfig,
    pub wallet: WalletConfig,
    pub repl: ReplConfig,
    pub logging: LoggingConfig,
}

/// Where the backend agent lives and how long a single call may take.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub url: String,
    /// Service principal, passed to the wallet as the only allowed target.
    pub service_id: Principal,
    pub call_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub provider_url: String,
    pub session_path: PathBuf,
    pub callback_port: u16,
}

#[derive(Debug, Clone, Default)]
pub struct WalletConfig {
    /// `None` means no wallet extension is installed.
    pub bridge_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReplConfig {
    pub history_limit: u64,
    pub history_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub file: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
        }
    }

    fn parse(value: &str, key: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected 'text' or 'json', got '{value}'"),
            }),
        }
    }
}

impl BackendConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let raw_url = optional_env("PICOCLAW_BACKEND_URL")?
            .or_else(|| settings.backend.url.clone())
            .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string());
        let url = validate_http_url("PICOCLAW_BACKEND_URL", &raw_url)?;

        let raw_service = optional_env("PICOCLAW_SERVICE_ID")?
            .or_else(|| settings.backend.service_id.clone())
            .unwrap_or_else(|| DEFAULT_SERVICE_ID.to_string());
        let service_id =
            Principal::from_text(&raw_service).map_err(|e| ConfigError::InvalidValue {
                key: "PICOCLAW_SERVICE_ID".to_string(),
                message: e.to_string(),
            })?;

        let timeout_secs = parse_optional_env::<u64>(
            "PICOCLAW_CALL_TIMEOUT_SECS",
            "a whole number of seconds",
        )?
        .or(settings.backend.call_timeout_secs)
        .unwrap_or(DEFAULT_CALL_TIMEOUT_SECS);
        if timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PICOCLAW_CALL_TIMEOUT_SECS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            url,
            service_id,
            call_timeout: Duration::from_secs(timeout_secs),
        })
    }
}

impl IdentityConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let raw_url = optional_env("PICOCLAW_IDENTITY_URL")?
            .or_else(|| settings.identity.provider_url.clone())
            .unwrap_or_else(|| DEFAULT_IDENTITY_URL.to_string());
        let provider_url = validate_http_url("PICOCLAW_IDENTITY_URL", &raw_url)?;

        let session_path = optional_env("PICOCLAW_IDENTITY_PATH")?
            .map(PathBuf::from)
            .or_else(|| settings.identity.session_path.clone())
            .map(|p| expand_home(&p))
            .unwrap_or_else(|| picoclaw_home().join("identity.json"));

        let callback_port =
            parse_optional_env::<u16>("PICOCLAW_CALLBACK_PORT", "a valid port number")?
                .or(settings.identity.callback_port)
                .unwrap_or(DEFAULT_CALLBACK_PORT);

        Ok(Self {
            provider_url,
            session_path,
            callback_port,
        })
    }
}

impl WalletConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let bridge_url = optional_env("PICOCLAW_WALLET_BRIDGE_URL")?
            .or_else(|| settings.wallet.bridge_url.clone())
            .map(|raw| validate_http_url("PICOCLAW_WALLET_BRIDGE_URL", &raw))
            .transpose()?;
        Ok(Self { bridge_url })
    }
}

impl ReplConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let history_limit =
            parse_optional_env::<u64>("PICOCLAW_HISTORY_LIMIT", "a non-negative integer")?
                .or(settings.repl.history_limit)
                .unwrap_or(DEFAULT_HISTORY_LIMIT);

        Ok(Self {
            history_limit,
            history_path: picoclaw_home().join("history"),
        })
    }
}

impl LoggingConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let format = match optional_env("PICOCLAW_LOG_FORMAT")?
            .or_else(|| settings.logging.format.clone())
        {
            Some(raw) => LogFormat::parse(&raw, "PICOCLAW_LOG_FORMAT")?,
            None => LogFormat::default(),
        };

        Ok(Self {
            format,
            file: picoclaw_home().join("picoclaw.log"),
        })
    }
}

impl Config {
    /// Load configuration from env vars with an optional TOML file overlay.
    ///
    /// An explicit `toml_path` must exist and parse. Without one the default
    /// `~/.picoclaw/config.toml` is used if present.
    pub fn load(toml_path: Option<&Path>) -> Result<Self, ConfigError> {
        crate::bootstrap::load_picoclaw_env();
        let settings = Self::load_settings(toml_path)?;
        Self::resolve(&settings)
    }

    /// Build config from already-loaded settings plus the environment.
    pub fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self {
            backend: BackendConfig::resolve(settings)?,
            identity: IdentityConfig::resolve(settings)?,
            wallet: WalletConfig::resolve(settings)?,
            repl: ReplConfig::resolve(settings)?,
            logging: LoggingConfig::resolve(settings)?,
        })
    }

    /// Settings that reproduce this config when written to `config.toml`.
    pub fn to_settings(&self) -> Settings {
        use crate::settings::{
            BackendSettings, IdentitySettings, LoggingSettings, ReplSettings, WalletSettings,
        };

        Settings {
            backend: BackendSettings {
                url: Some(self.backend.url.clone()),
                service_id: Some(self.backend.service_id.to_text()),
                call_timeout_secs: Some(self.backend.call_timeout.as_secs()),
            },
            identity: IdentitySettings {
                provider_url: Some(self.identity.provider_url.clone()),
                session_path: Some(self.identity.session_path.clone()),
                callback_port: Some(self.identity.callback_port),
            },
            wallet: WalletSettings {
                bridge_url: self.wallet.bridge_url.clone(),
            },
            repl: ReplSettings {
                history_limit: Some(self.repl.history_limit),
            },
            logging: LoggingSettings {
                format: Some(self.logging.format.as_str().to_string()),
            },
        }
    }

    fn load_settings(explicit_path: Option<&Path>) -> Result<Settings, ConfigError> {
        let path = explicit_path
            .map(PathBuf::from)
            .unwrap_or_else(Settings::default_toml_path);

        match Settings::load_toml(&path) {
            Ok(Some(settings)) => {
                tracing::debug!("Loaded TOML config from {}", path.display());
                Ok(settings)
            }
            Ok(None) => {
                if explicit_path.is_some() {
                    return Err(ConfigError::ParseError(format!(
                        "Config file not found: {}",
                        path.display()
                    )));
                }
                Ok(Settings::default())
            }
            Err(e) => {
                if explicit_path.is_some() {
                    return Err(ConfigError::ParseError(format!(
                        "Failed to load config file {}: {}",
                        path.display(),
                        e
                    )));
                }
                tracing::warn!("Failed to load default config file: {}", e);
                Ok(Settings::default())
            }
        }
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}
