//! Error types for PicoClaw.

use std::time::Duration;

use regex::Regex;
use serde::Serialize;

/// Top-level error type for the client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Backend call error: {0}")]
    Call(#[from] CallError),

    #[error("Backend API error: {0}")]
    Api(#[from] ApiError),

    #[error("Submission error: {0}")]
    Submit(#[from] SubmitError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of a login, resume or logout transition.
///
/// "No prior session to resume" is not an error; see
/// [`crate::session::ResumeOutcome::NothingToResume`].
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The chosen provider is not installed or not reachable.
    #[error("Identity provider {provider} is not available")]
    ProviderUnavailable { provider: String },

    /// The provider flow itself failed (declined, closed, bad callback, IO).
    #[error("Identity provider {provider} failed: {reason}")]
    ProviderFailed { provider: String, reason: String },

    /// The backend explicitly refused the principal.
    #[error("Authorization rejected: {reason}")]
    Rejected { reason: String },

    /// The verification call did not produce an answer.
    #[error("Authorization verification failed: {cause}")]
    VerificationFailed { cause: String },

    #[error("Another login, resume or logout is already in progress")]
    TransitionInProgress,
}

impl AuthError {
    /// Text shown to the operator for a failed attempt.
    pub fn user_message(&self) -> String {
        match self {
            Self::ProviderUnavailable { provider } if provider == "extension_wallet" => {
                "Wallet extension not found. Install and unlock the wallet bridge, then try again."
                    .to_string()
            }
            Self::ProviderUnavailable { provider } => {
                format!("Identity provider {provider} is not available.")
            }
            Self::ProviderFailed { reason, .. } => {
                format!("Login did not complete: {}", redact_sensitive_detail(reason))
            }
            Self::Rejected { reason } => format!(
                "Ownership required: this principal is not authorized to use the agent ({}).",
                redact_sensitive_detail(reason)
            ),
            Self::VerificationFailed { cause } => format!(
                "Verification failed: could not confirm authorization ({}). Please log in again.",
                redact_sensitive_detail(cause)
            ),
            Self::TransitionInProgress => {
                "Please wait, a login or logout is already in progress.".to_string()
            }
        }
    }
}

/// Failure of a backend call at the transport or protocol level.
///
/// Application-level refusals travel inside [`crate::backend::Reply::Err`].
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("Call {operation} could not reach the backend: {reason}")]
    Transport { operation: String, reason: String },

    #[error("Call {operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("Call {operation} returned HTTP {status}: {body}")]
    Status {
        operation: String,
        status: u16,
        body: String,
    },

    #[error("Call {operation} returned an unreadable response: {reason}")]
    Protocol { operation: String, reason: String },
}

impl CallError {
    pub fn operation(&self) -> &str {
        match self {
            Self::Transport { operation, .. }
            | Self::Timeout { operation, .. }
            | Self::Status { operation, .. }
            | Self::Protocol { operation, .. } => operation,
        }
    }
}

/// Failure of a typed backend query (history, profile, metrics...).
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Call(#[from] CallError),

    #[error("Backend refused {operation}: {message}")]
    Refused { operation: String, message: String },

    #[error("Backend answer to {operation} could not be decoded: {reason}")]
    Decode { operation: String, reason: String },
}

/// Principal text or byte form is invalid.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid principal: {0}")]
pub struct PrincipalError(#[from] pub ic_principal::PrincipalError);

/// Local resolver failure. Never shown to the operator.
#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    #[error("Resolver could not decode principal {text}: {source}")]
    Principal {
        text: String,
        #[source]
        source: PrincipalError,
    },
}

/// Submission refused before it reached the queue.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Nothing to send")]
    Empty,

    #[error("Prompt too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("{input}: {reason}")]
    NotATask { input: String, reason: String },
}

/// Terminal channel errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} disconnected: {reason}")]
    Disconnected { name: String, reason: String },
}

/// Structured failure domains for the REPL incident surface.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeErrorDomain {
    Auth,
    Call,
    Config,
    Channel,
    Unknown,
}

/// Structured runtime error payload rendered by the REPL.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RuntimeErrorPayload {
    pub domain: RuntimeErrorDomain,
    pub code: &'static str,
    pub retryable: bool,
    pub message: String,
}

impl RuntimeErrorPayload {
    fn new(
        domain: RuntimeErrorDomain,
        code: &'static str,
        retryable: bool,
        message: impl Into<String>,
    ) -> Self {
        Self {
            domain,
            code,
            retryable,
            message: redact_sensitive_detail(&message.into()),
        }
    }
}

impl AuthError {
    fn to_runtime_error_payload(&self) -> RuntimeErrorPayload {
        let (code, retryable) = match self {
            Self::ProviderUnavailable { .. } => ("auth.provider_unavailable", false),
            Self::ProviderFailed { .. } => ("auth.provider_failed", true),
            Self::Rejected { .. } => ("auth.rejected", false),
            Self::VerificationFailed { .. } => ("auth.verification_failed", true),
            Self::TransitionInProgress => ("auth.transition_in_progress", true),
        };
        RuntimeErrorPayload::new(
            RuntimeErrorDomain::Auth,
            code,
            retryable,
            self.user_message(),
        )
    }
}

impl CallError {
    fn to_runtime_error_payload(&self) -> RuntimeErrorPayload {
        let code = match self {
            Self::Transport { .. } => "call.transport",
            Self::Timeout { .. } => "call.timeout",
            Self::Status { status, .. } if *status == 401 || *status == 403 => "call.forbidden",
            Self::Status { .. } => "call.http_status",
            Self::Protocol { .. } => "call.protocol",
        };
        let retryable = !matches!(self, Self::Protocol { .. });
        RuntimeErrorPayload::new(RuntimeErrorDomain::Call, code, retryable, self.to_string())
    }
}

impl Error {
    /// Map errors into a structured surface for the REPL.
    pub fn to_runtime_error_payload(&self) -> RuntimeErrorPayload {
        match self {
            Self::Auth(err) => err.to_runtime_error_payload(),
            Self::Call(err) => err.to_runtime_error_payload(),
            Self::Api(ApiError::Call(err)) => err.to_runtime_error_payload(),
            Self::Api(err @ ApiError::Refused { .. }) => RuntimeErrorPayload::new(
                RuntimeErrorDomain::Call,
                "call.refused",
                false,
                err.to_string(),
            ),
            Self::Api(err @ ApiError::Decode { .. }) => RuntimeErrorPayload::new(
                RuntimeErrorDomain::Call,
                "call.protocol",
                false,
                err.to_string(),
            ),
            Self::Config(err) => RuntimeErrorPayload::new(
                RuntimeErrorDomain::Config,
                "config.invalid",
                false,
                err.to_string(),
            ),
            Self::Submit(err) => RuntimeErrorPayload::new(
                RuntimeErrorDomain::Unknown,
                "submit.refused",
                false,
                err.to_string(),
            ),
            Self::Channel(err) => RuntimeErrorPayload::new(
                RuntimeErrorDomain::Channel,
                "channel.failed",
                false,
                err.to_string(),
            ),
        }
    }
}

/// Mask bearer tokens, keys and delegations in text that may be displayed or logged.
pub fn redact_sensitive_detail(raw: &str) -> String {
    let mut value = raw.to_string();
    let patterns = [
        (r"(?i)\b(bearer)\s+[a-z0-9._\-~+/]+=*", "$1 [REDACTED]"),
        (
            r"(?i)\b(token|delegation|api[_\-]?key|secret|password)\b(\s*[:=]\s*)([^,\s]+)",
            "$1$2[REDACTED]",
        ),
    ];

    for (pattern, replacement) in patterns {
        if let Ok(re) = Regex::new(pattern) {
            value = re.replace_all(&value, replacement).to_string();
        }
    }

    value
}

/// Result type alias for the client.
pub type Result<T> = std::result::Result<T, Error>;
