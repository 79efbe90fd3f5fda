//! Backend agent call surface.
//!
//! Everything the client asks of the backend goes through a [`CallHandle`]:
//! an immutable, identity-bound handle that forwards one named operation with
//! JSON arguments and returns the backend's [`Reply`]. Handles are produced by
//! a [`BackendConnector`] (anonymous or delegated identity) or by the
//! extension wallet, and are swapped in and out of the
//! [`ServiceProxy`](crate::proxy::ServiceProxy) by the session manager.

pub mod api;
pub mod http;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CallError;
use crate::identity::DelegatedIdentity;
use crate::principal::Principal;

pub use self::http::{HttpCallHandle, HttpConnector};

/// Application-level result returned by the backend.
///
/// Serialized as `{"Ok": <value>}` or `{"Err": "<message>"}`. A `Reply::Err`
/// is a successful call whose answer is a refusal or failure; transport and
/// protocol problems are [`CallError`]s instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Ok(serde_json::Value),
    Err(String),
}

impl Reply {
    pub fn ok(value: impl Into<serde_json::Value>) -> Self {
        Self::Ok(value.into())
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self::Err(message.into())
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    pub fn into_result(self) -> Result<serde_json::Value, String> {
        match self {
            Self::Ok(value) => Ok(value),
            Self::Err(message) => Err(message),
        }
    }

    /// Render the value as display text: strings verbatim, anything else as JSON.
    pub fn into_text(self) -> Result<String, String> {
        self.into_result().map(|value| match value {
            serde_json::Value::String(text) => text,
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        })
    }
}

/// One identity-bound way of calling the backend. Immutable once issued.
#[async_trait]
pub trait CallHandle: Send + Sync {
    /// Principal the backend will see as the caller.
    fn principal(&self) -> Principal;

    /// Forward `operation` with `args`. Does not interpret the reply.
    async fn call(&self, operation: &str, args: serde_json::Value) -> Result<Reply, CallError>;
}

/// Produces call handles for the anonymous and delegated identities.
pub trait BackendConnector: Send + Sync {
    fn anonymous(&self) -> Arc<dyn CallHandle>;

    fn delegated(&self, identity: &DelegatedIdentity) -> Arc<dyn CallHandle>;
}
