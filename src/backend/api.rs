//! Operations exposed by the backend agent and typed wrappers around them.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::backend::CallHandle;
use crate::error::ApiError;

pub const CHECK_ACCESS: &str = "check_access";
pub const CHAT: &str = "chat";
pub const BROWSE: &str = "browse";
pub const GET_HISTORY: &str = "get_history";
pub const GET_PROFILE: &str = "get_profile";
pub const GET_METRICS: &str = "get_metrics";
pub const GET_QUEUE_LENGTH: &str = "get_queue_length";

/// Prompts longer than this are refused by the backend.
pub const MAX_PROMPT_BYTES: usize = 4096;

/// Prefix routing a chat prompt to the backend's developer agent.
pub const DEV_PREFIX: &str = "/dev ";

/// One entry of the backend's conversation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
    /// Nanoseconds since the unix epoch.
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub name: String,
    pub avatar_url: String,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    pub total_calls: u64,
    pub total_cycles_spent: u64,
    pub total_messages: u64,
    pub errors: u64,
}

async fn query<T: DeserializeOwned>(
    handle: &dyn CallHandle,
    operation: &str,
    args: serde_json::Value,
) -> Result<T, ApiError> {
    let value = handle
        .call(operation, args)
        .await?
        .into_result()
        .map_err(|message| ApiError::Refused {
            operation: operation.to_string(),
            message,
        })?;

    serde_json::from_value(value).map_err(|e| ApiError::Decode {
        operation: operation.to_string(),
        reason: e.to_string(),
    })
}

/// The most recent `limit` messages, oldest first.
pub async fn get_history(handle: &dyn CallHandle, limit: u64) -> Result<Vec<Message>, ApiError> {
    query(handle, GET_HISTORY, json!({ "limit": limit })).await
}

pub async fn get_profile(handle: &dyn CallHandle) -> Result<UserProfile, ApiError> {
    query(handle, GET_PROFILE, json!({})).await
}

pub async fn get_metrics(handle: &dyn CallHandle) -> Result<Metrics, ApiError> {
    query(handle, GET_METRICS, json!({})).await
}

/// Tasks waiting in the backend's own queue.
pub async fn get_queue_length(handle: &dyn CallHandle) -> Result<u64, ApiError> {
    query(handle, GET_QUEUE_LENGTH, json!({})).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Reply;
    use crate::error::CallError;
    use crate::principal::Principal;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    struct Canned(Result<Reply, ()>);

    #[async_trait]
    impl CallHandle for Canned {
        fn principal(&self) -> Principal {
            Principal::anonymous()
        }

        async fn call(&self, operation: &str, _args: serde_json::Value) -> Result<Reply, CallError> {
            self.0.clone().map_err(|_| CallError::Transport {
                operation: operation.to_string(),
                reason: "connection refused".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn history_decodes_messages() {
        let handle = Canned(Ok(Reply::ok(json!([
            {"role": "user", "content": "hi", "timestamp": 1},
            {"role": "assistant", "content": "hello", "timestamp": 2}
        ]))));

        let history = get_history(&handle, 2).await.unwrap();
        assert_eq!(
            history,
            vec![
                Message {
                    role: "user".to_string(),
                    content: "hi".to_string(),
                    timestamp: 1
                },
                Message {
                    role: "assistant".to_string(),
                    content: "hello".to_string(),
                    timestamp: 2
                },
            ]
        );
    }

    #[tokio::test]
    async fn refusal_and_bad_shapes_are_distinguished() {
        let refused = get_metrics(&Canned(Ok(Reply::err("Access denied"))))
            .await
            .unwrap_err();
        assert!(matches!(refused, ApiError::Refused { .. }));

        let garbled = get_queue_length(&Canned(Ok(Reply::ok(json!("many")))))
            .await
            .unwrap_err();
        assert!(matches!(garbled, ApiError::Decode { .. }));

        let offline = get_profile(&Canned(Err(()))).await.unwrap_err();
        assert!(matches!(offline, ApiError::Call(CallError::Transport { .. })));
    }
}
