//! The single live binding to the backend.
//!
//! Callers never hold the bound handle across a rebind: each call clones the
//! current `Arc` before awaiting, so a call in flight finishes on the handle
//! it started with while the next call picks up the new one.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::backend::{BackendConnector, CallHandle, Reply};
use crate::error::CallError;
use crate::principal::Principal;

pub struct ServiceProxy {
    connector: Arc<dyn BackendConnector>,
    current: RwLock<Arc<dyn CallHandle>>,
}

impl ServiceProxy {
    /// Start bound to the anonymous handle.
    pub fn new(connector: Arc<dyn BackendConnector>) -> Self {
        let anonymous = connector.anonymous();
        Self {
            connector,
            current: RwLock::new(anonymous),
        }
    }

    /// Swap the binding. `None` rebinds to the anonymous handle.
    pub fn rebind(&self, handle: Option<Arc<dyn CallHandle>>) {
        let next = handle.unwrap_or_else(|| self.connector.anonymous());
        let principal = next.principal();
        *self.current.write() = next;
        tracing::debug!(%principal, "Service proxy rebound");
    }

    /// The handle the next call will use.
    pub fn handle(&self) -> Arc<dyn CallHandle> {
        Arc::clone(&self.current.read())
    }

    pub fn connector(&self) -> &Arc<dyn BackendConnector> {
        &self.connector
    }

    pub fn is_anonymous(&self) -> bool {
        self.current.read().principal().is_anonymous()
    }
}

#[async_trait]
impl CallHandle for ServiceProxy {
    fn principal(&self) -> Principal {
        self.current.read().principal()
    }

    async fn call(&self, operation: &str, args: serde_json::Value) -> Result<Reply, CallError> {
        let handle = self.handle();
        handle.call(operation, args).await
    }
}
