//! Process-root context.
//!
//! Built once in `main` and handed to whatever needs the proxy, the session
//! manager or the queue. Nothing in the crate reaches these through statics.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::backend::{BackendConnector, CallHandle, HttpConnector};
use crate::config::Config;
use crate::identity::{
    BridgeWallet, BrowserIdentityProvider, DelegatedIdentityProvider, ExtensionWallet,
};
use crate::proxy::ServiceProxy;
use crate::queue::{TaskEvent, TaskQueue};
use crate::resolver::{LocalResolver, PrincipalResolver};
use crate::session::SessionManager;

pub struct AppContext {
    pub config: Config,
    pub proxy: Arc<ServiceProxy>,
    pub sessions: Arc<SessionManager>,
    pub queue: TaskQueue,
}

impl AppContext {
    /// Wire the HTTP transport, browser identity provider and (if configured)
    /// the wallet bridge.
    pub fn new(config: Config) -> (Self, mpsc::UnboundedReceiver<TaskEvent>) {
        let connector: Arc<dyn BackendConnector> = Arc::new(HttpConnector::new(&config.backend));
        let delegated: Arc<dyn DelegatedIdentityProvider> =
            Arc::new(BrowserIdentityProvider::new(config.identity.clone()));
        let wallet = config.wallet.bridge_url.as_ref().map(|url| {
            Arc::new(BridgeWallet::new(url.clone(), config.backend.call_timeout))
                as Arc<dyn ExtensionWallet>
        });

        Self::with_collaborators(config, connector, delegated, wallet)
    }

    /// Wire the core against arbitrary collaborators.
    pub fn with_collaborators(
        config: Config,
        connector: Arc<dyn BackendConnector>,
        delegated: Arc<dyn DelegatedIdentityProvider>,
        wallet: Option<Arc<dyn ExtensionWallet>>,
    ) -> (Self, mpsc::UnboundedReceiver<TaskEvent>) {
        let proxy = Arc::new(ServiceProxy::new(connector));
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&proxy),
            delegated,
            wallet,
            config.backend.service_id.clone(),
        ));
        let resolver: Arc<dyn LocalResolver> = Arc::new(PrincipalResolver::new());
        let (queue, events) = TaskQueue::new(
            Arc::clone(&proxy) as Arc<dyn CallHandle>,
            Some(resolver),
        );

        (
            Self {
                config,
                proxy,
                sessions,
                queue,
            },
            events,
        )
    }
}
