//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::SecretString;

use picoclaw::config::{
    BackendConfig, Config, IdentityConfig, LogFormat, LoggingConfig, ReplConfig, WalletConfig,
};
use picoclaw::error::AuthError;
use picoclaw::identity::{DelegatedIdentity, DelegatedIdentityProvider};
use picoclaw::principal::Principal;

pub const SERVICE: &str = "rrkah-fqaaa-aaaaa-aaaaq-cai";
pub const OWNER: &str = "ryjl3-tyaaa-aaaaa-aaaba-cai";

pub fn principal(text: &str) -> Principal {
    Principal::from_text(text).unwrap()
}

/// Config pointing at `backend_url`, with state kept under `dir`.
pub fn test_config(backend_url: &str, dir: &std::path::Path) -> Config {
    Config {
        backend: BackendConfig {
            url: backend_url.trim_end_matches('/').to_string(),
            service_id: principal(SERVICE),
            call_timeout: Duration::from_secs(5),
        },
        identity: IdentityConfig {
            provider_url: "http://127.0.0.1:9".to_string(),
            session_path: dir.join("identity.json"),
            callback_port: 0,
        },
        wallet: WalletConfig::default(),
        repl: ReplConfig {
            history_limit: 5,
            history_path: dir.join("history"),
        },
        logging: LoggingConfig {
            format: LogFormat::Text,
            file: dir.join("picoclaw.log"),
        },
    }
}

/// Identity provider that hands out a fixed delegation without a browser.
pub struct StaticDelegation {
    principal: Principal,
    delegation: String,
    pub released: AtomicUsize,
}

impl StaticDelegation {
    pub fn new(principal: Principal, delegation: &str) -> Self {
        Self {
            principal,
            delegation: delegation.to_string(),
            released: AtomicUsize::new(0),
        }
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    fn identity(&self) -> DelegatedIdentity {
        DelegatedIdentity::new(
            self.principal.clone(),
            SecretString::from(self.delegation.clone()),
            Utc::now() + chrono::Duration::hours(1),
        )
    }
}

#[async_trait]
impl DelegatedIdentityProvider for StaticDelegation {
    async fn acquire_delegated(
        &self,
        _max_lifetime: Duration,
    ) -> Result<DelegatedIdentity, AuthError> {
        Ok(self.identity())
    }

    async fn resume_delegated(&self) -> Result<Option<DelegatedIdentity>, AuthError> {
        Ok(None)
    }

    async fn release_delegated(&self) -> Result<(), AuthError> {
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
