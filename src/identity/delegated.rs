//! Delegated identity via a browser round trip.
//!
//! 1. Bind the loopback callback port
//! 2. Open `{provider}/authorize?...` in the browser
//! 3. Wait for the provider to redirect to `/callback?delegation=..&principal=..`
//! 4. Persist the delegation to `~/.picoclaw/identity.json` (0600)

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::config::IdentityConfig;
use crate::error::{AuthError, redact_sensitive_detail};
use crate::identity::{DelegatedIdentity, DelegatedIdentityProvider};
use crate::principal::Principal;

const PROVIDER: &str = "delegated";
const CALLBACK_PATH: &str = "/callback";
const LOGIN_TIMEOUT: Duration = Duration::from_secs(300);
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);

const AUTH_ERR_CALLBACK_BIND: &str = "auth.callback_bind_failed";
const AUTH_ERR_CALLBACK_FAILED: &str = "auth.callback_failed";
const AUTH_ERR_CALLBACK_TIMEOUT: &str = "auth.callback_timeout";
const AUTH_ERR_DECLINED: &str = "auth.declined";
const AUTH_ERR_STATE_MISMATCH: &str = "auth.state_mismatch";
const AUTH_ERR_BAD_CALLBACK: &str = "auth.bad_callback";
const AUTH_ERR_STORE: &str = "auth.identity_store_failed";

fn coded_auth_reason(code: &str, detail: impl std::fmt::Display) -> String {
    format!("{}: {}", code, redact_sensitive_detail(&detail.to_string()))
}

fn provider_failed(code: &str, detail: impl std::fmt::Display) -> AuthError {
    AuthError::ProviderFailed {
        provider: PROVIDER.to_string(),
        reason: coded_auth_reason(code, detail),
    }
}

/// Delegation persisted between runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDelegation {
    pub principal: Principal,
    pub delegation: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl StoredDelegation {
    fn into_identity(self) -> DelegatedIdentity {
        DelegatedIdentity::new(
            self.principal,
            SecretString::from(self.delegation),
            self.expires_at,
        )
    }
}

/// File-backed store for the current delegation.
#[derive(Debug, Clone)]
pub struct DelegationStore {
    path: PathBuf,
}

impl DelegationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored delegation. A missing file is `Ok(None)`.
    pub async fn load(&self) -> Result<Option<StoredDelegation>, AuthError> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(provider_failed(AUTH_ERR_STORE, e)),
        };

        serde_json::from_str(&data)
            .map(Some)
            .map_err(|e| provider_failed(AUTH_ERR_STORE, format!("invalid identity file: {e}")))
    }

    pub async fn save(&self, identity: &DelegatedIdentity) -> Result<(), AuthError> {
        let stored = StoredDelegation {
            principal: identity.principal().clone(),
            delegation: identity.delegation().expose_secret().to_string(),
            expires_at: identity.expires_at(),
            created_at: Utc::now(),
        };

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| provider_failed(AUTH_ERR_STORE, e))?;
        }

        let json = serde_json::to_string_pretty(&stored)
            .map_err(|e| provider_failed(AUTH_ERR_STORE, e))?;
        tokio::fs::write(&self.path, json)
            .await
            .map_err(|e| provider_failed(AUTH_ERR_STORE, e))?;

        // The file holds a bearer credential.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&self.path, perms)
                .await
                .map_err(|e| provider_failed(AUTH_ERR_STORE, e))?;
        }

        tracing::debug!("Delegation saved to {}", self.path.display());
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), AuthError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(provider_failed(AUTH_ERR_STORE, e)),
        }
    }
}

/// Delegated identity provider driven through the system browser.
pub struct BrowserIdentityProvider {
    config: IdentityConfig,
    store: DelegationStore,
}

impl BrowserIdentityProvider {
    pub fn new(config: IdentityConfig) -> Self {
        let store = DelegationStore::new(config.session_path.clone());
        Self { config, store }
    }

    pub fn store(&self) -> &DelegationStore {
        &self.store
    }

    fn callback_url(&self) -> String {
        format!("http://127.0.0.1:{}{}", self.config.callback_port, CALLBACK_PATH)
    }

    /// Wait for the provider redirect on `listener` and turn it into an identity.
    async fn complete_round_trip(
        &self,
        listener: TcpListener,
        state: &str,
        max_lifetime: Duration,
    ) -> Result<DelegatedIdentity, AuthError> {
        let params = tokio::time::timeout(LOGIN_TIMEOUT, wait_for_callback(listener, CALLBACK_PATH))
            .await
            .map_err(|_| {
                provider_failed(
                    AUTH_ERR_CALLBACK_TIMEOUT,
                    format!("no callback within {}s", LOGIN_TIMEOUT.as_secs()),
                )
            })?
            .map_err(|e| provider_failed(AUTH_ERR_CALLBACK_FAILED, e))?;

        let identity = identity_from_callback(&params, state, max_lifetime, Utc::now())?;
        self.store.save(&identity).await?;
        Ok(identity)
    }
}

#[async_trait]
impl DelegatedIdentityProvider for BrowserIdentityProvider {
    async fn acquire_delegated(
        &self,
        max_lifetime: Duration,
    ) -> Result<DelegatedIdentity, AuthError> {
        let listener = TcpListener::bind(("127.0.0.1", self.config.callback_port))
            .await
            .map_err(|e| provider_failed(AUTH_ERR_CALLBACK_BIND, e))?;

        let state = uuid::Uuid::new_v4().simple().to_string();
        let auth_url = authorize_url(
            &self.config.provider_url,
            &self.callback_url(),
            max_lifetime,
            &state,
        )
        .map_err(|e| provider_failed(AUTH_ERR_BAD_CALLBACK, e))?;

        println!();
        println!("Opening identity provider...");
        println!();
        println!("  {}", auth_url);
        println!();

        if let Err(e) = open::that(&auth_url) {
            tracing::debug!("Could not open browser automatically: {}", e);
            println!("(Could not open browser automatically, please copy the URL above)");
        }
        println!("Waiting for authentication...");

        let identity = self
            .complete_round_trip(listener, &state, max_lifetime)
            .await?;
        tracing::info!(principal = %identity.principal(), "Delegated identity acquired");
        Ok(identity)
    }

    async fn resume_delegated(&self) -> Result<Option<DelegatedIdentity>, AuthError> {
        let Some(stored) = self.store.load().await? else {
            return Ok(None);
        };

        let identity = stored.into_identity();
        if identity.is_expired_at(Utc::now()) {
            tracing::info!(
                "Stored delegation expired at {}, discarding",
                identity.expires_at()
            );
            self.store.clear().await?;
            return Ok(None);
        }

        Ok(Some(identity))
    }

    async fn release_delegated(&self) -> Result<(), AuthError> {
        self.store.clear().await
    }
}

/// Build the provider's authorize URL.
fn authorize_url(
    provider_url: &str,
    callback_url: &str,
    max_lifetime: Duration,
    state: &str,
) -> Result<String, url::ParseError> {
    let mut url = url::Url::parse(provider_url)?.join("authorize")?;
    url.query_pairs_mut()
        .append_pair("callback", callback_url)
        .append_pair("max_time_to_live", &max_lifetime.as_nanos().to_string())
        .append_pair("state", state);
    Ok(url.to_string())
}

/// Validate callback parameters and build the identity.
///
/// `expiration` is optional and given in unix nanoseconds; the result is
/// clamped to `now + max_lifetime`.
fn identity_from_callback(
    params: &HashMap<String, String>,
    expected_state: &str,
    max_lifetime: Duration,
    now: DateTime<Utc>,
) -> Result<DelegatedIdentity, AuthError> {
    if let Some(error) = params.get("error") {
        return Err(provider_failed(AUTH_ERR_DECLINED, error));
    }

    let state = params.get("state").map(String::as_str).unwrap_or_default();
    if !bool::from(state.as_bytes().ct_eq(expected_state.as_bytes())) {
        return Err(provider_failed(
            AUTH_ERR_STATE_MISMATCH,
            "callback state does not match this login",
        ));
    }

    let principal = params
        .get("principal")
        .ok_or_else(|| provider_failed(AUTH_ERR_BAD_CALLBACK, "missing principal"))
        .and_then(|text| {
            Principal::from_text(text).map_err(|e| provider_failed(AUTH_ERR_BAD_CALLBACK, e))
        })?;
    if principal.is_anonymous() {
        return Err(provider_failed(
            AUTH_ERR_BAD_CALLBACK,
            "provider returned the anonymous principal",
        ));
    }

    let delegation = params
        .get("delegation")
        .map(|d| d.trim())
        .filter(|d| !d.is_empty())
        .ok_or_else(|| provider_failed(AUTH_ERR_BAD_CALLBACK, "missing delegation"))?;

    let ceiling = now
        + chrono::Duration::from_std(max_lifetime)
            .unwrap_or_else(|_| chrono::Duration::days(7));
    let expires_at = match params.get("expiration") {
        Some(raw) => {
            let nanos: i64 = raw.parse().map_err(|e| {
                provider_failed(AUTH_ERR_BAD_CALLBACK, format!("bad expiration: {e}"))
            })?;
            Utc.timestamp_nanos(nanos).min(ceiling)
        }
        None => ceiling,
    };
    if expires_at <= now {
        return Err(provider_failed(
            AUTH_ERR_BAD_CALLBACK,
            "delegation is already expired",
        ));
    }

    Ok(DelegatedIdentity::new(
        principal,
        SecretString::from(delegation.to_string()),
        expires_at,
    ))
}

const CALLBACK_OK_BODY: &str = "<html><body><h3>Login complete.</h3>\
<p>You can close this window and return to the terminal.</p></body></html>";

/// Accept loopback connections until one hits `path`, and return its query.
///
/// Each connection is served on its own task so an idle socket cannot hold up
/// the real redirect.
async fn wait_for_callback(
    listener: TcpListener,
    path: &str,
) -> Result<HashMap<String, String>, String> {
    let (found_tx, mut found_rx) = mpsc::channel(1);
    loop {
        tokio::select! {
            Some(params) = found_rx.recv() => return Ok(params),
            accepted = listener.accept() => {
                let (stream, peer) = accepted.map_err(|e| format!("accept failed: {e}"))?;
                let found_tx = found_tx.clone();
                let path = path.to_string();
                tokio::spawn(async move {
                    let served =
                        tokio::time::timeout(REQUEST_READ_TIMEOUT, serve_callback(stream, &path));
                    match served.await {
                        Ok(Some(params)) => {
                            let _ = found_tx.send(params).await;
                        }
                        Ok(None) => {}
                        Err(_) => tracing::debug!(%peer, "Dropped idle callback connection"),
                    }
                });
            }
        }
    }
}

/// Answer one request. Returns the query when it targets `path`.
async fn serve_callback(stream: TcpStream, path: &str) -> Option<HashMap<String, String>> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let mut request_line = String::new();
    if let Err(e) = reader.read_line(&mut request_line).await {
        tracing::debug!(error = %e, "Callback read failed");
        return None;
    }

    // Drain headers so the browser sees a clean response.
    loop {
        let mut header = String::new();
        match reader.read_line(&mut header).await {
            Ok(0) => break,
            Ok(_) if header.trim().is_empty() => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }

    let params = parse_request_target(&request_line, path);
    let response = match params {
        Some(_) => format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            CALLBACK_OK_BODY.len(),
            CALLBACK_OK_BODY
        ),
        None => "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            .to_string(),
    };
    let _ = writer.write_all(response.as_bytes()).await;
    let _ = writer.shutdown().await;
    params
}

/// Parse `GET /callback?a=b HTTP/1.1` into query pairs when the path matches.
fn parse_request_target(request_line: &str, path: &str) -> Option<HashMap<String, String>> {
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    if method != "GET" {
        return None;
    }

    let url = url::Url::parse(&format!("http://127.0.0.1{target}")).ok()?;
    if url.path() != path {
        return None;
    }
    Some(url.query_pairs().into_owned().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    const USER: &str = "rrkah-fqaaa-aaaaa-aaaaq-cai";

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn test_config(dir: &Path, port: u16) -> IdentityConfig {
        IdentityConfig {
            provider_url: "https://identity.example".to_string(),
            session_path: dir.join("identity.json"),
            callback_port: port,
        }
    }

    #[test]
    fn authorize_url_carries_lifetime_and_state() {
        let url = authorize_url(
            "https://identity.example",
            "http://127.0.0.1:9876/callback",
            Duration::from_secs(60),
            "nonce",
        )
        .unwrap();
        assert!(url.starts_with("https://identity.example/authorize?"));
        assert!(url.contains("max_time_to_live=60000000000"));
        assert!(url.contains("state=nonce"));
        assert!(url.contains("callback=http%3A%2F%2F127.0.0.1%3A9876%2Fcallback"));
    }

    #[test]
    fn request_target_must_match_path() {
        let found = parse_request_target("GET /callback?principal=x&state=s HTTP/1.1\r\n", "/callback")
            .unwrap();
        assert_eq!(found.get("principal").map(String::as_str), Some("x"));
        assert!(parse_request_target("GET /favicon.ico HTTP/1.1\r\n", "/callback").is_none());
        assert!(parse_request_target("POST /callback HTTP/1.1\r\n", "/callback").is_none());
    }

    #[test]
    fn callback_requires_matching_state() {
        let err = identity_from_callback(
            &params(&[("principal", USER), ("delegation", "d"), ("state", "other")]),
            "expected",
            Duration::from_secs(60),
            Utc::now(),
        )
        .unwrap_err();
        assert!(err.to_string().contains(AUTH_ERR_STATE_MISMATCH));
    }

    #[test]
    fn provider_error_reads_as_declined() {
        let err = identity_from_callback(
            &params(&[("error", "UserInterrupt"), ("state", "s")]),
            "s",
            Duration::from_secs(60),
            Utc::now(),
        )
        .unwrap_err();
        assert!(err.to_string().contains(AUTH_ERR_DECLINED));
    }

    #[test]
    fn expiration_is_clamped_to_max_lifetime() {
        let now = Utc::now();
        let far_future = (now + chrono::Duration::days(30))
            .timestamp_nanos_opt()
            .unwrap()
            .to_string();
        let identity = identity_from_callback(
            &params(&[
                ("principal", USER),
                ("delegation", "d"),
                ("state", "s"),
                ("expiration", &far_future),
            ]),
            "s",
            Duration::from_secs(3600),
            now,
        )
        .unwrap();
        assert_eq!(identity.expires_at(), now + chrono::Duration::seconds(3600));
    }

    #[test]
    fn anonymous_principal_is_refused() {
        let err = identity_from_callback(
            &params(&[("principal", "2vxsx-fae"), ("delegation", "d"), ("state", "s")]),
            "s",
            Duration::from_secs(60),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, AuthError::ProviderFailed { .. }));
    }

    #[tokio::test]
    async fn store_round_trip_uses_private_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let store = DelegationStore::new(dir.path().join("nested").join("identity.json"));
        assert!(store.load().await.unwrap().is_none());

        let identity = DelegatedIdentity::new(
            Principal::from_text(USER).unwrap(),
            SecretString::from("delegation-blob"),
            Utc::now() + chrono::Duration::hours(1),
        );
        store.save(&identity).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.principal.to_text(), USER);
        assert_eq!(loaded.delegation, "delegation-blob");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        store.clear().await.unwrap();
        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resume_discards_expired_delegation() {
        let dir = tempfile::tempdir().unwrap();
        let provider = BrowserIdentityProvider::new(test_config(dir.path(), 0));

        let expired = DelegatedIdentity::new(
            Principal::from_text(USER).unwrap(),
            SecretString::from("old"),
            Utc::now() - chrono::Duration::minutes(1),
        );
        provider.store().save(&expired).await.unwrap();

        assert!(provider.resume_delegated().await.unwrap().is_none());
        assert!(!provider.store().path().exists());
    }

    #[tokio::test]
    async fn resume_returns_valid_delegation() {
        let dir = tempfile::tempdir().unwrap();
        let provider = BrowserIdentityProvider::new(test_config(dir.path(), 0));

        let valid = DelegatedIdentity::new(
            Principal::from_text(USER).unwrap(),
            SecretString::from("fresh"),
            Utc::now() + chrono::Duration::hours(2),
        );
        provider.store().save(&valid).await.unwrap();

        let resumed = provider.resume_delegated().await.unwrap().unwrap();
        assert_eq!(resumed.principal().to_text(), USER);

        provider.release_delegated().await.unwrap();
        assert!(provider.resume_delegated().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn round_trip_over_loopback_persists_identity() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let provider = BrowserIdentityProvider::new(test_config(dir.path(), port));

        let browser = tokio::spawn(async move {
            // A stray request first, as browsers do.
            let mut stray = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            stray
                .write_all(b"GET /favicon.ico HTTP/1.1\r\nHost: x\r\n\r\n")
                .await
                .unwrap();
            let mut ignored = Vec::new();
            stray.read_to_end(&mut ignored).await.unwrap();

            let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            let request = format!(
                "GET /callback?principal={USER}&delegation=blob&state=nonce HTTP/1.1\r\nHost: x\r\n\r\n"
            );
            stream.write_all(request.as_bytes()).await.unwrap();
            let mut response = String::new();
            stream.read_to_string(&mut response).await.unwrap();
            response
        });

        let identity = provider
            .complete_round_trip(listener, "nonce", Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(identity.principal().to_text(), USER);
        assert!(browser.await.unwrap().starts_with("HTTP/1.1 200 OK"));
        assert!(provider.store().load().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn idle_connection_does_not_block_the_callback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let waiting = tokio::spawn(async move { wait_for_callback(listener, CALLBACK_PATH).await });

        // Speculative preconnect that never sends a request.
        let _idle = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream
            .write_all(b"GET /callback?a=b HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));

        let params = tokio::time::timeout(REQUEST_READ_TIMEOUT / 2, waiting)
            .await
            .expect("callback should not wait for the idle connection")
            .unwrap()
            .unwrap();
        assert_eq!(params.get("a").map(String::as_str), Some("b"));
    }
}
