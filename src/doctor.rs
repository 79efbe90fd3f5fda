//! `picoclaw doctor` - active health diagnostics.
//!
//! Validates configuration and probes the backend, the wallet bridge and the
//! local identity state so problems surface before a login attempt.

use std::path::Path;

use chrono::Utc;

use crate::backend::HttpConnector;
use crate::config::Config;
use crate::identity::{BridgeWallet, DelegationStore};

/// Run diagnostic checks and print results.
pub async fn run_doctor_command(config_path: Option<&Path>, strict: bool) -> anyhow::Result<()> {
    println!("PicoClaw Doctor");
    println!("===============\n");

    let mut passed = 0u32;
    let mut failed = 0u32;

    let config = Config::load(config_path);
    check(
        "Configuration",
        match &config {
            Ok(config) => CheckResult::Pass(format!(
                "backend {} (service {})",
                config.backend.url, config.backend.service_id
            )),
            Err(e) => CheckResult::Fail(e.to_string()),
        },
        &mut passed,
        &mut failed,
    );

    check(
        "Home directory",
        check_home_dir(),
        &mut passed,
        &mut failed,
    );

    match &config {
        Ok(config) => {
            let (backend, wallet, identity) = futures::join!(
                check_backend(config),
                check_wallet_bridge(config),
                check_stored_identity(&config.identity.session_path),
            );
            check("Backend reachability", backend, &mut passed, &mut failed);
            check("Wallet bridge", wallet, &mut passed, &mut failed);
            check("Stored identity", identity, &mut passed, &mut failed);
            check(
                "Login callback port",
                check_callback_port(config.identity.callback_port),
                &mut passed,
                &mut failed,
            );
        }
        Err(_) => {
            for name in [
                "Backend reachability",
                "Wallet bridge",
                "Stored identity",
                "Login callback port",
            ] {
                check(
                    name,
                    CheckResult::Skip("configuration is invalid".to_string()),
                    &mut passed,
                    &mut failed,
                );
            }
        }
    }

    println!();
    println!("  {passed} passed, {failed} failed");

    if failed > 0 {
        println!("\n  Some checks failed. Login or task submission may not work until they are fixed.");
        if strict {
            anyhow::bail!("doctor strict mode failed with {failed} check(s)");
        }
    }

    Ok(())
}

// ── Individual checks ───────────────────────────────────────

fn check(name: &str, result: CheckResult, passed: &mut u32, failed: &mut u32) {
    match result {
        CheckResult::Pass(detail) => {
            *passed += 1;
            println!("  [pass] {name}: {detail}");
        }
        CheckResult::Fail(detail) => {
            *failed += 1;
            println!("  [FAIL] {name}: {detail}");
        }
        CheckResult::Skip(reason) => {
            println!("  [skip] {name}: {reason}");
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum CheckResult {
    Pass(String),
    Fail(String),
    Skip(String),
}

fn check_home_dir() -> CheckResult {
    match crate::bootstrap::ensure_picoclaw_home() {
        Ok(path) => CheckResult::Pass(format!("{}", path.display())),
        Err(e) => CheckResult::Fail(format!("cannot create home directory: {e}")),
    }
}

async fn check_backend(config: &Config) -> CheckResult {
    let connector = HttpConnector::new(&config.backend);
    match connector.health().await {
        Ok(body) if body.trim().is_empty() => {
            CheckResult::Pass(format!("{} is up", connector.base_url()))
        }
        Ok(body) => CheckResult::Pass(format!("{} is up ({})", connector.base_url(), body.trim())),
        Err(e) => CheckResult::Fail(format!("{e}; check PICOCLAW_BACKEND_URL")),
    }
}

async fn check_wallet_bridge(config: &Config) -> CheckResult {
    let Some(url) = &config.wallet.bridge_url else {
        return CheckResult::Skip("PICOCLAW_WALLET_BRIDGE_URL not set".to_string());
    };

    let wallet = BridgeWallet::new(url.clone(), config.backend.call_timeout);
    match wallet.status().await {
        Ok(status) => match status.principal {
            Some(principal) if status.connected => {
                CheckResult::Pass(format!("{url} connected as {principal}"))
            }
            _ => CheckResult::Pass(format!("{url} reachable, not connected")),
        },
        Err(e) => CheckResult::Fail(e.user_message()),
    }
}

async fn check_stored_identity(path: &Path) -> CheckResult {
    let store = DelegationStore::new(path);
    match store.load().await {
        Ok(None) => CheckResult::Skip("no stored session, use /login".to_string()),
        Ok(Some(stored)) if stored.expires_at <= Utc::now() => CheckResult::Fail(format!(
            "delegation for {} expired at {}; log in again",
            stored.principal,
            stored.expires_at.format("%Y-%m-%d %H:%M UTC")
        )),
        Ok(Some(stored)) => CheckResult::Pass(format!(
            "{} until {}",
            stored.principal,
            stored.expires_at.format("%Y-%m-%d %H:%M UTC")
        )),
        Err(e) => CheckResult::Fail(format!("{}: {}", store.path().display(), e.user_message())),
    }
}

fn check_callback_port(port: u16) -> CheckResult {
    let bind_addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
    match std::net::TcpListener::bind(bind_addr) {
        Ok(listener) => {
            drop(listener);
            CheckResult::Pass(format!("port {port} is available"))
        }
        Err(error) => CheckResult::Fail(format!(
            "port {port} is unavailable ({error}); free the port or change PICOCLAW_CALLBACK_PORT"
        )),
    }
}
