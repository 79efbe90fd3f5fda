//! Bootstrap helpers for PicoClaw.
//!
//! Resolves the client's home directory and loads `.env` files before any
//! configuration is read.
//!
//! File: `~/.picoclaw/.env` (standard dotenvy format)

use std::path::PathBuf;

/// Base directory for client state: `~/.picoclaw`.
pub fn picoclaw_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".picoclaw")
}

/// Path to the PicoClaw-specific `.env` file: `~/.picoclaw/.env`.
pub fn picoclaw_env_path() -> PathBuf {
    picoclaw_home().join(".env")
}

/// Load env vars from `./.env` and then `~/.picoclaw/.env`.
///
/// dotenvy never overwrites existing env vars, so the effective priority is:
///
///   explicit env vars > `./.env` > `~/.picoclaw/.env`
pub fn load_picoclaw_env() {
    let _ = dotenvy::dotenv();

    let path = picoclaw_env_path();
    if path.exists() {
        let _ = dotenvy::from_path(&path);
    }
}

/// Create `~/.picoclaw` if needed, returning its path.
pub fn ensure_picoclaw_home() -> std::io::Result<PathBuf> {
    let home = picoclaw_home();
    std::fs::create_dir_all(&home)?;
    Ok(home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_path_is_under_home() {
        let path = picoclaw_env_path();
        assert!(path.ends_with(".picoclaw/.env"));
    }
}
