//! Courier Node -- library crate for the delivery pipeline.
//!
//! Re-exports all internal modules so integration tests and main.rs can
//! wire the edge layer, relay, consumer and push router.

pub mod bus;
pub mod config;
pub mod delivery_consumer;
pub mod edge;
pub mod fanout;
pub mod ingest_client;
pub mod membership;
pub mod outbox_relay;
pub mod presence;
pub mod push_channel;
pub mod push_router;
pub mod runtime;

use std::path::{Path, PathBuf};

use rand::Rng;
use sha2::{Digest, Sha256};

const API_TOKEN_LEN: usize = 48;

/// Resolve a leading `~/` against `$HOME`. Other paths pass through.
pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(path),
    }
}

/// Read the node API bearer token, generating one on first start.
/// An empty token file is treated as missing.
pub fn load_or_create_token(path: &Path) -> anyhow::Result<String> {
    if path.exists() {
        let token = std::fs::read_to_string(path)?.trim().to_string();
        if !token.is_empty() {
            return Ok(token);
        }
        tracing::warn!(path = %path.display(), "api token file empty, regenerating");
    }

    let token: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(API_TOKEN_LEN)
        .map(char::from)
        .collect();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, &token)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::info!(path = %path.display(), "generated api bearer token");
    Ok(token)
}

/// Hex SHA-256 of a client token, as stored in `edge.tokens`.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_token_known_vector() {
        assert_eq!(
            hash_token("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_token_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("node-token");
        let first = load_or_create_token(&path).unwrap();
        assert_eq!(first.len(), API_TOKEN_LEN);
        let second = load_or_create_token(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_token_file_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node-token");
        std::fs::write(&path, "  \n").unwrap();
        let token = load_or_create_token(&path).unwrap();
        assert_eq!(token.len(), API_TOKEN_LEN);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), token);
    }

    #[test]
    fn test_expand_tilde_passthrough() {
        assert_eq!(expand_tilde("/etc/courier.toml"), PathBuf::from("/etc/courier.toml"));
    }
}
