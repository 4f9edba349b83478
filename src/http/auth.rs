//! Bearer/API-key authentication (spec §4.7 "Auth"): SHA256-hashed tokens
//! in a 0600 file, checked on every request but `/api/health`.
//!
//! Tokens here don't expire or carry a project id — this server has one
//! tenant (the local operator) and a single pool of valid tokens; the
//! first boot with an empty store mints one at random.

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Default, Serialize, Deserialize)]
struct TokenStorage {
    token_hashes: HashSet<String>,
}

pub struct TokenManager {
    storage_path: PathBuf,
    tokens: RwLock<TokenStorage>,
}

impl TokenManager {
    /// Loads (or creates) the token store at `storage_path`, minting a
    /// random 256-bit token and persisting it if the store is empty
    /// (spec §4.7: "if empty at startup a random 256-bit token is
    /// generated and stored").
    pub async fn load_or_bootstrap(storage_path: PathBuf) -> anyhow::Result<(Arc<Self>, Option<String>)> {
        if let Some(parent) = storage_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let storage = if storage_path.exists() {
            let content = std::fs::read_to_string(&storage_path)?;
            if content.trim().is_empty() {
                TokenStorage::default()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            TokenStorage::default()
        };

        let manager = Arc::new(Self { storage_path, tokens: RwLock::new(storage) });

        let minted = if manager.tokens.read().await.token_hashes.is_empty() {
            let token = generate_token();
            manager.add_token(&token).await?;
            info!("no API tokens configured; generated one and stored it");
            Some(token)
        } else {
            None
        };

        manager.set_secure_permissions()?;
        Ok((manager, minted))
    }

    pub async fn add_token(&self, token: &str) -> anyhow::Result<()> {
        let hash = hash_token(token);
        self.tokens.write().await.token_hashes.insert(hash);
        self.persist().await
    }

    pub async fn is_valid(&self, token: &str) -> bool {
        self.tokens.read().await.token_hashes.contains(&hash_token(token))
    }

    async fn persist(&self) -> anyhow::Result<()> {
        let storage = self.tokens.read().await;
        let json = serde_json::to_string_pretty(&*storage)?;
        std::fs::write(&self.storage_path, json)?;
        self.set_secure_permissions()?;
        Ok(())
    }

    #[cfg(unix)]
    fn set_secure_permissions(&self) -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        if !self.storage_path.exists() {
            return Ok(());
        }
        let mut perms = std::fs::metadata(&self.storage_path)?.permissions();
        perms.set_mode(0o600);
        std::fs::set_permissions(&self.storage_path, perms)?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn set_secure_permissions(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[derive(Serialize)]
struct AuthErrorBody {
    error: String,
}

fn unauthorized(msg: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(AuthErrorBody { error: msg.to_string() })).into_response()
}

/// Extracts the caller's credential from `X-API-Key` or
/// `Authorization: Bearer <token>`, whichever is present (spec §4.7).
pub(crate) fn extract_credential(request: &Request) -> Option<String> {
    if let Some(key) = request.headers().get("X-API-Key").and_then(|v| v.to_str().ok()) {
        return Some(key.to_string());
    }
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.to_string())
}

pub async fn require_auth(
    State(token_manager): State<Arc<TokenManager>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(credential) = extract_credential(&request) else {
        return unauthorized("missing X-API-Key or Authorization: Bearer <token>");
    };
    if !token_manager.is_valid(&credential).await {
        warn!("rejected request with invalid API token");
        return unauthorized("invalid API token");
    }
    next.run(request).await
}

#[allow(dead_code)]
pub fn storage_path(control_root: &Path) -> PathBuf {
    control_root.join("tokens.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn bootstraps_a_token_when_store_is_empty() {
        let dir = tempdir().unwrap();
        let (manager, minted) =
            TokenManager::load_or_bootstrap(dir.path().join("tokens.json")).await.unwrap();
        let token = minted.expect("should mint a token on first boot");
        assert!(manager.is_valid(&token).await);
        assert!(!manager.is_valid("not-the-token").await);
    }

    #[tokio::test]
    async fn persists_across_reloads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let (manager, minted) = TokenManager::load_or_bootstrap(path.clone()).await.unwrap();
        let token = minted.unwrap();
        drop(manager);

        let (reloaded, minted_again) = TokenManager::load_or_bootstrap(path).await.unwrap();
        assert!(minted_again.is_none(), "should not mint a second token once one exists");
        assert!(reloaded.is_valid(&token).await);
    }
}
