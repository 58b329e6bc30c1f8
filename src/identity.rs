use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity directory unavailable: {0}")]
    Unavailable(String),
}

/// Boundary to the external authentication directory. The only operation the
/// core needs is revocation, invoked strictly last in the account-deletion
/// cascade so a half-finished cascade can still authenticate and retry.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn revoke(&self, uid: &str) -> Result<(), IdentityError>;
}

/// HTTP client against the directory service (`IDENTITY_URL`).
pub struct HttpIdentityDirectory {
    base_url: String,
    client: reqwest::Client,
}

impl HttpIdentityDirectory {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl IdentityDirectory for HttpIdentityDirectory {
    async fn revoke(&self, uid: &str) -> Result<(), IdentityError> {
        let url = format!("{}/users/{}", self.base_url.trim_end_matches('/'), uid);
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| IdentityError::Unavailable(e.to_string()))?;
        // 404 means the identity is already gone; revocation retries must be
        // idempotent
        if resp.status().is_success() || resp.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(IdentityError::Unavailable(format!(
                "revoke {uid}: directory answered {}",
                resp.status()
            )))
        }
    }
}

/// Degraded stand-in when no directory is configured: logs and carries on,
/// so local setups without an identity service still work end to end.
pub struct UnconfiguredIdentityDirectory;

#[async_trait]
impl IdentityDirectory for UnconfiguredIdentityDirectory {
    async fn revoke(&self, uid: &str) -> Result<(), IdentityError> {
        warn!("IDENTITY_URL not set; skipping identity revocation for {uid}");
        Ok(())
    }
}

pub fn build_identity_directory() -> Arc<dyn IdentityDirectory> {
    match std::env::var("IDENTITY_URL") {
        Ok(url) if !url.trim().is_empty() => {
            info!("identity directory at {url}");
            Arc::new(HttpIdentityDirectory::new(url))
        }
        _ => Arc::new(UnconfiguredIdentityDirectory),
    }
}
