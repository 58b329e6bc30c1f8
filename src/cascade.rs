use std::sync::Arc;

use log::{info, warn};

use crate::identity::IdentityDirectory;
use crate::repo::{Repo, RepoError, RepoResult};
use crate::storage::{discard_photo, PhotoStore};

/// Removes a post's or user's entire dependent graph.
///
/// Every step is idempotent, so a cascade that fails partway can be retried
/// from the top: deleting already-deleted records is a no-op and counter
/// triggers on missing posts fall through silently.
pub struct DeletionOrchestrator {
    repo: Arc<dyn Repo>,
    photos: Arc<dyn PhotoStore>,
    identity: Arc<dyn IdentityDirectory>,
}

impl DeletionOrchestrator {
    pub fn new(
        repo: Arc<dyn Repo>,
        photos: Arc<dyn PhotoStore>,
        identity: Arc<dyn IdentityDirectory>,
    ) -> Self {
        Self { repo, photos, identity }
    }

    /// Delete a post and everything hanging off it. The post document goes
    /// first so nothing new can attach to it while the fan-out runs.
    /// Tolerates a missing post document: a retried cascade still sweeps the
    /// dependents.
    pub async fn delete_post(&self, post_id: &str) -> RepoResult<()> {
        let photo = match self.repo.get_post(post_id).await {
            Ok(post) => post.photo,
            Err(RepoError::NotFound) => None,
            Err(e) => return Err(e),
        };
        self.repo.delete_post_doc(post_id).await?;
        self.repo.delete_reactions_by_post(post_id).await?;
        self.repo.delete_comments_by_post(post_id).await?;
        if let Some(photo) = photo {
            discard_photo(self.photos.as_ref(), &photo).await;
        }
        Ok(())
    }

    /// Delete an account and its entire footprint. Ordering is load-bearing:
    /// identity revocation comes last, so a crash mid-cascade leaves an
    /// account that can still authenticate and retry, never one that is
    /// orphaned beyond cleanup.
    pub async fn delete_user(&self, user_id: &str) -> RepoResult<()> {
        // Tolerates a missing profile record so a cascade that crashed after
        // deleting it can still be retried to completion.
        let photo = match self.repo.get_user(user_id).await {
            Ok(user) => user.photo,
            Err(RepoError::NotFound) => None,
            Err(e) => return Err(e),
        };
        if let Some(photo) = &photo {
            discard_photo(self.photos.as_ref(), photo).await;
        }
        for post in self.repo.find_posts_by_user(user_id).await? {
            self.delete_post(&post.id).await?;
        }
        // decrements parents of the user's replies in the same batches
        self.repo.delete_comments_by_user(user_id).await?;
        self.repo.delete_reactions_by_user(user_id).await?;
        self.repo.delete_user_doc(user_id).await?;
        self.identity
            .revoke(user_id)
            .await
            .map_err(|e| {
                warn!("identity revocation failed for {user_id}: {e}");
                RepoError::Unavailable
            })?;
        info!("user {user_id} deleted");
        Ok(())
    }
}
