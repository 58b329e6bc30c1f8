use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;

use crate::models::*;

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("not found")] NotFound,
    #[error("forbidden")] Forbidden,
    #[error("invalid hierarchy")] InvalidHierarchy,
    #[error("invalid state")] InvalidState,
    #[error("conflict")] Conflict,
    #[error("unavailable")] Unavailable,
}

pub type RepoResult<T> = Result<T, RepoError>;

/// Content written over a tombstoned comment.
pub const TOMBSTONE_CONTENT: &str = "[Comment deleted]";

/// Hard ceiling on mutations per write batch. Bulk fan-outs must split and
/// flush at this boundary.
pub const MAX_BATCH_OPS: usize = 512;

/// Post counter field targeted by a trigger adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterField {
    Likes,
    Dislikes,
    Comments,
}

/// Change events emitted by the store on the reactions/comments collections,
/// consumed by the counter worker. Each event carries everything the counter
/// adjustment needs, so the worker never re-reads a deleted source document.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    ReactionCreated { post_id: Id, kind: ReactionType },
    ReactionSwitched { post_id: Id, from: ReactionType, to: ReactionType },
    ReactionDeleted { post_id: Id, kind: ReactionType },
    CommentCreated { post_id: Id, top_level: bool },
    CommentDeleted { post_id: Id, top_level: bool },
}

use async_trait::async_trait;

#[async_trait]
pub trait PostRepo: Send + Sync {
    async fn create_post(
        &self,
        user_id: &str,
        new: NewPost,
        author: Option<AuthorSnapshot>,
    ) -> RepoResult<Post>;
    async fn get_post(&self, id: &str) -> RepoResult<Post>;
    async fn list_posts(
        &self,
        limit: usize,
        cursor: Option<&str>,
        order: PostOrder,
    ) -> RepoResult<Page<Post>>;
    async fn list_posts_by_user(
        &self,
        user_id: &str,
        limit: usize,
        cursor: Option<&str>,
        order: PostOrder,
    ) -> RepoResult<Page<Post>>;
    async fn update_post(&self, id: &str, caller_id: &str, upd: UpdatePost) -> RepoResult<Post>;
    /// Removes the bare post document. Idempotent; counters and dependents
    /// are the cascade orchestrator's business.
    async fn delete_post_doc(&self, id: &str) -> RepoResult<()>;
    /// Every post authored by the user, for the account-deletion cascade.
    async fn find_posts_by_user(&self, user_id: &str) -> RepoResult<Vec<Post>>;
    /// Guarded atomic read-modify-write of the post's counter fields: all
    /// deltas apply in one atomic unit; a missing post is a silent no-op.
    async fn adjust_counters(
        &self,
        id: &str,
        deltas: &[(CounterField, i64)],
    ) -> RepoResult<()>;
    /// Batched fan-out rewrite of the embedded author snapshot.
    async fn update_author_in_posts(&self, user_id: &str, patch: &AuthorPatch) -> RepoResult<()>;
}

#[async_trait]
pub trait CommentRepo: Send + Sync {
    async fn get_comment(&self, id: &str) -> RepoResult<Comment>;
    async fn list_top_level(
        &self,
        post_id: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> RepoResult<Page<Comment>>;
    async fn list_replies(
        &self,
        parent_id: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> RepoResult<Page<Comment>>;
    async fn create_comment(&self, new: NewComment) -> RepoResult<Comment>;
    async fn update_comment(&self, id: &str, caller_id: &str, content: String)
        -> RepoResult<Comment>;
    /// Soft-deletes when the comment still has replies, hard-deletes
    /// otherwise (decrementing the parent's reply count in the same unit).
    async fn remove_comment(&self, id: &str, caller_id: &str) -> RepoResult<()>;
    async fn delete_comments_by_post(&self, post_id: &str) -> RepoResult<()>;
    async fn delete_comments_by_user(&self, user_id: &str) -> RepoResult<()>;
    async fn update_author_in_comments(
        &self,
        user_id: &str,
        patch: &AuthorPatch,
    ) -> RepoResult<()>;
}

#[async_trait]
pub trait ReactionRepo: Send + Sync {
    /// Toggle protocol: same type twice removes the reaction, a different
    /// type replaces it in place. One atomic unit; never fails on absence.
    async fn toggle_reaction(
        &self,
        user_id: &str,
        post_id: &str,
        kind: ReactionType,
    ) -> RepoResult<ReactOutcome>;
    /// Unconditional removal; no-op when no reaction exists.
    async fn remove_reaction(&self, user_id: &str, post_id: &str) -> RepoResult<()>;
    async fn get_reaction(&self, user_id: &str, post_id: &str) -> RepoResult<Option<Reaction>>;
    /// The viewer's reactions across one page of post ids.
    async fn find_reactions_for_posts(
        &self,
        user_id: &str,
        post_ids: &[Id],
    ) -> RepoResult<Vec<Reaction>>;
    async fn delete_reactions_by_post(&self, post_id: &str) -> RepoResult<()>;
    async fn delete_reactions_by_user(&self, user_id: &str) -> RepoResult<()>;
}

#[async_trait]
pub trait UserRepo: Send + Sync {
    async fn get_user(&self, id: &str) -> RepoResult<User>;
    /// Create-if-missing from verified identity claims; an existing record
    /// only has `email_verified` upgraded, never downgraded.
    async fn ensure_user(&self, user: User) -> RepoResult<User>;
    async fn update_user(&self, id: &str, upd: UpdateUser) -> RepoResult<User>;
    async fn delete_user_doc(&self, id: &str) -> RepoResult<()>;
}

pub trait Repo: PostRepo + CommentRepo + ReactionRepo + UserRepo {}

impl<T> Repo for T where T: PostRepo + CommentRepo + ReactionRepo + UserRepo {}

pub mod inmem {
    use super::*;
    use futures_util::future::join_all;
    use serde::{Deserialize, Serialize};
    use std::path::{Path, PathBuf};
    use tokio::sync::mpsc::UnboundedSender;

    const SNAPSHOT_PATH: &str = "data/state.json";

    #[derive(Default, Serialize, Deserialize)]
    struct State {
        posts: HashMap<Id, Post>,
        comments: HashMap<Id, Comment>,
        // keyed by the composite "{user_id}_{post_id}" doc id
        reactions: HashMap<String, Reaction>,
        users: HashMap<Id, User>,
    }

    /// In-memory document store with JSON snapshot persistence. Every method
    /// is one atomic unit (a single lock scope); bulk operations go through
    /// [`MAX_BATCH_OPS`]-capped write batches like the reference store.
    #[derive(Clone)]
    pub struct InMemRepo {
        state: Arc<RwLock<State>>,
        snapshot_path: Arc<PathBuf>,
        events: Option<UnboundedSender<StoreEvent>>,
    }

    /// One mutation inside a write batch.
    enum BatchOp {
        DeleteComment(Id),
        // guarded: no-op when the parent died earlier in the same sweep
        DecrementReplyCount(Id),
        DeleteReaction(String),
        PatchCommentAuthor {
            id: Id,
            username: Option<String>,
            photo: Option<Option<String>>,
        },
        PatchPostAuthor {
            id: Id,
            patch: AuthorPatch,
        },
    }

    impl InMemRepo {
        fn data_dir() -> PathBuf {
            std::env::var("SONET_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data"))
        }

        fn snapshot_path() -> PathBuf {
            if std::env::var("SONET_DATA_DIR").is_ok() {
                let mut p = Self::data_dir();
                p.push("state.json");
                p
            } else {
                PathBuf::from(SNAPSHOT_PATH)
            }
        }

        fn load_state_from(path: &Path) -> State {
            match std::fs::read(path) {
                Ok(bytes) => match serde_json::from_slice::<State>(&bytes) {
                    Ok(s) => {
                        log::info!("[inmem] loaded snapshot '{}'", path.display());
                        s
                    }
                    Err(e) => {
                        log::warn!(
                            "[inmem] failed to parse snapshot '{}': {e}; starting empty",
                            path.display()
                        );
                        State::default()
                    }
                },
                Err(_) => State::default(),
            }
        }

        fn persist(&self) {
            let path = self.snapshot_path.clone();
            if let Ok(s) = serde_json::to_vec_pretty(&*self.state.read().unwrap()) {
                if let Some(dir) = path.parent() {
                    let _ = std::fs::create_dir_all(dir);
                }
                if let Err(e) = std::fs::write(&*path, s) {
                    log::warn!("[inmem] failed to write snapshot '{}': {e}", path.display());
                }
            }
        }

        pub fn new() -> Self {
            let snapshot_path = Self::snapshot_path();
            let state = Self::load_state_from(&snapshot_path);
            Self {
                state: Arc::new(RwLock::new(state)),
                snapshot_path: Arc::new(snapshot_path),
                events: None,
            }
        }

        /// Attach the change-event channel feeding the counter worker.
        pub fn with_events(mut self, tx: UnboundedSender<StoreEvent>) -> Self {
            self.events = Some(tx);
            self
        }

        fn new_id() -> Id {
            uuid::Uuid::new_v4().simple().to_string()
        }

        // Events fire after the atomic unit commits, like store triggers.
        fn emit(&self, events: Vec<StoreEvent>) {
            if let Some(tx) = &self.events {
                for ev in events {
                    // a closed channel just means the worker is gone (shutdown)
                    let _ = tx.send(ev);
                }
            }
        }

        /// Cursor protocol over an already-ordered collection: start after
        /// the cursor doc, keep `limit`, `has_more` when more remained.
        /// An unknown cursor (doc deleted at the boundary) restarts from the
        /// top; accepted edge case of id-based cursors.
        fn paginate<T, F>(mut sorted: Vec<T>, limit: usize, cursor: Option<&str>, id_of: F) -> Page<T>
        where
            F: Fn(&T) -> &str,
        {
            if let Some(cur) = cursor {
                if let Some(pos) = sorted.iter().position(|t| id_of(t) == cur) {
                    sorted.drain(..=pos);
                }
            }
            let has_more = sorted.len() > limit;
            sorted.truncate(limit);
            let next_cursor = if has_more {
                sorted.last().map(|t| id_of(t).to_string())
            } else {
                None
            };
            Page { items: sorted, next_cursor, has_more }
        }

        /// Applies a batch as one atomic unit, then emits events for the
        /// documents it actually removed.
        async fn commit_batch(&self, ops: Vec<BatchOp>) -> RepoResult<()> {
            debug_assert!(ops.len() <= MAX_BATCH_OPS);
            let mut events = Vec::new();
            {
                let mut s = self.state.write().unwrap();
                for op in ops {
                    match op {
                        BatchOp::DeleteComment(id) => {
                            if let Some(c) = s.comments.remove(&id) {
                                events.push(StoreEvent::CommentDeleted {
                                    post_id: c.post_id,
                                    top_level: c.parent_id.is_none(),
                                });
                            }
                        }
                        BatchOp::DecrementReplyCount(id) => {
                            if let Some(parent) = s.comments.get_mut(&id) {
                                parent.reply_count -= 1;
                            }
                        }
                        BatchOp::DeleteReaction(doc_id) => {
                            if let Some(r) = s.reactions.remove(&doc_id) {
                                events.push(StoreEvent::ReactionDeleted {
                                    post_id: r.post_id,
                                    kind: r.kind,
                                });
                            }
                        }
                        BatchOp::PatchCommentAuthor { id, username, photo } => {
                            if let Some(c) = s.comments.get_mut(&id) {
                                if let Some(u) = username {
                                    c.author_username = u;
                                }
                                if let Some(p) = photo {
                                    c.author_photo = p;
                                }
                            }
                        }
                        BatchOp::PatchPostAuthor { id, patch } => {
                            if let Some(post) = s.posts.get_mut(&id) {
                                if let Some(snap) = post.user.as_mut() {
                                    if let Some(n) = &patch.name {
                                        snap.name = n.clone();
                                    }
                                    if let Some(sn) = &patch.surname {
                                        snap.surname = sn.clone();
                                    }
                                    // posts only ever replace the photo,
                                    // never clear it (matches the snapshot
                                    // write rules on the posts collection)
                                    if let Some(Some(p)) = &patch.photo {
                                        snap.photo = Some(p.clone());
                                    }
                                }
                            }
                        }
                    }
                }
            }
            self.persist();
            self.emit(events);
            Ok(())
        }

        /// Flush-and-reopen splitting loop: packs op groups into batches of
        /// at most [`MAX_BATCH_OPS`], flushing before a group that would
        /// overflow so a group (e.g. delete + parent decrement) never
        /// straddles a batch boundary. All partial batches are awaited
        /// before returning.
        async fn run_batched(&self, groups: Vec<Vec<BatchOp>>) -> RepoResult<()> {
            let mut pending = Vec::new();
            let mut batch: Vec<BatchOp> = Vec::new();
            for group in groups {
                if !batch.is_empty() && batch.len() + group.len() > MAX_BATCH_OPS {
                    pending.push(self.commit_batch(std::mem::take(&mut batch)));
                }
                batch.extend(group);
            }
            if !batch.is_empty() {
                pending.push(self.commit_batch(batch));
            }
            for res in join_all(pending).await {
                res?;
            }
            Ok(())
        }
    }

    impl Default for InMemRepo {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl PostRepo for InMemRepo {
        async fn create_post(
            &self,
            user_id: &str,
            new: NewPost,
            author: Option<AuthorSnapshot>,
        ) -> RepoResult<Post> {
            let now = Utc::now();
            let post = Post {
                id: Self::new_id(),
                user_id: user_id.to_string(),
                title: new.title,
                text: new.text,
                photo: new.photo,
                user: author,
                created_at: now,
                updated_at: now,
                likes_count: 0,
                dislikes_count: 0,
                comments_count: 0,
            };
            let mut s = self.state.write().unwrap();
            s.posts.insert(post.id.clone(), post.clone());
            drop(s);
            self.persist();
            Ok(post)
        }

        async fn get_post(&self, id: &str) -> RepoResult<Post> {
            let s = self.state.read().unwrap();
            s.posts.get(id).cloned().ok_or(RepoError::NotFound)
        }

        async fn list_posts(
            &self,
            limit: usize,
            cursor: Option<&str>,
            order: PostOrder,
        ) -> RepoResult<Page<Post>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<_> = s.posts.values().cloned().collect();
            drop(s);
            sort_posts(&mut v, order);
            Ok(Self::paginate(v, limit, cursor, |p| &p.id))
        }

        async fn list_posts_by_user(
            &self,
            user_id: &str,
            limit: usize,
            cursor: Option<&str>,
            order: PostOrder,
        ) -> RepoResult<Page<Post>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<_> = s
                .posts
                .values()
                .filter(|p| p.user_id == user_id)
                .cloned()
                .collect();
            drop(s);
            sort_posts(&mut v, order);
            Ok(Self::paginate(v, limit, cursor, |p| &p.id))
        }

        async fn update_post(&self, id: &str, caller_id: &str, upd: UpdatePost) -> RepoResult<Post> {
            let mut s = self.state.write().unwrap();
            let post = s.posts.get_mut(id).ok_or(RepoError::NotFound)?;
            if post.user_id != caller_id {
                return Err(RepoError::Forbidden);
            }
            if let Some(title) = upd.title {
                post.title = title;
            }
            if let Some(text) = upd.text {
                post.text = text;
            }
            if let Some(photo) = upd.photo {
                post.photo = Some(photo);
            }
            post.updated_at = Utc::now();
            let updated = post.clone();
            drop(s);
            self.persist();
            Ok(updated)
        }

        async fn delete_post_doc(&self, id: &str) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            s.posts.remove(id);
            drop(s);
            self.persist();
            Ok(())
        }

        async fn find_posts_by_user(&self, user_id: &str) -> RepoResult<Vec<Post>> {
            let s = self.state.read().unwrap();
            Ok(s.posts.values().filter(|p| p.user_id == user_id).cloned().collect())
        }

        async fn adjust_counters(
            &self,
            id: &str,
            deltas: &[(CounterField, i64)],
        ) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            // a post deleted before its trigger lands is a silent no-op
            let Some(post) = s.posts.get_mut(id) else {
                return Ok(());
            };
            for (field, delta) in deltas {
                match field {
                    CounterField::Likes => post.likes_count += delta,
                    CounterField::Dislikes => post.dislikes_count += delta,
                    CounterField::Comments => post.comments_count += delta,
                }
            }
            drop(s);
            self.persist();
            Ok(())
        }

        async fn update_author_in_posts(
            &self,
            user_id: &str,
            patch: &AuthorPatch,
        ) -> RepoResult<()> {
            if patch.is_empty() {
                return Ok(());
            }
            let targets: Vec<Id> = {
                let s = self.state.read().unwrap();
                s.posts
                    .values()
                    .filter(|p| p.user_id == user_id)
                    .map(|p| p.id.clone())
                    .collect()
            };
            let groups = targets
                .into_iter()
                .map(|id| vec![BatchOp::PatchPostAuthor { id, patch: patch.clone() }])
                .collect();
            self.run_batched(groups).await
        }
    }

    #[async_trait]
    impl CommentRepo for InMemRepo {
        async fn get_comment(&self, id: &str) -> RepoResult<Comment> {
            let s = self.state.read().unwrap();
            s.comments.get(id).cloned().ok_or(RepoError::NotFound)
        }

        async fn list_top_level(
            &self,
            post_id: &str,
            limit: usize,
            cursor: Option<&str>,
        ) -> RepoResult<Page<Comment>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<_> = s
                .comments
                .values()
                .filter(|c| c.post_id == post_id && c.parent_id.is_none())
                .cloned()
                .collect();
            drop(s);
            // newest activity first
            v.sort_by(|a, b| {
                b.created_at
                    .cmp(&a.created_at)
                    .then_with(|| b.id.cmp(&a.id))
            });
            Ok(Self::paginate(v, limit, cursor, |c| &c.id))
        }

        async fn list_replies(
            &self,
            parent_id: &str,
            limit: usize,
            cursor: Option<&str>,
        ) -> RepoResult<Page<Comment>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<_> = s
                .comments
                .values()
                .filter(|c| c.parent_id.as_deref() == Some(parent_id))
                .cloned()
                .collect();
            drop(s);
            // chronological reading order, opposite of top-level
            v.sort_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.id.cmp(&b.id))
            });
            Ok(Self::paginate(v, limit, cursor, |c| &c.id))
        }

        async fn create_comment(&self, new: NewComment) -> RepoResult<Comment> {
            let now = Utc::now();
            let mut s = self.state.write().unwrap();
            if !s.posts.contains_key(&new.post_id) {
                return Err(RepoError::NotFound);
            }
            if let Some(parent_id) = &new.parent_id {
                let parent = s.comments.get(parent_id).ok_or(RepoError::NotFound)?;
                if parent.parent_id.is_some() {
                    return Err(RepoError::InvalidHierarchy);
                }
            }
            let comment = Comment {
                id: Self::new_id(),
                post_id: new.post_id,
                author_id: new.author_id,
                author_username: new.author_username,
                author_photo: new.author_photo,
                content: new.content,
                parent_id: new.parent_id,
                reply_count: 0,
                is_deleted: false,
                created_at: now,
                updated_at: now,
            };
            s.comments.insert(comment.id.clone(), comment.clone());
            // reply-count bump rides in the same atomic unit as the reply
            if let Some(parent_id) = comment.parent_id.clone() {
                if let Some(parent) = s.comments.get_mut(&parent_id) {
                    parent.reply_count += 1;
                }
            }
            drop(s);
            self.persist();
            self.emit(vec![StoreEvent::CommentCreated {
                post_id: comment.post_id.clone(),
                top_level: comment.parent_id.is_none(),
            }]);
            Ok(comment)
        }

        async fn update_comment(
            &self,
            id: &str,
            caller_id: &str,
            content: String,
        ) -> RepoResult<Comment> {
            let mut s = self.state.write().unwrap();
            let comment = s.comments.get_mut(id).ok_or(RepoError::NotFound)?;
            if comment.author_id != caller_id {
                return Err(RepoError::Forbidden);
            }
            if comment.is_deleted {
                return Err(RepoError::InvalidState);
            }
            comment.content = content;
            comment.updated_at = Utc::now();
            let updated = comment.clone();
            drop(s);
            self.persist();
            Ok(updated)
        }

        async fn remove_comment(&self, id: &str, caller_id: &str) -> RepoResult<()> {
            let mut events = Vec::new();
            {
                let mut s = self.state.write().unwrap();
                let comment = s.comments.get(id).cloned().ok_or(RepoError::NotFound)?;
                if comment.author_id != caller_id {
                    return Err(RepoError::Forbidden);
                }
                if comment.reply_count > 0 {
                    // tombstone: replies keep a valid parent to point at
                    if let Some(c) = s.comments.get_mut(id) {
                        c.is_deleted = true;
                        c.content = TOMBSTONE_CONTENT.to_string();
                        c.updated_at = Utc::now();
                    }
                } else {
                    s.comments.remove(id);
                    if let Some(parent_id) = &comment.parent_id {
                        if let Some(parent) = s.comments.get_mut(parent_id) {
                            parent.reply_count -= 1;
                        }
                    }
                    events.push(StoreEvent::CommentDeleted {
                        post_id: comment.post_id,
                        top_level: comment.parent_id.is_none(),
                    });
                }
            }
            self.persist();
            self.emit(events);
            Ok(())
        }

        async fn delete_comments_by_post(&self, post_id: &str) -> RepoResult<()> {
            let targets: Vec<Id> = {
                let s = self.state.read().unwrap();
                s.comments
                    .values()
                    .filter(|c| c.post_id == post_id)
                    .map(|c| c.id.clone())
                    .collect()
            };
            // replies die with their parents here, no reply-count upkeep
            let groups = targets
                .into_iter()
                .map(|id| vec![BatchOp::DeleteComment(id)])
                .collect();
            self.run_batched(groups).await
        }

        async fn delete_comments_by_user(&self, user_id: &str) -> RepoResult<()> {
            let targets: Vec<(Id, Option<Id>)> = {
                let s = self.state.read().unwrap();
                s.comments
                    .values()
                    .filter(|c| c.author_id == user_id)
                    .map(|c| (c.id.clone(), c.parent_id.clone()))
                    .collect()
            };
            let mut groups = Vec::new();
            for (id, parent_id) in targets {
                let mut group = vec![BatchOp::DeleteComment(id)];
                if let Some(parent_id) = parent_id {
                    // the decrement rides with its delete in one batch
                    group.push(BatchOp::DecrementReplyCount(parent_id));
                }
                groups.push(group);
            }
            self.run_batched(groups).await
        }

        async fn update_author_in_comments(
            &self,
            user_id: &str,
            patch: &AuthorPatch,
        ) -> RepoResult<()> {
            let username = {
                let parts: Vec<&str> = patch
                    .name
                    .as_deref()
                    .into_iter()
                    .chain(patch.surname.as_deref())
                    .collect();
                if parts.is_empty() {
                    None
                } else {
                    Some(parts.join(" "))
                }
            };
            if username.is_none() && patch.photo.is_none() {
                return Ok(());
            }
            let targets: Vec<Id> = {
                let s = self.state.read().unwrap();
                s.comments
                    .values()
                    .filter(|c| c.author_id == user_id)
                    .map(|c| c.id.clone())
                    .collect()
            };
            let groups = targets
                .into_iter()
                .map(|id| {
                    vec![BatchOp::PatchCommentAuthor {
                        id,
                        username: username.clone(),
                        photo: patch.photo.clone(),
                    }]
                })
                .collect();
            self.run_batched(groups).await
        }
    }

    #[async_trait]
    impl ReactionRepo for InMemRepo {
        async fn toggle_reaction(
            &self,
            user_id: &str,
            post_id: &str,
            kind: ReactionType,
        ) -> RepoResult<ReactOutcome> {
            let doc_id = Reaction::doc_id(user_id, post_id);
            let mut events = Vec::new();
            let applied;
            {
                let mut s = self.state.write().unwrap();
                let existing_kind = s.reactions.get(&doc_id).map(|r| r.kind);
                match existing_kind {
                    Some(existing) if existing == kind => {
                        // toggle off
                        s.reactions.remove(&doc_id);
                        events.push(StoreEvent::ReactionDeleted {
                            post_id: post_id.to_string(),
                            kind,
                        });
                        applied = None;
                    }
                    existing => {
                        // upsert replaces any opposite reaction in place
                        s.reactions.insert(
                            doc_id,
                            Reaction {
                                user_id: user_id.to_string(),
                                post_id: post_id.to_string(),
                                kind,
                                created_at: Utc::now(),
                            },
                        );
                        events.push(match existing {
                            Some(from) => StoreEvent::ReactionSwitched {
                                post_id: post_id.to_string(),
                                from,
                                to: kind,
                            },
                            None => StoreEvent::ReactionCreated {
                                post_id: post_id.to_string(),
                                kind,
                            },
                        });
                        applied = Some(kind);
                    }
                }
            }
            self.persist();
            self.emit(events);
            Ok(ReactOutcome { applied })
        }

        async fn remove_reaction(&self, user_id: &str, post_id: &str) -> RepoResult<()> {
            let doc_id = Reaction::doc_id(user_id, post_id);
            let removed = {
                let mut s = self.state.write().unwrap();
                s.reactions.remove(&doc_id)
            };
            if let Some(r) = removed {
                self.persist();
                self.emit(vec![StoreEvent::ReactionDeleted {
                    post_id: r.post_id,
                    kind: r.kind,
                }]);
            }
            Ok(())
        }

        async fn get_reaction(&self, user_id: &str, post_id: &str) -> RepoResult<Option<Reaction>> {
            let s = self.state.read().unwrap();
            Ok(s.reactions.get(&Reaction::doc_id(user_id, post_id)).cloned())
        }

        async fn find_reactions_for_posts(
            &self,
            user_id: &str,
            post_ids: &[Id],
        ) -> RepoResult<Vec<Reaction>> {
            if post_ids.is_empty() {
                return Ok(Vec::new());
            }
            let s = self.state.read().unwrap();
            Ok(post_ids
                .iter()
                .filter_map(|pid| s.reactions.get(&Reaction::doc_id(user_id, pid)).cloned())
                .collect())
        }

        async fn delete_reactions_by_post(&self, post_id: &str) -> RepoResult<()> {
            let targets: Vec<String> = {
                let s = self.state.read().unwrap();
                s.reactions
                    .iter()
                    .filter(|(_, r)| r.post_id == post_id)
                    .map(|(doc_id, _)| doc_id.clone())
                    .collect()
            };
            let groups = targets
                .into_iter()
                .map(|doc_id| vec![BatchOp::DeleteReaction(doc_id)])
                .collect();
            self.run_batched(groups).await
        }

        async fn delete_reactions_by_user(&self, user_id: &str) -> RepoResult<()> {
            let targets: Vec<String> = {
                let s = self.state.read().unwrap();
                s.reactions
                    .iter()
                    .filter(|(_, r)| r.user_id == user_id)
                    .map(|(doc_id, _)| doc_id.clone())
                    .collect()
            };
            let groups = targets
                .into_iter()
                .map(|doc_id| vec![BatchOp::DeleteReaction(doc_id)])
                .collect();
            self.run_batched(groups).await
        }
    }

    #[async_trait]
    impl UserRepo for InMemRepo {
        async fn get_user(&self, id: &str) -> RepoResult<User> {
            let s = self.state.read().unwrap();
            s.users.get(id).cloned().ok_or(RepoError::NotFound)
        }

        async fn ensure_user(&self, user: User) -> RepoResult<User> {
            use std::collections::hash_map::Entry;
            let result = {
                let mut s = self.state.write().unwrap();
                match s.users.entry(user.id.clone()) {
                    Entry::Occupied(mut entry) => {
                        let existing = entry.get_mut();
                        if user.email_verified && !existing.email_verified {
                            existing.email_verified = true;
                        }
                        existing.clone()
                    }
                    Entry::Vacant(entry) => entry.insert(user).clone(),
                }
            };
            self.persist();
            Ok(result)
        }

        async fn update_user(&self, id: &str, upd: UpdateUser) -> RepoResult<User> {
            let mut s = self.state.write().unwrap();
            let user = s.users.get_mut(id).ok_or(RepoError::NotFound)?;
            if let Some(name) = upd.name {
                user.name = name;
            }
            if let Some(surname) = upd.surname {
                user.surname = surname;
            }
            if let Some(photo) = upd.photo {
                user.photo = photo;
            }
            let updated = user.clone();
            drop(s);
            self.persist();
            Ok(updated)
        }

        async fn delete_user_doc(&self, id: &str) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            s.users.remove(id);
            drop(s);
            self.persist();
            Ok(())
        }
    }

    fn sort_posts(v: &mut [Post], order: PostOrder) {
        match order {
            PostOrder::Newest => v.sort_by(|a, b| {
                b.created_at
                    .cmp(&a.created_at)
                    .then_with(|| b.id.cmp(&a.id))
            }),
            PostOrder::Top => v.sort_by(|a, b| {
                b.likes_count
                    .cmp(&a.likes_count)
                    .then_with(|| b.created_at.cmp(&a.created_at))
                    .then_with(|| b.id.cmp(&a.id))
            }),
        }
    }
}
