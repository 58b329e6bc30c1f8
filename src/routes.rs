use std::sync::Arc;

use actix_multipart::Multipart;
use actix_web::{web, HttpResponse};
use chrono::Utc;
use futures_util::TryStreamExt as _;
use sha2::{Digest, Sha256};

use crate::auth::Auth;
use crate::cascade::DeletionOrchestrator;
use crate::error::ApiError;
use crate::identity::IdentityDirectory;
use crate::models::*;
use crate::rate_limit::RateLimiterFacade;
use crate::repo::Repo;
use crate::storage::{discard_photo, PhotoStore, PhotoStoreError};

pub const MAX_COMMENT_LEN: usize = 300;

const DEFAULT_PAGE_SIZE: usize = 10;
const MAX_PAGE_SIZE: usize = 50;

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(
                web::resource("/posts")
                    .route(web::get().to(list_posts))
                    .route(web::post().to(create_post)),
            )
            .service(
                web::resource("/posts/{id}")
                    .route(web::get().to(get_post))
                    .route(web::patch().to(update_post))
                    .route(web::delete().to(delete_post)),
            )
            .service(
                web::resource("/posts/{id}/reaction")
                    .route(web::put().to(react))
                    .route(web::delete().to(remove_reaction)),
            )
            .service(web::resource("/posts/{id}/reactions").route(web::get().to(reaction_stats)))
            .service(
                web::resource("/posts/{id}/comments")
                    .route(web::get().to(list_comments))
                    .route(web::post().to(create_comment)),
            )
            .service(web::resource("/comments/{id}/replies").route(web::get().to(list_replies)))
            .service(
                web::resource("/comments/{id}")
                    .route(web::patch().to(update_comment))
                    .route(web::delete().to(remove_comment)),
            )
            .service(web::resource("/users/me").route(web::put().to(sync_profile)))
            .service(
                web::resource("/users/{id}")
                    .route(web::get().to(get_user))
                    .route(web::patch().to(update_user))
                    .route(web::delete().to(delete_user)),
            )
            .service(web::resource("/users/{id}/posts").route(web::get().to(list_user_posts)))
            .service(web::resource("/photos").route(web::post().to(upload_photo))),
    );
    // public fetch route (no /api/v1 prefix so <img src="/photos/{key}"> works)
    cfg.route("/photos/{key}", web::get().to(get_photo));
}

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repo>,
    pub photo_store: Arc<dyn PhotoStore>,
    pub identity: Arc<dyn IdentityDirectory>,
    pub limiter: RateLimiterFacade,
}

impl AppState {
    fn orchestrator(&self) -> DeletionOrchestrator {
        DeletionOrchestrator::new(
            self.repo.clone(),
            self.photo_store.clone(),
            self.identity.clone(),
        )
    }
}

#[derive(Debug, serde::Deserialize)]
pub struct PageQuery {
    pub limit: Option<usize>,
    pub cursor: Option<String>,
    pub sort: Option<PostOrder>,
}

impl PageQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }
}

// ---------------- posts -----------------------------------------------

/// Joins the viewer's own reactions over one page of posts.
async fn attach_stats(
    repo: &dyn Repo,
    page: Page<Post>,
    viewer: Option<&str>,
) -> Result<Page<PostWithStats>, ApiError> {
    let reactions = match viewer {
        Some(uid) if !page.items.is_empty() => {
            let ids: Vec<Id> = page.items.iter().map(|p| p.id.clone()).collect();
            repo.find_reactions_for_posts(uid, &ids).await?
        }
        _ => Vec::new(),
    };
    let items = page
        .items
        .into_iter()
        .map(|post| {
            let viewer_reaction = reactions
                .iter()
                .find(|r| r.post_id == post.id)
                .map(|r| r.kind);
            PostWithStats::new(post, viewer_reaction)
        })
        .collect();
    Ok(Page { items, next_cursor: page.next_cursor, has_more: page.has_more })
}

#[utoipa::path(
    get,
    path = "/api/v1/posts",
    params(
        ("limit" = Option<usize>, Query, description = "Page size (max 50)"),
        ("cursor" = Option<String>, Query, description = "Opaque start-after token from the previous page"),
        ("sort" = Option<String>, Query, description = "newest (default) or top")
    ),
    responses(
        (status = 200, description = "One page of posts", body = PostPage)
    )
)]
pub async fn list_posts(
    auth: Option<Auth>,
    data: web::Data<AppState>,
    query: web::Query<PageQuery>,
) -> Result<HttpResponse, ApiError> {
    let page = data
        .repo
        .list_posts(query.limit(), query.cursor.as_deref(), query.sort.unwrap_or_default())
        .await?;
    let viewer = auth.as_ref().map(|a| a.0.uid().to_string());
    let page = attach_stats(data.repo.as_ref(), page, viewer.as_deref()).await?;
    Ok(HttpResponse::Ok().json(page))
}

pub async fn list_user_posts(
    auth: Option<Auth>,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    query: web::Query<PageQuery>,
) -> Result<HttpResponse, ApiError> {
    let user_id = path.into_inner();
    let page = data
        .repo
        .list_posts_by_user(
            &user_id,
            query.limit(),
            query.cursor.as_deref(),
            query.sort.unwrap_or_default(),
        )
        .await?;
    let viewer = auth.as_ref().map(|a| a.0.uid().to_string());
    let page = attach_stats(data.repo.as_ref(), page, viewer.as_deref()).await?;
    Ok(HttpResponse::Ok().json(page))
}

#[utoipa::path(
    post,
    path = "/api/v1/posts",
    request_body = NewPost,
    responses(
        (status = 201, description = "Post created", body = Post),
        (status = 400, description = "Missing title or text"),
        (status = 429, description = "Rate limited")
    )
)]
pub async fn create_post(
    auth: Auth,
    data: web::Data<AppState>,
    payload: web::Json<NewPost>,
) -> Result<HttpResponse, ApiError> {
    let uid = auth.0.uid();
    if !data.limiter.allow_post(uid) {
        return Err(ApiError::RateLimited);
    }
    let new = payload.into_inner();
    if new.title.trim().is_empty() || new.text.trim().is_empty() {
        return Err(ApiError::Validation("title and text are required".into()));
    }
    // author snapshot is copied from the profile at creation time
    let author = match data.repo.get_user(uid).await {
        Ok(u) => Some(AuthorSnapshot { name: u.name, surname: u.surname, photo: u.photo }),
        Err(crate::repo::RepoError::NotFound) => None,
        Err(e) => return Err(e.into()),
    };
    let post = data.repo.create_post(uid, new, author).await?;
    Ok(HttpResponse::Created().json(post))
}

#[utoipa::path(
    get,
    path = "/api/v1/posts/{id}",
    params(("id" = String, Path, description = "Post id")),
    responses(
        (status = 200, description = "Post with viewer stats", body = PostWithStats),
        (status = 404, description = "Post not found")
    )
)]
pub async fn get_post(
    auth: Option<Auth>,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let post = data.repo.get_post(&path.into_inner()).await?;
    let viewer_reaction = match &auth {
        Some(a) => data
            .repo
            .get_reaction(a.0.uid(), &post.id)
            .await?
            .map(|r| r.kind),
        None => None,
    };
    Ok(HttpResponse::Ok().json(PostWithStats::new(post, viewer_reaction)))
}

#[utoipa::path(
    patch,
    path = "/api/v1/posts/{id}",
    request_body = UpdatePost,
    params(("id" = String, Path, description = "Post id")),
    responses(
        (status = 200, description = "Post updated", body = Post),
        (status = 403, description = "Not the author"),
        (status = 404, description = "Post not found")
    )
)]
pub async fn update_post(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<UpdatePost>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let old = data.repo.get_post(&id).await?;
    let updated = data
        .repo
        .update_post(&id, auth.0.uid(), payload.into_inner())
        .await?;
    // a replaced photo leaves its predecessor orphaned in storage
    if let Some(old_photo) = &old.photo {
        if updated.photo.as_deref() != Some(old_photo.as_str()) {
            discard_photo(data.photo_store.as_ref(), old_photo).await;
        }
    }
    Ok(HttpResponse::Ok().json(updated))
}

#[utoipa::path(
    delete,
    path = "/api/v1/posts/{id}",
    params(("id" = String, Path, description = "Post id")),
    responses(
        (status = 204, description = "Post and dependents deleted"),
        (status = 403, description = "Not the author"),
        (status = 404, description = "Post not found")
    )
)]
pub async fn delete_post(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let post = data.repo.get_post(&id).await?;
    if post.user_id != auth.0.uid() {
        return Err(ApiError::Forbidden);
    }
    data.orchestrator().delete_post(&id).await?;
    Ok(HttpResponse::NoContent().finish())
}

// ---------------- reactions -------------------------------------------

#[derive(Debug, serde::Deserialize, utoipa::ToSchema)]
pub struct ReactBody {
    #[serde(rename = "type")]
    pub kind: ReactionType,
}

#[utoipa::path(
    put,
    path = "/api/v1/posts/{id}/reaction",
    request_body = ReactBody,
    params(("id" = String, Path, description = "Post id")),
    responses(
        (status = 200, description = "Reaction state after the toggle", body = ReactOutcome),
        (status = 404, description = "Post not found"),
        (status = 429, description = "Rate limited")
    )
)]
pub async fn react(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<ReactBody>,
) -> Result<HttpResponse, ApiError> {
    let uid = auth.0.uid();
    if !data.limiter.allow_reaction(uid) {
        return Err(ApiError::RateLimited);
    }
    let post_id = path.into_inner();
    data.repo.get_post(&post_id).await?;
    let outcome = data
        .repo
        .toggle_reaction(uid, &post_id, payload.kind)
        .await?;
    Ok(HttpResponse::Ok().json(outcome))
}

pub async fn remove_reaction(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    // idempotent: removing a missing reaction is a no-op
    data.repo
        .remove_reaction(auth.0.uid(), &path.into_inner())
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

#[utoipa::path(
    get,
    path = "/api/v1/posts/{id}/reactions",
    params(("id" = String, Path, description = "Post id")),
    responses(
        (status = 200, description = "Counter snapshot plus the viewer's own state", body = ReactionStats),
        (status = 404, description = "Post not found")
    )
)]
pub async fn reaction_stats(
    auth: Option<Auth>,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let post = data.repo.get_post(&path.into_inner()).await?;
    // counters lag one trigger round-trip; the viewer's own reaction is a
    // direct record read, never a cached value
    let viewer_reaction = match &auth {
        Some(a) => data
            .repo
            .get_reaction(a.0.uid(), &post.id)
            .await?
            .map(|r| r.kind),
        None => None,
    };
    Ok(HttpResponse::Ok().json(ReactionStats {
        likes: post.likes_count,
        dislikes: post.dislikes_count,
        viewer_reaction,
    }))
}

// ---------------- comments --------------------------------------------

#[derive(Debug, serde::Deserialize, utoipa::ToSchema)]
pub struct CreateCommentBody {
    pub content: String,
    pub parent_id: Option<Id>,
}

#[derive(Debug, serde::Deserialize, utoipa::ToSchema)]
pub struct UpdateCommentBody {
    pub content: String,
}

fn validate_content(content: &str) -> Result<(), ApiError> {
    if content.trim().is_empty() {
        return Err(ApiError::Validation("content is required".into()));
    }
    if content.chars().count() > MAX_COMMENT_LEN {
        return Err(ApiError::Validation(format!(
            "content must be at most {MAX_COMMENT_LEN} characters"
        )));
    }
    Ok(())
}

#[utoipa::path(
    post,
    path = "/api/v1/posts/{id}/comments",
    request_body = CreateCommentBody,
    params(("id" = String, Path, description = "Post id")),
    responses(
        (status = 201, description = "Comment created", body = Comment),
        (status = 400, description = "Invalid content or reply-to-reply"),
        (status = 404, description = "Post or parent comment not found"),
        (status = 429, description = "Rate limited")
    )
)]
pub async fn create_comment(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<CreateCommentBody>,
) -> Result<HttpResponse, ApiError> {
    let uid = auth.0.uid();
    if !data.limiter.allow_comment(uid) {
        return Err(ApiError::RateLimited);
    }
    let body = payload.into_inner();
    validate_content(&body.content)?;
    // denormalized author identity comes from the profile, not the client
    let (author_username, author_photo) = match data.repo.get_user(uid).await {
        Ok(u) => {
            let username = format!("{} {}", u.name, u.surname).trim().to_string();
            (username, u.photo)
        }
        Err(crate::repo::RepoError::NotFound) => (auth.0.email.clone(), None),
        Err(e) => return Err(e.into()),
    };
    let comment = data
        .repo
        .create_comment(NewComment {
            post_id: path.into_inner(),
            author_id: uid.to_string(),
            author_username,
            author_photo,
            content: body.content,
            parent_id: body.parent_id,
        })
        .await?;
    Ok(HttpResponse::Created().json(comment))
}

#[utoipa::path(
    get,
    path = "/api/v1/posts/{id}/comments",
    params(
        ("id" = String, Path, description = "Post id"),
        ("limit" = Option<usize>, Query, description = "Page size (max 50)"),
        ("cursor" = Option<String>, Query, description = "Opaque start-after token")
    ),
    responses(
        (status = 200, description = "Top-level comments, newest first", body = CommentPage),
        (status = 404, description = "Post not found")
    )
)]
pub async fn list_comments(
    data: web::Data<AppState>,
    path: web::Path<Id>,
    query: web::Query<PageQuery>,
) -> Result<HttpResponse, ApiError> {
    let post_id = path.into_inner();
    data.repo.get_post(&post_id).await?;
    let page = data
        .repo
        .list_top_level(&post_id, query.limit(), query.cursor.as_deref())
        .await?;
    Ok(HttpResponse::Ok().json(page))
}

#[utoipa::path(
    get,
    path = "/api/v1/comments/{id}/replies",
    params(
        ("id" = String, Path, description = "Parent comment id"),
        ("limit" = Option<usize>, Query, description = "Page size (max 50)"),
        ("cursor" = Option<String>, Query, description = "Opaque start-after token")
    ),
    responses(
        (status = 200, description = "Replies in chronological order", body = CommentPage),
        (status = 404, description = "Comment not found")
    )
)]
pub async fn list_replies(
    data: web::Data<AppState>,
    path: web::Path<Id>,
    query: web::Query<PageQuery>,
) -> Result<HttpResponse, ApiError> {
    let parent_id = path.into_inner();
    data.repo.get_comment(&parent_id).await?;
    let page = data
        .repo
        .list_replies(&parent_id, query.limit(), query.cursor.as_deref())
        .await?;
    Ok(HttpResponse::Ok().json(page))
}

#[utoipa::path(
    patch,
    path = "/api/v1/comments/{id}",
    request_body = UpdateCommentBody,
    params(("id" = String, Path, description = "Comment id")),
    responses(
        (status = 200, description = "Comment updated", body = Comment),
        (status = 400, description = "Invalid content or tombstoned comment"),
        (status = 403, description = "Not the author"),
        (status = 404, description = "Comment not found")
    )
)]
pub async fn update_comment(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<UpdateCommentBody>,
) -> Result<HttpResponse, ApiError> {
    let body = payload.into_inner();
    validate_content(&body.content)?;
    let comment = data
        .repo
        .update_comment(&path.into_inner(), auth.0.uid(), body.content)
        .await?;
    Ok(HttpResponse::Ok().json(comment))
}

#[utoipa::path(
    delete,
    path = "/api/v1/comments/{id}",
    params(("id" = String, Path, description = "Comment id")),
    responses(
        (status = 204, description = "Comment removed (tombstoned when it still has replies)"),
        (status = 403, description = "Not the author"),
        (status = 404, description = "Comment not found")
    )
)]
pub async fn remove_comment(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    data.repo
        .remove_comment(&path.into_inner(), auth.0.uid())
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

// ---------------- users -----------------------------------------------

#[derive(Debug, serde::Deserialize, utoipa::ToSchema)]
pub struct SyncProfileBody {
    pub name: String,
    pub surname: String,
    pub photo: Option<String>,
}

/// Create-if-missing profile sync from verified identity claims, the same
/// shape as the original first-sign-in flow.
pub async fn sync_profile(
    auth: Auth,
    data: web::Data<AppState>,
    payload: web::Json<SyncProfileBody>,
) -> Result<HttpResponse, ApiError> {
    let body = payload.into_inner();
    let user = data
        .repo
        .ensure_user(User {
            id: auth.0.sub.clone(),
            email: auth.0.email.clone(),
            name: body.name,
            surname: body.surname,
            photo: body.photo,
            email_verified: auth.0.email_verified,
            created_at: Utc::now(),
        })
        .await?;
    Ok(HttpResponse::Ok().json(user))
}

pub async fn get_user(
    _auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let user = data.repo.get_user(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(user))
}

pub async fn update_user(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<UpdateUser>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    if auth.0.uid() != id {
        return Err(ApiError::Forbidden);
    }
    let upd = payload.into_inner();
    let propagate = upd.name.is_some() || upd.surname.is_some() || upd.photo.is_some();
    let user = data.repo.update_user(&id, upd).await?;
    if propagate {
        // Fan-out rewrite of denormalized author copies: asynchronous and
        // best-effort, never fails the profile update that triggered it.
        let repo = data.repo.clone();
        let patch = AuthorPatch {
            name: Some(user.name.clone()),
            surname: Some(user.surname.clone()),
            photo: Some(user.photo.clone()),
        };
        let uid = user.id.clone();
        tokio::spawn(async move {
            if let Err(e) = repo.update_author_in_posts(&uid, &patch).await {
                log::warn!("author fan-out to posts failed for {uid}: {e}");
            }
            if let Err(e) = repo.update_author_in_comments(&uid, &patch).await {
                log::warn!("author fan-out to comments failed for {uid}: {e}");
            }
        });
    }
    Ok(HttpResponse::Ok().json(user))
}

pub async fn delete_user(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    if auth.0.uid() != id {
        return Err(ApiError::Forbidden);
    }
    data.orchestrator().delete_user(&id).await?;
    Ok(HttpResponse::NoContent().finish())
}

// ---------------- photos ----------------------------------------------

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct PhotoUploadResponse {
    pub key: String,
    pub mime: String,
    pub size: usize,
    pub duplicate: bool, // true when upload was a duplicate (idempotent)
}

const PHOTO_SIZE_LIMIT: usize = 10 * 1024 * 1024; // 10 MB

const ALLOWED_MIME: &[&str] = &["image/png", "image/jpeg", "image/gif", "image/webp"];

#[utoipa::path(
    post,
    path = "/api/v1/photos",
    responses(
        (status = 201, description = "Photo stored (new)", body = PhotoUploadResponse),
        (status = 200, description = "Photo already existed (idempotent)", body = PhotoUploadResponse),
        (status = 415, description = "Unsupported media type"),
        (status = 413, description = "Payload too large"),
    )
)]
pub async fn upload_photo(
    _auth: Auth,
    data: web::Data<AppState>,
    mut payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    use actix_web::http::StatusCode;
    let mut bytes: Vec<u8> = Vec::new();
    while let Some(field) = payload.try_next().await.map_err(|e| {
        log::error!("multipart error: {e}");
        ApiError::Internal
    })? {
        if let Some(name) = field.content_disposition().get_name() {
            if name != "file" {
                continue;
            }
        } else {
            continue;
        }
        let mut field_stream = field;
        let mut hasher = Sha256::new();
        while let Some(chunk) = field_stream.try_next().await.map_err(|e| {
            log::error!("stream read error: {e}");
            ApiError::Internal
        })? {
            if bytes.len() + chunk.len() > PHOTO_SIZE_LIMIT {
                return Ok(HttpResponse::build(StatusCode::PAYLOAD_TOO_LARGE).finish());
            }
            hasher.update(&chunk);
            bytes.extend_from_slice(&chunk);
        }
        let key = format!("{:x}", hasher.finalize());
        let mime = infer::get(&bytes)
            .map(|t| t.mime_type().to_string())
            .unwrap_or_else(|| "application/octet-stream".into());
        if !ALLOWED_MIME.contains(&mime.as_str()) {
            return Ok(HttpResponse::UnsupportedMediaType().finish());
        }
        // content-addressed: re-uploading the same bytes is idempotent
        let (status_code, duplicate_flag) = match data.photo_store.save(&key, &mime, &bytes).await {
            Ok(()) => (StatusCode::CREATED, false),
            Err(PhotoStoreError::Duplicate) => (StatusCode::OK, true),
            Err(e) => {
                log::error!("photo_store save error: {e}");
                return Err(ApiError::Internal);
            }
        };
        let resp = PhotoUploadResponse { key, mime, size: bytes.len(), duplicate: duplicate_flag };
        return Ok(HttpResponse::build(status_code).json(resp));
    }
    Ok(HttpResponse::BadRequest().finish())
}

/// Serve a stored photo by key.
pub async fn get_photo(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let key = path.into_inner();
    if key.len() < 2 {
        return Err(ApiError::NotFound);
    }
    match data.photo_store.load(&key).await {
        Ok((bytes, mime)) => Ok(HttpResponse::Ok()
            .insert_header(("Content-Type", mime))
            .body(bytes)),
        Err(PhotoStoreError::NotFound) => Err(ApiError::NotFound),
        Err(e) => {
            log::error!("photo_store load error: {e}");
            Err(ApiError::Internal)
        }
    }
}
