use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use utoipa::ToSchema;

// Document ids are opaque strings (uuid v4 simple format); they double as
// pagination cursors.
pub type Id = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ReactionType {
    Like,
    Dislike,
}

/// Denormalized author identity embedded in posts at creation time.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AuthorSnapshot {
    pub name: String,
    pub surname: String,
    pub photo: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Post {
    pub id: Id,
    pub user_id: Id,
    pub title: String,
    pub text: String,
    pub photo: Option<String>,
    pub user: Option<AuthorSnapshot>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    // Counters are owned by the consistency core; clients never set them.
    pub likes_count: i64,
    pub dislikes_count: i64,
    pub comments_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewPost {
    pub title: String,
    pub text: String,
    pub photo: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdatePost {
    pub title: Option<String>,
    pub text: Option<String>,
    pub photo: Option<String>,
}

/// A post as returned by list/get endpoints: counters surfaced under their
/// public names plus the viewer's own reaction state.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PostWithStats {
    #[serde(flatten)]
    pub post: Post,
    pub likes: i64,
    pub dislikes: i64,
    pub user_reaction: Option<ReactionType>,
}

impl PostWithStats {
    pub fn new(post: Post, user_reaction: Option<ReactionType>) -> Self {
        let (likes, dislikes) = (post.likes_count, post.dislikes_count);
        Self { post, likes, dislikes, user_reaction }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Comment {
    pub id: Id,
    pub post_id: Id,
    pub author_id: Id,
    pub author_username: String,
    pub author_photo: Option<String>,
    pub content: String,
    /// `None` for a top-level comment, else the id of a top-level comment.
    /// Max depth is 1: a reply is never a parent.
    pub parent_id: Option<Id>,
    /// Meaningful only when `parent_id` is `None`.
    pub reply_count: i64,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Repo-level input for comment creation. Author fields are filled in by the
/// handler from the verified caller's profile, never from the request body.
#[derive(Debug, Clone)]
pub struct NewComment {
    pub post_id: Id,
    pub author_id: Id,
    pub author_username: String,
    pub author_photo: Option<String>,
    pub content: String,
    pub parent_id: Option<Id>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Reaction {
    pub user_id: Id,
    pub post_id: Id,
    #[serde(rename = "type")]
    pub kind: ReactionType,
    pub created_at: DateTime<Utc>,
}

impl Reaction {
    /// Composite document id: at most one reaction per (user, post).
    pub fn doc_id(user_id: &str, post_id: &str) -> String {
        format!("{user_id}_{post_id}")
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ReactionStats {
    pub likes: i64,
    pub dislikes: i64,
    pub viewer_reaction: Option<ReactionType>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ReactOutcome {
    /// The reaction now in effect, or `None` after a toggle-off.
    pub applied: Option<ReactionType>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct User {
    pub id: Id,
    pub email: String,
    pub name: String,
    pub surname: String,
    pub photo: Option<String>,
    pub email_verified: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct UpdateUser {
    pub name: Option<String>,
    pub surname: Option<String>,
    /// Tri-state: absent = untouched, `null` = cleared, string = replaced.
    #[serde(default, deserialize_with = "double_option")]
    #[schema(value_type = Option<String>)]
    pub photo: Option<Option<String>>,
}

/// Profile fields propagated to denormalized author copies on posts and
/// comments. Same tri-state photo semantics as [`UpdateUser`].
#[derive(Debug, Clone, Default)]
pub struct AuthorPatch {
    pub name: Option<String>,
    pub surname: Option<String>,
    pub photo: Option<Option<String>>,
}

impl AuthorPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.surname.is_none() && self.photo.is_none()
    }
}

/// One page of a cursor-paginated listing. `next_cursor` is the id of the
/// last item returned, to be passed back as an opaque start-after token.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[aliases(CommentPage = Page<Comment>, PostPage = Page<PostWithStats>)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<Id>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum PostOrder {
    #[default]
    Newest,
    Top,
}

fn double_option<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(de).map(Some)
}
