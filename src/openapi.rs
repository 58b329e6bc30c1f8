use crate::models::{
    AuthorSnapshot, Comment, CommentPage, NewPost, Post, PostPage, PostWithStats, ReactOutcome,
    ReactionStats, ReactionType, UpdatePost, User,
};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::list_posts,
        crate::routes::create_post,
        crate::routes::get_post,
        crate::routes::update_post,
        crate::routes::delete_post,
        crate::routes::react,
        crate::routes::reaction_stats,
        crate::routes::create_comment,
        crate::routes::list_comments,
        crate::routes::list_replies,
        crate::routes::update_comment,
        crate::routes::remove_comment,
        crate::routes::upload_photo,
    ),
    components(schemas(
        Post, NewPost, UpdatePost, PostWithStats, PostPage, AuthorSnapshot,
        Comment, CommentPage,
        ReactionType, ReactionStats, ReactOutcome,
        User,
        crate::routes::ReactBody,
        crate::routes::CreateCommentBody,
        crate::routes::UpdateCommentBody,
        crate::routes::PhotoUploadResponse,
    )),
    tags(
        (name = "posts", description = "Post operations"),
        (name = "reactions", description = "Reaction toggle and stats"),
        (name = "comments", description = "Comment and reply operations"),
    )
)]
pub struct ApiDoc;
