use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;

use crate::repo::RepoError;

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: String,
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("not found")] NotFound,
    #[error("forbidden")] Forbidden,
    #[error("replies to replies are not allowed")] InvalidHierarchy,
    #[error("cannot edit a deleted comment")] InvalidState,
    #[error("conflict")] Conflict,
    #[error("store unavailable, retry")] Unavailable,
    #[error("{0}")] Validation(String),
    #[error("rate limited")] RateLimited,
    #[error("internal error")] Internal,
}

impl From<RepoError> for ApiError {
    fn from(e: RepoError) -> Self {
        match e {
            RepoError::NotFound => ApiError::NotFound,
            RepoError::Forbidden => ApiError::Forbidden,
            RepoError::InvalidHierarchy => ApiError::InvalidHierarchy,
            RepoError::InvalidState => ApiError::InvalidState,
            RepoError::Conflict => ApiError::Conflict,
            RepoError::Unavailable => ApiError::Unavailable,
        }
    }
}

impl ResponseError for ApiError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;
        let status = match self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::InvalidHierarchy => StatusCode::BAD_REQUEST,
            ApiError::InvalidState => StatusCode::BAD_REQUEST,
            ApiError::Conflict => StatusCode::CONFLICT,
            ApiError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        HttpResponse::build(status).json(ApiErrorBody { error: self.to_string() })
    }
}
