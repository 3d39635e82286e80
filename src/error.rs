//! Crate-wide error taxonomy.
//!
//! Every fallible operation in the storage/placement/rebuild/token layers
//! returns `AppError`. Variants are kinds, not wrappers around library
//! error types — library errors get folded into `Internal` at the edge.

use rocket::http::Status;
use rocket::response::{self, Responder};
use rocket::serde::json::json;
use rocket::Request;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("insufficient capacity: {0}")]
    InsufficientCapacity(String),

    #[error("insufficient replication targets: {0}")]
    InsufficientReplicationTargets(String),

    #[error("mapping forbidden: {0}")]
    MappingForbidden(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("expired: {0}")]
    Expired(String),

    #[error("replay: {0}")]
    Replay(String),

    #[error("no active targets: {0}")]
    NoActiveTargets(String),

    #[error("target i/o error: {0}")]
    TargetIOError(String),

    #[error("stalled: {0}")]
    Stalled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// The canonical HTTP status for this error kind, per spec.md §6.
    pub fn status(&self) -> Status {
        match self {
            AppError::NotFound(_) => Status::NotFound,
            AppError::Conflict(_) => Status::Conflict,
            AppError::InvalidArgument(_) => Status::BadRequest,
            AppError::InsufficientCapacity(_) => Status::BadRequest,
            AppError::InsufficientReplicationTargets(_) => Status::BadRequest,
            AppError::MappingForbidden(_) => Status::BadRequest,
            AppError::Unauthorized(_) => Status::Forbidden,
            AppError::Expired(_) => Status::Forbidden,
            AppError::Replay(_) => Status::Forbidden,
            AppError::NoActiveTargets(_) => Status::ServiceUnavailable,
            AppError::TargetIOError(_) => Status::ServiceUnavailable,
            AppError::Stalled(_) => Status::Conflict,
            AppError::Internal(_) => Status::InternalServerError,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "NotFound",
            AppError::Conflict(_) => "Conflict",
            AppError::InvalidArgument(_) => "InvalidArgument",
            AppError::InsufficientCapacity(_) => "InsufficientCapacity",
            AppError::InsufficientReplicationTargets(_) => "InsufficientReplicationTargets",
            AppError::MappingForbidden(_) => "MappingForbidden",
            AppError::Unauthorized(_) => "Unauthorized",
            AppError::Expired(_) => "Expired",
            AppError::Replay(_) => "Replay",
            AppError::NoActiveTargets(_) => "NoActiveTargets",
            AppError::TargetIOError(_) => "TargetIOError",
            AppError::Stalled(_) => "Stalled",
            AppError::Internal(_) => "Internal",
        }
    }
}

impl<'r> Responder<'r, 'static> for AppError {
    fn respond_to(self, request: &'r Request<'_>) -> response::Result<'static> {
        log::warn!("request error: {} ({})", self, self.kind());
        let body = json!({
            "status": "error",
            "error_kind": self.kind(),
            "message": self.to_string(),
        });
        rocket::response::Response::build_from(
            rocket::serde::json::Json(body).respond_to(request)?,
        )
        .status(self.status())
        .ok()
    }
}
