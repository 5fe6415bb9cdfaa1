use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use super::EntityKind;

/// Errors returned by administrative operations.
///
/// A failed operation leaves the registry exactly as it was.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdminError {
    #[error("{kind} \"{name}\" not found")]
    NotFound { kind: EntityKind, name: String },

    #[error("{kind} \"{name}\" already exists")]
    AlreadyExists { kind: EntityKind, name: String },

    #[error("position {position} is out of range for rulelist \"{rulelist}\" with {len} rules")]
    PositionOutOfRange {
        rulelist: String,
        position: usize,
        len: usize,
    },

    #[error("{kind} \"{name}\" is still used by {user}")]
    InUse {
        kind: EntityKind,
        name: String,
        user: String,
    },

    #[error("invalid {kind}: {reason}")]
    Invalid { kind: EntityKind, reason: String },

    /// The request URI or body could not be read at all.
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("path \"{path}\" not found in {kind} \"{name}\"")]
    PathNotFound {
        kind: EntityKind,
        name: String,
        path: String,
    },
}

impl AdminError {
    pub fn not_found(kind: EntityKind, name: impl Into<String>) -> Self {
        AdminError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn invalid(kind: EntityKind, reason: impl ToString) -> Self {
        AdminError::Invalid {
            kind,
            reason: reason.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AdminError::NotFound { .. } | AdminError::PathNotFound { .. } => StatusCode::NOT_FOUND,
            AdminError::AlreadyExists { .. } | AdminError::InUse { .. } => StatusCode::CONFLICT,
            AdminError::Invalid { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AdminError::PositionOutOfRange { .. } | AdminError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AdminError::NotFound { .. } => "not_found",
            AdminError::AlreadyExists { .. } => "already_exists",
            AdminError::PositionOutOfRange { .. } => "position_out_of_range",
            AdminError::InUse { .. } => "in_use",
            AdminError::Invalid { .. } => "invalid",
            AdminError::PathNotFound { .. } => "path_not_found",
            AdminError::BadRequest(_) => "bad_request",
        }
    }
}

/// Problem details body (RFC 7807).
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub code: String,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("urn:metaproxy:problem:{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            code,
        }
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = self.status();
        let problem = ProblemDetails::new(status, self.code(), self.to_string());
        let mut response = (status, Json(problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}
