use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tracing::warn;

use crate::{community::CommunityError, server::Envelope};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Failed to publish: {0}")]
    Rejected(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<CommunityError> for AppError {
    fn from(err: CommunityError) -> Self {
        match err {
            CommunityError::Convention(e) => AppError::BadRequest(e.to_string()),
            CommunityError::Rejected(reason) => AppError::Rejected(reason),
            CommunityError::Relay(e) => AppError::Internal(e.to_string()),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(err: JsonRejection) -> Self {
        AppError::BadRequest(err.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(err: QueryRejection) -> Self {
        AppError::BadRequest(err.body_text())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Rejected(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self, "request failed");
        }

        (status, Json(Envelope::<()>::failure(self.to_string()))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{relay::RelayError, tagging::ConventionError};

    #[test]
    fn status_mapping() {
        let bad: AppError = CommunityError::from(ConventionError::Missing("content")).into();
        assert_eq!(bad.into_response().status(), StatusCode::BAD_REQUEST);
        let rejected: AppError = CommunityError::Rejected("blocked".into()).into();
        assert_eq!(rejected.to_string(), "Failed to publish: blocked");
        assert_eq!(rejected.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
        let closed: AppError = CommunityError::from(RelayError::PoolClosed).into();
        assert_eq!(closed.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
