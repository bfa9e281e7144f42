//! Error type for management API handlers.
//!
//! Lower-layer reports are classified into an [`ApiError`] whose variant
//! picks the HTTP status. Only the user-safe message reaches the response
//! body; internal details are logged.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use rootcause::Report;
use serde_json::json;
use std::fmt;
use switchyard_messaging::BusError;
use switchyard_workflow::{DefinitionError, StoreError};

/// Management API errors.
#[derive(Debug)]
pub enum ApiError {
    /// The addressed record does not exist.
    NotFound { entity: &'static str, id: String },
    /// A submitted definition failed validation.
    InvalidDefinition { reason: String },
    /// A request field is missing or malformed.
    BadRequest { reason: String },
    /// The write collided with a live record or a concurrent change.
    Conflict { reason: String },
    /// The database or bus is unreachable.
    Unavailable { details: String },
    /// Anything else.
    Internal { details: String },
}

impl ApiError {
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::InvalidDefinition { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to return to the caller.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::NotFound { .. }
            | Self::InvalidDefinition { .. }
            | Self::BadRequest { .. }
            | Self::Conflict { .. } => self.to_string(),
            Self::Unavailable { .. } => "service unavailable".to_string(),
            Self::Internal { .. } => "internal error".to_string(),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { entity, id } => write!(f, "{entity} '{id}' not found"),
            Self::InvalidDefinition { reason } => write!(f, "invalid definition: {reason}"),
            Self::BadRequest { reason } => write!(f, "bad request: {reason}"),
            Self::Conflict { reason } => write!(f, "conflict: {reason}"),
            Self::Unavailable { details } => write!(f, "unavailable: {details}"),
            Self::Internal { details } => write!(f, "internal error: {details}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        (status, Json(json!({ "error": self.public_message() }))).into_response()
    }
}

impl From<Report<StoreError>> for ApiError {
    fn from(report: Report<StoreError>) -> Self {
        match report.current_context() {
            StoreError::Duplicate { .. } | StoreError::VersionConflict { .. } => Self::Conflict {
                reason: report.current_context().to_string(),
            },
            StoreError::Database { .. } => Self::Unavailable {
                details: report.to_string(),
            },
            StoreError::Decode { .. } => Self::Internal {
                details: report.to_string(),
            },
        }
    }
}

impl From<Report<DefinitionError>> for ApiError {
    fn from(report: Report<DefinitionError>) -> Self {
        match report.current_context() {
            DefinitionError::IdGeneration => Self::Internal {
                details: report.to_string(),
            },
            context => Self::InvalidDefinition {
                reason: context.to_string(),
            },
        }
    }
}

impl From<Report<BusError>> for ApiError {
    fn from(report: Report<BusError>) -> Self {
        match report.current_context() {
            BusError::Serialization { .. } => Self::Internal {
                details: report.to_string(),
            },
            _ => Self::Unavailable {
                details: report.to_string(),
            },
        }
    }
}

/// Failures that stop the service from starting.
#[derive(Debug)]
pub enum StartupError {
    Config { details: String },
    IdGenerator { details: String },
    Database { details: String },
    Migrations { details: String },
    Nats { details: String },
    Listen { addr: String, details: String },
    Serve { details: String },
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { details } => write!(f, "failed to load configuration: {details}"),
            Self::IdGenerator { details } => write!(f, "invalid node id: {details}"),
            Self::Database { details } => write!(f, "failed to connect to database: {details}"),
            Self::Migrations { details } => write!(f, "failed to run migrations: {details}"),
            Self::Nats { details } => write!(f, "failed to set up NATS: {details}"),
            Self::Listen { addr, details } => write!(f, "failed to bind {addr}: {details}"),
            Self::Serve { details } => write!(f, "server error: {details}"),
        }
    }
}

impl std::error::Error for StartupError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn report<C>(context: C) -> Report<C>
    where
        Report<C>: From<C>,
    {
        context.into()
    }

    #[test]
    fn store_errors_map_to_statuses() {
        let duplicate = ApiError::from(report(StoreError::Duplicate {
            message: "name".into(),
        }));
        assert_eq!(duplicate.status(), StatusCode::CONFLICT);

        let down = ApiError::from(report(StoreError::database("connection refused")));
        assert_eq!(down.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(down.public_message(), "service unavailable");
    }

    #[test]
    fn validation_failures_are_unprocessable() {
        let err = ApiError::from(report(DefinitionError::CycleDetected));
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(err.public_message().contains("cycle"));
    }

    #[test]
    fn not_found_names_the_record() {
        let err = ApiError::not_found("workflow", 42);
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(err.public_message(), "workflow '42' not found");
    }
}
