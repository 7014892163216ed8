//! Typed errors and HTTP mapping.

use crate::bridge::BridgeError;
use crate::package::archive::ArchiveError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config load: {0}")]
    Load(String),
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },
}

/// Import phases in the order they run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportPhase {
    Description,
    Application,
    Services,
    Schema,
    Data,
    Files,
    Commit,
}

impl fmt::Display for ImportPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ImportPhase::Description => "description",
            ImportPhase::Application => "application",
            ImportPhase::Services => "services",
            ImportPhase::Schema => "schema",
            ImportPhase::Data => "data",
            ImportPhase::Files => "files",
            ImportPhase::Commit => "commit",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportPhase {
    Application,
    Archive,
    Description,
    Services,
    Schema,
    Data,
    Files,
    Delivery,
}

impl fmt::Display for ExportPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExportPhase::Application => "application",
            ExportPhase::Archive => "archive",
            ExportPhase::Description => "description",
            ExportPhase::Services => "services",
            ExportPhase::Schema => "schema",
            ExportPhase::Data => "data",
            ExportPhase::Files => "files",
            ExportPhase::Delivery => "delivery",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("import {phase} phase failed: {source}")]
    Import {
        phase: ImportPhase,
        #[source]
        source: Box<AppError>,
    },
    #[error("export {phase} phase failed: {source}")]
    Export {
        phase: ExportPhase,
        #[source]
        source: Box<AppError>,
    },
}

impl AppError {
    /// Attach the failing import phase. Already-attributed errors keep their original phase.
    pub fn in_import(self, phase: ImportPhase) -> Self {
        match self {
            AppError::Import { .. } => self,
            other => AppError::Import {
                phase,
                source: Box::new(other),
            },
        }
    }

    /// Attach the failing export phase. Already-attributed errors keep their original phase.
    pub fn in_export(self, phase: ExportPhase) -> Self {
        match self {
            AppError::Export { .. } => self,
            other => AppError::Export {
                phase,
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, past any phase context.
    pub fn root(&self) -> &AppError {
        match self {
            AppError::Import { source, .. } | AppError::Export { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.root() {
            AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Db(sqlx::Error::RowNotFound) => StatusCode::NOT_FOUND,
            AppError::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Bridge(e) => StatusCode::from_u16(e.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            AppError::Archive(ArchiveError::Invalid { .. }) => StatusCode::BAD_REQUEST,
            AppError::Archive(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Import { .. } | AppError::Export { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self.status() {
            StatusCode::BAD_REQUEST => "bad_request",
            StatusCode::NOT_FOUND => "not_found",
            StatusCode::FORBIDDEN => "forbidden",
            StatusCode::CONFLICT => "conflict",
            _ if matches!(self.root(), AppError::Config(_)) => "config_error",
            _ => "internal_error",
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            AppError::Import { phase, .. } => Some(serde_json::json!({ "phase": phase })),
            AppError::Export { phase, .. } => Some(serde_json::json!({ "phase": phase })),
            _ => None,
        }
    }
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code().to_string(),
                message: self.to_string(),
                details: self.details(),
            },
        };
        (status, Json(body)).into_response()
    }
}
