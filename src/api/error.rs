use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::services::pipeline::PipelineError;

/// Client input that is missing, malformed or unsafe. Detected before any disk I/O.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing file")]
    MissingFile,

    #[error("invalid extension")]
    InvalidExtension,

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("malformed multipart body: {0}")]
    MalformedBody(String),

    #[error("invalid filename")]
    InvalidFilename,
}

impl ValidationError {
    pub fn public_message(&self) -> &'static str {
        match self {
            ValidationError::MissingFile => "Both PDF and Excel files are required.",
            ValidationError::InvalidExtension => {
                "Invalid file type. Only PDF and Excel files are allowed."
            }
            ValidationError::PayloadTooLarge => "Uploaded files exceed the maximum allowed size.",
            ValidationError::MalformedBody(_) => "Malformed multipart request.",
            ValidationError::InvalidFilename => "Invalid filename",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOp {
    Save,
    Read,
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage error ({op:?}): {source}")]
    Storage {
        op: StorageOp,
        #[source]
        source: std::io::Error,
    },

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Not Found: {0}")]
    NotFound(String),
}

impl AppError {
    pub fn storage_save(source: std::io::Error) -> Self {
        AppError::Storage {
            op: StorageOp::Save,
            source,
        }
    }

    pub fn storage_read(source: std::io::Error) -> Self {
        AppError::Storage {
            op: StorageOp::Read,
            source,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Storage { .. } | AppError::Pipeline(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let message = match &self {
            AppError::Validation(e) => {
                tracing::debug!("Rejected request: {}", e);
                e.public_message()
            }
            AppError::Storage {
                op: StorageOp::Save,
                source,
            } => {
                tracing::error!("Error saving files: {}", source);
                "Error saving uploaded files"
            }
            AppError::Storage {
                op: StorageOp::Read,
                source,
            } => {
                tracing::error!("Error downloading file: {:?}", source);
                "Error downloading file"
            }
            AppError::Pipeline(e) => {
                tracing::error!(stage = %e.stage(), "Error processing request: {}", e);
                "An error occurred while processing your request"
            }
            AppError::NotFound(what) => {
                tracing::debug!("Not found: {}", what);
                "File not found"
            }
        };

        let body = Json(json!({
            "error": message
        }));

        (self.status(), body).into_response()
    }
}
