use axum::{
    Json,
    extract::{
        Multipart, State,
        multipart::{MultipartError, MultipartRejection},
    },
    http::StatusCode,
};
use utoipa::ToSchema;

use crate::AppState;
use crate::api::error::{AppError, ValidationError};
use crate::config::DEFAULT_SHEET_NAME;
use crate::models::{ProcessResponse, UploadPart, UploadRequest};
use crate::utils::validation::validate_upload;

/// Multipart form accepted by `POST /process`.
#[derive(ToSchema)]
#[allow(dead_code)]
pub struct ProcessForm {
    /// Invoice document
    #[schema(value_type = String, format = Binary)]
    pub pdf: Vec<u8>,
    /// Ledger workbook (.xlsx)
    #[schema(value_type = String, format = Binary)]
    pub excel: Vec<u8>,
    /// Worksheet to reconcile against
    #[schema(default = "COA i-Kcal")]
    pub sheet_name: Option<String>,
}

#[utoipa::path(
    post,
    path = "/process",
    request_body(content = ProcessForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Workbook updated", body = ProcessResponse),
        (status = 400, description = "Missing, invalid or oversized upload", body = crate::models::ErrorResponse),
        (status = 500, description = "Staging or processing failed", body = crate::models::ErrorResponse)
    ),
    tag = "processing"
)]
pub async fn process_documents(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<ProcessResponse>, AppError> {
    let request = match multipart {
        Ok(multipart) => read_upload(multipart).await?,
        // a body that is not multipart carries no files
        Err(rejection) => {
            tracing::debug!("Non-multipart body on /process: {}", rejection);
            UploadRequest::default()
        }
    };

    let (pdf, excel) = validate_upload(
        &request,
        &state.config.allowed_extensions,
        state.config.max_upload_bytes,
    )?;

    let inputs = state.stager.persist(pdf, excel).await?;
    let result = state.pipeline.run(inputs, &request.sheet_name).await?;

    Ok(Json(ProcessResponse::from(&result)))
}

/// Buffers the `pdf` and `excel` parts and the optional `sheet_name` field.
/// Unknown fields are drained and ignored. A file part without a filename
/// counts as absent.
pub async fn read_upload(mut multipart: Multipart) -> Result<UploadRequest, AppError> {
    let mut request = UploadRequest::default();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "pdf" | "excel" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let data = field.bytes().await.map_err(multipart_error)?;
                if file_name.is_empty() {
                    continue;
                }
                let part = Some(UploadPart { file_name, data });
                if name == "pdf" {
                    request.pdf = part;
                } else {
                    request.excel = part;
                }
            }
            "sheet_name" => {
                let text = field.text().await.map_err(multipart_error)?;
                let text = text.trim();
                request.sheet_name = if text.is_empty() {
                    DEFAULT_SHEET_NAME.to_string()
                } else {
                    text.to_string()
                };
            }
            _ => {
                field.bytes().await.map_err(multipart_error)?;
            }
        }
    }

    Ok(request)
}

fn multipart_error(e: MultipartError) -> AppError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ValidationError::PayloadTooLarge.into()
    } else {
        ValidationError::MalformedBody(e.body_text()).into()
    }
}
