use axum::{
    body::Body,
    extract::{Path, State},
    http::header,
    response::Response,
};
use tokio_util::io::ReaderStream;

use crate::AppState;
use crate::api::error::AppError;
use crate::services::download::{XLSX_CONTENT_TYPE, content_disposition};

#[utoipa::path(
    get,
    path = "/download/{filename}",
    params(
        ("filename" = String, Path, description = "Output file name returned by /process")
    ),
    responses(
        (status = 200, description = "Workbook stream"),
        (status = 400, description = "Invalid filename", body = crate::models::ErrorResponse),
        (status = 404, description = "File not found", body = crate::models::ErrorResponse),
        (status = 500, description = "Read failure", body = crate::models::ErrorResponse)
    ),
    tag = "processing"
)]
pub async fn download_file(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, AppError> {
    let artifact = state.downloads.open(&filename).await?;

    let body = Body::from_stream(ReaderStream::new(artifact.file));
    Response::builder()
        .header(header::CONTENT_TYPE, XLSX_CONTENT_TYPE)
        .header(
            header::CONTENT_DISPOSITION,
            content_disposition(&artifact.file_name),
        )
        .header(header::CONTENT_LENGTH, artifact.len)
        .body(body)
        .map_err(|e| AppError::storage_read(std::io::Error::other(e)))
}
