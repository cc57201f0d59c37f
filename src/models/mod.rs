use bytes::Bytes;
use serde::Serialize;
use std::path::PathBuf;
use utoipa::ToSchema;

use crate::config::DEFAULT_SHEET_NAME;

/// One uploaded file part, fully buffered.
#[derive(Debug, Clone)]
pub struct UploadPart {
    pub file_name: String,
    pub data: Bytes,
}

/// A parsed `POST /process` body. Lives only for the duration of the request.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub pdf: Option<UploadPart>,
    pub excel: Option<UploadPart>,
    pub sheet_name: String,
}

impl Default for UploadRequest {
    fn default() -> Self {
        Self {
            pdf: None,
            excel: None,
            sheet_name: DEFAULT_SHEET_NAME.to_string(),
        }
    }
}

impl UploadRequest {
    pub fn total_bytes(&self) -> usize {
        [&self.pdf, &self.excel]
            .into_iter()
            .flatten()
            .map(|part| part.data.len())
            .sum()
    }
}

/// An uploaded file persisted under the upload directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    /// `<token>_<sanitized-original-name>`
    pub name: String,
    pub path: PathBuf,
    pub original_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Success,
}

/// Outcome of a completed pipeline run.
#[derive(Debug, Clone)]
pub struct ProcessingResult {
    pub output_path: PathBuf,
    pub status: ProcessingStatus,
}

impl ProcessingResult {
    pub fn completed(output_path: PathBuf) -> Self {
        Self {
            output_path,
            status: ProcessingStatus::Success,
        }
    }

    /// Basename of the artifact, used as the download reference.
    pub fn output_file_name(&self) -> String {
        self.output_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ProcessResponse {
    pub status: String,
    pub message: String,
    pub output_file: String,
    pub download_url: String,
}

impl From<&ProcessingResult> for ProcessResponse {
    fn from(result: &ProcessingResult) -> Self {
        let output_file = result.output_file_name();
        Self {
            status: "success".to_string(),
            message: "Processing completed successfully".to_string(),
            download_url: format!("/download/{}", output_file),
            output_file,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}
