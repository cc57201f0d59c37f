use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use tokio::fs::File;

use crate::api::error::AppError;
use crate::utils::validation::validate_download_name;

pub const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// An artifact opened for streaming.
#[derive(Debug)]
pub struct Artifact {
    pub file: File,
    pub file_name: String,
    pub len: u64,
}

/// Resolves client-supplied names to files strictly inside the upload directory.
#[derive(Debug, Clone)]
pub struct DownloadGateway {
    upload_dir: PathBuf,
}

impl DownloadGateway {
    pub fn new(upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
        }
    }

    /// Validates the name, then canonicalizes the joined path and checks it is
    /// still under the upload directory. Symlinks pointing out count as missing.
    pub async fn resolve(&self, filename: &str) -> Result<PathBuf, AppError> {
        validate_download_name(filename)?;

        let root = tokio::fs::canonicalize(&self.upload_dir)
            .await
            .map_err(|e| not_found_or_read(e, filename))?;
        let candidate = match tokio::fs::canonicalize(root.join(filename)).await {
            Ok(path) => path,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(AppError::NotFound(filename.to_string()));
            }
            Err(e) => return Err(AppError::storage_read(e)),
        };

        if !candidate.starts_with(&root) {
            tracing::warn!(
                "Download of {:?} resolves outside the upload directory",
                filename
            );
            return Err(AppError::NotFound(filename.to_string()));
        }
        Ok(candidate)
    }

    pub async fn open(&self, filename: &str) -> Result<Artifact, AppError> {
        let path = self.resolve(filename).await?;
        let file = File::open(&path).await.map_err(|e| not_found_or_read(e, filename))?;
        let meta = file.metadata().await.map_err(AppError::storage_read)?;
        if !meta.is_file() {
            return Err(AppError::NotFound(filename.to_string()));
        }

        tracing::info!("📎 Serving {}", path.display());
        Ok(Artifact {
            file,
            file_name: file_name_of(&path).unwrap_or_else(|| filename.to_string()),
            len: meta.len(),
        })
    }
}

fn not_found_or_read(e: std::io::Error, filename: &str) -> AppError {
    if e.kind() == ErrorKind::NotFound {
        AppError::NotFound(filename.to_string())
    } else {
        AppError::storage_read(e)
    }
}

fn file_name_of(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

/// `attachment` disposition with an ASCII fallback plus the RFC 5987 form.
pub fn content_disposition(filename: &str) -> String {
    let ascii_filename = filename
        .chars()
        .filter(|c| c.is_ascii() && !c.is_control() && *c != '"' && *c != '\\' && *c != ';')
        .collect::<String>();
    let fallback = if ascii_filename.is_empty() {
        "download"
    } else {
        &ascii_filename
    };
    let encoded = utf8_percent_encode(filename, NON_ALPHANUMERIC);
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback, encoded
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::error::ValidationError;

    #[tokio::test]
    async fn test_resolve_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("processed_a.xlsx"), b"x").unwrap();
        let gateway = DownloadGateway::new(dir.path());

        let path = gateway.resolve("processed_a.xlsx").await.unwrap();
        assert_eq!(path.file_name().unwrap(), "processed_a.xlsx");

        let artifact = gateway.open("processed_a.xlsx").await.unwrap();
        assert_eq!(artifact.len, 1);
    }

    #[tokio::test]
    async fn test_resolve_rejects_traversal_before_io() {
        // the upload directory does not exist, so any filesystem access would fail differently
        let gateway = DownloadGateway::new("/nonexistent/uploads");
        for name in ["../etc/passwd", "/etc/passwd", "..", "a/b.xlsx", "", "a\\b"] {
            let err = gateway.resolve(name).await.unwrap_err();
            assert!(
                matches!(err, AppError::Validation(ValidationError::InvalidFilename)),
                "{name:?} gave {err:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = DownloadGateway::new(dir.path());
        assert!(matches!(
            gateway.resolve("does-not-exist.xlsx").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_upload_dir_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = DownloadGateway::new(dir.path().join("never-created"));
        assert!(matches!(
            gateway.open("processed_a.xlsx").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_directory_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let gateway = DownloadGateway::new(dir.path());
        assert!(matches!(gateway.open("sub").await, Err(AppError::NotFound(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_escape_is_not_found() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), b"s").unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("secret.txt"),
            dir.path().join("link.xlsx"),
        )
        .unwrap();

        let gateway = DownloadGateway::new(dir.path());
        assert!(matches!(
            gateway.resolve("link.xlsx").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn test_content_disposition() {
        assert_eq!(
            content_disposition("processed_ledger.xlsx"),
            "attachment; filename=\"processed_ledger.xlsx\"; filename*=UTF-8''processed%5Fledger%2Exlsx"
        );
    }
}
