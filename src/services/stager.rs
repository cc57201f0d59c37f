use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::api::error::AppError;
use crate::models::{StagedFile, UploadPart};
use crate::services::cleanup::CleanupGuard;
use crate::utils::validation::sanitize_filename;

/// The two staged inputs of one request, plus the guard that removes them.
#[derive(Debug)]
pub struct StagedInputs {
    pub pdf: StagedFile,
    pub excel: StagedFile,
    guard: CleanupGuard,
}

impl StagedInputs {
    /// Deletes both staged files. Consumes `self`, so it can only happen once.
    pub fn cleanup(self) {
        self.guard.release();
    }
}

/// Persists uploaded parts under the upload directory with collision-free names.
#[derive(Debug, Clone)]
pub struct FileStager {
    upload_dir: PathBuf,
}

impl FileStager {
    pub fn new(upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
        }
    }

    /// `<uuid>_<sanitized-original-name>`
    pub fn storage_name(original: &str) -> String {
        format!("{}_{}", Uuid::new_v4().simple(), sanitize_filename(original))
    }

    /// Writes both parts. On failure every file written so far for this request
    /// is removed before the error is returned.
    pub async fn persist(
        &self,
        pdf: &UploadPart,
        excel: &UploadPart,
    ) -> Result<StagedInputs, AppError> {
        let mut guard = CleanupGuard::new();

        let pdf = self.stage(pdf, &mut guard).await?;
        let excel = self.stage(excel, &mut guard).await?;

        tracing::info!("Saved files: {}, {}", pdf.name, excel.name);
        Ok(StagedInputs { pdf, excel, guard })
    }

    async fn stage(
        &self,
        part: &UploadPart,
        guard: &mut CleanupGuard,
    ) -> Result<StagedFile, AppError> {
        let name = Self::storage_name(&part.file_name);
        let path = self.upload_dir.join(&name);
        guard.track(path.clone());

        write_new_file(&path, &part.data)
            .await
            .map_err(AppError::storage_save)?;

        Ok(StagedFile {
            name,
            path,
            original_name: part.file_name.clone(),
        })
    }
}

async fn write_new_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    // create_new: a name collision is an error, never an overwrite
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(data).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::collections::HashSet;

    fn part(name: &str, data: &'static [u8]) -> UploadPart {
        UploadPart {
            file_name: name.to_string(),
            data: Bytes::from_static(data),
        }
    }

    #[tokio::test]
    async fn test_persist_writes_both_parts() {
        let dir = tempfile::tempdir().unwrap();
        let stager = FileStager::new(dir.path());

        let staged = stager
            .persist(&part("../invoice.pdf", b"%PDF-1.4"), &part("ledger.xlsx", b"PK"))
            .await
            .unwrap();

        assert!(staged.pdf.name.ends_with("_invoice.pdf"));
        assert_eq!(staged.pdf.original_name, "../invoice.pdf");
        assert_eq!(staged.pdf.path.parent(), Some(dir.path()));
        assert_eq!(std::fs::read(&staged.pdf.path).unwrap(), b"%PDF-1.4");
        assert_eq!(std::fs::read(&staged.excel.path).unwrap(), b"PK");

        let (pdf_path, excel_path) = (staged.pdf.path.clone(), staged.excel.path.clone());
        staged.cleanup();
        assert!(!pdf_path.exists());
        assert!(!excel_path.exists());
    }

    #[tokio::test]
    async fn test_persist_failure_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let stager = FileStager::new(&missing);

        let err = stager
            .persist(&part("a.pdf", b"a"), &part("b.xlsx", b"b"))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Storage { .. }));
        assert!(!missing.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_storage_names_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let stager = FileStager::new(dir.path());

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let stager = stager.clone();
                tokio::spawn(async move {
                    let staged = stager
                        .persist(&part("same.pdf", b"a"), &part("same.xlsx", b"b"))
                        .await
                        .unwrap();
                    let names = vec![staged.pdf.name.clone(), staged.excel.name.clone()];
                    // keep files on disk until every task is done
                    std::mem::forget(staged);
                    names
                })
            })
            .collect();

        let mut names = HashSet::new();
        for handle in handles {
            for name in handle.await.unwrap() {
                assert!(names.insert(name));
            }
        }
        assert_eq!(names.len(), 64);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 64);
    }
}
