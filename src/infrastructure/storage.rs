use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

/// Creates the upload directory if needed and checks that it is writable.
pub async fn setup_upload_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("cannot create upload directory {}", dir.display()))?;

    let probe = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("upload directory {} is not writable", dir.display()))?;
    drop(probe);

    info!("📁 Upload directory: {}", dir.display());
    Ok(())
}
