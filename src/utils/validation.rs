use std::collections::BTreeSet;

use crate::api::error::ValidationError;
use crate::models::{UploadPart, UploadRequest};

/// Longest sanitized name kept before the storage token is prepended.
pub const MAX_SANITIZED_LEN: usize = 128;

/// Name used when sanitization leaves nothing behind.
const FALLBACK_NAME: &str = "upload";

/// Checks an upload before anything touches the disk.
///
/// Both parts must be present with a usable filename, both extensions must be
/// in `allowed`, and the buffered parts must fit in `max_bytes`.
pub fn validate_upload<'a>(
    request: &'a UploadRequest,
    allowed: &BTreeSet<String>,
    max_bytes: usize,
) -> Result<(&'a UploadPart, &'a UploadPart), ValidationError> {
    let (Some(pdf), Some(excel)) = (request.pdf.as_ref(), request.excel.as_ref()) else {
        return Err(ValidationError::MissingFile);
    };

    if !(allowed_file(&pdf.file_name, allowed) && allowed_file(&excel.file_name, allowed)) {
        return Err(ValidationError::InvalidExtension);
    }

    if request.total_bytes() > max_bytes {
        return Err(ValidationError::PayloadTooLarge);
    }

    Ok((pdf, excel))
}

/// True when the text after the final `.` is an allowed extension (case-insensitive).
pub fn allowed_file(filename: &str, allowed: &BTreeSet<String>) -> bool {
    filename
        .rsplit_once('.')
        .is_some_and(|(_, ext)| allowed.contains(&ext.to_lowercase()))
}

/// Reduces a client-supplied name to a safe leaf filename.
///
/// Only ASCII alphanumerics, `.`, `-` and `_` survive; whitespace becomes `_`.
/// Any directory components are dropped first, so the result never contains a
/// separator or a parent reference.
pub fn sanitize_filename(filename: &str) -> String {
    let leaf = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();

    let mapped: String = leaf
        .chars()
        .filter_map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                Some(c)
            } else if c.is_whitespace() {
                Some('_')
            } else {
                None
            }
        })
        .collect();

    let trimmed = mapped.trim_matches(|c| c == '.' || c == '_');
    if trimmed.is_empty() || !trimmed.chars().any(|c| c.is_ascii_alphanumeric()) {
        return FALLBACK_NAME.to_string();
    }

    truncate_keeping_extension(trimmed, MAX_SANITIZED_LEN)
}

fn truncate_keeping_extension(name: &str, max_len: usize) -> String {
    if name.len() <= max_len {
        return name.to_string();
    }

    // ASCII only at this point, so byte slicing is safe
    match name.rsplit_once('.') {
        Some((stem, ext)) if ext.len() < max_len / 2 => {
            let keep = max_len - ext.len() - 1;
            format!("{}.{}", &stem[..keep.min(stem.len())], ext)
        }
        _ => name[..max_len].to_string(),
    }
}

/// Rejects download names that could address anything but a leaf inside the
/// upload directory. Performs no filesystem access.
pub fn validate_download_name(filename: &str) -> Result<(), ValidationError> {
    let rooted = filename.starts_with('/') || filename.starts_with('\\');
    if filename.is_empty()
        || rooted
        || filename.contains("..")
        || filename.contains(['/', '\\', '\0'])
    {
        if filename.contains("..") || rooted {
            tracing::warn!("Path traversal attempt detected: {:?}", filename);
        }
        return Err(ValidationError::InvalidFilename);
    }
    Ok(())
}
