use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageFormat};

use crate::error::{CoreError, Result};

/// Build the file name for an extracted image.
///
/// Format: `{document_id}_page_{page}_image_{index}.png` (both counters 1-based).
pub fn image_filename(document_id: &str, page: u32, index: u32) -> String {
    format!("{document_id}_page_{page}_image_{index}.png")
}

/// Public URL under which an extracted image is served.
pub fn image_url(api_prefix: &str, filename: &str) -> String {
    format!("{}/images/{filename}", api_prefix.trim_end_matches('/'))
}

/// Save an image as PNG to the given path. Returns the file size in bytes.
pub fn save_png(image: &DynamicImage, path: &Path) -> Result<u64> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let file = fs::File::create(path)?;
    let mut writer = BufWriter::new(file);
    image
        .write_to(&mut writer, ImageFormat::Png)
        .map_err(|e| CoreError::Image(format!("encode png {}: {e}", path.display())))?;
    writer.flush()?;

    Ok(fs::metadata(path)?.len())
}

/// Write an uploaded PDF into `upload_dir` under a unique name.
///
/// Returns `(stored_filename, full_path)`.
pub fn save_upload(
    upload_dir: &Path,
    original_name: &str,
    bytes: &[u8],
) -> Result<(String, PathBuf)> {
    fs::create_dir_all(upload_dir)?;
    let stored = format!(
        "{}_{}",
        uuid::Uuid::new_v4().simple(),
        sanitize_filename(original_name)
    );
    let path = upload_dir.join(&stored);
    fs::write(&path, bytes)?;
    Ok((stored, path))
}

/// Reduce a client-supplied name to its final component with a conservative charset.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload.pdf".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Whether a requested file name may be resolved inside a storage directory.
pub fn is_safe_filename(name: &str) -> bool {
    !name.is_empty()
        && !name.contains(['/', '\\', '\0'])
        && name != "."
        && !name.contains("..")
}

/// Walk a directory and sum file sizes.
pub fn dir_size(path: &Path) -> u64 {
    fs::read_dir(path)
        .into_iter()
        .flatten()
        .filter_map(|e| e.ok())
        .map(|e| {
            let meta = e.metadata().ok();
            if meta.as_ref().map(|m| m.is_dir()).unwrap_or(false) {
                dir_size(&e.path())
            } else {
                meta.map(|m| m.len()).unwrap_or(0)
            }
        })
        .sum()
}

/// Best-effort removal of files written before a failure.
pub fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove file");
            }
        }
    }
}
