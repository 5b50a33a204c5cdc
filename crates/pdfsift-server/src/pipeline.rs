use std::path::{Path, PathBuf};
use std::sync::Mutex;

use pdfsift_core::pdf;
use pdfsift_core::db::Database;
use pdfsift_core::schema::{
    Document, ExtractResponse, NewDocument, NewExtraction, NewImage, NewTable, SummaryResponse,
};
use pdfsift_core::storage;
use pdfsift_core::CoreError;
use tracing::{debug, info, warn};

use crate::error::{ApiError, ApiResult};
use crate::state::{lock_db, AppState};

const PDF_MAGIC: &[u8] = b"%PDF-";

/// An uploaded file as received from the client.
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Reject uploads that are empty, not named `*.pdf`, or lack the PDF header.
pub fn validate_upload(upload: &Upload) -> Result<(), CoreError> {
    if upload.filename.is_empty() {
        return Err(CoreError::InvalidUpload("No file provided".to_string()));
    }
    if !upload.filename.to_ascii_lowercase().ends_with(".pdf") {
        return Err(CoreError::InvalidUpload(
            "Only PDF files are allowed".to_string(),
        ));
    }
    if upload.bytes.is_empty() {
        return Err(CoreError::InvalidUpload("Uploaded file is empty".to_string()));
    }
    if !upload.bytes.starts_with(PDF_MAGIC) {
        return Err(CoreError::InvalidUpload(
            "File content is not a valid PDF".to_string(),
        ));
    }
    Ok(())
}

/// Files written while preparing one document.
struct Prepared {
    extraction: NewExtraction,
    written_images: Vec<PathBuf>,
}

/// Save the upload, extract it and write its images. Blocking.
fn prepare(
    upload_dir: &Path,
    image_dir: &Path,
    document_id: &str,
    upload: &Upload,
) -> pdfsift_core::Result<Prepared> {
    let (stored_name, stored_path) =
        storage::save_upload(upload_dir, &upload.filename, &upload.bytes)?;
    debug!(path = %stored_path.display(), "upload saved");

    let extracted = pdf::extract(&upload.bytes)?;

    let mut pages = Vec::with_capacity(extracted.pages.len());
    let mut tables = Vec::new();
    let mut images = Vec::new();
    let mut written_images = Vec::new();

    for page in extracted.pages {
        let page_number = i64::from(page.number);

        for (i, rows) in page.tables.into_iter().enumerate() {
            tables.push(NewTable {
                page_number,
                table_index: i as i64 + 1,
                rows,
            });
        }

        for image in &page.images {
            let filename = storage::image_filename(document_id, page.number, image.index);
            let path = image_dir.join(&filename);
            if let Err(e) = storage::save_png(&image.image, &path) {
                storage::remove_files(&written_images);
                return Err(e);
            }
            written_images.push(path);
            images.push(NewImage {
                page_number,
                image_index: i64::from(image.index),
                filename,
            });
        }

        pages.push((page_number, page.text));
    }

    let extraction = NewExtraction {
        document: NewDocument {
            id: document_id.to_string(),
            filename: stored_name,
            original_filename: upload.filename.clone(),
            page_count: pages.len() as i64,
        },
        pages,
        tables,
        images,
    };
    Ok(Prepared {
        extraction,
        written_images,
    })
}

/// Write the extraction rows. On failure the image files written for it are removed.
fn persist(
    db: &Mutex<Database>,
    extraction: &NewExtraction,
    written_images: &[PathBuf],
) -> pdfsift_core::Result<Document> {
    let result = lock_db(db).insert_extraction(extraction);
    if result.is_err() {
        storage::remove_files(written_images);
    }
    result
}

/// Run one upload through validation, extraction, persistence and
/// (optionally) summarization.
pub async fn process_upload(
    state: &AppState,
    upload: Upload,
    include_summary: bool,
) -> ApiResult<ExtractResponse> {
    validate_upload(&upload)?;

    let document_id = uuid::Uuid::new_v4().to_string();
    info!(
        document_id = %document_id,
        filename = %upload.filename,
        bytes = upload.bytes.len(),
        "processing upload"
    );

    let prepared = {
        let upload_dir = state.upload_dir.clone();
        let image_dir = state.image_dir.clone();
        let document_id = document_id.clone();
        tokio::task::spawn_blocking(move || prepare(&upload_dir, &image_dir, &document_id, &upload))
            .await??
    };

    let Prepared {
        extraction,
        written_images,
    } = prepared;
    let page_texts: Vec<(u32, String)> = extraction
        .pages
        .iter()
        .map(|(n, text)| (*n as u32, text.clone()))
        .collect();

    let db = state.db.clone();
    let stored =
        tokio::task::spawn_blocking(move || persist(&db, &extraction, &written_images)).await??;
    info!(document_id = %stored.id, pages = stored.page_count, "document stored");

    let mut summary = None;
    if include_summary {
        if let Some(summarizer) = &state.summarizer {
            match summarizer.summarize_pages(&page_texts).await {
                Ok(Some(text)) => {
                    store_summary(state, &document_id, &text).await;
                    summary = Some(text);
                }
                Ok(None) => debug!(document_id = %document_id, "no text to summarize"),
                Err(e) => warn!(document_id = %document_id, error = %e, "summary generation failed"),
            }
        }
    }

    let mut response = load_record(state, &document_id)
        .await?
        .to_extract_response(state.api_prefix());
    response.summary = summary;
    Ok(response)
}

async fn store_summary(state: &AppState, document_id: &str, summary: &str) {
    let db = state.db.clone();
    let id = document_id.to_string();
    let summary = summary.to_string();
    let result = tokio::task::spawn_blocking(move || lock_db(&db).set_summary(&id, &summary)).await;
    match result {
        Ok(Ok(true)) => debug!(document_id = %document_id, "summary stored"),
        Ok(Ok(false)) => warn!(document_id = %document_id, "document vanished before summary was stored"),
        Ok(Err(e)) => warn!(document_id = %document_id, error = %e, "failed to store summary"),
        Err(e) => warn!(document_id = %document_id, error = %e, "summary store task panicked"),
    }
}

async fn load_record(
    state: &AppState,
    document_id: &str,
) -> ApiResult<pdfsift_core::schema::DocumentRecord> {
    let db = state.db.clone();
    let id = document_id.to_string();
    tokio::task::spawn_blocking(move || lock_db(&db).get_document_record(&id))
        .await??
        .ok_or_else(|| ApiError::NotFound("Document not found".to_string()))
}

/// Summarize a stored document on demand and persist the result.
pub async fn summarize_document(state: &AppState, document_id: &str) -> ApiResult<SummaryResponse> {
    let summarizer = state.summarizer.as_ref().ok_or_else(|| {
        ApiError::LlmUnavailable("LLM service is not configured".to_string())
    })?;

    let record = load_record(state, document_id).await?;
    let summary = summarizer
        .summarize_pages(&record.page_texts())
        .await?
        .ok_or_else(|| ApiError::Unprocessable("Document has no text to summarize".to_string()))?;

    let db = state.db.clone();
    let id = document_id.to_string();
    let value = summary.clone();
    tokio::task::spawn_blocking(move || lock_db(&db).set_summary(&id, &value)).await??;

    info!(document_id = %document_id, chars = summary.len(), "summary generated on demand");
    Ok(SummaryResponse {
        id: document_id.to_string(),
        summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pdfsift_core::pdf::sample::{build_pdf, SampleImage, SamplePage};
    use tempfile::TempDir;

    fn upload(name: &str, bytes: &[u8]) -> Upload {
        Upload {
            filename: name.to_string(),
            bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn test_validate_upload() {
        assert!(validate_upload(&upload("a.pdf", b"%PDF-1.7\n")).is_ok());
        assert!(validate_upload(&upload("A.PDF", b"%PDF-1.4")).is_ok());

        for bad in [
            upload("", b"%PDF-1.4"),
            upload("notes.txt", b"%PDF-1.4"),
            upload("a.pdf", b""),
            upload("a.pdf", b"<html>"),
        ] {
            assert!(matches!(
                validate_upload(&bad),
                Err(CoreError::InvalidUpload(_))
            ));
        }
    }

    fn png_count(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "png"))
            .count()
    }

    fn two_image_upload() -> Upload {
        let pdf = build_pdf(&[SamplePage::new()
            .line(72.0, 700.0, "pictures")
            .image(SampleImage::solid(2, 2, [1, 2, 3]))
            .image(SampleImage::solid(3, 3, [4, 5, 6]))])
        .unwrap();
        upload("pictures.pdf", &pdf)
    }

    #[test]
    fn test_prepare_writes_images() {
        let dir = TempDir::new().unwrap();
        let (uploads, images) = (dir.path().join("pdfs"), dir.path().join("images"));
        std::fs::create_dir_all(&uploads).unwrap();
        std::fs::create_dir_all(&images).unwrap();

        let prepared = prepare(&uploads, &images, "doc-1", &two_image_upload()).unwrap();
        assert_eq!(prepared.written_images.len(), 2);
        assert_eq!(png_count(&images), 2);
        let names: Vec<&str> = prepared
            .extraction
            .images
            .iter()
            .map(|i| i.filename.as_str())
            .collect();
        assert_eq!(
            names,
            vec!["doc-1_page_1_image_1.png", "doc-1_page_1_image_2.png"]
        );
    }

    #[test]
    fn test_failed_insert_removes_written_images() {
        let dir = TempDir::new().unwrap();
        let (uploads, images) = (dir.path().join("pdfs"), dir.path().join("images"));
        std::fs::create_dir_all(&uploads).unwrap();
        std::fs::create_dir_all(&images).unwrap();

        let db = Mutex::new(Database::open_in_memory().unwrap());
        let first = build_pdf(&[SamplePage::new().line(72.0, 700.0, "first")]).unwrap();
        let existing = prepare(&uploads, &images, "taken", &upload("a.pdf", &first)).unwrap();
        persist(&db, &existing.extraction, &existing.written_images).unwrap();

        let prepared = prepare(&uploads, &images, "taken", &two_image_upload()).unwrap();
        assert_eq!(png_count(&images), 2);

        let result = persist(&db, &prepared.extraction, &prepared.written_images);
        assert!(result.is_err());
        assert_eq!(png_count(&images), 0);
        assert_eq!(lock_db(&db).count_documents().unwrap(), 1);
    }
}
