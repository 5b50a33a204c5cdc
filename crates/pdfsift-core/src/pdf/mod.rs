//! PDF content extraction: per-page text, tables and embedded images.
//!
//! Parsing is delegated to lopdf. Everything here is synchronous and CPU-bound;
//! async callers should run it inside `spawn_blocking`.

mod images;
mod layout;
mod tables;

#[cfg(any(test, feature = "test-support"))]
pub mod sample;

pub use layout::{runs_to_text, TextRun};
pub use tables::detect_tables;

use image::DynamicImage;
use lopdf::{Document, ObjectId};
use tracing::{debug, warn};

use crate::error::{CoreError, Result};
use crate::schema::Table;

/// A decoded image with its 1-based position among the page's image XObjects.
#[derive(Debug, Clone)]
pub struct PageImage {
    pub index: u32,
    pub image: DynamicImage,
}

/// Content from a single PDF page.
#[derive(Debug, Clone)]
pub struct ExtractedPage {
    /// Page number (1-indexed).
    pub number: u32,
    pub text: String,
    pub tables: Vec<Table>,
    /// Decoded images in the order they appear in the page resources.
    pub images: Vec<PageImage>,
}

/// Everything extracted from one document.
#[derive(Debug, Clone)]
pub struct ExtractedPdf {
    pub pages: Vec<ExtractedPage>,
}

impl ExtractedPdf {
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn image_count(&self) -> usize {
        self.pages.iter().map(|p| p.images.len()).sum()
    }

    pub fn table_count(&self) -> usize {
        self.pages.iter().map(|p| p.tables.len()).sum()
    }

    /// Whether any page produced non-whitespace text.
    pub fn has_text(&self) -> bool {
        self.pages.iter().any(|p| !p.text.trim().is_empty())
    }
}

/// PDF content extractor backed by a parsed lopdf document.
pub struct PdfExtractor {
    document: Document,
}

impl PdfExtractor {
    /// Parse a PDF from memory. Encrypted files are opened with the empty password.
    pub fn load(data: &[u8]) -> Result<Self> {
        let mut document =
            Document::load_mem(data).map_err(|e| CoreError::Pdf(format!("failed to parse PDF: {e}")))?;

        if document.is_encrypted() {
            if document.decrypt("").is_err() {
                return Err(CoreError::Pdf("PDF is password protected".to_string()));
            }
            debug!("decrypted PDF with empty password");
        }

        Ok(Self { document })
    }

    pub fn page_count(&self) -> u32 {
        self.document.get_pages().len() as u32
    }

    /// Extract text, tables and images from every page.
    pub fn extract_all(&self) -> Result<ExtractedPdf> {
        let pages = self.document.get_pages();
        if pages.is_empty() {
            return Err(CoreError::Pdf("PDF has no pages".to_string()));
        }

        let mut extracted = Vec::with_capacity(pages.len());
        for (&number, &page_id) in &pages {
            extracted.push(self.extract_page(number, page_id));
        }

        let result = ExtractedPdf { pages: extracted };
        debug!(
            pages = result.page_count(),
            images = result.image_count(),
            tables = result.table_count(),
            "PDF extraction finished"
        );
        Ok(result)
    }

    fn extract_page(&self, number: u32, page_id: ObjectId) -> ExtractedPage {
        let runs = match layout::page_text_runs(&self.document, page_id) {
            Ok(runs) => runs,
            Err(e) => {
                warn!(page = number, error = %e, "could not read page content stream");
                Vec::new()
            }
        };

        let text = match self.document.extract_text(&[number]) {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => runs_to_text(&runs),
            Err(e) => {
                debug!(page = number, error = %e, "text extraction failed, using layout runs");
                runs_to_text(&runs)
            }
        };

        let tables = detect_tables(&runs);
        let images = images::page_images(&self.document, page_id);

        ExtractedPage {
            number,
            text,
            tables,
            images,
        }
    }
}

/// Parse and extract a whole document in one call.
pub fn extract(data: &[u8]) -> Result<ExtractedPdf> {
    PdfExtractor::load(data)?.extract_all()
}

#[cfg(test)]
mod tests {
    use super::sample::{
        build_pdf, build_pdf_with_inherited_resources, empty_pdf, encrypted_pdf, SampleImage,
        SamplePage,
    };
    use super::*;

    #[test]
    fn test_rejects_garbage() {
        let err = extract(b"definitely not a pdf").err().unwrap();
        assert!(matches!(err, CoreError::Pdf(_)));
    }

    #[test]
    fn test_extracts_text_per_page() {
        let pdf = build_pdf(&[
            SamplePage::new().line(72.0, 700.0, "Hello from page one"),
            SamplePage::new().line(72.0, 700.0, "Second page text"),
        ])
        .unwrap();

        let extracted = extract(&pdf).unwrap();
        assert_eq!(extracted.page_count(), 2);
        assert_eq!(extracted.pages[0].number, 1);
        assert!(extracted.pages[0].text.contains("Hello from page one"));
        assert!(extracted.pages[1].text.contains("Second page text"));
        assert!(extracted.has_text());
        assert_eq!(extracted.image_count(), 0);
    }

    #[test]
    fn test_extracts_images_per_page() {
        let red = SampleImage::solid(3, 2, [255, 0, 0]);
        let blue = SampleImage::solid(2, 2, [0, 0, 255]);
        let pdf = build_pdf(&[
            SamplePage::new().line(72.0, 700.0, "no pictures here"),
            SamplePage::new()
                .line(72.0, 700.0, "two pictures")
                .image(red)
                .image(blue),
        ])
        .unwrap();

        let extracted = extract(&pdf).unwrap();
        assert!(extracted.pages[0].images.is_empty());
        assert_eq!(extracted.pages[1].images.len(), 2);

        assert_eq!(extracted.pages[1].images[0].index, 1);
        assert_eq!(extracted.pages[1].images[1].index, 2);
        let first = extracted.pages[1].images[0].image.to_rgb8();
        assert_eq!(first.dimensions(), (3, 2));
        assert_eq!(first.get_pixel(0, 0).0, [255, 0, 0]);
    }

    #[test]
    fn test_detects_table_on_page() {
        let pdf = build_pdf(&[SamplePage::new()
            .line(72.0, 760.0, "Inventory report")
            .line(72.0, 700.0, "Item")
            .line(220.0, 700.0, "Qty")
            .line(72.0, 685.0, "Bolt")
            .line(220.0, 685.0, "40")
            .line(72.0, 670.0, "Nut")
            .line(220.0, 670.0, "12")])
        .unwrap();

        let extracted = extract(&pdf).unwrap();
        let tables = &extracted.pages[0].tables;
        assert_eq!(tables.len(), 1);
        assert_eq!(
            tables[0],
            vec![
                vec!["Item".to_string(), "Qty".to_string()],
                vec!["Bolt".to_string(), "40".to_string()],
                vec!["Nut".to_string(), "12".to_string()],
            ]
        );
    }

    #[test]
    fn test_rejects_pdf_without_pages() {
        let err = extract(&empty_pdf().unwrap()).err().unwrap();
        assert!(matches!(err, CoreError::Pdf(_)));
    }

    #[test]
    fn test_images_from_inherited_resources() {
        let pdf = build_pdf_with_inherited_resources(&[SamplePage::new()
            .line(72.0, 700.0, "shared resources")
            .image(SampleImage::solid(4, 4, [0, 255, 0]))])
        .unwrap();

        let extracted = extract(&pdf).unwrap();
        let page = &extracted.pages[0];
        assert_eq!(page.images.len(), 1);
        assert_eq!(page.images[0].image.to_rgb8().get_pixel(0, 0).0, [0, 255, 0]);
        assert!(page.text.contains("shared resources"));
    }

    #[test]
    fn test_images_inside_form_xobjects() {
        let pdf = build_pdf(&[SamplePage::new()
            .image(SampleImage::solid(2, 2, [255, 0, 0]))
            .form_image(SampleImage::solid(5, 3, [0, 0, 255]))])
        .unwrap();

        let extracted = extract(&pdf).unwrap();
        let images = &extracted.pages[0].images;
        assert_eq!(images.len(), 2);
        assert_eq!(images[1].index, 2);
        assert_eq!(images[1].image.to_rgb8().dimensions(), (5, 3));
    }

    #[test]
    fn test_unsupported_image_keeps_its_position() {
        let pdf = build_pdf(&[SamplePage::new()
            .jpx_placeholder()
            .image(SampleImage::solid(2, 2, [9, 9, 9]))])
        .unwrap();

        let extracted = extract(&pdf).unwrap();
        let images = &extracted.pages[0].images;
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].index, 2);
    }

    #[test]
    fn test_opens_pdf_encrypted_with_empty_password() {
        let pages = [SamplePage::new().line(72.0, 700.0, "locked but readable")];
        let pdf = encrypted_pdf(&pages, "").unwrap();

        let extractor = PdfExtractor::load(&pdf).unwrap();
        assert_eq!(extractor.page_count(), 1);
        let extracted = extractor.extract_all().unwrap();
        assert!(extracted.pages[0].text.contains("locked but readable"));
    }

    #[test]
    fn test_rejects_pdf_needing_a_password() {
        let pages = [SamplePage::new().line(72.0, 700.0, "secret")];
        let pdf = encrypted_pdf(&pages, "hunter2").unwrap();

        let err = extract(&pdf).err().unwrap();
        assert!(matches!(err, CoreError::Pdf(_)));
    }
}
