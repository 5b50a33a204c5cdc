use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::storage;

/// A table as extracted from a page: rows of cell strings.
pub type Table = Vec<Vec<String>>;

// -- Database model types --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub filename: String,
    pub original_filename: String,
    pub page_count: i64,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert DTO — fields needed to create a new document record.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub id: String,
    pub filename: String,
    pub original_filename: String,
    pub page_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextContent {
    pub id: String,
    pub page_number: i64,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRecord {
    pub id: String,
    pub page_number: i64,
    pub table_index: i64,
    /// JSON array of rows.
    pub table_data: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: String,
    pub document_id: String,
    pub page_number: i64,
    pub image_index: i64,
    pub filename: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTable {
    pub page_number: i64,
    pub table_index: i64,
    pub rows: Table,
}

#[derive(Debug, Clone)]
pub struct NewImage {
    pub page_number: i64,
    pub image_index: i64,
    pub filename: String,
}

/// Everything one extraction produces, written in a single transaction.
#[derive(Debug, Clone)]
pub struct NewExtraction {
    pub document: NewDocument,
    pub pages: Vec<(i64, String)>,
    pub tables: Vec<NewTable>,
    pub images: Vec<NewImage>,
}

/// A document row together with its child rows.
#[derive(Debug, Clone)]
pub struct DocumentRecord {
    pub document: Document,
    pub text_contents: Vec<TextContent>,
    pub tables: Vec<TableRecord>,
    pub images: Vec<ImageRecord>,
}

// -- API response types --

/// Per-page values keyed as `"Page N"` in page order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PageMap<T>(pub Vec<(u32, T)>);

pub fn page_key(page: u32) -> String {
    format!("Page {page}")
}

impl<T> PageMap<T> {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, page: u32) -> Option<&T> {
        self.0.iter().find(|(p, _)| *p == page).map(|(_, v)| v)
    }
}

impl<T: Serialize> Serialize for PageMap<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (page, value) in &self.0 {
            map.serialize_entry(&page_key(*page), value)?;
        }
        map.end()
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for PageMap<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, T>::deserialize(deserializer)?;
        let mut pages = raw
            .into_iter()
            .map(|(key, value)| {
                key.strip_prefix("Page ")
                    .and_then(|n| n.parse::<u32>().ok())
                    .map(|n| (n, value))
                    .ok_or_else(|| D::Error::custom(format!("invalid page key: {key}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        pages.sort_by_key(|(n, _)| *n);
        Ok(PageMap(pages))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TextData {
    pub pages: PageMap<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableData {
    pub pages: PageMap<Vec<Table>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageLink {
    pub url: String,
    pub page: i64,
    pub index: i64,
    pub filename: String,
    pub document_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractResponse {
    pub id: String,
    pub filename: String,
    pub text: TextData,
    pub tables: TableData,
    pub images: Vec<ImageLink>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageResponse {
    pub id: String,
    pub page_number: i64,
    pub image_index: i64,
    pub filename: String,
    pub created_at: DateTime<Utc>,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentResponse {
    pub id: String,
    pub filename: String,
    pub original_filename: String,
    pub page_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub text_contents: Vec<TextContent>,
    pub images: Vec<ImageResponse>,
    pub tables: Vec<TableRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentListResponse {
    pub documents: Vec<DocumentResponse>,
    pub total: i64,
    pub skip: i64,
    pub limit: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryResponse {
    pub id: String,
    pub summary: String,
}

impl DocumentRecord {
    /// Rebuild the extraction payload from stored rows.
    pub fn to_extract_response(&self, api_prefix: &str) -> ExtractResponse {
        let text = TextData {
            pages: PageMap(
                self.text_contents
                    .iter()
                    .map(|t| (t.page_number as u32, t.content.clone()))
                    .collect(),
            ),
        };

        let mut table_pages: Vec<(u32, Vec<Table>)> = Vec::new();
        for record in &self.tables {
            let rows: Table = match serde_json::from_str(&record.table_data) {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::warn!(table_id = %record.id, error = %e, "skipping unreadable table");
                    continue;
                }
            };
            let page = record.page_number as u32;
            match table_pages.last_mut() {
                Some((p, tables)) if *p == page => tables.push(rows),
                _ => table_pages.push((page, vec![rows])),
            }
        }

        let images = self
            .images
            .iter()
            .map(|img| ImageLink {
                url: storage::image_url(api_prefix, &img.filename),
                page: img.page_number,
                index: img.image_index,
                filename: img.filename.clone(),
                document_id: img.document_id.clone(),
            })
            .collect();

        ExtractResponse {
            id: self.document.id.clone(),
            filename: self.document.original_filename.clone(),
            text,
            tables: TableData {
                pages: PageMap(table_pages),
            },
            images,
            summary: self.document.summary.clone(),
            created_at: self.document.created_at,
        }
    }

    pub fn to_document_response(&self, api_prefix: &str) -> DocumentResponse {
        DocumentResponse {
            id: self.document.id.clone(),
            filename: self.document.filename.clone(),
            original_filename: self.document.original_filename.clone(),
            page_count: self.document.page_count,
            created_at: self.document.created_at,
            updated_at: Some(self.document.updated_at),
            summary: self.document.summary.clone(),
            text_contents: self.text_contents.clone(),
            images: self
                .images
                .iter()
                .map(|img| ImageResponse {
                    id: img.id.clone(),
                    page_number: img.page_number,
                    image_index: img.image_index,
                    filename: img.filename.clone(),
                    created_at: img.created_at,
                    url: storage::image_url(api_prefix, &img.filename),
                })
                .collect(),
            tables: self.tables.clone(),
        }
    }

    /// Page texts in the order the summarizer expects.
    pub fn page_texts(&self) -> Vec<(u32, String)> {
        self.text_contents
            .iter()
            .map(|t| (t.page_number as u32, t.content.clone()))
            .collect()
    }
}
