use crate::error::{CoreError, Result};
use crate::schema::{
    Document, DocumentRecord, ImageRecord, NewExtraction, TableRecord, TextContent,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use uuid::Uuid;

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

const DOCUMENT_COLUMNS: &str =
    "id, filename, original_filename, page_count, summary, created_at, updated_at";

pub struct Database {
    conn: Connection,
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn document_from_row(row: &Row<'_>) -> rusqlite::Result<Document> {
    Ok(Document {
        id: row.get(0)?,
        filename: row.get(1)?,
        original_filename: row.get(2)?,
        page_count: row.get(3)?,
        summary: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

impl Database {
    /// Open a database at the given path, apply PRAGMAs and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.apply_pragmas()?;
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.apply_pragmas()?;
        db.run_migrations()?;
        Ok(db)
    }

    fn apply_pragmas(&self) -> Result<()> {
        self.conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    fn run_migrations(&mut self) -> Result<()> {
        embedded::migrations::runner()
            .run(&mut self.conn)
            .map_err(|e| CoreError::Migration(e.to_string()))?;
        Ok(())
    }

    /// Names of the migrations applied so far, oldest first.
    pub fn applied_migrations(&mut self) -> Result<Vec<String>> {
        let applied = embedded::migrations::runner()
            .get_applied_migrations(&mut self.conn)
            .map_err(|e| CoreError::Migration(e.to_string()))?;
        Ok(applied
            .iter()
            .map(|m| format!("V{}__{}", m.version(), m.name()))
            .collect())
    }

    /// Persist a whole extraction (document, page texts, tables, images) atomically.
    pub fn insert_extraction(&self, extraction: &NewExtraction) -> Result<Document> {
        let now = Utc::now();
        let doc = &extraction.document;
        let tx = self.conn.unchecked_transaction()?;

        tx.execute(
            "INSERT INTO documents (id, filename, original_filename, page_count, summary,
                                    created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?5)",
            params![doc.id, doc.filename, doc.original_filename, doc.page_count, now],
        )?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO text_contents (id, document_id, page_number, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (page_number, content) in &extraction.pages {
                stmt.execute(params![new_id(), doc.id, page_number, content, now])?;
            }
        }

        {
            let mut stmt = tx.prepare(
                "INSERT INTO extracted_tables (id, document_id, page_number, table_index,
                                               table_data, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for table in &extraction.tables {
                let data = serde_json::to_string(&table.rows)?;
                stmt.execute(params![
                    new_id(),
                    doc.id,
                    table.page_number,
                    table.table_index,
                    data,
                    now,
                ])?;
            }
        }

        {
            let mut stmt = tx.prepare(
                "INSERT INTO images (id, document_id, page_number, image_index, filename,
                                     created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for image in &extraction.images {
                stmt.execute(params![
                    new_id(),
                    doc.id,
                    image.page_number,
                    image.image_index,
                    image.filename,
                    now,
                ])?;
            }
        }

        tx.commit()?;

        Ok(Document {
            id: doc.id.clone(),
            filename: doc.filename.clone(),
            original_filename: doc.original_filename.clone(),
            page_count: doc.page_count,
            summary: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Get a document row by id.
    pub fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?1");
        self.conn
            .query_row(&sql, params![id], document_from_row)
            .optional()
            .map_err(Into::into)
    }

    /// Get a document together with its text, tables and images.
    pub fn get_document_record(&self, id: &str) -> Result<Option<DocumentRecord>> {
        match self.get_document(id)? {
            Some(document) => Ok(Some(self.load_relations(document)?)),
            None => Ok(None),
        }
    }

    /// List documents newest first, with their relations.
    pub fn list_documents(&self, skip: i64, limit: i64) -> Result<Vec<DocumentRecord>> {
        let sql = format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?1 OFFSET ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let documents = stmt
            .query_map(params![limit, skip], document_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        documents
            .into_iter()
            .map(|doc| self.load_relations(doc))
            .collect()
    }

    pub fn count_documents(&self) -> Result<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        Ok(count)
    }

    fn load_relations(&self, document: Document) -> Result<DocumentRecord> {
        let text_contents = self.get_text_contents(&document.id)?;
        let tables = self.get_tables(&document.id)?;
        let images = self.get_images(&document.id)?;
        Ok(DocumentRecord {
            document,
            text_contents,
            tables,
            images,
        })
    }

    /// Page texts of a document in page order.
    pub fn get_text_contents(&self, document_id: &str) -> Result<Vec<TextContent>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, page_number, content, created_at
             FROM text_contents WHERE document_id = ?1
             ORDER BY page_number",
        )?;

        let rows = stmt.query_map(params![document_id], |row| {
            Ok(TextContent {
                id: row.get(0)?,
                page_number: row.get(1)?,
                content: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn get_tables(&self, document_id: &str) -> Result<Vec<TableRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, page_number, table_index, table_data, created_at
             FROM extracted_tables WHERE document_id = ?1
             ORDER BY page_number, table_index",
        )?;

        let rows = stmt.query_map(params![document_id], |row| {
            Ok(TableRecord {
                id: row.get(0)?,
                page_number: row.get(1)?,
                table_index: row.get(2)?,
                table_data: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn get_images(&self, document_id: &str) -> Result<Vec<ImageRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, document_id, page_number, image_index, filename, created_at
             FROM images WHERE document_id = ?1
             ORDER BY page_number, image_index",
        )?;

        let rows = stmt.query_map(params![document_id], image_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Look up the image row that owns a stored file name.
    pub fn get_image_by_filename(&self, filename: &str) -> Result<Option<ImageRecord>> {
        self.conn
            .query_row(
                "SELECT id, document_id, page_number, image_index, filename, created_at
                 FROM images WHERE filename = ?1",
                params![filename],
                image_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Store a generated summary. Returns `false` if the document does not exist.
    pub fn set_summary(&self, document_id: &str, summary: &str) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE documents SET summary = ?1, updated_at = ?2 WHERE id = ?3",
            params![summary, Utc::now(), document_id],
        )?;
        Ok(updated > 0)
    }

    /// Get a value from the service_state key-value table.
    pub fn get_service_state(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM service_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    /// Set a value in the service_state key-value table (upsert).
    pub fn set_service_state(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO service_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now()],
        )?;
        Ok(())
    }

    /// Timestamp of the newest document, if any.
    pub fn latest_document_at(&self) -> Result<Option<DateTime<Utc>>> {
        self.conn
            .query_row(
                "SELECT created_at FROM documents ORDER BY created_at DESC, rowid DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }
}

fn image_from_row(row: &Row<'_>) -> rusqlite::Result<ImageRecord> {
    Ok(ImageRecord {
        id: row.get(0)?,
        document_id: row.get(1)?,
        page_number: row.get(2)?,
        image_index: row.get(3)?,
        filename: row.get(4)?,
        created_at: row.get(5)?,
    })
}
