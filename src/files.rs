use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Pool, Row, Sqlite};

pub const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

/// Storage cap for extracted text; upload responses carry a shorter slice.
const EXTRACTED_TEXT_STORE_CAP: usize = 50_000;
pub const EXTRACTED_TEXT_RESPONSE_CAP: usize = 10_000;

const EXTRACTION_FAILED_PLACEHOLDER: &str =
    "Erro ao extrair texto do arquivo. O arquivo foi armazenado mas o conteúdo não pôde ser processado.";

#[derive(Debug, Clone, Serialize)]
pub struct StoredFile {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub original_name: String,
    pub mime_type: String,
    pub size_bytes: i64,
    #[serde(skip_serializing)]
    pub extracted_text: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileSummary {
    pub id: String,
    pub name: String,
    pub original_name: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
}

/// Extracted text for one referenced document, keyed for prompt assembly.
#[derive(Debug, Clone)]
pub struct ExtractedDocument {
    pub name: String,
    pub extracted_text: Option<String>,
}

#[derive(Clone)]
pub struct FileStore {
    pool: Pool<Sqlite>,
}

impl FileStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS files (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                original_name TEXT NOT NULL,
                mime_type TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                extracted_text TEXT,
                created_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_files_user ON files(user_id, created_at DESC)",
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS file_bytes (
                file_id TEXT PRIMARY KEY,
                bytes BLOB NOT NULL,
                FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE CASCADE
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    /// Stores the raw bytes and metadata, extracting text on the way in.
    /// Extraction failure is non-fatal; a placeholder is stored instead.
    pub async fn store_upload(
        &self,
        user_id: &str,
        file_name: &str,
        mime_type: &str,
        bytes: &[u8],
    ) -> Result<StoredFile, String> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let extracted = match extract_text(file_name, bytes) {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(file_name, error = %err, "text extraction failed");
                EXTRACTION_FAILED_PLACEHOLDER.to_string()
            }
        };
        let stored_text: String = extracted.chars().take(EXTRACTED_TEXT_STORE_CAP).collect();

        let mut tx = self.pool.begin().await.map_err(|e| e.to_string())?;
        sqlx::query(
            r#"INSERT INTO files (id, user_id, name, original_name, mime_type, size_bytes, extracted_text, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&id)
        .bind(user_id)
        .bind(file_name)
        .bind(file_name)
        .bind(mime_type)
        .bind(bytes.len() as i64)
        .bind(&stored_text)
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query("INSERT INTO file_bytes (file_id, bytes) VALUES (?, ?)")
            .bind(&id)
            .bind(bytes)
            .execute(&mut *tx)
            .await
            .map_err(|e| e.to_string())?;

        tx.commit().await.map_err(|e| e.to_string())?;

        Ok(StoredFile {
            id,
            user_id: user_id.to_string(),
            name: file_name.to_string(),
            original_name: file_name.to_string(),
            mime_type: mime_type.to_string(),
            size_bytes: bytes.len() as i64,
            extracted_text: Some(stored_text),
            created_at: now,
        })
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<FileSummary>, String> {
        let rows = sqlx::query(
            r#"SELECT id, name, original_name, mime_type, size_bytes, created_at
               FROM files WHERE user_id = ? ORDER BY created_at DESC LIMIT 50"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        rows.iter()
            .map(|row| {
                let created_raw: String = row.try_get("created_at").map_err(|e| e.to_string())?;
                Ok(FileSummary {
                    id: row.try_get("id").map_err(|e| e.to_string())?,
                    name: row.try_get("name").map_err(|e| e.to_string())?,
                    original_name: row.try_get("original_name").map_err(|e| e.to_string())?,
                    mime_type: row.try_get("mime_type").map_err(|e| e.to_string())?,
                    size_bytes: row.try_get("size_bytes").map_err(|e| e.to_string())?,
                    created_at: DateTime::parse_from_rfc3339(&created_raw)
                        .map_err(|e| e.to_string())?
                        .with_timezone(&Utc),
                })
            })
            .collect()
    }

    /// Extracted texts for the given ids, restricted to the owning user.
    /// Unknown ids are silently absent from the result.
    pub async fn extracted_documents(
        &self,
        user_id: &str,
        file_ids: &[String],
    ) -> Result<Vec<ExtractedDocument>, String> {
        let mut out = Vec::with_capacity(file_ids.len());
        for file_id in file_ids {
            let row = sqlx::query(
                "SELECT name, extracted_text FROM files WHERE id = ? AND user_id = ?",
            )
            .bind(file_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
            if let Some(row) = row {
                out.push(ExtractedDocument {
                    name: row.try_get("name").map_err(|e| e.to_string())?,
                    extracted_text: row.try_get("extracted_text").map_err(|e| e.to_string())?,
                });
            }
        }
        Ok(out)
    }
}

/// Extraction by extension: PDFs go through pdf-extract, everything else is
/// read as UTF-8 with lossy fallback.
pub fn extract_text(file_name: &str, bytes: &[u8]) -> Result<String, String> {
    let lowered = file_name.to_ascii_lowercase();
    if lowered.ends_with(".pdf") {
        return pdf_extract::extract_text_from_mem(bytes).map_err(|e| e.to_string());
    }
    Ok(String::from_utf8_lossy(bytes).into_owned())
}
