use crate::config::ProviderKind;
use crate::providers::ChatRole;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Pool, Row, Sqlite};

#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub model: String,
    pub provider: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub model: String,
    pub provider: String,
    pub message_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable once written; model/provider/token fields are only present for
/// non-user roles.
#[derive(Debug, Clone, Serialize)]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: String,
    pub role: ChatRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: ChatRole,
    pub content: String,
    pub model: Option<String>,
    pub provider: Option<ProviderKind>,
    pub token_count: Option<u64>,
    pub latency_ms: Option<u64>,
}

impl NewMessage {
    /// A message copied from the inbound request. Attribution fields are
    /// only stamped on non-user roles.
    pub fn from_request(
        role: ChatRole,
        content: impl Into<String>,
        model: &str,
        provider: ProviderKind,
    ) -> Self {
        let attributed = role != ChatRole::User;
        Self {
            role,
            content: content.into(),
            model: attributed.then(|| model.to_string()),
            provider: attributed.then_some(provider),
            token_count: None,
            latency_ms: None,
        }
    }
}

#[derive(Clone)]
pub struct ConversationStore {
    pool: Pool<Sqlite>,
}

impl ConversationStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                model TEXT NOT NULL,
                provider TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                model TEXT,
                provider TEXT,
                token_count INTEGER,
                latency_ms INTEGER,
                created_at TEXT NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, seq)",
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_conversations_user ON conversations(user_id, created_at DESC)",
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    /// Creates the conversation and all of its messages in one transaction;
    /// a half-written conversation is never visible.
    pub async fn create_with_messages(
        &self,
        user_id: &str,
        title: &str,
        model: &str,
        provider: ProviderKind,
        messages: &[NewMessage],
    ) -> Result<Conversation, String> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        let mut tx = self.pool.begin().await.map_err(|e| e.to_string())?;

        sqlx::query(
            r#"INSERT INTO conversations (id, user_id, title, model, provider, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&id)
        .bind(user_id)
        .bind(title)
        .bind(model)
        .bind(provider.as_str())
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(|e| e.to_string())?;

        for (seq, message) in messages.iter().enumerate() {
            sqlx::query(
                r#"INSERT INTO messages (id, conversation_id, seq, role, content, model, provider, token_count, latency_ms, created_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(&id)
            .bind(seq as i64)
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(message.model.as_deref())
            .bind(message.provider.map(|p| p.as_str()))
            .bind(message.token_count.map(|t| t as i64))
            .bind(message.latency_ms.map(|l| l as i64))
            .bind(now.to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(|e| e.to_string())?;
        }

        tx.commit().await.map_err(|e| e.to_string())?;

        Ok(Conversation {
            id,
            user_id: user_id.to_string(),
            title: title.to_string(),
            model: model.to_string(),
            provider: provider.as_str().to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<ConversationSummary>, String> {
        let rows = sqlx::query(
            r#"SELECT c.id, c.title, c.model, c.provider, c.created_at, c.updated_at,
                      (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id) AS message_count
               FROM conversations c
               WHERE c.user_id = ?
               ORDER BY c.created_at DESC"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        rows.iter()
            .map(|row| {
                Ok(ConversationSummary {
                    id: row.try_get("id").map_err(|e| e.to_string())?,
                    title: row.try_get("title").map_err(|e| e.to_string())?,
                    model: row.try_get("model").map_err(|e| e.to_string())?,
                    provider: row.try_get("provider").map_err(|e| e.to_string())?,
                    message_count: row.try_get("message_count").map_err(|e| e.to_string())?,
                    created_at: parse_ts(row.try_get("created_at").map_err(|e| e.to_string())?)?,
                    updated_at: parse_ts(row.try_get("updated_at").map_err(|e| e.to_string())?)?,
                })
            })
            .collect()
    }

    pub async fn get_with_messages(
        &self,
        id: &str,
        user_id: &str,
    ) -> Result<Option<(Conversation, Vec<MessageRecord>)>, String> {
        let row = sqlx::query(
            "SELECT id, user_id, title, model, provider, created_at, updated_at FROM conversations WHERE id = ? AND user_id = ?",
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        let Some(row) = row else {
            return Ok(None);
        };
        let conversation = Conversation {
            id: row.try_get("id").map_err(|e| e.to_string())?,
            user_id: row.try_get("user_id").map_err(|e| e.to_string())?,
            title: row.try_get("title").map_err(|e| e.to_string())?,
            model: row.try_get("model").map_err(|e| e.to_string())?,
            provider: row.try_get("provider").map_err(|e| e.to_string())?,
            created_at: parse_ts(row.try_get("created_at").map_err(|e| e.to_string())?)?,
            updated_at: parse_ts(row.try_get("updated_at").map_err(|e| e.to_string())?)?,
        };

        let message_rows = sqlx::query(
            r#"SELECT id, conversation_id, role, content, model, provider, token_count, latency_ms, created_at
               FROM messages WHERE conversation_id = ? ORDER BY seq ASC"#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        let messages = message_rows
            .iter()
            .map(|row| {
                let role_raw: String = row.try_get("role").map_err(|e| e.to_string())?;
                Ok(MessageRecord {
                    id: row.try_get("id").map_err(|e| e.to_string())?,
                    conversation_id: row.try_get("conversation_id").map_err(|e| e.to_string())?,
                    role: ChatRole::parse(&role_raw)
                        .ok_or_else(|| format!("invalid stored role: {role_raw}"))?,
                    content: row.try_get("content").map_err(|e| e.to_string())?,
                    model: row.try_get("model").map_err(|e| e.to_string())?,
                    provider: row.try_get("provider").map_err(|e| e.to_string())?,
                    token_count: row.try_get("token_count").map_err(|e| e.to_string())?,
                    latency_ms: row.try_get("latency_ms").map_err(|e| e.to_string())?,
                    created_at: parse_ts(row.try_get("created_at").map_err(|e| e.to_string())?)?,
                })
            })
            .collect::<Result<Vec<_>, String>>()?;

        Ok(Some((conversation, messages)))
    }

    pub async fn count_for_user(&self, user_id: &str) -> Result<i64, String> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM conversations WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        row.try_get("count").map_err(|e| e.to_string())
    }
}

fn parse_ts(raw: String) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| e.to_string())
}
