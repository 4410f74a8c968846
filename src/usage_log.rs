use crate::config::ProviderKind;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::{Pool, Row, Sqlite};

/// Append-only usage accounting row, one per relayed request.
#[derive(Debug, Clone)]
pub struct UsageLogEntry {
    pub user_id: String,
    pub provider: ProviderKind,
    pub model: String,
    pub token_count: u64,
    pub cost: f64,
    pub request_type: &'static str,
    pub response_time_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyUsage {
    pub date: String,
    pub tokens: i64,
    pub cost: f64,
    pub requests: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    pub total_tokens: i64,
    pub total_cost: f64,
    pub total_requests: i64,
    pub avg_response_time_ms: f64,
    pub recent_usage: Vec<DailyUsage>,
}

#[derive(Clone)]
pub struct UsageStore {
    pool: Pool<Sqlite>,
}

impl UsageStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS usage_logs (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                token_count INTEGER NOT NULL,
                cost REAL NOT NULL,
                request_type TEXT NOT NULL,
                response_time_ms INTEGER,
                created_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_usage_logs_user ON usage_logs(user_id, created_at DESC)",
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    pub async fn append(&self, entry: UsageLogEntry) -> Result<(), String> {
        sqlx::query(
            r#"INSERT INTO usage_logs (id, user_id, provider, model, token_count, cost, request_type, response_time_ms, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&entry.user_id)
        .bind(entry.provider.as_str())
        .bind(&entry.model)
        .bind(entry.token_count as i64)
        .bind(entry.cost)
        .bind(entry.request_type)
        .bind(entry.response_time_ms as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn count_for_user(&self, user_id: &str) -> Result<i64, String> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM usage_logs WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        row.try_get("count").map_err(|e| e.to_string())
    }

    /// 30-day usage summary plus per-day rows for the last five days.
    pub async fn summary_for_user(&self, user_id: &str) -> Result<UsageSummary, String> {
        let since = (Utc::now() - Duration::days(30)).to_rfc3339();
        let rows = sqlx::query(
            r#"SELECT token_count, cost, response_time_ms, created_at
               FROM usage_logs WHERE user_id = ? AND created_at >= ?
               ORDER BY created_at DESC"#,
        )
        .bind(user_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        let mut total_tokens: i64 = 0;
        let mut total_cost: f64 = 0.0;
        let mut response_time_sum: i64 = 0;
        let mut parsed: Vec<(i64, f64, DateTime<Utc>)> = Vec::with_capacity(rows.len());
        for row in &rows {
            let tokens: i64 = row.try_get("token_count").map_err(|e| e.to_string())?;
            let cost: f64 = row.try_get("cost").map_err(|e| e.to_string())?;
            let response_time: Option<i64> =
                row.try_get("response_time_ms").map_err(|e| e.to_string())?;
            let created_raw: String = row.try_get("created_at").map_err(|e| e.to_string())?;
            let created_at = DateTime::parse_from_rfc3339(&created_raw)
                .map_err(|e| e.to_string())?
                .with_timezone(&Utc);
            total_tokens += tokens;
            total_cost += cost;
            response_time_sum += response_time.unwrap_or(0);
            parsed.push((tokens, cost, created_at));
        }

        let total_requests = parsed.len() as i64;
        let avg_response_time_ms = if total_requests > 0 {
            response_time_sum as f64 / total_requests as f64
        } else {
            1200.0
        };

        let mut recent_usage = Vec::with_capacity(5);
        for day_offset in 0..5 {
            let day = (Utc::now() - Duration::days(day_offset)).date_naive();
            let date = day.format("%Y-%m-%d").to_string();
            let mut tokens = 0;
            let mut cost = 0.0;
            let mut requests = 0;
            for (row_tokens, row_cost, created_at) in &parsed {
                if created_at.date_naive() == day {
                    tokens += row_tokens;
                    cost += row_cost;
                    requests += 1;
                }
            }
            recent_usage.push(DailyUsage {
                date,
                tokens,
                cost,
                requests,
            });
        }

        Ok(UsageSummary {
            total_tokens,
            total_cost,
            total_requests,
            avg_response_time_ms,
            recent_usage,
        })
    }
}
