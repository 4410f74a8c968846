use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Pool, Row, Sqlite};

pub const DEFAULT_TOKENS_LIMIT: i64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    SuperAdmin,
    Admin,
    User,
}

impl UserRole {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "super_admin" => Some(Self::SuperAdmin),
            "admin" => Some(Self::Admin),
            "user" => Some(Self::User),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SuperAdmin => "super_admin",
            Self::Admin => "admin",
            Self::User => "user",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserPlan {
    Free,
    Start,
    Pro,
    Enterprise,
}

impl UserPlan {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "free" => Some(Self::Free),
            "start" => Some(Self::Start),
            "pro" => Some(Self::Pro),
            "enterprise" => Some(Self::Enterprise),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Start => "start",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_title: Option<String>,
    pub role: UserRole,
    pub plan: UserPlan,
    pub locale: String,
    pub timezone: String,
    /// Cumulative tokens consumed, incremented by finalization.
    pub tokens_used: i64,
    pub tokens_limit: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: Option<String>,
    pub company_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateProfile {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company_name: Option<String>,
    pub job_title: Option<String>,
    pub timezone: Option<String>,
    pub locale: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct UserQuotaState {
    pub tokens_used: i64,
    pub tokens_limit: i64,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum QuotaError {
    #[error("user not found")]
    NotFound,
    #[error("token limit exceeded")]
    Exceeded,
    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct UserStore {
    pool: Pool<Sqlite>,
}

impl UserStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                name TEXT,
                first_name TEXT,
                last_name TEXT,
                company_name TEXT,
                job_title TEXT,
                role TEXT NOT NULL DEFAULT 'user',
                plan TEXT NOT NULL DEFAULT 'free',
                locale TEXT NOT NULL DEFAULT 'pt-BR',
                timezone TEXT NOT NULL DEFAULT 'America/Sao_Paulo',
                tokens_used INTEGER NOT NULL DEFAULT 0,
                tokens_limit INTEGER NOT NULL DEFAULT 10000,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                token TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS audit_logs (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                action TEXT NOT NULL,
                resource TEXT NOT NULL,
                details_json TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_logs_user ON audit_logs(user_id)")
            .execute(&pool)
            .await
            .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    pub fn hash_password(password: &str) -> Result<String, String> {
        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::default();
        argon2
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| e.to_string())
    }

    pub fn verify_password(password: &str, hash: &str) -> Result<bool, String> {
        let parsed_hash = PasswordHash::new(hash).map_err(|e| e.to_string())?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed_hash)
            .is_ok())
    }

    pub async fn create_user(&self, input: NewUser) -> Result<User, String> {
        let id = uuid::Uuid::new_v4().to_string();
        let password_hash = Self::hash_password(&input.password)?;
        let now = Utc::now();
        let name = match input.last_name.as_deref() {
            Some(last) if !last.is_empty() => format!("{} {}", input.first_name, last),
            _ => input.first_name.clone(),
        };

        sqlx::query(
            r#"INSERT INTO users (id, email, password_hash, name, first_name, last_name, company_name, role, plan, locale, timezone, tokens_used, tokens_limit, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, 'user', 'free', 'pt-BR', 'America/Sao_Paulo', 0, ?, ?, ?)"#,
        )
        .bind(&id)
        .bind(&input.email)
        .bind(&password_hash)
        .bind(&name)
        .bind(&input.first_name)
        .bind(&input.last_name)
        .bind(&input.company_name)
        .bind(DEFAULT_TOKENS_LIMIT)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        Ok(User {
            id,
            email: input.email,
            password_hash,
            name: Some(name),
            first_name: Some(input.first_name),
            last_name: input.last_name,
            company_name: input.company_name,
            job_title: None,
            role: UserRole::User,
            plan: UserPlan::Free,
            locale: "pt-BR".to_string(),
            timezone: "America/Sao_Paulo".to_string(),
            tokens_used: 0,
            tokens_limit: DEFAULT_TOKENS_LIMIT,
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn get_user_by_id(&self, id: &str) -> Result<Option<User>, String> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        if let Some(row) = row {
            Ok(Some(row_to_user(&row)?))
        } else {
            Ok(None)
        }
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, String> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = ?"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        if let Some(row) = row {
            Ok(Some(row_to_user(&row)?))
        } else {
            Ok(None)
        }
    }

    pub async fn update_profile(
        &self,
        id: &str,
        changes: &UpdateProfile,
    ) -> Result<Option<User>, String> {
        let mut updates = Vec::new();
        let mut bindings: Vec<String> = Vec::new();

        if let Some(v) = changes.first_name.as_deref() {
            updates.push("first_name = ?");
            bindings.push(v.to_string());
        }
        if let Some(v) = changes.last_name.as_deref() {
            updates.push("last_name = ?");
            bindings.push(v.to_string());
        }
        if let (Some(first), Some(last)) =
            (changes.first_name.as_deref(), changes.last_name.as_deref())
        {
            updates.push("name = ?");
            bindings.push(format!("{first} {last}").trim().to_string());
        }
        if let Some(v) = changes.company_name.as_deref() {
            updates.push("company_name = ?");
            bindings.push(v.to_string());
        }
        if let Some(v) = changes.job_title.as_deref() {
            updates.push("job_title = ?");
            bindings.push(v.to_string());
        }
        if let Some(v) = changes.timezone.as_deref() {
            updates.push("timezone = ?");
            bindings.push(v.to_string());
        }
        if let Some(v) = changes.locale.as_deref() {
            updates.push("locale = ?");
            bindings.push(v.to_string());
        }

        if !updates.is_empty() {
            updates.push("updated_at = ?");
            bindings.push(Utc::now().to_rfc3339());
            bindings.push(id.to_string());

            let query = format!("UPDATE users SET {} WHERE id = ?", updates.join(", "));
            let mut q = sqlx::query(&query);
            for b in &bindings {
                q = q.bind(b);
            }
            q.execute(&self.pool).await.map_err(|e| e.to_string())?;
        }

        self.get_user_by_id(id).await
    }

    pub async fn quota(&self, user_id: &str) -> Result<Option<UserQuotaState>, String> {
        let row = sqlx::query("SELECT tokens_used, tokens_limit FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(UserQuotaState {
            tokens_used: row.try_get("tokens_used").map_err(|e| e.to_string())?,
            tokens_limit: row.try_get("tokens_limit").map_err(|e| e.to_string())?,
        }))
    }

    /// Quota gate: runs before any upstream call, no side effects.
    pub async fn ensure_within_quota(&self, user_id: &str) -> Result<(), QuotaError> {
        let Some(quota) = self
            .quota(user_id)
            .await
            .map_err(QuotaError::Internal)?
        else {
            return Err(QuotaError::NotFound);
        };
        if quota.tokens_used >= quota.tokens_limit {
            return Err(QuotaError::Exceeded);
        }
        Ok(())
    }

    /// Atomic increment at the database layer. The gate's check and this
    /// increment are not one critical section; concurrent requests from the
    /// same user can land past the limit, which the next gate check catches.
    pub async fn add_tokens_used(&self, user_id: &str, tokens: u64) -> Result<(), String> {
        let result = sqlx::query(
            "UPDATE users SET tokens_used = tokens_used + ?, updated_at = ? WHERE id = ?",
        )
        .bind(tokens as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        if result.rows_affected() == 0 {
            return Err("user not found".to_string());
        }
        Ok(())
    }

    pub async fn create_session(&self, user_id: &str) -> Result<Session, String> {
        let id = uuid::Uuid::new_v4().to_string();
        let token = format!(
            "fc_session_{}",
            uuid::Uuid::new_v4().to_string().replace("-", "")
        );
        let now = Utc::now();
        let expires_at = now + chrono::Duration::days(30);

        sqlx::query(
            r#"INSERT INTO sessions (id, user_id, token, created_at, expires_at)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(&id)
        .bind(user_id)
        .bind(&token)
        .bind(now.to_rfc3339())
        .bind(expires_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        Ok(Session {
            id,
            user_id: user_id.to_string(),
            token,
            created_at: now,
            expires_at,
        })
    }

    pub async fn get_session_by_token(&self, token: &str) -> Result<Option<Session>, String> {
        let row = sqlx::query(
            "SELECT id, user_id, token, created_at, expires_at FROM sessions WHERE token = ?",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        if let Some(row) = row {
            let expires_at: String = row.try_get("expires_at").map_err(|e| e.to_string())?;
            let expires_at = DateTime::parse_from_rfc3339(&expires_at)
                .map_err(|e| e.to_string())?
                .with_timezone(&Utc);

            if expires_at < Utc::now() {
                self.delete_session(token).await?;
                return Ok(None);
            }

            Ok(Some(Session {
                id: row.try_get("id").map_err(|e| e.to_string())?,
                user_id: row.try_get("user_id").map_err(|e| e.to_string())?,
                token: row.try_get("token").map_err(|e| e.to_string())?,
                created_at: DateTime::parse_from_rfc3339(
                    &row.try_get::<String, _>("created_at")
                        .map_err(|e| e.to_string())?,
                )
                .map_err(|e| e.to_string())?
                .with_timezone(&Utc),
                expires_at,
            }))
        } else {
            Ok(None)
        }
    }

    pub async fn delete_session(&self, token: &str) -> Result<(), String> {
        sqlx::query("DELETE FROM sessions WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn insert_audit_log(
        &self,
        user_id: &str,
        action: &str,
        resource: &str,
        details: &Value,
    ) -> Result<(), String> {
        let id = uuid::Uuid::new_v4().to_string();
        let details_json = serde_json::to_string(details).map_err(|e| e.to_string())?;
        sqlx::query(
            r#"INSERT INTO audit_logs (id, user_id, action, resource, details_json, created_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(id)
        .bind(user_id)
        .bind(action)
        .bind(resource)
        .bind(details_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }
}

const USER_COLUMNS: &str = "id, email, password_hash, name, first_name, last_name, company_name, job_title, role, plan, locale, timezone, tokens_used, tokens_limit, created_at, updated_at";

fn row_to_user(row: &sqlx::sqlite::SqliteRow) -> Result<User, String> {
    let parse_ts = |raw: String| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| e.to_string())
    };
    let role_raw: String = row.try_get("role").map_err(|e| e.to_string())?;
    let plan_raw: String = row.try_get("plan").map_err(|e| e.to_string())?;
    Ok(User {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        email: row.try_get("email").map_err(|e| e.to_string())?,
        password_hash: row.try_get("password_hash").map_err(|e| e.to_string())?,
        name: row.try_get("name").map_err(|e| e.to_string())?,
        first_name: row.try_get("first_name").map_err(|e| e.to_string())?,
        last_name: row.try_get("last_name").map_err(|e| e.to_string())?,
        company_name: row.try_get("company_name").map_err(|e| e.to_string())?,
        job_title: row.try_get("job_title").map_err(|e| e.to_string())?,
        role: UserRole::from_str(&role_raw).unwrap_or(UserRole::User),
        plan: UserPlan::from_str(&plan_raw).unwrap_or(UserPlan::Free),
        locale: row.try_get("locale").map_err(|e| e.to_string())?,
        timezone: row.try_get("timezone").map_err(|e| e.to_string())?,
        tokens_used: row.try_get("tokens_used").map_err(|e| e.to_string())?,
        tokens_limit: row.try_get("tokens_limit").map_err(|e| e.to_string())?,
        created_at: parse_ts(row.try_get("created_at").map_err(|e| e.to_string())?)?,
        updated_at: parse_ts(row.try_get("updated_at").map_err(|e| e.to_string())?)?,
    })
}
