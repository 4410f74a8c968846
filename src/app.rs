use crate::config::ProvidersConfig;
use crate::conversations::ConversationStore;
use crate::error::{AppError, AppResult};
use crate::files::{FileStore, MAX_UPLOAD_BYTES};
use crate::providers::ProviderRegistry;
use crate::templates::TemplateStore;
use crate::usage_log::UsageStore;
use crate::users::UserStore;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::PathBuf;
use std::sync::{Arc, Once, OnceLock};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub database_dsn: String,
    pub providers: ProvidersConfig,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let listen = std::env::var("FINCHAT_LISTEN")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let metrics_path = std::env::var("FINCHAT_METRICS_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "/metrics".to_string());
        let database_dsn = resolve_database_dsn();
        Self {
            listen,
            metrics_path,
            database_dsn,
            providers: ProvidersConfig::from_env(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub http: reqwest::Client,
    pub metrics: PrometheusHandle,
    pub providers: Arc<ProviderRegistry>,
    pub user_store: UserStore,
    pub conversation_store: ConversationStore,
    pub usage_store: UsageStore,
    pub file_store: FileStore,
    pub template_store: TemplateStore,
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent("finchat/0.1")
        .build()
        .map_err(|err| {
            AppError::new(
                axum::http::StatusCode::BAD_REQUEST,
                "http_client_init_failed",
                err.to_string(),
            )
        })?;

    ensure_sqlite_file(&runtime.database_dsn).map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "database_init_failed",
            err,
        )
    })?;

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(
            runtime
                .database_dsn
                .parse::<sqlx::sqlite::SqliteConnectOptions>()
                .map_err(|err| {
                    AppError::new(
                        axum::http::StatusCode::BAD_REQUEST,
                        "database_dsn_parse_failed",
                        err.to_string(),
                    )
                })?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .busy_timeout(std::time::Duration::from_secs(5)),
        )
        .await
        .map_err(|err| {
            AppError::new(
                axum::http::StatusCode::BAD_REQUEST,
                "database_init_failed",
                err.to_string(),
            )
        })?;

    let user_store = UserStore::new(pool.clone()).await.map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "user_store_init_failed",
            err,
        )
    })?;
    let conversation_store = ConversationStore::new(pool.clone()).await.map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "conversation_store_init_failed",
            err,
        )
    })?;
    let usage_store = UsageStore::new(pool.clone()).await.map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "usage_store_init_failed",
            err,
        )
    })?;
    let file_store = FileStore::new(pool.clone()).await.map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "file_store_init_failed",
            err,
        )
    })?;
    let template_store = TemplateStore::new(pool).await.map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "template_store_init_failed",
            err,
        )
    })?;

    let metrics = init_metrics()?;
    let providers = Arc::new(ProviderRegistry::from_config(&runtime.providers));

    Ok(AppState {
        runtime: Arc::new(runtime),
        http,
        metrics,
        providers,
        user_store,
        conversation_store,
        usage_store,
        file_store,
        template_store,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    axum::http::StatusCode::BAD_REQUEST,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

fn resolve_database_dsn() -> String {
    std::env::var("FINCHAT_DATABASE_DSN")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| {
            std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty())
        })
        .unwrap_or_else(|| "sqlite://./data/finchat.db".to_string())
}

fn ensure_sqlite_file(dsn: &str) -> Result<(), String> {
    let dsn = dsn.trim();
    if !dsn.starts_with("sqlite://") {
        return Ok(());
    }
    if dsn.contains(":memory:") || dsn.contains("mode=memory") {
        return Ok(());
    }
    let path_part = dsn.trim_start_matches("sqlite://");
    let path_part = path_part.split('?').next().unwrap_or("");
    if path_part.is_empty() {
        return Ok(());
    }
    let path = PathBuf::from(path_part);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("sqlite_dir_create_failed: {err}"))?;
        }
    }
    if !path.exists() {
        std::fs::File::create(&path).map_err(|err| format!("sqlite_file_create_failed: {err}"))?;
    }
    Ok(())
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    Router::<AppState>::new()
        .route("/api/signup", post(crate::handlers::signup))
        .route("/api/login", post(crate::handlers::login))
        .route("/api/logout", post(crate::handlers::logout))
        .route("/api/chat", post(crate::handlers::chat))
        .route(
            "/api/financial-analysis",
            post(crate::handlers::financial_analysis),
        )
        .route(
            "/api/upload",
            post(crate::handlers::upload_file).get(crate::handlers::list_files),
        )
        .route("/api/templates", get(crate::handlers::list_templates))
        .route("/api/templates/use", post(crate::handlers::use_template))
        .route(
            "/api/user/profile",
            get(crate::handlers::get_profile).put(crate::handlers::update_profile),
        )
        .route("/api/user/usage", get(crate::handlers::get_usage))
        .route(
            "/api/conversations",
            get(crate::handlers::list_conversations),
        )
        .route(
            "/api/conversations/{conversation_id}",
            get(crate::handlers::get_conversation),
        )
        .route(&metrics_path, get(crate::handlers::metrics))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES + 1024 * 1024))
        .with_state(state)
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}
