use crate::app::AppState;
use crate::auth;
use crate::config::ProviderHint;
use crate::error::{AppError, AppResult};
use crate::files::{EXTRACTED_TEXT_RESPONSE_CAP, MAX_UPLOAD_BYTES};
use crate::financial;
use crate::providers::{ChatMessage, ChatRole, RelayRequest};
use crate::relay::{ChatChunkFraming, RawTextFraming, run_relay};
use crate::usage::UsageFinalizer;
use crate::users::{NewUser, QuotaError, UpdateProfile, UserStore};
use axum::Json;
use axum::body::Body;
use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";
const CHAT_TEMPERATURE: f64 = 0.7;
const CHAT_MAX_TOKENS: u32 = 3000;

const FINANCIAL_ANALYSIS_MODEL: &str = "gpt-4o";
const FINANCIAL_TEMPERATURE: f64 = 0.3;
const FINANCIAL_MAX_TOKENS: u32 = 8000;

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

struct ParsedChatRequest {
    messages: Vec<ChatMessage>,
    model: String,
    provider: ProviderHint,
}

fn parse_chat_request(body: &Value) -> AppResult<ParsedChatRequest> {
    let invalid = || {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "Invalid messages format",
        )
    };
    let items = body
        .get("messages")
        .and_then(|v| v.as_array())
        .ok_or_else(invalid)?;
    if items.is_empty() {
        return Err(invalid());
    }
    let mut messages = Vec::with_capacity(items.len());
    for item in items {
        let role_raw = item.get("role").and_then(|v| v.as_str()).ok_or_else(invalid)?;
        let role = ChatRole::parse(role_raw).ok_or_else(invalid)?;
        let content = item
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(invalid)?;
        messages.push(ChatMessage::new(role, content));
    }
    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or(DEFAULT_CHAT_MODEL)
        .to_string();
    let provider = body
        .get("provider")
        .and_then(|v| v.as_str())
        .map(ProviderHint::parse)
        .unwrap_or_default();
    Ok(ParsedChatRequest {
        messages,
        model,
        provider,
    })
}

fn quota_error_to_app(err: QuotaError) -> AppError {
    match err {
        QuotaError::NotFound => {
            AppError::new(StatusCode::NOT_FOUND, "not_found", "User not found")
        }
        QuotaError::Exceeded => AppError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "quota_exceeded",
            "Token limit exceeded. Please upgrade your plan.",
        ),
        QuotaError::Internal(msg) => AppError::internal(msg),
    }
}

/// Chat relay: quota gate, route to an adapter, stream the normalized deltas
/// back as SSE chat chunks while a spawned controller accumulates and
/// finalizes the exchange.
pub async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    let started_at = Instant::now();
    let user = auth::current_user(&headers, &state.user_store).await?;
    let parsed = parse_chat_request(&body)?;

    // Gate before the upstream call; an exhausted caller costs nothing.
    state
        .user_store
        .ensure_within_quota(&user.id)
        .await
        .map_err(quota_error_to_app)?;

    let routed = state.providers.route(&parsed.model, parsed.provider);
    let relay_req = RelayRequest {
        messages: parsed.messages.clone(),
        model: routed.upstream_model.clone(),
        temperature: CHAT_TEMPERATURE,
        max_tokens: CHAT_MAX_TOKENS,
    };
    let deltas = routed
        .adapter
        .open_stream(&state.http, &relay_req)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, model = %relay_req.model, "chat upstream call failed");
            AppError::internal("Internal server error")
        })?;

    let mut finalizer = UsageFinalizer::new(
        state.user_store.clone(),
        state.conversation_store.clone(),
        state.usage_store.clone(),
        user.id.clone(),
        parsed.model.clone(),
        routed.kind,
        parsed.messages,
    );
    let framing = ChatChunkFraming::new(&parsed.model);
    let (tx, rx) = mpsc::channel::<Event>(64);
    tokio::spawn(async move {
        run_relay(deltas, tx, framing, Some(&mut finalizer), started_at).await;
    });

    Ok(Sse::new(ReceiverStream::new(rx).map(Ok::<_, Infallible>)).into_response())
}

/// Financial-analysis relay variant: fixed system prompt plus the referenced
/// documents' extracted text, streamed back as raw text for a human reader.
/// Nothing is persisted or billed on this route.
pub async fn financial_analysis(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    let started_at = Instant::now();
    let user = auth::current_user(&headers, &state.user_store).await?;

    let client_name = body
        .get("client_name")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            AppError::new(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                "Client name is required",
            )
        })?;
    let file_ids: Vec<String> = body
        .get("file_ids")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();
    let additional_context = body.get("additional_context").and_then(|v| v.as_str());

    let documents = state
        .file_store
        .extracted_documents(&user.id, &file_ids)
        .await
        .map_err(AppError::internal)?;
    let file_content = financial::document_content(&documents, additional_context);
    let messages = vec![
        ChatMessage::new(ChatRole::System, financial::FINANCIAL_ANALYSIS_SYSTEM_PROMPT),
        ChatMessage::new(
            ChatRole::User,
            financial::analysis_prompt(client_name, &file_content),
        ),
    ];

    let routed = state
        .providers
        .route(FINANCIAL_ANALYSIS_MODEL, ProviderHint::Auto);
    let relay_req = RelayRequest {
        messages,
        model: routed.upstream_model.clone(),
        temperature: FINANCIAL_TEMPERATURE,
        max_tokens: FINANCIAL_MAX_TOKENS,
    };
    let deltas = routed
        .adapter
        .open_stream(&state.http, &relay_req)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "financial analysis upstream call failed");
            AppError::internal("Failed to generate financial analysis")
        })?;

    let (tx, rx) = mpsc::channel::<Bytes>(64);
    tokio::spawn(async move {
        run_relay(deltas, tx, RawTextFraming, None, started_at).await;
    });

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    Response::builder()
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .map_err(|e| AppError::internal(e.to_string()))
}

pub async fn upload_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> AppResult<Response> {
    let user = auth::current_user(&headers, &state.user_store).await?;

    let mut uploaded: Option<(String, Option<String>, Vec<u8>)> = None;
    while let Some(field) = multipart.next_field().await.map_err(|err| {
        AppError::new(StatusCode::BAD_REQUEST, "invalid_request", err.to_string())
    })? {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("arquivo").to_string();
        let content_type = field.content_type().map(|s| s.to_string());
        let data = field.bytes().await.map_err(|err| {
            AppError::new(StatusCode::BAD_REQUEST, "invalid_request", err.to_string())
        })?;
        uploaded = Some((file_name, content_type, data.to_vec()));
        break;
    }

    let Some((file_name, content_type, data)) = uploaded else {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "Nenhum arquivo fornecido",
        ));
    };
    if data.len() > MAX_UPLOAD_BYTES {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "Arquivo muito grande. Tamanho máximo: 50MB",
        ));
    }

    let mime_type = content_type.unwrap_or_else(|| {
        mime_guess::from_path(&file_name)
            .first_or_octet_stream()
            .to_string()
    });
    let stored = state
        .file_store
        .store_upload(&user.id, &file_name, &mime_type, &data)
        .await
        .map_err(AppError::internal)?;

    let preview: String = stored
        .extracted_text
        .as_deref()
        .unwrap_or_default()
        .chars()
        .take(EXTRACTED_TEXT_RESPONSE_CAP)
        .collect();

    Ok(Json(json!({
        "success": true,
        "file_id": stored.id,
        "file_name": stored.name,
        "extracted_text": preview,
        "size": stored.size_bytes,
    }))
    .into_response())
}

pub async fn list_files(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    let user = auth::current_user(&headers, &state.user_store).await?;
    let files = state
        .file_store
        .list_for_user(&user.id)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(json!({ "files": files })))
}

pub async fn list_templates(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    auth::current_user(&headers, &state.user_store).await?;
    let templates = state
        .template_store
        .list_active()
        .await
        .map_err(AppError::internal)?;
    Ok(Json(json!({ "templates": templates })))
}

pub async fn use_template(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AppResult<impl IntoResponse> {
    let user = auth::current_user(&headers, &state.user_store).await?;
    let template_id = body
        .get("template_id")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            AppError::new(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                "Template ID required",
            )
        })?;

    let template = state
        .template_store
        .resolve_for_use(template_id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| {
            AppError::new(StatusCode::NOT_FOUND, "not_found", "Template not found")
        })?;

    audit_best_effort(
        &state.user_store,
        &user.id,
        "USE_TEMPLATE",
        "financial_template",
        json!({ "template_id": template.id, "template_name": template.name }),
    )
    .await;

    Ok(Json(json!({
        "success": true,
        "template": {
            "id": template.id,
            "name": template.name,
            "description": template.description,
            "prompt": template.prompt,
        },
    })))
}

pub async fn get_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    let user = auth::current_user(&headers, &state.user_store).await?;
    Ok(Json(user))
}

pub async fn update_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(changes): Json<UpdateProfile>,
) -> AppResult<impl IntoResponse> {
    let user = auth::current_user(&headers, &state.user_store).await?;
    let updated = state
        .user_store
        .update_profile(&user.id, &changes)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::new(StatusCode::NOT_FOUND, "not_found", "User not found"))?;

    audit_best_effort(
        &state.user_store,
        &user.id,
        "UPDATE_PROFILE",
        "user",
        json!({ "changes": {
            "first_name": changes.first_name,
            "last_name": changes.last_name,
            "company_name": changes.company_name,
            "job_title": changes.job_title,
            "timezone": changes.timezone,
            "locale": changes.locale,
        }}),
    )
    .await;

    Ok(Json(updated))
}

pub async fn get_usage(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    let user = auth::current_user(&headers, &state.user_store).await?;
    let summary = state
        .usage_store
        .summary_for_user(&user.id)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(json!({
        "total_tokens": summary.total_tokens,
        "total_cost": summary.total_cost,
        "total_requests": summary.total_requests,
        "avg_response_time_ms": summary.avg_response_time_ms,
        "recent_usage": summary.recent_usage,
        "tokens_used": user.tokens_used,
        "tokens_limit": user.tokens_limit,
    })))
}

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub email: Option<String>,
    pub password: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company_name: Option<String>,
}

pub async fn signup(
    State(state): State<AppState>,
    Json(body): Json<SignupRequest>,
) -> AppResult<impl IntoResponse> {
    let required = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    let (Some(email), Some(password), Some(first_name)) = (
        required(body.email),
        required(body.password),
        required(body.first_name),
    ) else {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "Email, senha e nome são obrigatórios",
        ));
    };

    if state
        .user_store
        .get_user_by_email(&email)
        .await
        .map_err(AppError::internal)?
        .is_some()
    {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "user_exists",
            "Usuário já existe com este email",
        ));
    }

    let user = state
        .user_store
        .create_user(NewUser {
            email,
            password,
            first_name,
            last_name: body.last_name.filter(|s| !s.trim().is_empty()),
            company_name: body.company_name.filter(|s| !s.trim().is_empty()),
        })
        .await
        .map_err(AppError::internal)?;

    Ok(Json(json!({
        "message": "Usuário criado com sucesso",
        "user": user,
    })))
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> AppResult<impl IntoResponse> {
    let invalid = || {
        AppError::new(
            StatusCode::UNAUTHORIZED,
            "invalid_credentials",
            "Credenciais inválidas",
        )
    };
    let user = state
        .user_store
        .get_user_by_email(&body.email)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(invalid)?;

    let valid = UserStore::verify_password(&body.password, &user.password_hash)
        .map_err(AppError::internal)?;
    if !valid {
        return Err(invalid());
    }

    let session = state
        .user_store
        .create_session(&user.id)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(json!({ "token": session.token, "user": user })))
}

pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    if let Some(token) = auth::extract_session_token(&headers) {
        state.user_store.delete_session(&token).await.ok();
    }
    Ok(Json(json!({ "success": true })))
}

pub async fn list_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    let user = auth::current_user(&headers, &state.user_store).await?;
    let conversations = state
        .conversation_store
        .list_for_user(&user.id)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(json!({ "conversations": conversations })))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let user = auth::current_user(&headers, &state.user_store).await?;
    let (conversation, messages) = state
        .conversation_store
        .get_with_messages(&conversation_id, &user.id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| {
            AppError::new(StatusCode::NOT_FOUND, "not_found", "Conversation not found")
        })?;
    Ok(Json(json!({
        "conversation": conversation,
        "messages": messages,
    })))
}

async fn audit_best_effort(
    users: &UserStore,
    user_id: &str,
    action: &str,
    resource: &str,
    details: Value,
) {
    if let Err(err) = users
        .insert_audit_log(user_id, action, resource, &details)
        .await
    {
        tracing::warn!(action, error = %err, "failed to write audit log");
    }
}
