use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::post;
use finchat::users::NewUser;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

#[derive(Clone)]
struct MockUpstream {
    requests: Arc<Mutex<u32>>,
    captured_headers: Arc<Mutex<Vec<(String, String)>>>,
}

struct TestContext {
    router: axum::Router,
    state: finchat::app::AppState,
    auth_header: String,
    user_id: String,
    upstream_requests: Arc<Mutex<u32>>,
    captured_headers: Arc<Mutex<Vec<(String, String)>>>,
    _temp_dir: TempDir,
}

fn sse_events(chunks: Vec<Value>, done: usize) -> Response {
    let mut events: Vec<Result<Event, Infallible>> = chunks
        .into_iter()
        .map(|chunk| Ok(Event::default().data(chunk.to_string())))
        .collect();
    for _ in 0..done {
        events.push(Ok(Event::default().data("[DONE]")));
    }
    Sse::new(futures_util::stream::iter(events)).into_response()
}

async fn mock_chat_completions(
    State(mock): State<MockUpstream>,
    Json(body): Json<Value>,
) -> Response {
    *mock.requests.lock().unwrap() += 1;
    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or("mock")
        .to_string();
    let prompt = body
        .get("messages")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.last())
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    if prompt.contains("force-error") {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": { "message": "forced upstream error" } })),
        )
            .into_response();
    }
    if prompt.contains("echo-model") {
        return sse_events(
            vec![json!({ "choices": [{ "delta": { "content": model } }] })],
            1,
        );
    }
    if prompt.contains("no-usage") {
        return sse_events(
            vec![
                json!({ "choices": [{ "delta": { "content": "sem" } }] }),
                json!({ "choices": [{ "delta": { "content": " uso" } }] }),
            ],
            1,
        );
    }
    if prompt.contains("double-done") {
        return sse_events(
            vec![json!({ "choices": [{ "delta": { "content": "dup" } }] })],
            2,
        );
    }

    sse_events(
        vec![
            json!({ "choices": [{ "delta": { "content": "H" } }] }),
            json!({ "choices": [{ "delta": { "content": "i" } }] }),
            json!({ "choices": [{ "delta": { "content": "!" } }] }),
            json!({ "choices": [{ "delta": {} }], "usage": { "total_tokens": 42 } }),
        ],
        1,
    )
}

async fn mock_anthropic_messages(
    State(mock): State<MockUpstream>,
    headers: HeaderMap,
    Json(_body): Json<Value>,
) -> Response {
    *mock.requests.lock().unwrap() += 1;
    for name in ["anthropic-version", "x-api-key"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            mock.captured_headers
                .lock()
                .unwrap()
                .push((name.to_string(), value.to_string()));
        }
    }

    let events: Vec<Result<Event, Infallible>> = vec![
        Ok(Event::default().event("message_start").data(
            json!({ "type": "message_start", "message": { "usage": { "input_tokens": 10 } } })
                .to_string(),
        )),
        Ok(Event::default().event("content_block_delta").data(
            json!({ "type": "content_block_delta", "index": 0, "delta": { "type": "text_delta", "text": "Olá" } })
                .to_string(),
        )),
        Ok(Event::default().event("message_delta").data(
            json!({ "type": "message_delta", "usage": { "output_tokens": 5 } }).to_string(),
        )),
        Ok(Event::default()
            .event("message_stop")
            .data(json!({ "type": "message_stop" }).to_string())),
    ];
    Sse::new(futures_util::stream::iter(events)).into_response()
}

async fn start_upstream() -> (SocketAddr, MockUpstream) {
    let mock = MockUpstream {
        requests: Arc::new(Mutex::new(0)),
        captured_headers: Arc::new(Mutex::new(Vec::new())),
    };
    let app = axum::Router::new()
        .route("/v1/chat/completions", post(mock_chat_completions))
        .route("/v1/messages", post(mock_anthropic_messages))
        .with_state(mock.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock upstream");
    let addr = listener.local_addr().expect("mock upstream addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, mock)
}

async fn setup() -> TestContext {
    let (upstream_addr, mock) = start_upstream().await;
    let base_url = format!("http://{upstream_addr}");

    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = temp_dir.path().join("finchat.db");
    let endpoint = |base_url: String| finchat::config::ProviderEndpoint {
        base_url,
        api_key: "upstream-key".to_string(),
    };
    let state = finchat::app::load_state_with_runtime(finchat::app::RuntimeConfig {
        listen: "127.0.0.1:0".to_string(),
        metrics_path: "/metrics".to_string(),
        database_dsn: format!("sqlite://{}", db_path.display()),
        providers: finchat::config::ProvidersConfig {
            gateway: endpoint(format!("{base_url}/v1")),
            groq: endpoint(format!("{base_url}/v1")),
            openrouter: endpoint(format!("{base_url}/v1")),
            anthropic: endpoint(base_url.clone()),
        },
    })
    .await
    .expect("load state");

    let user = state
        .user_store
        .create_user(NewUser {
            email: "maria@teste.com".to_string(),
            password: "senha-muito-forte".to_string(),
            first_name: "Maria".to_string(),
            last_name: Some("Silva".to_string()),
            company_name: Some("Empresa Teste Ltda".to_string()),
        })
        .await
        .expect("create user");
    let session = state
        .user_store
        .create_session(&user.id)
        .await
        .expect("create session");

    let router = finchat::app::build_app(state.clone());

    TestContext {
        router,
        state,
        auth_header: format!("Bearer {}", session.token),
        user_id: user.id,
        upstream_requests: mock.requests,
        captured_headers: mock.captured_headers,
        _temp_dir: temp_dir,
    }
}

async fn json_post(ctx: &TestContext, path: &str, body: Value) -> (StatusCode, String) {
    let req = Request::builder()
        .method("POST")
        .uri(path)
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, ctx.auth_header.clone())
        .body(Body::from(body.to_string()))
        .unwrap();
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&bytes).to_string())
}

async fn json_get(ctx: &TestContext, path: &str) -> (StatusCode, String) {
    let req = Request::builder()
        .method("GET")
        .uri(path)
        .header(AUTHORIZATION, ctx.auth_header.clone())
        .body(Body::empty())
        .unwrap();
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&bytes).to_string())
}

/// Concatenated content fragments from an SSE chat body.
fn collect_sse_content(body: &str) -> String {
    let mut out = String::new();
    for line in body.lines() {
        let Some(data) = line.strip_prefix("data: ") else {
            continue;
        };
        if data.trim() == "[DONE]" {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            continue;
        };
        if let Some(text) = value
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(|v| v.as_str())
        {
            out.push_str(text);
        }
    }
    out
}

async fn tokens_used(ctx: &TestContext) -> i64 {
    ctx.state
        .user_store
        .quota(&ctx.user_id)
        .await
        .expect("query quota")
        .expect("user exists")
        .tokens_used
}

async fn conversation_count(ctx: &TestContext) -> i64 {
    ctx.state
        .conversation_store
        .count_for_user(&ctx.user_id)
        .await
        .expect("count conversations")
}

#[tokio::test]
async fn chat_requires_authentication() {
    let ctx = setup().await;
    let req = Request::builder()
        .method("POST")
        .uri("/api/chat")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({ "messages": [{ "role": "user", "content": "oi" }] }).to_string(),
        ))
        .unwrap();
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn chat_rejects_malformed_message_lists() {
    let ctx = setup().await;

    let (status, body) = json_post(&ctx, "/api/chat", json!({ "messages": "oi" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("Invalid messages format"));

    let (status, _) = json_post(&ctx, "/api/chat", json!({ "messages": [] })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = json_post(
        &ctx,
        "/api/chat",
        json!({ "messages": [{ "role": "robot", "content": "oi" }] }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert_eq!(*ctx.upstream_requests.lock().unwrap(), 0);
}

#[tokio::test]
async fn quota_exceeded_rejects_without_upstream_call() {
    let ctx = setup().await;
    ctx.state
        .user_store
        .add_tokens_used(&ctx.user_id, 10_000)
        .await
        .expect("exhaust quota");

    let (status, body) = json_post(
        &ctx,
        "/api/chat",
        json!({ "messages": [{ "role": "user", "content": "oi" }] }),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body.contains("Token limit exceeded"));
    assert_eq!(*ctx.upstream_requests.lock().unwrap(), 0);
}

#[tokio::test]
async fn chat_streams_and_persists_the_exchange() {
    let ctx = setup().await;
    let (status, body) = json_post(
        &ctx,
        "/api/chat",
        json!({ "messages": [{ "role": "user", "content": "bom dia" }] }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("data: [DONE]"));
    assert_eq!(collect_sse_content(&body), "Hi!");

    let mut persisted = None;
    for _ in 0..40 {
        if conversation_count(&ctx).await == 1 {
            let conversations = ctx
                .state
                .conversation_store
                .list_for_user(&ctx.user_id)
                .await
                .expect("list conversations");
            persisted = conversations.into_iter().next();
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let summary = persisted.expect("conversation persisted");
    assert_eq!(summary.title, "bom dia...");
    assert_eq!(summary.model, "gpt-4o-mini");
    assert_eq!(summary.provider, "openai");
    assert_eq!(summary.message_count, 2);

    let (_, messages) = ctx
        .state
        .conversation_store
        .get_with_messages(&summary.id, &ctx.user_id)
        .await
        .expect("load conversation")
        .expect("conversation exists");
    let assistant = messages.last().expect("assistant message");
    assert_eq!(assistant.role, finchat::providers::ChatRole::Assistant);
    // What the client received is exactly what got persisted.
    assert_eq!(assistant.content, "Hi!");
    assert_eq!(assistant.token_count, Some(42));
    assert!(assistant.latency_ms.is_some());
    let request_message = messages.first().expect("request message");
    assert_eq!(request_message.token_count, None);
    assert_eq!(request_message.model, None);

    assert_eq!(tokens_used(&ctx).await, 42);
    let usage = ctx
        .state
        .usage_store
        .summary_for_user(&ctx.user_id)
        .await
        .expect("usage summary");
    assert_eq!(usage.total_tokens, 42);
    assert_eq!(usage.total_requests, 1);
    assert!((usage.total_cost - 42.0 * 0.0001).abs() < 1e-9);
}

#[tokio::test]
async fn missing_usage_falls_back_to_fixed_estimate() {
    let ctx = setup().await;
    let (status, body) = json_post(
        &ctx,
        "/api/chat",
        json!({ "messages": [{ "role": "user", "content": "no-usage" }] }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(collect_sse_content(&body), "sem uso");

    let mut used = 0;
    for _ in 0..40 {
        used = tokens_used(&ctx).await;
        if used > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(used, 100);
}

#[tokio::test]
async fn upstream_failure_returns_500_with_no_partial_persistence() {
    let ctx = setup().await;
    let (status, body) = json_post(
        &ctx,
        "/api/chat",
        json!({ "messages": [{ "role": "user", "content": "force-error" }] }),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let value: Value = serde_json::from_str(&body).expect("json error body");
    assert_eq!(value["error"], "Internal server error");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(conversation_count(&ctx).await, 0);
    assert_eq!(tokens_used(&ctx).await, 0);
}

#[tokio::test]
async fn repeated_done_markers_finalize_once() {
    let ctx = setup().await;
    let (status, _body) = json_post(
        &ctx,
        "/api/chat",
        json!({ "messages": [{ "role": "user", "content": "double-done" }] }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    for _ in 0..40 {
        if conversation_count(&ctx).await >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    // Give a duplicate finalization time to land before asserting.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(conversation_count(&ctx).await, 1);
    assert_eq!(tokens_used(&ctx).await, 100);
    let usage = ctx
        .state
        .usage_store
        .count_for_user(&ctx.user_id)
        .await
        .expect("count usage rows");
    assert_eq!(usage, 1);
}

#[tokio::test]
async fn groq_hint_maps_model_through_alias_table() {
    let ctx = setup().await;
    let (status, body) = json_post(
        &ctx,
        "/api/chat",
        json!({
            "messages": [{ "role": "user", "content": "echo-model" }],
            "model": "llama-3.1-70b-something",
            "provider": "groq",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(collect_sse_content(&body), "llama-3.1-70b-versatile");
}

#[tokio::test]
async fn anthropic_stream_is_normalized_and_accounted() {
    let ctx = setup().await;
    let (status, body) = json_post(
        &ctx,
        "/api/chat",
        json!({
            "messages": [
                { "role": "system", "content": "seja objetivo" },
                { "role": "user", "content": "oi" },
            ],
            "model": "claude-3-sonnet",
            "provider": "anthropic",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(collect_sse_content(&body), "Olá");

    let captured = ctx.captured_headers.lock().unwrap().clone();
    assert!(captured.contains(&("anthropic-version".to_string(), "2023-06-01".to_string())));
    assert!(captured.contains(&("x-api-key".to_string(), "upstream-key".to_string())));

    let mut used = 0;
    for _ in 0..40 {
        used = tokens_used(&ctx).await;
        if used > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    // input_tokens from message_start plus output_tokens from message_delta.
    assert_eq!(used, 15);

    let conversations = ctx
        .state
        .conversation_store
        .list_for_user(&ctx.user_id)
        .await
        .expect("list conversations");
    assert_eq!(conversations[0].provider, "anthropic");
}

#[tokio::test]
async fn financial_analysis_streams_raw_text_without_persistence() {
    let ctx = setup().await;
    let req = Request::builder()
        .method("POST")
        .uri("/api/financial-analysis")
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, ctx.auth_header.clone())
        .body(Body::from(json!({ "client_name": "Acme Ltda" }).to_string()))
        .unwrap();
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    assert!(content_type.starts_with("text/plain"));
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    // Raw fragments, no SSE envelope.
    assert_eq!(String::from_utf8_lossy(&bytes), "Hi!");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(conversation_count(&ctx).await, 0);
    assert_eq!(tokens_used(&ctx).await, 0);
}

#[tokio::test]
async fn financial_analysis_requires_client_name() {
    let ctx = setup().await;
    let (status, body) = json_post(&ctx, "/api/financial-analysis", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("Client name is required"));
    assert_eq!(*ctx.upstream_requests.lock().unwrap(), 0);
}

#[tokio::test]
async fn financial_analysis_forwards_document_context_upstream() {
    let ctx = setup().await;
    // The directive rides in through additional_context, proving the
    // assembled prompt reaches the upstream call.
    let (status, body) = json_post(
        &ctx,
        "/api/financial-analysis",
        json!({ "client_name": "Acme Ltda", "additional_context": "force-error" }),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.contains("Failed to generate financial analysis"));
}

#[tokio::test]
async fn upload_extracts_text_and_lists_files() {
    let ctx = setup().await;
    let boundary = "finchat-test-boundary";
    let multipart_body = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"dre-2024.csv\"\r\nContent-Type: text/csv\r\n\r\nreceita,120\ncustos,80\r\n--{boundary}--\r\n"
    );
    let req = Request::builder()
        .method("POST")
        .uri("/api/upload")
        .header(
            CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .header(AUTHORIZATION, ctx.auth_header.clone())
        .body(Body::from(multipart_body))
        .unwrap();
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let value: Value = serde_json::from_slice(&bytes).expect("json body");
    assert_eq!(value["success"], true);
    assert_eq!(value["file_name"], "dre-2024.csv");
    assert!(
        value["extracted_text"]
            .as_str()
            .unwrap_or("")
            .contains("receita,120")
    );

    let (status, body) = json_get(&ctx, "/api/upload").await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_str(&body).expect("json body");
    let files = value["files"].as_array().expect("files array");
    assert_eq!(files.len(), 1);
    assert_eq!(files[0]["name"], "dre-2024.csv");
}

#[tokio::test]
async fn upload_without_file_field_is_rejected() {
    let ctx = setup().await;
    let boundary = "finchat-test-boundary";
    let multipart_body = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"other\"\r\n\r\nx\r\n--{boundary}--\r\n"
    );
    let req = Request::builder()
        .method("POST")
        .uri("/api/upload")
        .header(
            CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .header(AUTHORIZATION, ctx.auth_header.clone())
        .body(Body::from(multipart_body))
        .unwrap();
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn templates_resolve_by_alias_and_log_usage() {
    let ctx = setup().await;
    let (status, body) = json_get(&ctx, "/api/templates").await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_str(&body).expect("json body");
    assert_eq!(value["templates"].as_array().map(Vec::len), Some(3));

    let (status, body) = json_post(
        &ctx,
        "/api/templates/use",
        json!({ "template_id": "ifinance-template" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_str(&body).expect("json body");
    assert_eq!(value["success"], true);
    assert_eq!(value["template"]["name"], "Análise Financeira iFinance");
    assert!(
        value["template"]["prompt"]
            .as_str()
            .unwrap_or("")
            .contains("DRE")
    );

    let (status, _) = json_post(
        &ctx,
        "/api/templates/use",
        json!({ "template_id": "missing-template" }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = json_post(&ctx, "/api/templates/use", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("Template ID required"));
}

#[tokio::test]
async fn signup_login_and_profile_flow() {
    let ctx = setup().await;

    let (status, body) = json_post(
        &ctx,
        "/api/signup",
        json!({ "email": "joao@teste.com", "password": "senha-segura", "first_name": "João", "last_name": "Souza" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_str(&body).expect("json body");
    assert_eq!(value["user"]["email"], "joao@teste.com");
    assert_eq!(value["user"]["tokens_limit"], 10_000);
    assert!(value["user"]["password_hash"].is_null());

    let (status, body) = json_post(
        &ctx,
        "/api/signup",
        json!({ "email": "joao@teste.com", "password": "outra-senha", "first_name": "João" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("Usuário já existe com este email"));

    let (status, _) = json_post(&ctx, "/api/signup", json!({ "email": "x@y.com" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = json_post(
        &ctx,
        "/api/login",
        json!({ "email": "joao@teste.com", "password": "senha-segura" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_str(&body).expect("json body");
    let token = value["token"].as_str().expect("session token").to_string();

    let (status, _) = json_post(
        &ctx,
        "/api/login",
        json!({ "email": "joao@teste.com", "password": "senha-errada" }),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let req = Request::builder()
        .method("GET")
        .uri("/api/user/profile")
        .header(AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let value: Value = serde_json::from_slice(&bytes).expect("json body");
    assert_eq!(value["email"], "joao@teste.com");
    assert_eq!(value["name"], "João Souza");
}

#[tokio::test]
async fn profile_update_persists_changes() {
    let ctx = setup().await;
    let req = Request::builder()
        .method("PUT")
        .uri("/api/user/profile")
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, ctx.auth_header.clone())
        .body(Body::from(
            json!({ "job_title": "CFO", "timezone": "America/Recife" }).to_string(),
        ))
        .unwrap();
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let value: Value = serde_json::from_slice(&bytes).expect("json body");
    assert_eq!(value["job_title"], "CFO");
    assert_eq!(value["timezone"], "America/Recife");

    let (status, body) = json_get(&ctx, "/api/user/profile").await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_str(&body).expect("json body");
    assert_eq!(value["job_title"], "CFO");
}

#[tokio::test]
async fn usage_summary_reports_defaults_and_accumulated_rows() {
    let ctx = setup().await;
    let (status, body) = json_get(&ctx, "/api/user/usage").await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_str(&body).expect("json body");
    assert_eq!(value["total_tokens"], 0);
    assert_eq!(value["total_requests"], 0);
    assert_eq!(value["avg_response_time_ms"], 1200.0);
    assert_eq!(value["recent_usage"].as_array().map(Vec::len), Some(5));
    assert_eq!(value["tokens_limit"], 10_000);

    let (status, _) = json_post(
        &ctx,
        "/api/chat",
        json!({ "messages": [{ "role": "user", "content": "bom dia" }] }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let mut total_tokens = 0;
    for _ in 0..40 {
        let (_, body) = json_get(&ctx, "/api/user/usage").await;
        let value: Value = serde_json::from_str(&body).expect("json body");
        total_tokens = value["total_tokens"].as_i64().unwrap_or(0);
        if total_tokens > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(total_tokens, 42);
}

#[tokio::test]
async fn conversations_are_listed_and_fetched_per_user() {
    let ctx = setup().await;
    let (status, _) = json_post(
        &ctx,
        "/api/chat",
        json!({ "messages": [{ "role": "user", "content": "bom dia" }] }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    for _ in 0..40 {
        if conversation_count(&ctx).await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let (status, body) = json_get(&ctx, "/api/conversations").await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_str(&body).expect("json body");
    let conversations = value["conversations"].as_array().expect("array");
    assert_eq!(conversations.len(), 1);
    let id = conversations[0]["id"].as_str().expect("conversation id");

    let (status, body) = json_get(&ctx, &format!("/api/conversations/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_str(&body).expect("json body");
    assert_eq!(value["messages"].as_array().map(Vec::len), Some(2));

    let (status, _) = json_get(&ctx, "/api/conversations/desconhecida").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn logout_invalidates_the_session() {
    let ctx = setup().await;
    let (status, _) = json_post(&ctx, "/api/logout", json!({})).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = json_get(&ctx, "/api/user/profile").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn metrics_endpoint_renders() {
    let ctx = setup().await;
    let req = Request::builder()
        .method("GET")
        .uri("/metrics")
        .body(Body::empty())
        .unwrap();
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}
