use crate::config::{ProviderHint, ProviderKind, ProvidersConfig};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Canonical request shape handed to an adapter. `model` is already the
/// upstream identifier resolved by the router.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// Canonical unit of streamed model output. Exactly one terminal event per
/// stream when the upstream signals end of stream explicitly; a stream that
/// simply ends is treated as terminal by the controller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaEvent {
    pub content: Option<String>,
    pub total_tokens: Option<u64>,
    pub terminal: bool,
}

impl DeltaEvent {
    pub fn fragment(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn terminal(total_tokens: Option<u64>) -> Self {
        Self {
            content: None,
            total_tokens,
            terminal: true,
        }
    }
}

pub type DeltaStream = BoxStream<'static, DeltaEvent>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Network(String),
    #[error("upstream status {status}: {message}")]
    Http { status: u16, message: String },
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Map a requested model name to this backend's canonical identifier.
    fn resolve_model(&self, requested: &str) -> String;

    /// Open one upstream streaming call and normalize its chunks into a lazy
    /// delta-event sequence. Non-success status or connection failure is
    /// reported here, before any event is produced. Individual chunks that
    /// fail to parse are dropped from the sequence.
    async fn open_stream(
        &self,
        http: &reqwest::Client,
        req: &RelayRequest,
    ) -> Result<DeltaStream, UpstreamError>;
}

/// Adapter for any backend speaking the OpenAI chat-completions wire
/// protocol: the default gateway, Groq and OpenRouter.
pub struct OpenAiCompatAdapter {
    kind: ProviderKind,
    base_url: String,
    api_key: String,
    aliases: &'static [(&'static str, &'static str)],
    default_model: &'static str,
    pass_through_unmapped: bool,
}

const GROQ_MODEL_ALIASES: &[(&str, &str)] = &[
    ("llama-3.1-70b", "llama-3.1-70b-versatile"),
    ("llama-3.1-8b", "llama-3.1-8b-instant"),
    ("mixtral", "mixtral-8x7b-32768"),
];

const ANTHROPIC_MODEL_ALIASES: &[(&str, &str)] = &[
    ("claude-3-sonnet", "claude-3-sonnet-20240229"),
    ("claude-3-haiku", "claude-3-haiku-20240307"),
    ("claude-3-opus", "claude-3-opus-20240229"),
];

impl OpenAiCompatAdapter {
    fn gateway(base_url: String, api_key: String) -> Self {
        Self {
            kind: ProviderKind::Openai,
            base_url,
            api_key,
            aliases: &[],
            default_model: "gpt-4o-mini",
            pass_through_unmapped: true,
        }
    }

    fn groq(base_url: String, api_key: String) -> Self {
        Self {
            kind: ProviderKind::Groq,
            base_url,
            api_key,
            aliases: GROQ_MODEL_ALIASES,
            default_model: "llama-3.1-8b-instant",
            pass_through_unmapped: false,
        }
    }

    fn openrouter(base_url: String, api_key: String) -> Self {
        Self {
            kind: ProviderKind::Openrouter,
            base_url,
            api_key,
            aliases: &[],
            default_model: "openai/gpt-4o-mini",
            pass_through_unmapped: true,
        }
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatAdapter {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn resolve_model(&self, requested: &str) -> String {
        let requested = requested.trim();
        if requested.is_empty() {
            return self.default_model.to_string();
        }
        for (prefix, canonical) in self.aliases {
            if requested.starts_with(prefix) {
                return (*canonical).to_string();
            }
        }
        if self.pass_through_unmapped {
            requested.to_string()
        } else {
            self.default_model.to_string()
        }
    }

    async fn open_stream(
        &self,
        http: &reqwest::Client,
        req: &RelayRequest,
    ) -> Result<DeltaStream, UpstreamError> {
        let url = join_url(&self.base_url, "chat/completions");
        let body = json!({
            "model": req.model,
            "messages": req.messages,
            "stream": true,
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
        });
        let resp = http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| UpstreamError::Network(err.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::Http {
                status: status.as_u16(),
                message: text,
            });
        }

        let stream = resp
            .bytes_stream()
            .eventsource()
            .filter_map(|ev| {
                let out = match ev {
                    Ok(ev) => parse_chat_completions_chunk(&ev.data),
                    Err(_) => None,
                };
                futures_util::future::ready(out)
            })
            .boxed();
        Ok(stream)
    }
}

/// Adapter for Anthropic's native messages protocol. The upstream does not
/// reliably report usage mid-stream; the controller's fallback estimate
/// covers streams that finish without a token figure.
pub struct AnthropicAdapter {
    base_url: String,
    api_key: String,
}

impl AnthropicAdapter {
    fn new(base_url: String, api_key: String) -> Self {
        Self { base_url, api_key }
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn resolve_model(&self, requested: &str) -> String {
        let requested = requested.trim();
        if requested.is_empty() {
            return "claude-3-haiku-20240307".to_string();
        }
        for (prefix, canonical) in ANTHROPIC_MODEL_ALIASES {
            if requested.starts_with(prefix) {
                return (*canonical).to_string();
            }
        }
        if requested.starts_with("claude") {
            requested.to_string()
        } else {
            "claude-3-haiku-20240307".to_string()
        }
    }

    async fn open_stream(
        &self,
        http: &reqwest::Client,
        req: &RelayRequest,
    ) -> Result<DeltaStream, UpstreamError> {
        let url = join_url(&self.base_url, "v1/messages");
        let system: Vec<&str> = req
            .messages
            .iter()
            .filter(|m| m.role == ChatRole::System)
            .map(|m| m.content.as_str())
            .collect();
        let messages: Vec<Value> = req
            .messages
            .iter()
            .filter(|m| m.role != ChatRole::System)
            .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
            .collect();
        let mut body = json!({
            "model": req.model,
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
            "stream": true,
            "messages": messages,
        });
        if !system.is_empty() {
            if let Some(obj) = body.as_object_mut() {
                obj.insert("system".to_string(), Value::String(system.join("\n\n")));
            }
        }

        let resp = http
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|err| UpstreamError::Network(err.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::Http {
                status: status.as_u16(),
                message: text,
            });
        }

        // input_tokens arrives on message_start, output_tokens on
        // message_delta; the running sum is reported as the cumulative total.
        let mut input_tokens: u64 = 0;
        let stream = resp
            .bytes_stream()
            .eventsource()
            .filter_map(move |ev| {
                let out = match ev {
                    Ok(ev) => parse_anthropic_chunk(&ev.data, &mut input_tokens),
                    Err(_) => None,
                };
                futures_util::future::ready(out)
            })
            .boxed();
        Ok(stream)
    }
}

fn parse_chat_completions_chunk(data: &str) -> Option<DeltaEvent> {
    if data.trim() == "[DONE]" {
        return Some(DeltaEvent::terminal(None));
    }
    let value: Value = serde_json::from_str(data).ok()?;
    let content = value
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|v| v.as_str())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string());
    let total_tokens = value
        .get("usage")
        .and_then(|u| u.get("total_tokens"))
        .and_then(|v| v.as_u64());
    Some(DeltaEvent {
        content,
        total_tokens,
        terminal: false,
    })
}

fn parse_anthropic_chunk(data: &str, input_tokens: &mut u64) -> Option<DeltaEvent> {
    let value: Value = serde_json::from_str(data).ok()?;
    match value.get("type").and_then(|v| v.as_str())? {
        "message_start" => {
            if let Some(tokens) = value
                .get("message")
                .and_then(|m| m.get("usage"))
                .and_then(|u| u.get("input_tokens"))
                .and_then(|v| v.as_u64())
            {
                *input_tokens = tokens;
            }
            None
        }
        "content_block_delta" => {
            let delta = value.get("delta")?;
            if delta.get("type").and_then(|v| v.as_str()) != Some("text_delta") {
                return None;
            }
            delta
                .get("text")
                .and_then(|v| v.as_str())
                .filter(|t| !t.is_empty())
                .map(DeltaEvent::fragment)
        }
        "message_delta" => value
            .get("usage")
            .and_then(|u| u.get("output_tokens"))
            .and_then(|v| v.as_u64())
            .map(|output_tokens| DeltaEvent {
                content: None,
                total_tokens: Some(input_tokens.saturating_add(output_tokens)),
                terminal: false,
            }),
        "message_stop" => Some(DeltaEvent::terminal(None)),
        _ => None,
    }
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.ends_with("/v1") {
        if let Some(stripped) = path.strip_prefix("v1/") {
            path = stripped;
        }
    }
    format!("{}/{}", base, path)
}

/// The routed call for one request: which backend, which upstream model, and
/// the adapter to drive.
pub struct Routed<'a> {
    pub kind: ProviderKind,
    pub upstream_model: String,
    pub adapter: &'a dyn ProviderAdapter,
}

/// All adapters, built once at startup from process configuration and
/// carried in application state.
pub struct ProviderRegistry {
    gateway: OpenAiCompatAdapter,
    groq: OpenAiCompatAdapter,
    openrouter: OpenAiCompatAdapter,
    anthropic: AnthropicAdapter,
}

const GROQ_MODEL_FAMILIES: &[&str] = &["llama", "mixtral", "gemma"];

impl ProviderRegistry {
    pub fn from_config(cfg: &ProvidersConfig) -> Self {
        Self {
            gateway: OpenAiCompatAdapter::gateway(
                cfg.gateway.base_url.clone(),
                cfg.gateway.api_key.clone(),
            ),
            groq: OpenAiCompatAdapter::groq(cfg.groq.base_url.clone(), cfg.groq.api_key.clone()),
            openrouter: OpenAiCompatAdapter::openrouter(
                cfg.openrouter.base_url.clone(),
                cfg.openrouter.api_key.clone(),
            ),
            anthropic: AnthropicAdapter::new(
                cfg.anthropic.base_url.clone(),
                cfg.anthropic.api_key.clone(),
            ),
        }
    }

    /// Deterministic selection: explicit hint first, then model-family
    /// substrings, then the default gateway. Always resolves.
    pub fn route(&self, model: &str, hint: ProviderHint) -> Routed<'_> {
        let adapter: &dyn ProviderAdapter = match hint {
            ProviderHint::Openai => &self.gateway,
            ProviderHint::Groq => &self.groq,
            ProviderHint::Openrouter => &self.openrouter,
            ProviderHint::Anthropic => &self.anthropic,
            ProviderHint::Auto => {
                let lowered = model.to_ascii_lowercase();
                if lowered.contains("claude") {
                    &self.anthropic
                } else if GROQ_MODEL_FAMILIES.iter().any(|f| lowered.contains(f)) {
                    &self.groq
                } else {
                    &self.gateway
                }
            }
        };
        Routed {
            kind: adapter.kind(),
            upstream_model: adapter.resolve_model(model),
            adapter,
        }
    }
}
