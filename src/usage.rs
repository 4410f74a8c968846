use crate::config::ProviderKind;
use crate::conversations::{ConversationStore, NewMessage};
use crate::providers::{ChatMessage, ChatRole};
use crate::relay::{Accumulator, FinalizeSink};
use crate::usage_log::{UsageLogEntry, UsageStore};
use crate::users::UserStore;
use async_trait::async_trait;

/// Flat estimated cost per token, matching the reference deployment.
pub const TOKEN_COST_RATE: f64 = 0.0001;

/// Used when the upstream never reported a usage figure. Never zero.
pub const FALLBACK_TOKEN_ESTIMATE: u64 = 100;

const DEFAULT_TITLE: &str = "Nova Conversa";

/// Records one completed exchange: the conversation with its messages, the
/// user's cumulative token counter, and a usage-log row. Each of the three
/// writes is an independent best-effort side effect; a failure is logged and
/// the remaining steps still run. Nothing here reaches the transport.
pub struct UsageFinalizer {
    users: UserStore,
    conversations: ConversationStore,
    usage: UsageStore,
    user_id: String,
    model: String,
    provider: ProviderKind,
    request_messages: Vec<ChatMessage>,
}

impl UsageFinalizer {
    pub fn new(
        users: UserStore,
        conversations: ConversationStore,
        usage: UsageStore,
        user_id: String,
        model: String,
        provider: ProviderKind,
        request_messages: Vec<ChatMessage>,
    ) -> Self {
        Self {
            users,
            conversations,
            usage,
            user_id,
            model,
            provider,
            request_messages,
        }
    }
}

#[async_trait]
impl FinalizeSink for UsageFinalizer {
    async fn finalize(&mut self, acc: &Accumulator) {
        let latency_ms = acc.latency_ms();
        let token_count = billable_tokens(acc.total_tokens);
        let title = derive_title(&self.request_messages);

        let mut messages: Vec<NewMessage> = self
            .request_messages
            .iter()
            .map(|m| {
                NewMessage::from_request(m.role, m.content.clone(), &self.model, self.provider)
            })
            .collect();
        messages.push(NewMessage {
            role: ChatRole::Assistant,
            content: acc.full_content.clone(),
            model: Some(self.model.clone()),
            provider: Some(self.provider),
            token_count: Some(token_count),
            latency_ms: Some(latency_ms),
        });

        best_effort(
            "conversation_create",
            self.conversations
                .create_with_messages(
                    &self.user_id,
                    &title,
                    &self.model,
                    self.provider,
                    &messages,
                )
                .await
                .map(|_| ()),
        );

        best_effort(
            "quota_increment",
            self.users.add_tokens_used(&self.user_id, token_count).await,
        );

        best_effort(
            "usage_log_append",
            self.usage
                .append(UsageLogEntry {
                    user_id: self.user_id.clone(),
                    provider: self.provider,
                    model: self.model.clone(),
                    token_count,
                    cost: token_count as f64 * TOKEN_COST_RATE,
                    request_type: "chat",
                    response_time_ms: latency_ms,
                })
                .await,
        );
    }
}

/// Named best-effort side-effect policy: persistence failures are logged and
/// swallowed so the client's stream still closes cleanly.
fn best_effort(step: &str, result: Result<(), String>) {
    if let Err(err) = result {
        tracing::warn!(step, error = %err, "best-effort side effect failed");
    }
}

fn billable_tokens(reported: Option<u64>) -> u64 {
    match reported {
        Some(tokens) if tokens > 0 => tokens,
        _ => FALLBACK_TOKEN_ESTIMATE,
    }
}

/// Title: first 50 characters of the first user message plus an ellipsis.
fn derive_title(messages: &[ChatMessage]) -> String {
    let Some(first) = messages.iter().find(|m| m.role == ChatRole::User) else {
        return DEFAULT_TITLE.to_string();
    };
    let trimmed = first.content.trim();
    if trimmed.is_empty() {
        return DEFAULT_TITLE.to_string();
    }
    let mut title: String = trimmed.chars().take(50).collect();
    title.push_str("...");
    title
}
