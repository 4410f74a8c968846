use serde::{Deserialize, Serialize};

/// Backend selection hint carried on a chat request. `Auto` defers the
/// decision to the router's model-family rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderHint {
    #[default]
    Auto,
    Openai,
    Anthropic,
    Groq,
    Openrouter,
}

impl ProviderHint {
    /// Unrecognized hints degrade to `Auto` rather than failing the request.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "openai" => Self::Openai,
            "anthropic" => Self::Anthropic,
            "groq" => Self::Groq,
            "openrouter" => Self::Openrouter,
            _ => Self::Auto,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Openai,
    Groq,
    Openrouter,
    Anthropic,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Openai => "openai",
            Self::Groq => "groq",
            Self::Openrouter => "openrouter",
            Self::Anthropic => "anthropic",
        }
    }
}

/// Credentials and endpoint for one upstream backend, read from process
/// configuration. An empty key is allowed at startup; calls through such a
/// backend fail as upstream errors when attempted.
#[derive(Debug, Clone)]
pub struct ProviderEndpoint {
    pub base_url: String,
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct ProvidersConfig {
    pub gateway: ProviderEndpoint,
    pub groq: ProviderEndpoint,
    pub openrouter: ProviderEndpoint,
    pub anthropic: ProviderEndpoint,
}

impl ProvidersConfig {
    pub fn from_env() -> Self {
        Self {
            gateway: endpoint_from_env("ABACUSAI", "https://apps.abacus.ai/v1"),
            groq: endpoint_from_env("GROQ", "https://api.groq.com/openai/v1"),
            openrouter: endpoint_from_env("OPENROUTER", "https://openrouter.ai/api/v1"),
            anthropic: endpoint_from_env("ANTHROPIC", "https://api.anthropic.com"),
        }
    }
}

fn endpoint_from_env(prefix: &str, default_base: &str) -> ProviderEndpoint {
    let base_url = std::env::var(format!("{prefix}_BASE_URL"))
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default_base.to_string());
    let api_key = std::env::var(format!("{prefix}_API_KEY"))
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_default();
    ProviderEndpoint { base_url, api_key }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hint_parsing_recognizes_backends() {
        assert_eq!(ProviderHint::parse("groq"), ProviderHint::Groq);
        assert_eq!(ProviderHint::parse("OpenAI"), ProviderHint::Openai);
        assert_eq!(ProviderHint::parse("auto"), ProviderHint::Auto);
    }

    #[test]
    fn hint_parsing_falls_back_to_auto() {
        assert_eq!(ProviderHint::parse("mystery-backend"), ProviderHint::Auto);
        assert_eq!(ProviderHint::parse(""), ProviderHint::Auto);
    }
}
