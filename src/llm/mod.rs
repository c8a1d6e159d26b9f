// LLM chat backends.
//
// Each backend implements the ChatBackend trait: one complete (non-streamed)
// chat-completion round trip. Rate limiting and 429 retry compose by
// wrapping (ratelimit.rs).

pub(crate) mod anthropic;
pub(crate) mod openai;
pub(crate) mod ratelimit;

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::agent::types::{ChatRequest, ChatResponse};
use crate::config::{resolve_provider_token, ProviderConfig};

/// Errors from a chat backend. Rate-limit responses are typed so the wrapper
/// can shape retries around them.
#[derive(Debug, thiserror::Error)]
pub(crate) enum LlmError {
    #[error("rate limit exceeded (429)")]
    RateLimited { retry_after: Option<Duration> },

    #[error("{provider} API error ({status}): {message}")]
    Api {
        provider: &'static str,
        status: u16,
        message: String,
    },

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("cancelled")]
    Cancelled,
}

/// One chat-completion operation; concretely realized per backend.
#[async_trait]
pub(crate) trait ChatBackend: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError>;
}

/// Create the raw backend for a provider configuration.
pub(crate) fn create_backend(provider: &ProviderConfig) -> anyhow::Result<Box<dyn ChatBackend>> {
    let token = resolve_provider_token(provider);
    let kind = provider.kind.to_uppercase();
    let base_url = provider.base_url.clone().unwrap_or_default();

    let needs_token = !(kind == "AZURE"
        && provider.auth_type.as_deref() == Some("entra_id"));
    let token = match token {
        Some(t) => t,
        None if needs_token => anyhow::bail!(
            "no API token configured for provider '{}' ({})",
            provider.name,
            provider.kind
        ),
        None => String::new(),
    };

    match kind.as_str() {
        "ANTHROPIC" | "AMAZON-ANTHROPIC" | "VERTEX" => Ok(Box::new(
            anthropic::AnthropicBackend::new(&token, &base_url, &provider.model)?,
        )),
        "AZURE" => Ok(Box::new(openai::OpenAiBackend::azure(
            &token,
            &base_url,
            &provider.model,
            provider.version.as_deref().unwrap_or("2024-06-01"),
            provider.auth_type.as_deref() == Some("entra_id"),
        )?)),
        _ => {
            // OPENAI, GROQ, GOOGLE and anything OpenAI-compatible.
            let default_url = match kind.as_str() {
                "GROQ" => "https://api.groq.com/openai/v1",
                "GOOGLE" => "https://generativelanguage.googleapis.com/v1beta/openai",
                _ => "https://api.openai.com/v1",
            };
            let url = if base_url.is_empty() {
                default_url
            } else {
                &base_url
            };
            Ok(Box::new(openai::OpenAiBackend::new(
                &token,
                url,
                &provider.model,
            )?))
        }
    }
}

/// Parse a Retry-After header value: integer seconds or an RFC-1123 date.
/// Invalid values are ignored.
pub(crate) fn parse_retry_after(value: &str) -> Option<Duration> {
    let trimmed = value.trim();
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let date = chrono::DateTime::parse_from_rfc2822(trimmed).ok()?;
    let delta = date.with_timezone(&Utc) - Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

/// Retry-After from a response's headers, if present and parsable.
pub(crate) fn retry_after_header(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("2"), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_after(" 10 "), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let future = Utc::now() + chrono::Duration::seconds(30);
        let parsed = parse_retry_after(&future.to_rfc2822()).unwrap();
        assert!(parsed <= Duration::from_secs(31));
        assert!(parsed >= Duration::from_secs(25));
    }

    #[test]
    fn test_parse_retry_after_past_date_is_zero() {
        let past = Utc::now() - chrono::Duration::seconds(30);
        assert_eq!(parse_retry_after(&past.to_rfc2822()), Some(Duration::ZERO));
    }

    #[test]
    fn test_parse_retry_after_invalid() {
        assert_eq!(parse_retry_after("soon"), None);
        assert_eq!(parse_retry_after(""), None);
    }

    #[test]
    fn test_create_backend_requires_token() {
        let provider = ProviderConfig {
            name: "p".into(),
            kind: "OPENAI".into(),
            token: None,
            secret: None,
            model: "gpt-4o".into(),
            base_url: None,
            version: None,
            project_id: None,
            location: None,
            credentials_path: None,
            auth_type: None,
            rate_limits: None,
            retry: None,
        };
        // Only run the negative check when the ambient env cannot satisfy it.
        if std::env::var("OPENAI_API_KEY").is_err() {
            assert!(create_backend(&provider).is_err());
        }
    }

    #[test]
    fn test_create_backend_entra_id_bypasses_token() {
        let provider = ProviderConfig {
            name: "az".into(),
            kind: "AZURE".into(),
            token: None,
            secret: None,
            model: "gpt-4o".into(),
            base_url: Some("https://example.openai.azure.com".into()),
            version: Some("2024-06-01".into()),
            project_id: None,
            location: None,
            credentials_path: None,
            auth_type: Some("entra_id".into()),
            rate_limits: None,
            retry: None,
        };
        assert!(create_backend(&provider).is_ok());
    }
}
