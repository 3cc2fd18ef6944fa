use futures::future::BoxFuture;
use snafu::Snafu;

pub const DEFAULT_PROVIDER_ID: &str = "openai";
pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
    pub model_id: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        let model_id = model_id.into().trim().to_string();
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
            model_id: if model_id.is_empty() {
                DEFAULT_OPENAI_MODEL.to_string()
            } else {
                model_id
            },
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: Option<f64>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u64>) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("assistant query is empty"))]
    EmptyQuery { stage: &'static str },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("prompt failed on `{stage}`, {source}"))]
    PromptFailed {
        stage: &'static str,
        source: rig::completion::PromptError,
    },
    #[snafu(display("assistant provider is not configured: {reason}"))]
    NotConfigured { stage: &'static str, reason: String },
}

/// Whole-response text generation boundary.
///
/// One call per user turn: the query goes in, the reply text comes out, or the call
/// fails. Implementations never retry; callers decide how a failure is presented.
pub trait AssistantGateway: Send + Sync {
    fn id(&self) -> &str;
    fn ask<'a>(&'a self, query: &'a str) -> BoxFuture<'a, ProviderResult<String>>;
}

/// Stand-in used when no provider could be built; every call fails.
#[derive(Debug, Clone)]
pub struct UnavailableGateway {
    reason: String,
}

impl UnavailableGateway {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl AssistantGateway for UnavailableGateway {
    fn id(&self) -> &str {
        "unavailable"
    }

    fn ask<'a>(&'a self, _query: &'a str) -> BoxFuture<'a, ProviderResult<String>> {
        let reason = self.reason.clone();
        Box::pin(async move {
            NotConfiguredSnafu {
                stage: "unavailable-ask",
                reason,
            }
            .fail()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_config_trims_and_defaults_model() {
        let config = ProviderConfig::new(" openai ", " sk-test ", " https://example.test ", "  ");

        assert_eq!(config.provider_id, "openai");
        assert_eq!(config.api_key, "sk-test");
        assert_eq!(config.endpoint, "https://example.test");
        assert_eq!(config.model_id, DEFAULT_OPENAI_MODEL);
        assert_eq!(config.temperature, None);
    }

    #[tokio::test]
    async fn unavailable_gateway_always_fails() {
        let gateway = UnavailableGateway::new("no api key");
        let error = gateway
            .ask("hello")
            .await
            .expect_err("unavailable gateway must fail");

        assert!(matches!(error, ProviderError::NotConfigured { .. }));
        assert_eq!(
            error.to_string(),
            "assistant provider is not configured: no api key"
        );
    }
}
