use futures::FutureExt;
use futures::future::BoxFuture;
use rig::completion::Prompt;
use rig::prelude::CompletionClient;
use rig::providers::openai;
use snafu::{ResultExt, ensure};

use super::gateway::{
    AssistantGateway, EmptyQuerySnafu, HttpClientSnafu, MissingApiKeySnafu, PromptFailedSnafu,
    ProviderConfig, ProviderResult,
};
use super::prompt::{HEALTH_CHAT_PREAMBLE, health_chat_prompt};

pub const RIG_OPENAI_PROVIDER_ID: &str = "openai";

/// Health chat gateway backed by a rig OpenAI-compatible client.
pub struct RigAssistantGateway {
    config: ProviderConfig,
    client: openai::Client,
}

impl RigAssistantGateway {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-gateway-new",
                provider_id: config.provider_id.clone(),
            }
        );

        let client = Self::build_client(&config)?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn build_client(config: &ProviderConfig) -> ProviderResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    async fn prompt_once(&self, query: &str) -> ProviderResult<String> {
        ensure!(
            !query.trim().is_empty(),
            EmptyQuerySnafu {
                stage: "prompt-validate-query",
            }
        );

        let mut builder = self
            .client
            .agent(self.config.model_id.as_str())
            .preamble(HEALTH_CHAT_PREAMBLE);

        if let Some(temperature) = self.config.temperature {
            builder = builder.temperature(temperature);
        }

        if let Some(max_tokens) = self.config.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }

        let agent = builder.build();
        tracing::debug!(
            provider_id = %self.config.provider_id,
            model_id = %self.config.model_id,
            query_chars = query.chars().count(),
            "sending health chat prompt"
        );

        agent
            .prompt(health_chat_prompt(query))
            .await
            .context(PromptFailedSnafu { stage: "prompt" })
    }
}

impl AssistantGateway for RigAssistantGateway {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn ask<'a>(&'a self, query: &'a str) -> BoxFuture<'a, ProviderResult<String>> {
        self.prompt_once(query).boxed()
    }
}
