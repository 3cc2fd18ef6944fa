use std::sync::Arc;

mod gateway;
mod prompt;
mod rig_adapter;

pub use gateway::{
    AssistantGateway, DEFAULT_ENDPOINT, DEFAULT_OPENAI_MODEL, DEFAULT_PROVIDER_ID, ProviderConfig,
    ProviderError, ProviderResult, UnavailableGateway,
};
pub use prompt::{HEALTH_CHAT_PREAMBLE, health_chat_prompt};
pub use rig_adapter::{RIG_OPENAI_PROVIDER_ID, RigAssistantGateway};

pub fn create_gateway(mut config: ProviderConfig) -> ProviderResult<Arc<dyn AssistantGateway>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        "openai" | "rig-openai" => {
            config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
            Ok(Arc::new(RigAssistantGateway::new(config)?))
        }
        _ => Err(ProviderError::UnsupportedProvider {
            stage: "create-gateway",
            provider_id: config.provider_id,
        }),
    }
}
