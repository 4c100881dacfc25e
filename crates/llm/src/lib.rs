use std::sync::Arc;

mod chunk;
mod model;
mod openai;
mod provider;
mod scripted;

pub use chunk::{Chunk, ErrorInfo, Metrics, ResponseSummary, Usage};
pub use model::{
    DEFAULT_DEEPSEEK_MODEL, DEFAULT_OPENAI_MODEL, Model, ModelRef, default_deepseek_models,
    default_openai_models,
};
pub use openai::{CompletionApi, DEEPSEEK_PROVIDER_ID, OPENAI_PROVIDER_ID, OpenAiProvider};
pub use provider::{
    LlmProvider, ProviderConfig, ProviderError, ProviderEventStream, ProviderMessage,
    ProviderResult, ProviderStreamHandle, ProviderWorker, Role, StreamRequest, StreamTarget,
};
pub use scripted::{SCRIPTED_PROVIDER_ID, ScriptStep, ScriptedProvider};

pub fn create_provider(mut config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = OPENAI_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        "openai" | "rig-openai" => {
            config.provider_id = OPENAI_PROVIDER_ID.to_string();
            Ok(Arc::new(OpenAiProvider::new(config)?))
        }
        DEEPSEEK_PROVIDER_ID => Ok(Arc::new(OpenAiProvider::with_api(
            config,
            CompletionApi::DeepSeek,
        )?)),
        // Self-hosted servers speak chat completions, not the Responses API.
        "local" => Ok(Arc::new(OpenAiProvider::with_api(
            config,
            CompletionApi::OpenAiChat,
        )?)),
        SCRIPTED_PROVIDER_ID => Ok(Arc::new(ScriptedProvider::echo())),
        _ => Err(ProviderError::UnsupportedProvider {
            stage: "create-provider",
            provider_id: config.provider_id,
        }),
    }
}
