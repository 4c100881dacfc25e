//! Chat completions through rig.
//!
//! One adapter serves every rig-backed route. [`CompletionApi`] picks the wire protocol:
//! the OpenAI Responses API, plain OpenAI-style chat completions for local servers, or
//! DeepSeek's chat completions, which stream `reasoning_content` as reasoning.

use std::time::Instant;

use futures::StreamExt;
use rig::completion::{CompletionModel, GetTokenUsage, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::{deepseek, openai};
use rig::streaming::{StreamedAssistantContent, StreamingCompletionResponse};
use snafu::{ResultExt, ensure};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::chunk::{Chunk, ErrorInfo, Metrics, ResponseSummary, Usage};
use super::model::{
    DEFAULT_DEEPSEEK_MODEL, DEFAULT_OPENAI_MODEL, Model, default_deepseek_models,
    default_openai_models,
};
use super::provider::{
    CompletionsFailedSnafu, EmptyMessageSetSnafu, HttpClientSnafu, LlmProvider,
    MissingApiKeySnafu, ProviderConfig, ProviderError, ProviderMessage, ProviderResult,
    ProviderStreamHandle, ProviderWorker, Role, StreamRequest, make_event_stream,
};

pub const OPENAI_PROVIDER_ID: &str = "openai";
pub const DEEPSEEK_PROVIDER_ID: &str = "deepseek";

/// Wire protocol spoken by a rig-backed provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionApi {
    /// `/responses` on api.openai.com or a compatible gateway.
    OpenAiResponses,
    /// `/chat/completions`, which is what most self-hosted servers expose.
    OpenAiChat,
    DeepSeek,
}

pub struct OpenAiProvider {
    config: ProviderConfig,
    api: CompletionApi,
    models: Vec<Model>,
}

impl OpenAiProvider {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        Self::with_api(config, CompletionApi::OpenAiResponses)
    }

    pub fn with_api(config: ProviderConfig, api: CompletionApi) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "openai-provider-new",
                provider_id: config.provider_id.clone(),
            }
        );
        let models = match api {
            CompletionApi::DeepSeek => default_deepseek_models(),
            CompletionApi::OpenAiResponses | CompletionApi::OpenAiChat => default_openai_models(),
        };
        Ok(Self {
            config,
            api,
            models,
        })
    }

    pub fn api(&self) -> CompletionApi {
        self.api
    }

    fn openai_client(&self) -> ProviderResult<openai::Client> {
        let mut client = openai::Client::builder().api_key(self.config.api_key.as_str());
        if !self.config.endpoint.is_empty() {
            client = client.base_url(self.config.endpoint.as_str());
        }
        client.build().context(HttpClientSnafu {
            stage: "openai-client",
        })
    }

    fn deepseek_client(&self) -> ProviderResult<deepseek::Client> {
        let mut client = deepseek::Client::builder().api_key(self.config.api_key.as_str());
        if !self.config.endpoint.is_empty() {
            client = client.base_url(self.config.endpoint.as_str());
        }
        client.build().context(HttpClientSnafu {
            stage: "deepseek-client",
        })
    }
}

/// System turns and the request preamble, joined; rig takes a single preamble.
fn system_prompt(request: &StreamRequest) -> Option<String> {
    let system_turns = request
        .messages
        .iter()
        .filter(|message| message.role == Role::System)
        .map(|message| message.content.as_str());
    let parts = request
        .preamble
        .as_deref()
        .into_iter()
        .chain(system_turns)
        .filter(|part| !part.trim().is_empty())
        .collect::<Vec<_>>();

    (!parts.is_empty()).then(|| parts.join("\n\n"))
}

fn conversation(messages: &[ProviderMessage]) -> Vec<RigMessage> {
    messages
        .iter()
        .filter_map(|message| match message.role {
            Role::User => Some(RigMessage::user(message.content.clone())),
            Role::Assistant => Some(RigMessage::assistant(message.content.clone())),
            Role::System => None,
        })
        .collect()
}

async fn open<M>(
    model: &M,
    request: &StreamRequest,
) -> ProviderResult<StreamingCompletionResponse<M::StreamingResponse>>
where
    M: CompletionModel,
{
    let mut history = conversation(&request.messages);
    let Some(prompt) = history.pop() else {
        tracing::warn!(
            target = ?request.target,
            model_id = %request.model_id,
            "only system turns in history, nothing to prompt with"
        );
        return EmptyMessageSetSnafu {
            stage: "openai-prompt",
            target: request.target,
        }
        .fail();
    };

    let mut completion = model.completion_request(prompt).messages(history);
    if let Some(preamble) = system_prompt(request) {
        completion = completion.preamble(preamble);
    }
    if let Some(temperature) = request.temperature {
        completion = completion.temperature(temperature);
    }
    if let Some(max_tokens) = request.max_tokens {
        completion = completion.max_tokens(max_tokens);
    }
    completion.stream().await.context(CompletionsFailedSnafu {
        stage: "openai-open-stream",
    })
}

/// Token counts reported with the final stream item; all-zero reports count as missing.
fn usage_from(reported: rig::completion::Usage) -> Option<Usage> {
    let usage = Usage {
        prompt_tokens: reported.input_tokens,
        completion_tokens: reported.output_tokens,
        total_tokens: if reported.total_tokens > 0 {
            reported.total_tokens
        } else {
            reported.input_tokens + reported.output_tokens
        },
    };
    (usage.total_tokens > 0).then_some(usage)
}

/// Turns rig stream items into chunks and times the reasoning phase.
#[derive(Debug, Default)]
struct ReasoningClock {
    started: Option<Instant>,
}

impl ReasoningClock {
    fn thinking(&mut self, text: String) -> Option<Chunk> {
        if text.is_empty() {
            return None;
        }
        let started = *self.started.get_or_insert_with(Instant::now);
        Some(Chunk::thinking_delta(
            text,
            started.elapsed().as_millis() as u64,
        ))
    }

    fn translate<R>(&mut self, item: StreamedAssistantContent<R>) -> Option<Chunk>
    where
        R: Clone + Unpin,
    {
        match item {
            StreamedAssistantContent::Text(text) if !text.text.is_empty() => {
                Some(Chunk::text_delta(text.text))
            }
            StreamedAssistantContent::Reasoning(reasoning) => {
                self.thinking(reasoning.reasoning.concat())
            }
            StreamedAssistantContent::ReasoningDelta { reasoning, .. } => self.thinking(reasoning),
            _ => None,
        }
    }
}

fn send_error(events: &mpsc::UnboundedSender<Chunk>, error: &ProviderError) {
    let _ = events.send(Chunk::Error {
        error: ErrorInfo::from(error),
    });
}

/// Drives one completion until it ends, fails, or `cancel` fires.
async fn pump<M>(
    provider_id: String,
    model: M,
    request: StreamRequest,
    events: mpsc::UnboundedSender<Chunk>,
    cancel: CancellationToken,
) where
    M: CompletionModel,
{
    let target = request.target;
    let opened = tokio::select! {
        _ = cancel.cancelled() => {
            tracing::debug!(target = ?target, "cancelled while connecting");
            return;
        }
        opened = open(&model, &request) => opened,
    };
    let mut stream = match opened {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(
                target = ?target,
                provider_id = %provider_id,
                model_id = %request.model_id,
                error = %error,
                "completion request was refused"
            );
            send_error(&events, &error);
            return;
        }
    };
    if events.send(Chunk::ResponseCreated).is_err() {
        return;
    }

    let started = Instant::now();
    let mut clock = ReasoningClock::default();
    let mut usage = None;
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(target = ?target, "cancelled mid-stream");
                stream.cancel();
                return;
            }
            item = stream.next() => item,
        };
        match item {
            None => break,
            Some(Ok(StreamedAssistantContent::Final(response))) => {
                usage = response.token_usage().and_then(usage_from);
            }
            Some(Ok(item)) => {
                let Some(chunk) = clock.translate(item) else {
                    continue;
                };
                if events.send(chunk).is_err() {
                    return;
                }
            }
            Some(Err(source)) => {
                tracing::warn!(target = ?target, error = %source, "completion stream broke");
                send_error(
                    &events,
                    &ProviderError::CompletionsFailed {
                        stage: "openai-stream-item",
                        source,
                    },
                );
                return;
            }
        }
    }

    tracing::debug!(target = ?target, usage = ?usage, "completion stream drained");
    let _ = events.send(Chunk::BlockComplete {
        response: Some(ResponseSummary {
            usage,
            metrics: Some(Metrics {
                time_first_token_millsec: None,
                time_completion_millsec: Some(started.elapsed().as_millis() as u64),
            }),
        }),
    });
}

impl LlmProvider for OpenAiProvider {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn name(&self) -> &str {
        match self.api {
            CompletionApi::OpenAiResponses => "OpenAI",
            CompletionApi::OpenAiChat => "OpenAI compatible",
            CompletionApi::DeepSeek => "DeepSeek",
        }
    }

    fn default_model(&self) -> &str {
        let fallback = match self.api {
            CompletionApi::DeepSeek => DEFAULT_DEEPSEEK_MODEL,
            CompletionApi::OpenAiResponses | CompletionApi::OpenAiChat => DEFAULT_OPENAI_MODEL,
        };
        self.config.default_model.as_deref().unwrap_or(fallback)
    }

    fn fallback_models(&self) -> &[Model] {
        &self.models
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !request.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "openai-stream-chat",
                target: request.target,
            }
        );

        let provider_id = self.config.provider_id.clone();
        let model_id = request.model_id.clone();
        let (events, stream, cancel) = make_event_stream(request.target, &request.cancel);
        let worker: ProviderWorker = match self.api {
            CompletionApi::OpenAiResponses => {
                let model = self.openai_client()?.completion_model(model_id);
                Box::pin(pump(provider_id, model, request, events, cancel))
            }
            CompletionApi::OpenAiChat => {
                let model = self
                    .openai_client()?
                    .completions_api()
                    .completion_model(model_id);
                Box::pin(pump(provider_id, model, request, events, cancel))
            }
            CompletionApi::DeepSeek => {
                let model = self.deepseek_client()?.completion_model(model_id);
                Box::pin(pump(provider_id, model, request, events, cancel))
            }
        };
        Ok(ProviderStreamHandle { stream, worker })
    }
}
