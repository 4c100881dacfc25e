use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::chunk::Chunk;
use super::model::Model;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
    pub default_model: Option<String>,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
        default_model: Option<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
            default_model,
        }
    }
}

/// Chat speaker role as seen by providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: String,
}

impl ProviderMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Routing key of one generation: the topic and the assistant message being filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamTarget {
    pub topic_id: Uuid,
    pub message_id: Uuid,
}

impl StreamTarget {
    pub const fn new(topic_id: Uuid, message_id: Uuid) -> Self {
        Self {
            topic_id,
            message_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub target: StreamTarget,
    pub model_id: String,
    pub messages: Vec<ProviderMessage>,
    pub preamble: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    /// Fired by the caller to abort the request; adapters must stop promptly.
    pub cancel: CancellationToken,
}

impl StreamRequest {
    pub fn new(
        target: StreamTarget,
        model_id: impl Into<String>,
        messages: Vec<ProviderMessage>,
    ) -> Self {
        Self {
            target,
            model_id: model_id.into(),
            messages,
            preamble: None,
            temperature: None,
            max_tokens: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Last user turn, which adapters send as the prompt.
    pub fn last_user_content(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|message| matches!(message.role, Role::User))
            .map(|message| message.content.as_str())
    }
}

pub type ProviderWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("provider `{provider_id}` has no api key configured"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("no adapter for provider `{provider_id}`"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("nothing to send for {target:?} (at `{stage}`)"))]
    EmptyMessageSet {
        stage: &'static str,
        target: StreamTarget,
    },
    #[snafu(display("cannot build http client at `{stage}`: {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completion request failed at `{stage}`: {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
    #[snafu(display("scripted provider failure on `{stage}`: {message}"))]
    Scripted {
        stage: &'static str,
        message: String,
    },
}

impl ProviderError {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::MissingApiKey { .. } => "MissingApiKey",
            Self::UnsupportedProvider { .. } => "UnsupportedProvider",
            Self::EmptyMessageSet { .. } => "EmptyMessageSet",
            Self::HttpClient { .. } => "HttpClientError",
            Self::CompletionsFailed { .. } => "CompletionsFailed",
            Self::Scripted { .. } => "ScriptedFailure",
        }
    }

    pub fn stage(&self) -> Option<&'static str> {
        match self {
            Self::MissingApiKey { stage, .. }
            | Self::UnsupportedProvider { stage, .. }
            | Self::EmptyMessageSet { stage, .. }
            | Self::HttpClient { stage, .. }
            | Self::CompletionsFailed { stage, .. }
            | Self::Scripted { stage, .. } => Some(*stage),
        }
    }
}

pub struct ProviderEventStream {
    target: StreamTarget,
    events: mpsc::UnboundedReceiver<Chunk>,
    cancel: CancellationToken,
}

pub struct ProviderStreamHandle {
    pub stream: ProviderEventStream,
    pub worker: ProviderWorker,
}

impl ProviderEventStream {
    pub(crate) fn new(
        target: StreamTarget,
        events: mpsc::UnboundedReceiver<Chunk>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            target,
            events,
            cancel,
        }
    }

    pub fn target(&self) -> StreamTarget {
        self.target
    }

    pub async fn recv(&mut self) -> Option<Chunk> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Chunk> {
        self.events.try_recv().ok()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) -> bool {
        let was_live = !self.cancel.is_cancelled();
        self.cancel.cancel();
        was_live
    }
}

impl Drop for ProviderEventStream {
    fn drop(&mut self) {
        // Only this stream's child token is cancelled; the caller's token stays untouched.
        self.cancel.cancel();
    }
}

pub trait LlmProvider: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn default_model(&self) -> &str;
    fn fallback_models(&self) -> &[Model];
    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle>;
}

/// Wires the channel and a child cancellation token shared by the stream and its worker.
pub(crate) fn make_event_stream(
    target: StreamTarget,
    cancel: &CancellationToken,
) -> (
    mpsc::UnboundedSender<Chunk>,
    ProviderEventStream,
    CancellationToken,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let stream_cancel = cancel.child_token();
    let worker_cancel = stream_cancel.clone();
    (
        event_tx,
        ProviderEventStream::new(target, event_rx, stream_cancel),
        worker_cancel,
    )
}
