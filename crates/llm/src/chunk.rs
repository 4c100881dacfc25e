use serde::{Deserialize, Serialize};

use super::provider::ProviderError;

/// Token accounting reported by a provider for one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Timing measured around one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub time_first_token_millsec: Option<u64>,
    pub time_completion_millsec: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResponseSummary {
    pub usage: Option<Usage>,
    pub metrics: Option<Metrics>,
}

/// Structured failure description carried by error chunks and error blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
    pub status: Option<u16>,
    pub code: Option<String>,
}

impl ErrorInfo {
    pub const ABORT_ERROR_NAME: &'static str = "AbortError";

    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            status: None,
            code: None,
        }
    }

    /// The error observed by a stream consumer whose request was cancelled.
    pub fn abort() -> Self {
        Self::new(Self::ABORT_ERROR_NAME, "request was aborted")
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn is_abort(&self) -> bool {
        self.name == Self::ABORT_ERROR_NAME
    }
}

impl From<&ProviderError> for ErrorInfo {
    fn from(error: &ProviderError) -> Self {
        let info = Self::new(error.kind_name(), error.to_string()).with_stack(format!("{error:?}"));
        match error.stage() {
            Some(stage) => info.with_code(stage),
            None => info,
        }
    }
}

/// Provider stream protocol. Every adapter maps its native stream into these variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    ResponseCreated,
    ResponseInProgress,
    ThinkingDelta {
        text: String,
        thinking_millsec: Option<u64>,
    },
    ThinkingComplete {
        text: String,
        thinking_millsec: Option<u64>,
    },
    TextDelta {
        text: String,
    },
    TextComplete {
        text: String,
    },
    BlockComplete {
        response: Option<ResponseSummary>,
    },
    Error {
        error: ErrorInfo,
    },
}

impl Chunk {
    pub fn text_delta(text: impl Into<String>) -> Self {
        Self::TextDelta { text: text.into() }
    }

    pub fn text_complete(text: impl Into<String>) -> Self {
        Self::TextComplete { text: text.into() }
    }

    pub fn thinking_delta(text: impl Into<String>, thinking_millsec: u64) -> Self {
        Self::ThinkingDelta {
            text: text.into(),
            thinking_millsec: Some(thinking_millsec),
        }
    }

    pub fn thinking_complete(text: impl Into<String>, thinking_millsec: u64) -> Self {
        Self::ThinkingComplete {
            text: text.into(),
            thinking_millsec: Some(thinking_millsec),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::ResponseCreated => "response_created",
            Self::ResponseInProgress => "response_in_progress",
            Self::ThinkingDelta { .. } => "thinking_delta",
            Self::ThinkingComplete { .. } => "thinking_complete",
            Self::TextDelta { .. } => "text_delta",
            Self::TextComplete { .. } => "text_complete",
            Self::BlockComplete { .. } => "block_complete",
            Self::Error { .. } => "error",
        }
    }
}
