use robochat_llm::ErrorInfo;
use robochat_storage::{BlockId, MessageId};

use crate::message::now_unix_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockStatus {
    Processing,
    Streaming,
    Success,
    Error,
    Paused,
}

impl BlockStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Paused)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockType {
    Unknown,
    MainText,
    Thinking,
    Code,
    Error,
    Interrupted,
}

/// Type-specific block payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockKind {
    /// Placeholder opened when a response starts, before its first content chunk.
    Unknown,
    MainText {
        content: String,
    },
    Thinking {
        content: String,
        thinking_millsec: Option<u64>,
    },
    Code {
        content: String,
        language: Option<String>,
    },
    Error {
        error: ErrorInfo,
    },
    /// Marker left behind by a cancelled response, carrying its partial text.
    Interrupted {
        content: String,
    },
}

impl BlockKind {
    pub fn main_text(content: impl Into<String>) -> Self {
        Self::MainText {
            content: content.into(),
        }
    }

    pub fn block_type(&self) -> BlockType {
        match self {
            Self::Unknown => BlockType::Unknown,
            Self::MainText { .. } => BlockType::MainText,
            Self::Thinking { .. } => BlockType::Thinking,
            Self::Code { .. } => BlockType::Code,
            Self::Error { .. } => BlockType::Error,
            Self::Interrupted { .. } => BlockType::Interrupted,
        }
    }

    pub fn content(&self) -> Option<&str> {
        match self {
            Self::MainText { content }
            | Self::Thinking { content, .. }
            | Self::Code { content, .. }
            | Self::Interrupted { content } => Some(content),
            Self::Unknown | Self::Error { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBlock {
    pub id: BlockId,
    pub message_id: MessageId,
    pub status: BlockStatus,
    pub kind: BlockKind,
    pub created_at_unix_millis: i64,
    pub updated_at_unix_millis: i64,
}

impl MessageBlock {
    pub fn new(message_id: MessageId, kind: BlockKind, status: BlockStatus) -> Self {
        let now = now_unix_millis();
        Self {
            id: BlockId::new_v7(),
            message_id,
            status,
            kind,
            created_at_unix_millis: now,
            updated_at_unix_millis: now,
        }
    }

    pub fn block_type(&self) -> BlockType {
        self.kind.block_type()
    }

    pub fn content(&self) -> Option<&str> {
        self.kind.content()
    }

    pub fn apply(&mut self, update: BlockUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(kind) = update.kind {
            self.kind = kind;
        }
        self.updated_at_unix_millis = now_unix_millis();
    }
}

/// Partial block update. Unset fields are left untouched; `kind` replaces the payload whole.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockUpdate {
    pub status: Option<BlockStatus>,
    pub kind: Option<BlockKind>,
}

impl BlockUpdate {
    pub fn status(status: BlockStatus) -> Self {
        Self {
            status: Some(status),
            kind: None,
        }
    }

    pub fn kind(kind: BlockKind) -> Self {
        Self {
            status: None,
            kind: Some(kind),
        }
    }

    pub fn with_status(mut self, status: BlockStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Folds a newer update into this one; fields set on `newer` win.
    pub fn merge(self, newer: BlockUpdate) -> Self {
        Self {
            status: newer.status.or(self.status),
            kind: newer.kind.or(self.kind),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.kind.is_none()
    }
}
