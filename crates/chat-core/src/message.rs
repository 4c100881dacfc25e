use std::time::{SystemTime, UNIX_EPOCH};

use robochat_llm::{Metrics, ModelRef, Usage};
use robochat_storage::{BlockId, MessageId, TopicId};

pub(crate) fn now_unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Lifecycle of a message.
///
/// User messages are created as `Success`. Assistant messages start as `Pending`, move to
/// `Processing` once their provider stream opens, and end as `Success` or `Error`. A
/// user-cancelled response ends as `Success` with an interrupted block attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    Pending,
    Processing,
    Success,
    Error,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }

    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub topic_id: TopicId,
    /// For assistant messages, the user message this one answers.
    pub ask_id: Option<MessageId>,
    pub role: Role,
    pub status: MessageStatus,
    pub model: Option<ModelRef>,
    /// Models explicitly addressed by a user message; each one gets its own response.
    pub mentions: Vec<ModelRef>,
    pub blocks: Vec<BlockId>,
    pub created_at_unix_millis: i64,
    pub updated_at_unix_millis: i64,
    pub metrics: Option<Metrics>,
    pub usage: Option<Usage>,
}

impl Message {
    fn base(topic_id: TopicId, role: Role, status: MessageStatus) -> Self {
        let now = now_unix_millis();
        Self {
            id: MessageId::new_v7(),
            topic_id,
            ask_id: None,
            role,
            status,
            model: None,
            mentions: Vec::new(),
            blocks: Vec::new(),
            created_at_unix_millis: now,
            updated_at_unix_millis: now,
            metrics: None,
            usage: None,
        }
    }

    pub fn user(topic_id: TopicId) -> Self {
        Self::base(topic_id, Role::User, MessageStatus::Success)
    }

    /// Placeholder response for `ask_id`, filled in by the stream orchestrator.
    pub fn assistant_stub(topic_id: TopicId, ask_id: MessageId, model: ModelRef) -> Self {
        let mut message = Self::base(topic_id, Role::Assistant, MessageStatus::Pending);
        message.ask_id = Some(ask_id);
        message.model = Some(model);
        message
    }

    pub fn with_mentions(mut self, mentions: Vec<ModelRef>) -> Self {
        self.mentions = mentions;
        self
    }

    pub fn with_blocks(mut self, blocks: Vec<BlockId>) -> Self {
        self.blocks = blocks;
        self
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }

    pub fn apply(&mut self, update: MessageUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(model) = update.model {
            self.model = Some(model);
        }
        if let Some(blocks) = update.blocks {
            self.blocks = blocks;
        }
        if let Some(insert) = update.append_block
            && !self.blocks.contains(&insert.block_id)
        {
            match insert.position {
                Some(position) if position < self.blocks.len() => {
                    self.blocks.insert(position, insert.block_id)
                }
                _ => self.blocks.push(insert.block_id),
            }
        }
        if update.clear_outcome {
            self.metrics = None;
            self.usage = None;
        }
        if let Some(metrics) = update.metrics {
            self.metrics = Some(metrics);
        }
        if let Some(usage) = update.usage {
            self.usage = Some(usage);
        }
        self.updated_at_unix_millis = now_unix_millis();
    }
}

/// Where a newly opened block lands in its message's block list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRefInsert {
    pub block_id: BlockId,
    /// `None` appends.
    pub position: Option<usize>,
}

/// Partial message update. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageUpdate {
    pub status: Option<MessageStatus>,
    pub model: Option<ModelRef>,
    pub blocks: Option<Vec<BlockId>>,
    pub append_block: Option<BlockRefInsert>,
    pub metrics: Option<Metrics>,
    pub usage: Option<Usage>,
    /// Drops metrics and usage before the other fields apply.
    pub clear_outcome: bool,
}

impl MessageUpdate {
    pub fn status(status: MessageStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: MessageStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_blocks(mut self, blocks: Vec<BlockId>) -> Self {
        self.blocks = Some(blocks);
        self
    }

    pub fn append_block(mut self, block_id: BlockId) -> Self {
        self.append_block = Some(BlockRefInsert {
            block_id,
            position: None,
        });
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_usage(mut self, usage: Option<Usage>) -> Self {
        self.usage = usage;
        self
    }

    pub fn clear_outcome(mut self) -> Self {
        self.clear_outcome = true;
        self
    }
}
