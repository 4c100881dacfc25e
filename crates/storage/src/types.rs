use serde::{Deserialize, Serialize};

use super::ids::{BlockId, MessageId, RobotId, TopicId};

/// Default topic name used when callers create a topic with a blank name.
pub const DEFAULT_TOPIC_NAME: &str = "New Topic";

/// Storage-local message role, intentionally decoupled from pipeline-layer role enums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRecordStatus {
    Pending,
    Processing,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockRecordStatus {
    Processing,
    Streaming,
    Success,
    Error,
    Paused,
}

impl BlockRecordStatus {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Streaming => "streaming",
            Self::Success => "success",
            Self::Error => "error",
            Self::Paused => "paused",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub provider_id: String,
    pub model_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UsageRecord {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetricsRecord {
    #[serde(default)]
    pub time_first_token_millsec: Option<u64>,
    #[serde(default)]
    pub time_completion_millsec: Option<u64>,
}

/// One message as persisted inside its topic row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub topic_id: TopicId,
    #[serde(default)]
    pub ask_id: Option<MessageId>,
    pub role: MessageRole,
    pub status: MessageRecordStatus,
    #[serde(default)]
    pub model: Option<ModelRecord>,
    #[serde(default)]
    pub mentions: Vec<ModelRecord>,
    #[serde(default)]
    pub blocks: Vec<BlockId>,
    pub created_at_unix_millis: i64,
    pub updated_at_unix_millis: i64,
    #[serde(default)]
    pub metrics: Option<MetricsRecord>,
    #[serde(default)]
    pub usage: Option<UsageRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub code: Option<String>,
}

/// Type-specific block payload, stored as JSON next to the common block columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockRecordKind {
    Unknown,
    MainText {
        content: String,
    },
    Thinking {
        content: String,
        #[serde(default)]
        thinking_millsec: Option<u64>,
    },
    Code {
        content: String,
        #[serde(default)]
        language: Option<String>,
    },
    Error {
        error: ErrorRecord,
    },
    Interrupted {
        content: String,
    },
}

impl BlockRecordKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::MainText { .. } => "main_text",
            Self::Thinking { .. } => "thinking",
            Self::Code { .. } => "code",
            Self::Error { .. } => "error",
            Self::Interrupted { .. } => "interrupted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub id: BlockId,
    pub message_id: MessageId,
    pub status: BlockRecordStatus,
    pub kind: BlockRecordKind,
    pub created_at_unix_millis: i64,
    pub updated_at_unix_millis: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRecord {
    pub id: TopicId,
    pub robot_id: RobotId,
    pub name: String,
    pub messages: Vec<MessageRecord>,
    pub created_at_unix_millis: i64,
    pub updated_at_unix_millis: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSummary {
    pub id: TopicId,
    pub robot_id: RobotId,
    pub name: String,
    pub message_count: usize,
    pub updated_at_unix_millis: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTopic {
    pub robot_id: RobotId,
    pub name: String,
}

/// Writes that must land together: either every part commits or none does.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageBatch {
    pub topic_messages: Option<(TopicId, Vec<MessageRecord>)>,
    pub upsert_blocks: Vec<BlockRecord>,
    pub delete_block_ids: Vec<BlockId>,
}

impl StorageBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_topic_messages(mut self, topic_id: TopicId, messages: Vec<MessageRecord>) -> Self {
        self.topic_messages = Some((topic_id, messages));
        self
    }

    pub fn with_block(mut self, block: BlockRecord) -> Self {
        self.upsert_blocks.push(block);
        self
    }

    pub fn with_blocks(mut self, blocks: impl IntoIterator<Item = BlockRecord>) -> Self {
        self.upsert_blocks.extend(blocks);
        self
    }

    pub fn with_deleted_blocks(mut self, block_ids: impl IntoIterator<Item = BlockId>) -> Self {
        self.delete_block_ids.extend(block_ids);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.topic_messages.is_none()
            && self.upsert_blocks.is_empty()
            && self.delete_block_ids.is_empty()
    }
}
