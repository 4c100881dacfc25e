//! Field-by-field mapping between in-memory types and storage records.
//!
//! Only the fields listed here are persisted; transient view state never reaches the database.

use robochat_llm::{ErrorInfo, Metrics, ModelRef, Usage};
use robochat_storage::{
    BlockRecord, BlockRecordKind, BlockRecordStatus, ErrorRecord, MessageRecord,
    MessageRecordStatus, MessageRole, MetricsRecord, ModelRecord, UsageRecord,
};

use crate::block::{BlockKind, BlockStatus, MessageBlock};
use crate::message::{Message, MessageStatus, Role};

pub fn message_to_record(message: &Message) -> MessageRecord {
    MessageRecord {
        id: message.id,
        topic_id: message.topic_id,
        ask_id: message.ask_id,
        role: match message.role {
            Role::System => MessageRole::System,
            Role::User => MessageRole::User,
            Role::Assistant => MessageRole::Assistant,
        },
        status: match message.status {
            MessageStatus::Pending => MessageRecordStatus::Pending,
            MessageStatus::Processing => MessageRecordStatus::Processing,
            MessageStatus::Success => MessageRecordStatus::Success,
            MessageStatus::Error => MessageRecordStatus::Error,
        },
        model: message.model.as_ref().map(model_to_record),
        mentions: message.mentions.iter().map(model_to_record).collect(),
        blocks: message.blocks.clone(),
        created_at_unix_millis: message.created_at_unix_millis,
        updated_at_unix_millis: message.updated_at_unix_millis,
        metrics: message.metrics.map(|metrics| MetricsRecord {
            time_first_token_millsec: metrics.time_first_token_millsec,
            time_completion_millsec: metrics.time_completion_millsec,
        }),
        usage: message.usage.map(|usage| UsageRecord {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }),
    }
}

pub fn message_from_record(record: MessageRecord) -> Message {
    Message {
        id: record.id,
        topic_id: record.topic_id,
        ask_id: record.ask_id,
        role: match record.role {
            MessageRole::System => Role::System,
            MessageRole::User => Role::User,
            MessageRole::Assistant => Role::Assistant,
        },
        status: match record.status {
            MessageRecordStatus::Pending => MessageStatus::Pending,
            MessageRecordStatus::Processing => MessageStatus::Processing,
            MessageRecordStatus::Success => MessageStatus::Success,
            MessageRecordStatus::Error => MessageStatus::Error,
        },
        model: record.model.map(model_from_record),
        mentions: record.mentions.into_iter().map(model_from_record).collect(),
        blocks: record.blocks,
        created_at_unix_millis: record.created_at_unix_millis,
        updated_at_unix_millis: record.updated_at_unix_millis,
        metrics: record.metrics.map(|metrics| Metrics {
            time_first_token_millsec: metrics.time_first_token_millsec,
            time_completion_millsec: metrics.time_completion_millsec,
        }),
        usage: record.usage.map(|usage| Usage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }),
    }
}

fn model_to_record(model: &ModelRef) -> ModelRecord {
    ModelRecord {
        provider_id: model.provider_id.clone(),
        model_id: model.model_id.clone(),
    }
}

fn model_from_record(record: ModelRecord) -> ModelRef {
    ModelRef::new(record.provider_id, record.model_id)
}

pub fn block_to_record(block: &MessageBlock) -> BlockRecord {
    BlockRecord {
        id: block.id,
        message_id: block.message_id,
        status: match block.status {
            BlockStatus::Processing => BlockRecordStatus::Processing,
            BlockStatus::Streaming => BlockRecordStatus::Streaming,
            BlockStatus::Success => BlockRecordStatus::Success,
            BlockStatus::Error => BlockRecordStatus::Error,
            BlockStatus::Paused => BlockRecordStatus::Paused,
        },
        kind: match &block.kind {
            BlockKind::Unknown => BlockRecordKind::Unknown,
            BlockKind::MainText { content } => BlockRecordKind::MainText {
                content: content.clone(),
            },
            BlockKind::Thinking {
                content,
                thinking_millsec,
            } => BlockRecordKind::Thinking {
                content: content.clone(),
                thinking_millsec: *thinking_millsec,
            },
            BlockKind::Code { content, language } => BlockRecordKind::Code {
                content: content.clone(),
                language: language.clone(),
            },
            BlockKind::Error { error } => BlockRecordKind::Error {
                error: ErrorRecord {
                    name: error.name.clone(),
                    message: error.message.clone(),
                    stack: error.stack.clone(),
                    status: error.status,
                    code: error.code.clone(),
                },
            },
            BlockKind::Interrupted { content } => BlockRecordKind::Interrupted {
                content: content.clone(),
            },
        },
        created_at_unix_millis: block.created_at_unix_millis,
        updated_at_unix_millis: block.updated_at_unix_millis,
    }
}

pub fn block_from_record(record: BlockRecord) -> MessageBlock {
    MessageBlock {
        id: record.id,
        message_id: record.message_id,
        status: match record.status {
            BlockRecordStatus::Processing => BlockStatus::Processing,
            BlockRecordStatus::Streaming => BlockStatus::Streaming,
            BlockRecordStatus::Success => BlockStatus::Success,
            BlockRecordStatus::Error => BlockStatus::Error,
            BlockRecordStatus::Paused => BlockStatus::Paused,
        },
        kind: match record.kind {
            BlockRecordKind::Unknown => BlockKind::Unknown,
            BlockRecordKind::MainText { content } => BlockKind::MainText { content },
            BlockRecordKind::Thinking {
                content,
                thinking_millsec,
            } => BlockKind::Thinking {
                content,
                thinking_millsec,
            },
            BlockRecordKind::Code { content, language } => BlockKind::Code { content, language },
            BlockRecordKind::Error { error } => BlockKind::Error {
                error: ErrorInfo {
                    name: error.name,
                    message: error.message,
                    stack: error.stack,
                    status: error.status,
                    code: error.code,
                },
            },
            BlockRecordKind::Interrupted { content } => BlockKind::Interrupted { content },
        },
        created_at_unix_millis: record.created_at_unix_millis,
        updated_at_unix_millis: record.updated_at_unix_millis,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use robochat_storage::{MessageId, TopicId};

    #[test]
    fn assistant_message_keeps_ask_model_and_usage() {
        let topic_id = TopicId::new_v7();
        let ask_id = MessageId::new_v7();
        let mut message =
            Message::assistant_stub(topic_id, ask_id, ModelRef::new("openai", "gpt-4o"));
        message.usage = Some(Usage {
            prompt_tokens: 3,
            completion_tokens: 4,
            total_tokens: 7,
        });

        let record = message_to_record(&message);
        assert_eq!(record.ask_id, Some(ask_id));
        assert_eq!(record.status, MessageRecordStatus::Pending);
        assert_eq!(record.usage.map(|usage| usage.total_tokens), Some(7));

        assert_eq!(message_from_record(record), message);
    }

    #[test]
    fn error_block_carries_structured_error() {
        let block = MessageBlock::new(
            MessageId::new_v7(),
            BlockKind::Error {
                error: ErrorInfo::new("CompletionsFailed", "boom")
                    .with_status(502)
                    .with_code("open-stream"),
            },
            BlockStatus::Error,
        );

        let record = block_to_record(&block);
        let BlockRecordKind::Error { error } = &record.kind else {
            panic!("expected error payload, got {:?}", record.kind);
        };
        assert_eq!(error.status, Some(502));
        assert_eq!(error.code.as_deref(), Some("open-stream"));
        assert_eq!(record.status, BlockRecordStatus::Error);
    }
}
