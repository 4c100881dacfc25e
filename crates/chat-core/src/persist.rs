use std::sync::Arc;

use robochat_storage::{BlockId, ChatStorage, StorageBatch, StorageError, TopicId};

use crate::block::MessageBlock;
use crate::serializer::{block_to_record, message_to_record};
use crate::store::MessageStore;

/// Writes in-memory state through to storage.
///
/// Failures are logged and swallowed: the in-memory stores stay authoritative for the
/// running session and the next successful write for the same rows catches storage up.
#[derive(Clone)]
pub(crate) struct Persister {
    storage: Arc<dyn ChatStorage>,
    messages: Arc<MessageStore>,
}

impl Persister {
    pub(crate) fn new(storage: Arc<dyn ChatStorage>, messages: Arc<MessageStore>) -> Self {
        Self { storage, messages }
    }

    pub(crate) fn storage(&self) -> &Arc<dyn ChatStorage> {
        &self.storage
    }

    pub(crate) async fn save_block(&self, block: &MessageBlock) {
        if let Err(error) = self.storage.put_block(block_to_record(block)).await {
            log_failure("save-block", None, &error);
        }
    }

    /// Writes the topic's message list plus block upserts and deletions in one transaction.
    pub(crate) async fn save_topic_with_blocks(
        &self,
        topic_id: TopicId,
        upserts: &[MessageBlock],
        deletes: Vec<BlockId>,
    ) {
        let messages = self
            .messages
            .messages_for_topic(topic_id)
            .iter()
            .map(message_to_record)
            .collect();
        let batch = StorageBatch::new()
            .with_topic_messages(topic_id, messages)
            .with_blocks(upserts.iter().map(block_to_record))
            .with_deleted_blocks(deletes);

        if let Err(error) = self.storage.commit(batch).await {
            log_failure("save-topic", Some(topic_id), &error);
        }
    }
}

fn log_failure(operation: &'static str, topic_id: Option<TopicId>, error: &StorageError) {
    match topic_id {
        Some(topic_id) => tracing::warn!(
            operation,
            topic_id = %topic_id,
            error = %error,
            "persisting chat state failed; keeping in-memory state"
        ),
        None => tracing::warn!(
            operation,
            error = %error,
            "persisting chat state failed; keeping in-memory state"
        ),
    }
}
