use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use robochat_storage::{
    BatchStore, BlockId, BlockRecord, BlockRecordStatus, BlockStore, BoxFuture, MessageId,
    MessageRecord, NewTopic, RobotId, SqliteStorage, StorageBatch, StorageError, StorageResult,
    TopicId, TopicRecord, TopicStore, TopicSummary,
};

/// One write observed by [`RecordingStorage`], in commit order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WriteOp {
    Block {
        block_id: BlockId,
        message_id: MessageId,
        status: BlockRecordStatus,
        kind: &'static str,
    },
    Topic {
        topic_id: TopicId,
        message_count: usize,
    },
    DeleteBlocks(Vec<BlockId>),
}

/// In-memory SQLite wrapper that logs every write and can be told to fail or stall them.
pub(crate) struct RecordingStorage {
    inner: SqliteStorage,
    log: Mutex<Vec<WriteOp>>,
    fail_writes: AtomicBool,
    write_delays: Mutex<HashMap<BlockId, Duration>>,
}

impl RecordingStorage {
    pub(crate) async fn open() -> Arc<Self> {
        let inner = SqliteStorage::open(":memory:")
            .await
            .expect("in-memory sqlite opens");
        Arc::new(Self {
            inner,
            log: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            write_delays: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Every commit that upserts `block_id` sleeps for `delay` first.
    pub(crate) fn delay_writes_of(&self, block_id: BlockId, delay: Duration) {
        self.write_delays.lock().insert(block_id, delay);
    }

    fn write_delay(&self, blocks: &[BlockRecord]) -> Option<Duration> {
        let delays = self.write_delays.lock();
        blocks
            .iter()
            .filter_map(|block| delays.get(&block.id).copied())
            .max()
    }

    pub(crate) fn writes(&self) -> Vec<WriteOp> {
        self.log.lock().clone()
    }

    /// Block writes only, as `(message_id, status)` pairs.
    pub(crate) fn block_writes(&self) -> Vec<(MessageId, BlockRecordStatus)> {
        self.writes()
            .into_iter()
            .filter_map(|op| match op {
                WriteOp::Block {
                    message_id, status, ..
                } => Some((message_id, status)),
                _ => None,
            })
            .collect()
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::BrokenInvariant {
                stage: "recording-storage",
                details: "writes disabled by test".to_string(),
            });
        }
        Ok(())
    }

    fn record_blocks(&self, blocks: &[BlockRecord]) {
        let mut log = self.log.lock();
        for block in blocks {
            log.push(WriteOp::Block {
                block_id: block.id,
                message_id: block.message_id,
                status: block.status,
                kind: block.kind.type_name(),
            });
        }
    }
}

impl TopicStore for RecordingStorage {
    fn create_topic(&self, input: NewTopic) -> BoxFuture<'_, StorageResult<TopicRecord>> {
        self.inner.create_topic(input)
    }

    fn list_topics(&self, robot_id: RobotId) -> BoxFuture<'_, StorageResult<Vec<TopicSummary>>> {
        self.inner.list_topics(robot_id)
    }

    fn load_topic(&self, topic_id: TopicId) -> BoxFuture<'_, StorageResult<Option<TopicRecord>>> {
        self.inner.load_topic(topic_id)
    }

    fn rename_topic(&self, topic_id: TopicId, name: String) -> BoxFuture<'_, StorageResult<()>> {
        self.inner.rename_topic(topic_id, name)
    }

    fn delete_topic(&self, topic_id: TopicId) -> BoxFuture<'_, StorageResult<()>> {
        self.inner.delete_topic(topic_id)
    }

    fn put_topic_messages(
        &self,
        topic_id: TopicId,
        messages: Vec<MessageRecord>,
    ) -> BoxFuture<'_, StorageResult<()>> {
        self.commit(StorageBatch::new().with_topic_messages(topic_id, messages))
    }
}

impl BlockStore for RecordingStorage {
    fn load_blocks(
        &self,
        message_ids: Vec<MessageId>,
    ) -> BoxFuture<'_, StorageResult<Vec<BlockRecord>>> {
        self.inner.load_blocks(message_ids)
    }

    fn put_block(&self, block: BlockRecord) -> BoxFuture<'_, StorageResult<()>> {
        self.commit(StorageBatch::new().with_block(block))
    }

    fn put_blocks(&self, blocks: Vec<BlockRecord>) -> BoxFuture<'_, StorageResult<()>> {
        self.commit(StorageBatch::new().with_blocks(blocks))
    }

    fn delete_blocks(&self, block_ids: Vec<BlockId>) -> BoxFuture<'_, StorageResult<()>> {
        self.commit(StorageBatch::new().with_deleted_blocks(block_ids))
    }
}

impl BatchStore for RecordingStorage {
    fn commit(&self, batch: StorageBatch) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.check_writable()?;
            let upserts = batch.upsert_blocks.clone();
            if let Some(delay) = self.write_delay(&upserts) {
                tokio::time::sleep(delay).await;
            }
            let deletes = batch.delete_block_ids.clone();
            let topic = batch
                .topic_messages
                .as_ref()
                .map(|(topic_id, messages)| (*topic_id, messages.len()));
            self.inner.commit(batch).await?;

            if !deletes.is_empty() {
                self.log.lock().push(WriteOp::DeleteBlocks(deletes));
            }
            self.record_blocks(&upserts);
            if let Some((topic_id, message_count)) = topic {
                self.log.lock().push(WriteOp::Topic {
                    topic_id,
                    message_count,
                });
            }
            Ok(())
        })
    }
}
