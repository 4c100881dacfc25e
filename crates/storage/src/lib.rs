pub mod error;
pub mod ids;
pub mod sqlite;
pub mod types;

use std::future::Future;
use std::pin::Pin;

pub use error::{StorageError, StorageResult};
pub use ids::{BlockId, MessageId, RobotId, TopicId};
pub use sqlite::SqliteStorage;
pub use types::{
    BlockRecord, BlockRecordKind, BlockRecordStatus, DEFAULT_TOPIC_NAME, ErrorRecord,
    MessageRecord, MessageRecordStatus, MessageRole, MetricsRecord, ModelRecord, NewTopic,
    StorageBatch, TopicRecord, TopicSummary, UsageRecord,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The `topics` table: one row per conversation holding its ordered message list.
pub trait TopicStore: Send + Sync {
    fn create_topic(&self, input: NewTopic) -> BoxFuture<'_, StorageResult<TopicRecord>>;
    fn list_topics(&self, robot_id: RobotId) -> BoxFuture<'_, StorageResult<Vec<TopicSummary>>>;
    fn load_topic(&self, topic_id: TopicId) -> BoxFuture<'_, StorageResult<Option<TopicRecord>>>;
    fn rename_topic(&self, topic_id: TopicId, name: String) -> BoxFuture<'_, StorageResult<()>>;
    /// Removes the topic row together with every block owned by its messages.
    fn delete_topic(&self, topic_id: TopicId) -> BoxFuture<'_, StorageResult<()>>;
    fn put_topic_messages(
        &self,
        topic_id: TopicId,
        messages: Vec<MessageRecord>,
    ) -> BoxFuture<'_, StorageResult<()>>;
}

/// The `message_blocks` table, keyed by block id with a `message_id` back-reference.
pub trait BlockStore: Send + Sync {
    fn load_blocks(
        &self,
        message_ids: Vec<MessageId>,
    ) -> BoxFuture<'_, StorageResult<Vec<BlockRecord>>>;
    fn put_block(&self, block: BlockRecord) -> BoxFuture<'_, StorageResult<()>>;
    fn put_blocks(&self, blocks: Vec<BlockRecord>) -> BoxFuture<'_, StorageResult<()>>;
    fn delete_blocks(&self, block_ids: Vec<BlockId>) -> BoxFuture<'_, StorageResult<()>>;
}

/// Multi-table writes committed in a single transaction.
pub trait BatchStore: Send + Sync {
    fn commit(&self, batch: StorageBatch) -> BoxFuture<'_, StorageResult<()>>;
}

pub trait ChatStorage: TopicStore + BlockStore + BatchStore {}

impl<T> ChatStorage for T where T: TopicStore + BlockStore + BatchStore {}
