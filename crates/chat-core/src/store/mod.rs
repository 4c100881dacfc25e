mod blocks;
mod messages;

use robochat_storage::{BlockId, MessageId, TopicId};

pub use blocks::MessageBlockStore;
pub use messages::MessageStore;

const EVENT_CAPACITY: usize = 256;

/// Change notification published by the in-memory stores.
///
/// Subscribers that fall behind see `RecvError::Lagged` and should re-read the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    MessageAdded {
        topic_id: TopicId,
        message_id: MessageId,
    },
    MessageUpdated {
        topic_id: TopicId,
        message_id: MessageId,
    },
    MessagesRemoved {
        topic_id: TopicId,
        message_ids: Vec<MessageId>,
    },
    TopicLoaded {
        topic_id: TopicId,
    },
    TopicLoading {
        topic_id: TopicId,
        loading: bool,
    },
    StreamingMessageChanged {
        message_id: Option<MessageId>,
    },
    BlocksUpserted {
        block_ids: Vec<BlockId>,
    },
    BlockUpdated {
        block_id: BlockId,
    },
    BlocksRemoved {
        block_ids: Vec<BlockId>,
    },
}
