use std::collections::HashMap;

use parking_lot::RwLock;
use robochat_storage::{BlockId, MessageId};
use tokio::sync::broadcast;

use super::{EVENT_CAPACITY, StoreEvent};
use crate::block::{BlockUpdate, MessageBlock};

#[derive(Default)]
struct BlockStoreState {
    blocks: HashMap<BlockId, MessageBlock>,
    // Derived from `blocks`; kept in insertion order per message.
    by_message: HashMap<MessageId, Vec<BlockId>>,
}

impl BlockStoreState {
    fn index(&mut self, block: &MessageBlock) {
        let ids = self.by_message.entry(block.message_id).or_default();
        if !ids.contains(&block.id) {
            ids.push(block.id);
        }
    }

    fn unindex(&mut self, block: &MessageBlock) {
        if let Some(ids) = self.by_message.get_mut(&block.message_id) {
            ids.retain(|existing| *existing != block.id);
            if ids.is_empty() {
                self.by_message.remove(&block.message_id);
            }
        }
    }

    fn upsert(&mut self, block: MessageBlock) {
        if let Some(previous) = self.blocks.remove(&block.id)
            && previous.message_id != block.message_id
        {
            self.unindex(&previous);
        }
        self.index(&block);
        self.blocks.insert(block.id, block);
    }
}

/// Normalized in-memory blocks with a per-message index.
pub struct MessageBlockStore {
    state: RwLock<BlockStoreState>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for MessageBlockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBlockStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: RwLock::new(BlockStoreState::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn upsert_one(&self, block: MessageBlock) {
        let block_id = block.id;
        self.state.write().upsert(block);
        let _ = self.events.send(StoreEvent::BlocksUpserted {
            block_ids: vec![block_id],
        });
    }

    pub fn upsert_many(&self, blocks: Vec<MessageBlock>) {
        if blocks.is_empty() {
            return;
        }
        let block_ids = blocks.iter().map(|block| block.id).collect();
        {
            let mut state = self.state.write();
            for block in blocks {
                state.upsert(block);
            }
        }
        let _ = self.events.send(StoreEvent::BlocksUpserted { block_ids });
    }

    /// Applies a partial update and returns the updated block, or `None` if it is unknown.
    pub fn update_one(&self, block_id: BlockId, update: BlockUpdate) -> Option<MessageBlock> {
        let updated = {
            let mut state = self.state.write();
            let block = state.blocks.get_mut(&block_id)?;
            block.apply(update);
            block.clone()
        };
        let _ = self.events.send(StoreEvent::BlockUpdated { block_id });
        Some(updated)
    }

    pub fn remove_one(&self, block_id: BlockId) -> Option<MessageBlock> {
        self.remove_many(&[block_id]).pop()
    }

    pub fn remove_many(&self, block_ids: &[BlockId]) -> Vec<MessageBlock> {
        let removed = {
            let mut state = self.state.write();
            let mut removed = Vec::new();
            for block_id in block_ids {
                if let Some(block) = state.blocks.remove(block_id) {
                    state.unindex(&block);
                    removed.push(block);
                }
            }
            removed
        };
        if !removed.is_empty() {
            let _ = self.events.send(StoreEvent::BlocksRemoved {
                block_ids: removed.iter().map(|block| block.id).collect(),
            });
        }
        removed
    }

    pub fn block(&self, block_id: BlockId) -> Option<MessageBlock> {
        self.state.read().blocks.get(&block_id).cloned()
    }

    pub fn blocks_for_message(&self, message_id: MessageId) -> Vec<MessageBlock> {
        let state = self.state.read();
        state
            .by_message
            .get(&message_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|block_id| state.blocks.get(block_id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn block_ids_for_message(&self, message_id: MessageId) -> Vec<BlockId> {
        self.state
            .read()
            .by_message
            .get(&message_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.state.read().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockKind, BlockStatus};

    #[test]
    fn index_tracks_upserts_moves_and_removals() {
        let store = MessageBlockStore::new();
        let (first, second) = (MessageId::new_v7(), MessageId::new_v7());
        let text = MessageBlock::new(first, BlockKind::main_text("a"), BlockStatus::Success);
        let thinking = MessageBlock::new(
            first,
            BlockKind::Thinking {
                content: "b".to_string(),
                thinking_millsec: None,
            },
            BlockStatus::Success,
        );
        let moved_id = thinking.id;
        store.upsert_many(vec![text.clone(), thinking.clone()]);
        assert_eq!(store.block_ids_for_message(first), vec![text.id, moved_id]);

        let mut moved = thinking;
        moved.message_id = second;
        store.upsert_one(moved);
        assert_eq!(store.block_ids_for_message(first), vec![text.id]);
        assert_eq!(store.block_ids_for_message(second), vec![moved_id]);

        let removed = store.remove_one(text.id).expect("text block removed");
        assert_eq!(removed.id, text.id);
        assert!(store.remove_one(text.id).is_none());
        assert!(store.blocks_for_message(first).is_empty());

        assert_eq!(store.remove_many(&[moved_id, BlockId::new_v7()]).len(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn update_one_merges_given_fields_only() {
        let store = MessageBlockStore::new();
        let block = MessageBlock::new(
            MessageId::new_v7(),
            BlockKind::main_text("partial"),
            BlockStatus::Streaming,
        );
        let block_id = block.id;
        store.upsert_one(block);

        let updated = store
            .update_one(block_id, BlockUpdate::status(BlockStatus::Success))
            .expect("block exists");

        assert_eq!(updated.status, BlockStatus::Success);
        assert_eq!(updated.content(), Some("partial"));
        assert!(store
            .update_one(BlockId::new_v7(), BlockUpdate::default())
            .is_none());
    }
}
