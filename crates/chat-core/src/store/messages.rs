use std::collections::HashMap;

use parking_lot::RwLock;
use robochat_storage::{MessageId, TopicId};
use tokio::sync::broadcast;

use super::{EVENT_CAPACITY, StoreEvent};
use crate::message::{Message, MessageUpdate};
use crate::session::SessionState;

#[derive(Default)]
struct MessageStoreState {
    messages: HashMap<MessageId, Message>,
    topic_order: HashMap<TopicId, Vec<MessageId>>,
    session: SessionState,
}

/// Normalized in-memory messages plus per-topic ordering and session flags.
pub struct MessageStore {
    state: RwLock<MessageStoreState>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: RwLock::new(MessageStoreState::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: StoreEvent) {
        // No subscribers is the normal headless case.
        let _ = self.events.send(event);
    }

    pub fn add_message(&self, topic_id: TopicId, message: Message) {
        self.insert_message_at(topic_id, message, None);
    }

    /// Inserts at `index` within the topic ordering, clamped to its length.
    pub fn insert_message_at_index(&self, topic_id: TopicId, message: Message, index: usize) {
        self.insert_message_at(topic_id, message, Some(index));
    }

    fn insert_message_at(&self, topic_id: TopicId, mut message: Message, index: Option<usize>) {
        let message_id = message.id;
        message.topic_id = topic_id;
        {
            let mut state = self.state.write();
            let order = state.topic_order.entry(topic_id).or_default();
            if !order.contains(&message_id) {
                match index {
                    Some(index) => order.insert(index.min(order.len()), message_id),
                    None => order.push(message_id),
                }
            }
            state.messages.insert(message_id, message);
        }
        self.publish(StoreEvent::MessageAdded {
            topic_id,
            message_id,
        });
    }

    /// Applies a partial update. Returns `false` when the message is unknown.
    pub fn update_message(&self, message_id: MessageId, update: MessageUpdate) -> bool {
        let topic_id = {
            let mut state = self.state.write();
            let Some(message) = state.messages.get_mut(&message_id) else {
                return false;
            };
            message.apply(update);
            message.topic_id
        };
        self.publish(StoreEvent::MessageUpdated {
            topic_id,
            message_id,
        });
        true
    }

    pub fn remove_message(&self, topic_id: TopicId, message_id: MessageId) -> Option<Message> {
        let removed = {
            let mut state = self.state.write();
            if let Some(order) = state.topic_order.get_mut(&topic_id) {
                order.retain(|existing| *existing != message_id);
            }
            state.messages.remove(&message_id)
        };
        if removed.is_some() {
            self.publish(StoreEvent::MessagesRemoved {
                topic_id,
                message_ids: vec![message_id],
            });
        }
        removed
    }

    /// Removes every message in the topic that answers `ask_id`.
    pub fn remove_messages_by_ask_id(&self, topic_id: TopicId, ask_id: MessageId) -> Vec<Message> {
        let removed = {
            let mut state = self.state.write();
            let MessageStoreState {
                messages,
                topic_order,
                ..
            } = &mut *state;
            let Some(order) = topic_order.get_mut(&topic_id) else {
                return Vec::new();
            };
            let mut removed = Vec::new();
            order.retain(|message_id| {
                let answers = messages
                    .get(message_id)
                    .is_some_and(|message| message.ask_id == Some(ask_id));
                if answers && let Some(message) = messages.remove(message_id) {
                    removed.push(message);
                }
                !answers
            });
            removed
        };
        if !removed.is_empty() {
            self.publish(StoreEvent::MessagesRemoved {
                topic_id,
                message_ids: removed.iter().map(|message| message.id).collect(),
            });
        }
        removed
    }

    pub fn clear_topic_messages(&self, topic_id: TopicId) -> Vec<Message> {
        let removed = {
            let mut state = self.state.write();
            let order = state.topic_order.remove(&topic_id).unwrap_or_default();
            order
                .into_iter()
                .filter_map(|message_id| state.messages.remove(&message_id))
                .collect::<Vec<_>>()
        };
        self.publish(StoreEvent::MessagesRemoved {
            topic_id,
            message_ids: removed.iter().map(|message| message.id).collect(),
        });
        removed
    }

    /// Replaces the topic's contents with freshly loaded messages, in the given order.
    pub fn replace_topic_messages(&self, topic_id: TopicId, loaded: Vec<Message>) {
        {
            let mut state = self.state.write();
            if let Some(previous) = state.topic_order.remove(&topic_id) {
                for message_id in previous {
                    state.messages.remove(&message_id);
                }
            }
            let order = loaded.iter().map(|message| message.id).collect();
            for message in loaded {
                state.messages.insert(message.id, message);
            }
            state.topic_order.insert(topic_id, order);
        }
        self.publish(StoreEvent::TopicLoaded { topic_id });
    }

    pub fn message(&self, message_id: MessageId) -> Option<Message> {
        self.state.read().messages.get(&message_id).cloned()
    }

    pub fn messages_for_topic(&self, topic_id: TopicId) -> Vec<Message> {
        let state = self.state.read();
        state
            .topic_order
            .get(&topic_id)
            .map(|order| {
                order
                    .iter()
                    .filter_map(|message_id| state.messages.get(message_id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_topic_loading(&self, topic_id: TopicId, loading: bool) {
        let changed = {
            let mut state = self.state.write();
            if loading {
                state.session.loading_topics.insert(topic_id)
            } else {
                state.session.loading_topics.remove(&topic_id)
            }
        };
        if changed {
            self.publish(StoreEvent::TopicLoading { topic_id, loading });
        }
    }

    pub fn mark_topic_fulfilled(&self, topic_id: TopicId, fulfilled: bool) {
        let mut state = self.state.write();
        if fulfilled {
            state.session.fulfilled_topics.insert(topic_id);
        } else {
            state.session.fulfilled_topics.remove(&topic_id);
        }
    }

    pub fn set_streaming_message_id(&self, message_id: Option<MessageId>) {
        let changed = {
            let mut state = self.state.write();
            let changed = state.session.streaming_message_id != message_id;
            state.session.streaming_message_id = message_id;
            changed
        };
        if changed {
            self.publish(StoreEvent::StreamingMessageChanged { message_id });
        }
    }

    /// Clears the streaming slot only if it still names `message_id`.
    pub fn clear_streaming_message_id(&self, message_id: MessageId) {
        let cleared = {
            let mut state = self.state.write();
            if state.session.streaming_message_id == Some(message_id) {
                state.session.streaming_message_id = None;
                true
            } else {
                false
            }
        };
        if cleared {
            self.publish(StoreEvent::StreamingMessageChanged { message_id: None });
        }
    }

    pub fn session(&self) -> SessionState {
        self.state.read().session.clone()
    }

    pub fn streaming_message_id(&self) -> Option<MessageId> {
        self.state.read().session.streaming_message_id
    }

    pub fn is_topic_loading(&self, topic_id: TopicId) -> bool {
        self.state.read().session.is_loading(topic_id)
    }

    pub fn is_topic_fulfilled(&self, topic_id: TopicId) -> bool {
        self.state.read().session.is_fulfilled(topic_id)
    }
}
