use std::collections::HashSet;

use robochat_storage::{MessageId, TopicId};

/// View-facing session flags held next to the message store.
///
/// `streaming_message_id` is a single process-wide slot: with streams running in several
/// topics it names whichever response started or finished last, and the orchestrator only
/// clears it when it still points at its own message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub streaming_message_id: Option<MessageId>,
    pub loading_topics: HashSet<TopicId>,
    pub fulfilled_topics: HashSet<TopicId>,
}

impl SessionState {
    pub fn is_loading(&self, topic_id: TopicId) -> bool {
        self.loading_topics.contains(&topic_id)
    }

    pub fn is_fulfilled(&self, topic_id: TopicId) -> bool {
        self.fulfilled_topics.contains(&topic_id)
    }
}
