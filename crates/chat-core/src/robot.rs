use robochat_llm::ModelRef;
use robochat_storage::{RobotId, TopicId, TopicRecord, TopicSummary};

pub const DEFAULT_CONTEXT_COUNT: usize = 10;

/// Persona that owns topics: a system prompt plus the model that answers by default.
#[derive(Debug, Clone, PartialEq)]
pub struct Robot {
    pub id: RobotId,
    pub name: String,
    pub prompt: String,
    pub model: ModelRef,
    /// Preferred over `model` when set, for example after a per-robot override.
    pub default_model: Option<ModelRef>,
    pub topics: Vec<TopicId>,
    pub selected_topic_id: Option<TopicId>,
    /// How many prior messages are sent as history, the asking message included.
    pub context_count: usize,
}

impl Robot {
    pub fn new(name: impl Into<String>, model: ModelRef) -> Self {
        Self {
            id: RobotId::new_v7(),
            name: name.into(),
            prompt: String::new(),
            model,
            default_model: None,
            topics: Vec::new(),
            selected_topic_id: None,
            context_count: DEFAULT_CONTEXT_COUNT,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn with_context_count(mut self, context_count: usize) -> Self {
        self.context_count = context_count;
        self
    }

    /// Model used when a user message mentions nobody.
    pub fn answering_model(&self) -> &ModelRef {
        self.default_model.as_ref().unwrap_or(&self.model)
    }

    pub fn add_topic(&mut self, topic_id: TopicId) {
        if !self.topics.contains(&topic_id) {
            self.topics.insert(0, topic_id);
        }
    }

    pub fn select_topic(&mut self, topic_id: TopicId) {
        self.add_topic(topic_id);
        self.selected_topic_id = Some(topic_id);
    }

    /// Drops `topic_id`; a removed selection falls back to the most recent remaining topic.
    pub fn remove_topic(&mut self, topic_id: TopicId) {
        self.topics.retain(|existing| *existing != topic_id);
        if self.selected_topic_id == Some(topic_id) {
            self.selected_topic_id = self.topics.first().copied();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub id: TopicId,
    pub robot_id: RobotId,
    pub name: String,
    pub message_count: usize,
    pub created_at_unix_millis: i64,
    pub updated_at_unix_millis: i64,
}

impl From<&TopicRecord> for Topic {
    fn from(record: &TopicRecord) -> Self {
        Self {
            id: record.id,
            robot_id: record.robot_id,
            name: record.name.clone(),
            message_count: record.messages.len(),
            created_at_unix_millis: record.created_at_unix_millis,
            updated_at_unix_millis: record.updated_at_unix_millis,
        }
    }
}

impl From<TopicSummary> for Topic {
    fn from(summary: TopicSummary) -> Self {
        Self {
            id: summary.id,
            robot_id: summary.robot_id,
            name: summary.name,
            message_count: summary.message_count,
            created_at_unix_millis: summary.updated_at_unix_millis,
            updated_at_unix_millis: summary.updated_at_unix_millis,
        }
    }
}
