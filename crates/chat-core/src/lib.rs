#![deny(unsafe_code)]

//! Streaming message pipeline: stores, per-topic queues, cancellation and the
//! orchestrator that turns provider streams into persisted message blocks.

pub mod abort;
pub mod block;
pub mod context;
pub mod error;
pub mod message;
mod persist;
pub mod queue;
pub mod robot;
pub mod serializer;
pub mod service;
pub mod session;
pub mod settings;
pub mod store;
pub mod stream;
#[cfg(test)]
mod test_support;
pub mod throttle;

pub use abort::{AbortRegistry, Registration};
pub use block::{BlockKind, BlockStatus, BlockType, BlockUpdate, MessageBlock};
pub use error::{ServiceError, ServiceResult};
pub use message::{BlockRefInsert, Message, MessageStatus, MessageUpdate, Role};
pub use queue::{TopicQueue, TopicQueues};
pub use robot::{Robot, Topic};
pub use service::{MessageService, ProviderRegistry, ServiceOptions, user_text_message};
pub use session::SessionState;
pub use settings::{AppSettings, ProviderSettings, RobotSettings, SettingsError, SettingsStore};
pub use store::{MessageBlockStore, MessageStore, StoreEvent};
pub use stream::{CompletionStatus, StreamCallbacks, StreamProcessor, ThinkingEnd};
pub use throttle::BlockWriteThrottle;

pub use robochat_llm::{ErrorInfo, Metrics, ModelRef, ResponseSummary, Usage};
pub use robochat_storage::{BlockId, MessageId, RobotId, TopicId};
