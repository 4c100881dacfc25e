use robochat_storage::{MessageId, StorageError, TopicId};
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ServiceError {
    #[snafu(display("storage failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("message '{message_id}' was not found in topic '{topic_id}'"))]
    MessageNotFound {
        stage: &'static str,
        topic_id: TopicId,
        message_id: MessageId,
    },
    #[snafu(display("invalid message on `{stage}`: {details}"))]
    InvalidMessage {
        stage: &'static str,
        details: String,
    },
}

pub type ServiceResult<T> = Result<T, ServiceError>;
