mod response;
#[cfg(test)]
mod tests;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use robochat_llm::{ErrorInfo, LlmProvider, StreamRequest, StreamTarget};
use robochat_storage::{BlockId, ChatStorage, MessageId, NewTopic, RobotId, TopicId};
use snafu::{OptionExt, ResultExt, ensure};
use tokio_util::sync::CancellationToken;

use crate::abort::AbortRegistry;
use crate::block::{BlockKind, BlockStatus, BlockUpdate, MessageBlock};
use crate::context::build_history;
use crate::error::{InvalidMessageSnafu, MessageNotFoundSnafu, ServiceResult, StorageSnafu};
use crate::message::{Message, MessageStatus, MessageUpdate, Role};
use crate::persist::Persister;
use crate::queue::TopicQueues;
use crate::robot::{Robot, Topic};
use crate::serializer::{block_from_record, message_from_record};
use crate::store::{MessageBlockStore, MessageStore};
use crate::stream::StreamProcessor;
use crate::throttle::{BlockWriteThrottle, DEFAULT_THROTTLE_INTERVAL};

use self::response::AssistantResponseHandler;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceOptions {
    pub throttle_interval: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            throttle_interval: DEFAULT_THROTTLE_INTERVAL,
        }
    }
}

/// Providers by id. Assistant messages are routed by their model's `provider_id`.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn register(&mut self, provider: Arc<dyn LlmProvider>) {
        self.providers.insert(provider.id().to_string(), provider);
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.get(provider_id).cloned()
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids = self.providers.keys().map(String::as_str).collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }
}

struct ServiceInner {
    messages: Arc<MessageStore>,
    blocks: Arc<MessageBlockStore>,
    persister: Persister,
    throttle: BlockWriteThrottle,
    queues: TopicQueues,
    aborts: AbortRegistry,
    providers: ProviderRegistry,
}

/// Entry point for sending, regenerating, cancelling and loading topic messages.
///
/// Responses for one topic run one at a time on that topic's queue; different topics stream
/// concurrently. Store updates happen first and persistence follows; a failed write is
/// logged and leaves the in-memory state in place.
#[derive(Clone)]
pub struct MessageService {
    inner: Arc<ServiceInner>,
}

impl MessageService {
    pub fn new(
        storage: Arc<dyn ChatStorage>,
        providers: ProviderRegistry,
        options: ServiceOptions,
    ) -> Self {
        let messages = Arc::new(MessageStore::new());
        let blocks = Arc::new(MessageBlockStore::new());
        let persister = Persister::new(storage, messages.clone());
        let throttle =
            BlockWriteThrottle::new(options.throttle_interval, blocks.clone(), persister.clone());
        Self {
            inner: Arc::new(ServiceInner {
                messages,
                blocks,
                persister,
                throttle,
                queues: TopicQueues::new(),
                aborts: AbortRegistry::new(),
                providers,
            }),
        }
    }

    pub fn messages(&self) -> &Arc<MessageStore> {
        &self.inner.messages
    }

    pub fn blocks(&self) -> &Arc<MessageBlockStore> {
        &self.inner.blocks
    }

    pub fn aborts(&self) -> &AbortRegistry {
        &self.inner.aborts
    }

    pub fn throttle(&self) -> &BlockWriteThrottle {
        &self.inner.throttle
    }

    fn storage(&self) -> &Arc<dyn ChatStorage> {
        self.inner.persister.storage()
    }

    pub async fn create_topic(&self, robot: &mut Robot, name: &str) -> ServiceResult<Topic> {
        let record = self
            .storage()
            .create_topic(NewTopic {
                robot_id: robot.id,
                name: name.to_string(),
            })
            .await
            .context(StorageSnafu {
                stage: "create-topic",
            })?;
        robot.select_topic(record.id);
        self.inner.messages.replace_topic_messages(record.id, Vec::new());
        self.inner.messages.mark_topic_fulfilled(record.id, true);
        tracing::info!(topic_id = %record.id, robot_id = %robot.id, "topic created");
        Ok(Topic::from(&record))
    }

    pub async fn list_topics(&self, robot_id: RobotId) -> ServiceResult<Vec<Topic>> {
        let summaries = self
            .storage()
            .list_topics(robot_id)
            .await
            .context(StorageSnafu {
                stage: "list-topics",
            })?;
        Ok(summaries.into_iter().map(Topic::from).collect())
    }

    pub async fn rename_topic(&self, topic_id: TopicId, name: &str) -> ServiceResult<()> {
        self.storage()
            .rename_topic(topic_id, name.to_string())
            .await
            .context(StorageSnafu {
                stage: "rename-topic",
            })
    }

    /// Cancels the topic's streams, drops it from memory, waits for its queue to drain and
    /// then deletes it from storage.
    pub async fn delete_topic(&self, robot: &mut Robot, topic_id: TopicId) -> ServiceResult<()> {
        self.cancel_current_stream(topic_id);
        self.forget_topic(topic_id).await;
        self.inner.queues.wait_for_queue(topic_id).await;
        self.storage()
            .delete_topic(topic_id)
            .await
            .context(StorageSnafu {
                stage: "delete-topic",
            })?;
        self.inner.queues.remove_idle(topic_id);
        robot.remove_topic(topic_id);
        tracing::info!(topic_id = %topic_id, "topic deleted");
        Ok(())
    }

    /// Adds a user message and queues one assistant response per mentioned model, or one
    /// from the robot's model when nothing is mentioned. Returns the assistant message ids.
    pub async fn send_message(
        &self,
        topic_id: TopicId,
        mut user_message: Message,
        user_blocks: Vec<MessageBlock>,
        robot: &Robot,
    ) -> ServiceResult<Vec<MessageId>> {
        ensure!(
            user_message.role == Role::User,
            InvalidMessageSnafu {
                stage: "send-message-role",
                details: format!("message {} is not a user message", user_message.id),
            }
        );
        ensure!(
            user_blocks
                .iter()
                .all(|block| block.message_id == user_message.id),
            InvalidMessageSnafu {
                stage: "send-message-blocks",
                details: format!("a block does not belong to message {}", user_message.id),
            }
        );

        user_message.topic_id = topic_id;
        for block in &user_blocks {
            if !user_message.blocks.contains(&block.id) {
                user_message.blocks.push(block.id);
            }
        }
        let ask_id = user_message.id;
        let models = if user_message.mentions.is_empty() {
            vec![robot.answering_model().clone()]
        } else {
            user_message.mentions.clone()
        };
        let stubs = models
            .into_iter()
            .map(|model| Message::assistant_stub(topic_id, ask_id, model))
            .collect::<Vec<_>>();
        let assistant_ids = stubs.iter().map(|stub| stub.id).collect::<Vec<_>>();

        self.inner.messages.add_message(topic_id, user_message);
        self.inner.blocks.upsert_many(user_blocks.clone());
        for stub in stubs {
            self.inner.messages.add_message(topic_id, stub);
        }
        self.inner
            .persister
            .save_topic_with_blocks(topic_id, &user_blocks, Vec::new())
            .await;

        let queue = self.inner.queues.get_queue(topic_id);
        for assistant_id in &assistant_ids {
            queue.add(Self::fetch_and_process_assistant_response(
                self.inner.clone(),
                topic_id,
                robot.clone(),
                *assistant_id,
            ));
        }
        tracing::info!(
            topic_id = %topic_id,
            ask_id = %ask_id,
            responses = assistant_ids.len(),
            "user message queued"
        );
        Ok(assistant_ids)
    }

    /// Clears a finished assistant response and queues it again with the same model.
    pub async fn regenerate_assistant_response(
        &self,
        topic_id: TopicId,
        assistant_id: MessageId,
        robot: &Robot,
    ) -> ServiceResult<()> {
        let message = self.topic_message(topic_id, assistant_id, "regenerate-lookup")?;
        ensure!(
            message.is_assistant() && message.ask_id.is_some(),
            InvalidMessageSnafu {
                stage: "regenerate-role",
                details: format!("message {assistant_id} is not an assistant response"),
            }
        );
        ensure!(
            !message.status.is_in_flight(),
            InvalidMessageSnafu {
                stage: "regenerate-in-flight",
                details: format!("message {assistant_id} is still being generated"),
            }
        );

        let block_ids = self.owned_block_ids(&message);
        self.inner.throttle.cancel_all_for(&block_ids).await;
        self.inner.blocks.remove_many(&block_ids);
        self.inner.messages.update_message(
            assistant_id,
            MessageUpdate::status(MessageStatus::Pending)
                .with_blocks(Vec::new())
                .clear_outcome(),
        );
        self.inner
            .persister
            .save_topic_with_blocks(topic_id, &[], block_ids)
            .await;

        self.inner.queues.get_queue(topic_id).add(
            Self::fetch_and_process_assistant_response(
                self.inner.clone(),
                topic_id,
                robot.clone(),
                assistant_id,
            ),
        );
        tracing::info!(
            topic_id = %topic_id,
            message_id = %assistant_id,
            "response regeneration queued"
        );
        Ok(())
    }

    /// Aborts every in-flight response in the topic. Returns how many abort callbacks ran.
    pub fn cancel_current_stream(&self, topic_id: TopicId) -> usize {
        let ask_ids = self
            .inner
            .messages
            .messages_for_topic(topic_id)
            .into_iter()
            .filter(|message| message.is_assistant() && message.status.is_in_flight())
            .filter_map(|message| message.ask_id)
            .collect::<HashSet<_>>();
        let triggered: usize = ask_ids
            .into_iter()
            .map(|ask_id| self.inner.aborts.trigger(ask_id))
            .sum();
        tracing::debug!(topic_id = %topic_id, triggered, "cancel requested");
        triggered
    }

    /// Loads the topic from storage unless it is already loaded or `force_reload` is set.
    /// A topic with a response in flight is left alone.
    pub async fn load_topic_messages(
        &self,
        topic_id: TopicId,
        force_reload: bool,
    ) -> ServiceResult<()> {
        if !force_reload && self.inner.messages.is_topic_fulfilled(topic_id) {
            return Ok(());
        }
        if !self.inner.queues.is_idle(topic_id) {
            tracing::debug!(topic_id = %topic_id, "skipping reload while responses are queued");
            return Ok(());
        }

        self.inner.messages.set_topic_loading(topic_id, true);
        let result = self.load_topic_from_storage(topic_id).await;
        self.inner.messages.set_topic_loading(topic_id, false);
        result
    }

    async fn load_topic_from_storage(&self, topic_id: TopicId) -> ServiceResult<()> {
        let record = self
            .storage()
            .load_topic(topic_id)
            .await
            .context(StorageSnafu {
                stage: "load-topic",
            })?;
        let mut messages = record
            .map(|record| record.messages)
            .unwrap_or_default()
            .into_iter()
            .map(message_from_record)
            .collect::<Vec<_>>();
        let message_ids = messages.iter().map(|message| message.id).collect();
        let mut blocks = self
            .storage()
            .load_blocks(message_ids)
            .await
            .context(StorageSnafu {
                stage: "load-topic-blocks",
            })?
            .into_iter()
            .map(block_from_record)
            .collect::<Vec<_>>();

        let stale_blocks = self
            .inner
            .messages
            .messages_for_topic(topic_id)
            .iter()
            .flat_map(|message| self.owned_block_ids(message))
            .collect::<Vec<_>>();
        self.inner.blocks.remove_many(&stale_blocks);

        // The queue is idle here, so nothing is still streaming into these rows.
        let settled = settle_unfinished_responses(&mut messages, &mut blocks);

        tracing::debug!(
            topic_id = %topic_id,
            messages = messages.len(),
            blocks = blocks.len(),
            "topic loaded"
        );
        self.inner.blocks.upsert_many(blocks);
        self.inner.messages.replace_topic_messages(topic_id, messages);
        self.inner.messages.mark_topic_fulfilled(topic_id, true);
        if !settled.is_empty() {
            tracing::info!(
                topic_id = %topic_id,
                blocks = settled.len(),
                "settled responses left unfinished by an earlier session"
            );
            self.inner
                .persister
                .save_topic_with_blocks(topic_id, &settled, Vec::new())
                .await;
        }
        Ok(())
    }

    /// Aborts in-flight responses and removes every message and block of the topic.
    pub async fn clear_topic_messages(&self, topic_id: TopicId) {
        self.cancel_current_stream(topic_id);
        let block_ids = self.forget_topic(topic_id).await;
        self.inner
            .persister
            .save_topic_with_blocks(topic_id, &[], block_ids)
            .await;
        tracing::info!(topic_id = %topic_id, "topic messages cleared");
    }

    pub async fn delete_single_message(
        &self,
        topic_id: TopicId,
        message_id: MessageId,
    ) -> ServiceResult<()> {
        let message = self.topic_message(topic_id, message_id, "delete-message-lookup")?;
        if message.is_assistant()
            && message.status.is_in_flight()
            && let Some(ask_id) = message.ask_id
        {
            self.inner.aborts.trigger(ask_id);
        }

        let block_ids = self.owned_block_ids(&message);
        self.inner.throttle.cancel_all_for(&block_ids).await;
        self.inner.blocks.remove_many(&block_ids);
        self.inner.messages.remove_message(topic_id, message_id);
        self.inner
            .persister
            .save_topic_with_blocks(topic_id, &[], block_ids)
            .await;
        Ok(())
    }

    /// Resolves once every response queued for the topic so far has finished.
    pub async fn wait_for_topic(&self, topic_id: TopicId) {
        self.inner.queues.wait_for_queue(topic_id).await;
    }

    fn topic_message(
        &self,
        topic_id: TopicId,
        message_id: MessageId,
        stage: &'static str,
    ) -> ServiceResult<Message> {
        self.inner
            .messages
            .message(message_id)
            .filter(|message| message.topic_id == topic_id)
            .context(MessageNotFoundSnafu {
                stage,
                topic_id,
                message_id,
            })
    }

    fn owned_block_ids(&self, message: &Message) -> Vec<BlockId> {
        let mut block_ids = message.blocks.clone();
        for block_id in self.inner.blocks.block_ids_for_message(message.id) {
            if !block_ids.contains(&block_id) {
                block_ids.push(block_id);
            }
        }
        block_ids
    }

    /// Drops the topic's messages and blocks from memory. Returns the removed block ids.
    async fn forget_topic(&self, topic_id: TopicId) -> Vec<BlockId> {
        let removed = self.inner.messages.clear_topic_messages(topic_id);
        let block_ids = removed
            .iter()
            .flat_map(|message| self.owned_block_ids(message))
            .collect::<Vec<_>>();
        self.inner.throttle.cancel_all_for(&block_ids).await;
        self.inner.blocks.remove_many(&block_ids);
        block_ids
    }

    async fn fetch_and_process_assistant_response(
        inner: Arc<ServiceInner>,
        topic_id: TopicId,
        robot: Robot,
        assistant_id: MessageId,
    ) {
        let Some(assistant) = inner.messages.message(assistant_id) else {
            tracing::debug!(
                message_id = %assistant_id,
                "queued response was removed before it ran"
            );
            return;
        };
        let Some(ask_id) = assistant.ask_id else {
            tracing::warn!(message_id = %assistant_id, "assistant message has no ask id");
            return;
        };
        let model = assistant
            .model
            .clone()
            .unwrap_or_else(|| robot.answering_model().clone());

        inner.messages.set_topic_loading(topic_id, true);
        let cancel = CancellationToken::new();
        let registration = {
            let cancel = cancel.clone();
            inner.aborts.register(ask_id, move || cancel.cancel())
        };
        let mut handler = AssistantResponseHandler::new(
            topic_id,
            assistant_id,
            inner.messages.clone(),
            inner.blocks.clone(),
            inner.throttle.clone(),
            inner.persister.clone(),
        );

        let history = build_history(
            &inner.messages.messages_for_topic(topic_id),
            &inner.blocks,
            ask_id,
            robot.context_count,
        );
        let status = match inner.providers.get(&model.provider_id) {
            None => {
                let error = ErrorInfo::new(
                    "ProviderNotFound",
                    format!("no provider registered as '{}'", model.provider_id),
                );
                StreamProcessor::new().fail(&mut handler, error).await
            }
            Some(provider) => {
                let mut request = StreamRequest::new(
                    StreamTarget::new(topic_id.as_uuid(), assistant_id.as_uuid()),
                    model.model_id.clone(),
                    history,
                )
                .with_cancel(cancel.clone());
                if !robot.prompt.trim().is_empty() {
                    request = request.with_preamble(robot.prompt.clone());
                }

                match provider.stream_chat(request) {
                    Ok(handle) => {
                        let mut stream = handle.stream;
                        let worker = tokio::spawn(handle.worker);
                        let status = StreamProcessor::new()
                            .process(&mut stream, &cancel, &mut handler)
                            .await;
                        drop(stream);
                        if let Err(error) = worker.await {
                            tracing::warn!(
                                error = %error,
                                "provider worker did not finish cleanly"
                            );
                        }
                        status
                    }
                    Err(error) => {
                        tracing::warn!(
                            topic_id = %topic_id,
                            model = %model,
                            error = %error,
                            "provider refused to open a stream"
                        );
                        StreamProcessor::new()
                            .fail(&mut handler, ErrorInfo::from(&error))
                            .await
                    }
                }
            }
        };

        inner.aborts.unregister(ask_id, Some(registration));
        inner.messages.set_topic_loading(topic_id, false);
        tracing::debug!(
            topic_id = %topic_id,
            message_id = %assistant_id,
            model = %model,
            status = ?status,
            "assistant response finished"
        );
    }
}

/// A user message carrying `text` as its single main-text block.
/// Ends assistant messages that were still pending or streaming when they were stored.
///
/// They are treated like an aborted response: open blocks pause, an interrupted marker
/// carries the partial text and the message becomes `Success`. Returns every block that
/// changed or was added.
fn settle_unfinished_responses(
    messages: &mut [Message],
    blocks: &mut Vec<MessageBlock>,
) -> Vec<MessageBlock> {
    let mut settled = Vec::new();
    for message in messages
        .iter_mut()
        .filter(|message| message.is_assistant() && message.status.is_in_flight())
    {
        let partial = message
            .blocks
            .iter()
            .rev()
            .filter_map(|block_id| blocks.iter().find(|block| block.id == *block_id))
            .find_map(|block| match &block.kind {
                BlockKind::MainText { content } => Some(content.clone()),
                _ => None,
            })
            .unwrap_or_default();
        let marker_kind = BlockKind::Interrupted { content: partial };

        let mut placeholder = None;
        for block in blocks
            .iter_mut()
            .filter(|block| block.message_id == message.id && !block.status.is_terminal())
        {
            if block.kind == BlockKind::Unknown && placeholder.is_none() {
                block.apply(BlockUpdate::kind(marker_kind.clone()).with_status(BlockStatus::Paused));
                placeholder = Some(block.id);
            } else {
                block.apply(BlockUpdate::status(BlockStatus::Paused));
            }
            settled.push(block.clone());
        }

        let mut update = MessageUpdate::status(MessageStatus::Success);
        if placeholder.is_none() {
            let marker = MessageBlock::new(message.id, marker_kind, BlockStatus::Paused);
            update = update.append_block(marker.id);
            settled.push(marker.clone());
            blocks.push(marker);
        }
        message.apply(update);
    }
    settled
}

pub fn user_text_message(topic_id: TopicId, text: &str) -> (Message, Vec<MessageBlock>) {
    let message = Message::user(topic_id);
    let block = MessageBlock::new(message.id, BlockKind::main_text(text), BlockStatus::Success);
    let message = message.with_blocks(vec![block.id]);
    (message, vec![block])
}
