use std::sync::Arc;
use std::time::Instant;

use robochat_llm::{ErrorInfo, Metrics, ResponseSummary};
use robochat_storage::{BlockId, MessageId, TopicId};

use crate::block::{BlockKind, BlockStatus, BlockType, BlockUpdate, MessageBlock};
use crate::message::{MessageStatus, MessageUpdate};
use crate::persist::Persister;
use crate::store::{MessageBlockStore, MessageStore};
use crate::stream::{CompletionStatus, StreamCallbacks, ThinkingEnd};
use crate::throttle::BlockWriteThrottle;

#[derive(Debug, Clone, Copy)]
struct CurrentBlock {
    id: BlockId,
    block_type: BlockType,
    /// Set once the block reached a terminal status; its type and content are then final.
    finalized: bool,
}

/// Maps the callback sequence of one assistant response onto block and message state.
///
/// Deltas go through the write throttle. Block-type transitions, completions and errors are
/// written synchronously. After the first terminal callback every later one is ignored.
pub(crate) struct AssistantResponseHandler {
    topic_id: TopicId,
    message_id: MessageId,
    messages: Arc<MessageStore>,
    blocks: Arc<MessageBlockStore>,
    throttle: BlockWriteThrottle,
    persister: Persister,
    current: Option<CurrentBlock>,
    main_text: String,
    thinking_text: String,
    thinking_millsec: Option<u64>,
    // Set by a reported thinking end; later thinking chunks are dropped.
    thinking_closed: bool,
    started_at: Instant,
    first_token_at: Option<Instant>,
    finished: bool,
}

impl AssistantResponseHandler {
    pub(crate) fn new(
        topic_id: TopicId,
        message_id: MessageId,
        messages: Arc<MessageStore>,
        blocks: Arc<MessageBlockStore>,
        throttle: BlockWriteThrottle,
        persister: Persister,
    ) -> Self {
        Self {
            topic_id,
            message_id,
            messages,
            blocks,
            throttle,
            persister,
            current: None,
            main_text: String::new(),
            thinking_text: String::new(),
            thinking_millsec: None,
            thinking_closed: false,
            started_at: Instant::now(),
            first_token_at: None,
            finished: false,
        }
    }

    fn message_exists(&self) -> bool {
        self.messages.message(self.message_id).is_some()
    }

    fn mark_first_token(&mut self) {
        self.first_token_at.get_or_insert_with(Instant::now);
    }

    /// Appends a new block to the message and persists block plus topic in one batch.
    ///
    /// A still-open current block is flushed and closed first.
    async fn open_block(&mut self, kind: BlockKind, status: BlockStatus) {
        if !self.message_exists() {
            tracing::debug!(
                message_id = %self.message_id,
                "response target deleted; not opening block"
            );
            return;
        }
        if let Some(current) = self.current
            && !current.finalized
        {
            self.throttle.flush_now(current.id).await;
            self.write_current(BlockUpdate::status(BlockStatus::Success))
                .await;
        }
        let block = MessageBlock::new(self.message_id, kind, status);
        let block_type = block.block_type();
        self.current = Some(CurrentBlock {
            id: block.id,
            block_type,
            finalized: status.is_terminal(),
        });
        self.blocks.upsert_one(block.clone());
        self.messages
            .update_message(self.message_id, MessageUpdate::default().append_block(block.id));
        self.persister
            .save_topic_with_blocks(self.topic_id, &[block], Vec::new())
            .await;
    }

    /// Rewrites the current block in place and persists it synchronously.
    async fn write_current(&mut self, update: BlockUpdate) {
        let Some(current) = self.current.as_mut() else {
            return;
        };
        if let Some(kind) = &update.kind {
            current.block_type = kind.block_type();
        }
        if let Some(status) = update.status {
            current.finalized = status.is_terminal();
        }
        let block_id = current.id;
        if let Some(block) = self.blocks.update_one(block_id, update) {
            self.persister.save_block(&block).await;
        }
    }

    /// Current block if it still accepts content of `block_type`.
    fn open_current(&self, block_type: BlockType) -> Option<CurrentBlock> {
        self.current
            .filter(|current| current.block_type == block_type && !current.finalized)
    }

    fn is_placeholder(&self) -> bool {
        self.current
            .is_some_and(|current| current.block_type == BlockType::Unknown)
    }

    fn thinking_kind(&self) -> BlockKind {
        BlockKind::Thinking {
            content: self.thinking_text.clone(),
            thinking_millsec: self.thinking_millsec,
        }
    }

    fn metrics(&self, response: Option<&ResponseSummary>) -> Metrics {
        let elapsed = |at: Instant| at.duration_since(self.started_at).as_millis() as u64;
        let reported = response.and_then(|summary| summary.metrics);
        Metrics {
            time_first_token_millsec: self
                .first_token_at
                .map(elapsed)
                .or(reported.and_then(|metrics| metrics.time_first_token_millsec)),
            time_completion_millsec: reported
                .and_then(|metrics| metrics.time_completion_millsec)
                .or(Some(elapsed(Instant::now()))),
        }
    }

    async fn finish(&mut self, update: MessageUpdate, upserts: Vec<MessageBlock>) {
        self.messages.update_message(self.message_id, update);
        self.messages.clear_streaming_message_id(self.message_id);
        self.persister
            .save_topic_with_blocks(self.topic_id, &upserts, Vec::new())
            .await;
    }
}

impl StreamCallbacks for AssistantResponseHandler {
    async fn on_response_created(&mut self) {
        if self.finished || self.current.is_some() {
            return;
        }
        if !self.message_exists() {
            tracing::warn!(
                message_id = %self.message_id,
                "response target vanished before stream start"
            );
            self.finished = true;
            return;
        }

        self.messages.update_message(
            self.message_id,
            MessageUpdate::status(MessageStatus::Processing),
        );
        self.messages.set_streaming_message_id(Some(self.message_id));
        self.open_block(BlockKind::Unknown, BlockStatus::Processing)
            .await;
        tracing::debug!(
            topic_id = %self.topic_id,
            message_id = %self.message_id,
            "assistant response started"
        );
    }

    async fn on_thinking_chunk(&mut self, text: String, thinking_millsec: Option<u64>) {
        if self.finished {
            return;
        }
        if self.thinking_closed {
            tracing::trace!(
                message_id = %self.message_id,
                "dropping thinking chunk after thinking completed"
            );
            return;
        }
        self.mark_first_token();
        let continues = self.open_current(BlockType::Thinking).is_some() || self.is_placeholder();
        if !continues {
            // A new thinking section after text starts from scratch.
            self.thinking_text.clear();
            self.thinking_millsec = None;
        }
        self.thinking_text.push_str(&text);
        if thinking_millsec.is_some() {
            self.thinking_millsec = thinking_millsec;
        }

        if let Some(current) = self.open_current(BlockType::Thinking) {
            self.throttle
                .schedule(current.id, BlockUpdate::kind(self.thinking_kind()));
        } else if self.is_placeholder() {
            let update =
                BlockUpdate::kind(self.thinking_kind()).with_status(BlockStatus::Streaming);
            self.write_current(update).await;
        } else {
            self.open_block(self.thinking_kind(), BlockStatus::Streaming)
                .await;
        }
    }

    async fn on_thinking_complete(
        &mut self,
        text: String,
        thinking_millsec: Option<u64>,
        end: ThinkingEnd,
    ) {
        if self.finished || self.thinking_closed {
            return;
        }
        self.thinking_closed = end == ThinkingEnd::Reported;
        self.thinking_text = text;
        if thinking_millsec.is_some() {
            self.thinking_millsec = thinking_millsec;
        }

        let update = BlockUpdate::kind(self.thinking_kind()).with_status(BlockStatus::Success);
        if let Some(current) = self.open_current(BlockType::Thinking) {
            self.throttle.flush_now(current.id).await;
            self.write_current(update).await;
        } else if self.is_placeholder() {
            self.write_current(update).await;
        } else {
            self.open_block(self.thinking_kind(), BlockStatus::Success)
                .await;
        }
    }

    async fn on_text_chunk(&mut self, text: String) {
        if self.finished {
            return;
        }
        self.mark_first_token();

        if let Some(current) = self.open_current(BlockType::MainText) {
            self.main_text.push_str(&text);
            let update = BlockUpdate::kind(BlockKind::main_text(self.main_text.clone()));
            self.throttle.schedule(current.id, update);
        } else if self.is_placeholder() {
            self.main_text.push_str(&text);
            let update = BlockUpdate::kind(BlockKind::main_text(self.main_text.clone()))
                .with_status(BlockStatus::Streaming);
            self.write_current(update).await;
        } else {
            self.main_text = text;
            let kind = BlockKind::main_text(self.main_text.clone());
            self.open_block(kind, BlockStatus::Streaming).await;
        }
    }

    async fn on_text_complete(&mut self, text: String) {
        if self.finished {
            return;
        }
        self.main_text = text;
        let update = BlockUpdate::kind(BlockKind::main_text(self.main_text.clone()))
            .with_status(BlockStatus::Success);

        if let Some(current) = self.open_current(BlockType::MainText) {
            self.throttle.flush_now(current.id).await;
            self.write_current(update).await;
        } else if self.is_placeholder() {
            self.write_current(update).await;
        } else if !self.main_text.is_empty() {
            let kind = BlockKind::main_text(self.main_text.clone());
            self.open_block(kind, BlockStatus::Success).await;
        }
    }

    async fn on_error(&mut self, error: ErrorInfo) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Some(current) = self.current {
            self.throttle.cancel(current.id).await;
        }
        if !self.message_exists() {
            tracing::debug!(
                message_id = %self.message_id,
                "response target deleted; dropping error state"
            );
            self.messages.clear_streaming_message_id(self.message_id);
            return;
        }

        let aborted = error.is_abort();
        let (marker_kind, marker_status) = if aborted {
            (
                BlockKind::Interrupted {
                    content: self.main_text.clone(),
                },
                BlockStatus::Paused,
            )
        } else {
            (
                BlockKind::Error {
                    error: error.clone(),
                },
                BlockStatus::Error,
            )
        };
        let halted_status = if aborted {
            BlockStatus::Paused
        } else {
            BlockStatus::Error
        };

        let mut upserts = Vec::new();
        let mut append = None;
        match self.current {
            // The untouched placeholder becomes the marker itself.
            Some(current) if current.block_type == BlockType::Unknown => {
                let update = BlockUpdate::kind(marker_kind).with_status(marker_status);
                upserts.extend(self.blocks.update_one(current.id, update));
            }
            Some(current) => {
                if !current.finalized {
                    let kind = match current.block_type {
                        BlockType::MainText => Some(BlockKind::main_text(self.main_text.clone())),
                        BlockType::Thinking => Some(self.thinking_kind()),
                        _ => None,
                    };
                    let update = BlockUpdate {
                        status: Some(halted_status),
                        kind,
                    };
                    upserts.extend(self.blocks.update_one(current.id, update));
                }
                let marker = MessageBlock::new(self.message_id, marker_kind, marker_status);
                append = Some(marker.id);
                self.blocks.upsert_one(marker.clone());
                upserts.push(marker);
            }
            None => {
                let marker = MessageBlock::new(self.message_id, marker_kind, marker_status);
                append = Some(marker.id);
                self.blocks.upsert_one(marker.clone());
                upserts.push(marker);
            }
        }

        let mut update = MessageUpdate::status(if aborted {
            MessageStatus::Success
        } else {
            MessageStatus::Error
        })
        .with_metrics(self.metrics(None));
        if let Some(block_id) = append {
            update = update.append_block(block_id);
        }

        if aborted {
            tracing::info!(
                topic_id = %self.topic_id,
                message_id = %self.message_id,
                "assistant response aborted"
            );
        } else {
            tracing::warn!(
                topic_id = %self.topic_id,
                message_id = %self.message_id,
                error_name = %error.name,
                error = %error.message,
                "assistant response failed"
            );
        }
        self.finish(update, upserts).await;
    }

    async fn on_complete(&mut self, status: CompletionStatus, response: Option<ResponseSummary>) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Some(current) = self.current {
            self.throttle.cancel(current.id).await;
        }
        if !self.message_exists() {
            tracing::debug!(
                message_id = %self.message_id,
                "response target deleted; dropping completion"
            );
            self.messages.clear_streaming_message_id(self.message_id);
            return;
        }

        let block_status = match status {
            CompletionStatus::Success => BlockStatus::Success,
            CompletionStatus::Error => BlockStatus::Error,
            CompletionStatus::Paused => BlockStatus::Paused,
        };
        let mut upserts = Vec::new();
        if let Some(current) = self.current
            && !current.finalized
        {
            let kind = match current.block_type {
                BlockType::MainText => Some(BlockKind::main_text(self.main_text.clone())),
                BlockType::Thinking => Some(self.thinking_kind()),
                _ => None,
            };
            let update = BlockUpdate {
                status: Some(block_status),
                kind,
            };
            upserts.extend(self.blocks.update_one(current.id, update));
        }

        let message_status = match status {
            CompletionStatus::Error => MessageStatus::Error,
            CompletionStatus::Success | CompletionStatus::Paused => MessageStatus::Success,
        };
        let update = MessageUpdate::status(message_status)
            .with_metrics(self.metrics(response.as_ref()))
            .with_usage(response.and_then(|summary| summary.usage));

        tracing::debug!(
            topic_id = %self.topic_id,
            message_id = %self.message_id,
            status = ?status,
            "assistant response completed"
        );
        self.finish(update, upserts).await;
    }
}
