use std::future::Future;

use robochat_llm::{Chunk, ErrorInfo, ProviderEventStream, ResponseSummary};
use tokio_util::sync::CancellationToken;

/// How a response ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    Error,
    /// Cancelled by the user.
    Paused,
}

/// Why a thinking section ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingEnd {
    /// The provider sent `ThinkingComplete`. No more thinking follows for this response.
    Reported,
    /// Text or the end of the response arrived while thinking was still open.
    Superseded,
}

/// Receiver of the normalized chunk sequence produced by [`StreamProcessor`].
///
/// The processor guarantees `on_response_created` runs first and that exactly one of
/// `on_error` or `on_complete` ends the sequence.
pub trait StreamCallbacks: Send {
    fn on_response_created(&mut self) -> impl Future<Output = ()> + Send;

    fn on_thinking_chunk(
        &mut self,
        text: String,
        thinking_millsec: Option<u64>,
    ) -> impl Future<Output = ()> + Send;

    fn on_thinking_complete(
        &mut self,
        text: String,
        thinking_millsec: Option<u64>,
        end: ThinkingEnd,
    ) -> impl Future<Output = ()> + Send;

    fn on_text_chunk(&mut self, text: String) -> impl Future<Output = ()> + Send;

    fn on_text_complete(&mut self, text: String) -> impl Future<Output = ()> + Send;

    /// The provider reported the response as finished; `on_complete` follows.
    fn on_block_complete(&mut self) -> impl Future<Output = ()> + Send {
        async {}
    }

    fn on_error(&mut self, error: ErrorInfo) -> impl Future<Output = ()> + Send;

    fn on_complete(
        &mut self,
        status: CompletionStatus,
        response: Option<ResponseSummary>,
    ) -> impl Future<Output = ()> + Send;
}

/// Turns raw provider chunks into a well-formed callback sequence.
///
/// Providers may skip `ResponseCreated`, never close a thinking section before text starts,
/// or end without `TextComplete`; the processor synthesizes the missing events.
#[derive(Debug, Default)]
pub struct StreamProcessor {
    created: bool,
    thinking_open: bool,
    thinking_text: String,
    thinking_millsec: Option<u64>,
    text_open: bool,
    text: String,
}

impl StreamProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drives `stream` to its end, or until `cancel` fires.
    pub async fn process<C: StreamCallbacks>(
        mut self,
        stream: &mut ProviderEventStream,
        cancel: &CancellationToken,
        callbacks: &mut C,
    ) -> CompletionStatus {
        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = stream.recv() => Some(next),
            };
            let Some(next) = received else {
                return self.fail(callbacks, ErrorInfo::abort()).await;
            };

            let Some(chunk) = next else {
                if cancel.is_cancelled() {
                    return self.fail(callbacks, ErrorInfo::abort()).await;
                }
                // Channel closed without a terminal chunk: treat what arrived as the answer.
                tracing::debug!(
                    target = ?stream.target(),
                    "provider stream closed without block_complete"
                );
                return self.complete_in_place(callbacks, None).await;
            };

            if let Some(status) = self.handle(chunk, callbacks).await {
                return status;
            }
        }
    }

    /// Ends a response that failed before or while streaming.
    pub async fn fail<C: StreamCallbacks>(
        mut self,
        callbacks: &mut C,
        error: ErrorInfo,
    ) -> CompletionStatus {
        self.ensure_created(callbacks).await;
        let status = if error.is_abort() {
            CompletionStatus::Paused
        } else {
            CompletionStatus::Error
        };
        callbacks.on_error(error).await;
        status
    }

    async fn handle<C: StreamCallbacks>(
        &mut self,
        chunk: Chunk,
        callbacks: &mut C,
    ) -> Option<CompletionStatus> {
        match chunk {
            Chunk::ResponseCreated | Chunk::ResponseInProgress => {
                self.ensure_created(callbacks).await;
            }
            Chunk::ThinkingDelta {
                text,
                thinking_millsec,
            } => {
                self.ensure_created(callbacks).await;
                self.close_text(callbacks).await;
                self.thinking_open = true;
                self.thinking_text.push_str(&text);
                if thinking_millsec.is_some() {
                    self.thinking_millsec = thinking_millsec;
                }
                callbacks.on_thinking_chunk(text, thinking_millsec).await;
            }
            Chunk::ThinkingComplete {
                text,
                thinking_millsec,
            } => {
                self.ensure_created(callbacks).await;
                self.thinking_open = false;
                self.thinking_text.clear();
                let thinking_millsec = thinking_millsec.or(self.thinking_millsec.take());
                callbacks
                    .on_thinking_complete(text, thinking_millsec, ThinkingEnd::Reported)
                    .await;
            }
            Chunk::TextDelta { text } => {
                self.ensure_created(callbacks).await;
                self.close_thinking(callbacks).await;
                self.text_open = true;
                self.text.push_str(&text);
                callbacks.on_text_chunk(text).await;
            }
            Chunk::TextComplete { text } => {
                self.ensure_created(callbacks).await;
                self.close_thinking(callbacks).await;
                self.text_open = false;
                self.text.clear();
                callbacks.on_text_complete(text).await;
            }
            Chunk::BlockComplete { response } => {
                self.ensure_created(callbacks).await;
                self.close_thinking(callbacks).await;
                self.close_text(callbacks).await;
                callbacks.on_block_complete().await;
                return Some(self.complete_in_place(callbacks, response).await);
            }
            Chunk::Error { error } => {
                self.ensure_created(callbacks).await;
                let status = if error.is_abort() {
                    CompletionStatus::Paused
                } else {
                    CompletionStatus::Error
                };
                callbacks.on_error(error).await;
                return Some(status);
            }
        }
        None
    }

    async fn complete_in_place<C: StreamCallbacks>(
        &mut self,
        callbacks: &mut C,
        response: Option<ResponseSummary>,
    ) -> CompletionStatus {
        self.ensure_created(callbacks).await;
        self.close_thinking(callbacks).await;
        self.close_text(callbacks).await;
        callbacks
            .on_complete(CompletionStatus::Success, response)
            .await;
        CompletionStatus::Success
    }

    async fn ensure_created<C: StreamCallbacks>(&mut self, callbacks: &mut C) {
        if !self.created {
            self.created = true;
            callbacks.on_response_created().await;
        }
    }

    async fn close_text<C: StreamCallbacks>(&mut self, callbacks: &mut C) {
        if self.text_open {
            self.text_open = false;
            let text = std::mem::take(&mut self.text);
            callbacks.on_text_complete(text).await;
        }
    }

    async fn close_thinking<C: StreamCallbacks>(&mut self, callbacks: &mut C) {
        if self.thinking_open {
            self.thinking_open = false;
            let text = std::mem::take(&mut self.thinking_text);
            let thinking_millsec = self.thinking_millsec.take();
            callbacks
                .on_thinking_complete(text, thinking_millsec, ThinkingEnd::Superseded)
                .await;
        }
    }
}
