use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::chunk::{Chunk, ResponseSummary, Usage};
use super::model::Model;
use super::provider::{
    LlmProvider, ProviderError, ProviderResult, ProviderStreamHandle, ProviderWorker,
    StreamRequest, make_event_stream,
};

pub const SCRIPTED_PROVIDER_ID: &str = "scripted";
const SCRIPTED_MODEL: &str = "scripted-echo";

/// One instruction replayed by [`ScriptedProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    Emit(Chunk),
    Pause(Duration),
    /// Parks the worker until the request is cancelled.
    HangUntilCancelled,
}

type ScriptFn = dyn Fn(&StreamRequest) -> ProviderResult<Vec<ScriptStep>> + Send + Sync;

/// Offline provider that replays a chunk script per request.
///
/// Used by the CLI `--offline` mode and by pipeline tests; it records every request it
/// receives and the peak number of concurrently running workers.
pub struct ScriptedProvider {
    id: String,
    script: Arc<ScriptFn>,
    requests: Arc<Mutex<Vec<StreamRequest>>>,
    active_workers: Arc<AtomicUsize>,
    peak_workers: Arc<AtomicUsize>,
    fallback_models: Vec<Model>,
}

struct WorkerGuard {
    active_workers: Arc<AtomicUsize>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedProvider {
    pub fn new(
        script: impl Fn(&StreamRequest) -> ProviderResult<Vec<ScriptStep>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: SCRIPTED_PROVIDER_ID.to_string(),
            script: Arc::new(script),
            requests: Arc::new(Mutex::new(Vec::new())),
            active_workers: Arc::new(AtomicUsize::new(0)),
            peak_workers: Arc::new(AtomicUsize::new(0)),
            fallback_models: vec![Model::from_id(SCRIPTED_MODEL)],
        }
    }

    /// Replays the same steps for every request.
    pub fn fixed(steps: Vec<ScriptStep>) -> Self {
        Self::new(move |_| Ok(steps.clone()))
    }

    /// Rejects every request before a stream is opened.
    pub fn failing(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(move |_| {
            Err(ProviderError::Scripted {
                stage: "scripted-open",
                message: message.clone(),
            })
        })
    }

    /// Thinks briefly, then answers with the last user message.
    pub fn echo() -> Self {
        Self::new(|request| {
            let prompt = request.last_user_content().unwrap_or_default().to_string();
            let mut steps = vec![
                ScriptStep::Emit(Chunk::ResponseCreated),
                ScriptStep::Emit(Chunk::thinking_delta("Repeating the prompt.", 5)),
                ScriptStep::Emit(Chunk::thinking_complete("Repeating the prompt.", 5)),
            ];
            for word in prompt.split_inclusive(' ') {
                steps.push(ScriptStep::Pause(Duration::from_millis(20)));
                steps.push(ScriptStep::Emit(Chunk::text_delta(word)));
            }
            let completion_tokens = prompt.split_whitespace().count() as u64;
            steps.push(ScriptStep::Emit(Chunk::text_complete(prompt)));
            steps.push(ScriptStep::Emit(Chunk::BlockComplete {
                response: Some(ResponseSummary {
                    usage: Some(Usage {
                        prompt_tokens: completion_tokens,
                        completion_tokens,
                        total_tokens: completion_tokens * 2,
                    }),
                    metrics: None,
                }),
            }));
            Ok(steps)
        })
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().clone()
    }

    pub fn peak_concurrent_workers(&self) -> usize {
        self.peak_workers.load(Ordering::SeqCst)
    }

    async fn run_script(
        steps: Vec<ScriptStep>,
        event_tx: mpsc::UnboundedSender<Chunk>,
        cancel: CancellationToken,
        _guard: WorkerGuard,
    ) {
        for step in steps {
            match step {
                ScriptStep::Emit(chunk) => {
                    if cancel.is_cancelled() || event_tx.send(chunk).is_err() {
                        return;
                    }
                }
                ScriptStep::Pause(duration) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(duration) => {}
                    }
                }
                ScriptStep::HangUntilCancelled => {
                    cancel.cancelled().await;
                    return;
                }
            }
        }
    }
}

impl LlmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "Scripted"
    }

    fn default_model(&self) -> &str {
        SCRIPTED_MODEL
    }

    fn fallback_models(&self) -> &[Model] {
        &self.fallback_models
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        self.requests.lock().push(request.clone());
        let steps = (self.script)(&request)?;

        let active = self.active_workers.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_workers.fetch_max(active, Ordering::SeqCst);
        let guard = WorkerGuard {
            active_workers: self.active_workers.clone(),
        };

        let (event_tx, stream, worker_cancel) = make_event_stream(request.target, &request.cancel);
        let worker: ProviderWorker =
            Box::pin(Self::run_script(steps, event_tx, worker_cancel, guard));

        Ok(ProviderStreamHandle { stream, worker })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderMessage, Role, StreamTarget};
    use uuid::Uuid;

    fn request(prompt: &str) -> StreamRequest {
        StreamRequest::new(
            StreamTarget::new(Uuid::nil(), Uuid::nil()),
            SCRIPTED_MODEL,
            vec![ProviderMessage::new(Role::User, prompt)],
        )
    }

    #[tokio::test]
    async fn echo_script_streams_prompt_back() {
        let provider = ScriptedProvider::echo();
        let handle = provider.stream_chat(request("hello there")).expect("opens");
        let mut stream = handle.stream;
        tokio::spawn(handle.worker);

        let mut text = String::new();
        let mut completed = None;
        while let Some(chunk) = stream.recv().await {
            match chunk {
                Chunk::TextDelta { text: delta } => text.push_str(&delta),
                Chunk::TextComplete { text: final_text } => completed = Some(final_text),
                _ => {}
            }
        }

        assert_eq!(text, "hello there");
        assert_eq!(completed.as_deref(), Some("hello there"));
        assert_eq!(provider.requests().len(), 1);
    }

    #[tokio::test]
    async fn hanging_script_ends_on_cancel() {
        let provider = ScriptedProvider::fixed(vec![
            ScriptStep::Emit(Chunk::ResponseCreated),
            ScriptStep::HangUntilCancelled,
            ScriptStep::Emit(Chunk::text_delta("never")),
        ]);
        let cancel = CancellationToken::new();
        let handle = provider
            .stream_chat(request("hi").with_cancel(cancel.clone()))
            .expect("opens");
        let mut stream = handle.stream;
        let worker = tokio::spawn(handle.worker);

        assert_eq!(stream.recv().await, Some(Chunk::ResponseCreated));
        cancel.cancel();
        worker.await.expect("worker finishes");
        assert_eq!(stream.recv().await, None);
    }

    #[test]
    fn failing_script_rejects_at_open() {
        let provider = ScriptedProvider::failing("connection refused");
        let error = provider
            .stream_chat(request("hi"))
            .err()
            .expect("open fails");
        assert!(error.to_string().contains("connection refused"));
    }
}
