use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use robochat_storage::TopicId;
use tokio::sync::{mpsc, watch};

type QueueTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Serial task queue for one topic: tasks run one at a time in submission order.
#[derive(Clone)]
pub struct TopicQueue {
    topic_id: TopicId,
    tasks: mpsc::UnboundedSender<QueueTask>,
    // Counts queued and running tasks.
    pending: Arc<watch::Sender<usize>>,
}

impl TopicQueue {
    fn spawn(topic_id: TopicId) -> Self {
        let (tasks, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(watch::Sender::new(0usize));
        tokio::spawn(Self::run(topic_id, receiver, pending.clone()));
        Self {
            topic_id,
            tasks,
            pending,
        }
    }

    async fn run(
        topic_id: TopicId,
        mut receiver: mpsc::UnboundedReceiver<QueueTask>,
        pending: Arc<watch::Sender<usize>>,
    ) {
        while let Some(task) = receiver.recv().await {
            if AssertUnwindSafe(task).catch_unwind().await.is_err() {
                tracing::error!(topic_id = %topic_id, "topic queue task panicked");
            }
            pending.send_modify(|count| *count = count.saturating_sub(1));
        }
        tracing::debug!(topic_id = %topic_id, "topic queue worker stopped");
    }

    pub fn topic_id(&self) -> TopicId {
        self.topic_id
    }

    pub fn add(&self, task: impl Future<Output = ()> + Send + 'static) {
        self.pending.send_modify(|count| *count += 1);
        if self.tasks.send(Box::pin(task)).is_err() {
            self.pending
                .send_modify(|count| *count = count.saturating_sub(1));
            tracing::warn!(topic_id = %self.topic_id, "topic queue is closed; task dropped");
        }
    }

    pub fn pending_count(&self) -> usize {
        *self.pending.borrow()
    }

    pub fn is_idle(&self) -> bool {
        self.pending_count() == 0
    }

    /// Resolves once every task submitted so far has finished.
    pub async fn wait_for_idle(&self) {
        let mut receiver = self.pending.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = receiver.wait_for(|count| *count == 0).await;
    }
}

/// Lazily created [`TopicQueue`] per topic. Different topics run concurrently.
#[derive(Default)]
pub struct TopicQueues {
    queues: Mutex<HashMap<TopicId, TopicQueue>>,
}

impl TopicQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Must be called from within a tokio runtime; the first call spawns the topic worker.
    pub fn get_queue(&self, topic_id: TopicId) -> TopicQueue {
        self.queues
            .lock()
            .entry(topic_id)
            .or_insert_with(|| TopicQueue::spawn(topic_id))
            .clone()
    }

    pub async fn wait_for_queue(&self, topic_id: TopicId) {
        let queue = self.queues.lock().get(&topic_id).cloned();
        if let Some(queue) = queue {
            queue.wait_for_idle().await;
        }
    }

    pub fn is_idle(&self, topic_id: TopicId) -> bool {
        self.queues
            .lock()
            .get(&topic_id)
            .is_none_or(TopicQueue::is_idle)
    }

    /// Forgets an idle topic queue; its worker exits once the last handle is dropped.
    pub fn remove_idle(&self, topic_id: TopicId) -> bool {
        let mut queues = self.queues.lock();
        match queues.get(&topic_id) {
            Some(queue) if queue.is_idle() => {
                queues.remove(&topic_id);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn tasks_for_one_topic_run_in_order_without_overlap() {
        let queues = TopicQueues::new();
        let topic_id = TopicId::new_v7();
        let log = Arc::new(Mutex::new(Vec::new()));

        for index in 0..3u64 {
            let log = log.clone();
            queues.get_queue(topic_id).add(async move {
                log.lock().push(format!("start-{index}"));
                tokio::time::sleep(Duration::from_millis(10 * (3 - index))).await;
                log.lock().push(format!("end-{index}"));
            });
        }
        queues.wait_for_queue(topic_id).await;

        assert_eq!(
            *log.lock(),
            vec!["start-0", "end-0", "start-1", "end-1", "start-2", "end-2"]
        );
        assert!(queues.is_idle(topic_id));
    }

    #[tokio::test]
    async fn different_topics_run_concurrently() {
        let queues = TopicQueues::new();
        let (first, second) = (TopicId::new_v7(), TopicId::new_v7());
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();

        queues.get_queue(first).add(async move {
            let _ = release_rx.await;
        });
        queues.get_queue(second).add(async move {
            let _ = done_tx.send(());
        });

        tokio::time::timeout(Duration::from_secs(1), done_rx)
            .await
            .expect("second topic is not blocked by the first")
            .expect("second task ran");
        assert!(!queues.is_idle(first));

        release_tx.send(()).expect("first task still waiting");
        queues.wait_for_queue(first).await;
        assert!(queues.is_idle(first));
    }

    #[tokio::test]
    async fn panicking_task_does_not_stop_the_queue() {
        let queues = TopicQueues::new();
        let topic_id = TopicId::new_v7();
        let ran = Arc::new(Mutex::new(false));

        queues.get_queue(topic_id).add(async { panic!("task failure") });
        let flag = ran.clone();
        queues.get_queue(topic_id).add(async move {
            *flag.lock() = true;
        });
        queues.wait_for_queue(topic_id).await;

        assert!(*ran.lock());
        assert_eq!(queues.get_queue(topic_id).pending_count(), 0);
    }

    #[tokio::test]
    async fn waiting_on_an_unknown_topic_returns_immediately() {
        let queues = TopicQueues::new();
        queues.wait_for_queue(TopicId::new_v7()).await;
        assert!(!queues.remove_idle(TopicId::new_v7()));
    }
}
