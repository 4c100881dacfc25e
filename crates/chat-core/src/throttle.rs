use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use robochat_storage::BlockId;
use tokio::task::JoinHandle;

use crate::block::BlockUpdate;
use crate::persist::Persister;
use crate::store::MessageBlockStore;

pub const DEFAULT_THROTTLE_INTERVAL: Duration = Duration::from_millis(150);

struct PendingWrite {
    update: BlockUpdate,
    generation: u64,
    timer: JoinHandle<()>,
}

/// Serializes the writes of one block. Held while a write is taken out of `pending` and
/// applied, so waiting on it means no taken write of that block is still in flight.
type WriteGate = Arc<tokio::sync::Mutex<()>>;

struct ThrottleInner {
    interval: Duration,
    blocks: Arc<MessageBlockStore>,
    persister: Persister,
    // Never held across an await.
    pending: Mutex<HashMap<BlockId, PendingWrite>>,
    gates: Mutex<HashMap<BlockId, WriteGate>>,
    next_generation: AtomicU64,
}

impl ThrottleInner {
    fn gate(&self, block_id: BlockId) -> WriteGate {
        self.gates.lock().entry(block_id).or_default().clone()
    }

    /// Forgets the gate of `block_id` once nobody else holds it.
    fn retire_gate(&self, block_id: BlockId, gate: WriteGate) {
        let mut gates = self.gates.lock();
        drop(gate);
        if gates
            .get(&block_id)
            .is_some_and(|gate| Arc::strong_count(gate) == 1)
        {
            gates.remove(&block_id);
        }
    }

    async fn apply(&self, block_id: BlockId, update: BlockUpdate) {
        match self.blocks.update_one(block_id, update) {
            Some(block) => self.persister.save_block(&block).await,
            None => tracing::debug!(block_id = %block_id, "throttled write skipped; block is gone"),
        }
    }

    /// Takes the waiting write of `block_id` out and applies it.
    ///
    /// `timer` is the generation of the calling timer task, or `None` for an explicit flush.
    async fn take_and_apply(&self, block_id: BlockId, timer: Option<u64>) {
        let gate = self.gate(block_id);
        {
            let _writing = gate.lock().await;
            let taken = {
                let mut pending = self.pending.lock();
                let due = pending.get(&block_id).is_some_and(|write| {
                    timer.is_none_or(|generation| write.generation == generation)
                });
                if due { pending.remove(&block_id) } else { None }
            };
            if let Some(write) = taken {
                // A firing timer is this very task; dropping its handle detaches it.
                if timer.is_none() {
                    write.timer.abort();
                }
                self.apply(block_id, write.update).await;
            }
        }
        self.retire_gate(block_id, gate);
    }

    /// Drops the waiting writes of `block_ids` and waits out any write already taken.
    async fn discard(&self, block_ids: &[BlockId]) {
        {
            let mut pending = self.pending.lock();
            for block_id in block_ids {
                if let Some(write) = pending.remove(block_id) {
                    write.timer.abort();
                }
            }
        }
        for block_id in block_ids {
            let Some(gate) = self.gates.lock().get(block_id).cloned() else {
                continue;
            };
            drop(gate.lock().await);
            self.retire_gate(*block_id, gate);
        }
    }
}

/// Coalesces high-frequency block updates into at most one store mutation and one database
/// write per block per interval.
///
/// A slow database write only holds up later writes of the same block.
#[derive(Clone)]
pub struct BlockWriteThrottle {
    inner: Arc<ThrottleInner>,
}

impl BlockWriteThrottle {
    pub(crate) fn new(
        interval: Duration,
        blocks: Arc<MessageBlockStore>,
        persister: Persister,
    ) -> Self {
        Self {
            inner: Arc::new(ThrottleInner {
                interval,
                blocks,
                persister,
                pending: Mutex::new(HashMap::new()),
                gates: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// Queues `update` for `block_id`, merging it into any write still waiting.
    pub fn schedule(&self, block_id: BlockId, update: BlockUpdate) {
        let mut pending = self.inner.pending.lock();
        if let Some(write) = pending.get_mut(&block_id) {
            write.update = std::mem::take(&mut write.update).merge(update);
            return;
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let inner = self.inner.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(inner.interval).await;
            inner.take_and_apply(block_id, Some(generation)).await;
        });
        pending.insert(
            block_id,
            PendingWrite {
                update,
                generation,
                timer,
            },
        );
    }

    /// Applies the waiting write for `block_id` immediately, if there is one.
    pub async fn flush_now(&self, block_id: BlockId) {
        self.inner.take_and_apply(block_id, None).await;
    }

    /// Drops the waiting write for `block_id`. Once this returns no throttled write for the
    /// block can land.
    pub async fn cancel(&self, block_id: BlockId) {
        self.inner.discard(&[block_id]).await;
    }

    pub async fn cancel_all_for(&self, block_ids: &[BlockId]) {
        self.inner.discard(block_ids).await;
    }

    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().len()
    }
}
