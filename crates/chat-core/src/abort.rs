use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use robochat_storage::MessageId;

type AbortCallback = Arc<dyn Fn() + Send + Sync>;

/// Handle returned by [`AbortRegistry::register`], used to remove that one callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Registration(u64);

/// Cancellation callbacks keyed by the user message a response answers.
///
/// Several callbacks may share a key (one per fan-out response). `trigger` drains and runs
/// every callback for the key exactly once; later triggers are no-ops.
#[derive(Default)]
pub struct AbortRegistry {
    callbacks: Mutex<HashMap<MessageId, Vec<(Registration, AbortCallback)>>>,
    next_registration: AtomicU64,
}

impl AbortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        key: MessageId,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Registration {
        let registration = Registration(self.next_registration.fetch_add(1, Ordering::Relaxed));
        self.callbacks
            .lock()
            .entry(key)
            .or_default()
            .push((registration, Arc::new(callback)));
        registration
    }

    /// Removes one callback, or every callback for `key` when `registration` is `None`.
    pub fn unregister(&self, key: MessageId, registration: Option<Registration>) {
        let mut callbacks = self.callbacks.lock();
        let Some(entries) = callbacks.get_mut(&key) else {
            return;
        };
        match registration {
            Some(registration) => entries.retain(|(existing, _)| *existing != registration),
            None => entries.clear(),
        }
        if entries.is_empty() {
            callbacks.remove(&key);
        }
    }

    /// Runs and removes every callback for `key`. Returns how many ran.
    ///
    /// Callbacks run outside the registry lock, so they may register or unregister freely.
    /// A panicking callback is logged and does not stop the others.
    pub fn trigger(&self, key: MessageId) -> usize {
        let Some(entries) = self.callbacks.lock().remove(&key) else {
            return 0;
        };

        for (registration, callback) in &entries {
            if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                tracing::error!(
                    key = %key,
                    registration = registration.0,
                    "abort callback panicked"
                );
            }
        }
        entries.len()
    }

    pub fn has(&self, key: MessageId) -> bool {
        self.callbacks.lock().contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
