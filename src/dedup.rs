//! Request deduplication: coalescing identical in-flight work
//!
//! Concurrent calls that share a key execute the underlying work exactly
//! once; every caller observes the same settled result, success or failure.
//! The work runs in a spawned task, so a caller that stops waiting (timeout,
//! disconnect) never cancels it for the others.
//!
//! Registry entries are removed when the work settles. As a defensive
//! backstop, entries older than a fixed ceiling are purged on the next call
//! even if settlement never removed them.
//!
//! # Example
//!
//! ```no_run
//! use beacon_core_resilience::dedup::RequestDeduplicator;
//!
//! # async fn example() {
//! let dedup: RequestDeduplicator<String> = RequestDeduplicator::new();
//!
//! // Two concurrent calls with the same key run the closure once.
//! let result = dedup
//!     .dedup("fingerprint", || async { Ok("response".to_string()) })
//!     .await;
//! # let _ = result;
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::ResilienceError;

/// Errors are shared between subscribers, so they travel behind an `Arc`.
pub type SharedResult<T> = std::result::Result<T, Arc<ResilienceError>>;

type SharedFuture<T> = Shared<BoxFuture<'static, SharedResult<T>>>;

struct Pending<T> {
    result: SharedFuture<T>,
    started: Instant,
    subscribers: u32,
    /// Distinguishes this entry from a replacement under the same key, so
    /// settlement only removes its own entry
    id: u64,
}

/// Coalesces concurrent identical requests into one unit of work.
///
/// One instance per value type; the LLM gateway uses a single instance
/// keyed by request fingerprint.
pub struct RequestDeduplicator<T> {
    pending: Arc<Mutex<HashMap<String, Pending<T>>>>,
    max_age: Duration,
    next_id: AtomicU64,
}

impl<T> RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a deduplicator with the default 60s stale-entry ceiling
    pub fn new() -> Self {
        Self::with_max_age(Duration::from_secs(60))
    }

    /// Create a deduplicator whose pending entries are considered stale
    /// after `max_age`
    pub fn with_max_age(max_age: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            max_age,
            next_id: AtomicU64::new(0),
        }
    }

    /// Run `op` under `key`, coalescing with any in-flight execution.
    ///
    /// If an entry for `key` is already pending, `op` is never invoked and
    /// this caller subscribes to the shared result. Otherwise `op`'s future
    /// is spawned, and the registry entry is removed when it settles —
    /// success or failure.
    pub async fn dedup<F, Fut>(&self, key: &str, op: F) -> SharedResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, ResilienceError>> + Send + 'static,
    {
        let shared = {
            let mut pending = self.pending.lock().expect("dedup lock poisoned");
            self.purge_stale(&mut pending);

            if let Some(entry) = pending.get_mut(key) {
                entry.subscribers += 1;
                debug!(key, subscribers = entry.subscribers, "joined in-flight request");
                entry.result.clone()
            } else {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel::<SharedResult<T>>();
                let registry = Arc::clone(&self.pending);
                let key_owned = key.to_string();
                let work = op();

                tokio::spawn(async move {
                    let result = work.await.map_err(Arc::new);
                    // Remove before publishing so a caller arriving after
                    // settlement starts fresh work instead of subscribing
                    // to a finished entry.
                    {
                        let mut pending = registry.lock().expect("dedup lock poisoned");
                        if pending.get(&key_owned).is_some_and(|p| p.id == id) {
                            pending.remove(&key_owned);
                        }
                    }
                    let _ = tx.send(result);
                });

                let shared = async move {
                    match rx.await {
                        Ok(result) => result,
                        Err(_) => Err(Arc::new(ResilienceError::Internal(
                            "coalesced request dropped before settling".to_string(),
                        ))),
                    }
                }
                .boxed()
                .shared();

                pending.insert(
                    key.to_string(),
                    Pending {
                        result: shared.clone(),
                        started: Instant::now(),
                        subscribers: 1,
                        id,
                    },
                );
                shared
            }
        };

        shared.await
    }

    /// Like [`dedup`], but this caller stops waiting after `timeout`.
    ///
    /// The shared unit of work keeps running; other subscribers (and any
    /// later caller joining before settlement) still observe its real
    /// result.
    ///
    /// [`dedup`]: RequestDeduplicator::dedup
    pub async fn dedup_with_timeout<F, Fut>(
        &self,
        key: &str,
        op: F,
        timeout: Duration,
    ) -> SharedResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, ResilienceError>> + Send + 'static,
    {
        match tokio::time::timeout(timeout, self.dedup(key, op)).await {
            Ok(result) => result,
            Err(_) => Err(Arc::new(ResilienceError::DedupTimeout {
                key: key.to_string(),
                waited: timeout,
            })),
        }
    }

    fn purge_stale(&self, pending: &mut HashMap<String, Pending<T>>) {
        let now = Instant::now();
        pending.retain(|key, entry| {
            let stale = now.duration_since(entry.started) > self.max_age;
            if stale {
                warn!(key = %key, age_secs = entry.started.elapsed().as_secs(), "purged stale pending request");
            }
            !stale
        });
    }

    /// Number of in-flight entries
    pub fn pending_count(&self) -> usize {
        let pending = self.pending.lock().expect("dedup lock poisoned");
        pending.len()
    }

    /// How many callers are waiting on `key`, if it is in flight
    pub fn subscriber_count(&self, key: &str) -> Option<u32> {
        let pending = self.pending.lock().expect("dedup lock poisoned");
        pending.get(key).map(|entry| entry.subscribers)
    }
}

impl<T> Default for RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Stable fingerprint for an LLM request: normalized prompt text, model id,
/// and grounding flag. Whitespace runs collapse and case folds so trivially
/// different spellings of the same prompt coalesce.
pub fn request_fingerprint(prompt: &str, model: &str, grounding: bool) -> String {
    let normalized = prompt
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    let mut hasher = blake3::Hasher::new();
    hasher.update(model.as_bytes());
    hasher.update(&[u8::from(grounding)]);
    hasher.update(normalized.as_bytes());
    hasher.finalize().to_hex().to_string()
}
