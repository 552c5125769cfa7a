//! Single-flight caches shared by every task in the pipeline.
//!
//! The first caller for a key starts the work on its own tokio task; later
//! callers for the same key await the same shared future. Insertion goes
//! through the DashMap entry API, so two callers can never both start work
//! for one key.

use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use tracing::debug;

use crate::error::Result;
use crate::resolver::{Resolution, ResolutionKey};

type SharedResult<V> = Shared<BoxFuture<'static, Option<V>>>;

struct Slot<V: Clone> {
    generation: u64,
    future: SharedResult<V>,
    last_used: AtomicU64,
}

/// Handle on one in-flight or completed computation.
pub struct Flight<V: Clone> {
    generation: u64,
    future: SharedResult<V>,
    /// True for the caller whose request started the work.
    pub leader: bool,
}

impl<V: Clone> Flight<V> {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Wait for the value. `None` means the work was cancelled (runtime
    /// shutdown) before producing one.
    ///
    /// A panic in the work is re-raised in every waiter.
    pub async fn wait(self) -> Option<V> {
        self.future.await
    }
}

/// Map of key to shared computation.
pub struct SingleFlight<K, V: Clone> {
    entries: DashMap<K, Slot<V>>,
    next_generation: AtomicU64,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Join the computation for `key`, starting it with `start` if there is
    /// none. Must be called from within a tokio runtime.
    pub fn get_or_start<F, Fut>(&self, key: K, tick: u64, start: F) -> Flight<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        match self.entries.entry(key) {
            Entry::Occupied(slot) => {
                let slot = slot.get();
                slot.last_used.store(tick, Ordering::Relaxed);
                Flight {
                    generation: slot.generation,
                    future: slot.future.clone(),
                    leader: false,
                }
            }
            Entry::Vacant(vacant) => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let handle = tokio::spawn(start());
                let future = async move {
                    match handle.await {
                        Ok(value) => Some(value),
                        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                        Err(_) => None,
                    }
                }
                .boxed()
                .shared();
                vacant.insert(Slot {
                    generation,
                    future: future.clone(),
                    last_used: AtomicU64::new(tick),
                });
                Flight {
                    generation,
                    future,
                    leader: true,
                }
            }
        }
    }

    /// Completed value for `key`, without joining or starting anything.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.entries
            .get(key)
            .and_then(|slot| slot.future.peek().cloned().flatten())
    }

    /// Drop the entry for `key` if it is still the one from `generation`.
    ///
    /// Used to evict a failed result so the next caller starts afresh,
    /// without evicting a newer entry another caller already started.
    pub fn invalidate(&self, key: &K, generation: u64) -> bool {
        self.entries
            .remove_if(key, |_, slot| slot.generation == generation)
            .is_some()
    }

    /// Drop completed entries last used `max_idle` or more ticks before
    /// `now`. In-flight entries are always kept.
    pub fn evict_idle(&self, now: u64, max_idle: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, slot| {
            let idle = now.saturating_sub(slot.last_used.load(Ordering::Relaxed));
            slot.future.peek().is_none() || idle < max_idle
        });
        before - self.entries.len()
    }

    pub fn remove(&self, key: &K) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// SelectionCache
// ---------------------------------------------------------------------------

/// The pipeline's shared caches.
///
/// - `resolutions`: evaluated platform lists, keyed by expression; evicted
///   after `max_idle` ticks without use.
/// - `remote_inits` / `file_installs`: per install target; failures are
///   evicted by the caller straight away so another host can retry,
///   successes last until [`SelectionCache::reset_install_target`].
pub struct SelectionCache {
    pub resolutions: SingleFlight<ResolutionKey, Result<Arc<Resolution>>>,
    pub remote_inits: SingleFlight<String, Result<()>>,
    pub file_installs: SingleFlight<String, Result<()>>,
    tick: AtomicU64,
    max_idle: u64,
}

impl SelectionCache {
    pub fn new(max_idle: u64) -> Self {
        Self {
            resolutions: SingleFlight::new(),
            remote_inits: SingleFlight::new(),
            file_installs: SingleFlight::new(),
            tick: AtomicU64::new(0),
            max_idle: max_idle.max(1),
        }
    }

    pub fn tick(&self) -> u64 {
        self.tick.load(Ordering::Relaxed)
    }

    /// Start a new scheduler tick and evict idle resolutions.
    pub fn advance_tick(&self) -> u64 {
        let now = self.tick.fetch_add(1, Ordering::Relaxed) + 1;
        let evicted = self.resolutions.evict_idle(now, self.max_idle);
        if evicted > 0 {
            debug!(tick = now, evicted, "idle resolutions evicted");
        }
        now
    }

    /// Forget init and file-install state for `target`, forcing both to
    /// run again on next use.
    pub fn reset_install_target(&self, target: &str) {
        let target = target.to_string();
        self.remote_inits.remove(&target);
        self.file_installs.remove(&target);
    }

    /// Forget everything, e.g. after the platform configuration changed.
    pub fn clear(&self) {
        self.resolutions.clear();
        self.remote_inits.clear();
        self.file_installs.clear();
    }
}
