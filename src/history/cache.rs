//! Bounded per-run context cache with exclusive locking.
//!
//! The cache is an arena: it owns the contexts; callers borrow handles by
//! key. Holding a context's guard is the sole license to mutate that run.
//! Eviction only touches unlocked, non-dirty entries.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::core::{CancellationToken, Limits, WorkflowKey};

use super::error::ReplicationError;
use super::metrics;
use super::mutable_state::MutableState;

pub struct ExecutionContext {
    key: WorkflowKey,
    state: Mutex<ContextState>,
}

#[derive(Default, Debug)]
struct ContextState {
    cached: Option<MutableState>,
}

impl ExecutionContext {
    fn new(key: WorkflowKey) -> Self {
        Self {
            key,
            state: Mutex::new(ContextState::default()),
        }
    }

    pub fn key(&self) -> &WorkflowKey {
        &self.key
    }

    /// Acquire the exclusive lock, polling until the token fires or the
    /// configured timeout passes.
    pub fn lock(
        &self,
        token: &CancellationToken,
        limits: &Limits,
    ) -> Result<ExecutionGuard<'_>, ReplicationError> {
        let deadline = Instant::now() + Duration::from_millis(limits.lock_acquire_timeout_ms);
        loop {
            if token.is_cancelled() {
                return Err(ReplicationError::Cancelled);
            }
            match self.state.try_lock() {
                Ok(guard) => {
                    return Ok(ExecutionGuard {
                        key: &self.key,
                        state: guard,
                    });
                }
                Err(std::sync::TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return Err(ReplicationError::LockTimeout);
                    }
                    std::thread::sleep(Duration::from_millis(limits.lock_retry_interval_ms));
                }
                Err(std::sync::TryLockError::Poisoned(poisoned)) => {
                    // A panicked holder cannot have committed partial state;
                    // the cached copy is untrusted and dropped.
                    let mut guard = poisoned.into_inner();
                    guard.cached = None;
                    return Ok(ExecutionGuard {
                        key: &self.key,
                        state: guard,
                    });
                }
            }
        }
    }

    fn is_evictable(&self) -> bool {
        match self.state.try_lock() {
            Ok(guard) => !guard
                .cached
                .as_ref()
                .is_some_and(MutableState::has_pending_changes),
            Err(_) => false,
        }
    }
}

/// Exclusive access to one run's context.
#[derive(Debug)]
pub struct ExecutionGuard<'a> {
    key: &'a WorkflowKey,
    state: MutexGuard<'a, ContextState>,
}

impl ExecutionGuard<'_> {
    pub fn key(&self) -> &WorkflowKey {
        self.key
    }

    pub fn cached(&self) -> Option<&MutableState> {
        self.state.cached.as_ref()
    }

    pub fn cached_mut(&mut self) -> Option<&mut MutableState> {
        self.state.cached.as_mut()
    }

    pub fn install(&mut self, state: MutableState) -> &mut MutableState {
        self.state.cached = Some(state);
        self.state.cached.as_mut().expect("just installed")
    }

    /// Drop the cached state; the next load re-reads persistence. Called
    /// after a failed commit, when the in-memory copy can no longer be
    /// trusted.
    pub fn clear(&mut self) {
        self.state.cached = None;
    }
}

struct CacheEntry {
    context: Arc<ExecutionContext>,
    last_used: u64,
}

struct CacheInner {
    entries: BTreeMap<WorkflowKey, CacheEntry>,
    use_counter: u64,
}

/// Sharded-per-instance mapping of run keys to contexts.
pub struct ExecutionCache {
    inner: Mutex<CacheInner>,
    limits: Limits,
}

impl ExecutionCache {
    pub fn new(limits: Limits) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: BTreeMap::new(),
                use_counter: 0,
            }),
            limits,
        }
    }

    /// Insert-if-absent; idempotent. Never displaces a locked entry.
    pub fn get_or_create(&self, key: &WorkflowKey) -> Arc<ExecutionContext> {
        let mut inner = self.inner.lock().expect("execution cache lock poisoned");
        inner.use_counter += 1;
        let counter = inner.use_counter;

        if let Some(entry) = inner.entries.get_mut(key) {
            entry.last_used = counter;
            return Arc::clone(&entry.context);
        }

        if inner.entries.len() >= self.limits.execution_cache_max_entries {
            evict_one(&mut inner);
        }

        let context = Arc::new(ExecutionContext::new(key.clone()));
        inner.entries.insert(
            key.clone(),
            CacheEntry {
                context: Arc::clone(&context),
                last_used: counter,
            },
        );
        context
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("execution cache lock poisoned")
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn evict_one(inner: &mut CacheInner) {
    let victim = inner
        .entries
        .iter()
        .filter(|(_, entry)| entry.context.is_evictable())
        .min_by_key(|(_, entry)| entry.last_used)
        .map(|(key, _)| key.clone());
    if let Some(key) = victim {
        inner.entries.remove(&key);
        metrics::execution_cache_evicted(1);
    }
}

/// Acquire two contexts of the same workflow in runID-lexicographic order.
/// The ordering makes concurrent terminate-other-run paths deadlock-free.
pub fn lock_two<'a>(
    a: &'a ExecutionContext,
    b: &'a ExecutionContext,
    token: &CancellationToken,
    limits: &Limits,
) -> Result<(ExecutionGuard<'a>, ExecutionGuard<'a>), ReplicationError> {
    debug_assert_ne!(a.key(), b.key(), "lock_two requires distinct runs");
    if a.key().run_id <= b.key().run_id {
        let guard_a = a.lock(token, limits)?;
        let guard_b = b.lock(token, limits)?;
        Ok((guard_a, guard_b))
    } else {
        let guard_b = b.lock(token, limits)?;
        let guard_a = a.lock(token, limits)?;
        Ok((guard_a, guard_b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{NamespaceId, RunId, Version, WorkflowId};
    use uuid::Uuid;

    fn key(run_seed: u128) -> WorkflowKey {
        WorkflowKey::new(
            NamespaceId::new("ns1").unwrap(),
            WorkflowId::new("wf1").unwrap(),
            RunId::new(Uuid::from_u128(run_seed)),
        )
    }

    fn small_limits(max_entries: usize) -> Limits {
        let mut limits = Limits::default();
        limits.execution_cache_max_entries = max_entries;
        limits.lock_acquire_timeout_ms = 50;
        limits.lock_retry_interval_ms = 1;
        limits
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let cache = ExecutionCache::new(small_limits(4));
        let a = cache.get_or_create(&key(1));
        let b = cache.get_or_create(&key(1));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn lock_is_exclusive_and_cancellable() {
        let cache = ExecutionCache::new(small_limits(4));
        let context = cache.get_or_create(&key(1));
        let token = CancellationToken::new();
        let limits = small_limits(4);

        let guard = context.lock(&token, &limits).unwrap();
        let err = context.lock(&token, &limits).unwrap_err();
        assert!(matches!(err, ReplicationError::LockTimeout));
        drop(guard);

        token.cancel();
        let err = context.lock(&token, &limits).unwrap_err();
        assert!(matches!(err, ReplicationError::Cancelled));
    }

    #[test]
    fn eviction_skips_locked_entries() {
        let limits = small_limits(1);
        let cache = ExecutionCache::new(limits.clone());
        let token = CancellationToken::new();

        let first = cache.get_or_create(&key(1));
        let guard = first.lock(&token, &limits).unwrap();

        // Capacity is 1 and the only candidate is locked: nothing evicts,
        // the cache grows past its bound rather than displacing a lock.
        cache.get_or_create(&key(2));
        assert_eq!(cache.len(), 2);
        drop(guard);

        cache.get_or_create(&key(3));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn eviction_skips_dirty_entries() {
        let limits = small_limits(1);
        let cache = ExecutionCache::new(limits.clone());
        let token = CancellationToken::new();

        let first = cache.get_or_create(&key(1));
        {
            let mut guard = first.lock(&token, &limits).unwrap();
            let state = guard.install(MutableState::new(
                NamespaceId::new("ns1").unwrap(),
                WorkflowId::new("wf1").unwrap(),
                RunId::new(Uuid::from_u128(1)),
                Version::new(1),
                1,
            ));
            state
                .add_workflow_execution_signaled("sig".into(), None, "alice".into())
                .unwrap();
        }

        cache.get_or_create(&key(2));
        assert_eq!(cache.len(), 2, "dirty entry must not be evicted");
    }

    #[test]
    fn lock_two_orders_by_run_id() {
        let limits = small_limits(4);
        let cache = ExecutionCache::new(limits.clone());
        let token = CancellationToken::new();
        let low = cache.get_or_create(&key(1));
        let high = cache.get_or_create(&key(2));

        let (guard_high, guard_low) = lock_two(&high, &low, &token, &limits).unwrap();
        assert_eq!(guard_high.key().run_id, key(2).run_id);
        assert_eq!(guard_low.key().run_id, key(1).run_id);
    }

    #[test]
    fn concurrent_lockers_serialize() {
        let limits = small_limits(4);
        let cache = Arc::new(ExecutionCache::new(limits.clone()));
        let context = cache.get_or_create(&key(7));
        let token = CancellationToken::new();

        let mut guard = context.lock(&token, &limits).unwrap();
        guard.install(MutableState::new(
            NamespaceId::new("ns1").unwrap(),
            WorkflowId::new("wf1").unwrap(),
            RunId::new(Uuid::from_u128(7)),
            Version::new(1),
            1,
        ));
        drop(guard);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let context = Arc::clone(&context);
                let limits = limits.clone();
                let token = token.clone();
                std::thread::spawn(move || {
                    let mut guard = context.lock(&token, &limits).unwrap();
                    let state = guard.cached_mut().unwrap();
                    state
                        .add_workflow_execution_signaled("sig".into(), None, "bob".into())
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let guard = context.lock(&token, &limits).unwrap();
        // 4 signals, each advancing the log by one.
        assert_eq!(guard.cached().unwrap().next_event_id().get(), 5);
    }
}
