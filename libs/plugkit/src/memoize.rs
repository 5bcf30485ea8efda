//! Per-shell memoization keyed by caller-supplied resolvers.
//!
//! The cache key is computed by an explicit resolver over the call
//! arguments rather than argument equality, so derivations can key on
//! any subset of their inputs. State-bound caches additionally consult
//! a `should_clear` predicate before every call and are swept by
//! `Shell::flush_memoized_for_state`.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Hit/miss/call counters for one memoized function.
#[derive(Default)]
pub struct MemoStats {
    hits: AtomicU64,
    misses: AtomicU64,
    calls: AtomicU64,
}

/// Point-in-time view of [`MemoStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub calls: u64,
}

impl MemoStats {
    pub fn snapshot(&self) -> MemoSnapshot {
        MemoSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            calls: self.calls.load(Ordering::Relaxed),
        }
    }
}

type Func<A, O> = Box<dyn Fn(&A) -> O + Send + Sync>;
type Resolver<A, K> = Box<dyn Fn(&A) -> K + Send + Sync>;
type ClearPredicate = Box<dyn Fn() -> bool + Send + Sync>;

/// A memoized function. Obtained from `Shell::memoize` or
/// `Shell::memoize_for_state`; call through [`Memoized::call`].
pub struct Memoized<A, K, O> {
    name: String,
    func: Func<A, O>,
    resolver: Resolver<A, K>,
    should_clear: Option<ClearPredicate>,
    cache: Mutex<HashMap<K, O>>,
    stats: MemoStats,
    enabled: bool,
    debug: bool,
}

impl<A, K, O> Memoized<A, K, O>
where
    K: Eq + Hash + Send,
    O: Clone + Send,
{
    pub(crate) fn new(
        name: String,
        func: impl Fn(&A) -> O + Send + Sync + 'static,
        resolver: impl Fn(&A) -> K + Send + Sync + 'static,
        should_clear: Option<ClearPredicate>,
        enabled: bool,
        debug: bool,
    ) -> Self {
        Self {
            name,
            func: Box::new(func),
            resolver: Box::new(resolver),
            should_clear,
            cache: Mutex::new(HashMap::new()),
            stats: MemoStats::default(),
            enabled,
            debug,
        }
    }

    pub fn call(&self, arg: A) -> O {
        self.stats.calls.fetch_add(1, Ordering::Relaxed);
        if !self.enabled {
            return (self.func)(&arg);
        }
        if let Some(should_clear) = &self.should_clear {
            if should_clear() {
                self.cache.lock().clear();
            }
        }
        let key = (self.resolver)(&arg);
        if let Some(cached) = self.cache.lock().get(&key) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            if self.debug {
                tracing::debug!(func = %self.name, "memoize hit");
            }
            return cached.clone();
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        if self.debug {
            tracing::debug!(func = %self.name, "memoize miss");
        }
        let out = (self.func)(&arg);
        self.cache.lock().insert(key, out.clone());
        out
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }

    pub fn stats(&self) -> MemoSnapshot {
        self.stats.snapshot()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Type-erased view of a state-bound cache, so a shell can sweep all
/// its caches without knowing their signatures.
pub(crate) trait FlushableCache: Send + Sync {
    fn flush(&self);
}

impl<A, K, O> FlushableCache for Memoized<A, K, O>
where
    A: Send + Sync,
    K: Eq + Hash + Send + Sync,
    O: Clone + Send + Sync,
{
    fn flush(&self) {
        self.clear();
    }
}
