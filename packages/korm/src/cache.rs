//! In-process cache registered alongside the migrations runner.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;

type CachedValue = Arc<dyn Any + Send + Sync>;

pub const DEFAULT_CACHE_CAPACITY: u64 = 10_000;

/// Cheap to clone; clones share the same entries.
#[derive(Clone)]
pub struct MemoryCache {
    inner: Cache<String, CachedValue>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_options(DEFAULT_CACHE_CAPACITY, None)
    }

    pub fn with_options(max_capacity: u64, time_to_live: Option<Duration>) -> Self {
        let mut builder = Cache::<String, CachedValue>::builder().max_capacity(max_capacity);
        if let Some(ttl) = time_to_live {
            builder = builder.time_to_live(ttl);
        }
        Self {
            inner: builder.build(),
        }
    }

    pub fn insert<T>(&self, key: impl Into<String>, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.inner.insert(key.into(), Arc::new(value) as CachedValue);
    }

    /// `None` when the key is absent or holds a value of another type.
    pub fn get<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.inner.get(key)?.downcast::<T>().ok()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    pub fn invalidate(&self, key: &str) {
        self.inner.invalidate(key);
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("entries", &self.inner.entry_count())
            .finish()
    }
}
