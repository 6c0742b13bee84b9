//! Async memoization with TTLs and request coalescing.
//!
//! For any key at most one fetch is in flight: concurrent callers share the
//! pending future. Resolved values are kept according to the cache's [`Ttl`]
//! and, for bounded caches, evicted least-recently-used. Failed fetches are
//! never stored.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;

/// An error shared by every caller waiting on the same fetch.
#[derive(Clone)]
pub struct SharedError(Arc<anyhow::Error>);

impl SharedError {
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl fmt::Debug for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // `{:#}` keeps the context chain on one line.
        write!(f, "{:#}", self.0)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<anyhow::Error> for SharedError {
    fn from(e: anyhow::Error) -> Self {
        Self(Arc::new(e))
    }
}

/// How long a resolved value stays cached.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Ttl {
    /// Only coalesce concurrent fetches; forget the value once resolved.
    Zero,
    Finite(Duration),
    Infinite,
}

impl From<Duration> for Ttl {
    fn from(d: Duration) -> Self {
        if d.is_zero() {
            Ttl::Zero
        } else {
            Ttl::Finite(d)
        }
    }
}

impl From<Option<Duration>> for Ttl {
    /// `None` never expires.
    fn from(d: Option<Duration>) -> Self {
        d.map_or(Ttl::Infinite, Ttl::from)
    }
}

type Pending<V> = Shared<BoxFuture<'static, Result<V, SharedError>>>;

struct Entry<V> {
    value: V,
    expires: Option<Instant>,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires.is_some_and(|t| t <= now)
    }
}

struct Inner<K: Hash + Eq, V> {
    resolved: LruCache<K, Entry<V>>,
    pending: HashMap<K, (u64, Pending<V>)>,
    next_id: u64,
}

impl<K: Hash + Eq, V: Clone> Inner<K, V> {
    fn lookup(&mut self, key: &K) -> Option<V> {
        let now = Instant::now();
        match self.resolved.get(key) {
            Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
            Some(_) => {}
            None => return None,
        }
        self.resolved.pop(key);
        None
    }
}

/// A keyed async cache.
pub struct KeyedCache<K: Hash + Eq, V> {
    inner: Arc<Mutex<Inner<K, V>>>,
    ttl: Ttl,
}

impl<K: Hash + Eq, V> Clone for KeyedCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            ttl: self.ttl,
        }
    }
}

impl<K, V> KeyedCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// An unbounded cache.
    pub fn new(ttl: impl Into<Ttl>) -> Self {
        Self::with_store(ttl.into(), LruCache::unbounded())
    }

    /// A cache holding at most `capacity` resolved values.
    pub fn bounded(ttl: impl Into<Ttl>, capacity: NonZeroUsize) -> Self {
        Self::with_store(ttl.into(), LruCache::new(capacity))
    }

    fn with_store(ttl: Ttl, resolved: LruCache<K, Entry<V>>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                resolved,
                pending: HashMap::new(),
                next_id: 0,
            })),
            ttl,
        }
    }

    pub fn ttl(&self) -> Ttl {
        self.ttl
    }

    /// Returns the cached value for `key`, or runs `fetch` unless a fetch for
    /// the same key is already pending.
    pub async fn get<F, Fut>(&self, key: K, fetch: F) -> Result<V, SharedError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let pending = {
            let mut inner = self.inner.lock();
            if let Some(value) = inner.lookup(&key) {
                return Ok(value);
            }
            match inner.pending.get(&key) {
                Some((_, pending)) => pending.clone(),
                None => {
                    let id = inner.next_id;
                    inner.next_id += 1;
                    let weak = Arc::downgrade(&self.inner);
                    let ttl = self.ttl;
                    let settle_key = key.clone();
                    let pending = async move {
                        let result = fetch().await.map_err(SharedError::from);
                        settle(&weak, ttl, settle_key, id, result.as_ref().ok());
                        result
                    }
                    .boxed()
                    .shared();
                    inner.pending.insert(key, (id, pending.clone()));
                    pending
                }
            }
        };
        pending.await
    }

    /// Batch form of [`get`](Self::get): keys that are neither cached nor
    /// pending are fetched together with a single call to `fetch`, which must
    /// return one value per key in the same order. Results follow the order
    /// of `keys`.
    pub async fn get_many<F, Fut>(&self, keys: Vec<K>, fetch: F) -> Result<Vec<V>, SharedError>
    where
        F: FnOnce(Vec<K>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Vec<V>>> + Send + 'static,
    {
        let mut ready = HashMap::new();
        let mut waiting = Vec::new();
        {
            let mut inner = self.inner.lock();
            let mut seen = HashSet::new();
            let mut fresh = Vec::new();
            for key in &keys {
                if !seen.insert(key) {
                    continue;
                }
                if let Some(value) = inner.lookup(key) {
                    ready.insert(key.clone(), value);
                } else if let Some((_, pending)) = inner.pending.get(key) {
                    waiting.push((key.clone(), pending.clone()));
                } else {
                    fresh.push(key.clone());
                }
            }
            if !fresh.is_empty() {
                let count = fresh.len();
                let batch_keys = fresh.clone();
                let batch = async move {
                    fetch(batch_keys)
                        .await
                        .map(Arc::new)
                        .map_err(SharedError::from)
                }
                .boxed()
                .shared();
                for (i, key) in fresh.into_iter().enumerate() {
                    let id = inner.next_id;
                    inner.next_id += 1;
                    let weak = Arc::downgrade(&self.inner);
                    let ttl = self.ttl;
                    let batch = batch.clone();
                    let settle_key = key.clone();
                    let pending = async move {
                        let result = batch.await.and_then(|values| {
                            values.get(i).cloned().ok_or_else(|| {
                                anyhow::anyhow!(
                                    "batch fetch returned {} values for {count} keys",
                                    values.len()
                                )
                                .into()
                            })
                        });
                        settle(&weak, ttl, settle_key, id, result.as_ref().ok());
                        result
                    }
                    .boxed()
                    .shared();
                    inner.pending.insert(key.clone(), (id, pending.clone()));
                    waiting.push((key, pending));
                }
            }
        }
        let (waiting_keys, futures): (Vec<_>, Vec<_>) = waiting.into_iter().unzip();
        let values = futures::future::try_join_all(futures).await?;
        ready.extend(waiting_keys.into_iter().zip(values));
        Ok(keys.iter().map(|key| ready[key].clone()).collect())
    }

    /// Returns the cached value without fetching.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.inner.lock().lookup(key)
    }

    /// Stores a value as if it had just been fetched.
    pub fn set(&self, key: K, value: V) {
        if let Some(entry) = entry(self.ttl, value) {
            self.inner.lock().resolved.put(key, entry);
        }
    }

    /// Time left before `key` expires. `Duration::MAX` for values that never
    /// expire, `None` if nothing is cached.
    pub fn remaining(&self, key: &K) -> Option<Duration> {
        let mut inner = self.inner.lock();
        inner.lookup(key)?;
        let entry = inner.resolved.peek(key)?;
        Some(match entry.expires {
            Some(t) => t.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        })
    }

    pub fn delete(&self, key: &K) {
        let mut inner = self.inner.lock();
        inner.resolved.pop(key);
        inner.pending.remove(key);
    }

    /// Drops every resolved value and forgets pending fetches. Fetches that
    /// are already running still complete for their callers but are not
    /// stored.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.resolved.clear();
        inner.pending.clear();
    }

    /// Number of live resolved values.
    pub fn len(&self) -> usize {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let expired: Vec<K> = inner
            .resolved
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.resolved.pop(key);
        }
        inner.resolved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of fetches currently in flight.
    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

fn entry<V>(ttl: Ttl, value: V) -> Option<Entry<V>> {
    match ttl {
        Ttl::Zero => None,
        Ttl::Finite(d) => Some(Entry {
            value,
            expires: Some(Instant::now() + d),
        }),
        Ttl::Infinite => Some(Entry {
            value,
            expires: None,
        }),
    }
}

/// Retires the pending fetch `id` for `key`, storing its value on success.
/// A fetch that was cleared or replaced in the meantime is not stored.
fn settle<K: Hash + Eq, V: Clone>(
    inner: &Weak<Mutex<Inner<K, V>>>,
    ttl: Ttl,
    key: K,
    id: u64,
    value: Option<&V>,
) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let mut inner = inner.lock();
    if !matches!(inner.pending.get(&key), Some((current, _)) if *current == id) {
        return;
    }
    inner.pending.remove(&key);
    if let Some(entry) = value.and_then(|value| entry(ttl, value.clone())) {
        inner.resolved.put(key, entry);
    }
}

/// A single lazily fetched value.
pub struct ValueCache<V>(KeyedCache<(), V>);

impl<V> Clone for ValueCache<V> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<V: Clone + Send + Sync + 'static> ValueCache<V> {
    pub fn new(ttl: impl Into<Ttl>) -> Self {
        Self(KeyedCache::new(ttl))
    }

    pub async fn get<F, Fut>(&self, fetch: F) -> Result<V, SharedError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        self.0.get((), fetch).await
    }

    pub fn peek(&self) -> Option<V> {
        self.0.peek(&())
    }

    pub fn set(&self, value: V) {
        self.0.set((), value)
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.0.remaining(&())
    }

    pub fn clear(&self) {
        self.0.clear()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::bail;

    use super::*;

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    async fn fetch_counted(
        cache: &KeyedCache<u32, u32>,
        calls: &Arc<AtomicUsize>,
        key: u32,
    ) -> Result<u32, SharedError> {
        let calls = calls.clone();
        cache
            .get(key, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(key * 2)
            })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn zero_ttl_only_coalesces() {
        let cache = KeyedCache::new(Ttl::Zero);
        let calls = counter();
        let (a, b) = tokio::join!(
            fetch_counted(&cache, &calls, 1),
            fetch_counted(&cache, &calls, 1)
        );
        assert_eq!((a.unwrap(), b.unwrap()), (2, 2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.pending(), 0);

        fetch_counted(&cache, &calls, 1).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn infinite_ttl_fetches_once() {
        let cache = KeyedCache::new(Ttl::Infinite);
        let calls = counter();
        fetch_counted(&cache, &calls, 3).await.unwrap();
        let value = cache
            .get(3, || async { bail!("must not be called") })
            .await
            .unwrap();
        assert_eq!(value, 6);
        tokio::time::advance(Duration::from_secs(1 << 30)).await;
        assert_eq!(cache.remaining(&3), Some(Duration::MAX));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn finite_ttl_expires_after_ttl() {
        let ttl = Duration::from_secs(10);
        let cache = KeyedCache::new(ttl);
        let calls = counter();
        fetch_counted(&cache, &calls, 5).await.unwrap();

        let first = cache.remaining(&5).unwrap();
        assert!(first <= ttl && first > Duration::ZERO);
        tokio::time::advance(Duration::from_secs(4)).await;
        let second = cache.remaining(&5).unwrap();
        assert!(second < first);
        assert_eq!(cache.len(), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.len(), 1);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.remaining(&5), None);

        fetch_counted(&cache, &calls, 5).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let cache = KeyedCache::<u32, u32>::new(Ttl::Infinite);
        let err = cache
            .get(1, || async { bail!("rate limited") })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "rate limited");
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.get(1, || async { Ok(7) }).await.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn get_many_shares_pending_fetches() {
        let cache = KeyedCache::new(Ttl::Infinite);
        let calls = counter();
        cache.set(1, 100);

        let batches = Arc::new(Mutex::new(Vec::new()));
        let fetch_batch = |batches: Arc<Mutex<Vec<Vec<u32>>>>| {
            move |keys: Vec<u32>| async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let values: Vec<u32> = keys.iter().map(|k| k * 100).collect();
                batches.lock().push(keys);
                Ok::<_, anyhow::Error>(values)
            }
        };

        let (single, many) = tokio::join!(
            fetch_counted(&cache, &calls, 2),
            cache.get_many(vec![3, 1, 2, 3], fetch_batch(batches.clone()))
        );
        assert_eq!(single.unwrap(), 4);
        // Key 2 was already pending when the batch started.
        assert_eq!(many.unwrap(), vec![300, 100, 4, 300]);
        assert_eq!(*batches.lock(), vec![vec![3]]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let again = cache
            .get_many(vec![2, 3], fetch_batch(batches.clone()))
            .await
            .unwrap();
        assert_eq!(again, vec![4, 300]);
        assert_eq!(batches.lock().len(), 1);
    }

    #[tokio::test]
    async fn short_batch_is_an_error() {
        let cache = KeyedCache::<u32, u32>::new(Ttl::Infinite);
        let err = cache
            .get_many(vec![1, 2], |_| async { Ok(vec![1]) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("1 values for 2 keys"));
    }

    #[tokio::test(start_paused = true)]
    async fn cleared_fetch_is_not_stored() {
        let cache = KeyedCache::new(Ttl::Infinite);
        let calls = counter();
        let fetch = fetch_counted(&cache, &calls, 9);
        let clear = async {
            tokio::task::yield_now().await;
            cache.clear();
        };
        let (value, ()) = tokio::join!(fetch, clear);
        assert_eq!(value.unwrap(), 18);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn value_cache() {
        let cache = ValueCache::new(Duration::from_secs(1));
        assert_eq!(cache.get(|| async { Ok("a") }).await.unwrap(), "a");
        assert_eq!(cache.get(|| async { Ok("b") }).await.unwrap(), "a");
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.peek(), None);
        assert_eq!(cache.get(|| async { Ok("b") }).await.unwrap(), "b");
    }
}
