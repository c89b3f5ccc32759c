//! A keyed object pool: one bounded (or unbounded) idle queue per key, with
//! borrow/return/invalidate semantics, background eviction, and a
//! process-wide active-object map.
//!
//! Loosely modeled on `volo_thrift::transport::pool::Pool`, extended with
//! `min`/`max`, validation, a disposable-overflow mode, and keep-alive
//! eviction, the way `bb8`/`r2d2`'s `ManageConnection` family shapes a
//! bounded pool around a pluggable connection factory.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use linked_hash_map::LinkedHashMap;
use tokio::sync::oneshot;
use tokio::time::{interval, timeout};

/// Sentinel for "no upper bound" on a per-key pool.
pub const UNBOUNDED: Option<usize> = None;

/// Capability trait a pool needs from the resource it manages: how to make
/// one, how to tear one down, and how to check it is still good.
pub trait ResourceFactory<K, T>: Send + Sync + 'static
where
    T: Send + 'static,
{
    type Error: Debug + Send + Sync + 'static;

    /// Create a new instance for `key`.
    fn create(&self, key: &K) -> impl Future<Output = Result<T, Self::Error>> + Send;

    /// Validate `value` (borrow- or return-time). `Err` marks the instance
    /// for destruction and carries the reason it failed validation.
    fn validate(&self, key: &K, value: &mut T) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Tear down `value`. Synchronous: the resource's own `Drop` (e.g. a
    /// socket close) does the actual teardown; this hook exists for
    /// bookkeeping/logging only.
    fn destroy(&self, key: &K, value: T);
}

/// Cheap, synchronous liveness probe, checked before the pool even offers an
/// idle instance for (re)validation. Analogous to the teacher's
/// `Poolable::reusable`.
pub trait Poolable {
    fn is_open(&self) -> bool;
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError<E> {
    #[error("pool exhausted: no instance became available within the timeout")]
    Exhausted,
    #[error("no valid object could be created or validated: {0:?}")]
    NoValidObject(E),
    #[error("timed out waiting for an instance")]
    Timeout,
    #[error("pool is closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min: usize,
    /// `None` means unbounded.
    pub max: Option<usize>,
    pub borrow_validation: bool,
    pub return_validation: bool,
    pub disposable: bool,
    pub keep_alive: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            min: 0,
            max: Some(8),
            borrow_validation: false,
            return_validation: false,
            disposable: false,
            keep_alive: None,
        }
    }
}

impl PoolConfig {
    pub fn min(mut self, min: usize) -> Self {
        self.min = min;
        self
    }

    pub fn max(mut self, max: Option<usize>) -> Self {
        self.max = max;
        self
    }

    pub fn borrow_validation(mut self, on: bool) -> Self {
        self.borrow_validation = on;
        self
    }

    pub fn return_validation(mut self, on: bool) -> Self {
        self.return_validation = on;
        self
    }

    pub fn disposable(mut self, on: bool) -> Self {
        self.disposable = on;
        self
    }

    pub fn keep_alive(mut self, dur: Option<Duration>) -> Self {
        self.keep_alive = dur;
        self
    }
}

/// Live counters for one key's pool, as seen at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub pool_size: usize,
    pub idle: usize,
    pub active: usize,
    pub peak: usize,
}

struct KeyState<T> {
    idle: VecDeque<T>,
    /// idle + active (non-disposable) instance count.
    pool_size_hint: usize,
    peak_size_hint: usize,
    destroyed: bool,
    waiters: LinkedHashMap<u64, oneshot::Sender<T>>,
    waiter_counter: u64,
}

impl<T> KeyState<T> {
    fn new() -> Self {
        KeyState {
            idle: VecDeque::new(),
            pool_size_hint: 0,
            peak_size_hint: 0,
            destroyed: false,
            waiters: LinkedHashMap::new(),
            waiter_counter: 0,
        }
    }

    fn bump_peak(&mut self) {
        if self.pool_size_hint > self.peak_size_hint {
            self.peak_size_hint = self.pool_size_hint;
        }
    }

    fn stats(&self) -> PoolStats {
        let idle = self.idle.len();
        let active = self.pool_size_hint.saturating_sub(idle);
        PoolStats {
            pool_size: self.pool_size_hint,
            idle,
            active,
            peak: self.peak_size_hint,
        }
    }
}

struct ActiveEntry<K> {
    key: K,
    disposable: bool,
}

struct PoolInner<K, T, F> {
    factory: F,
    config: PoolConfig,
    states: Mutex<HashMap<K, Arc<Mutex<KeyState<T>>>>>,
    active: Mutex<HashMap<u64, ActiveEntry<K>>>,
    active_counter: AtomicU64,
    evicting: AtomicBool,
}

/// A keyed, bounded (or unbounded) object pool.
pub struct Pool<K, T, F> {
    inner: Arc<PoolInner<K, T, F>>,
}

impl<K, T, F> Clone for Pool<K, T, F> {
    fn clone(&self) -> Self {
        Pool {
            inner: self.inner.clone(),
        }
    }
}

/// A borrowed instance. Either call `return_to`/`invalidate` explicitly, or
/// simply drop it: dropping spawns the same return path on the current
/// tokio runtime so the instance is never silently leaked.
pub struct Pooled<K, T, F>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    T: Poolable + Send + 'static,
    F: ResourceFactory<K, T>,
{
    pool: Pool<K, T, F>,
    key: K,
    value: Option<T>,
    active_id: u64,
    disposable: bool,
}

impl<K, T, F> Pooled<K, T, F>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    T: Poolable + Send + 'static,
    F: ResourceFactory<K, T>,
{
    pub fn get_ref(&self) -> &T {
        self.value.as_ref().expect("value taken")
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("value taken")
    }

    pub fn is_disposable(&self) -> bool {
        self.disposable
    }

    /// Return this instance to its pool (subject to `returnValidation`).
    pub async fn return_to(mut self) {
        if let Some(v) = self.value.take() {
            self.pool
                .finish_return(&self.key, v, self.disposable, self.active_id)
                .await;
        }
    }

    /// Unconditionally destroy this instance instead of returning it.
    pub async fn invalidate(mut self) {
        if let Some(v) = self.value.take() {
            self.pool
                .finish_invalidate(&self.key, v, self.disposable, self.active_id)
                .await;
        }
    }
}

impl<K, T, F> Drop for Pooled<K, T, F>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    T: Poolable + Send + 'static,
    F: ResourceFactory<K, T>,
{
    fn drop(&mut self) {
        if let Some(v) = self.value.take() {
            let pool = self.pool.clone();
            let key = self.key.clone();
            let disposable = self.disposable;
            let active_id = self.active_id;
            tokio::spawn(async move {
                pool.finish_return(&key, v, disposable, active_id).await;
            });
        }
    }
}

impl<K, T, F> Pool<K, T, F>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    T: Poolable + Send + 'static,
    F: ResourceFactory<K, T> + Send + Sync + 'static,
{
    pub fn new(factory: F, config: PoolConfig) -> Self {
        let inner = Arc::new(PoolInner {
            factory,
            config,
            states: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            active_counter: AtomicU64::new(0),
            evicting: AtomicBool::new(false),
        });
        let pool = Pool { inner: inner.clone() };
        if let Some(dur) = pool.inner.config.keep_alive {
            if !dur.is_zero() {
                tokio::spawn(eviction_task(Arc::downgrade(&inner), dur));
            }
        }
        pool
    }

    fn state_for(&self, key: &K) -> Arc<Mutex<KeyState<T>>> {
        let mut states = self.inner.states.lock().unwrap();
        states
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(KeyState::new())))
            .clone()
    }

    /// Borrow an instance for `key`. `timeout_ms < 0` means "wait
    /// indefinitely" unless `disposable` is configured, in which case a
    /// negative timeout is treated as "don't block at all, overflow
    /// immediately".
    pub async fn borrow(
        &self,
        key: &K,
        timeout_ms: i64,
    ) -> Result<Pooled<K, T, F>, PoolError<F::Error>> {
        let mut attempts = 0;
        loop {
            let (mut value, disposable) = self.acquire_raw(key, timeout_ms).await?;

            if self.inner.config.borrow_validation {
                match self.inner.factory.validate(key, &mut value).await {
                    Ok(()) => return Ok(self.track(key, value, disposable)),
                    Err(e) => {
                        self.inner.factory.destroy(key, value);
                        if !disposable {
                            let state = self.state_for(key);
                            let mut s = state.lock().unwrap();
                            s.pool_size_hint = s.pool_size_hint.saturating_sub(1);
                        }
                        attempts += 1;
                        if attempts >= 3 {
                            return Err(PoolError::NoValidObject(e));
                        }
                        continue;
                    }
                }
            }

            return Ok(self.track(key, value, disposable));
        }
    }

    fn track(&self, key: &K, value: T, disposable: bool) -> Pooled<K, T, F> {
        let id = self.inner.active_counter.fetch_add(1, Ordering::Relaxed);
        self.inner.active.lock().unwrap().insert(
            id,
            ActiveEntry {
                key: key.clone(),
                disposable,
            },
        );
        Pooled {
            pool: self.clone(),
            key: key.clone(),
            value: Some(value),
            active_id: id,
            disposable,
        }
    }

    /// Steps 1-3e and (d) of the borrow algorithm: obtain a raw instance,
    /// not yet validated or tracked in the active map.
    async fn acquire_raw(
        &self,
        key: &K,
        timeout_ms: i64,
    ) -> Result<(T, bool), PoolError<F::Error>> {
        let state = self.state_for(key);

        enum Action<T> {
            Ready(T),
            Create,
            Wait(oneshot::Receiver<T>),
        }

        let action = loop {
            let mut s = state.lock().unwrap();
            if s.destroyed {
                return Err(PoolError::Closed);
            }
            if s.pool_size_hint < self.inner.config.min {
                s.pool_size_hint += 1;
                s.bump_peak();
                break Action::Create;
            } else if let Some(v) = s.idle.pop_front() {
                if v.is_open() {
                    break Action::Ready(v);
                } else {
                    // dead connection found in the idle queue: drop it and
                    // keep scanning within this same lock acquisition.
                    s.pool_size_hint = s.pool_size_hint.saturating_sub(1);
                    self.inner.factory.destroy(key, v);
                    continue;
                }
            } else if self
                .inner
                .config
                .max
                .map(|max| s.pool_size_hint < max)
                .unwrap_or(true)
            {
                s.pool_size_hint += 1;
                s.bump_peak();
                break Action::Create;
            } else {
                let id = s.waiter_counter;
                s.waiter_counter += 1;
                let (tx, rx) = oneshot::channel();
                s.waiters.insert(id, tx);
                break Action::Wait(rx);
            }
        };

        match action {
            Action::Ready(v) => Ok((v, false)),
            Action::Create => match self.inner.factory.create(key).await {
                Ok(v) => Ok((v, false)),
                Err(e) => {
                    let mut s = state.lock().unwrap();
                    s.pool_size_hint = s.pool_size_hint.saturating_sub(1);
                    Err(PoolError::NoValidObject(e))
                }
            },
            Action::Wait(rx) => {
                if timeout_ms < 0 {
                    if self.inner.config.disposable {
                        // don't block at all; overflow straight away.
                        return self.overflow(key).await;
                    }
                    return rx.await.map(|v| (v, false)).map_err(|_| PoolError::Closed);
                }
                match timeout(Duration::from_millis(timeout_ms as u64), rx).await {
                    Ok(Ok(v)) => Ok((v, false)),
                    Ok(Err(_)) => Err(PoolError::Closed),
                    Err(_elapsed) => {
                        if self.inner.config.disposable {
                            self.overflow(key).await
                        } else {
                            Err(PoolError::Exhausted)
                        }
                    }
                }
            }
        }
    }

    async fn overflow(&self, key: &K) -> Result<(T, bool), PoolError<F::Error>> {
        match self.inner.factory.create(key).await {
            Ok(v) => Ok((v, true)),
            Err(e) => Err(PoolError::NoValidObject(e)),
        }
    }

    async fn finish_return(&self, key: &K, value: T, disposable: bool, active_id: u64) {
        self.inner.active.lock().unwrap().remove(&active_id);

        let state = self.state_for(key);
        if state.lock().unwrap().destroyed {
            self.inner.factory.destroy(key, value);
            return;
        }

        let mut value = value;
        if self.inner.config.return_validation {
            if self.inner.factory.validate(key, &mut value).await.is_err() {
                self.inner.factory.destroy(key, value);
                if !disposable {
                    let mut s = state.lock().unwrap();
                    s.pool_size_hint = s.pool_size_hint.saturating_sub(1);
                }
                return;
            }
        }

        if disposable {
            self.inner.factory.destroy(key, value);
            return;
        }

        // hand directly to a waiter if one exists, else enqueue idle.
        let mut s = state.lock().unwrap();
        while let Some((_, tx)) = s.waiters.pop_front() {
            match tx.send(value) {
                Ok(()) => return,
                Err(v) => {
                    value = v;
                }
            }
        }
        s.idle.push_back(value);
    }

    async fn finish_invalidate(&self, key: &K, value: T, disposable: bool, active_id: u64) {
        self.inner.active.lock().unwrap().remove(&active_id);
        self.inner.factory.destroy(key, value);
        if !disposable {
            let state = self.state_for(key);
            let mut s = state.lock().unwrap();
            s.pool_size_hint = s.pool_size_hint.saturating_sub(1);
        }
    }

    /// Ensure at least `min` idle instances exist for `key`.
    pub async fn preload_min(&self, key: &K) -> Result<(), PoolError<F::Error>> {
        loop {
            let need = {
                let state = self.state_for(key);
                let s = state.lock().unwrap();
                if s.destroyed {
                    return Err(PoolError::Closed);
                }
                s.pool_size_hint < self.inner.config.min
            };
            if !need {
                return Ok(());
            }
            let state = self.state_for(key);
            {
                let mut s = state.lock().unwrap();
                s.pool_size_hint += 1;
                s.bump_peak();
            }
            match self.inner.factory.create(key).await {
                Ok(v) => {
                    let mut s = state.lock().unwrap();
                    s.idle.push_back(v);
                }
                Err(e) => {
                    let mut s = state.lock().unwrap();
                    s.pool_size_hint = s.pool_size_hint.saturating_sub(1);
                    return Err(PoolError::NoValidObject(e));
                }
            }
        }
    }

    /// Drop every idle instance for `key` without closing the key's pool.
    pub fn clear(&self, key: &K) {
        let state = self.state_for(key);
        let mut s = state.lock().unwrap();
        while let Some(v) = s.idle.pop_front() {
            s.pool_size_hint = s.pool_size_hint.saturating_sub(1);
            self.inner.factory.destroy(key, v);
        }
    }

    /// Permanently close `key`'s pool: idle instances are destroyed,
    /// waiters are dropped (their `borrow` calls observe `PoolClosed`), and
    /// future borrows fail until the key is implicitly recreated is *not*
    /// possible -- a destroyed key stays destroyed.
    pub fn destroy_key(&self, key: &K) {
        let state = self.state_for(key);
        let mut s = state.lock().unwrap();
        s.destroyed = true;
        while let Some(v) = s.idle.pop_front() {
            self.inner.factory.destroy(key, v);
        }
        s.pool_size_hint = 0;
        s.waiters.clear();
    }

    pub fn destroy_all(&self) {
        let keys: Vec<K> = self.inner.states.lock().unwrap().keys().cloned().collect();
        for key in keys {
            self.destroy_key(&key);
        }
    }

    pub fn stats(&self, key: &K) -> PoolStats {
        let state = self.state_for(key);
        let mut s = state.lock().unwrap();
        let stats = s.stats();
        // peak must never read back below current size.
        s.bump_peak();
        stats
    }
}

async fn eviction_task<K, T, F>(inner: Weak<PoolInner<K, T, F>>, period: Duration)
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    T: Poolable + Send + 'static,
    F: ResourceFactory<K, T> + Send + Sync + 'static,
{
    let mut ticker = interval(period);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if inner
            .evicting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // a previous tick is still running; coalesce by skipping this one.
            continue;
        }
        let _guard = scopeguard::guard((), |_| {
            inner.evicting.store(false, Ordering::Release);
        });

        let min = inner.config.min;
        let states: Vec<(K, Arc<Mutex<KeyState<T>>>)> = inner
            .states
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, state) in states {
            loop {
                let victim = {
                    let mut s = state.lock().unwrap();
                    if s.destroyed || s.pool_size_hint <= min {
                        None
                    } else if let Some(v) = s.idle.pop_front() {
                        s.pool_size_hint = s.pool_size_hint.saturating_sub(1);
                        Some(v)
                    } else {
                        None
                    }
                };
                match victim {
                    Some(v) => {
                        inner.factory.destroy(&key, v);
                        continue;
                    }
                    None => break,
                }
            }
        }
    }
}
