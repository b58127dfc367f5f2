//! In-memory stand-ins for the queue, the duplicate cache and the event
//! store, used to drive the consumer in tests without any infrastructure.
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;

use crate::cache::{CacheError, Claim, DuplicateCache};
use crate::fingerprint::Fingerprint;
use crate::sink::{EventSink, NewEvent, PersistedEvent, SinkError};
use crate::transport::{Delivery, Disposition, MessageSource, TransportError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How one delivery of a message was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub message_id: u64,
    pub attempt: u32,
    pub disposition: Disposition,
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    id: u64,
    payload: Option<Vec<u8>>,
    attempt: u32,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<QueuedMessage>,
    /// Published and not yet acked or discarded.
    outstanding: usize,
    closed: bool,
    source_closed: bool,
    next_id: u64,
    settlements: Vec<Settlement>,
}

struct QueueInner {
    state: Mutex<QueueState>,
    notify: Notify,
    requeue_delay: Duration,
}

/// An at-least-once queue. Requeued messages go to the back of the queue
/// after a short delay, with their attempt count bumped.
#[derive(Clone)]
pub struct MemoryQueue {
    inner: Arc<QueueInner>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::with_requeue_delay(Duration::from_millis(5))
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_requeue_delay(requeue_delay: Duration) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                requeue_delay,
            }),
        }
    }

    pub fn publish(&self, payload: impl Into<Vec<u8>>) -> u64 {
        self.enqueue(Some(payload.into()))
    }

    /// Publish a message with no body at all.
    pub fn publish_without_payload(&self) -> u64 {
        self.enqueue(None)
    }

    fn enqueue(&self, payload: Option<Vec<u8>>) -> u64 {
        let id = {
            let mut state = lock(&self.inner.state);
            let id = state.next_id;
            state.next_id += 1;
            state.outstanding += 1;
            state.ready.push_back(QueuedMessage {
                id,
                payload,
                attempt: 1,
            });
            id
        };
        self.inner.notify.notify_waiters();
        id
    }

    /// No more messages will be published. The source reports itself
    /// exhausted once every outstanding message has been acked or discarded.
    pub fn close(&self) {
        lock(&self.inner.state).closed = true;
        self.inner.notify.notify_waiters();
    }

    pub fn source(&self) -> MemorySource {
        MemorySource {
            queue: self.clone(),
        }
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        lock(&self.inner.state).settlements.clone()
    }

    pub fn settlements_for(&self, message_id: u64) -> Vec<Settlement> {
        self.settlements()
            .into_iter()
            .filter(|s| s.message_id == message_id)
            .collect()
    }

    pub fn outstanding(&self) -> usize {
        lock(&self.inner.state).outstanding
    }

    pub fn source_closed(&self) -> bool {
        lock(&self.inner.state).source_closed
    }

    fn settle(&self, message: QueuedMessage, disposition: Disposition) {
        let mut state = lock(&self.inner.state);
        state.settlements.push(Settlement {
            message_id: message.id,
            attempt: message.attempt,
            disposition,
        });
        match disposition {
            Disposition::Ack | Disposition::Discard => state.outstanding -= 1,
            Disposition::Requeue => state.ready.push_back(QueuedMessage {
                attempt: message.attempt + 1,
                ..message
            }),
        }
        drop(state);
        self.inner.notify.notify_waiters();
    }
}

pub struct MemorySource {
    queue: MemoryQueue,
}

#[async_trait]
impl MessageSource for MemorySource {
    type Message = MemoryDelivery;

    async fn recv(&mut self) -> Result<Option<MemoryDelivery>, TransportError> {
        loop {
            // Registered before checking state so a publish in between is not missed.
            let notified = self.queue.inner.notify.notified();
            {
                let mut state = lock(&self.queue.inner.state);
                if state.source_closed {
                    return Err(TransportError::Closed);
                }
                if let Some(message) = state.ready.pop_front() {
                    return Ok(Some(MemoryDelivery {
                        message,
                        queue: self.queue.clone(),
                    }));
                }
                if state.closed && state.outstanding == 0 {
                    return Ok(None);
                }
            }
            notified.await;
        }
    }

    async fn close(self) -> Result<(), TransportError> {
        lock(&self.queue.inner.state).source_closed = true;
        Ok(())
    }
}

pub struct MemoryDelivery {
    message: QueuedMessage,
    queue: MemoryQueue,
}

impl MemoryDelivery {
    pub fn id(&self) -> u64 {
        self.message.id
    }

    pub fn attempt(&self) -> u32 {
        self.message.attempt
    }
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn payload(&self) -> Option<&[u8]> {
        self.message.payload.as_deref()
    }

    fn describe(&self) -> String {
        format!("memory/{}#{}", self.message.id, self.message.attempt)
    }

    async fn settle(self, disposition: Disposition) -> Result<(), TransportError> {
        if disposition == Disposition::Requeue {
            tokio::time::sleep(self.queue.inner.requeue_delay).await;
        }
        self.queue.settle(self.message, disposition);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    confirmed: bool,
    expires: Instant,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires > now
    }
}

/// Duplicate cache backed by a map, with expiry and an outage switch.
pub struct MemoryDuplicateCache {
    entries: Mutex<HashMap<Fingerprint, CacheEntry>>,
    available: AtomicBool,
    failing_releases: AtomicU32,
}

impl Default for MemoryDuplicateCache {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            failing_releases: AtomicU32::new(0),
        }
    }
}

impl MemoryDuplicateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// While unavailable every call fails with a timeout.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn fail_next_releases(&self, count: u32) {
        self.failing_releases.store(count, Ordering::SeqCst);
    }

    /// Live entries only.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        lock(&self.entries)
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    pub fn ttl_of(&self, fingerprint: &Fingerprint) -> Option<Duration> {
        self.live_entry(fingerprint)
            .and_then(|entry| entry.expires.checked_duration_since(Instant::now()))
    }

    /// Whether a live entry exists and its event was confirmed as stored.
    pub fn is_confirmed(&self, fingerprint: &Fingerprint) -> bool {
        self.live_entry(fingerprint).is_some_and(|entry| entry.confirmed)
    }

    fn live_entry(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let now = Instant::now();
        lock(&self.entries)
            .get(fingerprint)
            .copied()
            .filter(|entry| entry.is_live(now))
    }

    fn check_available(&self) -> Result<(), CacheError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Timeout)
        }
    }

    /// Returns the live entry that blocked the write, if any.
    fn set_if_absent(
        &self,
        fingerprint: &Fingerprint,
        confirmed: bool,
        ttl: Duration,
    ) -> Option<CacheEntry> {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        match entries.get(fingerprint) {
            Some(entry) if entry.is_live(now) => Some(*entry),
            _ => {
                entries.insert(
                    fingerprint.clone(),
                    CacheEntry {
                        confirmed,
                        expires: now + ttl,
                    },
                );
                None
            }
        }
    }
}

#[async_trait]
impl DuplicateCache for MemoryDuplicateCache {
    async fn exists(&self, fingerprint: &Fingerprint) -> Result<bool, CacheError> {
        self.check_available()?;
        Ok(self.live_entry(fingerprint).is_some())
    }

    async fn record_if_absent(
        &self,
        fingerprint: &Fingerprint,
        ttl: Duration,
    ) -> Result<Claim, CacheError> {
        self.check_available()?;
        Ok(match self.set_if_absent(fingerprint, true, ttl) {
            None => Claim::Claimed,
            Some(_) => Claim::AlreadySeen,
        })
    }

    async fn claim(&self, fingerprint: &Fingerprint, lease: Duration) -> Result<Claim, CacheError> {
        self.check_available()?;
        Ok(match self.set_if_absent(fingerprint, false, lease) {
            None => Claim::Claimed,
            Some(entry) if entry.confirmed => Claim::AlreadySeen,
            Some(_) => Claim::Pending,
        })
    }

    async fn confirm(&self, fingerprint: &Fingerprint, ttl: Duration) -> Result<(), CacheError> {
        self.check_available()?;
        lock(&self.entries).insert(
            fingerprint.clone(),
            CacheEntry {
                confirmed: true,
                expires: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn release(&self, fingerprint: &Fingerprint) -> Result<(), CacheError> {
        self.check_available()?;
        let failing = self
            .failing_releases
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CacheError::Timeout);
        }
        lock(&self.entries).remove(fingerprint);
        Ok(())
    }
}

/// A cache that never remembers anything, so every handler reaches the
/// store and only the unique constraint deduplicates.
#[derive(Default)]
pub struct ForgetfulCache;

#[async_trait]
impl DuplicateCache for ForgetfulCache {
    async fn exists(&self, _: &Fingerprint) -> Result<bool, CacheError> {
        Ok(false)
    }

    async fn record_if_absent(&self, _: &Fingerprint, _: Duration) -> Result<Claim, CacheError> {
        Ok(Claim::Claimed)
    }

    async fn claim(&self, _: &Fingerprint, _: Duration) -> Result<Claim, CacheError> {
        Ok(Claim::Claimed)
    }

    async fn confirm(&self, _: &Fingerprint, _: Duration) -> Result<(), CacheError> {
        Ok(())
    }

    async fn release(&self, _: &Fingerprint) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Event store with a unique constraint on the fingerprint, an optional
/// insert delay, and injectable failures.
#[derive(Default)]
pub struct MemoryEventSink {
    rows: Mutex<Vec<PersistedEvent>>,
    next_id: AtomicI64,
    failing_inserts: AtomicU32,
    insert_delay: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_insert_delay(insert_delay: Duration) -> Self {
        Self {
            insert_delay,
            ..Self::default()
        }
    }

    /// The next `count` inserts fail as if the pool timed out.
    pub fn fail_next_inserts(&self, count: u32) {
        self.failing_inserts.store(count, Ordering::SeqCst);
    }

    pub fn rows(&self) -> Vec<PersistedEvent> {
        lock(&self.rows).clone()
    }

    /// Highest number of inserts observed running at the same time.
    pub fn max_concurrent_inserts(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn insert(&self, event: &NewEvent) -> Result<(), SinkError> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = ActiveGuard(&self.active);
        self.max_active.fetch_max(active, Ordering::SeqCst);

        if !self.insert_delay.is_zero() {
            tokio::time::sleep(self.insert_delay).await;
        }

        let failing = self
            .failing_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SinkError::Unavailable(sqlx::Error::PoolTimedOut));
        }

        let mut rows = lock(&self.rows);
        if rows
            .iter()
            .any(|row| row.event_hash == event.fingerprint.as_str())
        {
            return Err(SinkError::DuplicateFingerprint(event.fingerprint.clone()));
        }

        let now = Utc::now();
        rows.push(PersistedEvent {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            event_hash: event.fingerprint.as_str().to_owned(),
            event_name: event.event_name.clone(),
            event_datetime: event.event_datetime,
            profile_id: event.profile_id.clone(),
            device_ip: event.device_ip.clone(),
            raw_data: event.raw_data.clone(),
            created_at: now,
        });
        Ok(())
    }
}
