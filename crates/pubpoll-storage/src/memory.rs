//! In-memory storage backend
//!
//! Fast, non-persistent storage for development and testing.
//! All data is lost when the process exits.
//!
//! A single mutex guards every channel and the revoked JWT map. It is never held across
//! an `.await`: a poll that finds nothing registers on its subscriber's [`Notify`] and
//! releases the lock before waiting.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pubpoll_types::{
    Channel, ChannelId, ChannelProvider, JwtExp, JwtJti, Message, MessageId, Result,
    SubscriberId, SubscriberLocator, SystemClock,
};
use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::OnmemoryStorageConfig;
use crate::traits::{JwtStorage, ProbeDetail, PubSubStorage, Storage};

mod gc;

pub use gc::GcStats;

/// Upper bound for a single wait when the caller asks for an unbounded one
const MAX_POLL_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// A published message and the moment it stops being visible
#[derive(Debug)]
struct StoredMessage {
    message: Message,
    expire_at: DateTime<Utc>,
}

impl StoredMessage {
    fn is_visible(&self, now: DateTime<Utc>) -> bool {
        self.expire_at > now
    }
}

/// Wakeup signal of one subscriber and the number of polls blocked on it
#[derive(Default)]
struct Waiter {
    notify: Notify,
    blocked: AtomicUsize,
}

/// Registration of a blocked poll, released when the poll returns or is dropped
struct WaitGuard(Arc<Waiter>);

impl WaitGuard {
    /// Must be called with the storage lock held, so GC never sees a blocked poll as idle
    fn register(waiter: &Arc<Waiter>) -> Self {
        waiter.blocked.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(waiter))
    }

    async fn notified(&self) {
        self.0.notify.notified().await
    }
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        self.0.blocked.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Pending queue of one subscriber
struct SubscriberData {
    queue: VecDeque<Arc<StoredMessage>>,
    last_activity: DateTime<Utc>,
    waiter: Arc<Waiter>,
}

impl SubscriberData {
    fn new(backlog: impl IntoIterator<Item = Arc<StoredMessage>>, now: DateTime<Utc>) -> Self {
        Self {
            queue: backlog.into_iter().collect(),
            last_activity: now,
            waiter: Arc::new(Waiter::default()),
        }
    }

    /// Idle subscribers have no blocked poll and no activity since `expire_before`
    fn is_idle(&self, expire_before: DateTime<Utc>) -> bool {
        self.last_activity < expire_before && self.waiter.blocked.load(Ordering::SeqCst) == 0
    }
}

/// Internal channel data structure
struct ChannelData {
    /// Last channel definition seen, used by GC when the provider cannot resolve it
    channel: Arc<Channel>,
    /// Message log in publish order, keyed by publish sequence
    log: BTreeMap<u64, Arc<StoredMessage>>,
    /// Message ID to publish sequence
    log_index: HashMap<MessageId, u64>,
    subscribers: HashMap<SubscriberId, SubscriberData>,
}

impl ChannelData {
    fn new(channel: Arc<Channel>) -> Self {
        Self {
            channel,
            log: BTreeMap::new(),
            log_index: HashMap::new(),
            subscribers: HashMap::new(),
        }
    }
}

#[derive(Default)]
struct State {
    channels: HashMap<ChannelId, ChannelData>,
    revoked_jwts: HashMap<JwtJti, JwtExp>,
    next_sequence: u64,
}

impl State {
    fn channel_mut(&mut self, channel: &Arc<Channel>) -> &mut ChannelData {
        let data = self
            .channels
            .entry(channel.id().clone())
            .or_insert_with(|| ChannelData::new(Arc::clone(channel)));
        data.channel = Arc::clone(channel);
        data
    }
}

/// Outcome of draining a subscriber queue
enum Drained {
    Messages(Vec<Message>),
    Wait(WaitGuard),
}

struct Inner {
    state: Mutex<State>,
    clock: Arc<dyn SystemClock>,
    provider: Arc<dyn ChannelProvider>,
    config: OnmemoryStorageConfig,
}

impl Inner {
    fn drain(
        &self,
        channel: &Arc<Channel>,
        locator: &SubscriberLocator,
        max_messages: usize,
    ) -> Drained {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let ChannelData {
            log, subscribers, ..
        } = state.channel_mut(channel);

        let subscriber = subscribers
            .entry(locator.subscriber_id.clone())
            .or_insert_with(|| {
                debug!(subscriber = %locator, "Subscriber created");
                SubscriberData::new(
                    log.values().filter(|m| m.is_visible(now)).cloned(),
                    now,
                )
            });
        subscriber.last_activity = now;

        let mut messages = Vec::new();
        while messages.len() < max_messages {
            match subscriber.queue.pop_front() {
                Some(stored) if stored.is_visible(now) => messages.push(stored.message.clone()),
                Some(_) => continue,
                None => break,
            }
        }

        if messages.is_empty() {
            Drained::Wait(WaitGuard::register(&subscriber.waiter))
        } else {
            debug!(subscriber = %locator, count = messages.len(), "Messages delivered");
            Drained::Messages(messages)
        }
    }
}

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// In-memory storage implementation
///
/// Must be created from within a Tokio runtime: construction starts the GC daemon.
pub struct MemoryStorage {
    inner: Arc<Inner>,
    gc_task: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryStorage {
    /// Create a new in-memory storage and start its GC daemon
    pub fn new(
        config: OnmemoryStorageConfig,
        clock: Arc<dyn SystemClock>,
        channels: Arc<dyn ChannelProvider>,
    ) -> Self {
        info!(
            pubsub = !config.disable_pub_sub,
            jwt = !config.disable_jwt,
            gc_interval = %config.gc_interval,
            "Initializing in-memory storage"
        );
        let inner = Arc::new(Inner {
            state: Mutex::new(State::default()),
            clock,
            provider: channels,
            config,
        });
        let gc_task = gc::spawn_daemon(Arc::clone(&inner));
        Self {
            inner,
            gc_task: Mutex::new(Some(gc_task)),
        }
    }

    /// Run one GC pass on the calling thread, giving up after `timeout`
    pub fn gc(&self, timeout: Duration) -> Result<GcStats> {
        self.inner.gc(timeout)
    }
}

impl Drop for MemoryStorage {
    fn drop(&mut self) {
        if let Some(task) = self.gc_task.get_mut().take() {
            task.abort();
        }
    }
}

impl fmt::Display for MemoryStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("onmemory")
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn file_descriptor_pressure(&self) -> usize {
        0
    }

    async fn liveness(&self) -> Result<ProbeDetail> {
        let state = self.inner.state.lock();
        let subscribers: usize = state.channels.values().map(|c| c.subscribers.len()).sum();
        Ok(json!({
            "channels": state.channels.len(),
            "subscribers": subscribers,
            "revokedJwts": state.revoked_jwts.len(),
        }))
    }

    async fn readiness(&self) -> Result<ProbeDetail> {
        self.liveness().await
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(task) = self.gc_task.lock().take() {
            task.abort();
        }
        info!("In-memory storage shut down");
        Ok(())
    }

    fn as_pubsub(&self) -> Option<&dyn PubSubStorage> {
        if self.inner.config.disable_pub_sub {
            None
        } else {
            Some(self)
        }
    }

    fn as_jwt(&self) -> Option<&dyn JwtStorage> {
        if self.inner.config.disable_jwt {
            None
        } else {
            Some(self)
        }
    }
}

#[async_trait]
impl PubSubStorage for MemoryStorage {
    async fn publish(&self, message: &Message) -> Result<()> {
        let channel = self.inner.provider.get(&message.channel_id)?;
        let now = self.inner.clock.now();
        let expire_at = now
            .checked_add_signed(to_chrono(channel.expire()))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut state = self.inner.state.lock();
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let data = state.channel_mut(&channel);

        if let Some(existing) = data.log_index.get(&message.message_id) {
            let still_visible = data
                .log
                .get(existing)
                .map_or(false, |stored| stored.is_visible(now));
            if still_visible {
                debug!(
                    channel = %message.channel_id,
                    message_id = %message.message_id,
                    "Duplicate message ignored"
                );
                return Ok(());
            }
            let existing = *existing;
            data.log.remove(&existing);
        }

        let stored = Arc::new(StoredMessage {
            message: message.clone(),
            expire_at,
        });
        data.log.insert(sequence, Arc::clone(&stored));
        data.log_index.insert(message.message_id.clone(), sequence);
        for subscriber in data.subscribers.values_mut() {
            subscriber.queue.push_back(Arc::clone(&stored));
            subscriber.waiter.notify.notify_one();
        }

        debug!(
            channel = %message.channel_id,
            message_id = %message.message_id,
            subscribers = data.subscribers.len(),
            "Message published"
        );
        Ok(())
    }

    async fn poll(
        &self,
        subscriber: &SubscriberLocator,
        max_messages: usize,
        max_wait: Duration,
    ) -> Result<Vec<Message>> {
        let channel = self.inner.provider.get(&subscriber.channel_id)?;
        let max_messages = max_messages.max(1);
        let deadline = tokio::time::Instant::now() + max_wait.min(MAX_POLL_WAIT);

        loop {
            let guard = match self.inner.drain(&channel, subscriber, max_messages) {
                Drained::Messages(messages) => return Ok(messages),
                Drained::Wait(guard) => guard,
            };
            // A publish between drain and here left a permit, so this returns at once.
            if tokio::time::timeout_at(deadline, guard.notified())
                .await
                .is_err()
            {
                drop(guard);
                // Last drain also records the end of the wait as activity
                return match self.inner.drain(&channel, subscriber, max_messages) {
                    Drained::Messages(messages) => Ok(messages),
                    Drained::Wait(_) => Ok(Vec::new()),
                };
            }
        }
    }
}

#[async_trait]
impl JwtStorage for MemoryStorage {
    async fn revoke_jwt(&self, exp: JwtExp, jti: &JwtJti) -> Result<()> {
        self.inner
            .state
            .lock()
            .revoked_jwts
            .insert(jti.clone(), exp);
        debug!(jti = %jti, exp = %exp, "JWT revoked");
        Ok(())
    }

    async fn is_revoked_jwt(&self, jti: &JwtJti) -> Result<bool> {
        Ok(self.inner.state.lock().revoked_jwts.contains_key(jti))
    }
}
