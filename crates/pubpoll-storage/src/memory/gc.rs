//! Background garbage collection for the in-memory storage

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use pubpoll_types::{Error, Result};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::{to_chrono, Inner};

/// What a single GC pass removed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    /// Idle subscribers evicted
    pub subscribers: usize,
    /// Expired messages dropped from subscriber queues
    pub queued_messages: usize,
    /// Expired entries dropped from channel logs
    pub log_entries: usize,
    /// Channels left with no subscriber and no message
    pub channels: usize,
    /// Revocations whose token has expired
    pub revoked_jwts: usize,
}

fn deadline_passed(deadline: Instant) -> bool {
    Instant::now() >= deadline
}

fn check_deadline(deadline: Instant) -> Result<()> {
    if deadline_passed(deadline) {
        Err(Error::Cancelled("GC pass exceeded its deadline".to_string()))
    } else {
        Ok(())
    }
}

impl Inner {
    pub(super) fn gc(&self, timeout: Duration) -> Result<GcStats> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.try_lock_for(timeout).ok_or_else(|| {
            Error::Cancelled("GC could not acquire the storage lock in time".to_string())
        })?;
        let state = &mut *state;
        let now = self.clock.now();
        let mut stats = GcStats::default();

        for (id, data) in state.channels.iter_mut() {
            check_deadline(deadline)?;

            // Pick up expiry changes; keep the last known definition if lookup fails.
            if let Ok(channel) = self.provider.get(id) {
                data.channel = channel;
            }
            let expire_before = now
                .checked_sub_signed(to_chrono(data.channel.expire()))
                .unwrap_or(DateTime::<Utc>::MIN_UTC);

            // `retain` cannot stop early; once the deadline passes the rest is kept as is.
            let mut late = false;
            let before = data.subscribers.len();
            data.subscribers.retain(|_, subscriber| {
                late = late || deadline_passed(deadline);
                late || !subscriber.is_idle(expire_before)
            });
            stats.subscribers += before - data.subscribers.len();
            check_deadline(deadline)?;

            for subscriber in data.subscribers.values_mut() {
                check_deadline(deadline)?;
                let before = subscriber.queue.len();
                subscriber.queue.retain(|m| m.expire_at >= expire_before);
                stats.queued_messages += before - subscriber.queue.len();
            }

            let log_index = &mut data.log_index;
            let before = data.log.len();
            data.log.retain(|_, m| {
                late = late || deadline_passed(deadline);
                let keep = late || m.expire_at >= expire_before;
                if !keep {
                    log_index.remove(&m.message.message_id);
                }
                keep
            });
            stats.log_entries += before - data.log.len();
            check_deadline(deadline)?;
        }

        let before = state.channels.len();
        state
            .channels
            .retain(|_, data| !(data.subscribers.is_empty() && data.log.is_empty()));
        stats.channels = before - state.channels.len();

        check_deadline(deadline)?;
        let before = state.revoked_jwts.len();
        state.revoked_jwts.retain(|_, exp| *exp >= now);
        stats.revoked_jwts = before - state.revoked_jwts.len();

        Ok(stats)
    }
}

/// Run GC passes forever at the configured interval
pub(super) fn spawn_daemon(inner: Arc<Inner>) -> JoinHandle<()> {
    let interval = inner.config.gc_interval.as_duration();
    let timeout = inner.config.gc_timeout.as_duration();

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;

            let pass = Arc::clone(&inner);
            match tokio::task::spawn_blocking(move || pass.gc(timeout)).await {
                Ok(Ok(stats)) => debug!(?stats, "GC pass completed"),
                Ok(Err(e)) => warn!(error = %e, "GC pass failed, retrying at next interval"),
                Err(e) => error!(error = %e, "GC pass aborted"),
            }
        }
    })
}
