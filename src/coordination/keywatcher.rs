//! Long-poll primitive over keyspace notifications.
//!
//! A caller watches a named key until its value differs from a remembered
//! one, or a deadline elapses. A single publisher task holds the pattern
//! subscriptions (`set` and `expired` keyspace events) and fans each event
//! out to every waiter registered for that key. The subscription map is the
//! only shared state; it is guarded by one mutex that is never held across
//! network I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fred::clients::{Pool, SubscriberClient};
use fred::interfaces::{ClientLike, EventInterface, KeysInterface, PubsubInterface};
use rand::Rng;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::{MetricsRegistry, PollStatus};

const PATTERN_SET: &str = "__keyevent@*__:set";
const PATTERN_EXPIRED: &str = "__keyevent@*__:expired";

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// How a [`KeyWatcher::watch`] call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchResult {
    /// The stored value already differed when the watch began.
    Immediately,
    /// A keyspace event arrived and the re-read value differed.
    NotifiedChanged,
    /// A keyspace event arrived but the value was unchanged.
    NotifiedUnchanged,
    /// The deadline elapsed without an event.
    TimedOut,
}

/// Shared long-poll coordinator. Construct once, share via `Arc`, and call
/// [`spawn_publisher`](Self::spawn_publisher) exactly once; `shutdown`
/// stops the publisher loop.
pub struct KeyWatcher {
    pool: Pool,
    subscriber_config: fred::types::config::Config,
    subscriptions: Mutex<HashMap<String, Vec<Subscription>>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    metrics: MetricsRegistry,
}

struct Subscription {
    id: u64,
    tx: oneshot::Sender<()>,
}

/// Removes the subscription on every exit path of `watch`, including
/// cancellation of the calling future. Removal after the publisher already
/// delivered (and dropped) the entry is a no-op.
struct SubscriptionGuard<'a> {
    watcher: &'a KeyWatcher,
    key: &'a str,
    id: u64,
}

impl Drop for SubscriptionGuard<'_> {
    fn drop(&mut self) {
        self.watcher.remove_subscription(self.key, self.id);
    }
}

// ---------------------------------------------------------------------------
// Watch
// ---------------------------------------------------------------------------

impl KeyWatcher {
    pub fn new(
        pool: Pool,
        subscriber_config: fred::types::config::Config,
        metrics: MetricsRegistry,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            subscriber_config,
            subscriptions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            metrics,
        })
    }

    /// Block until `key`'s value differs from `expected`, an event fires, or
    /// `timeout` elapses.
    ///
    /// A key absent from the store compares as the empty string. After a
    /// notification the value is re-read: the event only says something
    /// happened, the caller cares whether the value moved.
    pub async fn watch(&self, key: &str, expected: &str, timeout: Duration) -> Result<WatchResult> {
        let (tx, rx) = oneshot::channel();
        let id = self.add_subscription(key, tx);
        let _guard = SubscriptionGuard { watcher: self, key, id };

        let current: Option<String> = self.pool.get(key).await.context("read watched key")?;
        if current.unwrap_or_default() != expected {
            self.metrics.metrics.count_keywatch(PollStatus::Miss);
            return Ok(WatchResult::Immediately);
        }

        tokio::select! {
            notified = rx => {
                if notified.is_err() {
                    bail!("key watcher shut down while waiting on {key:?}");
                }
                let now: Option<String> =
                    self.pool.get(key).await.context("re-read watched key")?;
                if now.unwrap_or_default() != expected {
                    self.metrics.metrics.count_keywatch(PollStatus::Miss);
                    Ok(WatchResult::NotifiedChanged)
                } else {
                    self.metrics.metrics.count_keywatch(PollStatus::Hit);
                    Ok(WatchResult::NotifiedUnchanged)
                }
            }
            () = tokio::time::sleep(timeout) => {
                self.metrics.metrics.count_keywatch(PollStatus::Hit);
                Ok(WatchResult::TimedOut)
            }
        }
    }

    // ---- subscription registry ----

    fn add_subscription(&self, key: &str, tx: oneshot::Sender<()>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut map = self.subscriptions.lock().unwrap();
        map.entry(key.to_string())
            .or_default()
            .push(Subscription { id, tx });
        self.metrics.metrics.keywatcher_watchers.inc();
        id
    }

    fn remove_subscription(&self, key: &str, id: u64) {
        let mut map = self.subscriptions.lock().unwrap();
        if let Some(list) = map.get_mut(key) {
            if let Some(pos) = list.iter().position(|s| s.id == id) {
                list.remove(pos);
                self.metrics.metrics.keywatcher_watchers.dec();
            }
            // The map never holds an empty list.
            if list.is_empty() {
                map.remove(key);
            }
        }
    }

    /// Deliver one notification to every waiter on `key` and drop the whole
    /// group. A key with no waiters is a no-op.
    fn notify(&self, key: &str) {
        let mut map = self.subscriptions.lock().unwrap();
        if let Some(list) = map.remove(key) {
            for sub in list {
                // The channel is single-slot; a waiter that already gave up
                // just drops the message.
                let _ = sub.tx.send(());
                self.metrics.metrics.keywatcher_watchers.dec();
            }
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self, key: &str) -> usize {
        self.subscriptions
            .lock()
            .unwrap()
            .get(key)
            .map_or(0, Vec::len)
    }

    // -----------------------------------------------------------------------
    // Publisher
    // -----------------------------------------------------------------------

    /// Spawn the singleton publisher loop.
    pub fn spawn_publisher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let watcher = Arc::clone(self);
        tokio::spawn(async move { watcher.run_publisher().await })
    }

    /// Stop the publisher loop. Waiters already blocked keep running until
    /// their own deadlines.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn run_publisher(&self) {
        info!("keyspace notification publisher started");
        let mut backoff = Backoff::new();
        while !self.shutdown.is_cancelled() {
            match self.pump_events(&mut backoff).await {
                Ok(()) => break,
                Err(err) => {
                    let delay = backoff.next();
                    warn!(error = %err, ?delay, "keyspace subscription lost; reconnecting");
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = self.shutdown.cancelled() => break,
                    }
                }
            }
        }
        debug!("keyspace notification publisher stopped");
    }

    /// Connect a dedicated subscriber, consume events until the connection
    /// dies (`Err`) or shutdown is requested (`Ok`).
    async fn pump_events(&self, backoff: &mut Backoff) -> Result<()> {
        let subscriber =
            SubscriberClient::new(self.subscriber_config.clone(), None, None, None);
        let _connect_task = subscriber.connect();
        subscriber
            .wait_for_connect()
            .await
            .context("connect keyspace subscriber")?;
        subscriber
            .psubscribe(PATTERN_SET)
            .await
            .context("psubscribe set events")?;
        subscriber
            .psubscribe(PATTERN_EXPIRED)
            .await
            .context("psubscribe expired events")?;
        backoff.reset();
        debug!("subscribed to keyspace notifications");

        let mut messages = subscriber.message_rx();
        let mut errors = subscriber.error_rx();
        loop {
            tokio::select! {
                msg = messages.recv() => match msg {
                    Ok(msg) => {
                        // The payload of a keyspace event is the key name.
                        if let Some(key) = msg.value.as_str() {
                            self.notify(&key);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "keyspace event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        let _ = subscriber.quit().await;
                        bail!("keyspace event stream closed");
                    }
                },
                err = errors.recv() => {
                    let _ = subscriber.quit().await;
                    bail!("keyspace subscriber connection error: {err:?}");
                }
                () = self.shutdown.cancelled() => {
                    let _ = subscriber.quit().await;
                    return Ok(());
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Reconnect backoff
// ---------------------------------------------------------------------------

const BACKOFF_MIN: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Exponential backoff with full jitter between the floor and the current
/// ceiling. `reset` is called after every successful reconnect.
struct Backoff {
    attempt: u32,
}

impl Backoff {
    fn new() -> Self {
        Self { attempt: 0 }
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn next(&mut self) -> Duration {
        let ceiling = BACKOFF_MIN
            .saturating_mul(1u32 << self.attempt.min(16))
            .min(BACKOFF_MAX);
        self.attempt = self.attempt.saturating_add(1);
        let floor_ms = BACKOFF_MIN.as_millis() as u64;
        let ceiling_ms = ceiling.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(floor_ms..=ceiling_ms))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_watcher() -> Arc<KeyWatcher> {
        let pool = fred::types::Builder::default_centralized()
            .build_pool(1)
            .unwrap();
        KeyWatcher::new(
            pool,
            fred::types::config::Config::default(),
            MetricsRegistry::new(),
        )
    }

    #[tokio::test]
    async fn notify_delivers_to_all_and_clears_key() {
        let watcher = test_watcher();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        watcher.add_subscription("job:1", tx1);
        watcher.add_subscription("job:1", tx2);
        assert_eq!(watcher.subscriber_count("job:1"), 2);

        watcher.notify("job:1");
        assert!(rx1.await.is_ok());
        assert!(rx2.await.is_ok());
        assert_eq!(watcher.subscriber_count("job:1"), 0);
        assert_eq!(watcher.metrics.metrics.keywatcher_watchers.get(), 0);
    }

    #[tokio::test]
    async fn notify_unknown_key_is_noop() {
        let watcher = test_watcher();
        watcher.notify("nobody-home");
    }

    #[tokio::test]
    async fn remove_keeps_other_subscribers() {
        let watcher = test_watcher();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        let id1 = watcher.add_subscription("k", tx1);
        watcher.add_subscription("k", tx2);

        watcher.remove_subscription("k", id1);
        assert_eq!(watcher.subscriber_count("k"), 1);

        // Removing an id twice must not disturb the remaining entry.
        watcher.remove_subscription("k", id1);
        assert_eq!(watcher.subscriber_count("k"), 1);
    }

    #[tokio::test]
    async fn removing_last_subscriber_drops_the_key() {
        let watcher = test_watcher();
        let (tx, _rx) = oneshot::channel();
        let id = watcher.add_subscription("k", tx);
        watcher.remove_subscription("k", id);
        assert!(watcher.subscriptions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn guard_removes_on_drop() {
        let watcher = test_watcher();
        let (tx, _rx) = oneshot::channel();
        let id = watcher.add_subscription("k", tx);
        {
            let _guard = SubscriptionGuard { watcher: watcher.as_ref(), key: "k", id };
        }
        assert_eq!(watcher.subscriber_count("k"), 0);
    }

    #[test]
    fn backoff_stays_within_bounds_and_caps() {
        let mut backoff = Backoff::new();
        for _ in 0..24 {
            let d = backoff.next();
            assert!(d >= BACKOFF_MIN, "{d:?} below floor");
            assert!(d <= BACKOFF_MAX, "{d:?} above cap");
        }
    }

    #[test]
    fn backoff_reset_restores_short_delays() {
        let mut backoff = Backoff::new();
        for _ in 0..10 {
            backoff.next();
        }
        backoff.reset();
        // First delay after reset is drawn from the initial window again.
        assert!(backoff.next() <= Duration::from_millis(200));
    }
}
