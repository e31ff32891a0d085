//! One long-lived upstream subscription per channel.
//!
//! Each channel runs its own task cycling through
//! `Disconnected -> Connecting -> Subscribed -> Disconnected`. Every frame
//! received while subscribed is appended to the event log tagged with its
//! channel. Subscriptions are only ever added; a partition that disappears
//! from the configuration keeps its subscription until shutdown.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config_tracker::ConfigTracker;
use super::transport::{FeedConnection, FeedTransport};
use crate::backoff::BackoffPolicy;
use crate::event_log::EventLog;
use crate::types::{FeedChannel, PartitionId};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SubscriptionSettings {
    pub backoff: BackoffPolicy,
    /// A connection that lives this long resets the reconnect attempt count.
    pub stability_window: Duration,
    /// A connection silent for this long is treated as dead.
    pub idle_timeout: Duration,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::exponential(Duration::from_secs(2), Duration::from_secs(300))
                .with_jitter(0.2),
            stability_window: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    Disconnected,
    Connecting,
    Subscribed,
}

struct Running {
    state: Arc<Mutex<SubscriptionState>>,
    handle: JoinHandle<()>,
}

pub struct SubscriptionManager {
    transport: Arc<dyn FeedTransport>,
    log: Arc<dyn EventLog>,
    settings: SubscriptionSettings,
    shutdown: CancellationToken,
    running: Mutex<HashMap<FeedChannel, Running>>,
}

impl fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("channels", &self.running.lock().len())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SubscriptionManager {
    pub fn new(
        transport: Arc<dyn FeedTransport>,
        log: Arc<dyn EventLog>,
        settings: SubscriptionSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            transport,
            log,
            settings,
            shutdown,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Start the subscription for `channel` unless it is already running.
    pub fn ensure_channel(&self, channel: FeedChannel) -> bool {
        let mut running = self.running.lock();
        if running.contains_key(&channel) {
            return false;
        }

        let state = Arc::new(Mutex::new(SubscriptionState::Disconnected));
        let handle = tokio::spawn(run_subscription(
            channel,
            Arc::clone(&self.transport),
            Arc::clone(&self.log),
            self.settings,
            Arc::clone(&state),
            self.shutdown.child_token(),
        ));
        running.insert(channel, Running { state, handle });
        info!(%channel, "subscription task started");
        true
    }

    /// Make sure partitions `0..=ceiling` each have a subscription. Returns
    /// how many were newly started.
    pub fn ensure_partitions(&self, ceiling: PartitionId) -> usize {
        (0..=ceiling.0)
            .filter(|&p| self.ensure_channel(FeedChannel::Canvas(PartitionId(p))))
            .count()
    }

    pub fn active_partitions(&self) -> Vec<PartitionId> {
        let mut partitions: Vec<PartitionId> = self
            .running
            .lock()
            .keys()
            .filter_map(FeedChannel::partition)
            .collect();
        partitions.sort();
        partitions
    }

    pub fn state(&self, channel: FeedChannel) -> Option<SubscriptionState> {
        self.running
            .lock()
            .get(&channel)
            .map(|running| *running.state.lock())
    }

    /// Follow ceiling changes until shutdown, subscribing to new partitions.
    pub async fn follow(&self, tracker: ConfigTracker) {
        let mut ceiling = tracker.subscribe();
        if let Some(current) = *ceiling.borrow_and_update() {
            self.ensure_partitions(current);
        }
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                changed = ceiling.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if let Some(current) = *ceiling.borrow_and_update() {
                        let started = self.ensure_partitions(current);
                        if started > 0 {
                            info!(ceiling = %current, started, "subscribed to new partitions");
                        }
                    }
                }
            }
        }
    }

    /// Wait for every subscription task to exit, giving each at most `grace`.
    pub async fn join(&self, grace: Duration) {
        let running: Vec<(FeedChannel, Running)> = self.running.lock().drain().collect();
        for (channel, running) in running {
            match tokio::time::timeout(grace, running.handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(%channel, "Subscription task failed: {:?}", e),
                Err(_) => warn!(%channel, "Subscription task timed out during shutdown"),
            }
        }
    }
}

enum Ended {
    Shutdown,
    Closed,
    Idle,
    Failed(String),
}

async fn pump(
    channel: FeedChannel,
    connection: &mut dyn FeedConnection,
    log: &dyn EventLog,
    idle_timeout: Duration,
    shutdown: &CancellationToken,
) -> Ended {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return Ended::Shutdown,
            next = tokio::time::timeout(idle_timeout, connection.next_frame()) => next,
        };
        let frame = match next {
            Err(_) => return Ended::Idle,
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => return Ended::Closed,
            Ok(Err(err)) => return Ended::Failed(err.to_string()),
        };
        if let Err(err) = log.append(frame).await {
            // The frame is lost, but the connection itself is still healthy.
            warn!(%channel, error = %err, "failed to append feed frame");
        }
    }
}

async fn run_subscription(
    channel: FeedChannel,
    transport: Arc<dyn FeedTransport>,
    log: Arc<dyn EventLog>,
    settings: SubscriptionSettings,
    state: Arc<Mutex<SubscriptionState>>,
    shutdown: CancellationToken,
) {
    let mut attempt: u32 = 0;

    loop {
        *state.lock() = SubscriptionState::Connecting;
        let connected = tokio::select! {
            _ = shutdown.cancelled() => break,
            connected = transport.connect(channel) => connected,
        };

        match connected {
            Ok(mut connection) => {
                *state.lock() = SubscriptionState::Subscribed;
                info!(%channel, attempt, "subscribed");
                let since = Instant::now();
                let ended = pump(
                    channel,
                    connection.as_mut(),
                    log.as_ref(),
                    settings.idle_timeout,
                    &shutdown,
                )
                .await;
                if since.elapsed() >= settings.stability_window {
                    attempt = 0;
                }
                match ended {
                    Ended::Shutdown => break,
                    Ended::Closed => info!(%channel, "feed closed the subscription"),
                    Ended::Idle => warn!(%channel, timeout = ?settings.idle_timeout, "subscription idle; reconnecting"),
                    Ended::Failed(reason) => warn!(%channel, %reason, "subscription failed"),
                }
            }
            Err(err) => warn!(%channel, attempt, error = %err, "connect failed"),
        }

        *state.lock() = SubscriptionState::Disconnected;
        attempt = attempt.saturating_add(1);
        let delay = settings
            .backoff
            .delay_for(attempt, (channel.to_string(), rand::random::<u64>()));
        debug!(%channel, attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    *state.lock() = SubscriptionState::Disconnected;
    info!("Subscription {} shutting down", channel);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ArchiveError, Result};
    use crate::event_log::InMemoryEventLog;
    use crate::feed::InMemoryCeilingStore;
    use crate::types::FeedFrame;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    /// Hands out connections that emit one frame and then stay silent.
    #[derive(Debug, Default)]
    struct QuietTransport {
        connects: Mutex<HashMap<FeedChannel, usize>>,
    }

    struct QuietConnection {
        channel: FeedChannel,
        sent: bool,
    }

    #[async_trait]
    impl FeedConnection for QuietConnection {
        async fn next_frame(&mut self) -> Result<Option<FeedFrame>> {
            if !self.sent {
                self.sent = true;
                return Ok(Some(FeedFrame::text(self.channel, r#"{"type":"ka"}"#)));
            }
            std::future::pending().await
        }
    }

    #[async_trait]
    impl FeedTransport for QuietTransport {
        async fn connect(&self, channel: FeedChannel) -> Result<Box<dyn FeedConnection>> {
            *self.connects.lock().entry(channel).or_default() += 1;
            Ok(Box::new(QuietConnection {
                channel,
                sent: false,
            }))
        }
    }

    fn manager(transport: Arc<dyn FeedTransport>) -> (SubscriptionManager, Arc<InMemoryEventLog>) {
        let log = Arc::new(InMemoryEventLog::new(1_000));
        let manager = SubscriptionManager::new(
            transport,
            log.clone(),
            SubscriptionSettings::default(),
            CancellationToken::new(),
        );
        (manager, log)
    }

    #[tokio::test(start_paused = true)]
    async fn announced_partitions_get_exactly_one_subscription_each() {
        let transport = Arc::new(QuietTransport::default());
        let (manager, _log) = manager(transport.clone());
        let manager = Arc::new(manager);

        let tracker = ConfigTracker::new(Arc::new(InMemoryCeilingStore::new()));
        let follower = {
            let manager = Arc::clone(&manager);
            let tracker = tracker.clone();
            tokio::spawn(async move { manager.follow(tracker).await })
        };

        tracker.publish(PartitionId(3)).await.expect("publish");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            manager.active_partitions(),
            (0..=3).map(PartitionId).collect::<Vec<_>>()
        );

        // Re-announcing (or announcing fewer) starts nothing new.
        tracker.publish(PartitionId(3)).await.expect("publish");
        tracker.publish(PartitionId(1)).await.expect("publish");
        assert_eq!(manager.ensure_partitions(PartitionId(2)), 0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.active_partitions().len(), 4);
        assert!(transport.connects.lock().values().all(|&n| n == 1));

        manager.shutdown.cancel();
        follower.await.expect("follower exits");
        manager.join(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn frames_are_appended_with_their_channel() {
        let transport = Arc::new(QuietTransport::default());
        let (manager, log) = manager(transport);
        let mut fanout = log.fanout();

        manager.ensure_channel(FeedChannel::Canvas(PartitionId(2)));
        let logged = fanout.recv().await.expect("frame");
        assert_eq!(logged.frame.channel, FeedChannel::Canvas(PartitionId(2)));
        assert_eq!(
            manager.state(FeedChannel::Canvas(PartitionId(2))),
            Some(SubscriptionState::Subscribed)
        );

        manager.shutdown.cancel();
        manager.join(Duration::from_secs(1)).await;
        assert_eq!(manager.active_partitions(), Vec::<PartitionId>::new());
    }

    /// Fails the first `failures` connects, then records each success.
    #[derive(Debug)]
    struct FlakyTransport {
        failures: usize,
        attempts: AtomicUsize,
        connected: mpsc::UnboundedSender<Instant>,
    }

    #[async_trait]
    impl FeedTransport for FlakyTransport {
        async fn connect(&self, channel: FeedChannel) -> Result<Box<dyn FeedConnection>> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(ArchiveError::Transport("refused".into()));
            }
            let _ = self.connected.send(Instant::now());
            Ok(Box::new(QuietConnection {
                channel,
                sent: false,
            }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connects_back_off_then_recover() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = Arc::new(FlakyTransport {
            failures: 3,
            attempts: AtomicUsize::new(0),
            connected: tx,
        });
        let (manager, _log) = manager(transport.clone());
        let started = Instant::now();

        manager.ensure_channel(FeedChannel::Configuration);
        let connected_at = rx.recv().await.expect("eventually connects");

        assert_eq!(transport.attempts.load(Ordering::SeqCst), 4);
        // Three backoffs of roughly 2s, 4s and 8s with 20% jitter.
        let waited = connected_at - started;
        assert!(waited >= Duration::from_millis(11_200), "waited {waited:?}");
        assert!(waited <= Duration::from_millis(16_800), "waited {waited:?}");

        manager.shutdown.cancel();
        manager.join(Duration::from_secs(1)).await;
    }
}
