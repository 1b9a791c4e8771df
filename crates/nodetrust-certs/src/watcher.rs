//! Change watcher: keeps the trust cache converged with the identity store
//!
//! The watcher is a small state machine:
//!
//! ```text
//! Disconnected -> Subscribing -> Streaming -> (event) Streaming
//!      ^                                         |
//!      +-------------- stream error / end -------+
//! ```
//!
//! Subscriptions resume from the last revision seen. When no revision is
//! known, or the store reports the revision as expired, events may have been
//! missed, so a full synchronization runs before streaming again. Failed
//! subscriptions back off exponentially and retry forever; only cancellation
//! stops the watcher.

use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use nodetrust_common::retry::Backoff;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WatchConfig;
use crate::store::{ChangeEvent, ChangeKind, ChangeStream, IdentityStore, StoreError, StoreEvent};
use crate::sync::FullSynchronizer;
use crate::trust_cache::{CacheUpdate, TrustCache};

/// Connection state of the watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// No subscription; waiting to (re)subscribe
    Disconnected,
    /// Re-listing and/or opening a subscription
    Subscribing,
    /// Receiving events
    Streaming,
    /// Cancelled; will not mutate the cache again
    Stopped,
}

/// Effect of one change event on the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Certificate inserted, replaced or confirmed
    Updated(CacheUpdate),
    /// Delete event; `true` if an entry was removed
    Removed(bool),
    /// Node carries no certificate; cache left alone
    Ignored,
}

/// Apply a single change event to the cache.
///
/// Every event is a full-value overwrite or a removal, so re-applying an
/// event is harmless and the final cache depends only on the latest event
/// per identity.
pub fn apply_event(cache: &TrustCache, event: &ChangeEvent) -> ApplyOutcome {
    let identity = event.identity();
    match (event.kind, &event.certificate) {
        (ChangeKind::Deleted, _) => ApplyOutcome::Removed(cache.remove(&identity)),
        (ChangeKind::Added | ChangeKind::Modified, Some(certificate)) => {
            ApplyOutcome::Updated(cache.insert(&identity, certificate))
        }
        (ChangeKind::Added | ChangeKind::Modified, None) => {
            debug!(node = %event.node, kind = ?event.kind, "Node has no certificate, ignoring");
            ApplyOutcome::Ignored
        }
    }
}

/// Why a streaming session ended
enum StreamEnd {
    Cancelled,
    Closed { received: usize },
    Failed(StoreError),
}

/// Long-running watcher task
pub struct ChangeWatcher {
    store: Arc<dyn IdentityStore>,
    cache: Arc<TrustCache>,
    synchronizer: FullSynchronizer,
    config: WatchConfig,
    state: watch::Sender<WatchState>,
}

impl ChangeWatcher {
    /// Create a watcher over `store` feeding `cache`
    pub fn new(store: Arc<dyn IdentityStore>, cache: Arc<TrustCache>, config: WatchConfig) -> Self {
        let synchronizer = FullSynchronizer::new(store.clone(), cache.clone(), config.sync.clone());
        let (state, _) = watch::channel(WatchState::Disconnected);
        Self {
            store,
            cache,
            synchronizer,
            config,
            state,
        }
    }

    /// Spawn the watcher as an independent task.
    ///
    /// `revision` is the revision of the synchronization that preceded the
    /// watch; passing it avoids a redundant re-list on the first subscribe.
    pub fn spawn(self, revision: Option<String>) -> WatcherHandle {
        let cancel = CancellationToken::new();
        let state = self.state.subscribe();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move { self.run(revision, task_cancel).await });
        WatcherHandle {
            cancel,
            task,
            state,
        }
    }

    /// Run until `cancel` fires
    pub async fn run(self, revision: Option<String>, cancel: CancellationToken) {
        let mut revision = revision;
        let mut backoff = Backoff::new(self.config.backoff.clone());
        let mut reconcile = self.config.eviction.interval().map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        info!(resume_revision = ?revision, "Certificate watcher started");

        while !cancel.is_cancelled() {
            self.set_state(WatchState::Subscribing);

            let resume = match revision.take() {
                Some(resume) => resume,
                None => match unless_cancelled(
                    &cancel,
                    self.synchronizer.run(self.config.eviction.evicts_absent()),
                )
                .await
                {
                    None => break,
                    Some(Ok(report)) => report.revision,
                    Some(Err(e)) => {
                        warn!(error = %e, "Re-synchronization before watch failed");
                        if !self.disconnect(&mut backoff, &cancel).await {
                            break;
                        }
                        continue;
                    }
                },
            };

            let stream = match unless_cancelled(&cancel, self.store.watch(&resume)).await {
                None => break,
                Some(Ok(stream)) => stream,
                Some(Err(e)) => {
                    warn!(error = %e, revision = %resume, "Failed to subscribe to node changes");
                    revision = resumable(&e, resume);
                    if !self.disconnect(&mut backoff, &cancel).await {
                        break;
                    }
                    continue;
                }
            };

            self.set_state(WatchState::Streaming);
            debug!(revision = %resume, "Streaming node changes");

            let mut last_revision = resume;
            match self
                .stream(stream, &mut last_revision, &mut backoff, &mut reconcile, &cancel)
                .await
            {
                StreamEnd::Cancelled => break,
                StreamEnd::Closed { received } => {
                    debug!(received, revision = %last_revision, "Watch stream closed, resubscribing");
                    revision = Some(last_revision);
                    if received == 0 && !self.disconnect(&mut backoff, &cancel).await {
                        break;
                    }
                }
                StreamEnd::Failed(e) => {
                    warn!(error = %e, revision = %last_revision, "Watch stream terminated");
                    revision = resumable(&e, last_revision);
                    if !self.disconnect(&mut backoff, &cancel).await {
                        break;
                    }
                }
            }
        }

        self.set_state(WatchState::Stopped);
        info!("Certificate watcher stopped");
    }

    async fn stream(
        &self,
        mut stream: ChangeStream,
        last_revision: &mut String,
        backoff: &mut Backoff,
        reconcile: &mut Option<Interval>,
        cancel: &CancellationToken,
    ) -> StreamEnd {
        let mut received = 0usize;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return StreamEnd::Cancelled,

                _ = next_tick(reconcile) => {
                    debug!("Running periodic certificate reconciliation");
                    match unless_cancelled(cancel, self.synchronizer.run(true)).await {
                        None => return StreamEnd::Cancelled,
                        Some(Err(e)) => warn!(error = %e, "Periodic reconciliation failed"),
                        Some(Ok(_)) => {}
                    }
                }

                item = stream.next() => {
                    // The subscription may have been cancelled while we waited
                    if cancel.is_cancelled() {
                        return StreamEnd::Cancelled;
                    }
                    match item {
                        Some(Ok(StoreEvent::Changed(event))) => {
                            received += 1;
                            backoff.reset();
                            if !event.revision.is_empty() {
                                last_revision.clone_from(&event.revision);
                            }
                            let outcome = apply_event(&self.cache, &event);
                            debug!(node = %event.node, kind = ?event.kind, ?outcome, "Applied node change");
                        }
                        Some(Ok(StoreEvent::Bookmark { revision })) => {
                            received += 1;
                            backoff.reset();
                            *last_revision = revision;
                        }
                        Some(Err(e)) => return StreamEnd::Failed(e),
                        None => return StreamEnd::Closed { received },
                    }
                }
            }
        }
    }

    /// Enter `Disconnected` and wait out the backoff. Returns false if
    /// cancelled while waiting.
    async fn disconnect(&self, backoff: &mut Backoff, cancel: &CancellationToken) -> bool {
        self.set_state(WatchState::Disconnected);
        let delay = backoff.next_delay();
        debug!(
            delay_ms = delay.as_millis(),
            failures = backoff.failures(),
            "Waiting before resubscribing"
        );
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn set_state(&self, state: WatchState) {
        self.state.send_replace(state);
    }
}

/// Drive `operation` unless `cancel` fires first. Store calls can stall for
/// as long as the client read timeout, and stopping must not wait for them.
async fn unless_cancelled<T>(
    cancel: &CancellationToken,
    operation: impl Future<Output = T>,
) -> Option<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        output = operation => Some(output),
    }
}

/// Revision to resume from after `error`, or `None` when a re-list is needed
fn resumable(error: &StoreError, revision: String) -> Option<String> {
    match error {
        StoreError::Expired { .. } => None,
        _ => Some(revision),
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Handle to a spawned watcher
pub struct WatcherHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    state: watch::Receiver<WatchState>,
}

impl WatcherHandle {
    /// Current watcher state
    pub fn state(&self) -> WatchState {
        *self.state.borrow()
    }

    /// Receiver notified on every state transition
    pub fn subscribe_state(&self) -> watch::Receiver<WatchState> {
        self.state.clone()
    }

    /// Cancel the watcher and wait for it to exit. Once this returns the
    /// cache is no longer mutated by the watcher.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            if e.is_panic() {
                error!(error = %e, "Certificate watcher panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EvictionPolicy, SyncConfig};
    use crate::identity::NodeIdentity;
    use crate::store::testing::{cert, change, listing, record};
    use crate::store::MockIdentityStore;
    use nodetrust_common::retry::RetryConfig;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    fn id(name: &str) -> NodeIdentity {
        NodeIdentity::from_node_name(name)
    }

    fn fast_config() -> WatchConfig {
        WatchConfig {
            backoff: RetryConfig {
                max_attempts: 0,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                backoff_multiplier: 2.0,
            },
            eviction: EvictionPolicy::OnDeleteOnly,
            sync: SyncConfig { concurrency: 2 },
        }
    }

    fn changed(event: ChangeEvent) -> Result<StoreEvent, StoreError> {
        Ok(StoreEvent::Changed(event))
    }

    fn at_revision(mut event: ChangeEvent, revision: &str) -> ChangeEvent {
        event.revision = revision.to_string();
        event
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[test]
    fn replaying_events_keeps_only_latest_per_identity() {
        let cache = TrustCache::new();
        let events = [
            change(ChangeKind::Added, "a", Some(cert("cert1"))),
            change(ChangeKind::Modified, "a", Some(cert("cert2"))),
            change(ChangeKind::Added, "b", Some(cert("cert3"))),
            change(ChangeKind::Deleted, "a", None),
        ];
        for event in &events {
            apply_event(&cache, event);
        }

        assert_eq!(cache.identities(), vec![id("b")]);
        assert_eq!(cache.get(&id("b")), Some(cert("cert3")));
    }

    #[test]
    fn duplicate_delivery_is_a_noop() {
        let once = TrustCache::new();
        let twice = TrustCache::new();
        let event = change(ChangeKind::Added, "a", Some(cert("cert1")));

        apply_event(&once, &event);
        apply_event(&twice, &event);
        let second = apply_event(&twice, &event);

        assert_eq!(second, ApplyOutcome::Updated(CacheUpdate::Unchanged));
        assert_eq!(once.snapshot(), twice.snapshot());
    }

    #[test]
    fn interleaving_across_identities_does_not_matter() {
        let a = [
            change(ChangeKind::Added, "a", Some(cert("a1"))),
            change(ChangeKind::Modified, "a", Some(cert("a2"))),
        ];
        let b = [
            change(ChangeKind::Added, "b", Some(cert("b1"))),
            change(ChangeKind::Deleted, "b", None),
            change(ChangeKind::Added, "b", Some(cert("b2"))),
        ];

        let a_first = TrustCache::new();
        for event in a.iter().chain(b.iter()) {
            apply_event(&a_first, event);
        }

        let interleaved = TrustCache::new();
        for event in [&b[0], &a[0], &b[1], &a[1], &b[2]] {
            apply_event(&interleaved, event);
        }

        assert_eq!(a_first.snapshot(), interleaved.snapshot());
    }

    #[test]
    fn event_without_certificate_is_ignored() {
        let cache = TrustCache::new();
        cache.insert(&id("a"), &cert("a1"));

        let outcome = apply_event(&cache, &change(ChangeKind::Modified, "a", None));

        assert_eq!(outcome, ApplyOutcome::Ignored);
        assert_eq!(cache.get(&id("a")), Some(cert("a1")));
    }

    #[test]
    fn delete_of_unknown_identity_reports_nothing_removed() {
        let cache = TrustCache::new();
        let outcome = apply_event(&cache, &change(ChangeKind::Deleted, "ghost", None));
        assert_eq!(outcome, ApplyOutcome::Removed(false));
    }

    #[tokio::test]
    async fn streams_events_into_cache() {
        let mut store = MockIdentityStore::new();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        store.expect_watch().returning(move |revision| {
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                assert_eq!(revision, "10");
                let events = vec![
                    changed(at_revision(change(ChangeKind::Added, "a", Some(cert("a"))), "11")),
                    changed(at_revision(change(ChangeKind::Added, "b", Some(cert("b"))), "12")),
                ];
                Ok(futures::stream::iter(events).boxed())
            } else {
                Ok(futures::stream::pending().boxed())
            }
        });
        store.expect_list().never();

        let cache = Arc::new(TrustCache::new());
        let handle = ChangeWatcher::new(Arc::new(store), cache.clone(), fast_config())
            .spawn(Some("10".to_string()));

        wait_for(|| cache.len() == 2).await;
        handle.stop().await;
    }

    #[tokio::test]
    async fn resubscribes_from_last_revision_after_error() {
        let revisions = Arc::new(Mutex::new(Vec::new()));
        let mut store = MockIdentityStore::new();
        let seen = revisions.clone();
        store.expect_watch().returning(move |revision| {
            let mut seen = seen.lock();
            seen.push(revision.to_string());
            match seen.len() {
                1 => Ok(futures::stream::iter(vec![
                    changed(at_revision(change(ChangeKind::Added, "a", Some(cert("a"))), "5")),
                    Err(StoreError::stream_terminated("connection reset")),
                ])
                .boxed()),
                2 => Ok(futures::stream::iter(vec![changed(at_revision(
                    change(ChangeKind::Added, "b", Some(cert("b"))),
                    "6",
                ))])
                .chain(futures::stream::pending())
                .boxed()),
                _ => Ok(futures::stream::pending().boxed()),
            }
        });

        let cache = Arc::new(TrustCache::new());
        let handle = ChangeWatcher::new(Arc::new(store), cache.clone(), fast_config())
            .spawn(Some("1".to_string()));

        wait_for(|| cache.len() == 2).await;
        handle.stop().await;

        assert_eq!(revisions.lock()[..2], ["1".to_string(), "5".to_string()]);
    }

    #[tokio::test]
    async fn expired_revision_triggers_resync() {
        let revisions = Arc::new(Mutex::new(Vec::new()));
        let mut store = MockIdentityStore::new();
        let seen = revisions.clone();
        store.expect_watch().returning(move |revision| {
            let mut seen = seen.lock();
            seen.push(revision.to_string());
            if seen.len() == 1 {
                Ok(futures::stream::iter(vec![Err(StoreError::Expired {
                    revision: "1".to_string(),
                })])
                .boxed())
            } else {
                Ok(futures::stream::pending().boxed())
            }
        });
        store
            .expect_list()
            .times(1)
            .returning(|| Ok(listing(&["b"], "50")));
        store
            .expect_get()
            .returning(|node| Ok(record(node, Some(cert(node)), "49")));

        let cache = Arc::new(TrustCache::new());
        let handle = ChangeWatcher::new(Arc::new(store), cache.clone(), fast_config())
            .spawn(Some("1".to_string()));

        wait_for(|| cache.contains(&id("b"))).await;
        wait_for(|| revisions.lock().len() >= 2).await;
        handle.stop().await;

        assert_eq!(revisions.lock()[1], "50");
    }

    #[tokio::test]
    async fn no_revision_lists_before_watching() {
        let mut store = MockIdentityStore::new();
        store
            .expect_list()
            .times(1)
            .returning(|| Ok(listing(&["a"], "20")));
        store
            .expect_get()
            .returning(|node| Ok(record(node, Some(cert(node)), "19")));
        store
            .expect_watch()
            .withf(|revision| revision.to_string() == "20")
            .returning(|_| Ok(futures::stream::pending().boxed()));

        let cache = Arc::new(TrustCache::new());
        let handle =
            ChangeWatcher::new(Arc::new(store), cache.clone(), fast_config()).spawn(None);

        let mut state = handle.subscribe_state();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == WatchState::Streaming),
        )
        .await
        .expect("watcher reached streaming")
        .expect("state channel open");

        assert!(cache.contains(&id("a")));
        handle.stop().await;
    }

    #[tokio::test]
    async fn subscribe_failures_back_off_and_retry() {
        let attempts = Arc::new(AtomicU32::new(0));
        let mut store = MockIdentityStore::new();
        let a = attempts.clone();
        store.expect_watch().returning(move |_| {
            if a.fetch_add(1, Ordering::SeqCst) < 3 {
                Err(StoreError::unavailable("apiserver restarting"))
            } else {
                Ok(futures::stream::iter(vec![changed(change(
                    ChangeKind::Added,
                    "a",
                    Some(cert("a")),
                ))])
                .chain(futures::stream::pending())
                .boxed())
            }
        });

        let cache = Arc::new(TrustCache::new());
        let handle = ChangeWatcher::new(Arc::new(store), cache.clone(), fast_config())
            .spawn(Some("1".to_string()));

        wait_for(|| cache.contains(&id("a"))).await;
        handle.stop().await;

        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn no_mutation_after_stop() {
        let (tx, rx) = mpsc::channel::<Result<StoreEvent, StoreError>>(16);
        let rx = Mutex::new(Some(rx));
        let mut store = MockIdentityStore::new();
        store.expect_watch().returning(move |_| match rx.lock().take() {
            Some(rx) => Ok(ReceiverStream::new(rx).boxed()),
            None => Ok(futures::stream::pending().boxed()),
        });

        let cache = Arc::new(TrustCache::new());
        let handle = ChangeWatcher::new(Arc::new(store), cache.clone(), fast_config())
            .spawn(Some("1".to_string()));

        tx.send(changed(change(ChangeKind::Added, "a", Some(cert("a")))))
            .await
            .unwrap();
        wait_for(|| cache.contains(&id("a"))).await;

        let state = handle.subscribe_state();
        handle.stop().await;
        assert_eq!(*state.borrow(), WatchState::Stopped);

        // Late deliveries from the store must not reach the cache
        let _ = tx
            .send(changed(change(ChangeKind::Added, "b", Some(cert("b")))))
            .await;
        let _ = tx.send(changed(change(ChangeKind::Deleted, "a", None))).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(cache.identities(), vec![id("a")]);
    }

    #[tokio::test]
    async fn reconcile_policy_evicts_departed_nodes() {
        let mut store = MockIdentityStore::new();
        store
            .expect_watch()
            .returning(|_| Ok(futures::stream::pending().boxed()));
        store.expect_list().returning(|| Ok(listing(&["a"], "30")));
        store
            .expect_get()
            .returning(|node| Ok(record(node, Some(cert(node)), "29")));

        let cache = Arc::new(TrustCache::new());
        cache.insert(&id("a"), &cert("a"));
        cache.insert(&id("departed"), &cert("departed"));

        let config = WatchConfig {
            eviction: EvictionPolicy::Reconcile {
                interval: Duration::from_millis(10),
            },
            ..fast_config()
        };
        let handle =
            ChangeWatcher::new(Arc::new(store), cache.clone(), config).spawn(Some("1".to_string()));

        wait_for(|| !cache.contains(&id("departed"))).await;
        handle.stop().await;

        assert_eq!(cache.identities(), vec![id("a")]);
    }

    /// Store whose listing never answers; `watch` either never answers or
    /// yields a silent stream
    struct StalledStore {
        stall_watch: bool,
    }

    #[async_trait::async_trait]
    impl IdentityStore for StalledStore {
        async fn get(&self, node: &str) -> Result<crate::store::NodeRecord, StoreError> {
            Err(StoreError::not_found(node))
        }

        async fn list(&self) -> Result<crate::store::NodeListing, StoreError> {
            std::future::pending().await
        }

        async fn set(
            &self,
            _node: &str,
            _certificate: &crate::identity::Certificate,
            _revision: &str,
        ) -> Result<(), StoreError> {
            Ok(())
        }

        async fn watch(&self, _revision: &str) -> Result<ChangeStream, StoreError> {
            if self.stall_watch {
                std::future::pending().await
            } else {
                Ok(futures::stream::pending().boxed())
            }
        }
    }

    async fn wait_for_state(handle: &WatcherHandle, wanted: WatchState) {
        let mut state = handle.subscribe_state();
        tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == wanted))
            .await
            .expect("watcher reached state")
            .expect("state channel open");
    }

    async fn stops_promptly(handle: WatcherHandle) {
        tokio::time::timeout(Duration::from_secs(2), handle.stop())
            .await
            .expect("watcher stopped while a store call was pending");
    }

    #[tokio::test]
    async fn stop_while_subscribing_does_not_wait_for_store() {
        let cache = Arc::new(TrustCache::new());
        let handle = ChangeWatcher::new(
            Arc::new(StalledStore { stall_watch: true }),
            cache,
            fast_config(),
        )
        .spawn(Some("1".to_string()));

        wait_for_state(&handle, WatchState::Subscribing).await;
        let state = handle.subscribe_state();
        stops_promptly(handle).await;

        assert_eq!(*state.borrow(), WatchState::Stopped);
    }

    #[tokio::test]
    async fn stop_during_resync_does_not_wait_for_store() {
        let cache = Arc::new(TrustCache::new());
        let handle = ChangeWatcher::new(
            Arc::new(StalledStore { stall_watch: true }),
            cache,
            fast_config(),
        )
        .spawn(None);

        wait_for_state(&handle, WatchState::Subscribing).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        stops_promptly(handle).await;
    }

    #[tokio::test]
    async fn stop_during_reconcile_does_not_wait_for_store() {
        let cache = Arc::new(TrustCache::new());
        let config = WatchConfig {
            eviction: EvictionPolicy::Reconcile {
                interval: Duration::from_millis(5),
            },
            ..fast_config()
        };
        let handle = ChangeWatcher::new(Arc::new(StalledStore { stall_watch: false }), cache, config)
            .spawn(Some("1".to_string()));

        wait_for_state(&handle, WatchState::Streaming).await;
        // Let the first reconciliation start and stall on the listing
        tokio::time::sleep(Duration::from_millis(30)).await;
        stops_promptly(handle).await;
    }
}
