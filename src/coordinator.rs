use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::claim::{self, Release};
use crate::store::{Store, StoreError, WatchFuture};
use crate::topic::{self, GroupSnapshot, MemberId, Topic};

/// `(clusterRef, groupName, memberID)`, immutable for the coordinator's
/// lifetime. The store paths derive deterministically from this tuple.
#[derive(Debug, Clone)]
pub struct GroupIdentity {
    pub cluster: String,
    pub group: String,
    pub member_id: String,
}

/// A handle to a running member coordinator. Cloning is not supported,
/// since `submit`/`stop` each require exclusive access to their channel
/// ends, matching a single-task-owns-one-channel handle shape (one
/// task, one owner).
pub struct Coordinator {
    identity: Arc<GroupIdentity>,
    store: Arc<dyn Store>,
    retry_backoff: Duration,
    safe_claim_retries: u32,
    submit_tx: mpsc::UnboundedSender<Vec<Topic>>,
    subscriptions_rx: mpsc::Receiver<GroupSnapshot>,
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl Coordinator {
    /// Starts the event-loop task and returns a handle to it.
    pub fn spawn(
        identity: GroupIdentity,
        store: Arc<dyn Store>,
        retry_backoff: Duration,
        rebalance_delay: Duration,
    ) -> Self {
        Self::spawn_with_safe_claim_retries(
            identity,
            store,
            retry_backoff,
            rebalance_delay,
            claim::SAFE_CLAIM_RETRIES_COUNT,
        )
    }

    /// Like [`Coordinator::spawn`], but with the
    /// `safeClaimRetriesCount` log-escalation threshold overridden: the
    /// configurable retry-count threshold, rather than its default.
    pub fn spawn_with_safe_claim_retries(
        identity: GroupIdentity,
        store: Arc<dyn Store>,
        retry_backoff: Duration,
        rebalance_delay: Duration,
        safe_claim_retries: u32,
    ) -> Self {
        let identity = Arc::new(identity);
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        let (subscriptions_tx, subscriptions_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = oneshot::channel();

        let actor = CoordinatorActor {
            identity: identity.clone(),
            store: store.clone(),
            retry_backoff,
            rebalance_delay,
            submit_rx,
            output_tx: subscriptions_tx,
            stop_rx,
            current_topics: None,
            emitted: GroupSnapshot::default(),
            pending_snapshot: None,
            pending_topics: None,
            members: Vec::new(),
            should_submit_topics: false,
            should_fetch_members: false,
            should_fetch_subscriptions: false,
            watch_fut: None,
            debounce_deadline: None,
            retry_deadline: None,
        };

        let join_handle = tokio::spawn(actor.run());

        Self {
            identity,
            store,
            retry_backoff,
            safe_claim_retries,
            submit_tx,
            subscriptions_rx,
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        }
    }

    /// Non-blocking transfer of a desired topic list. An empty list means
    /// "unsubscribe from everything, but remain alive". Successive
    /// submits replace earlier ones.
    pub fn submit(&self, topics: Vec<Topic>) {
        // The event loop only ever stops reading this channel once it has
        // already torn itself down, at which point a dropped submit is
        // simply undefined behavior after stop.
        let _ = self.submit_tx.send(topics);
    }

    /// The receive-only channel of [`GroupSnapshot`]s. Callers must drain
    /// it promptly; the coordinator coalesces updates when they don't.
    pub fn subscriptions(&mut self) -> &mut mpsc::Receiver<GroupSnapshot> {
        &mut self.subscriptions_rx
    }

    /// Blocks until the claim succeeds or `cancel` fires. Independent of
    /// the event loop: this call shares only the store client.
    pub async fn claim_partition(
        &self,
        topic: &str,
        partition: u32,
        cancel: oneshot::Receiver<()>,
    ) -> Release {
        claim::claim_partition(
            self.store.clone(),
            &self.identity.group,
            topic,
            partition,
            &self.identity.member_id,
            self.retry_backoff,
            self.safe_claim_retries,
            cancel,
        )
        .await
    }

    /// Requests shutdown and blocks until the event loop has fully
    /// stopped, its registration is removed, and the subscriptions
    /// channel is closed. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }

        if let Some(handle) = self.join_handle.take() {
            let _ = handle.await;
        }
    }
}

struct CoordinatorActor {
    identity: Arc<GroupIdentity>,
    store: Arc<dyn Store>,
    retry_backoff: Duration,
    rebalance_delay: Duration,

    submit_rx: mpsc::UnboundedReceiver<Vec<Topic>>,
    output_tx: mpsc::Sender<GroupSnapshot>,
    stop_rx: oneshot::Receiver<()>,

    current_topics: Option<Vec<Topic>>,
    emitted: GroupSnapshot,
    pending_snapshot: Option<GroupSnapshot>,
    pending_topics: Option<Vec<Topic>>,
    members: Vec<MemberId>,

    should_submit_topics: bool,
    should_fetch_members: bool,
    should_fetch_subscriptions: bool,

    watch_fut: Option<WatchFuture>,
    debounce_deadline: Option<Instant>,
    retry_deadline: Option<Instant>,
}

/// Awaits `fut` if present, otherwise never resolves. Lets an optional
/// long-lived future sit in a `tokio::select!` branch without restarting
/// it on every loop iteration.
async fn wait_watch(fut: &mut Option<WatchFuture>) -> Result<(), StoreError> {
    match fut.as_mut() {
        Some(f) => f.await,
        None => std::future::pending().await,
    }
}

async fn send_pending(
    tx: &mpsc::Sender<GroupSnapshot>,
    pending: &Option<GroupSnapshot>,
) -> Result<(), ()> {
    match pending {
        Some(snapshot) => tx.send(snapshot.clone()).await.map_err(|_| ()),
        None => std::future::pending().await,
    }
}

fn deadline_or_far_future(deadline: Option<Instant>) -> impl Future<Output = ()> {
    tokio::time::sleep_until(deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600)))
}

impl CoordinatorActor {
    async fn run(mut self) {
        // Retried indefinitely with backoff, same as any other store
        // write; the parent znode must exist before members can register
        // under it.
        loop {
            match self.store.ensure_group_exists(&self.identity.group).await {
                Ok(()) => break,
                Err(err) => {
                    tracing::error!(
                        group = %self.identity.group,
                        error = %err,
                        "failed to ensure group path exists, retrying"
                    );

                    tokio::select! {
                        biased;
                        _ = &mut self.stop_rx => return,
                        _ = tokio::time::sleep(self.retry_backoff) => {}
                    }
                }
            }
        }

        loop {
            tokio::select! {
                biased;

                _ = &mut self.stop_rx => break,

                maybe_topics = self.submit_rx.recv() => {
                    match maybe_topics {
                        Some(topics) => self.on_submit(topics),
                        None => break,
                    }
                }

                res = wait_watch(&mut self.watch_fut), if self.watch_fut.is_some() => {
                    self.watch_fut = None;
                    match res {
                        Ok(()) => self.should_fetch_members = true,
                        Err(err) => self.arm_retry("watch", err),
                    }
                }

                _ = deadline_or_far_future(self.debounce_deadline), if self.debounce_deadline.is_some() => {
                    self.debounce_deadline = None;
                }

                _ = deadline_or_far_future(self.retry_deadline), if self.retry_deadline.is_some() => {
                    self.retry_deadline = None;
                }

                res = send_pending(&self.output_tx, &self.pending_snapshot) => {
                    match res {
                        Ok(()) => {
                            self.emitted = self.pending_snapshot.take().expect("armed send implies Some");
                        }
                        Err(()) => break,
                    }
                }
            }

            self.advance().await;
        }

        self.shutdown().await;
    }

    fn on_submit(&mut self, topics: Vec<Topic>) {
        let canonical = topic::canonicalize(&topics).unwrap_or_default();

        self.pending_topics = Some(canonical.clone());
        self.should_submit_topics = !topic::topics_equal(
            &canonical,
            self.current_topics.as_deref().unwrap_or_default(),
        );
    }

    /// Runs the highest-priority pending step, in the fixed order
    /// submit → fetch members → fetch subscriptions. A store error aborts
    /// the cascade for this iteration and arms the retry timer; the
    /// booleans that triggered the aborted step are left set so the next
    /// attempt resumes where it failed.
    async fn advance(&mut self) {
        if self.should_submit_topics {
            if let Err(err) = self.do_submit_step().await {
                self.arm_retry("submit", err);
                return;
            }
        }

        if self.should_fetch_members {
            if let Err(err) = self.do_fetch_members_step().await {
                self.arm_retry("fetch-members", err);
                return;
            }
        }

        if self.should_fetch_subscriptions && self.debounce_deadline.is_none() {
            if let Err(err) = self.do_fetch_subscriptions_step().await {
                self.arm_retry("fetch-subscriptions", err);
            }
        }
    }

    fn arm_retry(&mut self, op: &str, err: StoreError) {
        tracing::warn!(
            group = %self.identity.group,
            member_id = %self.identity.member_id,
            error = %err,
            "{op} failed, retrying after backoff"
        );

        self.retry_deadline = Some(Instant::now() + self.retry_backoff);
    }

    fn is_currently_registered(&self) -> bool {
        self.current_topics
            .as_deref()
            .is_some_and(|topics| !topics.is_empty())
    }

    async fn do_submit_step(&mut self) -> Result<(), StoreError> {
        let start = Instant::now();
        let pending = self.pending_topics.clone().unwrap_or_default();

        if self.is_currently_registered() {
            match self
                .store
                .deregister_member(&self.identity.group, &self.identity.member_id)
                .await
            {
                Ok(()) | Err(StoreError::NotRegistered) => {}
                Err(err) => return Err(err),
            }
        }

        if !pending.is_empty() {
            self.store
                .register_member(&self.identity.group, &self.identity.member_id, &pending)
                .await?;
        }

        tracing::info!(
            group = %self.identity.group,
            member_id = %self.identity.member_id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "submitted topic list"
        );

        self.current_topics = self.pending_topics.take();
        self.should_submit_topics = false;
        self.should_fetch_members = true;

        Ok(())
    }

    async fn do_fetch_members_step(&mut self) -> Result<(), StoreError> {
        let start = Instant::now();

        let (members, watch_fut) = self
            .store
            .watch_member_ids(&self.identity.group)
            .await?;

        tracing::info!(
            group = %self.identity.group,
            member_id = %self.identity.member_id,
            member_count = members.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "fetched member list"
        );

        self.members = members;
        self.watch_fut = Some(watch_fut);
        self.should_fetch_members = false;
        self.should_fetch_subscriptions = true;
        self.debounce_deadline = Some(Instant::now() + self.rebalance_delay);

        Ok(())
    }

    async fn do_fetch_subscriptions_step(&mut self) -> Result<(), StoreError> {
        let start = Instant::now();
        let mut snapshot = BTreeMap::new();

        for member_id in &self.members {
            let topics = if member_id == &self.identity.member_id {
                self.current_topics.clone().unwrap_or_default()
            } else {
                match self
                    .store
                    .fetch_member_topics(&self.identity.group, member_id)
                    .await
                {
                    Ok(topics) => topics,
                    Err(err) if err.is_not_registered() => continue,
                    Err(err) => return Err(err),
                }
            };

            let canonical = topic::canonicalize(&topics).unwrap_or_default();
            snapshot.insert(member_id.clone(), canonical);
        }

        self.should_fetch_subscriptions = false;

        let snapshot = GroupSnapshot::new(snapshot);
        if topic::snapshot_equal(&snapshot, &self.emitted) {
            tracing::info!(
                group = %self.identity.group,
                member_id = %self.identity.member_id,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "redundant group update ignored"
            );
        } else {
            tracing::info!(
                group = %self.identity.group,
                member_id = %self.identity.member_id,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "computed new group snapshot"
            );
            self.pending_snapshot = Some(snapshot);
        }

        Ok(())
    }

    async fn shutdown(mut self) {
        if self.is_currently_registered() {
            match self
                .store
                .deregister_member(&self.identity.group, &self.identity.member_id)
                .await
            {
                Ok(()) | Err(StoreError::NotRegistered) => {}
                Err(err) => {
                    tracing::error!(
                        group = %self.identity.group,
                        member_id = %self.identity.member_id,
                        error = %err,
                        "failed to deregister on shutdown; relying on session expiry"
                    );
                }
            }
        }

        // Dropping `self.output_tx` here closes the subscriptions channel
        // exactly once, after the coordinator has fully stopped.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::MemoryStore;

    fn identity() -> GroupIdentity {
        GroupIdentity {
            cluster: "test-cluster".to_string(),
            group: "g".to_string(),
            member_id: "self".to_string(),
        }
    }

    fn fast_durations() -> (Duration, Duration) {
        (Duration::from_millis(10), Duration::from_millis(30))
    }

    #[tokio::test]
    async fn solo_member_steady_state() {
        let store = Arc::new(MemoryStore::new());
        let (retry, rebalance) = fast_durations();
        let mut coord = Coordinator::spawn(identity(), store, retry, rebalance);

        coord.submit(vec!["x".to_string(), "y".to_string()]);

        let snapshot = coord.subscriptions().recv().await.unwrap();
        assert_eq!(snapshot.get("self"), Some(&["x".to_string(), "y".to_string()][..]));
        assert_eq!(snapshot.len(), 1);

        // Same set, different order: must not produce a new snapshot.
        coord.submit(vec!["y".to_string(), "x".to_string()]);

        let next = tokio::time::timeout(Duration::from_millis(200), coord.subscriptions().recv()).await;
        assert!(next.is_err(), "expected no new snapshot for a reordered-but-equal submit");

        coord.stop().await;
    }

    #[tokio::test]
    async fn peer_join_produces_combined_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let (retry, rebalance) = fast_durations();
        let mut coord = Coordinator::spawn(identity(), Arc::clone(&store) as Arc<dyn Store>, retry, rebalance);

        coord.submit(vec!["a".to_string()]);
        let first = coord.subscriptions().recv().await.unwrap();
        assert_eq!(first.len(), 1);

        store.put_member("g", "m2", vec!["a".to_string(), "b".to_string()]);

        let second = coord.subscriptions().recv().await.unwrap();
        assert_eq!(second.get("self"), Some(&["a".to_string()][..]));
        assert_eq!(
            second.get("m2"),
            Some(&["a".to_string(), "b".to_string()][..])
        );

        coord.stop().await;
    }

    #[tokio::test]
    async fn flap_during_debounce_yields_one_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let (retry, rebalance) = (Duration::from_millis(10), Duration::from_millis(80));
        let mut coord = Coordinator::spawn(identity(), Arc::clone(&store) as Arc<dyn Store>, retry, rebalance);

        coord.submit(vec!["a".to_string()]);
        let _first = coord.subscriptions().recv().await.unwrap();

        store.put_member("g", "m2", vec!["a".to_string(), "b".to_string()]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.remove_member("g", "m2");
        store.put_member("g", "m2", vec!["c".to_string()]);

        let second = coord.subscriptions().recv().await.unwrap();
        assert_eq!(second.get("m2"), Some(&["c".to_string()][..]));

        let extra = tokio::time::timeout(Duration::from_millis(150), coord.subscriptions().recv()).await;
        assert!(extra.is_err(), "flap must coalesce into exactly one subsequent snapshot");

        coord.stop().await;
    }

    #[tokio::test]
    async fn stop_deregisters_and_closes_channel() {
        let store = Arc::new(MemoryStore::new());
        let (retry, rebalance) = fast_durations();
        let mut coord = Coordinator::spawn(identity(), Arc::clone(&store) as Arc<dyn Store>, retry, rebalance);

        coord.submit(vec!["q".to_string()]);
        let _ = coord.subscriptions().recv().await.unwrap();

        coord.stop().await;

        assert_eq!(coord.subscriptions().recv().await, None);
        assert!(!store.has_member("g", "self"));
    }
}
