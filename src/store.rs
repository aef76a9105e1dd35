use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use zookeeper_async::{Acl, CreateMode, WatchedEvent, WatchedEventType, Watcher, ZooKeeper};

use crate::topic::{MemberId, Topic};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not registered")]
    NotRegistered,
    #[error("not claimed")]
    NotClaimed,
    #[error("transient store error: {0}")]
    Transient(String),
}

impl StoreError {
    pub fn is_not_registered(&self) -> bool {
        matches!(self, StoreError::NotRegistered)
    }

    pub fn is_not_claimed(&self) -> bool {
        matches!(self, StoreError::NotClaimed)
    }
}

/// Resolves exactly once, the next time a watched child set changes.
pub type WatchFuture = Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send>>;

/// The coordination-store operations the member coordinator and claim
/// arbitrator need. Implementations must be safe for concurrent use: the
/// event loop and every in-flight claim/release call share one instance.
#[async_trait]
pub trait Store: Send + Sync {
    /// Creates `/consumers/<group>` if absent. Idempotent.
    async fn ensure_group_exists(&self, group: &str) -> Result<(), StoreError>;

    /// Writes the ephemeral `/consumers/<group>/ids/<member_id>` znode
    /// with `topics` as its payload, creating it if absent.
    async fn register_member(
        &self,
        group: &str,
        member_id: &str,
        topics: &[Topic],
    ) -> Result<(), StoreError>;

    /// Removes `/consumers/<group>/ids/<member_id>`. `NotRegistered` is
    /// expected and must be surfaced rather than swallowed here, since
    /// callers decide whether that's a success.
    async fn deregister_member(&self, group: &str, member_id: &str) -> Result<(), StoreError>;

    /// Reads the topic-list payload of one member's znode. A single
    /// attempt; the caller (the event loop) is responsible for retrying.
    async fn fetch_member_topics(
        &self,
        group: &str,
        member_id: &str,
    ) -> Result<Vec<Topic>, StoreError>;

    /// Captures the current children of `/consumers/<group>/ids` and, in
    /// the same round trip, arms a watch for the next change. The
    /// returned future must be re-armed by calling this again once it
    /// resolves.
    async fn watch_member_ids(&self, group: &str) -> Result<(Vec<MemberId>, WatchFuture), StoreError>;

    /// Claims `/consumers/<group>/owners/<topic>/<partition>` for this
    /// member. A single attempt.
    async fn claim_partition(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        member_id: &str,
    ) -> Result<(), StoreError>;

    /// Releases a held claim. `NotClaimed` is expected and must be
    /// surfaced rather than swallowed here.
    async fn release_partition(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
    ) -> Result<(), StoreError>;
}

fn ids_path(group: &str) -> String {
    format!("/consumers/{}/ids", group)
}

fn member_path(group: &str, member_id: &str) -> String {
    format!("/consumers/{}/ids/{}", group, member_id)
}

fn owner_path(group: &str, topic: &str, partition: u32) -> String {
    format!("/consumers/{}/owners/{}/{}", group, topic, partition)
}

struct NoopWatcher;

impl Watcher for NoopWatcher {
    fn handle(&self, _event: WatchedEvent) {}
}

struct OneShotWatcher(std::sync::Mutex<Option<tokio::sync::oneshot::Sender<()>>>);

impl Watcher for OneShotWatcher {
    fn handle(&self, event: WatchedEvent) {
        if matches!(event.event_type, WatchedEventType::NodeChildrenChanged) {
            if let Some(tx) = self.0.lock().expect("watcher mutex poisoned").take() {
                let _ = tx.send(());
            }
        }
    }
}

/// A ZooKeeper-backed [`Store`]. Connection and session handling is
/// delegated entirely to `zookeeper-async`; this type only knows the
/// znode layout for groups, members, and partition owners.
pub struct ZkStore {
    zk: Arc<ZooKeeper>,
}

impl ZkStore {
    pub async fn connect(connect_string: &str, session_timeout: Duration) -> anyhow::Result<Self> {
        let zk = ZooKeeper::connect(connect_string, session_timeout, NoopWatcher).await?;

        Ok(Self { zk: Arc::new(zk) })
    }

    async fn create_persistent(&self, path: &str) -> Result<(), StoreError> {
        match self
            .zk
            .create(
                path,
                Vec::new(),
                Acl::open_unsafe().clone(),
                CreateMode::Persistent,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(zookeeper_async::ZkError::NodeExists) => Ok(()),
            Err(err) => Err(StoreError::Transient(err.to_string())),
        }
    }
}

#[async_trait]
impl Store for ZkStore {
    async fn ensure_group_exists(&self, group: &str) -> Result<(), StoreError> {
        self.create_persistent(&format!("/consumers/{}", group))
            .await?;
        self.create_persistent(&ids_path(group)).await
    }

    async fn register_member(
        &self,
        group: &str,
        member_id: &str,
        topics: &[Topic],
    ) -> Result<(), StoreError> {
        let payload = topics.join(",").into_bytes();
        let path = member_path(group, member_id);

        match self
            .zk
            .create(
                &path,
                payload.clone(),
                Acl::open_unsafe().clone(),
                CreateMode::Ephemeral,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(zookeeper_async::ZkError::NodeExists) => self
                .zk
                .set_data(&path, payload, None)
                .await
                .map(|_| ())
                .map_err(|err| StoreError::Transient(err.to_string())),
            Err(err) => Err(StoreError::Transient(err.to_string())),
        }
    }

    async fn deregister_member(&self, group: &str, member_id: &str) -> Result<(), StoreError> {
        match self.zk.delete(&member_path(group, member_id), None).await {
            Ok(()) => Ok(()),
            Err(zookeeper_async::ZkError::NoNode) => Err(StoreError::NotRegistered),
            Err(err) => Err(StoreError::Transient(err.to_string())),
        }
    }

    async fn fetch_member_topics(
        &self,
        group: &str,
        member_id: &str,
    ) -> Result<Vec<Topic>, StoreError> {
        let (payload, _) = self
            .zk
            .get_data(&member_path(group, member_id), false)
            .await
            .map_err(|err| match err {
                zookeeper_async::ZkError::NoNode => StoreError::NotRegistered,
                other => StoreError::Transient(other.to_string()),
            })?;

        let text = String::from_utf8_lossy(&payload);
        Ok(text
            .split(',')
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect())
    }

    async fn watch_member_ids(
        &self,
        group: &str,
    ) -> Result<(Vec<MemberId>, WatchFuture), StoreError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let watcher = OneShotWatcher(std::sync::Mutex::new(Some(tx)));

        let children = self
            .zk
            .get_children_w(&ids_path(group), watcher)
            .await
            .map_err(|err| StoreError::Transient(err.to_string()))?;

        let fut: WatchFuture = Box::pin(async move {
            rx.await
                .map_err(|_| StoreError::Transient("watch channel dropped".to_string()))
        });

        Ok((children, fut))
    }

    async fn claim_partition(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        member_id: &str,
    ) -> Result<(), StoreError> {
        match self
            .zk
            .create(
                &owner_path(group, topic, partition),
                member_id.as_bytes().to_vec(),
                Acl::open_unsafe().clone(),
                CreateMode::Ephemeral,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(zookeeper_async::ZkError::NodeExists) => Err(StoreError::Transient(
                "partition already claimed".to_string(),
            )),
            Err(err) => Err(StoreError::Transient(err.to_string())),
        }
    }

    async fn release_partition(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
    ) -> Result<(), StoreError> {
        match self
            .zk
            .delete(&owner_path(group, topic, partition), None)
            .await
        {
            Ok(()) => Ok(()),
            Err(zookeeper_async::ZkError::NoNode) => Err(StoreError::NotClaimed),
            Err(err) => Err(StoreError::Transient(err.to_string())),
        }
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct Inner {
        members: Mutex<BTreeMap<String, BTreeMap<MemberId, Vec<Topic>>>>,
        owners: Mutex<BTreeSet<(String, String, u32)>>,
        generation: AtomicU64,
        watch_notify: Notify,
    }

    impl Inner {
        fn bump_generation(&self) {
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.watch_notify.notify_waiters();
        }
    }

    /// An in-memory [`Store`] double used by this crate's own tests. Not
    /// concurrency-safe in the sense of modeling ZooKeeper's linearizable
    /// guarantees precisely, but sufficient to drive the coordinator and
    /// claim arbitrator exactly as a real store would. Holds its state
    /// behind an `Arc` so the watch future returned by `watch_member_ids`
    /// can outlive the borrow of `&self` that produced it.
    #[derive(Default)]
    pub struct MemoryStore {
        inner: Arc<Inner>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Test-only helper: register a peer member directly, as if
        /// another coordinator process had done so.
        pub fn put_member(&self, group: &str, member_id: &str, topics: Vec<Topic>) {
            self.inner
                .members
                .lock()
                .unwrap()
                .entry(group.to_string())
                .or_default()
                .insert(member_id.to_string(), topics);

            self.inner.bump_generation();
        }

        pub fn remove_member(&self, group: &str, member_id: &str) {
            if let Some(group_members) = self.inner.members.lock().unwrap().get_mut(group) {
                group_members.remove(member_id);
            }

            self.inner.bump_generation();
        }

        pub fn is_claimed(&self, group: &str, topic: &str, partition: u32) -> bool {
            self.inner
                .owners
                .lock()
                .unwrap()
                .contains(&(group.to_string(), topic.to_string(), partition))
        }

        pub fn has_member(&self, group: &str, member_id: &str) -> bool {
            self.inner
                .members
                .lock()
                .unwrap()
                .get(group)
                .map(|g| g.contains_key(member_id))
                .unwrap_or(false)
        }
    }

    #[async_trait]
    impl Store for MemoryStore {
        async fn ensure_group_exists(&self, group: &str) -> Result<(), StoreError> {
            self.inner
                .members
                .lock()
                .unwrap()
                .entry(group.to_string())
                .or_default();
            Ok(())
        }

        async fn register_member(
            &self,
            group: &str,
            member_id: &str,
            topics: &[Topic],
        ) -> Result<(), StoreError> {
            self.put_member(group, member_id, topics.to_vec());
            Ok(())
        }

        async fn deregister_member(&self, group: &str, member_id: &str) -> Result<(), StoreError> {
            let mut members = self.inner.members.lock().unwrap();
            let existed = members
                .get_mut(group)
                .and_then(|g| g.remove(member_id))
                .is_some();
            drop(members);

            self.inner.bump_generation();

            if existed {
                Ok(())
            } else {
                Err(StoreError::NotRegistered)
            }
        }

        async fn fetch_member_topics(
            &self,
            group: &str,
            member_id: &str,
        ) -> Result<Vec<Topic>, StoreError> {
            self.inner
                .members
                .lock()
                .unwrap()
                .get(group)
                .and_then(|g| g.get(member_id).cloned())
                .ok_or(StoreError::NotRegistered)
        }

        async fn watch_member_ids(
            &self,
            group: &str,
        ) -> Result<(Vec<MemberId>, WatchFuture), StoreError> {
            let baseline = self.inner.generation.load(Ordering::SeqCst);
            let children: Vec<MemberId> = self
                .inner
                .members
                .lock()
                .unwrap()
                .get(group)
                .map(|g| g.keys().cloned().collect())
                .unwrap_or_default();

            let inner = self.inner.clone();
            let fut: WatchFuture = Box::pin(async move {
                loop {
                    let notified = inner.watch_notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();

                    if inner.generation.load(Ordering::SeqCst) != baseline {
                        return Ok(());
                    }

                    notified.await;

                    if inner.generation.load(Ordering::SeqCst) != baseline {
                        return Ok(());
                    }
                }
            });

            Ok((children, fut))
        }

        async fn claim_partition(
            &self,
            group: &str,
            topic: &str,
            partition: u32,
            _member_id: &str,
        ) -> Result<(), StoreError> {
            let key = (group.to_string(), topic.to_string(), partition);
            let mut owners = self.inner.owners.lock().unwrap();

            if owners.contains(&key) {
                Err(StoreError::Transient(
                    "partition already claimed".to_string(),
                ))
            } else {
                owners.insert(key);
                Ok(())
            }
        }

        async fn release_partition(
            &self,
            group: &str,
            topic: &str,
            partition: u32,
        ) -> Result<(), StoreError> {
            let key = (group.to_string(), topic.to_string(), partition);

            if self.inner.owners.lock().unwrap().remove(&key) {
                Ok(())
            } else {
                Err(StoreError::NotClaimed)
            }
        }
    }
}
