use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::store::{Store, StoreError};

/// After this many consecutive failures, retry logs escalate from `info`
/// to `error`. A departing member's ephemeral claim takes up to one
/// session timeout to vanish, so the first several failures during a
/// rebalance are expected noise.
pub const SAFE_CLAIM_RETRIES_COUNT: u32 = 10;

/// A release handle returned by a successful [`claim_partition`] call.
/// Dropping it without calling [`Release::release`] leaks the claim until
/// session expiry; callers are expected to call it explicitly.
pub struct Release {
    inner: Option<ReleaseInner>,
}

struct ReleaseInner {
    store: std::sync::Arc<dyn Store>,
    group: String,
    topic: String,
    partition: u32,
    retry_backoff: Duration,
    safe_claim_retries: u32,
}

impl Release {
    fn claimed(
        store: std::sync::Arc<dyn Store>,
        group: String,
        topic: String,
        partition: u32,
        retry_backoff: Duration,
        safe_claim_retries: u32,
    ) -> Self {
        Self {
            inner: Some(ReleaseInner {
                store,
                group,
                topic,
                partition,
                retry_backoff,
                safe_claim_retries,
            }),
        }
    }

    /// A release handle for a claim that was never actually acquired
    /// (e.g. the caller's cancel signal fired first). Calling
    /// [`Release::release`] on it is a no-op.
    pub fn noop() -> Self {
        Self { inner: None }
    }

    /// Releases the claim, retrying indefinitely on transient failure and
    /// tolerating "not claimed" as success. Not cancelable: cancelability
    /// here would let two members believe they hold the same partition.
    pub async fn release(self) {
        let Some(inner) = self.inner else {
            return;
        };

        let start = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            match inner
                .store
                .release_partition(&inner.group, &inner.topic, inner.partition)
                .await
            {
                Ok(()) => {
                    tracing::info!(
                        group = %inner.group,
                        topic = %inner.topic,
                        partition = inner.partition,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "partition released"
                    );
                    return;
                }
                Err(err) if err.is_not_claimed() => {
                    tracing::info!(
                        group = %inner.group,
                        topic = %inner.topic,
                        partition = inner.partition,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "release found partition already unclaimed"
                    );
                    return;
                }
                Err(err) => {
                    log_retry_failure(
                        "release",
                        &inner.group,
                        &inner.topic,
                        inner.partition,
                        attempt,
                        inner.safe_claim_retries,
                        start,
                        &err,
                    );
                    tokio::time::sleep(inner.retry_backoff).await;
                }
            }
        }
    }
}

fn log_retry_failure(
    op: &str,
    group: &str,
    topic: &str,
    partition: u32,
    attempt: u32,
    safe_claim_retries: u32,
    start: Instant,
    err: &StoreError,
) {
    let elapsed_ms = start.elapsed().as_millis() as u64;

    if attempt > safe_claim_retries {
        tracing::error!(
            group, topic, partition, attempt, elapsed_ms, error = %err,
            "{op} still failing after {attempt} attempts"
        );
    } else {
        tracing::info!(
            group, topic, partition, attempt, elapsed_ms, error = %err,
            "{op} attempt failed, retrying"
        );
    }
}

/// Blocks until the claim succeeds or `cancel` fires, retrying on
/// transient failure with `retry_backoff` between attempts. Returns a
/// release handle; if canceled before success the handle is a no-op.
pub async fn claim_partition(
    store: std::sync::Arc<dyn Store>,
    group: &str,
    topic: &str,
    partition: u32,
    member_id: &str,
    retry_backoff: Duration,
    safe_claim_retries: u32,
    mut cancel: oneshot::Receiver<()>,
) -> Release {
    let start = Instant::now();
    let attempts = AtomicU32::new(0);

    loop {
        let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;

        match store.claim_partition(group, topic, partition, member_id).await {
            Ok(()) => {
                tracing::info!(
                    group, topic, partition,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "partition claimed"
                );

                return Release::claimed(
                    store,
                    group.to_string(),
                    topic.to_string(),
                    partition,
                    retry_backoff,
                    safe_claim_retries,
                );
            }
            Err(err) => {
                log_retry_failure(
                    "claim",
                    group,
                    topic,
                    partition,
                    attempt,
                    safe_claim_retries,
                    start,
                    &err,
                );

                tokio::select! {
                    biased;

                    _ = &mut cancel => {
                        tracing::info!(
                            group, topic, partition,
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            "claim canceled"
                        );
                        return Release::noop();
                    }
                    _ = tokio::time::sleep(retry_backoff) => {}
                }
            }
        }
    }
}
