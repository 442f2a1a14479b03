//! Subscription read loops.
//!
//! Each subscription runs two background tasks: one over the primary
//! stream and one over its paired retry stream. A loop blocks on the
//! store for a batch, dispatches to the handler concurrently, then acks
//! successes and dead-letters in a single batched call. Failed messages
//! are rescheduled by a spawned timer task that appends to the retry
//! stream and acks the original entry itself, so a slow retry never
//! stalls the batch. A periodic sweep reclaims entries left pending past
//! an idle bound and feeds them back through dispatch, so a consumer
//! crash or a failed retry append never strands a message.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde_json::json;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::dlq::DeadLetterStore;
use crate::envelope::{DeadLetterRecord, EventEnvelope, RetryEnvelope, RetryPolicy};
use crate::lifecycle::LifecycleEvent;
use crate::store::{EntryId, Retention, StartFrom, StoredEntry, StreamStore, WireEntry};
use crate::BusError;

use super::{BrokerCounters, EventHandler};

/// Read-error backoff bounds for a subscription loop.
const READ_BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const READ_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Subscribe-time options. Unset fields fall back to configured defaults.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Where a newly created consumer group starts. Existing groups keep
    /// their cursor.
    pub start_from: StartFrom,
    pub batch_size: Option<usize>,
    pub block_timeout_ms: Option<u64>,
    pub consumer_name: Option<String>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            start_from: StartFrom::Latest,
            batch_size: None,
            block_timeout_ms: None,
            consumer_name: None,
        }
    }
}

/// Opaque handle identifying a live subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    pub id: Uuid,
    pub event_type: String,
    pub group: String,
}

/// Shared state a read loop needs, cloned into each spawned task.
#[derive(Clone)]
pub(super) struct SubscriptionContext {
    pub store: Arc<dyn StreamStore>,
    pub lifecycle_tx: broadcast::Sender<LifecycleEvent>,
    pub counters: Arc<BrokerCounters>,
    pub dead_letters: DeadLetterStore,
    pub dead_letter_enabled: bool,
    pub default_retry: RetryPolicy,
    pub event_type: String,
    pub group: String,
    pub batch_size: usize,
    pub block: Duration,
    pub reclaim_interval: Duration,
    pub reclaim_min_idle: Duration,
    /// Retention applied to the retry stream after each retry append.
    pub retry_retention: Retention,
    pub handler: Arc<dyn EventHandler>,
}

impl SubscriptionContext {
    fn emit(&self, event: LifecycleEvent) {
        let _ = self.lifecycle_tx.send(event);
    }
}

/// Drive one consumer loop until the stop signal flips.
///
/// `stream` is the stream being read; `retry_stream` is where failed
/// messages are rescheduled (the retry stream reads and reschedules onto
/// itself). In-flight batches run to completion after stop is signalled.
pub(super) async fn run_loop(
    ctx: SubscriptionContext,
    stream: String,
    retry_stream: String,
    consumer: String,
    is_retry: bool,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut backoff = READ_BACKOFF_INITIAL;
    let mut next_reclaim = tokio::time::Instant::now() + ctx.reclaim_interval;
    loop {
        if *stop_rx.borrow() {
            break;
        }
        if tokio::time::Instant::now() >= next_reclaim {
            next_reclaim = tokio::time::Instant::now() + ctx.reclaim_interval;
            reclaim_stale(&ctx, &stream, &retry_stream, &consumer, is_retry).await;
        }
        let read = tokio::select! {
            _ = stop_rx.changed() => continue,
            r = ctx.store.read_group(
                &stream,
                &ctx.group,
                &consumer,
                ctx.batch_size,
                ctx.block,
            ) => r,
        };

        let batch = match read {
            Ok(batch) => {
                backoff = READ_BACKOFF_INITIAL;
                batch
            }
            Err(e) => {
                ctx.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    stream = %stream,
                    group = %ctx.group,
                    error = %e,
                    "Stream read failed, backing off"
                );
                ctx.emit(LifecycleEvent::StoreError {
                    context: format!("read_group {}", stream),
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
                tokio::select! {
                    _ = stop_rx.changed() => {}
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(READ_BACKOFF_MAX);
                continue;
            }
        };
        if batch.is_empty() {
            continue;
        }
        process_batch(&ctx, &stream, &retry_stream, is_retry, batch).await;
    }
    debug!(stream = %stream, group = %ctx.group, "Consumer loop stopped");
}

/// Dispatch a batch concurrently, then ack the resolved entries in one
/// call. Entries owned by a spawned retry task are acked there.
async fn process_batch(
    ctx: &SubscriptionContext,
    stream: &str,
    retry_stream: &str,
    is_retry: bool,
    batch: Vec<StoredEntry>,
) {
    let outcomes = join_all(
        batch
            .into_iter()
            .map(|entry| dispatch(ctx, stream, retry_stream, is_retry, entry)),
    )
    .await;

    let ack_ids: Vec<EntryId> = outcomes.into_iter().flatten().collect();
    if !ack_ids.is_empty() {
        if let Err(e) = ctx.store.ack(stream, &ctx.group, &ack_ids).await {
            ctx.counters.store_errors.fetch_add(1, Ordering::Relaxed);
            warn!(stream = %stream, group = %ctx.group, error = %e, "Batch ack failed");
        }
    }
}

/// Sweep entries stranded in the group's pending list (a consumer died
/// between read and ack, or a retry append failed) back through dispatch.
async fn reclaim_stale(
    ctx: &SubscriptionContext,
    stream: &str,
    retry_stream: &str,
    consumer: &str,
    is_retry: bool,
) {
    let batch = match ctx
        .store
        .claim_pending(stream, &ctx.group, consumer, ctx.reclaim_min_idle, ctx.batch_size)
        .await
    {
        Ok(batch) => batch,
        Err(e) => {
            ctx.counters.store_errors.fetch_add(1, Ordering::Relaxed);
            warn!(stream = %stream, group = %ctx.group, error = %e, "Pending reclaim failed");
            return;
        }
    };
    if batch.is_empty() {
        return;
    }
    warn!(
        stream = %stream,
        group = %ctx.group,
        count = batch.len(),
        "Redelivering stale pending entries"
    );
    process_batch(ctx, stream, retry_stream, is_retry, batch).await;
}

/// Handle one entry. Returns the entry id if it should be acked in the
/// batch; `None` when a spawned retry task owns the ack.
async fn dispatch(
    ctx: &SubscriptionContext,
    stream: &str,
    retry_stream: &str,
    is_retry: bool,
    stored: StoredEntry,
) -> Option<EntryId> {
    let (envelope, retry_count) = match decode(&stored.entry, is_retry) {
        Ok(decoded) => decoded,
        Err(e) => {
            // Undecodable entries go straight to the dead-letter store
            // wrapped in a synthetic envelope, so the raw payload stays
            // inspectable.
            error!(stream = %stream, id = %stored.id, error = %e, "Corrupt stream entry");
            if ctx.dead_letter_enabled {
                let record = DeadLetterRecord {
                    original_id: Uuid::new_v4(),
                    event_type: ctx.event_type.clone(),
                    envelope: EventEnvelope::new(
                        &ctx.event_type,
                        &stored.entry.source,
                        json!({ "raw": stored.entry.payload }),
                    ),
                    error: format!("corrupt entry: {}", e),
                    retry_count: 0,
                    dead_lettered_at: Utc::now(),
                    retention_seconds: ctx.dead_letters.retention_seconds(),
                };
                if let Err(e) = ctx.dead_letters.write(&record).await {
                    warn!(error = %e, "Dead-letter write failed for corrupt entry");
                }
            }
            return Some(stored.id);
        }
    };

    let now = Utc::now();
    if envelope.is_expired(now) {
        warn!(
            id = %envelope.id,
            event_type = %envelope.event_type,
            "Dropping expired message"
        );
        return Some(stored.id);
    }

    let envelope = Arc::new(envelope);
    match ctx.handler.handle(Arc::clone(&envelope)).await {
        Ok(()) => {
            ctx.counters.consumed.fetch_add(1, Ordering::Relaxed);
            ctx.emit(LifecycleEvent::Consumed {
                id: envelope.id,
                event_type: envelope.event_type.clone(),
                group: ctx.group.clone(),
                timestamp: Utc::now(),
            });
            Some(stored.id)
        }
        Err(e) => {
            let error = match e {
                failure @ BusError::Handler { .. } => failure,
                other => BusError::Handler {
                    group: ctx.group.clone(),
                    message: other.to_string(),
                },
            };
            let attempts = retry_count + 1;
            ctx.counters.failed.fetch_add(1, Ordering::Relaxed);
            ctx.emit(LifecycleEvent::HandlerFailed {
                id: envelope.id,
                event_type: envelope.event_type.clone(),
                group: ctx.group.clone(),
                error: error.to_string(),
                retry_count: attempts,
                timestamp: Utc::now(),
            });

            let policy = envelope.effective_retry_policy(&ctx.default_retry);
            if policy.should_retry(attempts) {
                schedule_retry(
                    ctx.clone(),
                    stream.to_string(),
                    retry_stream.to_string(),
                    stored.id,
                    (*envelope).clone(),
                    attempts,
                    error.to_string(),
                    policy.delay_for(retry_count),
                );
                None
            } else {
                dead_letter(ctx, &envelope, attempts, error.to_string()).await;
                Some(stored.id)
            }
        }
    }
}

/// Decode a wire entry into its envelope and prior retry count.
fn decode(entry: &WireEntry, is_retry: bool) -> crate::Result<(EventEnvelope, u32)> {
    if is_retry {
        let retry: RetryEnvelope = serde_json::from_str(&entry.payload)?;
        Ok((retry.envelope, retry.retry_count))
    } else {
        let envelope: EventEnvelope = serde_json::from_str(&entry.payload)?;
        Ok((envelope, 0))
    }
}

/// Spawn the delayed redelivery task: sleep the backoff, append the retry
/// envelope, then ack the original entry. The original stays pending
/// until the retry is durably appended.
#[allow(clippy::too_many_arguments)]
fn schedule_retry(
    ctx: SubscriptionContext,
    stream: String,
    retry_stream: String,
    entry_id: EntryId,
    envelope: EventEnvelope,
    attempts: u32,
    error: String,
    delay: Duration,
) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;

        let retry = RetryEnvelope {
            original_id: envelope.id,
            retry_count: attempts,
            last_error: error,
            next_attempt_at: Utc::now(),
            envelope,
        };
        let wire = match serde_json::to_string(&retry) {
            Ok(payload) => WireEntry {
                payload,
                priority: retry.envelope.priority.as_str().to_string(),
                source: retry.envelope.source.clone(),
            },
            Err(e) => {
                error!(id = %retry.original_id, error = %e, "Retry envelope serialization failed");
                return;
            }
        };

        match ctx.store.append(&retry_stream, wire).await {
            Ok(_) => {
                if let Err(e) = ctx.store.ack(&stream, &ctx.group, &[entry_id]).await {
                    warn!(id = %retry.original_id, error = %e, "Ack after retry append failed");
                }
                if let Err(e) = ctx.store.trim(&retry_stream, ctx.retry_retention).await {
                    // Best-effort, same as the publish path.
                    warn!(stream = %retry_stream, error = %e, "Retry stream trim failed");
                }
                ctx.emit(LifecycleEvent::RetryScheduled {
                    id: retry.original_id,
                    event_type: retry.envelope.event_type.clone(),
                    retry_count: retry.retry_count,
                    next_attempt_at: retry.next_attempt_at,
                });
            }
            Err(e) => {
                // Leave the original unacked; the stale-pending reclaim
                // sweep redelivers it once the store is back.
                ctx.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                error!(id = %retry.original_id, error = %e, "Retry append failed");
                ctx.emit(LifecycleEvent::StoreError {
                    context: format!("retry append {}", retry_stream),
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
            }
        }
    });
}

/// Persist the terminal record and emit the dead-letter signal.
async fn dead_letter(ctx: &SubscriptionContext, envelope: &EventEnvelope, attempts: u32, error: String) {
    ctx.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
    if ctx.dead_letter_enabled {
        let record = DeadLetterRecord {
            original_id: envelope.id,
            event_type: envelope.event_type.clone(),
            envelope: envelope.clone(),
            error: error.clone(),
            retry_count: attempts,
            dead_lettered_at: Utc::now(),
            retention_seconds: ctx.dead_letters.retention_seconds(),
        };
        if let Err(e) = ctx.dead_letters.write(&record).await {
            ctx.counters.store_errors.fetch_add(1, Ordering::Relaxed);
            error!(id = %envelope.id, error = %e, "Dead-letter write failed");
        }
    }
    warn!(
        id = %envelope.id,
        event_type = %envelope.event_type,
        group = %ctx.group,
        attempts,
        "Message dead-lettered"
    );
    ctx.emit(LifecycleEvent::DeadLettered {
        id: envelope.id,
        event_type: envelope.event_type.clone(),
        error,
        retry_count: attempts,
        timestamp: Utc::now(),
    });
}
