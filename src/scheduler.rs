//! Bounded dispatch scheduler.
//! Producers push jobs into a bounded tokio mpsc queue; a full queue applies backpressure.
//! The dispatch loop runs each job in its own task, gated by a semaphore, so at most
//! `max_concurrency` messages are in flight. Completion order is NOT arrival order.
//! Retry of classified failures happens here, never inside the dispatcher.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capture::ChatMessage;
use crate::dispatch::{MessageDispatcher, ProcessingOutcome};
use crate::display::{DisplayEntry, DisplaySink};
use crate::metrics::{metric_names, MetricsRegistry};

/// One message waiting for dispatch.
#[derive(Debug)]
pub struct DispatchJob {
    pub message_id: String,
    pub message: ChatMessage,
    pub enqueued_at: Instant,
}

impl DispatchJob {
    pub fn new(message: ChatMessage) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            message,
            enqueued_at: Instant::now(),
        }
    }
}

/// Bounded job queue. The receiver is taken once by the dispatch loop.
pub struct DispatchQueue {
    tx: mpsc::Sender<DispatchJob>,
    rx: parking_lot::Mutex<Option<mpsc::Receiver<DispatchJob>>>,
}

impl DispatchQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: parking_lot::Mutex::new(Some(rx)),
        }
    }

    /// Submit from async code. Returns false once the loop has shut down.
    pub async fn submit(&self, message: ChatMessage) -> bool {
        submit_to(&self.tx, message).await
    }

    /// Submit from a plain thread (the tailer). Blocks while the queue is full.
    pub fn submit_blocking(&self, message: ChatMessage) -> bool {
        submit_blocking_to(&self.tx, message)
    }

    /// Sender clone for producers that outlive a borrow of the queue.
    pub fn sender(&self) -> mpsc::Sender<DispatchJob> {
        self.tx.clone()
    }

    /// Take the receiver (call once to start the dispatch loop).
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<DispatchJob>> {
        self.rx.lock().take()
    }
}

/// Async submit on a bare sender: try first, then wait for a slot.
pub async fn submit_to(tx: &mpsc::Sender<DispatchJob>, message: ChatMessage) -> bool {
    match tx.try_send(DispatchJob::new(message)) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(job)) => {
            warn!("dispatch queue full, awaiting slot");
            tx.send(job).await.is_ok()
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            error!("dispatch queue closed");
            false
        }
    }
}

/// Blocking submit on a bare sender. Must not be called from inside the runtime.
pub fn submit_blocking_to(tx: &mpsc::Sender<DispatchJob>, message: ChatMessage) -> bool {
    match tx.try_send(DispatchJob::new(message)) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(job)) => {
            warn!("dispatch queue full, tailer waiting for a slot");
            tx.blocking_send(job).is_ok()
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            error!("dispatch queue closed");
            false
        }
    }
}

/// Caller-side retry for retryable failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `attempt + 1`, where `attempt` is 1-based.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

/// Everything a dispatch task needs, shared across tasks.
pub struct DispatchContext {
    pub dispatcher: Arc<MessageDispatcher>,
    pub sink: Arc<dyn DisplaySink>,
    pub metrics: Arc<MetricsRegistry>,
    pub retry: RetryPolicy,
}

/// Pull jobs until the queue closes, then wait for in-flight tasks.
/// `shutdown` only shortens retry backoff; started dispatches always complete.
pub async fn run_dispatch_loop(
    mut rx: mpsc::Receiver<DispatchJob>,
    ctx: Arc<DispatchContext>,
    max_concurrency: usize,
    shutdown: CancellationToken,
) {
    let permits = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let mut tasks = JoinSet::new();
    info!(max_concurrency, "dispatch loop started");

    while let Some(job) = rx.recv().await {
        let permit = match Arc::clone(&permits).acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };
        ctx.metrics.record(
            metric_names::QUEUE_WAIT,
            job.enqueued_at.elapsed().as_micros() as f64,
        );

        let ctx = Arc::clone(&ctx);
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            run_job(job, &ctx, &shutdown).await;
            drop(permit);
        });

        // reap finished tasks so the set stays small
        while let Some(res) = tasks.try_join_next() {
            if let Err(e) = res {
                error!(error = %e, "dispatch task panicked");
            }
        }
    }

    debug!(in_flight = tasks.len(), "dispatch queue closed, draining");
    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            error!(error = %e, "dispatch task panicked");
        }
    }
    info!("dispatch loop stopped");
}

async fn run_job(job: DispatchJob, ctx: &DispatchContext, shutdown: &CancellationToken) {
    let job_span = ctx.metrics.span(metric_names::JOB_DONE);
    let started = Instant::now();
    let mut attempt = 1;

    let outcome = loop {
        let attempt_span = ctx.metrics.span(metric_names::DISPATCH_DONE);
        let outcome = ctx.dispatcher.dispatch(&job.message).await;
        attempt_span.finish();

        let retryable = match &outcome {
            ProcessingOutcome::Failed { kind, .. } if kind.is_retryable() => Some(*kind),
            _ => None,
        };
        let Some(kind) = retryable else { break outcome };
        if attempt >= ctx.retry.max_attempts {
            break outcome;
        }

        let delay = ctx.retry.delay_after(attempt);
        warn!(
            message_id = %job.message_id,
            attempt,
            kind = %kind,
            delay_ms = delay.as_millis() as u64,
            "dispatch failed, retrying"
        );
        ctx.metrics.add_retry();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => {
                debug!(message_id = %job.message_id, "shutdown during backoff, giving up");
                break outcome;
            }
        }
        attempt += 1;
    };

    if let ProcessingOutcome::Translated { info, .. } = &outcome {
        if let Some(usage) = info.usage {
            ctx.metrics.add_usage(usage);
        }
    }
    if let ProcessingOutcome::Failed { kind, .. } = &outcome {
        warn!(message_id = %job.message_id, attempts = attempt, kind = %kind, "dispatch failed");
    }

    let origin = job.message.origin;
    if let Some(reply) = outcome.into_reply(origin) {
        ctx.sink.display(&DisplayEntry::from_reply(reply, Some(started.elapsed())));
    } else {
        debug!(message_id = %job.message_id, %origin, "message discarded");
    }
    job_span.finish();
}
