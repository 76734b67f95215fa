//! Bounded-concurrency executor draining query batches through the rate limiter.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};
use wikisync_upstream::{
    BackoffPolicy, GraphQlResponse, GraphQlTransport, QueryBatch, RateLimiter, UpstreamError,
};

/// Receives each batch's fate. Calls are made one at a time from the scheduler loop.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    /// Every sub-request answered; `responses` follow `batch.requests` order.
    async fn on_success(&self, batch: QueryBatch, responses: Vec<GraphQlResponse>) -> Result<()>;
    /// Permanent failure, or transient failure past the retry budget.
    async fn on_failure(&self, batch: QueryBatch, error: UpstreamError) -> Result<()>;
    /// Never started because the run was cancelled.
    async fn on_skipped(&self, batch: QueryBatch) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SchedulerReport {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub retries: usize,
    pub rate_limited: usize,
}

impl SchedulerReport {
    pub fn absorb(&mut self, other: SchedulerReport) {
        self.completed += other.completed;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.retries += other.retries;
        self.rate_limited += other.rate_limited;
    }
}

#[derive(Clone)]
pub struct TaskScheduler {
    transport: Arc<dyn GraphQlTransport>,
    limiter: Arc<RateLimiter>,
    concurrency: usize,
    backoff: BackoffPolicy,
    cancel: CancellationToken,
}

struct BatchRun {
    batch: QueryBatch,
    attempt: usize,
    rate_limited: usize,
    result: Result<Vec<GraphQlResponse>, UpstreamError>,
}

impl TaskScheduler {
    pub fn new(
        transport: Arc<dyn GraphQlTransport>,
        limiter: Arc<RateLimiter>,
        concurrency: usize,
        backoff: BackoffPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            limiter,
            concurrency: concurrency.max(1),
            backoff,
            cancel,
        }
    }

    /// Drain `batches` keeping at most `concurrency` in flight. Cancellation stops new batches
    /// from starting; in-flight ones still finish and reach the handler.
    pub async fn run(
        &self,
        batches: Vec<QueryBatch>,
        handler: &dyn BatchHandler,
    ) -> Result<SchedulerReport> {
        let mut queue: VecDeque<(QueryBatch, usize)> =
            batches.into_iter().map(|b| (b, 0)).collect();
        let mut in_flight: JoinSet<BatchRun> = JoinSet::new();
        let mut report = SchedulerReport::default();

        loop {
            while in_flight.len() < self.concurrency && !self.cancel.is_cancelled() {
                let Some((batch, attempt)) = queue.pop_front() else {
                    break;
                };
                let delay = attempt
                    .checked_sub(1)
                    .map(|prev| self.backoff.delay_for_attempt(prev));
                in_flight.spawn(execute_batch(
                    self.transport.clone(),
                    self.limiter.clone(),
                    batch,
                    attempt,
                    delay,
                ));
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let done = joined.context("batch task panicked")?;
            report.rate_limited += done.rate_limited;

            match done.result {
                Ok(responses) => {
                    handler.on_success(done.batch, responses).await?;
                    report.completed += 1;
                }
                Err(err) if err.is_transient() && self.backoff.allows_retry(done.attempt) => {
                    warn!(
                        attempt = done.attempt,
                        pages = done.batch.items.len(),
                        error = %err,
                        "transient batch failure; requeueing"
                    );
                    report.retries += 1;
                    queue.push_back((done.batch, done.attempt + 1));
                }
                Err(err) => {
                    warn!(pages = done.batch.items.len(), error = %err, "batch failed");
                    handler.on_failure(done.batch, err).await?;
                    report.failed += 1;
                }
            }
        }

        for (batch, _) in queue.drain(..) {
            handler.on_skipped(batch).await?;
            report.skipped += 1;
        }
        Ok(report)
    }
}

async fn execute_batch(
    transport: Arc<dyn GraphQlTransport>,
    limiter: Arc<RateLimiter>,
    batch: QueryBatch,
    attempt: usize,
    delay: Option<Duration>,
) -> BatchRun {
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    let span = info_span!(
        "batch",
        shape = ?batch.shape,
        pages = batch.items.len(),
        cost = batch.cost,
        attempt
    );
    let (result, rate_limited) = run_requests(transport.as_ref(), &limiter, &batch)
        .instrument(span)
        .await;
    BatchRun {
        batch,
        attempt,
        rate_limited,
        result,
    }
}

/// Sub-requests run in order; the first non-rate-limit failure fails the batch.
async fn run_requests(
    transport: &dyn GraphQlTransport,
    limiter: &RateLimiter,
    batch: &QueryBatch,
) -> (Result<Vec<GraphQlResponse>, UpstreamError>, usize) {
    let mut responses = Vec::with_capacity(batch.requests.len());
    let mut rate_limited = 0usize;
    for sub in &batch.requests {
        loop {
            limiter.acquire(sub.cost).await;
            let outcome = match transport.execute(&sub.request).await {
                Ok(resp) => match resp.request_error() {
                    Some(err) => Err(err),
                    None => Ok(resp),
                },
                Err(err) => Err(err),
            };
            match outcome {
                Ok(resp) => {
                    debug!(part = ?sub.part, "sub-request answered");
                    responses.push(resp);
                    break;
                }
                Err(UpstreamError::RateLimited { retry_after }) => {
                    rate_limited += 1;
                    limiter.penalize(retry_after);
                }
                Err(err) => return (Err(err), rate_limited),
            }
        }
    }
    (Ok(responses), rate_limited)
}
