use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::time::{Instant, interval_at, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use super::pipeline::{JobOutcome, JobStage, Pipeline};
use crate::infrastructure::queue::{JobQueue, QueueMessage};
use crate::modules::resource::events::Job;

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Counters exposed by the health endpoint.
#[derive(Debug, Default)]
pub struct WorkerStats {
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
    messages_rejected: AtomicU64,
    last_poll_unix: AtomicI64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub messages_rejected: u64,
    pub last_poll_unix: i64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            messages_rejected: self.messages_rejected.load(Ordering::Relaxed),
            last_poll_unix: self.last_poll_unix.load(Ordering::Relaxed),
        }
    }

    fn touch_poll(&self) {
        self.last_poll_unix
            .store(OffsetDateTime::now_utc().unix_timestamp(), Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// The long-poll elapsed without a message.
    Idle,
    /// Unparseable message, left unacknowledged.
    Rejected,
    Succeeded(JobOutcome),
    /// Fatal failure, left unacknowledged for redelivery.
    Failed(JobStage),
}

/// Receive errors back off 1s, 2s, 4s ... up to 30s.
#[derive(Debug)]
struct Backoff {
    next: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self { next: BACKOFF_INITIAL }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(BACKOFF_MAX);
        delay
    }

    fn reset(&mut self) {
        self.next = BACKOFF_INITIAL;
    }
}

pub struct TranscoderWorker {
    queue: Arc<dyn JobQueue>,
    pipeline: Pipeline,
    visibility_timeout: Duration,
    stats: Arc<WorkerStats>,
}

impl TranscoderWorker {
    pub fn new(queue: Arc<dyn JobQueue>, pipeline: Pipeline, visibility_timeout: Duration) -> Self {
        Self {
            queue,
            pipeline,
            visibility_timeout,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    /// Receives at most one message and handles it fully.
    pub async fn poll_once(&self) -> Result<PollOutcome> {
        let received = self.queue.receive_next().await;
        self.stats.touch_poll();
        match received? {
            Some(message) => Ok(self.handle_message(message).await),
            None => Ok(PollOutcome::Idle),
        }
    }

    /// Processes messages one at a time until `shutdown` fires. A job in
    /// flight when the signal arrives runs to completion first.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            visibility_timeout_secs = self.visibility_timeout.as_secs(),
            "Transcoder worker listening"
        );
        let mut backoff = Backoff::new();

        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = self.queue.receive_next() => received,
            };
            self.stats.touch_poll();

            match received {
                Ok(Some(message)) => {
                    backoff.reset();
                    self.handle_message(message).await;
                }
                Ok(None) => backoff.reset(),
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Queue receive failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }

        info!("Transcoder worker stopped");
    }

    async fn handle_message(&self, message: QueueMessage) -> PollOutcome {
        let job = match Job::from_message(&message) {
            Ok(job) => job,
            Err(e) => {
                // Not acknowledged: the broker's redrive policy owns poison messages.
                error!(error = %e, token = ?message.token, "Rejected malformed message");
                self.stats.messages_rejected.fetch_add(1, Ordering::Relaxed);
                return PollOutcome::Rejected;
            }
        };

        let span = info_span!(
            "job",
            resource_id = %job.resource_id,
            source_key = %job.source_key,
            receive_count = ?message.receive_count,
        );
        self.handle_job(job).instrument(span).await
    }

    async fn handle_job(&self, job: Job) -> PollOutcome {
        info!(stage = %JobStage::Received, file_name = %job.original_file_name, "Received transcoding job");

        match self.process_with_heartbeat(&job).await {
            Ok(outcome) => {
                match self.queue.acknowledge(&job.delivery_token).await {
                    Ok(()) => info!(stage = %JobStage::Acknowledged, "Job completed"),
                    Err(e) => warn!(error = %e, "Failed to acknowledge message; it will be redelivered"),
                }
                self.stats.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
                PollOutcome::Succeeded(outcome)
            }
            Err(e) => {
                error!(stage = %e.stage, error = %e, "Job failed; message left for redelivery");
                self.stats.jobs_failed.fetch_add(1, Ordering::Relaxed);
                PollOutcome::Failed(e.stage)
            }
        }
    }

    /// Keeps the message invisible to other workers for as long as the
    /// pipeline is running.
    async fn process_with_heartbeat(&self, job: &Job) -> Result<JobOutcome, super::pipeline::PipelineError> {
        let period = (self.visibility_timeout / 2).max(Duration::from_millis(500));
        let mut heartbeat = interval_at(Instant::now() + period, period);

        let work = self.pipeline.process(job);
        tokio::pin!(work);

        loop {
            tokio::select! {
                result = &mut work => return result,
                _ = heartbeat.tick() => {
                    if let Err(e) = self
                        .queue
                        .extend_visibility(&job.delivery_token, self.visibility_timeout)
                        .await
                    {
                        warn!(error = %e, "Failed to extend message visibility");
                    }
                }
            }
        }
    }
}
