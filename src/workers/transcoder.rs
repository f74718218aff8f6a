use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, BasicRejectOptions,
};
use lapin::types::FieldTable;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use super::retry::{RetryDecision, RetryPolicy};
use crate::infrastructure::queue::rabbitmq::RabbitMqService;
use crate::modules::lesson::events::TranscodeJob;
use crate::modules::lesson::repository::LessonRepository;
use crate::state::AppState;
use crate::transcode::command::ProcessRunner;
use crate::transcode::error::TranscodeError;
use crate::transcode::keys::KeyUriBuilder;
use crate::transcode::lifecycle::{Outcome, TranscodeController};
use crate::transcode::request::StorageLayout;

/// What to tell the broker once a delivery has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Ack,
    /// Hand the delivery back so it is not lost.
    Requeue,
    /// Drop without redelivery.
    Reject,
}

/// Next step after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FailurePlan {
    Retry { job: TranscodeJob, delay: Duration },
    Final,
}

fn plan_after_failure(policy: &RetryPolicy, job: &TranscodeJob, now: OffsetDateTime) -> FailurePlan {
    match policy.decide(job.attempt, job.first_dispatched_at, now) {
        RetryDecision::RetryAfter(delay) => FailurePlan::Retry {
            job: job.next_attempt(),
            delay,
        },
        RetryDecision::GiveUp => FailurePlan::Final,
    }
}

/// Publishes a job for redelivery after a delay.
#[async_trait]
trait RetryScheduler: Send + Sync {
    async fn schedule(&self, job: &TranscodeJob, delay: Duration) -> anyhow::Result<()>;
}

/// Delayed redelivery through the dead-lettering retry queue.
struct RetryQueue {
    queue: RabbitMqService,
    name: String,
}

#[async_trait]
impl RetryScheduler for RetryQueue {
    async fn schedule(&self, job: &TranscodeJob, delay: Duration) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(job)?;
        self.queue.publish_delayed(&self.name, &payload, delay).await
    }
}

/// Lessons with an attempt running on this worker.
#[derive(Default)]
struct InFlight(Mutex<HashSet<i64>>);

impl InFlight {
    fn claim(&self, lesson_id: i64) -> Option<InFlightGuard<'_>> {
        let mut lessons = self.0.lock().unwrap_or_else(|e| e.into_inner());
        lessons.insert(lesson_id).then(|| InFlightGuard {
            owner: self,
            lesson_id,
        })
    }
}

struct InFlightGuard<'a> {
    owner: &'a InFlight,
    lesson_id: i64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut lessons = self.owner.0.lock().unwrap_or_else(|e| e.into_inner());
        lessons.remove(&self.lesson_id);
    }
}

struct TranscodeWorker {
    controller: TranscodeController,
    retries: Arc<dyn RetryScheduler>,
    policy: RetryPolicy,
    job_timeout: Duration,
    in_flight: InFlight,
}

impl TranscodeWorker {
    async fn handle(&self, delivery: Delivery) {
        let settlement = self.handle_payload(&delivery.data).await;

        let result = match settlement {
            Settlement::Ack => delivery.ack(BasicAckOptions::default()).await,
            Settlement::Requeue => {
                delivery
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..BasicNackOptions::default()
                    })
                    .await
            }
            Settlement::Reject => {
                delivery
                    .reject(BasicRejectOptions { requeue: false })
                    .await
            }
        };
        if let Err(e) = result {
            error!("Failed to settle message: {}", e);
        }
    }

    async fn handle_payload(&self, payload: &[u8]) -> Settlement {
        let job = match serde_json::from_slice::<TranscodeJob>(payload) {
            Ok(job) => job,
            Err(e) => {
                error!("❌ Dropping malformed transcode job: {}", e);
                return Settlement::Reject;
            }
        };

        let span = info_span!(
            "transcode",
            lesson_id = job.lesson_id,
            attempt = job.attempt,
            job_id = %job.job_id
        );
        self.process(&job).instrument(span).await
    }

    async fn process(&self, job: &TranscodeJob) -> Settlement {
        let lesson_id = job.lesson_id;

        // Two attempts for one lesson would share its output directory.
        let Some(_guard) = self.in_flight.claim(lesson_id) else {
            return match self.retries.schedule(job, self.policy.delay).await {
                Ok(()) => {
                    info!("⏳ Lesson is already being processed, job postponed");
                    Settlement::Ack
                }
                Err(e) => {
                    error!("Could not postpone job, returning it to the queue: {:#}", e);
                    Settlement::Requeue
                }
            };
        };

        if self.policy.expired(job.first_dispatched_at, OffsetDateTime::now_utc()) {
            self.controller
                .on_final_failure(lesson_id, "retry window expired before the attempt started")
                .await;
            return Settlement::Ack;
        }

        info!("📦 Received transcode job");

        let reason = match tokio::time::timeout(self.job_timeout, self.controller.run(lesson_id)).await {
            Ok(Ok(outcome)) => {
                log_outcome(&outcome);
                return Settlement::Ack;
            }
            Ok(Err(TranscodeError::NotFound(_))) => {
                warn!("Lesson {} no longer exists, dropping job", lesson_id);
                return Settlement::Ack;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => {
                self.controller.abandon_attempt(lesson_id).await;
                format!("attempt exceeded {}s", self.job_timeout.as_secs())
            }
        };

        match plan_after_failure(&self.policy, job, OffsetDateTime::now_utc()) {
            FailurePlan::Retry { job: next, delay } => match self.retries.schedule(&next, delay).await {
                Ok(()) => {
                    warn!(
                        next_attempt = next.attempt,
                        delay_secs = delay.as_secs(),
                        "🔁 Attempt failed, retry scheduled: {}",
                        reason
                    );
                    Settlement::Ack
                }
                Err(e) => {
                    error!("Could not schedule retry, returning job to the queue: {:#}", e);
                    Settlement::Requeue
                }
            },
            FailurePlan::Final => {
                self.controller.on_final_failure(lesson_id, &reason).await;
                Settlement::Ack
            }
        }
    }
}

fn log_outcome(outcome: &Outcome) {
    match outcome {
        Outcome::Published {
            playlist,
            metadata,
            segments,
        } => info!(
            playlist = %playlist,
            segments,
            duration_secs = ?metadata.duration_secs,
            size_bytes = ?metadata.size_bytes,
            "✅ Job completed successfully"
        ),
        Outcome::Resumed { playlist } => {
            info!(playlist = %playlist, "✅ Interrupted publication finished")
        }
        Outcome::AlreadyPublished => info!("✅ Lesson already published, nothing to do"),
    }
}

/// Consume the video-processing queue until `cancel` fires. Deliveries are
/// fanned out to a fixed number of worker tasks; each delivery is settled
/// only after its attempt has been handled.
pub async fn start_transcoder_worker(state: AppState, cancel: CancellationToken) -> anyhow::Result<()> {
    info!("🎥 Starting Transcoder Worker...");

    let settings = state.config.transcode.clone();
    let layout = StorageLayout::new(&state.config.storage_root)
        .context("Failed to resolve storage root")?;
    info!("📂 Storage root: {}", layout.root().display());
    let key_uris = KeyUriBuilder::new(&state.config.key_uri_base)
        .map_err(|e| anyhow!("Invalid key URI base {}: {}", state.config.key_uri_base, e))?;

    let worker = Arc::new(TranscodeWorker {
        controller: TranscodeController::new(
            Arc::new(LessonRepository::new(state.db.clone())),
            Arc::new(ProcessRunner),
            settings.clone(),
            layout,
            key_uris,
        ),
        retries: Arc::new(RetryQueue {
            queue: state.queue.clone(),
            name: settings.retry_queue(),
        }),
        policy: state.config.retry.clone(),
        job_timeout: settings.job_timeout,
        in_flight: InFlight::default(),
    });

    let channel = state.queue.get_channel().await.lock().await.clone();
    let prefetch = u16::try_from(settings.workers).unwrap_or(u16::MAX);
    channel
        .basic_qos(prefetch, BasicQosOptions::default())
        .await
        .map_err(|e| anyhow!("Failed to set prefetch: {}", e))?;

    let mut consumer = channel
        .basic_consume(
            &settings.queue,
            "lesson_transcoder",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| anyhow!("Failed to create consumer: {}", e))?;

    let (tx, rx) = async_channel::bounded::<Delivery>(settings.workers);
    let mut handles = Vec::with_capacity(settings.workers);
    for _ in 0..settings.workers {
        let rx = rx.clone();
        let worker = worker.clone();
        handles.push(tokio::spawn(async move {
            while let Ok(delivery) = rx.recv().await {
                worker.handle(delivery).await;
            }
        }));
    }

    info!(
        "🎥 Transcoder Worker listening on '{}' with {} worker(s)",
        settings.queue, settings.workers
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = consumer.next() => match next {
                Some(Ok(delivery)) => {
                    if tx.send(delivery).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => error!("Consumer error: {}", e),
                None => {
                    warn!("Consumer stream closed");
                    break;
                }
            },
        }
    }

    // Unsettled deliveries still queued locally are redelivered by the broker
    // once the channel closes.
    tx.close();
    for handle in handles {
        if let Err(e) = handle.await {
            error!("Transcode worker task failed: {}", e);
        }
    }

    info!("🎥 Transcoder Worker stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::TranscodeSettings;
    use crate::transcode::status::VideoStatus;
    use crate::transcode::testing::{
        EncodeBehavior, MemoryLessonStore, ScriptedRunner, lesson, write_hls_output, write_sample_mp4,
    };
    use time::Duration as TimeDuration;

    #[derive(Default)]
    struct RecordingScheduler {
        unavailable: bool,
        scheduled: Mutex<Vec<(TranscodeJob, Duration)>>,
    }

    impl RecordingScheduler {
        fn scheduled(&self) -> Vec<(TranscodeJob, Duration)> {
            self.scheduled.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RetryScheduler for RecordingScheduler {
        async fn schedule(&self, job: &TranscodeJob, delay: Duration) -> anyhow::Result<()> {
            if self.unavailable {
                return Err(anyhow!("channel closed by broker"));
            }
            self.scheduled.lock().unwrap().push((job.clone(), delay));
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        layout: StorageLayout,
        store: Arc<MemoryLessonStore>,
        retries: Arc<RecordingScheduler>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_scheduler(RecordingScheduler::default())
        }

        fn with_scheduler(retries: RecordingScheduler) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let layout = StorageLayout::new(dir.path()).unwrap();
            Self {
                _dir: dir,
                layout,
                store: Arc::new(MemoryLessonStore::default()),
                retries: Arc::new(retries),
            }
        }

        fn upload(&self, id: i64) {
            let stored = format!("uploads/lesson_{id}.mp4");
            write_sample_mp4(&self.layout.resolve(&stored), 64 * 1024);
            self.store.insert(lesson(id, Some(&stored), VideoStatus::Pending));
        }

        fn status(&self, id: i64) -> VideoStatus {
            self.store.get(id).unwrap().status()
        }

        fn worker(&self, runner: Arc<ScriptedRunner>, job_timeout: Duration) -> TranscodeWorker {
            TranscodeWorker {
                controller: TranscodeController::new(
                    self.store.clone(),
                    runner,
                    TranscodeSettings::default(),
                    self.layout.clone(),
                    KeyUriBuilder::new("https://learn.example.com/api/v1/lessons/").unwrap(),
                ),
                retries: self.retries.clone(),
                policy: RetryPolicy::default(),
                job_timeout,
                in_flight: InFlight::default(),
            }
        }
    }

    fn failing_encoder() -> Arc<ScriptedRunner> {
        Arc::new(ScriptedRunner::default().encode(EncodeBehavior::Exit {
            code: 1,
            stderr: "Conversion failed!".into(),
        }))
    }

    #[tokio::test]
    async fn malformed_payload_is_rejected() {
        let f = Fixture::new();
        let worker = f.worker(Arc::new(ScriptedRunner::default()), Duration::from_secs(60));

        assert_eq!(worker.handle_payload(b"{\"lesson\": 7}").await, Settlement::Reject);
        assert_eq!(worker.handle_payload(b"not json").await, Settlement::Reject);
        assert!(f.retries.scheduled().is_empty());
    }

    #[tokio::test]
    async fn successful_job_is_acked() {
        let f = Fixture::new();
        f.upload(7);
        let worker = f.worker(Arc::new(ScriptedRunner::default()), Duration::from_secs(60));

        let payload = serde_json::to_vec(&TranscodeJob::new(7)).unwrap();
        assert_eq!(worker.handle_payload(&payload).await, Settlement::Ack);
        assert_eq!(f.status(7), VideoStatus::Ready);
        assert!(f.retries.scheduled().is_empty());
    }

    #[tokio::test]
    async fn expired_job_is_finalized_without_running() {
        let f = Fixture::new();
        f.upload(7);
        write_hls_output(&f.layout.hls_dir(7), 2);
        let runner = Arc::new(ScriptedRunner::default());
        let worker = f.worker(runner.clone(), Duration::from_secs(60));

        let mut job = TranscodeJob::new(7);
        job.first_dispatched_at -= TimeDuration::hours(5);

        assert_eq!(worker.process(&job).await, Settlement::Ack);
        assert!(runner.calls().is_empty());
        assert_eq!(f.status(7), VideoStatus::Failed);
        assert!(!f.layout.hls_dir(7).exists());
        assert!(f.retries.scheduled().is_empty());
    }

    #[tokio::test]
    async fn missing_lesson_is_acked_without_retry() {
        let f = Fixture::new();
        let worker = f.worker(Arc::new(ScriptedRunner::default()), Duration::from_secs(60));

        assert_eq!(worker.process(&TranscodeJob::new(99)).await, Settlement::Ack);
        assert!(f.retries.scheduled().is_empty());
    }

    #[tokio::test]
    async fn failed_attempt_schedules_the_next_one() {
        let f = Fixture::new();
        f.upload(7);
        let worker = f.worker(failing_encoder(), Duration::from_secs(60));
        let job = TranscodeJob::new(7);

        assert_eq!(worker.process(&job).await, Settlement::Ack);
        assert_eq!(f.status(7), VideoStatus::Failed);

        let scheduled = f.retries.scheduled();
        assert_eq!(scheduled.len(), 1);
        let (next, delay) = &scheduled[0];
        assert_eq!(next.job_id, job.job_id);
        assert_eq!(next.attempt, 2);
        assert_eq!(*delay, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn last_failed_attempt_cleans_up() {
        let f = Fixture::new();
        f.upload(7);
        let worker = f.worker(failing_encoder(), Duration::from_secs(60));
        let mut job = TranscodeJob::new(7);
        job.attempt = 5;

        assert_eq!(worker.process(&job).await, Settlement::Ack);
        assert_eq!(f.status(7), VideoStatus::Failed);
        assert!(!f.layout.hls_dir(7).exists());
        assert!(f.retries.scheduled().is_empty());
    }

    #[tokio::test]
    async fn unpublished_retry_returns_job_to_queue() {
        let f = Fixture::with_scheduler(RecordingScheduler {
            unavailable: true,
            ..RecordingScheduler::default()
        });
        f.upload(7);
        let worker = f.worker(failing_encoder(), Duration::from_secs(60));

        assert_eq!(worker.process(&TranscodeJob::new(7)).await, Settlement::Requeue);
        assert_eq!(f.status(7), VideoStatus::Failed);
    }

    #[tokio::test]
    async fn attempt_over_budget_is_abandoned_and_retried() {
        let f = Fixture::new();
        f.upload(7);
        let runner = Arc::new(ScriptedRunner::default().encode(EncodeBehavior::Hang));
        let worker = f.worker(runner, Duration::from_millis(200));

        assert_eq!(worker.process(&TranscodeJob::new(7)).await, Settlement::Ack);
        assert_eq!(f.status(7), VideoStatus::Failed);

        let scheduled = f.retries.scheduled();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].0.attempt, 2);
    }

    #[tokio::test]
    async fn busy_lesson_is_postponed_with_the_same_attempt() {
        let f = Fixture::new();
        f.upload(7);
        let runner = Arc::new(ScriptedRunner::default());
        let worker = f.worker(runner.clone(), Duration::from_secs(60));
        let job = TranscodeJob::new(7);

        let held = worker.in_flight.claim(7).unwrap();
        assert_eq!(worker.process(&job).await, Settlement::Ack);
        assert!(runner.calls().is_empty());
        assert_eq!(f.status(7), VideoStatus::Pending);
        assert_eq!(f.retries.scheduled(), vec![(job.clone(), Duration::from_secs(30))]);

        drop(held);
        assert!(worker.in_flight.claim(7).is_some());
    }

    #[tokio::test]
    async fn busy_lesson_is_requeued_when_postponing_fails() {
        let f = Fixture::with_scheduler(RecordingScheduler {
            unavailable: true,
            ..RecordingScheduler::default()
        });
        f.upload(7);
        let worker = f.worker(Arc::new(ScriptedRunner::default()), Duration::from_secs(60));

        let _held = worker.in_flight.claim(7).unwrap();
        assert_eq!(worker.process(&TranscodeJob::new(7)).await, Settlement::Requeue);
    }

    #[test]
    fn in_flight_claim_is_exclusive_per_lesson() {
        let in_flight = InFlight::default();
        let first = in_flight.claim(1).unwrap();
        assert!(in_flight.claim(1).is_none());
        assert!(in_flight.claim(2).is_some());
        drop(first);
        assert!(in_flight.claim(1).is_some());
    }

    #[test]
    fn failed_attempt_is_rescheduled_with_next_attempt_number() {
        let job = TranscodeJob::new(42);
        let plan = plan_after_failure(&RetryPolicy::default(), &job, OffsetDateTime::now_utc());

        match plan {
            FailurePlan::Retry { job: next, delay } => {
                assert_eq!(next.attempt, 2);
                assert_eq!(next.job_id, job.job_id);
                assert_eq!(delay, Duration::from_secs(30));
            }
            FailurePlan::Final => panic!("expected a retry"),
        }
    }

    #[test]
    fn fifth_failure_is_final() {
        let mut job = TranscodeJob::new(42);
        job.attempt = 5;
        assert_eq!(
            plan_after_failure(&RetryPolicy::default(), &job, OffsetDateTime::now_utc()),
            FailurePlan::Final
        );
    }

    #[test]
    fn failure_past_deadline_is_final() {
        let mut job = TranscodeJob::new(42);
        job.first_dispatched_at -= TimeDuration::hours(5);
        assert_eq!(
            plan_after_failure(&RetryPolicy::default(), &job, OffsetDateTime::now_utc()),
            FailurePlan::Final
        );
    }
}
