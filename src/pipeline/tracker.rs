//! Job tracker: polls submitted jobs until they reach a terminal status.
//!
//! Jobs wait in a queue ordered by the instant they next become eligible for
//! a status check. A job still `IN_PROGRESS` (or hit by a transient transport
//! error) goes back into the queue with an exponentially growing delay, never
//! past its deadline. At most `concurrency` status checks are in flight.
//!
//! The tracker stops once the submission stage has closed its channel, the
//! queue is empty and no check is in flight.

use super::PipelineCounters;
use crate::error::{PipelineError, ServiceError};
use crate::models::{FailureReason, JobId, JobOutcome, JobResult, JobStatus, StatusReport, SubmittedJob};
use crate::progress::PipelineProgress;
use crate::services::AnalysisService;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often, and for how long, a job is polled.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    /// Delay before the second poll; doubles after every further poll.
    pub initial_backoff: Duration,
    /// Upper bound on the delay between two polls.
    pub max_backoff: Duration,
    /// Hard limit on the time a job may stay non-terminal.
    pub max_duration: Duration,
    /// Optional cap on the number of polls per job.
    pub max_attempts: Option<u32>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_duration: Duration::from_secs(30 * 60),
            max_attempts: None,
        }
    }
}

impl PollPolicy {
    /// Delay after the `attempt`-th poll (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

/// Status transition rejected by the job state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// A job the tracker is responsible for.
#[derive(Debug, Clone)]
pub struct TrackedJob {
    job: SubmittedJob,
    status: JobStatus,
    attempts: u32,
    deadline: Instant,
    last_error: Option<String>,
}

impl TrackedJob {
    pub fn new(job: SubmittedJob, policy: &PollPolicy, now: Instant) -> Self {
        Self {
            job,
            status: JobStatus::Submitted,
            attempts: 0,
            deadline: now + policy.max_duration,
            last_error: None,
        }
    }

    #[cfg(test)]
    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn job_id(&self) -> &JobId {
        &self.job.job_id
    }

    /// Move to `next`, refusing to leave a terminal status.
    pub fn advance(&mut self, next: JobStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

/// What to do with a job after a poll.
#[derive(Debug)]
enum Step {
    Finish(JobResult),
    Retry(TrackedJob, Instant),
}

struct ScheduledPoll {
    due: Instant,
    seq: u64,
    job: TrackedJob,
}

impl PartialEq for ScheduledPoll {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for ScheduledPoll {}

impl PartialOrd for ScheduledPoll {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledPoll {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

/// Polls counted by the tracker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub polls: u64,
    pub transient_errors: u64,
    pub timeouts: u64,
    pub cancelled: u64,
}

pub struct JobTracker {
    analysis: Arc<dyn AnalysisService>,
    policy: PollPolicy,
    concurrency: usize,
    counters: Arc<PipelineCounters>,
    progress: PipelineProgress,
}

type PollOutcome = (JobId, Result<StatusReport, ServiceError>);

impl JobTracker {
    pub fn new(
        analysis: Arc<dyn AnalysisService>,
        policy: PollPolicy,
        concurrency: usize,
        counters: Arc<PipelineCounters>,
        progress: PipelineProgress,
    ) -> Self {
        Self {
            analysis,
            policy,
            concurrency: concurrency.max(1),
            counters,
            progress,
        }
    }

    /// Track every job received until all of them are terminal.
    pub async fn run(
        self,
        mut jobs: mpsc::Receiver<SubmittedJob>,
        results: mpsc::Sender<JobResult>,
        cancel: CancellationToken,
    ) -> TrackerStats {
        let mut stats = TrackerStats::default();
        let mut queue: BinaryHeap<Reverse<ScheduledPoll>> = BinaryHeap::new();
        let mut polling: HashMap<JobId, TrackedJob> = HashMap::new();
        let mut in_flight: JoinSet<PollOutcome> = JoinSet::new();
        let mut seq: u64 = 0;
        let mut upstream_open = true;

        loop {
            if !upstream_open && queue.is_empty() && in_flight.is_empty() {
                break;
            }

            let now = Instant::now();
            while in_flight.len() < self.concurrency {
                let due = matches!(queue.peek(), Some(Reverse(next)) if next.due <= now);
                if !due {
                    break;
                }
                let Some(Reverse(scheduled)) = queue.pop() else {
                    break;
                };
                let mut job = scheduled.job;
                job.attempts += 1;
                stats.polls += 1;

                let job_id = job.job_id().clone();
                let analysis = self.analysis.clone();
                debug!("Retrieving analysis status for job {} (poll {})", job_id, job.attempts);
                polling.insert(job_id.clone(), job);
                in_flight.spawn(async move {
                    let report = analysis.get_status(&job_id).await;
                    (job_id, report)
                });
            }

            let next_due = if in_flight.len() < self.concurrency {
                queue.peek().map(|Reverse(next)| next.due)
            } else {
                None
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    in_flight.abort_all();
                    jobs.close();
                    let mut pending: Vec<TrackedJob> = polling.into_values().collect();
                    pending.extend(queue.into_iter().map(|Reverse(s)| s.job));
                    while let Some(job) = jobs.recv().await {
                        pending.push(TrackedJob::new(job, &self.policy, Instant::now()));
                    }
                    info!("Cancelled; abandoning {} unfinished jobs", pending.len());
                    for job in pending {
                        stats.cancelled += 1;
                        let result = JobResult::failed(job.job, FailureReason::Cancelled, None);
                        self.emit(&results, result).await;
                    }
                    return stats;
                }
                received = jobs.recv(), if upstream_open => match received {
                    Some(job) => {
                        let tracked = TrackedJob::new(job, &self.policy, Instant::now());
                        seq += 1;
                        queue.push(Reverse(ScheduledPoll { due: Instant::now(), seq, job: tracked }));
                    }
                    None => {
                        debug!("Submission stage finished; draining {} jobs", queue.len() + in_flight.len());
                        upstream_open = false;
                    }
                },
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    let (job_id, report) = match joined {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            // The job stays in `polling` and is failed once the loop ends.
                            warn!("Status poll task ended abnormally: {}", e);
                            continue;
                        }
                    };
                    let Some(job) = polling.remove(&job_id) else {
                        continue;
                    };
                    if matches!(&report, Err(e) if e.is_transient()) {
                        stats.transient_errors += 1;
                    }
                    match self.step(job, report, Instant::now()) {
                        Step::Finish(result) => {
                            if matches!(&result.outcome, JobOutcome::Failed { reason: FailureReason::Timeout { .. }, .. }) {
                                stats.timeouts += 1;
                            }
                            self.emit(&results, result).await;
                        }
                        Step::Retry(job, due) => {
                            seq += 1;
                            queue.push(Reverse(ScheduledPoll { due, seq, job }));
                        }
                    }
                },
                _ = sleep_until(next_due.unwrap_or(now)), if next_due.is_some() => {}
            }
        }

        for (job_id, job) in polling {
            warn!("Lost track of job {} after a failed status check", job_id);
            let reason = FailureReason::Rejected {
                message: "status check ended abnormally".to_string(),
            };
            self.emit(&results, JobResult::failed(job.job, reason, None)).await;
        }

        debug!("Tracker finished after {} polls", stats.polls);
        stats
    }

    async fn emit(&self, results: &mpsc::Sender<JobResult>, result: JobResult) {
        match &result.outcome {
            JobOutcome::Succeeded { .. } => self.counters.succeeded(),
            JobOutcome::PartialSuccess { .. } => self.counters.partially_succeeded(),
            JobOutcome::Failed { .. } => self.counters.failed(),
        }
        self.progress.completed();
        if results.send(result).await.is_err() {
            debug!("Result collector closed");
        }
    }

    /// Apply the outcome of one poll to `job`.
    fn step(
        &self,
        mut job: TrackedJob,
        report: Result<StatusReport, ServiceError>,
        now: Instant,
    ) -> Step {
        let job_id = job.job_id().clone();

        let report = match report {
            Ok(report) => report,
            Err(e) if e.is_transient() => {
                let err = PipelineError::PollTransport {
                    job_id: job_id.to_string(),
                    source: e,
                };
                warn!("{}; will retry", err);
                job.last_error = Some(err.to_string());
                return self.reschedule(job, now);
            }
            Err(e) => {
                warn!("Status request for job {} rejected: {}", job_id, e);
                let reason = FailureReason::Rejected { message: e.to_string() };
                return Step::Finish(JobResult::failed(job.job, reason, None));
            }
        };

        let Some(status) = JobStatus::from_wire(&report.status) else {
            warn!("Job {} in unknown state {}", job_id, report.status);
            let reason = FailureReason::UnknownStatus {
                status: report.status.clone(),
            };
            return Step::Finish(JobResult::failed(job.job, reason, Some(report.payload)));
        };

        if let Err(invalid) = job.advance(status) {
            warn!(
                "Job {} reported {} after {}; ignoring",
                job_id, invalid.to, invalid.from
            );
            return self.reschedule(job, now);
        }

        match status {
            JobStatus::Succeeded => {
                debug!("Job {} succeeded", job_id);
                Step::Finish(JobResult {
                    job_id,
                    object: job.job.object,
                    outcome: JobOutcome::Succeeded {
                        payload: report.payload,
                    },
                })
            }
            JobStatus::PartialSuccess => {
                warn!("Job {} partially succeeded", job_id);
                Step::Finish(JobResult {
                    job_id,
                    object: job.job.object,
                    outcome: JobOutcome::PartialSuccess {
                        payload: report.payload,
                    },
                })
            }
            JobStatus::Failed => {
                let message = report
                    .status_message()
                    .unwrap_or("no status message")
                    .to_string();
                warn!(
                    "{}",
                    PipelineError::JobFailed {
                        job_id: job_id.to_string(),
                        reason: message.clone(),
                    }
                );
                let reason = FailureReason::ServiceReported { message };
                Step::Finish(JobResult::failed(job.job, reason, Some(report.payload)))
            }
            JobStatus::Submitted | JobStatus::InProgress => {
                debug!("Job {} still in progress", job_id);
                self.reschedule(job, now)
            }
        }
    }

    fn reschedule(&self, job: TrackedJob, now: Instant) -> Step {
        let out_of_attempts = self
            .policy
            .max_attempts
            .is_some_and(|max| job.attempts >= max);

        if now >= job.deadline || out_of_attempts {
            warn!("Job {} timed out after {} polls", job.job_id(), job.attempts);
            let reason = FailureReason::Timeout {
                attempts: job.attempts,
                last_error: job.last_error.clone(),
            };
            return Step::Finish(JobResult::failed(job.job, reason, None));
        }

        let due = (now + self.policy.backoff(job.attempts)).min(job.deadline);
        Step::Retry(job, due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RemoteObject;
    use crate::services::testing::{Reply, ScriptedAnalysis};

    fn fast_policy() -> PollPolicy {
        PollPolicy {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            max_duration: Duration::from_secs(10),
            max_attempts: None,
        }
    }

    async fn submit(analysis: &ScriptedAnalysis, key: &str) -> SubmittedJob {
        let object = RemoteObject {
            bucket: "receipts".to_string(),
            key: key.to_string(),
        };
        let job_id = analysis.submit(&object).await.unwrap();
        SubmittedJob { job_id, object }
    }

    async fn track(
        analysis: Arc<ScriptedAnalysis>,
        policy: PollPolicy,
        keys: &[&str],
    ) -> (Vec<JobResult>, TrackerStats) {
        let (job_tx, job_rx) = mpsc::channel(16);
        let (result_tx, mut result_rx) = mpsc::channel(16);
        for key in keys {
            job_tx.send(submit(&analysis, key).await).await.unwrap();
        }
        drop(job_tx);

        let tracker = JobTracker::new(
            analysis,
            policy,
            4,
            Arc::new(PipelineCounters::default()),
            PipelineProgress::hidden(),
        );
        let stats = tracker.run(job_rx, result_tx, CancellationToken::new()).await;

        let mut results = Vec::new();
        while let Some(result) = result_rx.recv().await {
            results.push(result);
        }
        (results, stats)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = PollPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
            ..PollPolicy::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_millis(1000));
        assert_eq!(policy.backoff(500), Duration::from_millis(1000));
    }

    #[test]
    fn test_tracked_job_rejects_leaving_terminal_status() {
        let job = SubmittedJob {
            job_id: JobId("j".to_string()),
            object: RemoteObject {
                bucket: "b".to_string(),
                key: "k".to_string(),
            },
        };
        let mut tracked = TrackedJob::new(job, &PollPolicy::default(), Instant::now());
        assert_eq!(tracked.status(), JobStatus::Submitted);
        assert!(tracked.advance(JobStatus::InProgress).is_ok());
        assert!(tracked.advance(JobStatus::Succeeded).is_ok());
        assert_eq!(
            tracked.advance(JobStatus::InProgress),
            Err(InvalidTransition {
                from: JobStatus::Succeeded,
                to: JobStatus::InProgress
            })
        );
        assert_eq!(tracked.status(), JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_in_progress_three_times_then_partial_success() {
        let analysis = Arc::new(ScriptedAnalysis::new());
        analysis.script(
            "a.png",
            vec![
                Reply::Status("IN_PROGRESS"),
                Reply::Status("IN_PROGRESS"),
                Reply::Status("IN_PROGRESS"),
                Reply::Status("PARTIAL_SUCCESS"),
            ],
        );

        let (results, stats) = track(analysis.clone(), fast_policy(), &["batch/a.png"]).await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].outcome.status(), JobStatus::PartialSuccess);
        assert!(results[0].outcome.payload().is_some());
        assert_eq!(analysis.polls_for("a.png"), 4);
        assert_eq!(stats.polls, 4);
    }

    #[tokio::test]
    async fn test_every_job_gets_exactly_one_result() {
        let analysis = Arc::new(ScriptedAnalysis::new());
        analysis.script("slow.png", vec![Reply::Status("IN_PROGRESS"), Reply::Status("SUCCEEDED")]);
        analysis.script("bad.pdf", vec![Reply::Status("FAILED")]);
        analysis.script("odd.jpg", vec![Reply::Status("EXPIRED")]);

        let keys = ["b/fast.png", "b/slow.png", "b/bad.pdf", "b/odd.jpg"];
        let (results, _) = track(analysis, fast_policy(), &keys).await;

        assert_eq!(results.len(), 4);
        let status_of = |suffix: &str| {
            results
                .iter()
                .find(|r| r.object.key.ends_with(suffix))
                .map(|r| r.outcome.clone())
                .unwrap()
        };
        assert_eq!(status_of("fast.png").status(), JobStatus::Succeeded);
        assert_eq!(status_of("slow.png").status(), JobStatus::Succeeded);
        match status_of("bad.pdf") {
            JobOutcome::Failed { reason, raw } => {
                assert!(matches!(reason, FailureReason::ServiceReported { .. }));
                assert!(raw.is_some());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        match status_of("odd.jpg") {
            JobOutcome::Failed { reason, raw } => {
                assert_eq!(
                    reason,
                    FailureReason::UnknownStatus {
                        status: "EXPIRED".to_string()
                    }
                );
                assert_eq!(raw.unwrap()["JobStatus"], "EXPIRED");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transient_poll_errors_are_retried() {
        let analysis = Arc::new(ScriptedAnalysis::new());
        analysis.script(
            "a.png",
            vec![
                Reply::Error(ServiceError::Transport("connection reset".to_string())),
                Reply::Error(ServiceError::Throttled("slow down".to_string())),
                Reply::Status("SUCCEEDED"),
            ],
        );

        let (results, stats) = track(analysis.clone(), fast_policy(), &["b/a.png"]).await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].outcome.status(), JobStatus::Succeeded);
        assert_eq!(stats.transient_errors, 2);
        assert_eq!(analysis.polls_for("a.png"), 3);
    }

    #[tokio::test]
    async fn test_rejected_poll_fails_the_job() {
        let analysis = Arc::new(ScriptedAnalysis::new());
        analysis.script(
            "a.png",
            vec![Reply::Error(ServiceError::Rejected {
                status: 400,
                message: "InvalidJobIdException".to_string(),
            })],
        );

        let (results, _) = track(analysis, fast_policy(), &["b/a.png"]).await;
        match &results[0].outcome {
            JobOutcome::Failed { reason, .. } => assert_eq!(reason.kind(), "rejected"),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stuck_job_times_out() {
        let analysis = Arc::new(ScriptedAnalysis::new());
        analysis.script("stuck.png", vec![Reply::Status("IN_PROGRESS")]);

        let policy = PollPolicy {
            max_duration: Duration::from_millis(50),
            ..fast_policy()
        };
        let (results, stats) = track(analysis, policy, &["b/stuck.png"]).await;

        assert_eq!(results.len(), 1);
        match &results[0].outcome {
            JobOutcome::Failed {
                reason: FailureReason::Timeout { attempts, .. },
                ..
            } => assert!(*attempts >= 2),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(stats.timeouts, 1);
    }

    #[tokio::test]
    async fn test_max_attempts_caps_polling() {
        let analysis = Arc::new(ScriptedAnalysis::new());
        analysis.script("stuck.png", vec![Reply::Status("IN_PROGRESS")]);

        let policy = PollPolicy {
            max_attempts: Some(3),
            ..fast_policy()
        };
        let (results, _) = track(analysis.clone(), policy, &["b/stuck.png"]).await;

        assert_eq!(results[0].outcome.status(), JobStatus::Failed);
        assert_eq!(analysis.polls_for("stuck.png"), 3);
    }

    #[tokio::test]
    async fn test_cancel_fails_pending_jobs() {
        let analysis = Arc::new(ScriptedAnalysis::new());
        analysis.script("stuck.png", vec![Reply::Status("IN_PROGRESS")]);

        let (job_tx, job_rx) = mpsc::channel(4);
        let (result_tx, mut result_rx) = mpsc::channel(4);
        job_tx.send(submit(&analysis, "b/stuck.png").await).await.unwrap();

        let cancel = CancellationToken::new();
        let tracker = JobTracker::new(
            analysis,
            fast_policy(),
            2,
            Arc::new(PipelineCounters::default()),
            PipelineProgress::hidden(),
        );
        let handle = tokio::spawn(tracker.run(job_rx, result_tx, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let stats = handle.await.unwrap();

        let result = result_rx.recv().await.unwrap();
        match result.outcome {
            JobOutcome::Failed { reason, .. } => assert_eq!(reason, FailureReason::Cancelled),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(stats.cancelled, 1);
        assert!(result_rx.recv().await.is_none());
        drop(job_tx);
    }

    #[tokio::test]
    async fn test_status_checks_never_exceed_concurrency() {
        let analysis = Arc::new(ScriptedAnalysis::new().with_poll_delay(Duration::from_millis(20)));
        let keys: Vec<String> = (0..10).map(|i| format!("b/r{}.png", i)).collect();
        let keys: Vec<&str> = keys.iter().map(String::as_str).collect();

        let (results, stats) = track(analysis.clone(), fast_policy(), &keys).await;

        assert_eq!(results.len(), 10);
        assert_eq!(stats.polls, 10);
        let peak = analysis.polls_in_flight.peak();
        assert!(peak <= 4, "peak was {}", peak);
        assert!(peak > 1);
    }
}
