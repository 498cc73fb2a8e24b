//! In-memory service doubles for tests.

use super::{AnalysisService, ObjectStore};
use crate::error::ServiceError;
use crate::models::{JobId, RemoteObject, StatusReport};
use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Counts calls that are running at the same time.
#[derive(Default)]
pub struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlight {
    fn enter(&self) -> InFlightGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(self)
    }

    /// Highest number of simultaneous calls seen so far.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct InFlightGuard<'a>(&'a InFlight);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Object store keeping everything in a map.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
    failing_suffixes: Mutex<HashSet<String>>,
    put_delay: Option<Duration>,
    pub puts: InFlight,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every put, to keep uploads in flight.
    pub fn with_put_delay(mut self, delay: Duration) -> Self {
        self.put_delay = Some(delay);
        self
    }

    /// Make every put whose key ends with `suffix` fail with a transport error.
    pub fn fail_keys_ending_with(&self, suffix: &str) {
        self.failing_suffixes.lock().unwrap().insert(suffix.to_string());
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .unwrap()
            .keys()
            .map(|(_, key)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), ServiceError> {
        let _running = self.puts.enter();
        if let Some(delay) = self.put_delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .failing_suffixes
            .lock()
            .unwrap()
            .iter()
            .any(|suffix| key.ends_with(suffix.as_str()));
        if failing {
            return Err(ServiceError::Transport("simulated connection reset".to_string()));
        }
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.to_string(), key.to_string()), body);
        Ok(())
    }
}

/// One scripted reply to a status fetch.
#[derive(Debug, Clone)]
pub enum Reply {
    Status(&'static str),
    Error(ServiceError),
}

/// Analysis service whose status replies follow a per-key script.
///
/// Once a script is exhausted its last reply repeats. Keys without a script
/// succeed on the first poll.
#[derive(Default)]
pub struct ScriptedAnalysis {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    rejected_suffixes: Mutex<HashSet<String>>,
    jobs: Mutex<HashMap<JobId, String>>,
    polls: Mutex<HashMap<String, usize>>,
    submissions: AtomicUsize,
    submit_delay: Option<Duration>,
    poll_delay: Option<Duration>,
    pub submits_in_flight: InFlight,
    pub polls_in_flight: InFlight,
}

impl ScriptedAnalysis {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every submission, to keep requests in flight.
    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = Some(delay);
        self
    }

    /// Delay every status fetch, to keep jobs in flight.
    pub fn with_poll_delay(mut self, delay: Duration) -> Self {
        self.poll_delay = Some(delay);
        self
    }

    pub fn script(&self, key_suffix: &str, replies: Vec<Reply>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(key_suffix.to_string(), replies.into());
    }

    /// Reject submissions for keys ending with `suffix`.
    pub fn reject_submissions_ending_with(&self, suffix: &str) {
        self.rejected_suffixes.lock().unwrap().insert(suffix.to_string());
    }

    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    /// Number of status fetches made for the job whose key ends with `key_suffix`.
    pub fn polls_for(&self, key_suffix: &str) -> usize {
        self.polls
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.ends_with(key_suffix))
            .map(|(_, count)| *count)
            .sum()
    }

    fn next_reply(&self, key: &str) -> Reply {
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts
            .iter_mut()
            .find(|(suffix, _)| key.ends_with(suffix.as_str()))
            .map(|(_, script)| script);
        match script {
            Some(script) if script.len() > 1 => script.pop_front().unwrap_or(Reply::Status("SUCCEEDED")),
            Some(script) => script.front().cloned().unwrap_or(Reply::Status("SUCCEEDED")),
            None => Reply::Status("SUCCEEDED"),
        }
    }
}

#[async_trait]
impl AnalysisService for ScriptedAnalysis {
    async fn submit(&self, object: &RemoteObject) -> Result<JobId, ServiceError> {
        let _running = self.submits_in_flight.enter();
        if let Some(delay) = self.submit_delay {
            tokio::time::sleep(delay).await;
        }
        let rejected = self
            .rejected_suffixes
            .lock()
            .unwrap()
            .iter()
            .any(|suffix| object.key.ends_with(suffix.as_str()));
        if rejected {
            return Err(ServiceError::Rejected {
                status: 400,
                message: "LimitExceededException".to_string(),
            });
        }
        let n = self.submissions.fetch_add(1, Ordering::SeqCst);
        let job_id = JobId(format!("job-{}", n));
        self.jobs.lock().unwrap().insert(job_id.clone(), object.key.clone());
        Ok(job_id)
    }

    async fn get_status(&self, job_id: &JobId) -> Result<StatusReport, ServiceError> {
        let _running = self.polls_in_flight.enter();
        if let Some(delay) = self.poll_delay {
            tokio::time::sleep(delay).await;
        }
        let key = self
            .jobs
            .lock()
            .unwrap()
            .get(job_id)
            .cloned()
            .ok_or_else(|| ServiceError::Rejected {
                status: 400,
                message: "InvalidJobIdException".to_string(),
            })?;
        *self.polls.lock().unwrap().entry(key.clone()).or_insert(0) += 1;

        match self.next_reply(&key) {
            Reply::Status(status) => Ok(StatusReport {
                status: status.to_string(),
                payload: json!({
                    "JobStatus": status,
                    "ExpenseDocuments": [{
                        "SummaryFields": [{
                            "Type": {"Text": "VENDOR_NAME"},
                            "ValueDetection": {"Text": key}
                        }]
                    }]
                }),
            }),
            Reply::Error(e) => Err(e),
        }
    }
}
