use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::catalog::EndpointCatalog;
use super::transport::{ProbeRequest, ProbeTransport};
use super::{classify, EndpointInfo, Job, JobId, JobStatus, ProbeOutcome, ProbeResult};
use crate::clock::Clock;
use crate::config::ProbeConfig;
use crate::error::{ConfigError, ProbeError, TransportError};
use crate::metrics::MetricsAggregator;

// ─── Admission control ───────────────────────────────────────────

/// Cooldown and concurrency state shared by every `start_probe` call.
#[derive(Debug, Default)]
struct Admission {
    last_start: Option<Duration>,
    running: usize,
}

/// Holds one running-job slot; releases it when the job task ends,
/// however it ends.
struct RunningSlot {
    admission: Arc<Mutex<Admission>>,
}

impl Drop for RunningSlot {
    fn drop(&mut self) {
        let mut admission = self.admission.lock();
        admission.running = admission.running.saturating_sub(1);
    }
}

// ─── Job table ───────────────────────────────────────────────────

struct JobEntry {
    job: Job,
    status_tx: watch::Sender<JobStatus>,
}

#[derive(Default)]
struct JobTable {
    jobs: HashMap<JobId, JobEntry>,
    /// Insertion order, oldest first
    order: VecDeque<JobId>,
    last: Option<JobId>,
}

impl JobTable {
    fn insert(&mut self, job: Job) {
        let id = job.id;
        let (status_tx, _) = watch::channel(job.status);
        self.jobs.insert(id, JobEntry { job, status_tx });
        self.order.push_back(id);
        self.last = Some(id);
    }

    fn update<R>(&mut self, id: JobId, f: impl FnOnce(&mut Job) -> R) -> Option<R> {
        let entry = self.jobs.get_mut(&id)?;
        let before = entry.job.status;
        let out = f(&mut entry.job);
        if entry.job.status != before {
            entry.status_tx.send_replace(entry.job.status);
        }
        Some(out)
    }

    /// Drop the oldest finished jobs beyond `keep`. The most recently
    /// started job is never dropped.
    fn prune(&mut self, keep: usize) {
        while self.jobs.len() > keep {
            let Some(pos) = self.order.iter().position(|id| {
                Some(*id) != self.last
                    && self
                        .jobs
                        .get(id)
                        .map_or(true, |entry| entry.job.status.is_terminal())
            }) else {
                break;
            };
            if let Some(id) = self.order.remove(pos) {
                self.jobs.remove(&id);
            }
        }
    }
}

// ─── Manager ─────────────────────────────────────────────────────

/// Schedules synthetic probe jobs with a cooldown between starts, a cap on
/// concurrently running jobs and a deadline per job.
pub struct ProbeJobManager {
    config: ProbeConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsAggregator>,
    catalog: Arc<dyn EndpointCatalog>,
    transport: Arc<dyn ProbeTransport>,
    admission: Arc<Mutex<Admission>>,
    jobs: Mutex<JobTable>,
}

impl ProbeJobManager {
    pub fn new(
        config: ProbeConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsAggregator>,
        catalog: Arc<dyn EndpointCatalog>,
        transport: Arc<dyn ProbeTransport>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            clock,
            metrics,
            catalog,
            transport,
            admission: Arc::new(Mutex::new(Admission::default())),
            jobs: Mutex::new(JobTable::default()),
        })
    }

    /// Jobs admitted and not yet finished.
    pub fn running_jobs(&self) -> usize {
        self.admission.lock().running
    }

    /// Admit a new job and schedule it on the current tokio runtime.
    ///
    /// Returns as soon as the job is registered; execution continues in
    /// the background. Duplicate endpoint ids are probed once.
    pub fn start_probe(self: &Arc<Self>, endpoints: Vec<EndpointInfo>) -> Result<JobId, ProbeError> {
        let runtime = Handle::try_current().map_err(|_| ProbeError::NoRuntime)?;

        let now = self.clock.now();
        let slot = self.admit(now).map_err(|err| {
            warn!(error = %err, "Probe job rejected");
            err
        })?;

        let mut seen = HashSet::new();
        let endpoints: Vec<EndpointInfo> = endpoints
            .into_iter()
            .filter(|e| seen.insert(e.id.clone()))
            .collect();

        let id = Uuid::new_v4();
        self.jobs
            .lock()
            .insert(Job::queued(id, now, endpoints.len()));
        info!(job_id = %id, targets = endpoints.len(), "Probe job queued");

        let manager = Arc::clone(self);
        runtime.spawn(async move {
            manager.run_job(id, endpoints, slot).await;
        });

        Ok(id)
    }

    /// Cooldown and concurrency checks plus the state update, under one lock.
    fn admit(&self, now: Duration) -> Result<RunningSlot, ProbeError> {
        let mut admission = self.admission.lock();

        if let Some(last) = admission.last_start {
            let since = now.saturating_sub(last);
            if since < self.config.min_probe_interval {
                let wait = self.config.min_probe_interval - since;
                return Err(ProbeError::CooldownActive {
                    wait_seconds: wait.as_secs_f64(),
                });
            }
        }

        if admission.running >= self.config.max_concurrent_jobs {
            return Err(ProbeError::ConcurrencyLimitExceeded {
                running: admission.running,
                max: self.config.max_concurrent_jobs,
            });
        }

        admission.last_start = Some(now);
        admission.running += 1;
        Ok(RunningSlot {
            admission: Arc::clone(&self.admission),
        })
    }

    pub fn get_job(&self, id: JobId) -> Result<Job, ProbeError> {
        self.jobs
            .lock()
            .jobs
            .get(&id)
            .map(|entry| entry.job.clone())
            .ok_or(ProbeError::JobNotFound(id))
    }

    /// The most recently started job, if still retained.
    pub fn last_job(&self) -> Option<Job> {
        let table = self.jobs.lock();
        let id = table.last?;
        table.jobs.get(&id).map(|entry| entry.job.clone())
    }

    /// Wait until the job reaches a terminal state.
    pub async fn wait_for_completion(&self, id: JobId) -> Result<Job, ProbeError> {
        let mut status_rx = {
            let table = self.jobs.lock();
            let entry = table.jobs.get(&id).ok_or(ProbeError::JobNotFound(id))?;
            entry.status_tx.subscribe()
        };
        // A closed channel means the job was pruned; get_job reports that.
        let _ = status_rx.wait_for(|status| status.is_terminal()).await;
        self.get_job(id)
    }

    // ── Execution ───────────────────────────────────────────────

    async fn run_job(self: Arc<Self>, id: JobId, endpoints: Vec<EndpointInfo>, slot: RunningSlot) {
        let _slot = slot;

        let started_at = self.clock.now();
        let deadline = started_at + self.config.job_timeout;
        self.jobs
            .lock()
            .update(id, |job| job.transition(JobStatus::Running, started_at));
        info!(job_id = %id, "Probe job started");

        let cancel = CancellationToken::new();
        let fan_out = Arc::new(Semaphore::new(self.config.fan_out));
        let mut tasks = JoinSet::new();

        for endpoint in endpoints.iter().cloned() {
            let manager = Arc::clone(&self);
            let cancel = cancel.clone();
            let fan_out = Arc::clone(&fan_out);

            tasks.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    permit = fan_out.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                };
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {}
                    result = manager.probe_endpoint(&endpoint) => {
                        manager.record_result(id, &endpoint, result);
                    }
                }
            });
        }

        let drained = tokio::select! {
            biased;
            fault = drain(&mut tasks) => Ok(fault),
            _ = self.clock.sleep_until(deadline) => Err(()),
        };

        match drained {
            Ok(None) => self.finish(id, &endpoints, JobStatus::Completed, None),
            Ok(Some(fault)) => {
                error!(job_id = %id, error = %fault, "Probe job failed");
                self.finish(id, &endpoints, JobStatus::Failed, Some(fault));
            }
            Err(()) => {
                cancel.cancel();
                // Cancelled tasks get a short grace period to unwind,
                // stragglers are aborted.
                let grace_end = self.clock.now() + self.config.cancel_grace;
                tokio::select! {
                    biased;
                    _ = drain(&mut tasks) => {}
                    _ = self.clock.sleep_until(grace_end) => {}
                }
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}

                warn!(
                    job_id = %id,
                    timeout_secs = self.config.job_timeout.as_secs_f64(),
                    "Probe job timed out"
                );
                self.finish(id, &endpoints, JobStatus::Timeout, None);
            }
        }
    }

    async fn probe_endpoint(&self, endpoint: &EndpointInfo) -> ProbeResult {
        let Some(payload) = self.catalog.payload_for(endpoint) else {
            debug!(endpoint = %endpoint.id, "No usable payload, probe skipped");
            return ProbeResult::new(endpoint, ProbeOutcome::Skipped, self.clock.now());
        };

        let request = ProbeRequest::build(endpoint, &payload, self.config.probe_timeout);
        let start = self.clock.now();
        let response = tokio::select! {
            biased;
            response = self.transport.send(request) => Some(response),
            _ = self.clock.sleep_until(start + self.config.probe_timeout) => None,
        };
        let checked_at = self.clock.now();
        let latency = checked_at.saturating_sub(start);

        let mut result = ProbeResult::new(endpoint, ProbeOutcome::Critical, checked_at);
        result.payload_source = Some(payload.source);
        result.latency_ms = Some(latency.as_secs_f64() * 1_000.0);

        match response {
            Some(Ok(response)) => {
                result.outcome = classify(response.status, latency, self.config.latency_threshold);
                result.status_code = Some(response.status);
            }
            Some(Err(err)) => result.error = Some(err.to_string()),
            None => {
                let timeout_ms = self.config.probe_timeout.as_millis() as u64;
                result.error = Some(TransportError::Timeout(timeout_ms).to_string());
            }
        }

        debug!(
            endpoint = %endpoint.id,
            outcome = ?result.outcome,
            status = ?result.status_code,
            latency_ms = ?result.latency_ms,
            "Probe finished"
        );
        result
    }

    /// Append a result and forward it as a synthetic observation.
    fn record_result(&self, id: JobId, endpoint: &EndpointInfo, result: ProbeResult) {
        let forward = result
            .forwarded_status()
            .map(|status| (status, result.latency_ms.unwrap_or(0.0)));

        let accepted = self
            .jobs
            .lock()
            .update(id, |job| job.push_result(result))
            .unwrap_or(false);

        if let (true, Some((status, latency_ms))) = (accepted, forward) {
            self.metrics.record(endpoint.key(), status, latency_ms);
        }
    }

    /// Fill in results for endpoints that never reported, then move the
    /// job to its terminal state. A job that is already terminal is left
    /// untouched.
    fn finish(&self, id: JobId, endpoints: &[EndpointInfo], status: JobStatus, cause: Option<String>) {
        let filler = match status {
            JobStatus::Timeout => ProbeOutcome::Timeout,
            _ => ProbeOutcome::Error,
        };
        let now = self.clock.now();

        let mut table = self.jobs.lock();
        table.update(id, |job| {
            if job.status.is_terminal() {
                return;
            }
            for endpoint in endpoints {
                if !job.has_result(&endpoint.id) {
                    let mut result = ProbeResult::new(endpoint, filler, now);
                    if filler == ProbeOutcome::Timeout {
                        result.error = Some("job timed out before the probe finished".into());
                    }
                    job.push_result(result);
                }
            }
            job.error = cause;
            job.transition(status, now);
        });
        table.prune(self.config.max_retained_jobs);
        drop(table);

        info!(job_id = %id, status = ?status, "Probe job finished");
    }
}

/// Await every task. Returns the first fault (a panicked task), if any.
async fn drain(tasks: &mut JoinSet<()>) -> Option<String> {
    let mut fault = None;
    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            if err.is_panic() && fault.is_none() {
                fault = Some(panic_message(err));
            }
        }
    }
    fault
}

fn panic_message(err: JoinError) -> String {
    let payload = err.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("probe task panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("probe task panicked: {msg}")
    } else {
        "probe task panicked".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::probe::StaticCatalog;
    use crate::probe::transport::ProbeResponse;
    use async_trait::async_trait;

    struct AlwaysOk;

    #[async_trait]
    impl ProbeTransport for AlwaysOk {
        async fn send(&self, _request: ProbeRequest) -> Result<ProbeResponse, TransportError> {
            Ok(ProbeResponse { status: 200 })
        }
    }

    fn manager(config: ProbeConfig, clock: Arc<ManualClock>) -> Arc<ProbeJobManager> {
        let metrics = Arc::new(MetricsAggregator::with_defaults());
        Arc::new(
            ProbeJobManager::new(
                config,
                clock,
                metrics,
                Arc::new(StaticCatalog::new()),
                Arc::new(AlwaysOk),
            )
            .unwrap(),
        )
    }

    #[test]
    fn start_probe_outside_runtime_is_rejected_without_side_effects() {
        let m = manager(ProbeConfig::default(), Arc::new(ManualClock::new()));
        assert_eq!(m.start_probe(vec![]), Err(ProbeError::NoRuntime));
        assert_eq!(m.running_jobs(), 0);
        assert!(m.last_job().is_none());
    }

    #[test]
    fn admission_updates_are_atomic_across_threads() {
        let config = ProbeConfig {
            min_probe_interval: Duration::from_secs(30),
            max_concurrent_jobs: 10,
            ..Default::default()
        };
        let m = manager(config, Arc::new(ManualClock::new()));

        let outcomes: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..16).map(|_| s.spawn(|| m.admit(Duration::ZERO))).collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let admitted = outcomes.iter().filter(|r| r.is_ok()).count();
        let cooled = outcomes
            .iter()
            .filter(|r| matches!(r, Err(ProbeError::CooldownActive { .. })))
            .count();
        assert_eq!(admitted, 1);
        assert_eq!(cooled, 15);
        assert_eq!(m.running_jobs(), 1);
    }

    #[test]
    fn running_slot_is_released_on_drop() {
        let config = ProbeConfig {
            min_probe_interval: Duration::ZERO,
            max_concurrent_jobs: 1,
            ..Default::default()
        };
        let m = manager(config, Arc::new(ManualClock::new()));
        let slot = m.admit(Duration::ZERO).unwrap();
        assert!(matches!(
            m.admit(Duration::ZERO),
            Err(ProbeError::ConcurrencyLimitExceeded { running: 1, max: 1 })
        ));
        drop(slot);
        assert_eq!(m.running_jobs(), 0);
        assert!(m.admit(Duration::ZERO).is_ok());
    }

    #[test]
    fn prune_never_drops_the_latest_job() {
        let mut table = JobTable::default();
        let older = Job::queued(Uuid::new_v4(), Duration::ZERO, 0);
        let latest = Job::queued(Uuid::new_v4(), Duration::ZERO, 0);
        let (older_id, latest_id) = (older.id, latest.id);
        table.insert(older);
        table.insert(latest);
        // The older job is still live, the latest one finished at once.
        table.update(latest_id, |job| job.transition(JobStatus::Failed, Duration::ZERO));

        table.prune(1);
        assert_eq!(table.jobs.len(), 2);
        assert!(table.jobs.contains_key(&older_id));
        assert_eq!(table.last, Some(latest_id));
    }

    #[test]
    fn prune_keeps_unfinished_jobs() {
        let mut table = JobTable::default();
        let mut ids = Vec::new();
        for _ in 0..4 {
            let job = Job::queued(Uuid::new_v4(), Duration::ZERO, 0);
            ids.push(job.id);
            table.insert(job);
        }
        // Only the second job is finished.
        table.update(ids[1], |job| job.transition(JobStatus::Failed, Duration::ZERO));

        table.prune(2);
        assert_eq!(table.jobs.len(), 3);
        assert!(!table.jobs.contains_key(&ids[1]));
        assert_eq!(table.last, Some(ids[3]));
    }
}
