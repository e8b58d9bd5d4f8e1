//! Cluster-wide scheduled jobs.
//!
//! Jobs are scheduled by minute of the day. Every node of the cluster runs
//! the same schedule; when a job comes due, each node tries to take the
//! job's `cron` lock and only the node that gets it runs the job.
//!
//! Each job runs at a fixed minute past the hour derived from its name, so
//! jobs scheduled for the same hour do not all fire at :00.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, Timelike};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use nodemesh_proto::defaults::MINUTES_PER_DAY;
use nodemesh_proto::error::{PeerError, PeerResult};
use nodemesh_proto::hash::job_minute_of_hour;
use nodemesh_proto::lock::Lock;

use crate::config::CoordinatorConfig;
use crate::coordinator::PeerCoordinator;

/// A job run on one node of the cluster at a time.
#[async_trait]
pub trait CronJob: Send + Sync + 'static {
    /// Cluster-wide identity of the job; also names its lock.
    fn name(&self) -> &str;

    async fn run(&self) -> PeerResult<()>;
}

struct Inner {
    peers: PeerCoordinator,
    /// Jobs by minute of the day.
    jobs: DashMap<u32, Vec<Arc<dyn CronJob>>>,
    /// Jobs running on this node, with the lock they hold.
    running: DashMap<String, Lock>,
    tick: Duration,
    jitter: Duration,
    shutdown: Notify,
}

/// Runs scheduled jobs exactly once per scheduled minute across the cluster.
#[derive(Clone)]
pub struct ScheduledJobCoordinator {
    inner: Arc<Inner>,
}

impl ScheduledJobCoordinator {
    pub fn new(peers: PeerCoordinator, config: &CoordinatorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                peers,
                jobs: DashMap::new(),
                running: DashMap::new(),
                tick: config.cron_tick,
                jitter: config.cron_jitter,
                shutdown: Notify::new(),
            }),
        }
    }

    /// Run `job` every `hours` hours, starting at midnight. Hours that do
    /// not divide 24 leave a shorter gap before midnight.
    pub fn schedule_every(&self, hours: u32, job: Arc<dyn CronJob>) -> PeerResult<()> {
        if hours == 0 || hours > 24 {
            return Err(PeerError::InvalidParms);
        }
        let offset = job_minute_of_hour(job.name());
        for base in (0..MINUTES_PER_DAY).step_by((hours * 60) as usize) {
            self.add(base + offset, job.clone());
        }
        info!("cron: scheduled {} every {} hour(s) at :{:02}", job.name(), hours, offset);
        Ok(())
    }

    /// Run `job` once a day during `hour`.
    pub fn schedule_at(&self, hour: u32, job: Arc<dyn CronJob>) -> PeerResult<()> {
        if hour >= 24 {
            return Err(PeerError::InvalidParms);
        }
        let offset = job_minute_of_hour(job.name());
        self.add(hour * 60 + offset, job.clone());
        info!("cron: scheduled {} daily at {:02}:{:02}", job.name(), hour, offset);
        Ok(())
    }

    fn add(&self, minute: u32, job: Arc<dyn CronJob>) {
        self.inner.jobs.entry(minute).or_default().push(job);
    }

    /// Remove every schedule entry of the job called `name`.
    pub fn unschedule(&self, name: &str) -> bool {
        let mut removed = false;
        self.inner.jobs.retain(|_, jobs| {
            let before = jobs.len();
            jobs.retain(|job| job.name() != name);
            removed |= jobs.len() != before;
            !jobs.is_empty()
        });
        removed
    }

    /// Minutes of the day scheduled for `job_name`, in order.
    pub fn scheduled_minutes(&self, job_name: &str) -> Vec<u32> {
        let mut minutes: Vec<u32> = self
            .inner
            .jobs
            .iter()
            .filter(|entry| entry.value().iter().any(|job| job.name() == job_name))
            .map(|entry| *entry.key())
            .collect();
        minutes.sort_unstable();
        minutes
    }

    /// Minutes that passed between a tick at `prev` and one at `cur`,
    /// wrapping at midnight.
    pub fn due_minutes(prev: u32, cur: u32) -> Vec<u32> {
        if cur < prev {
            ((prev + 1)..MINUTES_PER_DAY).chain(0..=cur).collect()
        } else {
            ((prev + 1)..=cur).collect()
        }
    }

    /// Run everything scheduled after `prev` up to and including `cur`.
    pub fn process_minutes(&self, prev: u32, cur: u32) {
        for minute in Self::due_minutes(prev, cur) {
            self.execute_jobs(minute);
        }
    }

    /// Start every job scheduled for `minute`.
    pub fn execute_jobs(&self, minute: u32) -> Vec<JoinHandle<()>> {
        let jobs: Vec<Arc<dyn CronJob>> = match self.inner.jobs.get(&minute) {
            Some(jobs) => jobs.value().clone(),
            None => return Vec::new(),
        };
        jobs.into_iter()
            .map(|job| {
                let this = self.clone();
                tokio::spawn(async move { this.execute_job(job).await })
            })
            .collect()
    }

    async fn execute_job(&self, job: Arc<dyn CronJob>) {
        let name = job.name().to_string();
        if self.inner.running.contains_key(&name) {
            info!("cron: {} still running, skipping", name);
            return;
        }

        let lock = Lock::cron(&name);
        match self.inner.peers.acquire_lock(lock.clone()).await {
            Ok(Some(owner)) if owner == self.inner.peers.node_name() => {}
            Ok(Some(owner)) => {
                debug!("cron: {} runs on {}", name, owner);
                return;
            }
            Ok(None) => {
                debug!("cron: could not take {}", lock);
                return;
            }
            Err(e) => {
                warn!("cron: failed to acquire {}: {}", lock, e);
                return;
            }
        }

        match self.inner.running.entry(name.clone()) {
            Entry::Occupied(_) => {
                info!("cron: {} still running, skipping", name);
                return;
            }
            Entry::Vacant(entry) => {
                entry.insert(lock.clone());
            }
        }

        debug!("cron: running {}", name);
        let worker = tokio::spawn(async move { job.run().await });
        let outcome = match worker.await {
            Ok(result) => result,
            Err(e) => Err(PeerError::JobFailed(e.to_string())),
        };
        match outcome {
            Ok(()) => debug!("cron: {} finished", name),
            Err(e) => warn!("cron: {} failed: {}", name, e),
        }

        self.inner.running.remove(&name);
        if let Err(e) = self.inner.peers.release_lock(lock.clone()).await {
            warn!("cron: failed to release {}: {}", lock, e);
        }
    }

    /// Start ticking. The first tick lands on the next minute boundary.
    pub fn start(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            let now = Local::now();
            let mut prev = minute_of_day(&now);
            let mut delay = Duration::from_secs(60 - u64::from(now.second().min(59)));
            loop {
                tokio::select! {
                    _ = this.inner.shutdown.notified() => {
                        debug!("cron: ticker stopped");
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                let cur = minute_of_day(&Local::now());
                this.process_minutes(prev, cur);
                prev = cur;
                delay = this.next_delay();
            }
        });
    }

    fn next_delay(&self) -> Duration {
        let jitter = self.inner.jitter.as_millis() as u64;
        let offset = if jitter > 0 {
            rand::thread_rng().gen_range(0..jitter)
        } else {
            0
        };
        self.inner
            .tick
            .saturating_sub(Duration::from_millis(offset))
            .max(Duration::from_millis(1))
    }

    pub fn stop(&self) {
        self.inner.shutdown.notify_one();
    }
}

fn minute_of_day<T: Timelike>(time: &T) -> u32 {
    time.hour() * 60 + time.minute()
}
