//! Keyed worker pool
//!
//! Jobs are routed to one of N lanes by hashing their ordering key. Each lane
//! is a bounded FIFO drained by a single task, so jobs sharing a key run
//! strictly in submission order while different keys proceed in parallel.
//! Every job runs in its own spawned task; a panic ends that job only, and a
//! job still running after `job_timeout` is aborted so it cannot hold its lane.

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::error::{IngestError, IngestResult};

/// Pool sizing, from `WORKER_COUNT`, `WORKER_QUEUE_DEPTH` and `WORKER_JOB_TIMEOUT_SECS`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub lanes: usize,
    pub depth: usize,
    /// Longest a single job may hold its lane
    pub job_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            lanes: 8,
            depth: 256,
            job_timeout: Duration::from_secs(120),
        }
    }
}

impl PoolConfig {
    pub fn from_env() -> IngestResult<Self> {
        let defaults = Self::default();
        let read = |name: &str, default: usize| -> IngestResult<usize> {
            match std::env::var(name) {
                Ok(raw) => raw
                    .trim()
                    .parse::<usize>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| IngestError::Config(format!("{} must be a positive integer", name))),
                Err(_) => Ok(default),
            }
        };
        Ok(Self {
            lanes: read("WORKER_COUNT", defaults.lanes)?,
            depth: read("WORKER_QUEUE_DEPTH", defaults.depth)?,
            job_timeout: Duration::from_secs(
                read("WORKER_JOB_TIMEOUT_SECS", defaults.job_timeout.as_secs() as usize)? as u64,
            ),
        })
    }
}

pub struct KeyedWorkerPool<J> {
    lanes: Vec<mpsc::Sender<J>>,
    workers: Vec<JoinHandle<()>>,
}

impl<J: Send + 'static> KeyedWorkerPool<J> {
    /// Start `config.lanes` lane tasks. Must be called inside a Tokio runtime.
    pub fn spawn<H, Fut>(config: PoolConfig, handler: H) -> Self
    where
        H: Fn(J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let lane_count = config.lanes.max(1);
        let job_timeout = config.job_timeout;
        let mut lanes = Vec::with_capacity(lane_count);
        let mut workers = Vec::with_capacity(lane_count);

        for lane in 0..lane_count {
            let (tx, mut rx) = mpsc::channel::<J>(config.depth.max(1));
            let handler = handler.clone();
            workers.push(tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    let mut task = tokio::spawn((*handler)(job));
                    match tokio::time::timeout(job_timeout, &mut task).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            if e.is_panic() {
                                tracing::error!(lane = lane, "Worker job panicked");
                            }
                        }
                        Err(_) => {
                            task.abort();
                            tracing::error!(
                                lane = lane,
                                timeout_secs = job_timeout.as_secs(),
                                "Worker job timed out, job dropped"
                            );
                        }
                    }
                }
                tracing::debug!(lane = lane, "Worker lane drained");
            }));
            lanes.push(tx);
        }

        tracing::info!(
            lanes = lane_count,
            depth = config.depth,
            job_timeout_secs = job_timeout.as_secs(),
            "Keyed worker pool started"
        );
        Self { lanes, workers }
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Lane index for `key`
    pub fn lane_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.lanes.len() as u64) as usize
    }

    /// Enqueue without waiting. A full lane is reported rather than awaited so
    /// the caller can answer its client immediately.
    pub fn submit(&self, key: &str, job: J) -> IngestResult<()> {
        let lane = self.lane_for(key);
        match self.lanes[lane].try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::warn!(lane = lane, key = %key, "Worker lane full, rejecting job");
                Err(IngestError::QueueSaturated)
            }
            Err(TrySendError::Closed(_)) => Err(IngestError::QueueClosed),
        }
    }

    /// Stop accepting jobs and wait for every queued job to finish
    pub async fn shutdown(self) {
        drop(self.lanes);
        for worker in self.workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Worker lane ended abnormally");
            }
        }
    }
}
