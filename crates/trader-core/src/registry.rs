//! Process-wide registries: exchange name lookup and running jobs.
//!
//! Both maps are initialized at process start and torn down at shutdown.
//! Jobs are addressed by uid; each runs on its own task behind a shutdown
//! channel and is restarted with backoff when it fails with anything other
//! than the shutdown cause.

use std::future::Future;
use std::sync::Arc;

use common::ExponentialBackoff;
use dashmap::DashMap;
use exchange_core::Exchange;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::TraderError;

/// Exchange name to adapter mapping. Names are case-insensitive.
#[derive(Default)]
pub struct ExchangeMap {
    inner: DashMap<String, Arc<dyn Exchange>>,
}

impl ExchangeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, exchange: Arc<dyn Exchange>) {
        self.inner
            .insert(exchange.name().to_lowercase(), exchange);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Exchange>, TraderError> {
        self.inner
            .get(&name.to_lowercase())
            .map(|e| e.value().clone())
            .ok_or_else(|| TraderError::UnknownExchange(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.iter().map(|e| e.key().clone()).collect()
    }
}

struct JobHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<(), TraderError>>,
}

/// Uid to running-task mapping with cooperative shutdown.
#[derive(Default)]
pub struct JobSet {
    jobs: DashMap<String, JobHandle>,
}

impl JobSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a supervised job. `job` is invoked with a fresh view of the
    /// job's shutdown channel and re-invoked after a backoff delay whenever
    /// it fails with a non-shutdown error.
    pub fn start<F, Fut>(&self, uid: &str, mut job: F) -> Result<(), TraderError>
    where
        F: FnMut(watch::Receiver<bool>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TraderError>> + Send + 'static,
    {
        if self.jobs.contains_key(uid) {
            return Err(TraderError::JobRunning(uid.to_string()));
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let job_uid = uid.to_string();
        let task = tokio::spawn(async move {
            let mut backoff = ExponentialBackoff::default();
            loop {
                match job(shutdown_rx.clone()).await {
                    Ok(()) => return Ok(()),
                    Err(err) if err.is_shutdown() => return Err(TraderError::Shutdown),
                    Err(err) => {
                        if *shutdown_rx.borrow() {
                            return Err(TraderError::Shutdown);
                        }
                        let delay = backoff.next_delay();
                        warn!(uid = %job_uid, error = %err, ?delay, "job failed (restarting)");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        });
        self.jobs.insert(
            uid.to_string(),
            JobHandle {
                shutdown: shutdown_tx,
                task,
            },
        );
        Ok(())
    }

    pub fn is_running(&self, uid: &str) -> bool {
        self.jobs.contains_key(uid)
    }

    pub fn uids(&self) -> Vec<String> {
        self.jobs.iter().map(|e| e.key().clone()).collect()
    }

    /// Signal shutdown to a job and wait for it to return. The shutdown
    /// cause itself is not an error.
    pub async fn stop(&self, uid: &str) -> Result<(), TraderError> {
        let (_, job) = self
            .jobs
            .remove(uid)
            .ok_or_else(|| TraderError::UnknownJob(uid.to_string()))?;
        let _ = job.shutdown.send(true);
        match job.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) if err.is_shutdown() => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(err) => Err(TraderError::Internal(format!("job task failed: {err}"))),
        }
    }

    /// Stop every running job.
    pub async fn stop_all(&self) {
        for uid in self.uids() {
            if let Err(err) = self.stop(&uid).await {
                warn!(uid = %uid, error = %err, "job did not stop cleanly");
            }
        }
    }
}
