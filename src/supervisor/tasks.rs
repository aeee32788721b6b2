//! Supervised task spawning.
//!
//! Every long-running worker in the service goes through [`spawn_supervised`]
//! so that nothing can die silently: a worker that returns an error or
//! panics is logged at `error` with a `critical` marker and relaunched after
//! a short backoff. Workers that return `Ok` after a shutdown signal are
//! treated as cleanly finished and left down.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Delay before relaunching a failed worker.
const RESTART_BACKOFF: Duration = Duration::from_secs(5);

/// A long-running unit of work owned by the supervisor.
///
/// State lives inside the worker value, behind an `Arc<Mutex<_>>`, so a
/// relaunch after a failure resumes with the same channels and file handles
/// rather than a cold replacement.
#[async_trait]
pub trait Worker: Send + 'static {
    /// Run until shutdown is signalled or a fatal error occurs. Returning
    /// `Ok` signals a clean exit; `Err` triggers a supervised relaunch.
    async fn run(&mut self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()>;
}

/// Launch `worker` under supervision. The returned handle resolves when the
/// worker exits cleanly or shutdown is signalled.
pub fn spawn_supervised<W: Worker>(
    name: &'static str,
    shutdown: watch::Receiver<bool>,
    worker: Arc<Mutex<W>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let run_worker = worker.clone();
            let run_shutdown = shutdown.clone();
            let handle =
                tokio::spawn(async move { run_worker.lock().await.run(run_shutdown).await });

            match handle.await {
                Ok(Ok(())) => {
                    info!(worker = name, "worker finished");
                    return;
                }
                Ok(Err(e)) => {
                    error!(worker = name, error = %e, "critical: worker failed, relaunching");
                }
                Err(join_err) if join_err.is_cancelled() => {
                    return;
                }
                Err(join_err) => {
                    error!(worker = name, error = %join_err, "critical: worker panicked, relaunching");
                }
            }

            if *shutdown.borrow() {
                return;
            }
            tokio::time::sleep(RESTART_BACKOFF).await;
            if *shutdown.borrow() {
                return;
            }
        }
    })
}

/// Convenience wrapper for workers expressible as a closure over cloneable
/// context. The closure is invoked once per (re)launch.
pub struct FnWorker<F> {
    factory: F,
}

impl<F, Fut> FnWorker<F>
where
    F: FnMut(watch::Receiver<bool>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
{
    pub fn new(factory: F) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self { factory }))
    }
}

#[async_trait]
impl<F, Fut> Worker for FnWorker<F>
where
    F: FnMut(watch::Receiver<bool>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
{
    async fn run(&mut self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        (self.factory)(shutdown).await
    }
}
