//! Background worker lifecycle
//!
//! [`WorkerHandle`] runs one cancellable loop on the tokio runtime. Publisher,
//! Listener and DiscoveryService each own one and expose it through the
//! [`Lifecycle`] trait.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use crate::error::{MulticastError, Result};

/// Start/stop contract shared by every background worker
pub trait Lifecycle {
    /// Spawn the background loop. No-op when already running.
    fn start(&self) -> Result<()>;

    /// Signal the loop, release its resources and wait up to `timeout` for it
    /// to finish. Safe to call repeatedly and from any task.
    fn stop(&self, timeout: Duration) -> impl Future<Output = ()> + Send;

    fn is_running(&self) -> bool;
}

/// Run `body` with `worker` started, stopping it afterwards
pub async fn scoped<W, F, Fut, T>(worker: &W, timeout: Duration, body: F) -> Result<T>
where
    W: Lifecycle,
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    worker.start()?;
    let out = body().await;
    worker.stop(timeout).await;
    Ok(out)
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns at most one running background task and its stop signal
pub struct WorkerHandle {
    name: &'static str,
    running: Mutex<Option<Running>>,
}

impl WorkerHandle {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    /// Spawn `body` with a fresh cancellation token.
    ///
    /// Returns `Ok(false)` without calling `body` if a task is already alive.
    /// A panic inside the loop is logged and ends the task, nothing more.
    pub fn spawn<F, Fut>(&self, body: F) -> Result<bool>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return Ok(false);
        }

        let runtime = Handle::try_current().map_err(|_| MulticastError::NoRuntime)?;
        let cancel = CancellationToken::new();
        let work = body(cancel.clone());
        let name = self.name;

        tracing::debug!(worker = name, "Starting worker task");
        let task = runtime.spawn(async move {
            if let Err(panic) = AssertUnwindSafe(work).catch_unwind().await {
                tracing::error!(worker = name, "Worker task panicked: {}", panic_message(&*panic));
            }
            tracing::debug!(worker = name, "Worker task finished");
        });

        *running = Some(Running { cancel, task });
        Ok(true)
    }

    /// Cancel, run `cleanup`, then wait up to `timeout` for the task.
    ///
    /// A task that outlives the timeout is logged and aborted.
    pub async fn stop(&self, timeout: Duration, cleanup: impl FnOnce()) {
        let running = self.running.lock().take();
        let Some(Running { cancel, mut task }) = running else {
            cleanup();
            return;
        };

        tracing::debug!(worker = self.name, "Stopping worker");
        cancel.cancel();
        cleanup();

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_cancelled() => {}
            Ok(Err(e)) => tracing::error!(worker = self.name, "Worker task failed: {}", e),
            Err(_) => {
                tracing::warn!(
                    worker = self.name,
                    "Worker did not stop within {:?}, aborting",
                    timeout
                );
                task.abort();
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            if !running.task.is_finished() {
                tracing::warn!(worker = self.name, "Worker dropped while still running");
                running.cancel.cancel();
            }
        }
    }
}

/// Fail with `NoRuntime` unless called from inside a tokio runtime
pub fn ensure_runtime() -> Result<()> {
    Handle::try_current()
        .map(|_| ())
        .map_err(|_| MulticastError::NoRuntime)
}

/// Wait for `duration` unless cancelled first. Returns true if cancelled.
pub async fn wait_or_cancelled(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
