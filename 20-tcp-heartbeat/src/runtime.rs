use std::future::Future;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::warn;

/// Shutdown signal plus the set of tasks that must observe it.
///
/// Every loop gets a clone of the token when it is spawned; `shutdown`
/// cancels it and waits for each tracked task to return.
#[derive(Debug, Clone, Default)]
pub struct Lifecycle {
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tasks.spawn(task)
    }

    /// Number of tracked tasks that have not finished yet.
    pub fn active_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Resolves once every task spawned so far has returned on its own.
    pub async fn finished(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

/// Drives `future` to completion on a current-thread runtime, so exactly one
/// task runs at a time and tasks only switch at `.await` points.
pub fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    Ok(runtime.block_on(future))
}

/// Resolves on Ctrl-C. If the handler cannot be installed this resolves
/// immediately, which the callers treat as a shutdown request.
pub async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = ?err, "failed to install ctrl-c handler");
    }
}
