//! Task-server worker pool.
//!
//! One task-server process per host: a well-known TCP port acts as the
//! mutex, and a second instance exits cleanly. On start, tasks locked
//! by a previous instance of this host are reset to pending. A fixed
//! pool of workers then drains the queue: claim (conditional update),
//! execute, store the outcome, sweep expired rows.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::metrics::Metrics;

use super::functions::{self, TaskContext};
use super::service::TaskService;
use super::types::Task;

/// Queue poll interval.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Expired-task sweep interval.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// The task-server process body.
pub struct TaskRunner {
    service: TaskService,
    ctx: TaskContext,
    metrics: Arc<Metrics>,
    workers: usize,
    port: u16,
}

impl TaskRunner {
    pub fn new(
        service: TaskService,
        ctx: TaskContext,
        metrics: Arc<Metrics>,
        workers: usize,
        port: u16,
    ) -> Self {
        Self {
            service,
            ctx,
            metrics,
            workers,
            port,
        }
    }

    /// Run until SIGTERM/ctrl-c. Returns immediately (cleanly) when
    /// another instance already holds the port.
    pub async fn run(self) -> Result<()> {
        // Bind the well-known port as a single-instance mutex.
        let _mutex = match TcpListener::bind(("127.0.0.1", self.port)).await {
            Ok(listener) => listener,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                info!(port = self.port, "task server already running on this host, exiting");
                return Ok(());
            }
            Err(e) => {
                return Err(e).context("failed to bind task server port");
            }
        };

        // Crash recovery: tasks still locked to this host were in flight
        // when the previous instance died.
        self.service
            .reset_stale(&format!("{}_", hostname()))
            .await?;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        spawn_signal_handler(shutdown_tx);

        let permits = Arc::new(Semaphore::new(self.workers));
        let mut running: JoinSet<()> = JoinSet::new();
        let mut worker_seq = 0u64;
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(workers = self.workers, port = self.port, "task server started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            // Reap finished workers without blocking.
            while running.try_join_next().is_some() {}

            let free = permits.available_permits();
            if free > 0 {
                match self.service.peek_pending(free as i64).await {
                    Ok(pending) => {
                        for task in pending {
                            worker_seq += 1;
                            let lock_id = format!("{}_{}", hostname(), worker_seq);
                            match self.service.claim(task.id, &lock_id).await {
                                Ok(Some(claimed)) => {
                                    let Ok(permit) =
                                        Arc::clone(&permits).acquire_owned().await
                                    else {
                                        break;
                                    };
                                    let service = self.service.clone();
                                    let ctx = self.ctx.clone();
                                    let metrics = Arc::clone(&self.metrics);
                                    running.spawn(async move {
                                        execute(service, ctx, metrics, claimed).await;
                                        drop(permit);
                                    });
                                }
                                // Lost the claim race to another pool.
                                Ok(None) => {}
                                Err(e) => warn!(error = %e, "task claim failed"),
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "task poll failed"),
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = sweep.tick() => {
                    if let Err(e) = self.service.purge_expired().await {
                        warn!(error = %e, "task sweep failed");
                    }
                }
                _ = shutdown_rx.changed() => {}
            }
        }

        // Graceful shutdown: stop dispatching, join in-flight workers.
        // Tasks not yet finished stay locked and are recovered by the
        // next instance.
        info!("task server draining");
        while running.join_next().await.is_some() {}
        info!("task server stopped");
        Ok(())
    }
}

async fn execute(service: TaskService, ctx: TaskContext, metrics: Arc<Metrics>, task: Task) {
    let Some(params) = task.typed_params() else {
        error!(task_id = %task.id, funcname = %task.funcname, "task has undecodable params");
        let outcome =
            super::types::TaskOutcome::failed("InvalidParameter", "undecodable parameters");
        if let Err(e) = service.complete(task.id, &outcome).await {
            error!(error = %e, task_id = %task.id, "failed to store task outcome");
        }
        return;
    };

    info!(task_id = %task.id, function = %task.funcname, "task started");
    metrics.tasks_running.inc();

    let outcome = functions::run(&ctx, &params).await;

    metrics.tasks_running.dec();
    metrics.tasks_completed.inc();

    if outcome.is_failure() {
        warn!(task_id = %task.id, function = %task.funcname, ?outcome, "task failed");
    } else {
        info!(task_id = %task.id, function = %task.funcname, "task completed");
    }

    if let Err(e) = service.complete(task.id, &outcome).await {
        error!(error = %e, task_id = %task.id, "failed to store task outcome");
    }
}

fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    let _ = shutdown_tx.send(true);
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }

        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });
}

/// Hostname for lock identification.
fn hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn hostname_is_nonempty() {
        assert!(!hostname().is_empty());
    }

    #[tokio::test]
    async fn port_mutex_blocks_second_instance() {
        let first = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = first.local_addr().unwrap().port();

        // A second bind on the same port fails with AddrInUse, which the
        // runner treats as a clean exit.
        let second = TcpListener::bind(("127.0.0.1", port)).await;
        assert_eq!(
            second.unwrap_err().kind(),
            std::io::ErrorKind::AddrInUse
        );
    }
}
