//! Fixed-size pool of OS worker threads that drain the admission scheduler.
//!
//! Each worker owns a single-threaded tokio runtime. The blocking
//! [`AdmissionScheduler::acquire`] call happens on the worker thread outside
//! that runtime; only the driver's provisioning and polling run inside it.
//!
//! ```rust,ignore
//! let pool = HarvestPool::new(&config);
//! let report = pool.run(Arc::new(scheduler), Arc::new(driver))?;
//! println!("collected {} of {}", report.collected, report.outcomes.len());
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::HarvestConfig;
use crate::core::{
    AdmissionScheduler, DriveReport, Driver, HarvestError, SchedulerStats, Teardown,
};

/// Progress message sent from a worker to the pool owner.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// An admitted item was driven to completion (successfully or not).
    Finished {
        /// Worker index.
        worker_id: usize,
        /// What happened to the item.
        report: DriveReport,
    },
    /// Driving an item panicked; its capacity was withheld and the worker exited.
    Panicked {
        /// Worker index.
        worker_id: usize,
        /// Instance type that was being driven.
        instance_type: String,
    },
    /// The worker could not build its runtime and never acquired anything.
    RuntimeFailed {
        /// Worker index.
        worker_id: usize,
        /// Builder error text.
        reason: String,
    },
    /// The worker saw the empty sentinel and stopped.
    Exited {
        /// Worker index.
        worker_id: usize,
        /// Items this worker drove.
        processed: usize,
    },
}

/// Aggregate outcome of one pool run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HarvestReport {
    /// Items whose result was persisted.
    pub collected: usize,
    /// Items admitted but not collected.
    pub failed: usize,
    /// Items whose driving panicked.
    pub abandoned: usize,
    /// Items whose capacity stayed debited after teardown.
    pub withheld: usize,
    /// Workers that exited through a panic.
    pub panicked_workers: usize,
    /// Final scheduler counters.
    pub stats: SchedulerStats,
    /// Per-item reports in completion order.
    #[serde(skip)]
    pub outcomes: Vec<DriveReport>,
}

impl HarvestReport {
    fn record(&mut self, report: DriveReport) {
        if report.collected() {
            self.collected += 1;
        } else {
            self.failed += 1;
        }
        if report.teardown == Teardown::Unconfirmed {
            self.withheld += 1;
        }
        self.outcomes.push(report);
    }
}

/// Bounded pool of worker threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestPool {
    worker_count: usize,
    thread_stack_size: usize,
}

impl HarvestPool {
    /// Pool sized from configuration.
    #[must_use]
    pub const fn new(config: &HarvestConfig) -> Self {
        Self {
            worker_count: config.worker_count,
            thread_stack_size: config.thread_stack_size,
        }
    }

    /// Override the number of workers.
    #[must_use]
    pub const fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Configured worker count.
    #[must_use]
    pub const fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Run every worker until the scheduler reports an empty queue.
    ///
    /// Blocks the calling thread until all workers have exited.
    ///
    /// # Errors
    ///
    /// [`HarvestError::InvalidConfig`] if the driver's settings fail
    /// validation, and [`HarvestError::Pool`] if the pool is configured with
    /// zero workers or no worker thread could be spawned.
    pub fn run(
        &self,
        scheduler: Arc<AdmissionScheduler>,
        driver: Arc<Driver>,
    ) -> Result<HarvestReport, HarvestError> {
        if self.worker_count == 0 {
            return Err(HarvestError::Pool("worker_count must be greater than 0".into()));
        }
        driver
            .settings()
            .validate()
            .map_err(HarvestError::InvalidConfig)?;

        let (event_tx, event_rx) = unbounded::<WorkerEvent>();
        let mut workers: Vec<JoinHandle<()>> = Vec::with_capacity(self.worker_count);

        for worker_id in 0..self.worker_count {
            match spawn_worker(
                worker_id,
                Arc::clone(&scheduler),
                Arc::clone(&driver),
                event_tx.clone(),
                self.thread_stack_size,
            ) {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    error!(worker_id, error = %e, "failed to spawn worker thread");
                    if workers.is_empty() {
                        return Err(HarvestError::Pool(format!("spawn worker {worker_id}: {e}")));
                    }
                    break;
                }
            }
        }
        drop(event_tx);

        info!(
            worker_count = workers.len(),
            pending = scheduler.pending_len(),
            "harvest pool started"
        );

        let mut report = HarvestReport::default();
        // Ends once every worker has dropped its sender.
        for event in &event_rx {
            match event {
                WorkerEvent::Finished { worker_id, report: item } => {
                    debug!(
                        worker_id,
                        instance_type = %item.instance_type,
                        collected = item.collected(),
                        "worker finished item"
                    );
                    report.record(item);
                }
                WorkerEvent::Panicked { worker_id, instance_type } => {
                    error!(worker_id, instance_type = %instance_type, "worker panicked while driving item");
                    report.abandoned += 1;
                    report.withheld += 1;
                    report.panicked_workers += 1;
                }
                WorkerEvent::RuntimeFailed { worker_id, reason } => {
                    error!(worker_id, %reason, "worker runtime unavailable");
                }
                WorkerEvent::Exited { worker_id, processed } => {
                    debug!(worker_id, processed, "worker exited");
                }
            }
        }

        for (worker_id, handle) in workers.into_iter().enumerate() {
            if handle.join().is_err() {
                warn!(worker_id, "worker thread panicked outside item processing");
                report.panicked_workers += 1;
            }
        }

        report.stats = scheduler.stats();
        info!(
            collected = report.collected,
            failed = report.failed,
            abandoned = report.abandoned,
            withheld = report.withheld,
            dropped = report.stats.dropped,
            "harvest pool finished"
        );
        Ok(report)
    }
}

fn spawn_worker(
    worker_id: usize,
    scheduler: Arc<AdmissionScheduler>,
    driver: Arc<Driver>,
    events: Sender<WorkerEvent>,
    stack_size: usize,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("harvest-worker-{worker_id}"))
        .stack_size(stack_size)
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = events.send(WorkerEvent::RuntimeFailed {
                        worker_id,
                        reason: e.to_string(),
                    });
                    return;
                }
            };

            let mut processed = 0;
            while let Some(admission) = scheduler.acquire() {
                let item = admission.item().clone();
                debug!(worker_id, instance_type = %item, "worker picked up item");

                let driven = catch_unwind(AssertUnwindSafe(|| rt.block_on(driver.drive(&item))));
                processed += 1;
                match driven {
                    Ok(report) => {
                        if let Err(e) = scheduler.release(admission, report.teardown) {
                            error!(worker_id, error = %e, "release rejected");
                        }
                        let _ = events.send(WorkerEvent::Finished { worker_id, report });
                    }
                    Err(_) => {
                        // The instance may still be live; keep its capacity debited.
                        if let Err(e) = scheduler.release(admission, Teardown::Unconfirmed) {
                            error!(worker_id, error = %e, "release rejected");
                        }
                        let _ = events.send(WorkerEvent::Panicked {
                            worker_id,
                            instance_type: item.instance_type().to_owned(),
                        });
                        return;
                    }
                }
            }

            let _ = events.send(WorkerEvent::Exited { worker_id, processed });
        })
}
