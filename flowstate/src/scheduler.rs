//! Periodic maintenance driver
//!
//! Runs [`FlowTable::run_maintenance_until`] once per tick on the blocking
//! pool, so a long sweep never stalls the async workers. Shutdown is a
//! broadcast signal; it also raises the cancel flag, which stops an
//! in-flight pass at the next bucket boundary.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::table::{FlowTable, TickReport};

/// Drives maintenance passes for one table
#[derive(Debug)]
pub struct MaintenanceScheduler {
    table: Arc<FlowTable>,
    shutdown_tx: broadcast::Sender<()>,
    cancel: Arc<AtomicBool>,
    active: AtomicBool,
    last_report: Mutex<Option<TickReport>>,
    ticks: AtomicU64,
}

impl MaintenanceScheduler {
    /// Create a scheduler for `table`
    #[must_use]
    pub fn new(table: Arc<FlowTable>) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            table,
            shutdown_tx,
            cancel: Arc::new(AtomicBool::new(false)),
            active: AtomicBool::new(true),
            last_report: Mutex::new(None),
            ticks: AtomicU64::new(0),
        })
    }

    /// Start the maintenance loop on the current runtime
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        // Subscribe before spawning so an early shutdown is not missed
        let shutdown_rx = self.shutdown_tx.subscribe();
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run(shutdown_rx).await })
    }

    async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut period = self.table.tick_interval();
        let mut timer = make_interval(period);
        info!(tick = ?period, "Maintenance scheduler started");

        loop {
            if !self.is_active() {
                break;
            }

            tokio::select! {
                _ = timer.tick() => {
                    let table = Arc::clone(&self.table);
                    let cancel = Arc::clone(&self.cancel);
                    match tokio::task::spawn_blocking(move || table.run_maintenance_until(&cancel)).await {
                        Ok(report) => self.record(report),
                        Err(e) => error!(error = %e, "Maintenance pass failed"),
                    }

                    // Pick up a reconfigured tick
                    let next = self.table.tick_interval();
                    if next != period {
                        debug!(from = ?period, to = ?next, "Maintenance tick changed");
                        period = next;
                        timer = make_interval(period);
                    }
                }

                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }

        info!(ticks = self.ticks(), "Maintenance scheduler stopped");
    }

    fn record(&self, report: TickReport) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        if report.cancelled {
            debug!("Maintenance pass cancelled");
        }
        *self.last_report.lock() = Some(report);
    }

    /// Stop the loop and cancel any pass in progress
    pub fn shutdown(&self) {
        info!("Shutting down maintenance scheduler");
        self.active.store(false, Ordering::SeqCst);
        self.cancel.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(());
    }

    /// Whether the scheduler has not been shut down
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Report of the most recent completed pass
    pub fn last_report(&self) -> Option<TickReport> {
        self.last_report.lock().clone()
    }

    /// Completed passes
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// The table being maintained
    pub fn table(&self) -> &Arc<FlowTable> {
        &self.table
    }

    /// Subscribe to shutdown signal
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }
}

/// Interval whose first tick is one period away
fn make_interval(period: std::time::Duration) -> Interval {
    let mut timer = time::interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}
