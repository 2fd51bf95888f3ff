//! Fast-store capacity measurement and threshold-triggered eviction.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cortex_core::{
    entry_size, CapacityLevel, Error, EventBus, FastStore, Result, StorageConfig, StorageEvent,
    UsageReport,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::eviction::EvictionPolicy;

/// Total bytes charged by every entry of the store.
pub fn measure_bytes(store: &dyn FastStore) -> Result<u64> {
    let mut total = 0;
    for key in store.keys()? {
        if let Some(value) = store.get(&key)? {
            total += entry_size(&key, &value);
        }
    }
    Ok(total)
}

/// Outcome of one [`CapacityMonitor::monitor`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityCheck {
    /// Level measured before any eviction.
    pub observed: CapacityLevel,
    /// Level after eviction (equal to `observed` when nothing ran).
    pub level: CapacityLevel,
    pub bytes_used: u64,
    pub bytes_freed: u64,
}

impl CapacityCheck {
    pub fn evicted(&self) -> bool {
        self.bytes_freed > 0
    }
}

/// Watches fast-store usage and reduces it when it becomes critical.
pub struct CapacityMonitor {
    store: Arc<dyn FastStore>,
    policy: EvictionPolicy,
    warning_bytes: u64,
    critical_bytes: u64,
    events: EventBus,
    last_level: Mutex<CapacityLevel>,
}

impl CapacityMonitor {
    pub fn new(
        store: Arc<dyn FastStore>,
        policy: EvictionPolicy,
        config: &StorageConfig,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            policy,
            warning_bytes: config.warning_bytes,
            critical_bytes: config.critical_bytes,
            events,
            last_level: Mutex::new(CapacityLevel::Normal),
        }
    }

    /// Per-key usage of the fast store.
    pub fn measure(&self) -> Result<UsageReport> {
        let mut report = UsageReport {
            capacity_bytes: self.store.capacity_bytes(),
            ..UsageReport::default()
        };
        for key in self.store.keys()? {
            if let Some(value) = self.store.get(&key)? {
                let size = entry_size(&key, &value);
                report.bytes_used += size;
                report.item_sizes.insert(key, size);
            }
        }
        Ok(report)
    }

    pub fn classify(&self, usage: &UsageReport) -> CapacityLevel {
        self.classify_bytes(usage.bytes_used)
    }

    pub fn classify_bytes(&self, bytes_used: u64) -> CapacityLevel {
        if bytes_used >= self.critical_bytes {
            CapacityLevel::Critical
        } else if bytes_used >= self.warning_bytes {
            CapacityLevel::Warning
        } else {
            CapacityLevel::Normal
        }
    }

    /// The `n` largest keys, biggest first.
    pub fn largest_items(&self, n: usize) -> Result<Vec<(String, u64)>> {
        let report = self.measure()?;
        Ok(report
            .largest(n)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect())
    }

    /// Measure, classify and evict down below the warning threshold if critical.
    pub fn monitor(&self) -> Result<CapacityCheck> {
        let start = Instant::now();
        let bytes_used = measure_bytes(self.store.as_ref())?;
        let observed = self.classify_bytes(bytes_used);

        let check = match observed {
            CapacityLevel::Normal => {
                debug!(
                    subsystem = "store",
                    component = "capacity",
                    op = "monitor",
                    bytes_used,
                    level = %observed,
                    "Capacity normal"
                );
                CapacityCheck {
                    observed,
                    level: observed,
                    bytes_used,
                    bytes_freed: 0,
                }
            }
            CapacityLevel::Warning => {
                info!(
                    subsystem = "store",
                    component = "capacity",
                    op = "monitor",
                    bytes_used,
                    warning_bytes = self.warning_bytes,
                    "Fast store above warning threshold"
                );
                CapacityCheck {
                    observed,
                    level: observed,
                    bytes_used,
                    bytes_freed: 0,
                }
            }
            CapacityLevel::Critical => {
                warn!(
                    subsystem = "store",
                    component = "capacity",
                    op = "monitor",
                    bytes_used,
                    critical_bytes = self.critical_bytes,
                    "Fast store critical, running eviction"
                );
                let bytes_freed = self.policy.run_until(self.warning_bytes);
                let after = measure_bytes(self.store.as_ref())?;
                if bytes_freed > 0 {
                    self.events.emit(StorageEvent::EvictionRan { bytes_freed });
                }
                CapacityCheck {
                    observed,
                    level: self.classify_bytes(after),
                    bytes_used: after,
                    bytes_freed,
                }
            }
        };

        self.record_level(check.level, check.bytes_used);
        debug!(
            subsystem = "store",
            component = "capacity",
            level = %check.level,
            bytes_freed = check.bytes_freed,
            duration_ms = start.elapsed().as_millis() as u64,
            "Capacity check complete"
        );
        Ok(check)
    }

    fn record_level(&self, level: CapacityLevel, bytes_used: u64) {
        let mut last = self
            .last_level
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *last != level {
            let from = *last;
            *last = level;
            drop(last);
            self.events.emit(StorageEvent::CapacityChanged {
                from,
                to: level,
                bytes_used,
            });
        }
    }

    /// Run [`monitor`](Self::monitor) every `interval` until shut down.
    pub fn spawn_periodic(self: Arc<Self>, interval: Duration) -> MonitorHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let task = tokio::spawn(async move {
            info!(
                subsystem = "store",
                component = "capacity",
                interval_ms = interval.as_millis() as u64,
                "Capacity monitor started"
            );
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!(subsystem = "store", component = "capacity", "Capacity monitor received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.monitor() {
                            error!(subsystem = "store", component = "capacity", error = %e, "Periodic capacity check failed");
                        }
                    }
                }
            }
        });

        MonitorHandle { shutdown_tx, task }
    }
}

/// Handle to a periodic monitor task.
pub struct MonitorHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Stop the timer and wait for the task to exit.
    pub async fn shutdown(self) -> Result<()> {
        // A closed channel means the task already exited.
        let _ = self.shutdown_tx.send(()).await;
        self.task
            .await
            .map_err(|e| Error::Transaction(format!("capacity monitor task failed: {e}")))
    }
}
