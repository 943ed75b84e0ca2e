//! Health aggregation across both leaves.
//!
//! The overall status is the worst of the two leaf statuses. Semantic coverage
//! gaps (entries that only live in the structured leaf) are reported per
//! namespace but never lower the overall status.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::semantic::SemanticStore;
use crate::structured::StructuredStore;

/// Health of a leaf or of the whole backend, ordered by severity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn name(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    pub fn worst(self, other: HealthStatus) -> HealthStatus {
        self.max(other)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Health of one leaf.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeafHealth {
    pub status: HealthStatus,
    /// Live entries held by the leaf.
    pub entries: usize,
    /// Time of the last successful write.
    pub last_write_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub detail: Option<String>,
}

/// Point-in-time health of the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub structured: LeafHealth,
    pub semantic: LeafHealth,
    /// Per namespace, entries not yet present in the semantic leaf.
    pub semantic_coverage_gaps: BTreeMap<String, usize>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    /// Namespaces with at least one entry missing from the semantic leaf.
    pub fn degraded_namespaces(&self) -> Vec<&str> {
        self.semantic_coverage_gaps
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(namespace, _)| namespace.as_str())
            .collect()
    }
}

/// Computes health reports for a pair of leaves.
#[derive(Debug)]
pub struct HealthMonitor {
    structured: Arc<StructuredStore>,
    semantic: Arc<SemanticStore>,
    last: RwLock<Option<HealthReport>>,
    checks: AtomicU64,
}

impl HealthMonitor {
    pub fn new(structured: Arc<StructuredStore>, semantic: Arc<SemanticStore>) -> Self {
        HealthMonitor {
            structured,
            semantic,
            last: RwLock::new(None),
            checks: AtomicU64::new(0),
        }
    }

    /// Check both leaves now and remember the report.
    pub fn check(&self) -> HealthReport {
        let structured = self.structured.health();
        let semantic = self.semantic.health();
        let semantic_coverage_gaps = if self.structured.is_online() {
            self.structured.coverage_gaps()
        } else {
            BTreeMap::new()
        };

        let report = HealthReport {
            status: structured.status.worst(semantic.status),
            structured,
            semantic,
            semantic_coverage_gaps,
            checked_at: Utc::now(),
        };

        let previous = self.last.write().replace(report.clone());
        let previous_status = previous.map(|report| report.status);
        if previous_status.is_some_and(|status| status != report.status) {
            if report.status == HealthStatus::Healthy {
                info!("Backend health recovered: {}", report.status);
            } else {
                warn!(
                    "Backend health is {} (structured {}, semantic {})",
                    report.status, report.structured.status, report.semantic.status
                );
            }
        }
        self.checks.fetch_add(1, Ordering::Relaxed);
        debug!("Health check: {}", report.status);
        report
    }

    /// The most recent report, if any check ran.
    pub fn last_report(&self) -> Option<HealthReport> {
        self.last.read().clone()
    }

    pub fn checks_run(&self) -> u64 {
        self.checks.load(Ordering::Relaxed)
    }

    /// Run checks every `interval` on the current tokio runtime, passing each
    /// report to `on_report`, until the returned task is stopped.
    pub fn spawn<F>(self: &Arc<Self>, interval: Duration, on_report: F) -> HealthTask
    where
        F: Fn(&HealthReport) + Send + Sync + 'static,
    {
        let (stop, mut stopped) = watch::channel(false);
        let monitor = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = monitor.check();
                        on_report(&report);
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Health monitor stopped");
        });

        info!("Health monitor running every {interval:?}");
        HealthTask { stop, handle }
    }
}

/// Handle to a background health check loop.
#[derive(Debug)]
pub struct HealthTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl HealthTask {
    /// Stop the loop and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            warn!("Health monitor task ended abnormally: {e}");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::entry::{MemoryEntry, SyncState};
    use crate::semantic::SemanticConfig;

    fn monitor() -> (Arc<StructuredStore>, Arc<SemanticStore>, Arc<HealthMonitor>) {
        let structured = Arc::new(StructuredStore::in_memory().unwrap());
        let semantic = Arc::new(SemanticStore::in_memory(SemanticConfig::default()).unwrap());
        let monitor = Arc::new(HealthMonitor::new(structured.clone(), semantic.clone()));
        (structured, semantic, monitor)
    }

    #[test]
    fn test_status_ordering() {
        assert!(HealthStatus::Healthy < HealthStatus::Degraded);
        assert!(HealthStatus::Degraded < HealthStatus::Unhealthy);
        assert_eq!(
            HealthStatus::Healthy.worst(HealthStatus::Unhealthy),
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn test_worst_of_both() {
        let (_, semantic, monitor) = monitor();
        assert_eq!(monitor.check().status, HealthStatus::Healthy);

        semantic.set_online(false);
        let report = monitor.check();
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.structured.status, HealthStatus::Healthy);
        assert_eq!(report.semantic.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_coverage_gaps_do_not_degrade() {
        let (structured, _, monitor) = monitor();
        structured.store(MemoryEntry::new("ns", "k", "text")).unwrap();
        structured
            .store(MemoryEntry::new("ns", "synced", "text"))
            .unwrap();
        structured
            .set_sync_state("ns", "synced", SyncState::Synced)
            .unwrap();

        let report = monitor.check();
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.semantic_coverage_gaps.get("ns"), Some(&1));
        assert_eq!(report.degraded_namespaces(), vec!["ns"]);
        assert_eq!(report.structured.entries, 2);
        assert!(report.structured.last_write_at.is_some());
    }

    #[tokio::test]
    async fn test_spawned_checks_until_stopped() {
        let (_, _, monitor) = monitor();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();

        let task = monitor.spawn(Duration::from_millis(10), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(60)).await;
        task.stop().await;

        let after_stop = seen.load(Ordering::SeqCst);
        assert!(after_stop >= 2);
        assert!(monitor.last_report().is_some());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(seen.load(Ordering::SeqCst), after_stop);
    }
}
