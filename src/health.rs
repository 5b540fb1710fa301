//! Health assessment
//!
//! A registry of named health checks dispatched concurrently on a schedule,
//! aggregated into an overall verdict with bounded history. A check that
//! fails or times out produces a failed result; it never aborts the cycle.

use crate::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

// ============================================================================
// Checks and results
// ============================================================================

/// An individual health probe.
///
/// Implementations are registered by name and may be added or removed while
/// the manager is running.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;

    /// Critical checks force the overall verdict to CRITICAL when they fail.
    fn critical(&self) -> bool {
        false
    }

    async fn check(&self) -> Result<HealthCheckResult>;
}

/// Result of one probe execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub healthy: bool,
    pub critical: bool,
    pub message: String,
    pub response_time: Duration,
}

impl HealthCheckResult {
    pub fn healthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            healthy: true,
            critical: false,
            message: message.into(),
            response_time: Duration::ZERO,
        }
    }

    pub fn failed(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            healthy: false,
            critical: false,
            message: message.into(),
            response_time: Duration::ZERO,
        }
    }
}

/// Aggregated verdict over one check cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverallHealth {
    Healthy,
    Warning,
    Unhealthy,
    Critical,
    Unknown,
}

/// Snapshot of one full check cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealthStatus {
    pub check_time: DateTime<Utc>,
    pub overall: OverallHealth,
    pub results: Vec<HealthCheckResult>,
    pub total_checks: usize,
    pub passed_checks: usize,
    pub failed_checks: usize,
}

/// Receives CRITICAL/UNHEALTHY verdicts. Delivery is the host's concern;
/// the default implementation logs.
pub trait AlertHandler: Send + Sync {
    fn on_health_alert(&self, status: &SystemHealthStatus);
}

struct TracingAlertHandler;

impl AlertHandler for TracingAlertHandler {
    fn on_health_alert(&self, status: &SystemHealthStatus) {
        error!(
            overall = ?status.overall,
            failed = status.failed_checks,
            total = status.total_checks,
            "health alert"
        );
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Health manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Time between scheduled check cycles
    pub check_interval: Duration,
    /// Per-check timeout within a cycle
    pub check_timeout: Duration,
    /// Status history cap; oldest entries are evicted first
    pub max_history: usize,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            check_timeout: Duration::from_secs(30),
            max_history: 100,
        }
    }
}

/// Read-only snapshot for monitoring front-ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckStatistics {
    pub active: bool,
    pub total_cycles: u64,
    pub failed_checks: u64,
    pub registered_checks: usize,
    pub history_size: usize,
    pub success_rate: f64,
}

struct Runner {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

/// Runs registered health checks concurrently on a schedule and keeps a
/// bounded history of verdicts.
pub struct HealthCheckManager {
    config: HealthCheckConfig,
    checks: DashMap<String, Arc<dyn HealthCheck>>,
    history: RwLock<VecDeque<SystemHealthStatus>>,
    current: RwLock<Option<SystemHealthStatus>>,
    alert_handler: RwLock<Arc<dyn AlertHandler>>,
    runner: Mutex<Option<Runner>>,
    total_cycles: AtomicU64,
    failed_checks: AtomicU64,
    total_check_runs: AtomicU64,
}

impl HealthCheckManager {
    pub fn new(config: HealthCheckConfig) -> Self {
        Self {
            config,
            checks: DashMap::new(),
            history: RwLock::new(VecDeque::new()),
            current: RwLock::new(None),
            alert_handler: RwLock::new(Arc::new(TracingAlertHandler)),
            runner: Mutex::new(None),
            total_cycles: AtomicU64::new(0),
            failed_checks: AtomicU64::new(0),
            total_check_runs: AtomicU64::new(0),
        }
    }

    pub fn register_check(&self, check: Arc<dyn HealthCheck>) {
        debug!(check = check.name(), "health check registered");
        self.checks.insert(check.name().to_string(), check);
    }

    pub fn unregister_check(&self, name: &str) {
        debug!(check = name, "health check unregistered");
        self.checks.remove(name);
    }

    pub fn registered_checks(&self) -> Vec<String> {
        self.checks.iter().map(|e| e.key().clone()).collect()
    }

    pub fn set_alert_handler(&self, handler: Arc<dyn AlertHandler>) {
        if let Ok(mut slot) = self.alert_handler.write() {
            *slot = handler;
        }
    }

    /// Start the scheduled check loop. Idempotent while running.
    pub fn start(self: &Arc<Self>) {
        let mut guard = match self.runner.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if guard.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(
                interval_ms = manager.config.check_interval.as_millis() as u64,
                "health checking started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.run_cycle().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("health checking stopped");
        });

        *guard = Some(Runner {
            handle,
            shutdown: shutdown_tx,
        });
    }

    /// Stop the scheduled loop, letting an in-flight cycle drain within
    /// `grace` before aborting it.
    pub async fn stop(&self, grace: Duration) {
        let runner = match self.runner.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(Runner { handle, shutdown }) = runner else {
            return;
        };

        let _ = shutdown.send(true);
        let mut handle = handle;
        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            warn!("health loop did not drain within grace period, aborting");
            handle.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        self.runner.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    /// Run one check cycle immediately, outside the schedule.
    pub async fn check_now(&self) -> SystemHealthStatus {
        self.run_cycle().await
    }

    async fn run_cycle(&self) -> SystemHealthStatus {
        let check_time = Utc::now();
        let checks: Vec<Arc<dyn HealthCheck>> =
            self.checks.iter().map(|e| Arc::clone(e.value())).collect();

        let timeout = self.config.check_timeout;
        let tasks = checks.into_iter().map(|check| async move {
            let name = check.name().to_string();
            let critical = check.critical();
            let started = Instant::now();

            let mut result = match tokio::time::timeout(timeout, check.check()).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    HealthCheckResult::failed(name.as_str(), format!("health check failed: {}", e))
                }
                Err(_) => HealthCheckResult::failed(name.as_str(), "health check timed out"),
            };
            result.critical = critical;
            result.response_time = started.elapsed();
            result
        });

        let results = futures::future::join_all(tasks).await;

        self.total_cycles.fetch_add(1, Ordering::Relaxed);
        self.total_check_runs
            .fetch_add(results.len() as u64, Ordering::Relaxed);
        let failed = results.iter().filter(|r| !r.healthy).count();
        self.failed_checks.fetch_add(failed as u64, Ordering::Relaxed);

        let status = SystemHealthStatus {
            check_time,
            overall: Self::determine_overall(&results),
            total_checks: results.len(),
            passed_checks: results.len() - failed,
            failed_checks: failed,
            results,
        };

        if let Ok(mut current) = self.current.write() {
            *current = Some(status.clone());
        }
        if let Ok(mut history) = self.history.write() {
            history.push_back(status.clone());
            while history.len() > self.config.max_history {
                history.pop_front();
            }
        }

        for result in status.results.iter().filter(|r| !r.healthy) {
            warn!(check = %result.name, message = %result.message, "health check failed");
        }

        if matches!(status.overall, OverallHealth::Critical | OverallHealth::Unhealthy) {
            let handler = self
                .alert_handler
                .read()
                .ok()
                .map(|g| Arc::clone(&*g));
            if let Some(handler) = handler {
                handler.on_health_alert(&status);
            }
        }

        status
    }

    /// Aggregation verdict: a failing critical check dominates everything;
    /// otherwise the failure ratio decides, with exactly 20% already
    /// counting as Unhealthy.
    fn determine_overall(results: &[HealthCheckResult]) -> OverallHealth {
        if results.is_empty() {
            return OverallHealth::Unknown;
        }

        if results.iter().any(|r| r.critical && !r.healthy) {
            return OverallHealth::Critical;
        }

        let failed = results.iter().filter(|r| !r.healthy).count();
        let failure_rate = failed as f64 / results.len() as f64;
        if failure_rate == 0.0 {
            OverallHealth::Healthy
        } else if failure_rate < 0.2 {
            OverallHealth::Warning
        } else {
            OverallHealth::Unhealthy
        }
    }

    pub fn current_status(&self) -> Option<SystemHealthStatus> {
        self.current.read().ok().and_then(|g| g.clone())
    }

    pub fn history(&self) -> Vec<SystemHealthStatus> {
        self.history
            .read()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn statistics(&self) -> HealthCheckStatistics {
        let total_runs = self.total_check_runs.load(Ordering::Relaxed);
        let failed = self.failed_checks.load(Ordering::Relaxed);
        HealthCheckStatistics {
            active: self.is_active(),
            total_cycles: self.total_cycles.load(Ordering::Relaxed),
            failed_checks: failed,
            registered_checks: self.checks.len(),
            history_size: self.history.read().map(|h| h.len()).unwrap_or(0),
            success_rate: if total_runs == 0 {
                1.0
            } else {
                (total_runs - failed) as f64 / total_runs as f64
            },
        }
    }
}

impl Default for HealthCheckManager {
    fn default() -> Self {
        Self::new(HealthCheckConfig::default())
    }
}

// ============================================================================
// Built-in checks
// ============================================================================

/// System memory pressure probe.
pub struct MemoryHealthCheck {
    warning_threshold: f32,
    critical_threshold: f32,
    critical_check: bool,
}

impl MemoryHealthCheck {
    pub fn new(warning_threshold: f32, critical_threshold: f32) -> Self {
        Self {
            warning_threshold,
            critical_threshold,
            critical_check: false,
        }
    }

    pub fn mark_critical(mut self) -> Self {
        self.critical_check = true;
        self
    }
}

impl Default for MemoryHealthCheck {
    fn default() -> Self {
        Self::new(0.85, 0.95)
    }
}

#[async_trait]
impl HealthCheck for MemoryHealthCheck {
    fn name(&self) -> &str {
        "memory"
    }

    fn critical(&self) -> bool {
        self.critical_check
    }

    async fn check(&self) -> Result<HealthCheckResult> {
        use sysinfo::System;

        let mut system = System::new();
        system.refresh_memory();

        let total = system.total_memory() as f32;
        let used = system.used_memory() as f32;
        let usage = if total > 0.0 { used / total } else { 0.0 };

        let result = if usage > self.critical_threshold {
            HealthCheckResult::failed(
                self.name(),
                format!("memory critical: {:.1}% used", usage * 100.0),
            )
        } else if usage > self.warning_threshold {
            HealthCheckResult::failed(
                self.name(),
                format!("memory high: {:.1}% used", usage * 100.0),
            )
        } else {
            HealthCheckResult::healthy(
                self.name(),
                format!("memory at {:.1}%", usage * 100.0),
            )
        };
        Ok(result)
    }
}

/// CPU load probe. Samples twice across the minimum refresh interval for a
/// meaningful reading.
pub struct CpuHealthCheck {
    critical_threshold: f32,
}

impl CpuHealthCheck {
    pub fn new(critical_threshold: f32) -> Self {
        Self { critical_threshold }
    }
}

impl Default for CpuHealthCheck {
    fn default() -> Self {
        Self::new(0.95)
    }
}

#[async_trait]
impl HealthCheck for CpuHealthCheck {
    fn name(&self) -> &str {
        "cpu"
    }

    async fn check(&self) -> Result<HealthCheckResult> {
        use sysinfo::System;

        let mut system = System::new();
        system.refresh_cpu_usage();
        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
        system.refresh_cpu_usage();

        let usage = system.global_cpu_usage() / 100.0;
        let result = if usage > self.critical_threshold {
            HealthCheckResult::failed(
                self.name(),
                format!("cpu saturated: {:.1}%", usage * 100.0),
            )
        } else {
            HealthCheckResult::healthy(self.name(), format!("cpu at {:.1}%", usage * 100.0))
        };
        Ok(result)
    }
}

/// Disk space probe for a mount point.
pub struct DiskHealthCheck {
    path: std::path::PathBuf,
    warning_threshold: f32,
    critical_threshold: f32,
}

impl DiskHealthCheck {
    pub fn new(
        path: impl Into<std::path::PathBuf>,
        warning_threshold: f32,
        critical_threshold: f32,
    ) -> Self {
        Self {
            path: path.into(),
            warning_threshold,
            critical_threshold,
        }
    }
}

impl Default for DiskHealthCheck {
    fn default() -> Self {
        Self::new("/", 0.85, 0.95)
    }
}

#[async_trait]
impl HealthCheck for DiskHealthCheck {
    fn name(&self) -> &str {
        "disk"
    }

    async fn check(&self) -> Result<HealthCheckResult> {
        use sysinfo::Disks;

        let disks = Disks::new_with_refreshed_list();
        for disk in disks.list() {
            if disk.mount_point() == self.path {
                let total = disk.total_space() as f32;
                let available = disk.available_space() as f32;
                let usage = if total > 0.0 { 1.0 - available / total } else { 0.0 };

                let result = if usage > self.critical_threshold {
                    HealthCheckResult::failed(
                        self.name(),
                        format!("disk critical: {:.1}% full", usage * 100.0),
                    )
                } else if usage > self.warning_threshold {
                    HealthCheckResult::failed(
                        self.name(),
                        format!("disk high: {:.1}% full", usage * 100.0),
                    )
                } else {
                    HealthCheckResult::healthy(
                        self.name(),
                        format!("disk at {:.1}%", usage * 100.0),
                    )
                };
                return Ok(result);
            }
        }

        // A probe that cannot see the mount must not mark the system down
        Ok(HealthCheckResult::healthy(
            self.name(),
            format!("mount {} not found; skipping inspection", self.path.display()),
        ))
    }
}

/// Liveness probe for a component that reports heartbeats.
pub struct HeartbeatHealthCheck {
    name: String,
    last_beat: RwLock<Option<Instant>>,
    timeout: Duration,
    critical_check: bool,
}

impl HeartbeatHealthCheck {
    pub fn new(name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            last_beat: RwLock::new(None),
            timeout,
            critical_check: false,
        }
    }

    pub fn mark_critical(mut self) -> Self {
        self.critical_check = true;
        self
    }

    /// Record a heartbeat from the monitored component.
    pub fn beat(&self) {
        if let Ok(mut last) = self.last_beat.write() {
            *last = Some(Instant::now());
        }
    }
}

#[async_trait]
impl HealthCheck for HeartbeatHealthCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn critical(&self) -> bool {
        self.critical_check
    }

    async fn check(&self) -> Result<HealthCheckResult> {
        let last = self.last_beat.read().ok().and_then(|g| *g);
        let result = match last {
            None => HealthCheckResult::failed(self.name.as_str(), "no heartbeat received"),
            Some(instant) => {
                let elapsed = instant.elapsed();
                if elapsed > self.timeout {
                    HealthCheckResult::failed(
                        self.name.as_str(),
                        format!("heartbeat overdue by {:?}", elapsed - self.timeout),
                    )
                } else {
                    HealthCheckResult::healthy(
                        self.name.as_str(),
                        format!("last heartbeat {:?} ago", elapsed),
                    )
                }
            }
        };
        Ok(result)
    }
}

/// Runtime responsiveness probe: measures how long a trivial spawned task
/// waits before it runs.
pub struct SchedulerHealthCheck {
    max_lag: Duration,
}

impl SchedulerHealthCheck {
    pub fn new(max_lag: Duration) -> Self {
        Self { max_lag }
    }
}

impl Default for SchedulerHealthCheck {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

#[async_trait]
impl HealthCheck for SchedulerHealthCheck {
    fn name(&self) -> &str {
        "scheduler"
    }

    async fn check(&self) -> Result<HealthCheckResult> {
        let started = Instant::now();
        let _ = tokio::spawn(async {}).await;
        let lag = started.elapsed();

        let result = if lag > self.max_lag {
            HealthCheckResult::failed(self.name(), format!("scheduler lag {:?}", lag))
        } else {
            HealthCheckResult::healthy(self.name(), format!("scheduler lag {:?}", lag))
        };
        Ok(result)
    }
}
