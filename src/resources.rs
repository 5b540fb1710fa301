//! Resource pressure monitoring and bounded-cooldown optimization
//!
//! A scheduled loop samples resource snapshots and triggers the memory or
//! performance optimizer when usage crosses the pressure thresholds. Each
//! optimizer enforces its own cooldown so renewed pressure cannot stampede
//! optimizations. A separate review pass evicts finished and expired
//! optimizations from the active set.

use crate::recovery::ReclaimHook;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ============================================================================
// Snapshots
// ============================================================================

/// Point-in-time resource usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub memory_used: u64,
    pub memory_total: u64,
    pub swap_used: u64,
    pub swap_total: u64,
    /// 0.0 - 1.0
    pub cpu_usage: f64,
    pub active_optimizations: usize,
}

impl ResourceSnapshot {
    pub fn memory_ratio(&self) -> f64 {
        if self.memory_total == 0 {
            0.0
        } else {
            self.memory_used as f64 / self.memory_total as f64
        }
    }

    pub fn swap_ratio(&self) -> f64 {
        if self.swap_total == 0 {
            0.0
        } else {
            self.swap_used as f64 / self.swap_total as f64
        }
    }
}

// ============================================================================
// Optimizations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizationType {
    Memory,
    Performance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizationStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

/// One optimization action, owned by the manager's active set until a
/// review pass evicts it in a terminal state.
#[derive(Debug, Clone)]
pub struct ResourceOptimization {
    pub id: String,
    pub optimization_type: OptimizationType,
    pub strategy: String,
    pub reason: String,
    pub started_at: DateTime<Utc>,
    pub snapshot: ResourceSnapshot,
    pub estimated_duration: Duration,
    start: Instant,
    status: OptimizationStatus,
    result_message: Option<String>,
    completed_at: Option<DateTime<Utc>>,
}

impl ResourceOptimization {
    pub fn new(
        optimization_type: OptimizationType,
        strategy: impl Into<String>,
        reason: impl Into<String>,
        snapshot: ResourceSnapshot,
        estimated_duration: Duration,
    ) -> Self {
        let prefix = match optimization_type {
            OptimizationType::Memory => "mem-opt",
            OptimizationType::Performance => "perf-opt",
        };
        Self {
            id: format!("{}-{}", prefix, Uuid::new_v4()),
            optimization_type,
            strategy: strategy.into(),
            reason: reason.into(),
            started_at: Utc::now(),
            snapshot,
            estimated_duration,
            start: Instant::now(),
            status: OptimizationStatus::Running,
            result_message: None,
            completed_at: None,
        }
    }

    pub fn mark_completed(&mut self, message: impl Into<String>) {
        self.status = OptimizationStatus::Completed;
        self.result_message = Some(message.into());
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.status = OptimizationStatus::Failed;
        self.result_message = Some(message.into());
        self.completed_at = Some(Utc::now());
    }

    pub fn stop(&mut self, message: impl Into<String>) {
        if self.status == OptimizationStatus::Running {
            self.status = OptimizationStatus::Stopped;
            self.result_message = Some(message.into());
            self.completed_at = Some(Utc::now());
        }
    }

    pub fn status(&self) -> OptimizationStatus {
        self.status
    }

    pub fn result_message(&self) -> Option<&str> {
        self.result_message.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.status != OptimizationStatus::Running
    }

    /// Running past twice the estimated duration counts as expired.
    pub fn has_expired(&self) -> bool {
        !self.is_terminal() && self.start.elapsed() > self.estimated_duration * 2
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// ============================================================================
// Memory optimizer
// ============================================================================

/// Strategy tiers for memory cleanup, selected by usage ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryStrategy {
    AggressiveCleanup,
    ConservativeCleanup,
    PreventiveOptimization,
}

impl MemoryStrategy {
    fn name(&self) -> &'static str {
        match self {
            Self::AggressiveCleanup => "aggressive-cleanup",
            Self::ConservativeCleanup => "conservative-cleanup",
            Self::PreventiveOptimization => "preventive-optimization",
        }
    }

    fn estimated_duration(&self) -> Duration {
        match self {
            Self::AggressiveCleanup => Duration::from_secs(10),
            Self::ConservativeCleanup => Duration::from_secs(5),
            Self::PreventiveOptimization => Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryOptimizerConfig {
    /// Usage ratio above which conservative cleanup runs
    pub optimization_threshold: f64,
    /// Usage ratio above which cleanup turns aggressive
    pub aggressive_threshold: f64,
    /// Minimum interval between memory optimizations
    pub cooldown: Duration,
}

impl Default for MemoryOptimizerConfig {
    fn default() -> Self {
        Self {
            optimization_threshold: 0.85,
            aggressive_threshold: 0.95,
            cooldown: Duration::from_secs(300),
        }
    }
}

/// Runs tiered memory cleanup through registered reclaim hooks.
pub struct MemoryOptimizer {
    config: MemoryOptimizerConfig,
    hooks: RwLock<Vec<Arc<dyn ReclaimHook>>>,
    last_optimization: RwLock<Option<Instant>>,
    optimization_count: AtomicU64,
}

impl MemoryOptimizer {
    pub fn new(config: MemoryOptimizerConfig) -> Self {
        Self {
            config,
            hooks: RwLock::new(Vec::new()),
            last_optimization: RwLock::new(None),
            optimization_count: AtomicU64::new(0),
        }
    }

    pub fn register_hook(&self, hook: Arc<dyn ReclaimHook>) {
        if let Ok(mut hooks) = self.hooks.write() {
            hooks.push(hook);
        }
    }

    pub fn optimization_count(&self) -> u64 {
        self.optimization_count.load(Ordering::Relaxed)
    }

    fn in_cooldown(&self) -> bool {
        self.last_optimization
            .read()
            .ok()
            .and_then(|g| *g)
            .is_some_and(|last| last.elapsed() < self.config.cooldown)
    }

    pub fn select_strategy(&self, snapshot: &ResourceSnapshot) -> MemoryStrategy {
        let ratio = snapshot.memory_ratio();
        if ratio > self.config.aggressive_threshold {
            MemoryStrategy::AggressiveCleanup
        } else if ratio > self.config.optimization_threshold {
            MemoryStrategy::ConservativeCleanup
        } else {
            MemoryStrategy::PreventiveOptimization
        }
    }

    /// Run a memory optimization for the given snapshot, or decline while
    /// the cooldown from the previous one is still in force.
    pub fn optimize(&self, snapshot: &ResourceSnapshot, reason: &str) -> Option<ResourceOptimization> {
        if self.in_cooldown() {
            debug!("memory optimizer in cooldown, declining");
            return None;
        }

        let strategy = self.select_strategy(snapshot);
        let mut optimization = ResourceOptimization::new(
            OptimizationType::Memory,
            strategy.name(),
            reason,
            snapshot.clone(),
            strategy.estimated_duration(),
        );

        let hook_count = self.run_hooks(strategy);
        optimization.mark_completed(format!(
            "{}: ran {} reclaim hooks",
            strategy.name(),
            hook_count
        ));

        self.optimization_count.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_optimization.write() {
            *last = Some(Instant::now());
        }

        info!(
            id = %optimization.id,
            strategy = strategy.name(),
            memory_ratio = snapshot.memory_ratio(),
            "memory optimization executed"
        );
        Some(optimization)
    }

    fn run_hooks(&self, strategy: MemoryStrategy) -> usize {
        let hooks: Vec<Arc<dyn ReclaimHook>> = self
            .hooks
            .read()
            .map(|h| h.clone())
            .unwrap_or_default();

        // Preventive runs nothing destructive; the tiers above run every
        // registered hook.
        let to_run: &[Arc<dyn ReclaimHook>] = match strategy {
            MemoryStrategy::PreventiveOptimization => &[],
            _ => &hooks,
        };

        for hook in to_run {
            debug!(hook = hook.name(), "running reclaim hook");
            hook.reclaim();
        }
        to_run.len()
    }
}

impl Default for MemoryOptimizer {
    fn default() -> Self {
        Self::new(MemoryOptimizerConfig::default())
    }
}

// ============================================================================
// Performance optimizer
// ============================================================================

/// Strategy tiers for CPU relief, selected by load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformanceStrategy {
    AggressiveCpuRelief,
    ModerateCpuRelief,
    GentleCpuRelief,
    GeneralOptimization,
}

impl PerformanceStrategy {
    fn name(&self) -> &'static str {
        match self {
            Self::AggressiveCpuRelief => "aggressive-cpu-relief",
            Self::ModerateCpuRelief => "moderate-cpu-relief",
            Self::GentleCpuRelief => "gentle-cpu-relief",
            Self::GeneralOptimization => "general-optimization",
        }
    }

    fn estimated_duration(&self) -> Duration {
        match self {
            Self::AggressiveCpuRelief => Duration::from_secs(15),
            Self::ModerateCpuRelief => Duration::from_secs(10),
            Self::GentleCpuRelief => Duration::from_secs(5),
            Self::GeneralOptimization => Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceOptimizerConfig {
    /// CPU ratio above which relief runs
    pub cpu_threshold: f64,
    /// Minimum interval between performance optimizations
    pub cooldown: Duration,
}

impl Default for PerformanceOptimizerConfig {
    fn default() -> Self {
        Self {
            cpu_threshold: 0.8,
            cooldown: Duration::from_secs(300),
        }
    }
}

/// Advises CPU-load relief. The relief itself is advisory (logged); hosts
/// observing the active set decide what background work to shed.
pub struct PerformanceOptimizer {
    config: PerformanceOptimizerConfig,
    last_optimization: RwLock<Option<Instant>>,
    optimization_count: AtomicU64,
}

impl PerformanceOptimizer {
    pub fn new(config: PerformanceOptimizerConfig) -> Self {
        Self {
            config,
            last_optimization: RwLock::new(None),
            optimization_count: AtomicU64::new(0),
        }
    }

    pub fn optimization_count(&self) -> u64 {
        self.optimization_count.load(Ordering::Relaxed)
    }

    fn in_cooldown(&self) -> bool {
        self.last_optimization
            .read()
            .ok()
            .and_then(|g| *g)
            .is_some_and(|last| last.elapsed() < self.config.cooldown)
    }

    pub fn select_strategy(&self, snapshot: &ResourceSnapshot) -> PerformanceStrategy {
        if snapshot.cpu_usage > 0.95 {
            PerformanceStrategy::AggressiveCpuRelief
        } else if snapshot.cpu_usage > 0.85 {
            PerformanceStrategy::ModerateCpuRelief
        } else {
            PerformanceStrategy::GentleCpuRelief
        }
    }

    /// CPU-pressure optimization; declines below the threshold or during
    /// cooldown.
    pub fn optimize(&self, snapshot: &ResourceSnapshot, reason: &str) -> Option<ResourceOptimization> {
        if snapshot.cpu_usage < self.config.cpu_threshold {
            return None;
        }
        if self.in_cooldown() {
            debug!("performance optimizer in cooldown, declining");
            return None;
        }

        let strategy = self.select_strategy(snapshot);
        Some(self.execute(strategy, snapshot, reason))
    }

    /// Optimization for simultaneous memory and CPU elevation.
    pub fn optimize_general(
        &self,
        snapshot: &ResourceSnapshot,
        reason: &str,
    ) -> Option<ResourceOptimization> {
        if self.in_cooldown() {
            return None;
        }
        Some(self.execute(PerformanceStrategy::GeneralOptimization, snapshot, reason))
    }

    fn execute(
        &self,
        strategy: PerformanceStrategy,
        snapshot: &ResourceSnapshot,
        reason: &str,
    ) -> ResourceOptimization {
        let mut optimization = ResourceOptimization::new(
            OptimizationType::Performance,
            strategy.name(),
            reason,
            snapshot.clone(),
            strategy.estimated_duration(),
        );
        optimization.mark_completed(format!("{}: load-shed advisory issued", strategy.name()));

        self.optimization_count.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_optimization.write() {
            *last = Some(Instant::now());
        }

        info!(
            id = %optimization.id,
            strategy = strategy.name(),
            cpu = snapshot.cpu_usage,
            "performance optimization executed"
        );
        optimization
    }
}

impl Default for PerformanceOptimizer {
    fn default() -> Self {
        Self::new(PerformanceOptimizerConfig::default())
    }
}

// ============================================================================
// Manager
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceManagerConfig {
    /// Time between resource snapshots
    pub check_interval: Duration,
    /// Time between optimization review passes
    pub review_interval: Duration,
    /// Memory ratio that triggers the memory optimizer
    pub memory_pressure_threshold: f64,
    /// CPU ratio that triggers the performance optimizer
    pub cpu_pressure_threshold: f64,
    /// Memory/CPU ratio at which simultaneous elevation triggers a general
    /// optimization
    pub combined_pressure_threshold: f64,
    /// Snapshot history cap
    pub max_history: usize,
    pub memory: MemoryOptimizerConfig,
    pub performance: PerformanceOptimizerConfig,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            review_interval: Duration::from_secs(300),
            memory_pressure_threshold: 0.8,
            cpu_pressure_threshold: 0.85,
            combined_pressure_threshold: 0.7,
            max_history: 100,
            memory: MemoryOptimizerConfig::default(),
            performance: PerformanceOptimizerConfig::default(),
        }
    }
}

/// Read-only snapshot for monitoring front-ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceStatistics {
    pub active: bool,
    pub total_optimizations: u64,
    pub active_optimizations: usize,
    pub history_size: usize,
    pub average_memory_ratio: f64,
    pub average_cpu_usage: f64,
}

struct Runner {
    check_handle: JoinHandle<()>,
    review_handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

/// Samples resource snapshots on a schedule and drives the optimizers.
pub struct ResourceManager {
    config: ResourceManagerConfig,
    memory_optimizer: MemoryOptimizer,
    performance_optimizer: PerformanceOptimizer,
    history: RwLock<VecDeque<ResourceSnapshot>>,
    active: DashMap<String, ResourceOptimization>,
    /// Persistent sampler so CPU readings measure the delta between ticks
    sampler: Mutex<sysinfo::System>,
    total_optimizations: AtomicU64,
    runner: Mutex<Option<Runner>>,
}

impl ResourceManager {
    pub fn new(config: ResourceManagerConfig) -> Self {
        Self {
            memory_optimizer: MemoryOptimizer::new(config.memory.clone()),
            performance_optimizer: PerformanceOptimizer::new(config.performance.clone()),
            config,
            history: RwLock::new(VecDeque::new()),
            active: DashMap::new(),
            sampler: Mutex::new(sysinfo::System::new()),
            total_optimizations: AtomicU64::new(0),
            runner: Mutex::new(None),
        }
    }

    /// Register a reclaim hook with the memory optimizer.
    pub fn register_reclaim_hook(&self, hook: Arc<dyn ReclaimHook>) {
        self.memory_optimizer.register_hook(hook);
    }

    pub fn start(self: &Arc<Self>) {
        let mut guard = match self.runner.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if guard.is_some() {
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let manager = Arc::clone(self);
        let mut check_rx = shutdown_rx.clone();
        let check_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!("resource management started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.check_resources();
                    }
                    changed = check_rx.changed() => {
                        if changed.is_err() || *check_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        let manager = Arc::clone(self);
        let mut review_rx = shutdown_rx;
        let review_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.review_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it so reviews trail checks
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.review_optimizations();
                    }
                    changed = review_rx.changed() => {
                        if changed.is_err() || *review_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        *guard = Some(Runner {
            check_handle,
            review_handle,
            shutdown: shutdown_tx,
        });
    }

    /// Stop scheduling, stop running optimizations, and drain in-flight
    /// ticks within the grace period.
    pub async fn stop(&self, grace: Duration) {
        let runner = match self.runner.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(Runner {
            check_handle,
            review_handle,
            shutdown,
        }) = runner
        else {
            return;
        };

        let _ = shutdown.send(true);
        for handle in [check_handle, review_handle] {
            let mut handle = handle;
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!("resource loop did not drain within grace period, aborting");
                handle.abort();
            }
        }

        for mut entry in self.active.iter_mut() {
            entry.value_mut().stop("resource management stopped");
        }
        info!("resource management stopped");
    }

    pub fn is_active(&self) -> bool {
        self.runner.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    /// Capture a snapshot of current system usage.
    pub fn capture_snapshot(&self) -> ResourceSnapshot {
        let mut sampler = match self.sampler.lock() {
            Ok(sampler) => sampler,
            Err(poisoned) => poisoned.into_inner(),
        };
        sampler.refresh_memory();
        sampler.refresh_cpu_usage();

        ResourceSnapshot {
            timestamp: Utc::now(),
            memory_used: sampler.used_memory(),
            memory_total: sampler.total_memory(),
            swap_used: sampler.used_swap(),
            swap_total: sampler.total_swap(),
            cpu_usage: (sampler.global_cpu_usage() / 100.0) as f64,
            active_optimizations: self.active.len(),
        }
    }

    /// One scheduled tick: snapshot, record, and trigger optimizers when
    /// pressure warrants it.
    pub fn check_resources(&self) {
        let snapshot = self.capture_snapshot();

        if let Ok(mut history) = self.history.write() {
            history.push_back(snapshot.clone());
            while history.len() > self.config.max_history {
                history.pop_front();
            }
        }

        if self.pressure_detected(&snapshot) {
            self.optimize_for_snapshot(&snapshot, "periodic resource check");
        }
    }

    fn pressure_detected(&self, snapshot: &ResourceSnapshot) -> bool {
        snapshot.memory_ratio() > self.config.memory_pressure_threshold
            || snapshot.cpu_usage > self.config.cpu_pressure_threshold
            || self.combined_pressure(snapshot)
    }

    fn combined_pressure(&self, snapshot: &ResourceSnapshot) -> bool {
        snapshot.memory_ratio() > self.config.combined_pressure_threshold
            && snapshot.cpu_usage > self.config.combined_pressure_threshold
    }

    /// Evaluate a snapshot against the pressure thresholds and run whichever
    /// optimizers respond. Returns the optimizations started.
    pub fn optimize_for_snapshot(
        &self,
        snapshot: &ResourceSnapshot,
        reason: &str,
    ) -> Vec<ResourceOptimization> {
        let mut started = Vec::new();

        if snapshot.memory_ratio() > self.config.memory_pressure_threshold {
            if let Some(optimization) = self.memory_optimizer.optimize(snapshot, reason) {
                self.active.insert(optimization.id.clone(), optimization.clone());
                started.push(optimization);
            }
        }

        if snapshot.cpu_usage > self.config.cpu_pressure_threshold {
            if let Some(optimization) = self.performance_optimizer.optimize(snapshot, reason) {
                self.active.insert(optimization.id.clone(), optimization.clone());
                started.push(optimization);
            }
        }

        if self.combined_pressure(snapshot) {
            if let Some(optimization) = self.performance_optimizer.optimize_general(snapshot, reason)
            {
                self.active.insert(optimization.id.clone(), optimization.clone());
                started.push(optimization);
            }
        }

        self.total_optimizations
            .fetch_add(started.len() as u64, Ordering::Relaxed);
        started
    }

    /// Review pass: evict terminal optimizations and stop expired ones.
    pub fn review_optimizations(&self) {
        let mut evict = Vec::new();
        for mut entry in self.active.iter_mut() {
            if entry.value().has_expired() {
                warn!(id = %entry.key(), "optimization expired, stopping");
                entry.value_mut().stop("expired: ran past twice the estimated duration");
            }
            if entry.value().is_terminal() {
                evict.push(entry.key().clone());
            }
        }
        for id in evict {
            self.active.remove(&id);
        }
    }

    pub fn active_optimizations(&self) -> Vec<ResourceOptimization> {
        self.active.iter().map(|e| e.value().clone()).collect()
    }

    pub fn history(&self) -> Vec<ResourceSnapshot> {
        self.history
            .read()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn statistics(&self) -> ResourceStatistics {
        let (avg_memory, avg_cpu, history_size) = self
            .history
            .read()
            .map(|h| {
                if h.is_empty() {
                    (0.0, 0.0, 0)
                } else {
                    let mem: f64 = h.iter().map(|s| s.memory_ratio()).sum();
                    let cpu: f64 = h.iter().map(|s| s.cpu_usage).sum();
                    (mem / h.len() as f64, cpu / h.len() as f64, h.len())
                }
            })
            .unwrap_or((0.0, 0.0, 0));

        ResourceStatistics {
            active: self.is_active(),
            total_optimizations: self.total_optimizations.load(Ordering::Relaxed),
            active_optimizations: self.active.len(),
            history_size,
            average_memory_ratio: avg_memory,
            average_cpu_usage: avg_cpu,
        }
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new(ResourceManagerConfig::default())
    }
}
