//! Cache metrics
//!
//! Hit/miss accounting per tier, operation latencies, a bounded error log and
//! the derived health verdict. Every counter is mirrored into an
//! instance-owned Prometheus registry for scraping.

mod reservoir;

pub use reservoir::{Percentiles, Reservoir};

use parking_lot::{Mutex, RwLock};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::core::{CacheError, HealthStatus, Result, SharedClock, TierKind};

/// Thresholds and sizes for the collector
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Samples retained per operation for percentiles
    pub sample_size: usize,
    /// Error count at which the cache reports degraded
    pub degraded_error_threshold: u64,
    /// Error count above which the cache reports unhealthy
    pub unhealthy_error_threshold: u64,
    /// Hit rate below which the cache reports degraded
    pub low_hit_rate: f64,
    /// Lookups required before the hit rate is judged
    pub min_lookups_for_hit_rate: u64,
    /// Memory utilization above which the cache reports degraded
    pub memory_utilization_threshold: f64,
    /// Recent errors kept for the issues list
    pub max_recent_errors: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            sample_size: 1000,
            degraded_error_threshold: 3,
            unhealthy_error_threshold: 10,
            low_hit_rate: 0.3,
            min_lookups_for_hit_rate: 100,
            memory_utilization_threshold: 0.9,
            max_recent_errors: 50,
        }
    }
}

/// One recovered failure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorRecord {
    pub timestamp: u64,
    pub tier: Option<TierKind>,
    pub operation: String,
    pub key: String,
    pub message: String,
}

/// Per-tier figures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TierMetrics {
    pub tier: TierKind,
    pub configured: bool,
    pub healthy: bool,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub errors: u64,
    pub size: u64,
    pub max_size: u64,
}

/// Cache-wide counters
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GlobalMetrics {
    pub gets: u64,
    pub sets: u64,
    pub deletes: u64,
    pub invalidations: u64,
    pub errors: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// Health verdict with the reasons behind it
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HealthVerdict {
    pub status: HealthStatus,
    pub issues: Vec<String>,
}

/// Point-in-time view of every metric
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    pub tiers: Vec<TierMetrics>,
    pub global: GlobalMetrics,
    pub latency: BTreeMap<String, Percentiles>,
    pub memory_bytes: u64,
    pub memory_limit_bytes: u64,
    pub memory_utilization: f64,
    pub preferred_provider: Option<TierKind>,
    pub health: HealthVerdict,
    pub recent_errors: Vec<ErrorRecord>,
}

impl MetricsSnapshot {
    pub fn tier(&self, kind: TierKind) -> Option<&TierMetrics> {
        self.tiers.iter().find(|t| t.tier == kind)
    }

    /// Human-readable report
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "=== Cache Summary ===");
        let _ = writeln!(out, "Health: {}", self.health.status);
        let _ = writeln!(
            out,
            "Preferred provider: {}",
            self.preferred_provider
                .map_or("none".to_string(), |t| t.to_string())
        );
        let _ = writeln!(
            out,
            "Operations: {} gets, {} sets, {} deletes, {} invalidations, {} errors",
            self.global.gets,
            self.global.sets,
            self.global.deletes,
            self.global.invalidations,
            self.global.errors
        );
        let _ = writeln!(
            out,
            "Hit rate: {:.1}% ({} hits / {} misses)",
            self.global.hit_rate * 100.0,
            self.global.hits,
            self.global.misses
        );
        let _ = writeln!(
            out,
            "Memory: {} / {} bytes ({:.1}%)",
            self.memory_bytes,
            self.memory_limit_bytes,
            self.memory_utilization * 100.0
        );

        let _ = writeln!(out, "\nTiers:");
        for tier in self.tiers.iter().filter(|t| t.configured) {
            let _ = writeln!(
                out,
                "  {:<16} {:<9} hits={} misses={} hit_rate={:.1}% evictions={} errors={} size={}/{}",
                tier.tier.as_str(),
                if tier.healthy { "healthy" } else { "unhealthy" },
                tier.hits,
                tier.misses,
                tier.hit_rate * 100.0,
                tier.evictions,
                tier.errors,
                tier.size,
                tier.max_size
            );
        }

        if !self.latency.is_empty() {
            let _ = writeln!(out, "\nLatency (ms):");
            for (op, p) in &self.latency {
                let _ = writeln!(
                    out,
                    "  {:<12} p50={:.3} p95={:.3} p99={:.3} n={}",
                    op, p.p50, p.p95, p.p99, p.count
                );
            }
        }

        if !self.health.issues.is_empty() {
            let _ = writeln!(out, "\nIssues:");
            for issue in &self.health.issues {
                let _ = writeln!(out, "  - {}", issue);
            }
        }

        out
    }
}

fn rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

fn tier_index(kind: TierKind) -> usize {
    match kind {
        TierKind::RemotePrimary => 0,
        TierKind::RemoteSecondary => 1,
        TierKind::Memory => 2,
        TierKind::Session => 3,
    }
}

#[derive(Default)]
struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
struct TierGauge {
    configured: bool,
    healthy: bool,
    size: u64,
    max_size: u64,
}

#[derive(Default)]
struct GlobalCounters {
    gets: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    invalidations: AtomicU64,
    errors: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

struct PrometheusMetrics {
    registry: Registry,
    operations: IntCounterVec,
    duration: HistogramVec,
    tier_lookups: IntCounterVec,
    tier_evictions: IntCounterVec,
    tier_errors: IntCounterVec,
    tier_entries: IntGaugeVec,
    tier_healthy: IntGaugeVec,
    memory_bytes: IntGauge,
}

impl PrometheusMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let operations = IntCounterVec::new(
            Opts::new(
                "strata_cache_operations_total",
                "Total number of cache operations by type",
            ),
            &["operation", "status"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "strata_cache_operation_duration_seconds",
                "Cache operation latency in seconds",
            )
            .buckets(vec![0.00001, 0.0001, 0.001, 0.01, 0.1, 1.0]),
            &["operation"],
        )?;
        let tier_lookups = IntCounterVec::new(
            Opts::new("strata_cache_tier_lookups_total", "Tier lookups by result"),
            &["tier", "result"],
        )?;
        let tier_evictions = IntCounterVec::new(
            Opts::new("strata_cache_tier_evictions_total", "Capacity evictions per tier"),
            &["tier"],
        )?;
        let tier_errors = IntCounterVec::new(
            Opts::new("strata_cache_tier_errors_total", "Recovered failures per tier"),
            &["tier"],
        )?;
        let tier_entries = IntGaugeVec::new(
            Opts::new("strata_cache_tier_entries", "Entries held per tier"),
            &["tier"],
        )?;
        let tier_healthy = IntGaugeVec::new(
            Opts::new("strata_cache_tier_healthy", "1 when the tier is serving"),
            &["tier"],
        )?;
        let memory_bytes = IntGauge::new(
            "strata_cache_memory_bytes",
            "Estimated bytes held by the memory tier",
        )?;

        registry.register(Box::new(operations.clone()))?;
        registry.register(Box::new(duration.clone()))?;
        registry.register(Box::new(tier_lookups.clone()))?;
        registry.register(Box::new(tier_evictions.clone()))?;
        registry.register(Box::new(tier_errors.clone()))?;
        registry.register(Box::new(tier_entries.clone()))?;
        registry.register(Box::new(tier_healthy.clone()))?;
        registry.register(Box::new(memory_bytes.clone()))?;

        Ok(Self {
            registry,
            operations,
            duration,
            tier_lookups,
            tier_evictions,
            tier_errors,
            tier_entries,
            tier_healthy,
            memory_bytes,
        })
    }
}

/// Aggregates cache metrics for one cache instance
pub struct MetricsCollector {
    config: MetricsConfig,
    clock: SharedClock,
    tiers: [TierCounters; 4],
    gauges: RwLock<[TierGauge; 4]>,
    global: GlobalCounters,
    memory: RwLock<(u64, u64)>,
    latencies: Mutex<HashMap<&'static str, Reservoir>>,
    recent_errors: Mutex<VecDeque<ErrorRecord>>,
    preferred: RwLock<Option<TierKind>>,
    prometheus: PrometheusMetrics,
}

impl MetricsCollector {
    pub fn new(config: MetricsConfig, clock: SharedClock) -> Result<Self> {
        let mut gauges = [TierGauge::default(); 4];
        gauges[tier_index(TierKind::Memory)] = TierGauge {
            configured: true,
            healthy: true,
            ..Default::default()
        };

        Ok(Self {
            config,
            clock,
            tiers: Default::default(),
            gauges: RwLock::new(gauges),
            global: GlobalCounters::default(),
            memory: RwLock::new((0, 0)),
            latencies: Mutex::new(HashMap::new()),
            recent_errors: Mutex::new(VecDeque::new()),
            preferred: RwLock::new(None),
            prometheus: PrometheusMetrics::new()?,
        })
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// A read that was answered by some tier (`hit`) or by none
    pub fn record_get(&self, hit: bool, latency: Duration) {
        self.global.gets.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.global.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.global.misses.fetch_add(1, Ordering::Relaxed);
        }
        self.record_operation("get", if hit { "hit" } else { "miss" }, latency);
    }

    pub fn record_set(&self, latency: Duration) {
        self.global.sets.fetch_add(1, Ordering::Relaxed);
        self.record_operation("set", "success", latency);
    }

    pub fn record_delete(&self, latency: Duration) {
        self.global.deletes.fetch_add(1, Ordering::Relaxed);
        self.record_operation("delete", "success", latency);
    }

    /// Pattern invalidation removing `removed` entries
    pub fn record_invalidation(&self, removed: usize, latency: Duration) {
        self.global.invalidations.fetch_add(1, Ordering::Relaxed);
        self.prometheus
            .operations
            .with_label_values(&["invalidate", "success"])
            .inc_by(removed.max(1) as u64);
        self.record_latency("invalidate", latency);
    }

    /// Count and time an operation not covered by the dedicated recorders
    pub fn record_operation(&self, operation: &'static str, status: &str, latency: Duration) {
        self.prometheus
            .operations
            .with_label_values(&[operation, status])
            .inc();
        self.record_latency(operation, latency);
    }

    pub fn record_latency(&self, operation: &'static str, latency: Duration) {
        self.prometheus
            .duration
            .with_label_values(&[operation])
            .observe(latency.as_secs_f64());

        let sample_size = self.config.sample_size;
        self.latencies
            .lock()
            .entry(operation)
            .or_insert_with(|| Reservoir::new(sample_size))
            .record(latency.as_secs_f64() * 1000.0);
    }

    pub fn record_tier_hit(&self, tier: TierKind) {
        self.tiers[tier_index(tier)]
            .hits
            .fetch_add(1, Ordering::Relaxed);
        self.prometheus
            .tier_lookups
            .with_label_values(&[tier.as_str(), "hit"])
            .inc();
    }

    pub fn record_tier_miss(&self, tier: TierKind) {
        self.tiers[tier_index(tier)]
            .misses
            .fetch_add(1, Ordering::Relaxed);
        self.prometheus
            .tier_lookups
            .with_label_values(&[tier.as_str(), "miss"])
            .inc();
    }

    pub fn record_eviction(&self, tier: TierKind) {
        self.tiers[tier_index(tier)]
            .evictions
            .fetch_add(1, Ordering::Relaxed);
        self.prometheus
            .tier_evictions
            .with_label_values(&[tier.as_str()])
            .inc();
    }

    /// Log a recovered failure; it counts toward the health verdict
    pub fn record_error(
        &self,
        tier: Option<TierKind>,
        operation: &str,
        key: &str,
        message: impl Into<String>,
    ) {
        self.global.errors.fetch_add(1, Ordering::Relaxed);
        if let Some(tier) = tier {
            self.tiers[tier_index(tier)]
                .errors
                .fetch_add(1, Ordering::Relaxed);
            self.prometheus
                .tier_errors
                .with_label_values(&[tier.as_str()])
                .inc();
        }

        let mut log = self.recent_errors.lock();
        log.push_back(ErrorRecord {
            timestamp: self.clock.now_millis(),
            tier,
            operation: operation.to_string(),
            key: key.to_string(),
            message: message.into(),
        });
        while log.len() > self.config.max_recent_errors {
            log.pop_front();
        }
    }

    /// Publish a tier's current size and health
    pub fn update_tier(&self, tier: TierKind, configured: bool, healthy: bool, size: u64, max_size: u64) {
        self.gauges.write()[tier_index(tier)] = TierGauge {
            configured,
            healthy,
            size,
            max_size,
        };
        self.prometheus
            .tier_entries
            .with_label_values(&[tier.as_str()])
            .set(size as i64);
        self.prometheus
            .tier_healthy
            .with_label_values(&[tier.as_str()])
            .set(i64::from(configured && healthy));
    }

    pub fn update_memory_usage(&self, bytes: u64, limit: u64) {
        *self.memory.write() = (bytes, limit);
        self.prometheus.memory_bytes.set(bytes as i64);
    }

    /// Recompute the preferred provider: the usable tier with the most hits,
    /// ties going to the faster tier
    pub fn refresh_preferred_provider(&self) -> Option<TierKind> {
        let gauges = *self.gauges.read();
        let preferred = TierKind::ALL
            .into_iter()
            .filter(|t| {
                let g = gauges[tier_index(*t)];
                g.configured && g.healthy
            })
            .max_by_key(|t| {
                (
                    self.tiers[tier_index(*t)].hits.load(Ordering::Relaxed),
                    std::cmp::Reverse(t.rank()),
                )
            });
        *self.preferred.write() = preferred;
        preferred
    }

    pub fn preferred_provider(&self) -> Option<TierKind> {
        *self.preferred.read()
    }

    /// Zero the counters, the error log and the latency samples
    ///
    /// Tier gauges and Prometheus counters are left alone.
    pub fn reset(&self) {
        for tier in &self.tiers {
            tier.hits.store(0, Ordering::Relaxed);
            tier.misses.store(0, Ordering::Relaxed);
            tier.evictions.store(0, Ordering::Relaxed);
            tier.errors.store(0, Ordering::Relaxed);
        }
        for counter in [
            &self.global.gets,
            &self.global.sets,
            &self.global.deletes,
            &self.global.invalidations,
            &self.global.errors,
            &self.global.hits,
            &self.global.misses,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        for reservoir in self.latencies.lock().values_mut() {
            reservoir.clear();
        }
        self.recent_errors.lock().clear();
        self.refresh_preferred_provider();
    }

    pub fn error_count(&self) -> u64 {
        self.global.errors.load(Ordering::Relaxed)
    }

    /// Derive the health verdict from errors, hit rate, memory and tiers
    pub fn health(&self) -> HealthVerdict {
        let mut status = HealthStatus::Healthy;
        let mut issues = Vec::new();
        let cfg = &self.config;

        let errors = self.error_count();
        if errors > cfg.unhealthy_error_threshold {
            status = HealthStatus::Unhealthy;
            issues.push(format!(
                "error count {} exceeds unhealthy threshold {}",
                errors, cfg.unhealthy_error_threshold
            ));
        } else if errors >= cfg.degraded_error_threshold {
            status = HealthStatus::Degraded;
            issues.push(format!(
                "error count {} reached degraded threshold {}",
                errors, cfg.degraded_error_threshold
            ));
        }

        let hits = self.global.hits.load(Ordering::Relaxed);
        let misses = self.global.misses.load(Ordering::Relaxed);
        let hit_rate = rate(hits, misses);
        if hits + misses >= cfg.min_lookups_for_hit_rate && hit_rate < cfg.low_hit_rate {
            status = status.max(HealthStatus::Degraded);
            issues.push(format!("low hit rate {:.1}%", hit_rate * 100.0));
        }

        let (bytes, limit) = *self.memory.read();
        if limit > 0 {
            let utilization = bytes as f64 / limit as f64;
            if utilization > cfg.memory_utilization_threshold {
                status = status.max(HealthStatus::Degraded);
                issues.push(format!("memory utilization {:.1}%", utilization * 100.0));
            }
        }

        let gauges = *self.gauges.read();
        for tier in [TierKind::RemotePrimary, TierKind::RemoteSecondary] {
            let g = gauges[tier_index(tier)];
            if g.configured && !g.healthy {
                status = status.max(HealthStatus::Degraded);
                issues.push(format!("{} tier unhealthy", tier));
            }
        }

        for record in self.recent_errors.lock().iter().rev().take(5) {
            issues.push(format!(
                "{} {} {}: {}",
                record.tier.map_or("cache", |t| t.as_str()),
                record.operation,
                record.key,
                record.message
            ));
        }

        HealthVerdict { status, issues }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let gauges = *self.gauges.read();
        let tiers = TierKind::ALL
            .into_iter()
            .map(|tier| {
                let c = &self.tiers[tier_index(tier)];
                let g = gauges[tier_index(tier)];
                let hits = c.hits.load(Ordering::Relaxed);
                let misses = c.misses.load(Ordering::Relaxed);
                TierMetrics {
                    tier,
                    configured: g.configured,
                    healthy: g.healthy,
                    hits,
                    misses,
                    hit_rate: rate(hits, misses),
                    evictions: c.evictions.load(Ordering::Relaxed),
                    errors: c.errors.load(Ordering::Relaxed),
                    size: g.size,
                    max_size: g.max_size,
                }
            })
            .collect();

        let hits = self.global.hits.load(Ordering::Relaxed);
        let misses = self.global.misses.load(Ordering::Relaxed);
        let global = GlobalMetrics {
            gets: self.global.gets.load(Ordering::Relaxed),
            sets: self.global.sets.load(Ordering::Relaxed),
            deletes: self.global.deletes.load(Ordering::Relaxed),
            invalidations: self.global.invalidations.load(Ordering::Relaxed),
            errors: self.global.errors.load(Ordering::Relaxed),
            hits,
            misses,
            hit_rate: rate(hits, misses),
        };

        let latency = self
            .latencies
            .lock()
            .iter()
            .map(|(op, r)| (op.to_string(), r.percentiles()))
            .collect();

        let (memory_bytes, memory_limit_bytes) = *self.memory.read();
        let memory_utilization = if memory_limit_bytes == 0 {
            0.0
        } else {
            memory_bytes as f64 / memory_limit_bytes as f64
        };

        MetricsSnapshot {
            timestamp: self.clock.now_millis(),
            tiers,
            global,
            latency,
            memory_bytes,
            memory_limit_bytes,
            memory_utilization,
            preferred_provider: self.preferred_provider(),
            health: self.health(),
            recent_errors: self.recent_errors.lock().iter().cloned().collect(),
        }
    }

    /// Encode the registry in Prometheus text format
    pub fn encode_prometheus(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let families = self.prometheus.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| CacheError::InternalError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualClock;
    use std::sync::Arc;

    fn collector() -> MetricsCollector {
        MetricsCollector::new(MetricsConfig::default(), Arc::new(ManualClock::new(0))).unwrap()
    }

    #[test]
    fn test_error_thresholds() {
        let metrics = collector();
        assert_eq!(metrics.health().status, HealthStatus::Healthy);

        for _ in 0..3 {
            metrics.record_error(Some(TierKind::RemotePrimary), "get", "k", "boom");
        }
        assert_eq!(metrics.health().status, HealthStatus::Degraded);

        for _ in 0..7 {
            metrics.record_error(None, "fetch", "k", "boom");
        }
        assert_eq!(metrics.error_count(), 10);
        assert_eq!(metrics.health().status, HealthStatus::Degraded);

        metrics.record_error(None, "fetch", "k", "boom");
        assert_eq!(metrics.health().status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_reset_restores_health() {
        let metrics = collector();
        for _ in 0..11 {
            metrics.record_error(Some(TierKind::RemotePrimary), "get", "k", "boom");
        }
        metrics.record_get(true, Duration::from_millis(1));
        assert_eq!(metrics.health().status, HealthStatus::Unhealthy);

        metrics.reset();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.health.status, HealthStatus::Healthy);
        assert_eq!(snapshot.global, GlobalMetrics::default());
        assert!(snapshot.recent_errors.is_empty());
        assert_eq!(snapshot.tier(TierKind::RemotePrimary).unwrap().errors, 0);
        assert_eq!(snapshot.latency["get"].count, 0);
    }

    #[test]
    fn test_low_hit_rate_needs_enough_lookups() {
        let metrics = collector();
        for _ in 0..99 {
            metrics.record_get(false, Duration::from_micros(5));
        }
        assert_eq!(metrics.health().status, HealthStatus::Healthy);

        metrics.record_get(false, Duration::from_micros(5));
        let verdict = metrics.health();
        assert_eq!(verdict.status, HealthStatus::Degraded);
        assert!(verdict.issues.iter().any(|i| i.contains("hit rate")));
    }

    #[test]
    fn test_memory_utilization_and_remote_health() {
        let metrics = collector();
        metrics.update_memory_usage(95, 100);
        assert_eq!(metrics.health().status, HealthStatus::Degraded);

        metrics.update_memory_usage(10, 100);
        metrics.update_tier(TierKind::RemotePrimary, true, false, 0, 0);
        let verdict = metrics.health();
        assert_eq!(verdict.status, HealthStatus::Degraded);
        assert!(verdict.issues.iter().any(|i| i.contains("remote_primary")));
    }

    #[test]
    fn test_preferred_provider() {
        let metrics = collector();
        metrics.update_tier(TierKind::RemotePrimary, true, true, 0, 0);

        // No hits anywhere: the faster tier wins the tie
        assert_eq!(metrics.refresh_preferred_provider(), Some(TierKind::Memory));

        metrics.record_tier_hit(TierKind::RemotePrimary);
        assert_eq!(
            metrics.refresh_preferred_provider(),
            Some(TierKind::RemotePrimary)
        );

        metrics.update_tier(TierKind::RemotePrimary, true, false, 0, 0);
        assert_eq!(metrics.refresh_preferred_provider(), Some(TierKind::Memory));
    }

    #[test]
    fn test_recent_errors_are_capped() {
        let metrics = MetricsCollector::new(
            MetricsConfig {
                max_recent_errors: 3,
                unhealthy_error_threshold: 100,
                ..Default::default()
            },
            Arc::new(ManualClock::new(0)),
        )
        .unwrap();

        for i in 0..5 {
            metrics.record_error(Some(TierKind::RemoteSecondary), "set", &format!("k{}", i), "down");
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.recent_errors.len(), 3);
        assert_eq!(snapshot.recent_errors[0].key, "k2");
        assert_eq!(snapshot.global.errors, 5);
        assert_eq!(snapshot.tier(TierKind::RemoteSecondary).unwrap().errors, 5);
    }

    #[test]
    fn test_snapshot_and_summary() {
        let metrics = collector();
        metrics.record_tier_hit(TierKind::Memory);
        metrics.record_tier_miss(TierKind::Memory);
        metrics.record_get(true, Duration::from_millis(2));
        metrics.record_set(Duration::from_millis(1));
        metrics.record_eviction(TierKind::Memory);
        metrics.update_tier(TierKind::Memory, true, true, 7, 1000);

        let snapshot = metrics.snapshot();
        let memory = snapshot.tier(TierKind::Memory).unwrap();
        assert_eq!(memory.hit_rate, 0.5);
        assert_eq!(memory.evictions, 1);
        assert_eq!(memory.size, 7);
        assert_eq!(snapshot.global.gets, 1);
        assert_eq!(snapshot.global.sets, 1);
        assert!(snapshot.latency.contains_key("get"));

        let summary = snapshot.summary();
        assert!(summary.contains("Health: healthy"));
        assert!(summary.contains("memory"));
        assert!(summary.contains("p95"));
    }

    #[test]
    fn test_encode_prometheus() {
        let metrics = collector();
        metrics.record_get(true, Duration::from_millis(1));
        metrics.record_tier_hit(TierKind::Memory);

        let text = metrics.encode_prometheus().unwrap();
        assert!(text.contains("strata_cache_operations_total"));
        assert!(text.contains("strata_cache_tier_lookups_total"));
    }
}
