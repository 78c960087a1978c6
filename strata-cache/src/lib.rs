//! Multi-tier self-healing key-value cache
//!
//! Reads fall through the configured tiers and warm the faster ones on a hit.
//! Remote tiers that fail are marked unhealthy and skipped until a health
//! probe restores them, so the in-process memory tier always serves.

pub mod cache;
pub mod config;
pub mod core;
pub mod manager;
pub mod metrics;
pub mod server;

// Re-export commonly used types
pub use cache::{
    LocalStore, MemoryTier, MemoryTierConfig, RemoteStore, RemoteTier, SessionMetadata,
    SessionTier, SessionTierConfig, TieredCache, TieredCacheConfig,
};
pub use config::{CacheConfig, RemoteBackend, ServerConfig};
pub use core::{
    CacheError, CacheKey, CacheKeys, CacheOptions, EvictionStrategy, HealthStatus, KeyPrefix,
    ManualClock, Result, SharedClock, TierKind, TierStatus,
};
pub use manager::{
    CacheManager, CacheManagerBuilder, CleanupReport, HealthReport, MemoizeOptions, Memoized,
    WarmEntry, WarmReport,
};
pub use metrics::{MetricsCollector, MetricsConfig, MetricsSnapshot};
pub use server::{AppState, create_router};
