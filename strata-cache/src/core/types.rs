use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Priority given to entries stored without an explicit one
pub const DEFAULT_PRIORITY: u8 = 5;

/// Stored value in a cache tier with bookkeeping metadata
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// Cached value
    pub data: V,
    /// When the value was written (ms since epoch)
    pub created_at: u64,
    /// Lifetime measured from `created_at`
    pub ttl: Duration,
    /// Eviction priority, lower goes first under the priority strategy
    pub priority: u8,
    /// Number of reads served
    pub access_count: u64,
    /// Last read or write (ms since epoch)
    pub last_accessed_at: u64,
    /// Estimated footprint in bytes
    pub size_bytes: usize,
}

impl<V> CacheEntry<V> {
    /// Create a new entry stamped at `now`
    pub fn new(data: V, now: u64, ttl: Duration, priority: u8, size_bytes: usize) -> Self {
        Self {
            data,
            created_at: now,
            ttl,
            priority,
            access_count: 0,
            last_accessed_at: now,
            size_bytes,
        }
    }

    /// Live while `now - created_at <= ttl`
    pub fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.created_at) > self.ttl.as_millis() as u64
    }

    /// Record a read
    pub fn touch(&mut self, now: u64) {
        self.access_count += 1;
        self.last_accessed_at = now;
    }

    /// Absolute expiry timestamp (ms)
    pub fn expires_at(&self) -> u64 {
        self.created_at
            .saturating_add(self.ttl.as_millis() as u64)
    }

    /// Remaining lifetime, zero once expired
    pub fn remaining_ttl(&self, now: u64) -> Duration {
        Duration::from_millis(self.expires_at().saturating_sub(now))
    }
}

/// Per-write options for single-tier stores
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    pub ttl: Option<Duration>,
    pub priority: Option<u8>,
}

impl SetOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Options accepted by the tiered cache and the manager
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheOptions {
    /// Overrides the per-tier default TTL
    pub ttl: Option<Duration>,
    /// Eviction priority for the in-memory tier
    pub priority: Option<u8>,
    /// Scope the operation to a session; enables the session tier
    pub session_id: Option<String>,
    /// Per-call override of the instance write-through policy
    pub write_through: Option<bool>,
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn write_through(mut self, enabled: bool) -> Self {
        self.write_through = Some(enabled);
        self
    }

    pub(crate) fn set_options(&self, default_ttl: Duration) -> SetOptions {
        SetOptions {
            ttl: Some(self.ttl.unwrap_or(default_ttl)),
            priority: self.priority,
        }
    }
}

/// Eviction strategy for bounded tiers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EvictionStrategy {
    /// Least Recently Used
    #[default]
    Lru,
    /// Least Frequently Used
    Lfu,
    /// Lowest priority first
    Priority,
}

/// Storage tier in the waterfall
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    RemotePrimary,
    RemoteSecondary,
    Memory,
    Session,
}

impl TierKind {
    pub const ALL: [TierKind; 4] = [
        TierKind::RemotePrimary,
        TierKind::RemoteSecondary,
        TierKind::Memory,
        TierKind::Session,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RemotePrimary => "remote_primary",
            Self::RemoteSecondary => "remote_secondary",
            Self::Memory => "memory",
            Self::Session => "session",
        }
    }

    /// Latency class, lower is faster
    pub fn rank(&self) -> u8 {
        match self {
            Self::Memory => 0,
            Self::Session => 1,
            Self::RemotePrimary => 2,
            Self::RemoteSecondary => 3,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::RemotePrimary | Self::RemoteSecondary)
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall health verdict, ordered by severity
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        })
    }
}

/// Point-in-time state of one tier
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TierStatus {
    pub tier: TierKind,
    pub configured: bool,
    pub enabled: bool,
    pub healthy: bool,
}

impl TierStatus {
    /// Whether reads and writes are attempted against this tier
    pub fn usable(&self) -> bool {
        self.configured && self.enabled && self.healthy
    }
}
