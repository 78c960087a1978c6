pub mod memory;
pub mod remote;
pub mod session;
pub mod tiered;

pub use memory::{EvictionCallback, MemoryTier, MemoryTierConfig, MemoryTierStats, estimate_size};
pub use remote::{LocalStore, RemoteStore, RemoteTier};
pub use session::{SessionCleanup, SessionMetadata, SessionTier, SessionTierConfig, SessionTierStats};
pub use tiered::{TieredCache, TieredCacheConfig, validate_tier_order};
