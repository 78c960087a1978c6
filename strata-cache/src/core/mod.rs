pub mod clock;
pub mod error;
pub mod key;
pub mod types;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock, system_clock};
pub use error::{CacheError, Result};
pub use key::{
    CacheKey, CacheKeys, KeyPrefix, build_key, build_pattern, hash_token, is_valid_cache_key,
    matches_pattern, validate_key,
};
pub use types::{
    CacheEntry, CacheOptions, DEFAULT_PRIORITY, EvictionStrategy, HealthStatus, SetOptions,
    TierKind, TierStatus,
};
