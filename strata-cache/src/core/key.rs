//! Structured cache keys
//!
//! Keys follow the grammar `prefix(:segment)*` where the prefix comes from a
//! closed set and reserved segments (`u:`, `s:`, `v:`, `l:`) may appear
//! anywhere after it. Builders never fail: illegal characters are replaced and
//! free-form input is hashed to a short token, so every built key satisfies
//! [`is_valid_cache_key`].

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use super::error::{CacheError, Result};

/// Maximum length of a cache key
pub const MAX_KEY_LENGTH: usize = 250;

/// Segment separator
pub const KEY_DELIMITER: char = ':';

/// Wildcard accepted by patterns
pub const WILDCARD: char = '*';

/// Segments longer than this are replaced by their hash token
const MAX_SEGMENT_LENGTH: usize = 64;

/// Key namespace, always segment 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyPrefix {
    Image,
    Description,
    Qa,
    Phrase,
    Vector,
    Search,
    User,
    Session,
    Auth,
    Api,
    Computed,
    Request,
}

impl KeyPrefix {
    pub const ALL: [KeyPrefix; 12] = [
        KeyPrefix::Image,
        KeyPrefix::Description,
        KeyPrefix::Qa,
        KeyPrefix::Phrase,
        KeyPrefix::Vector,
        KeyPrefix::Search,
        KeyPrefix::User,
        KeyPrefix::Session,
        KeyPrefix::Auth,
        KeyPrefix::Api,
        KeyPrefix::Computed,
        KeyPrefix::Request,
    ];

    /// Wire token used in built keys
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "img",
            Self::Description => "desc",
            Self::Qa => "qa",
            Self::Phrase => "phrase",
            Self::Vector => "vec",
            Self::Search => "search",
            Self::User => "user",
            Self::Session => "session",
            Self::Auth => "auth",
            Self::Api => "api",
            Self::Computed => "compute",
            Self::Request => "req",
        }
    }
}

impl fmt::Display for KeyPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyPrefix {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_lowercase().as_str() {
            "img" | "image" => Self::Image,
            "desc" | "description" => Self::Description,
            "qa" => Self::Qa,
            "phrase" => Self::Phrase,
            "vec" | "vector" => Self::Vector,
            "search" => Self::Search,
            "user" => Self::User,
            "session" => Self::Session,
            "auth" => Self::Auth,
            "api" => Self::Api,
            "compute" | "computed" => Self::Computed,
            "req" | "request" => Self::Request,
            other => {
                return Err(CacheError::InvalidKey(format!(
                    "unknown key prefix '{}'",
                    other
                )));
            }
        })
    }
}

/// Deterministic short token for free-form input
///
/// First 8 bytes of SHA-256, hex encoded.
pub fn hash_token(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..8])
}

fn sanitize_segment(raw: &str) -> String {
    if raw.is_empty() {
        return "_".to_string();
    }
    if raw.chars().count() > MAX_SEGMENT_LENGTH {
        return hash_token(raw);
    }
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Ordered key under construction
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    prefix: KeyPrefix,
    segments: Vec<String>,
}

impl CacheKey {
    pub fn new(prefix: KeyPrefix) -> Self {
        Self {
            prefix,
            segments: Vec::new(),
        }
    }

    /// Append a plain segment
    pub fn segment(mut self, value: impl AsRef<str>) -> Self {
        self.segments.push(sanitize_segment(value.as_ref()));
        self
    }

    /// Append a free-form segment as its hash token
    pub fn hashed(mut self, value: impl AsRef<str>) -> Self {
        self.segments.push(hash_token(value.as_ref()));
        self
    }

    /// Append a serializable value (filters, arguments) as a hash token
    pub fn json<T: Serialize + ?Sized>(self, value: &T) -> Self {
        let encoded = serde_json::to_string(value).unwrap_or_else(|_| "null".to_string());
        self.hashed(encoded)
    }

    pub fn user(self, user_id: impl AsRef<str>) -> Self {
        self.reserved('u', user_id.as_ref())
    }

    pub fn session(self, session_id: impl AsRef<str>) -> Self {
        self.reserved('s', session_id.as_ref())
    }

    pub fn version(self, version: impl AsRef<str>) -> Self {
        self.reserved('v', version.as_ref())
    }

    pub fn locale(self, locale: impl AsRef<str>) -> Self {
        self.reserved('l', locale.as_ref())
    }

    fn reserved(mut self, tag: char, value: &str) -> Self {
        self.segments
            .push(format!("{}{}{}", tag, KEY_DELIMITER, sanitize_segment(value)));
        self
    }

    pub fn prefix(&self) -> KeyPrefix {
        self.prefix
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Render the key, collapsing to a hashed form past [`MAX_KEY_LENGTH`]
    pub fn build(&self) -> String {
        let mut key = String::from(self.prefix.as_str());
        for segment in &self.segments {
            key.push(KEY_DELIMITER);
            key.push_str(segment);
        }

        if key.len() > MAX_KEY_LENGTH {
            format!("{}:h:{}", self.prefix.as_str(), hash_token(&key))
        } else {
            key
        }
    }

    /// Render an invalidation pattern covering every key below this one
    pub fn pattern(&self) -> String {
        if self.segments.is_empty() {
            format!("{}{}{}", self.prefix.as_str(), KEY_DELIMITER, WILDCARD)
        } else {
            format!("{}{}{}", self.build(), KEY_DELIMITER, WILDCARD)
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.build())
    }
}

/// `build(prefix, segments...)`
pub fn build_key<S: AsRef<str>>(prefix: KeyPrefix, segments: &[S]) -> String {
    segments
        .iter()
        .fold(CacheKey::new(prefix), |key, s| key.segment(s))
        .build()
}

/// `pattern(prefix, segments...)`
pub fn build_pattern<S: AsRef<str>>(prefix: KeyPrefix, segments: &[S]) -> String {
    segments
        .iter()
        .fold(CacheKey::new(prefix), |key, s| key.segment(s))
        .pattern()
}

/// Whether a key is safe to store: non-empty, at most 250 chars of `[A-Za-z0-9:_-]`
pub fn is_valid_cache_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_KEY_LENGTH
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == ':' || c == '_' || c == '-')
}

/// Reject keys that fail [`is_valid_cache_key`]
pub fn validate_key(key: &str) -> Result<()> {
    if is_valid_cache_key(key) {
        Ok(())
    } else {
        Err(CacheError::InvalidKey(if key.len() > MAX_KEY_LENGTH {
            format!("key exceeds {} characters", MAX_KEY_LENGTH)
        } else {
            format!("'{}' contains characters outside [A-Za-z0-9:_-]", key)
        }))
    }
}

/// Glob match where `*` spans any run of characters
pub fn matches_pattern(pattern: &str, key: &str) -> bool {
    let p = pattern.as_bytes();
    let k = key.as_bytes();
    let (mut pi, mut ki) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while ki < k.len() {
        if pi < p.len() && p[pi] == b'*' {
            star = Some(pi);
            mark = ki;
            pi += 1;
        } else if pi < p.len() && p[pi] == k[ki] {
            pi += 1;
            ki += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ki = mark;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}

/// Literal part of a pattern before its first wildcard
pub fn literal_prefix(pattern: &str) -> &str {
    match pattern.find(WILDCARD) {
        Some(idx) => &pattern[..idx],
        None => pattern,
    }
}

/// Catalogue of the key shapes used by callers
pub struct CacheKeys;

impl CacheKeys {
    pub fn image(image_id: &str) -> CacheKey {
        CacheKey::new(KeyPrefix::Image).segment(image_id)
    }

    pub fn description(image_id: &str, locale: &str) -> CacheKey {
        CacheKey::new(KeyPrefix::Description)
            .segment(image_id)
            .locale(locale)
    }

    pub fn qa(image_id: &str, question: &str, locale: &str) -> CacheKey {
        CacheKey::new(KeyPrefix::Qa)
            .segment(image_id)
            .hashed(question)
            .locale(locale)
    }

    pub fn phrase(text: &str, source_lang: &str, target_lang: &str) -> CacheKey {
        CacheKey::new(KeyPrefix::Phrase)
            .hashed(text)
            .segment(source_lang)
            .segment(target_lang)
    }

    pub fn vector(text: &str, model: &str) -> CacheKey {
        CacheKey::new(KeyPrefix::Vector).segment(model).hashed(text)
    }

    pub fn search<F: Serialize + ?Sized>(query: &str, filters: &F) -> CacheKey {
        CacheKey::new(KeyPrefix::Search).hashed(query).json(filters)
    }

    pub fn user(user_id: &str, resource: &str) -> CacheKey {
        CacheKey::new(KeyPrefix::User)
            .segment(user_id)
            .segment(resource)
    }

    pub fn session(session_id: &str, key: &str) -> CacheKey {
        CacheKey::new(KeyPrefix::Session)
            .segment(session_id)
            .segment(key)
    }

    pub fn auth(user_id: &str, kind: &str) -> CacheKey {
        CacheKey::new(KeyPrefix::Auth).user(user_id).segment(kind)
    }

    pub fn api<P: Serialize + ?Sized>(endpoint: &str, params: &P) -> CacheKey {
        CacheKey::new(KeyPrefix::Api).segment(endpoint).json(params)
    }

    pub fn computed<A: Serialize + ?Sized>(function: &str, args: &A) -> CacheKey {
        CacheKey::new(KeyPrefix::Computed)
            .segment(function)
            .json(args)
    }

    pub fn request(method: &str, url: &str) -> CacheKey {
        CacheKey::new(KeyPrefix::Request)
            .segment(method.to_uppercase())
            .hashed(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_search_key_is_stable() {
        let a = CacheKeys::search("hello world", &json!({"lang": "es"})).build();
        let b = CacheKeys::search("hello world", &json!({"lang": "es"})).build();
        assert_eq!(a, b);
        assert!(a.starts_with("search:"));
        assert!(is_valid_cache_key(&a));

        let c = CacheKeys::search("hello world", &json!({"lang": "fr"})).build();
        let d = CacheKeys::search("hello there", &json!({"lang": "es"})).build();
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_reserved_segments() {
        let key = CacheKey::new(KeyPrefix::User)
            .segment("profile")
            .user("42")
            .session("abc")
            .version("3")
            .locale("en-US")
            .build();
        assert_eq!(key, "user:profile:u:42:s:abc:v:3:l:en-US");
    }

    #[test]
    fn test_illegal_characters_replaced() {
        let key = CacheKeys::image("cat pic/1.jpg").build();
        assert_eq!(key, "img:cat_pic_1_jpg");
        assert!(is_valid_cache_key(&key));
    }

    #[test]
    fn test_long_input_stays_bounded() {
        let question = "why ".repeat(200);
        let key = CacheKeys::qa("img-1", &question, "en").build();
        assert!(key.len() <= MAX_KEY_LENGTH);
        assert!(is_valid_cache_key(&key));

        let mut builder = CacheKey::new(KeyPrefix::Api);
        for i in 0..40 {
            builder = builder.segment(format!("segment{:02}", i));
        }
        let collapsed = builder.build();
        assert!(collapsed.starts_with("api:h:"));
        assert!(collapsed.len() <= MAX_KEY_LENGTH);
    }

    #[test]
    fn test_build_and_pattern_helpers() {
        assert_eq!(build_key(KeyPrefix::Image, &["123"]), "img:123");
        assert_eq!(build_pattern(KeyPrefix::Image, &["123"]), "img:123:*");
        assert_eq!(build_pattern::<&str>(KeyPrefix::Description, &[]), "desc:*");
    }

    #[test]
    fn test_validator() {
        assert!(is_valid_cache_key("img:123"));
        assert!(is_valid_cache_key("a_b-c:D9"));
        assert!(!is_valid_cache_key(""));
        assert!(!is_valid_cache_key("img:12 3"));
        assert!(!is_valid_cache_key("img:*"));
        assert!(!is_valid_cache_key(&"a".repeat(251)));
        assert!(validate_key("img/1").is_err());
    }

    #[test]
    fn test_prefix_parsing() {
        assert_eq!("img".parse::<KeyPrefix>().unwrap(), KeyPrefix::Image);
        assert_eq!("computed".parse::<KeyPrefix>().unwrap(), KeyPrefix::Computed);
        assert!("bogus".parse::<KeyPrefix>().is_err());
        for prefix in KeyPrefix::ALL {
            assert_eq!(prefix.as_str().parse::<KeyPrefix>().unwrap(), prefix);
        }
    }

    #[test]
    fn test_pattern_matching() {
        assert!(matches_pattern("img:*", "img:123"));
        assert!(matches_pattern("*", "anything"));
        assert!(matches_pattern("desc:*:l:en", "desc:42:l:en"));
        assert!(matches_pattern("user:42", "user:42"));
        assert!(!matches_pattern("img:*", "desc:123"));
        assert!(!matches_pattern("img:*", "img"));
        assert!(!matches_pattern("user:42", "user:420"));
        assert_eq!(literal_prefix("img:12*"), "img:12");
        assert_eq!(literal_prefix("img:12"), "img:12");
    }

    #[test]
    fn test_hash_token_shape() {
        let token = hash_token("hello world");
        assert_eq!(token.len(), 16);
        assert_eq!(token, hash_token("hello world"));
        assert_ne!(token, hash_token("hello world!"));
    }
}
