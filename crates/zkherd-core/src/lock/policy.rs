//! Timing rules for the pseudo-lock.
//!
//! All of the arithmetic that decides whether a lock key is stale, settled
//! or owned lives here, so it can be tested without a store.

use std::fmt;
use std::time::Duration;
use zkherd_common::protocol::error::{Result, ZkherdError};

/// Pseudo-lock timing configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockPolicy {
    /// How old a key must be before its owner may treat it as held. Covers
    /// the window in which a competitor's key may not be visible yet.
    pub settling: Duration,
    /// Keys older than this are considered abandoned and are deleted by
    /// whoever notices them.
    pub timeout: Duration,
    /// Delay between key listings while waiting.
    pub polling: Duration,
    /// Our own key may be invisible for `settling * missing_key_factor`
    /// before the store is considered broken.
    pub missing_key_factor: u32,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            settling: Duration::from_secs(5),
            timeout: Duration::from_secs(15 * 60),
            polling: Duration::from_millis(250),
            missing_key_factor: 10,
        }
    }
}

impl LockPolicy {
    /// Policy suitable for in-process stores with no visibility lag.
    pub fn immediate() -> Self {
        Self {
            settling: Duration::ZERO,
            polling: Duration::from_millis(10),
            ..Self::default()
        }
    }

    /// A wait shorter than the settling period can never succeed.
    pub fn validate_wait(&self, max_wait: Duration) -> Result<()> {
        if max_wait < self.settling {
            return Err(ZkherdError::InvalidConfig(format!(
                "lock wait {}ms is shorter than settling period {}ms",
                max_wait.as_millis(),
                self.settling.as_millis()
            )));
        }
        Ok(())
    }

    pub fn is_expired(&self, key: &LockKey, now_ms: u64) -> bool {
        now_ms.saturating_sub(key.created_ms) > self.timeout.as_millis() as u64
    }

    pub fn has_settled(&self, key: &LockKey, now_ms: u64) -> bool {
        now_ms.saturating_sub(key.created_ms) >= self.settling.as_millis() as u64
    }

    pub fn missing_key_limit(&self) -> Duration {
        self.settling.max(self.polling) * self.missing_key_factor
    }

    /// Whether `ours` owns the lock given every live key for the prefix.
    ///
    /// Ownership goes to the oldest key (ties broken by nonce), and only
    /// once that key has settled.
    pub fn owns(&self, ours: &LockKey, live: &[LockKey], now_ms: u64) -> bool {
        let first = live.iter().min();
        first == Some(ours) && self.has_settled(ours, now_ms)
    }
}

/// A lock key: `prefix-<created ms>-<nonce>`.
///
/// The creation time is zero padded so the string form sorts the same way
/// as the parsed form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub prefix: String,
    pub created_ms: u64,
    pub nonce: u64,
}

impl LockKey {
    pub fn new(prefix: impl Into<String>, created_ms: u64, nonce: u64) -> Self {
        Self {
            prefix: prefix.into(),
            created_ms,
            nonce,
        }
    }

    /// Parses a key of the given prefix. Anything else yields `None`.
    pub fn parse(prefix: &str, raw: &str) -> Option<Self> {
        let rest = raw.strip_prefix(prefix)?.strip_prefix('-')?;
        let (created, nonce) = rest.split_once('-')?;
        Some(Self {
            prefix: prefix.to_string(),
            created_ms: created.parse().ok()?,
            nonce: u64::from_str_radix(nonce, 16).ok()?,
        })
    }
}

impl Ord for LockKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.created_ms, self.nonce).cmp(&(other.created_ms, other.nonce))
    }
}

impl PartialOrd for LockKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:020}-{:016x}", self.prefix, self.created_ms, self.nonce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> LockPolicy {
        LockPolicy {
            settling: Duration::from_millis(100),
            timeout: Duration::from_millis(1000),
            polling: Duration::from_millis(10),
            missing_key_factor: 10,
        }
    }

    #[test]
    fn test_key_format_and_parse() {
        let key = LockKey::new("config", 1234, 0xabc);
        let raw = key.to_string();
        assert_eq!(raw, "config-00000000000000001234-0000000000000abc");
        assert_eq!(LockKey::parse("config", &raw), Some(key));
        assert_eq!(LockKey::parse("other", &raw), None);
        assert_eq!(LockKey::parse("config", "config-xyz-1"), None);
    }

    #[test]
    fn test_string_order_matches_key_order() {
        let a = LockKey::new("p", 99, 5);
        let b = LockKey::new("p", 100, 1);
        assert!(a < b);
        assert!(a.to_string() < b.to_string());
    }

    #[test]
    fn test_wait_must_cover_settling() {
        let policy = policy();
        assert!(policy.validate_wait(Duration::from_millis(50)).is_err());
        assert!(policy.validate_wait(Duration::from_millis(100)).is_ok());
    }

    #[test]
    fn test_expiry_and_settling() {
        let policy = policy();
        let key = LockKey::new("p", 1_000, 1);
        assert!(!policy.has_settled(&key, 1_050));
        assert!(policy.has_settled(&key, 1_100));
        assert!(!policy.is_expired(&key, 2_000));
        assert!(policy.is_expired(&key, 2_001));
        // clock behind the key never underflows
        assert!(!policy.is_expired(&key, 500));
        assert!(!policy.has_settled(&key, 500));
    }

    #[test]
    fn test_ownership() {
        let policy = policy();
        let ours = LockKey::new("p", 1_000, 7);
        let older = LockKey::new("p", 900, 1);
        let newer = LockKey::new("p", 1_010, 1);

        assert!(policy.owns(&ours, &[newer.clone(), ours.clone()], 1_200));
        assert!(!policy.owns(&ours, &[newer.clone(), ours.clone()], 1_050));
        assert!(!policy.owns(&ours, &[older, ours.clone(), newer], 1_200));
        assert!(!policy.owns(&ours, &[], 1_200));
    }

    #[test]
    fn test_missing_key_limit() {
        assert_eq!(policy().missing_key_limit(), Duration::from_millis(1000));
        assert_eq!(
            LockPolicy::immediate().missing_key_limit(),
            Duration::from_millis(100)
        );
    }
}
