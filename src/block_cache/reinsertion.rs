//! Reinsertion policies.
//!
//! During reclaim, each live item of the victim region is either copied
//! forward through the normal write path or dropped with a `Recycled`
//! destructor event. The policy decides per item:
//!
//! - **None**: always drop (the default).
//! - **Hits**: keep items read at least `threshold` times since they were
//!   written.
//! - **Percentage**: keep a fixed fraction. The roll is a deterministic
//!   function of the key hash, so the same key gets the same decision on
//!   every run; recovery cannot flip reinsertion outcomes.

use crate::error::{Error, Result};
use crate::hash::mix64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReinsertionConfig {
    None,
    Hits { threshold: u8 },
    Percentage { percentage: u32 },
}

impl Default for ReinsertionConfig {
    fn default() -> Self {
        Self::None
    }
}

/// Domain separator so the percentage roll does not correlate with bucket
/// placement or admission decisions derived from the same hash.
const PERCENTAGE_SALT: u64 = 0x7265_696e_7365_7274;

pub(crate) struct ReinsertionPolicy {
    config: ReinsertionConfig,
}

impl ReinsertionPolicy {
    pub(crate) fn new(config: ReinsertionConfig) -> Result<Self> {
        if let ReinsertionConfig::Percentage { percentage } = &config {
            if *percentage > 100 {
                return Err(Error::invalid_argument(format!(
                    "reinsertion percentage {percentage} exceeds 100"
                )));
            }
        }
        Ok(Self { config })
    }

    pub(crate) fn should_reinsert(&self, hits: u8, key_hash: u64) -> bool {
        match &self.config {
            ReinsertionConfig::None => false,
            ReinsertionConfig::Hits { threshold } => hits >= *threshold,
            ReinsertionConfig::Percentage { percentage } => {
                (mix64(key_hash ^ PERCENTAGE_SALT) % 100) < *percentage as u64
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_key;

    #[test]
    fn none_always_drops() {
        let policy = ReinsertionPolicy::new(ReinsertionConfig::None).unwrap();
        assert!(!policy.should_reinsert(200, 1));
    }

    #[test]
    fn hits_threshold_gates() {
        let policy = ReinsertionPolicy::new(ReinsertionConfig::Hits { threshold: 2 }).unwrap();
        assert!(!policy.should_reinsert(0, 1));
        assert!(!policy.should_reinsert(1, 1));
        assert!(policy.should_reinsert(2, 1));
        assert!(policy.should_reinsert(255, 1));
    }

    #[test]
    fn percentage_is_deterministic_and_roughly_calibrated() {
        let policy =
            ReinsertionPolicy::new(ReinsertionConfig::Percentage { percentage: 30 }).unwrap();

        let mut kept = 0usize;
        for i in 0..10_000 {
            let hash = hash_key(format!("key-{i}").as_bytes());
            let first = policy.should_reinsert(0, hash);
            assert_eq!(first, policy.should_reinsert(0, hash));
            kept += first as usize;
        }
        assert!((2_500..3_500).contains(&kept), "kept {kept} of 10000");
    }

    #[test]
    fn percentage_extremes() {
        let all = ReinsertionPolicy::new(ReinsertionConfig::Percentage { percentage: 100 })
            .unwrap();
        let none =
            ReinsertionPolicy::new(ReinsertionConfig::Percentage { percentage: 0 }).unwrap();
        for i in 0..100 {
            let hash = hash_key(&[i]);
            assert!(all.should_reinsert(0, hash));
            assert!(!none.should_reinsert(0, hash));
        }
    }

    #[test]
    fn rejects_over_100() {
        assert!(ReinsertionPolicy::new(ReinsertionConfig::Percentage { percentage: 101 }).is_err());
    }
}
