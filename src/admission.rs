//! # Admission Policies
//!
//! The gate in front of every insert. Flash endurance is the budget being
//! spent; the policies trade hit rate for write rate:
//!
//! - **RejectRandom(p)**: admit each insert with probability `p`. Blunt but
//!   predictable.
//! - **DynamicRandom**: track a target byte rate. Once per second the
//!   admitted-byte count is compared against `target_rate` and a global
//!   probability factor is nudged multiplicatively, clamped to
//!   `[lower, upper]`. Each item's probability further scales by
//!   `item_base_size / item_size`, so large values don't get a free ride on
//!   a per-item coin flip. An optional `max_rate` hard-caps the window.
//!
//! With `suffix_ignore_len > 0` the per-item decision becomes a
//! deterministic function of the key hash computed *without* the last `n`
//! key bytes: keys differing only in that suffix (chunk indices of one
//! logical object, typically) are admitted or rejected together.

use std::time::Instant;

use parking_lot::Mutex;
use rand::Rng;

use crate::error::{Error, Result};
use crate::hash::{hash_key, mix64};

/// Domain separator for the deterministic admission roll.
const ADMISSION_SALT: u64 = 0x6164_6d69_7431;

const DEFAULT_ITEM_BASE_SIZE: u32 = 4096;
const DEFAULT_PROB_FACTOR_LOWER: f64 = 0.25;
const DEFAULT_PROB_FACTOR_UPPER: f64 = 2.5;

#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionConfig {
    /// Admit everything.
    None,
    RejectRandom {
        /// Probability of admitting an insert, in `[0, 1]`.
        probability: f64,
    },
    DynamicRandom(DynamicRandomConfig),
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self::None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DynamicRandomConfig {
    /// Admitted bytes per second the factor adjustment tracks.
    pub target_rate: u64,
    /// Trailing key bytes ignored when hashing for the admission decision;
    /// 0 keeps the decision random per call.
    pub suffix_ignore_len: usize,
    /// Numerator of the size-scaled base probability. 0 selects the default.
    pub item_base_size: u32,
    /// Hard cap on admitted bytes per second. 0 disables the cap.
    pub max_rate: u64,
    /// Probability-factor clamp. 0 selects the default bound.
    pub prob_factor_lower: f64,
    pub prob_factor_upper: f64,
}

impl DynamicRandomConfig {
    pub fn new(target_rate: u64) -> Self {
        Self {
            target_rate,
            suffix_ignore_len: 0,
            item_base_size: 0,
            max_rate: 0,
            prob_factor_lower: 0.0,
            prob_factor_upper: 0.0,
        }
    }
}

pub(crate) enum AdmissionPolicy {
    None,
    RejectRandom { probability: f64 },
    Dynamic(DynamicRandom),
}

impl AdmissionPolicy {
    pub(crate) fn new(config: AdmissionConfig) -> Result<Self> {
        match config {
            AdmissionConfig::None => Ok(Self::None),
            AdmissionConfig::RejectRandom { probability } => {
                if !(0.0..=1.0).contains(&probability) {
                    return Err(Error::invalid_argument(format!(
                        "admission probability {probability} outside [0, 1]"
                    )));
                }
                Ok(Self::RejectRandom { probability })
            }
            AdmissionConfig::DynamicRandom(config) => {
                Ok(Self::Dynamic(DynamicRandom::new(config)?))
            }
        }
    }

    pub(crate) fn accept(&self, key: &[u8], item_size: u64) -> bool {
        match self {
            Self::None => true,
            Self::RejectRandom { probability } => {
                // The closed endpoints must be exact: p = 1.0 never rejects,
                // p = 0.0 never admits.
                *probability >= 1.0
                    || (*probability > 0.0
                        && rand::thread_rng().gen::<f64>() < *probability)
            }
            Self::Dynamic(dynamic) => dynamic.accept(key, item_size),
        }
    }
}

struct WindowState {
    window_start: Instant,
    admitted_bytes: u64,
    prob_factor: f64,
}

pub(crate) struct DynamicRandom {
    target_rate: u64,
    max_rate: u64,
    item_base_size: f64,
    suffix_ignore_len: usize,
    lower: f64,
    upper: f64,
    state: Mutex<WindowState>,
}

impl DynamicRandom {
    fn new(config: DynamicRandomConfig) -> Result<Self> {
        if config.target_rate == 0 {
            return Err(Error::invalid_argument(
                "dynamic admission needs a nonzero target rate",
            ));
        }
        let lower = if config.prob_factor_lower > 0.0 {
            config.prob_factor_lower
        } else {
            DEFAULT_PROB_FACTOR_LOWER
        };
        let upper = if config.prob_factor_upper > 0.0 {
            config.prob_factor_upper
        } else {
            DEFAULT_PROB_FACTOR_UPPER
        };
        if lower > upper {
            return Err(Error::invalid_argument(format!(
                "probability factor bounds inverted: {lower} > {upper}"
            )));
        }
        if config.max_rate != 0 && config.max_rate < config.target_rate {
            return Err(Error::invalid_argument(
                "max rate must be at least the target rate",
            ));
        }
        let item_base_size = if config.item_base_size > 0 {
            config.item_base_size
        } else {
            DEFAULT_ITEM_BASE_SIZE
        };
        Ok(Self {
            target_rate: config.target_rate,
            max_rate: config.max_rate,
            item_base_size: item_base_size as f64,
            suffix_ignore_len: config.suffix_ignore_len,
            lower,
            upper,
            state: Mutex::new(WindowState {
                window_start: Instant::now(),
                admitted_bytes: 0,
                prob_factor: 1.0,
            }),
        })
    }

    fn accept(&self, key: &[u8], item_size: u64) -> bool {
        let probability = {
            let mut state = self.state.lock();
            let elapsed = state.window_start.elapsed().as_secs_f64();
            if elapsed >= 1.0 {
                let observed = state.admitted_bytes as f64 / elapsed;
                let adjustment = self.target_rate as f64 / observed.max(1.0);
                state.prob_factor =
                    (state.prob_factor * adjustment).clamp(self.lower, self.upper);
                state.window_start = Instant::now();
                state.admitted_bytes = 0;
            }
            if self.max_rate != 0 && state.admitted_bytes >= self.max_rate {
                // Saturated for this window regardless of probability.
                return false;
            }
            let base = (self.item_base_size / item_size.max(1) as f64).min(1.0);
            (base * state.prob_factor).clamp(0.0, 1.0)
        };

        let admitted = if self.suffix_ignore_len > 0 {
            let prefix_len = key.len().saturating_sub(self.suffix_ignore_len);
            let roll = mix64(hash_key(&key[..prefix_len]) ^ ADMISSION_SALT) % 1_000_000;
            (roll as f64) < probability * 1_000_000.0
        } else {
            rand::thread_rng().gen::<f64>() < probability
        };

        if admitted {
            self.state.lock().admitted_bytes += item_size;
        }
        admitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_random_endpoints_are_exact() {
        let never = AdmissionPolicy::new(AdmissionConfig::RejectRandom { probability: 0.0 })
            .unwrap();
        let always = AdmissionPolicy::new(AdmissionConfig::RejectRandom { probability: 1.0 })
            .unwrap();
        for i in 0..1000u32 {
            let key = i.to_le_bytes();
            assert!(!never.accept(&key, 100));
            assert!(always.accept(&key, 100));
        }
    }

    #[test]
    fn reject_random_validates_probability() {
        assert!(
            AdmissionPolicy::new(AdmissionConfig::RejectRandom { probability: 1.5 }).is_err()
        );
        assert!(
            AdmissionPolicy::new(AdmissionConfig::RejectRandom { probability: -0.1 }).is_err()
        );
    }

    #[test]
    fn reject_random_is_roughly_calibrated() {
        let policy = AdmissionPolicy::new(AdmissionConfig::RejectRandom { probability: 0.5 })
            .unwrap();
        let admitted = (0..10_000)
            .filter(|i: &u32| policy.accept(&i.to_le_bytes(), 100))
            .count();
        assert!((4_000..6_000).contains(&admitted), "admitted {admitted}");
    }

    #[test]
    fn dynamic_suffix_decision_is_deterministic_and_coordinated() {
        let policy = AdmissionPolicy::new(AdmissionConfig::DynamicRandom(DynamicRandomConfig {
            suffix_ignore_len: 4,
            ..DynamicRandomConfig::new(1 << 20)
        }))
        .unwrap();

        // Keys sharing everything but the trailing 4 bytes must decide
        // identically, and repeatably.
        let a = policy.accept(b"object-17:0000", 4096);
        for chunk in 1..50u32 {
            let key = format!("object-17:{chunk:04}");
            assert_eq!(a, policy.accept(key.as_bytes(), 4096));
        }
    }

    #[test]
    fn dynamic_base_probability_penalizes_large_items() {
        let policy = AdmissionPolicy::new(AdmissionConfig::DynamicRandom(DynamicRandomConfig {
            item_base_size: 4096,
            ..DynamicRandomConfig::new(1 << 30)
        }))
        .unwrap();

        let large_admitted = (0..2_000)
            .filter(|i: &u32| policy.accept(&i.to_le_bytes(), 1 << 20))
            .count();
        // base probability is 4096 / 1 MiB ≈ 0.004 before the factor.
        assert!(large_admitted < 200, "admitted {large_admitted}");
    }

    #[test]
    fn dynamic_max_rate_caps_a_window() {
        let policy = AdmissionPolicy::new(AdmissionConfig::DynamicRandom(DynamicRandomConfig {
            max_rate: 10_000,
            item_base_size: 4096,
            ..DynamicRandomConfig::new(10_000)
        }))
        .unwrap();

        let mut admitted_bytes = 0u64;
        for i in 0..10_000u32 {
            if policy.accept(&i.to_le_bytes(), 1_000) {
                admitted_bytes += 1_000;
            }
        }
        assert!(admitted_bytes <= 11_000, "admitted {admitted_bytes} bytes");
    }

    #[test]
    fn dynamic_validates_bounds() {
        assert!(AdmissionPolicy::new(AdmissionConfig::DynamicRandom(
            DynamicRandomConfig::new(0)
        ))
        .is_err());
        assert!(AdmissionPolicy::new(AdmissionConfig::DynamicRandom(DynamicRandomConfig {
            prob_factor_lower: 3.0,
            prob_factor_upper: 2.0,
            ..DynamicRandomConfig::new(1000)
        }))
        .is_err());
        assert!(AdmissionPolicy::new(AdmissionConfig::DynamicRandom(DynamicRandomConfig {
            max_rate: 500,
            ..DynamicRandomConfig::new(1000)
        }))
        .is_err());
    }
}
