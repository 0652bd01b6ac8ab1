//! Parameter store: neighbour count `k` and the train/test split.
//!
//! `k` is always odd and the split is held as an integer percentage. Every
//! provenance comparison in the crate goes through [`ParamKey`], so two
//! splits are equal exactly when their percentages are equal.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const K_MIN: u32 = 1;
pub const K_MAX: u32 = 25;
pub const SPLIT_PCT_MIN: u32 = 70;
pub const SPLIT_PCT_MAX: u32 = 95;
pub const DEFAULT_K: u32 = 9;
pub const DEFAULT_SPLIT_PCT: u32 = 90;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParamError {
    #[error("expected a whole number, got {0:?}")]
    NotANumber(String),
}

/// The (k, split%) pair that produced an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParamKey {
    pub k: u32,
    pub split_pct: u32,
}

impl ParamKey {
    pub fn new(k: u32, split_pct: u32) -> Self {
        Self { k, split_pct }
    }

    /// Training fraction as sent over the wire.
    pub fn split(&self) -> f64 {
        self.split_pct as f64 / 100.0
    }

    pub fn same_split(&self, other: &ParamKey) -> bool {
        self.split_pct == other.split_pct
    }
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "k={} split={:.2}", self.k, self.split())
    }
}

/// Convert a split ratio to its percent key.
pub fn split_to_pct(split: f64) -> u32 {
    (split * 100.0).round().max(0.0) as u32
}

/// Force a raw neighbour count onto the odd grid inside [K_MIN, K_MAX].
pub fn odd_k(raw: i64) -> u32 {
    let mut n = raw;
    if n % 2 == 0 {
        n += 1;
    }
    n.clamp(K_MIN as i64, K_MAX as i64) as u32
}

pub fn clamp_split_pct(raw: i64) -> u32 {
    raw.clamp(SPLIT_PCT_MIN as i64, SPLIT_PCT_MAX as i64) as u32
}

/// Parse form text the way a number input reports it: optional sign, then
/// leading digits. Trailing junk after the digits is ignored.
pub fn parse_int(raw: &str) -> Result<i64, ParamError> {
    let trimmed = raw.trim();
    let (sign, rest) = match trimmed.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return Err(ParamError::NotANumber(raw.to_string()));
    }
    digits
        .parse::<i64>()
        .map(|n| sign * n)
        .map_err(|_| ParamError::NotANumber(raw.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModelParams {
    k: u32,
    split_pct: u32,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            split_pct: DEFAULT_SPLIT_PCT,
        }
    }
}

impl ModelParams {
    pub fn new(k: i64, split_pct: i64) -> Self {
        Self {
            k: odd_k(k),
            split_pct: clamp_split_pct(split_pct),
        }
    }

    pub fn k(&self) -> u32 {
        self.k
    }

    pub fn split_pct(&self) -> u32 {
        self.split_pct
    }

    pub fn split(&self) -> f64 {
        self.key().split()
    }

    pub fn key(&self) -> ParamKey {
        ParamKey::new(self.k, self.split_pct)
    }

    /// Commit a neighbour count. Returns true when the stored value changed.
    pub fn set_k(&mut self, raw: i64) -> bool {
        let next = odd_k(raw);
        let changed = next != self.k;
        self.k = next;
        changed
    }

    /// Commit a split percentage. Returns true when the stored value changed.
    pub fn set_split_pct(&mut self, raw: i64) -> bool {
        let next = clamp_split_pct(raw);
        let changed = next != self.split_pct;
        self.split_pct = next;
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_k_always_odd() {
        let mut p = ModelParams::default();
        for raw in -5..60 {
            p.set_k(raw);
            assert_eq!(p.k() % 2, 1, "raw={}", raw);
            assert!((K_MIN..=K_MAX).contains(&p.k()));
        }
    }

    #[test]
    fn test_even_k_bumped() {
        let mut p = ModelParams::default();
        assert!(p.set_k(10));
        assert_eq!(p.k(), 11);
        assert!(!p.set_k(11));
        assert_eq!(p.k(), 11);
        p.set_k(0);
        assert_eq!(p.k(), 1);
    }

    #[test]
    fn test_split_is_derived() {
        let mut p = ModelParams::default();
        assert_eq!(p.split_pct(), 90);
        assert!((p.split() - 0.90).abs() < 1e-12);
        p.set_split_pct(85);
        assert_eq!(p.key(), ParamKey::new(9, 85));
        p.set_split_pct(40);
        assert_eq!(p.split_pct(), SPLIT_PCT_MIN);
    }

    #[test]
    fn test_percent_roundtrip_has_no_drift() {
        for pct in SPLIT_PCT_MIN..=SPLIT_PCT_MAX {
            let key = ParamKey::new(9, pct);
            assert_eq!(split_to_pct(key.split()), pct);
        }
        // 0.1 + 0.2 style drift still compares equal at percent granularity
        assert_eq!(split_to_pct(0.7 + 0.15), 85);
    }

    #[test]
    fn test_parse_int() {
        assert_eq!(parse_int(" 13 "), Ok(13));
        assert_eq!(parse_int("7px"), Ok(7));
        assert_eq!(parse_int("-2"), Ok(-2));
        assert!(matches!(parse_int("abc"), Err(ParamError::NotANumber(_))));
        assert!(parse_int("").is_err());
    }
}
