//! Core types used throughout tollgate.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// One traffic unit: the denominator of all per-traffic prices.
pub const TRAFFIC_UNIT: u64 = 1024 * 1024;

/// Number of decimal places carried by [`Amount`].
const AMOUNT_DECIMALS: u32 = 8;

/// Scale factor between whole tokens and the smallest amount unit.
const AMOUNT_SCALE: i64 = 100_000_000;

/// Fixed-point token amount with 8 decimal places.
///
/// All prices, fees and balances are expressed in this unit. The inner
/// value counts 10^-8 tokens, matching the resolution of on-chain
/// transaction amounts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct Amount(pub i64);

impl Amount {
    pub const ZERO: Self = Self(0);

    /// Construct from the smallest unit (10^-8 tokens).
    pub fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    /// Raw value in 10^-8 tokens.
    pub fn raw(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// Price-per-traffic-unit applied to a byte count.
    pub fn cost_for_bytes(self, bytes: u64) -> Self {
        let v = i128::from(self.0) * i128::from(bytes) / i128::from(TRAFFIC_UNIT);
        Self(v as i64)
    }

    /// Scale by a float factor, truncating toward zero. Used for fee
    /// percentages and coverage thresholds only.
    pub fn mul_f64(self, factor: f64) -> Self {
        Self((self.0 as f64 * factor) as i64)
    }

    pub fn to_f64(self) -> f64 {
        self.0 as f64
    }
}

impl FromStr for Amount {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::ZERO);
        }
        let (sign, digits) = match s.strip_prefix('-') {
            Some(rest) => (-1i64, rest),
            None => (1i64, s),
        };
        let (int_part, frac_part) = match digits.split_once('.') {
            Some((i, f)) => (i, f),
            None => (digits, ""),
        };
        if frac_part.len() > AMOUNT_DECIMALS as usize {
            return Err(Error::InvalidPrice(format!(
                "more than {AMOUNT_DECIMALS} decimal places: {s}"
            )));
        }
        let int_part = if int_part.is_empty() { "0" } else { int_part };
        let whole: i64 = int_part
            .parse()
            .map_err(|_| Error::InvalidPrice(s.to_string()))?;
        let mut frac: i64 = 0;
        if !frac_part.is_empty() {
            frac = frac_part
                .parse()
                .map_err(|_| Error::InvalidPrice(s.to_string()))?;
            frac *= 10i64.pow(AMOUNT_DECIMALS - frac_part.len() as u32);
        }
        let raw = whole
            .checked_mul(AMOUNT_SCALE)
            .and_then(|w| w.checked_add(frac))
            .ok_or_else(|| Error::InvalidPrice(s.to_string()))?;
        Ok(Self(sign * raw))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let raw = self.0.unsigned_abs();
        let whole = raw / AMOUNT_SCALE as u64;
        let frac = raw % AMOUNT_SCALE as u64;
        if self.0 < 0 {
            write!(f, "-")?;
        }
        if frac == 0 {
            write!(f, "{whole}")
        } else {
            let frac_str = format!("{frac:08}");
            write!(f, "{whole}.{}", frac_str.trim_end_matches('0'))
        }
    }
}

impl TryFrom<String> for Amount {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Amount> for String {
    fn from(a: Amount) -> Self {
        a.to_string()
    }
}

/// Per-direction traffic price in tokens per [`TRAFFIC_UNIT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Price {
    pub entry_to_exit: Amount,
    pub exit_to_entry: Amount,
}

impl Price {
    pub fn is_free(&self) -> bool {
        self.entry_to_exit.is_zero() && self.exit_to_entry.is_zero()
    }
}

impl FromStr for Price {
    type Err = Error;

    /// Parse `"entryToExit exitToEntry"`. A single decimal applies to both
    /// directions.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let first = parts.next().unwrap_or("0");
        let entry_to_exit: Amount = first.parse()?;
        let exit_to_entry = match parts.next() {
            Some(second) => second.parse()?,
            None => entry_to_exit,
        };
        if parts.next().is_some() {
            return Err(Error::InvalidPrice(s.to_string()));
        }
        Ok(Self {
            entry_to_exit,
            exit_to_entry,
        })
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.entry_to_exit, self.exit_to_entry)
    }
}

/// Monotonic byte counters for one tunnel direction pair.
///
/// `used` counters are bumped with atomic fetch-add by the data pumps;
/// `paid` counters trail them and are only advanced by the payment loop.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    pub entry_to_exit: AtomicU64,
    pub exit_to_entry: AtomicU64,
    pub paid_entry_to_exit: AtomicU64,
    pub paid_exit_to_entry: AtomicU64,
}

impl TrafficCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entry_to_exit(&self, n: u64) {
        self.entry_to_exit.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_exit_to_entry(&self, n: u64) {
        self.exit_to_entry.fetch_add(n, Ordering::Relaxed);
    }

    pub fn used(&self) -> (u64, u64) {
        (
            self.entry_to_exit.load(Ordering::Relaxed),
            self.exit_to_entry.load(Ordering::Relaxed),
        )
    }

    pub fn paid(&self) -> (u64, u64) {
        (
            self.paid_entry_to_exit.load(Ordering::Relaxed),
            self.paid_exit_to_entry.load(Ordering::Relaxed),
        )
    }

    pub fn record_paid(&self, entry_to_exit: u64, exit_to_entry: u64) {
        self.paid_entry_to_exit
            .store(entry_to_exit, Ordering::Relaxed);
        self.paid_exit_to_entry
            .store(exit_to_entry, Ordering::Relaxed);
    }
}
