// src/amount.rs
use num_bigint::BigUint;
use num_traits::{CheckedSub, Zero};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::Add;
use std::str::FromStr;

use crate::LedgerError;

/// Non-negative, arbitrary-precision quantity in an asset's smallest unit.
///
/// At the boundary an amount is always a base-10 string of ASCII digits.
/// There is no fractional part: callers pre-scale to the base unit
/// (wei, satoshi, cents).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(BigUint);

impl Amount {
    pub fn zero() -> Self {
        Self(BigUint::zero())
    }

    /// Parse a base-10 digit string. Zero is accepted.
    pub fn parse(raw: &str) -> Result<Self, LedgerError> {
        if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Err(LedgerError::InvalidAmount(raw.to_string()));
        }

        BigUint::parse_bytes(raw.as_bytes(), 10)
            .map(Self)
            .ok_or_else(|| LedgerError::InvalidAmount(raw.to_string()))
    }

    /// Parse an amount that is about to move value: it must be strictly positive.
    pub fn parse_positive(raw: &str) -> Result<Self, LedgerError> {
        let amount = Self::parse(raw)?;
        if amount.is_zero() {
            return Err(LedgerError::InvalidAmount(raw.to_string()));
        }
        Ok(amount)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// `None` when `other` exceeds `self`; a balance can never go negative.
    pub fn checked_sub(&self, other: &Amount) -> Option<Amount> {
        self.0.checked_sub(&other.0).map(Self)
    }

    /// Number of decimal digits, used as a magnitude for metrics.
    pub fn digits(&self) -> usize {
        if self.is_zero() {
            1
        } else {
            self.0.to_str_radix(10).len()
        }
    }
}

impl Add for &Amount {
    type Output = Amount;

    fn add(self, rhs: &Amount) -> Amount {
        Amount(&self.0 + &rhs.0)
    }
}

impl Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0 + rhs.0)
    }
}

impl From<u64> for Amount {
    fn from(value: u64) -> Self {
        Self(BigUint::from(value))
    }
}

impl FromStr for Amount {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Amount::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_digits() {
        assert_eq!(Amount::parse("0").unwrap(), Amount::zero());
        assert_eq!(Amount::parse("0050").unwrap(), Amount::from(50));
        assert_eq!(Amount::parse("50").unwrap().to_string(), "50");
    }

    #[test]
    fn test_parse_rejects_non_digits() {
        for raw in ["", "-1", "+1", "1.5", " 1", "1 ", "1e9", "0x10", "1_000", "١"] {
            assert!(
                matches!(Amount::parse(raw), Err(LedgerError::InvalidAmount(_))),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_positive_rejects_zero() {
        assert!(matches!(
            Amount::parse_positive("000"),
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(Amount::parse_positive("1").is_ok());
    }

    #[test]
    fn test_beyond_u128() {
        // 2^200 wei, far beyond any fixed-width integer
        let huge = "1606938044258990275541962092341162602522202993782792835301376";
        let a = Amount::parse(huge).unwrap();
        let sum = &a + &a;
        assert_eq!(
            sum.to_string(),
            "3213876088517980551083924184682325205044405987565585670602752"
        );
        assert_eq!(sum.checked_sub(&a).unwrap(), a);
        assert_eq!(a.digits(), huge.len());
    }

    #[test]
    fn test_checked_sub_never_negative() {
        let hundred = Amount::from(100);
        let eighty = Amount::from(80);
        assert_eq!(hundred.checked_sub(&eighty), Some(Amount::from(20)));
        assert_eq!(eighty.checked_sub(&hundred), None);
        assert_eq!(eighty.checked_sub(&eighty), Some(Amount::zero()));
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&Amount::from(42)).unwrap();
        assert_eq!(json, "\"42\"");
        let back: Amount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Amount::from(42));
        assert!(serde_json::from_str::<Amount>("\"-3\"").is_err());
    }
}
