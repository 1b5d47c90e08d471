//! Currency-tagged decimal amounts.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::value_object::ValueObject;

/// Currency used when a caller does not specify one.
pub const DEFAULT_CURRENCY: &str = "USD";

/// Immutable monetary amount.
///
/// Arithmetic between different currencies is rejected rather than converted.
/// The amount travels on the wire as a decimal string so no precision is lost
/// in JSON.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "MoneyWire", into = "MoneyWire")]
pub struct Money {
    amount: Decimal,
    currency: String,
}

#[derive(Serialize, Deserialize)]
struct MoneyWire {
    amount: Decimal,
    currency: String,
}

impl TryFrom<MoneyWire> for Money {
    type Error = DomainError;

    fn try_from(value: MoneyWire) -> Result<Self, Self::Error> {
        Money::new(value.amount, &value.currency)
    }
}

impl From<Money> for MoneyWire {
    fn from(value: Money) -> Self {
        Self {
            amount: value.amount,
            currency: value.currency,
        }
    }
}

impl ValueObject for Money {}

fn validate_currency(code: &str) -> DomainResult<()> {
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(DomainError::validation(format!(
            "currency must be a 3-letter ISO code, got '{code}'"
        )));
    }
    Ok(())
}

impl Money {
    pub fn new(amount: Decimal, currency: &str) -> DomainResult<Self> {
        validate_currency(currency)?;
        Ok(Self {
            amount,
            currency: currency.to_string(),
        })
    }

    pub fn zero(currency: &str) -> DomainResult<Self> {
        Self::new(Decimal::ZERO, currency)
    }

    /// Amount in the default currency.
    pub fn usd(amount: Decimal) -> Self {
        Self {
            amount,
            currency: DEFAULT_CURRENCY.to_string(),
        }
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn is_negative(&self) -> bool {
        self.amount.is_sign_negative() && !self.amount.is_zero()
    }

    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    fn ensure_same_currency(&self, other: &Money) -> DomainResult<()> {
        if self.currency != other.currency {
            return Err(DomainError::validation(format!(
                "currency mismatch: {} vs {}",
                self.currency, other.currency
            )));
        }
        Ok(())
    }

    pub fn checked_add(&self, other: &Money) -> DomainResult<Money> {
        self.ensure_same_currency(other)?;
        let amount = self
            .amount
            .checked_add(other.amount)
            .ok_or_else(|| DomainError::validation("monetary overflow"))?;
        Ok(Self {
            amount,
            currency: self.currency.clone(),
        })
    }

    pub fn checked_sub(&self, other: &Money) -> DomainResult<Money> {
        self.ensure_same_currency(other)?;
        let amount = self
            .amount
            .checked_sub(other.amount)
            .ok_or_else(|| DomainError::validation("monetary overflow"))?;
        Ok(Self {
            amount,
            currency: self.currency.clone(),
        })
    }

    /// Line total for `quantity` units at this unit price.
    pub fn times(&self, quantity: u32) -> DomainResult<Money> {
        let amount = self
            .amount
            .checked_mul(Decimal::from(quantity))
            .ok_or_else(|| DomainError::validation("monetary overflow"))?;
        Ok(Self {
            amount,
            currency: self.currency.clone(),
        })
    }

    /// Sum amounts that must all be in `currency`.
    pub fn sum<'a>(currency: &str, amounts: impl IntoIterator<Item = &'a Money>) -> DomainResult<Money> {
        amounts
            .into_iter()
            .try_fold(Money::zero(currency)?, |acc, m| acc.checked_add(m))
    }
}

impl core::fmt::Display for Money {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn usd(cents: i64) -> Money {
        Money::usd(Decimal::new(cents, 2))
    }

    #[test]
    fn rejects_malformed_currency() {
        assert!(Money::new(Decimal::ONE, "usd").is_err());
        assert!(Money::new(Decimal::ONE, "EURO").is_err());
        assert!(Money::new(Decimal::ONE, "EUR").is_ok());
    }

    #[test]
    fn mixing_currencies_is_a_validation_error() {
        let eur = Money::new(Decimal::ONE, "EUR").unwrap();
        let err = usd(100).checked_add(&eur).unwrap_err();
        assert!(matches!(err, DomainError::Validation(msg) if msg.contains("currency mismatch")));
    }

    #[test]
    fn times_computes_line_totals() {
        assert_eq!(usd(1000).times(3).unwrap(), usd(3000));
        assert!(usd(1000).times(0).unwrap().is_zero());
    }

    #[test]
    fn wire_format_keeps_decimal_precision() {
        let json = serde_json::to_value(usd(1999)).unwrap();
        assert_eq!(json["amount"], "19.99");
        assert_eq!(json["currency"], "USD");

        let back: Money = serde_json::from_value(json).unwrap();
        assert_eq!(back, usd(1999));
    }

    #[test]
    fn deserializing_invalid_currency_fails() {
        let json = serde_json::json!({ "amount": "1.00", "currency": "us" });
        assert!(serde_json::from_value::<Money>(json).is_err());
    }

    #[test]
    fn negative_detection_ignores_negative_zero() {
        assert!(usd(-1).is_negative());
        assert!(!usd(0).is_negative());
    }

    proptest! {
        #[test]
        fn sum_matches_integer_arithmetic(cents in prop::collection::vec(0i64..1_000_000, 0..20)) {
            let amounts: Vec<Money> = cents.iter().map(|c| usd(*c)).collect();
            let total = Money::sum("USD", &amounts).unwrap();
            prop_assert_eq!(total, usd(cents.iter().sum()));
        }
    }
}
