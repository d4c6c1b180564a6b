//! Money value type.
//!
//! Amounts are stored as signed integer minor units (cents) to avoid
//! floating-point drift. All arithmetic is checked so that overflow
//! surfaces as an error instead of wrapping.
//!
//! Amounts cross the HTTP boundary as plain decimal strings ("100.00");
//! parsing is float-free and rounds half-up to two decimals.

use std::fmt;

use serde::Serialize;

use crate::error::AppError;

/// Pix per-transfer ceiling: R$ 20,000.00.
pub const PIX_MAX_CENTS: i64 = 2_000_000;

/// Monetary amount in integer cents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct Money {
    cents: i64,
}

impl Money {
    pub const ZERO: Money = Money { cents: 0 };

    pub fn from_cents(cents: i64) -> Self {
        Self { cents }
    }

    pub fn cents(self) -> i64 {
        self.cents
    }

    /// Parse a decimal string ("100", "100.5", "-0.01") into cents,
    /// rounding half-up to two decimals.
    ///
    /// Rejects empty input, stray signs, scientific notation, bare "."
    /// forms (".5", "5.") and any non-digit characters.
    pub fn from_decimal_str(input: &str) -> Result<Self, AppError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(AppError::InvalidAmount("amount cannot be empty".into()));
        }

        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        if digits.is_empty() || digits.starts_with('+') {
            return Err(invalid_format(trimmed));
        }

        let (int_part, frac_part) = match digits.split_once('.') {
            Some((i, f)) => (i, f),
            None => (digits, ""),
        };
        // ".5" and "5." are rejected; the caller must write "0.5" / "5.0".
        if int_part.is_empty() || (digits.contains('.') && frac_part.is_empty()) {
            return Err(invalid_format(trimmed));
        }
        if !int_part.bytes().all(|b| b.is_ascii_digit())
            || !frac_part.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid_format(trimmed));
        }

        let whole: i64 = int_part
            .parse()
            .map_err(|_| invalid_format(trimmed))?;

        let mut frac_bytes = frac_part.bytes();
        let tenths = i64::from(frac_bytes.next().map_or(0, |b| b - b'0'));
        let hundredths = i64::from(frac_bytes.next().map_or(0, |b| b - b'0'));
        // Half-up: anything at or past half a cent rounds away from zero.
        let round_up = frac_bytes.next().is_some_and(|b| b >= b'5');

        let mut cents = whole
            .checked_mul(100)
            .and_then(|c| c.checked_add(tenths * 10 + hundredths))
            .ok_or_else(|| AppError::InvalidAmount("amount overflow".into()))?;
        if round_up {
            cents = cents
                .checked_add(1)
                .ok_or_else(|| AppError::InvalidAmount("amount overflow".into()))?;
        }
        if negative {
            cents = -cents;
        }

        Ok(Self { cents })
    }

    pub fn checked_add(self, other: Money) -> Result<Money, AppError> {
        self.cents
            .checked_add(other.cents)
            .map(Money::from_cents)
            .ok_or_else(|| AppError::InvalidAmount("amount overflow".into()))
    }

    pub fn checked_sub(self, other: Money) -> Result<Money, AppError> {
        self.cents
            .checked_sub(other.cents)
            .map(Money::from_cents)
            .ok_or_else(|| AppError::InvalidAmount("amount overflow".into()))
    }

    pub fn multiply(self, factor: i64) -> Result<Money, AppError> {
        self.cents
            .checked_mul(factor)
            .map(Money::from_cents)
            .ok_or_else(|| AppError::InvalidAmount("amount overflow".into()))
    }

    pub fn negate(self) -> Money {
        Money::from_cents(-self.cents)
    }

    pub fn abs(self) -> Money {
        Money::from_cents(self.cents.abs())
    }

    pub fn is_zero(self) -> bool {
        self.cents == 0
    }

    pub fn is_positive(self) -> bool {
        self.cents > 0
    }

    pub fn is_negative(self) -> bool {
        self.cents < 0
    }

    /// Validate the amount against the Pix limits: it must be at least one
    /// cent and at most `PIX_MAX_CENTS`.
    pub fn validate_for_pix(self) -> Result<(), AppError> {
        if !self.is_positive() {
            return Err(AppError::InvalidAmount(
                "Pix amount must be at least 0.01".into(),
            ));
        }
        if self.cents > PIX_MAX_CENTS {
            return Err(AppError::AmountOutOfRange(format!(
                "Pix amount exceeds the limit of {}",
                Money::from_cents(PIX_MAX_CENTS)
            )));
        }
        Ok(())
    }

    /// Render as a plain two-decimal string ("120.00", "-0.05").
    pub fn to_decimal_string(self) -> String {
        format!("{self}")
    }
}

fn invalid_format(input: &str) -> AppError {
    AppError::InvalidAmount(format!("invalid amount: {input:?}"))
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.cents < 0 { "-" } else { "" };
        let abs = self.cents.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}
