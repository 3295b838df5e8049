use crate::error::ValidationError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use smol_str::SmolStr;

const MAX_SYMBOL_LEN: usize = 32;

/// Normalise and validate an instrument symbol (eg/ "btcusdt" -> "BTCUSDT").
pub fn parse_symbol(input: &str) -> Result<SmolStr, ValidationError> {
    let trimmed = input.trim();

    let valid = !trimmed.is_empty()
        && trimmed.len() <= MAX_SYMBOL_LEN
        && trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/' | '.' | ':'));

    if valid {
        Ok(SmolStr::new(trimmed.to_ascii_uppercase()))
    } else {
        Err(ValidationError::Symbol(input.to_string()))
    }
}

/// Single price/size event for an instrument. Immutable once constructed.
#[derive(Clone, PartialEq, Debug, Serialize)]
pub struct Tick {
    symbol: SmolStr,
    price: f64,
    size: f64,
    timestamp: DateTime<Utc>,
}

impl Tick {
    /// Validate and construct a [`Tick`]. The symbol is normalised via [`parse_symbol`].
    pub fn new(
        symbol: &str,
        price: f64,
        size: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        if !price.is_finite() || price <= 0.0 {
            return Err(ValidationError::Price(price.to_string()));
        }
        if !size.is_finite() || size < 0.0 {
            return Err(ValidationError::Size(size.to_string()));
        }

        Ok(Self {
            symbol: parse_symbol(symbol)?,
            price,
            size,
            timestamp,
        })
    }

    pub fn symbol(&self) -> &SmolStr {
        &self.symbol
    }

    pub fn price(&self) -> f64 {
        self.price
    }

    pub fn size(&self) -> f64 {
        self.size
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_symbol() {
        struct TestCase {
            input: &'static str,
            expected: Result<&'static str, ValidationError>,
        }

        let tests = vec![
            TestCase {
                // TC0: lower case is normalised
                input: "btcusdt",
                expected: Ok("BTCUSDT"),
            },
            TestCase {
                // TC1: separators are allowed, whitespace trimmed
                input: " eth/usd ",
                expected: Ok("ETH/USD"),
            },
            TestCase {
                // TC2: empty
                input: "",
                expected: Err(ValidationError::Symbol(String::new())),
            },
            TestCase {
                // TC3: illegal character
                input: "BTC USDT",
                expected: Err(ValidationError::Symbol("BTC USDT".to_string())),
            },
            TestCase {
                // TC4: too long
                input: "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789",
                expected: Err(ValidationError::Symbol(
                    "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789".to_string(),
                )),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = parse_symbol(test.input);
            let expected = test.expected.map(SmolStr::new);
            assert_eq!(actual, expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_tick_new_validates_price_and_size() {
        let now = Utc::now();

        assert!(Tick::new("X", 100.0, 0.0, now).is_ok());
        assert_eq!(
            Tick::new("X", 0.0, 1.0, now),
            Err(ValidationError::Price("0".to_string()))
        );
        assert_eq!(
            Tick::new("X", -5.0, 1.0, now),
            Err(ValidationError::Price("-5".to_string()))
        );
        assert_eq!(
            Tick::new("X", 1.0, -0.5, now),
            Err(ValidationError::Size("-0.5".to_string()))
        );
        assert!(matches!(
            Tick::new("X", f64::NAN, 1.0, now),
            Err(ValidationError::Price(_))
        ));
        assert!(matches!(
            Tick::new("X", 1.0, f64::INFINITY, now),
            Err(ValidationError::Size(_))
        ));
    }
}
