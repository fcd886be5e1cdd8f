// src/utils.rs
// Utility functions for Chain Read SDK

use ethers::types::{Address, U256};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::errors::{ReadError, ReadResult};

/// Locks a std mutex, recovering the guard if a previous holder panicked.
/// Critical sections in this crate never leave data half-updated.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Parses a hex address, accepting any casing.
pub fn parse_address(raw: &str) -> ReadResult<Address> {
    Address::from_str(raw.trim())
        .map_err(|e| ReadError::InvalidInput(format!("address {}: {}", raw, e)))
}

/// Renders an integer balance string (smallest unit) as a decimal string,
/// keeping at most `max_fraction_digits` digits and no trailing zeros.
///
/// `"1500000000000000000"` with 18 decimals becomes `"1.5"`.
pub fn format_token_balance(raw: &str, decimals: u8, max_fraction_digits: usize) -> ReadResult<String> {
    let value = U256::from_dec_str(raw.trim())
        .map_err(|e| ReadError::InvalidInput(format!("balance {}: {}", raw, e)))?;
    let formatted = ethers::utils::format_units(value, decimals as u32)
        .map_err(|e| ReadError::InvalidInput(format!("decimals {}: {}", decimals, e)))?;

    let Some((whole, fraction)) = formatted.split_once('.') else {
        return Ok(formatted);
    };
    let fraction: String = fraction.chars().take(max_fraction_digits).collect();
    let fraction = fraction.trim_end_matches('0');
    if fraction.is_empty() {
        Ok(whole.to_string())
    } else {
        Ok(format!("{}.{}", whole, fraction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_token_balance() {
        assert_eq!(format_token_balance("1500000000000000000", 18, 6).unwrap(), "1.5");
        assert_eq!(format_token_balance("1234567", 6, 2).unwrap(), "1.23");
        assert_eq!(format_token_balance("5000000", 6, 4).unwrap(), "5");
        assert_eq!(format_token_balance("0", 18, 4).unwrap(), "0");
        assert_eq!(format_token_balance("42", 0, 4).unwrap(), "42");
        assert!(format_token_balance("1.5", 18, 4).is_err());
    }

    #[test]
    fn test_parse_address_any_case() {
        let lower = parse_address("0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48").unwrap();
        let mixed = parse_address(" 0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48 ").unwrap();
        assert_eq!(lower, mixed);
        assert!(parse_address("0x1234").is_err());
    }
}
