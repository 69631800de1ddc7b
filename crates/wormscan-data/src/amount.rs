//! Decimal-string amount arithmetic.
//!
//! Amounts are persisted as base-10 strings. Deltas may be negative
//! (`"-500"`); running totals are clamped at zero.

use alloy::primitives::{I256, U256};
use eyre::{eyre, Context, Result};

/// Wei value of one SNFT fragment by prefix level (42, 41, 40, shorter).
const SNFT_LEVEL_VALUES: [u128; 4] = [
    95_000_000_000_000_000,
    143_000_000_000_000_000,
    271_000_000_000_000_000,
    650_000_000_000_000_000,
];

/// Parses a decimal (optionally signed) or `0x` hex amount.
pub fn parse_signed(value: &str) -> Result<I256> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(I256::ZERO);
    }
    if let Some(hex) = value.strip_prefix("0x") {
        let unsigned = U256::from_str_radix(hex, 16)
            .wrap_err_with(|| format!("invalid hex amount `{value}`"))?;
        return I256::try_from(unsigned).map_err(|_| eyre!("amount `{value}` overflows"));
    }
    I256::from_dec_str(value).map_err(|e| eyre!("invalid decimal amount `{value}`: {e}"))
}

/// Parses a non-negative amount.
pub fn parse_unsigned(value: &str) -> Result<U256> {
    let signed = parse_signed(value)?;
    if signed.is_negative() {
        return Err(eyre!("amount `{value}` is negative"));
    }
    Ok(signed.into_raw())
}

/// `current + delta`, clamped at zero.
///
/// # Errors
/// Returns error if either operand does not parse.
pub fn add(current: &str, delta: &str) -> Result<String> {
    let total = parse_signed(current)?.saturating_add(parse_signed(delta)?);
    if total.is_negative() {
        tracing::warn!(current, delta, "running total went negative, clamping to zero");
        return Ok("0".to_string());
    }
    Ok(total.to_string())
}

/// Negates a non-negative decimal amount (`"0"` stays `"0"`).
pub fn negate(value: &str) -> String {
    if value == "0" || value.is_empty() {
        "0".to_string()
    } else if let Some(stripped) = value.strip_prefix('-') {
        stripped.to_string()
    } else {
        format!("-{value}")
    }
}

pub fn is_zero(value: &str) -> bool {
    parse_signed(value).map(|v| v.is_zero()).unwrap_or(false)
}

/// Marketplace fee in wei: `price * fee_ratio / 10000`.
pub fn tx_fee(price: &str, fee_ratio: u32) -> Option<String> {
    let price = parse_unsigned(price).ok()?;
    let fee = price.checked_mul(U256::from(fee_ratio))? / U256::from(10_000u64);
    Some(fee.to_string())
}

/// Value of `count` SNFTs addressed by `prefix`.
pub fn snft_value(prefix: &str, count: u64) -> String {
    let level = 42usize.saturating_sub(prefix.len()).min(3);
    (U256::from(SNFT_LEVEL_VALUES[level]) * U256::from(count)).to_string()
}

/// Renders the JSON text of a big integer (bare number, decimal string or
/// `0x` string) as a decimal string. Works on the text so that numbers wider
/// than 64 bits keep every digit.
pub fn decimal_from_json(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let digits = if raw.starts_with('"') {
        serde_json::from_str::<String>(raw).ok()?
    } else if raw.bytes().all(|b| b.is_ascii_digit() || b == b'-') {
        raw.to_string()
    } else {
        return None;
    };
    parse_signed(&digits).ok().map(|v| v.to_string())
}

/// `deserialize_with` helper for optional big integers.
pub fn de_opt_decimal<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;
    use serde_json::value::RawValue;

    let raw = Option::<Box<RawValue>>::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(raw) => decimal_from_json(raw.get())
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("not an integer: {}", raw.get()))),
    }
}

/// `deserialize_with` helper for big integers that default to `"0"`.
pub fn de_decimal<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(de_opt_decimal(deserializer)?.unwrap_or_else(|| "0".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_integers_render_as_decimal() {
        assert_eq!(decimal_from_json("42").as_deref(), Some("42"));
        assert_eq!(decimal_from_json(r#""0x2a""#).as_deref(), Some("42"));
        assert_eq!(
            decimal_from_json(r#""1000000000000000000000""#).as_deref(),
            Some("1000000000000000000000")
        );
        assert_eq!(decimal_from_json("true"), None);
        assert_eq!(decimal_from_json("1.5e21"), None);
    }

    #[test]
    fn numbers_wider_than_u64_keep_every_digit() {
        #[derive(serde::Deserialize)]
        struct Pledge {
            #[serde(default, deserialize_with = "de_decimal")]
            amount: String,
            #[serde(default, deserialize_with = "de_opt_decimal")]
            reward: Option<String>,
        }

        let pledge: Pledge =
            serde_json::from_str(r#"{"amount":70000000000000000000001,"reward":null}"#)
                .expect("bare big integer parses");
        assert_eq!(pledge.amount, "70000000000000000000001");
        assert_eq!(pledge.reward, None);

        let pledge: Pledge = serde_json::from_str(r#"{"reward":18446744073709551617}"#)
            .expect("missing fields default");
        assert_eq!(pledge.amount, "0");
        assert_eq!(pledge.reward.as_deref(), Some("18446744073709551617"));
    }

    #[test]
    fn add_handles_signed_deltas() {
        assert_eq!(add("100", "50").expect("valid"), "150");
        assert_eq!(add("100", "-40").expect("valid"), "60");
        assert_eq!(add("0", "0x10").expect("hex accepted"), "16");
    }

    #[test]
    fn add_clamps_negative_totals() {
        assert_eq!(add("10", "-11").expect("valid"), "0");
    }

    #[test]
    fn add_rejects_garbage() {
        assert!(add("abc", "1").is_err());
    }

    #[test]
    fn negate_keeps_zero() {
        assert_eq!(negate("0"), "0");
        assert_eq!(negate("25"), "-25");
        assert_eq!(negate("-25"), "25");
    }

    #[test]
    fn fee_uses_ten_thousandths() {
        assert_eq!(tx_fee("1000000", 250).as_deref(), Some("25000"));
        assert_eq!(tx_fee("nope", 250), None);
    }

    #[test]
    fn snft_value_depends_on_prefix_level() {
        let full = format!("0x8{}", "0".repeat(39));
        assert_eq!(snft_value(&full, 2), "190000000000000000");
        assert_eq!(snft_value(&full[..41], 1), "143000000000000000");
        assert_eq!(snft_value(&full[..38], 1), "650000000000000000");
    }
}
