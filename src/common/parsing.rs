// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

use alloy::primitives::utils::parse_units;
use alloy::primitives::{Address, Bytes, U256};
use std::str::FromStr;

pub fn strip_0x(s: &str) -> &str {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}

pub fn parse_hex_bytes(s: &str) -> Option<Bytes> {
    let trimmed = strip_0x(s.trim());
    if trimmed.is_empty() {
        return Some(Bytes::new());
    }
    hex::decode(trimmed).ok().map(Bytes::from)
}

pub fn parse_address_hex(s: &str) -> Option<Address> {
    Address::from_str(strip_0x(s.trim())).ok()
}

/// Amount in wei. Accepts `0x` hex, a plain decimal, or a decimal with a
/// `gwei`/`ether`/`eth` suffix (`"1.5gwei"`, `"0.01 ether"`).
pub fn parse_amount(s: &str) -> Option<U256> {
    let raw = s.trim().to_ascii_lowercase();
    if raw.starts_with("0x") {
        return U256::from_str_radix(strip_0x(&raw), 16).ok();
    }
    let (number, unit) = if let Some(n) = raw.strip_suffix("gwei") {
        (n, "gwei")
    } else if let Some(n) = raw.strip_suffix("ether").or_else(|| raw.strip_suffix("eth")) {
        (n, "ether")
    } else if let Some(n) = raw.strip_suffix("wei") {
        (n, "wei")
    } else {
        (raw.as_str(), "wei")
    };
    let number = number.trim();
    if number.is_empty() {
        return None;
    }
    if unit == "wei" {
        return U256::from_str_radix(number, 10).ok();
    }
    parse_units(number, unit).ok().map(Into::into)
}
