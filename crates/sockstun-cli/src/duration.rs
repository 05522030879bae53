//! Durations written the way the config file has always accepted them:
//! `30s`, `1m30s`, `1.5h`, `250ms`, or a bare `0`.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Parse a sequence of `<decimal><unit>` terms.
///
/// Units: `ns`, `us` (or `µs`), `ms`, `s`, `m`, `h`. A leading `+` is
/// allowed; negative durations are rejected.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    let s = s.strip_prefix('+').unwrap_or(s);
    if s.starts_with('-') {
        bail!("negative duration '{input}'");
    }
    if s.is_empty() {
        bail!("empty duration");
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    // Exact integer nanoseconds, capped at the i64 range.
    let mut total: u128 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let (whole, tail) = split_digits(rest);
        let (frac, tail) = match tail.strip_prefix('.') {
            Some(after) => split_digits(after),
            None => ("", tail),
        };
        if whole.is_empty() && frac.is_empty() {
            bail!("invalid duration '{input}'");
        }

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        let unit_nanos: u128 = match unit {
            "ns" => 1,
            "us" | "µs" | "μs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3600 * 1_000_000_000,
            "" => bail!("missing unit in duration '{input}'"),
            other => bail!("unknown unit '{other}' in duration '{input}'"),
        };

        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole
                .parse()
                .with_context(|| format!("duration '{input}' out of range"))?
        };
        let mut term = whole
            .checked_mul(unit_nanos)
            .with_context(|| format!("duration '{input}' out of range"))?;
        if !frac.is_empty() {
            // Digits beyond nanosecond resolution of the largest unit are dropped.
            let digits = &frac[..frac.len().min(18)];
            let scale = 10u128.pow(digits.len() as u32);
            let frac: u128 = digits
                .parse()
                .with_context(|| format!("invalid number in duration '{input}'"))?;
            term = term
                .checked_add(frac * unit_nanos / scale)
                .with_context(|| format!("duration '{input}' out of range"))?;
        }
        total = total
            .checked_add(term)
            .with_context(|| format!("duration '{input}' out of range"))?;
        rest = tail;
    }

    if total > i64::MAX as u128 {
        bail!("duration '{input}' out of range");
    }
    let nanos = u64::try_from(total).with_context(|| format!("duration '{input}' out of range"))?;
    Ok(Duration::from_nanos(nanos))
}

fn split_digits(s: &str) -> (&str, &str) {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    s.split_at(end)
}

/// `deserialize_with` adapter for optional duration strings.
pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}
