//! Byte-level helpers shared by the CLI and the backends.
//!
//! Internally every 32-byte value (header, target, digest, mix) is kept
//! in the algorithm's little-endian layout, where byte 31 is the most
//! significant for target comparison. Hex on the CLI and in logs uses
//! the conventional big-endian display order, so targets read the way
//! pool software prints them (`ffff…` = easiest).

use anyhow::{bail, Context, Result};

/// Parse 64 hex chars into the internal layout, reversing from display
/// order (most significant byte first).
pub fn parse_target(raw: &str) -> Result<[u8; 32]> {
    let mut bytes = parse_bytes32(raw)?;
    bytes.reverse();
    Ok(bytes)
}

/// Parse 64 hex chars as raw bytes, no reordering. Used for headers,
/// which are an opaque 32-byte preamble.
pub fn parse_bytes32(raw: &str) -> Result<[u8; 32]> {
    let trimmed = raw.trim().trim_start_matches("0x");
    let decoded = hex::decode(trimmed).context("invalid hex string")?;
    if decoded.len() != 32 {
        bail!("expected 32 bytes (64 hex chars), got {}", decoded.len());
    }
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&decoded);
    Ok(bytes)
}

/// Render an internal 32-byte value in display order.
pub fn format_hash(value: &[u8; 32]) -> String {
    let mut reversed = *value;
    reversed.reverse();
    hex::encode(reversed)
}

pub fn format_hashrate(hps: f64) -> String {
    if hps >= 1e9 {
        format!("{:.2} GH/s", hps / 1e9)
    } else if hps >= 1e6 {
        format!("{:.2} MH/s", hps / 1e6)
    } else if hps >= 1e3 {
        format!("{:.2} kH/s", hps / 1e3)
    } else {
        format!("{hps:.2} H/s")
    }
}
