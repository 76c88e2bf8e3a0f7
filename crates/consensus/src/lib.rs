//! Network parameters, checkpoint tables, and shared hash types.

pub mod constants;
pub mod params;

pub use params::{chain_params, ChainParams, Network};

/// Raw 32-byte hash, stored little-endian as it appears on the wire.
pub type Hash256 = [u8; 32];

pub const ZERO_HASH: Hash256 = [0u8; 32];

/// Render a hash the way block explorers do: byte-reversed hex.
pub fn hash_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "hex string must encode exactly 32 bytes"),
            HexError::InvalidHex => write!(f, "invalid hex digit"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parse a byte-reversed hex hash back into wire order.
pub fn hash_from_hex(hex: &str) -> Result<Hash256, HexError> {
    let hex = hex.trim();
    if hex.len() != 64 {
        return Err(HexError::InvalidLength);
    }
    let mut out = [0u8; 32];
    for (idx, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let high = hex_digit(chunk[0])?;
        let low = hex_digit(chunk[1])?;
        out[31 - idx] = (high << 4) | low;
    }
    Ok(out)
}

fn hex_digit(byte: u8) -> Result<u8, HexError> {
    match byte {
        b'0'..=b'9' => Ok(byte - b'0'),
        b'a'..=b'f' => Ok(byte - b'a' + 10),
        b'A'..=b'F' => Ok(byte - b'A' + 10),
        _ => Err(HexError::InvalidHex),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let mut hash = [0u8; 32];
        hash[0] = 0xab;
        hash[31] = 0x01;
        let hex = hash_to_hex(&hash);
        assert!(hex.starts_with("01"));
        assert!(hex.ends_with("ab"));
        assert_eq!(hash_from_hex(&hex), Ok(hash));
    }

    #[test]
    fn hex_rejects_bad_input() {
        assert_eq!(hash_from_hex("00"), Err(HexError::InvalidLength));
        assert_eq!(hash_from_hex(&"zz".repeat(32)), Err(HexError::InvalidHex));
    }
}
