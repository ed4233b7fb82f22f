//! Sector keys

use core::fmt;
use core::str::FromStr;
use thiserror::Error;

/// Length of a MIFARE Classic sector key in bytes
pub const KEY_LEN: usize = 6;

/// The factory transport key shipped on blank cards
pub const TRANSPORT_KEY: [u8; KEY_LEN] = [0xFF; KEY_LEN];

/// Which of the two sector keys is presented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum KeyKind {
    /// Key A (stored in trailer bytes 0..6)
    #[default]
    A,
    /// Key B (stored in trailer bytes 10..16)
    B,
}

impl FromStr for KeyKind {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "A" | "a" => Ok(Self::A),
            "B" | "b" => Ok(Self::B),
            other => Err(KeyParseError::Kind(other.to_string())),
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => f.write_str("A"),
            Self::B => f.write_str("B"),
        }
    }
}

/// Errors from parsing key material
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyParseError {
    /// Key type was neither A nor B
    #[error("invalid key type '{0}' (expected A or B)")]
    Kind(String),
    /// Key hex string had the wrong length
    #[error("key must be {expected} hex digits, got {got}")]
    Length {
        /// Expected number of hex digits
        expected: usize,
        /// Number of hex digits supplied
        got: usize,
    },
    /// Key contained a non-hex character
    #[error("invalid hex digit in key")]
    Digit,
}

/// A key presented to authenticate one sector
///
/// `Debug` output never contains the key bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectorKey {
    /// Key slot
    pub kind: KeyKind,
    /// Raw key bytes
    pub bytes: [u8; KEY_LEN],
}

impl SectorKey {
    /// Create a key from its type and bytes
    pub const fn new(kind: KeyKind, bytes: [u8; KEY_LEN]) -> Self {
        Self { kind, bytes }
    }

    /// The factory transport key in the given slot
    pub const fn transport(kind: KeyKind) -> Self {
        Self::new(kind, TRANSPORT_KEY)
    }

    /// Parse a key from 12 hex digits (spaces and colons are ignored)
    pub fn from_hex(kind: KeyKind, s: &str) -> Result<Self, KeyParseError> {
        Ok(Self::new(kind, parse_key_bytes(s)?))
    }

    /// Whether this is the factory transport key
    pub fn is_transport(&self) -> bool {
        self.bytes == TRANSPORT_KEY
    }
}

impl fmt::Debug for SectorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SectorKey")
            .field("kind", &self.kind)
            .field("bytes", &if self.is_transport() { "<transport>" } else { "<redacted>" })
            .finish()
    }
}

/// Parse 12 hex digits into key bytes
pub fn parse_key_bytes(s: &str) -> Result<[u8; KEY_LEN], KeyParseError> {
    let digits: Vec<u8> = s
        .bytes()
        .filter(|b| !matches!(b, b' ' | b':' | b'-'))
        .collect();

    if digits.len() != KEY_LEN * 2 {
        return Err(KeyParseError::Length {
            expected: KEY_LEN * 2,
            got: digits.len(),
        });
    }

    let mut out = [0u8; KEY_LEN];
    for (i, pair) in digits.chunks_exact(2).enumerate() {
        let hi = hex_value(pair[0]).ok_or(KeyParseError::Digit)?;
        let lo = hex_value(pair[1]).ok_or(KeyParseError::Digit)?;
        out[i] = (hi << 4) | lo;
    }
    Ok(out)
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_key() {
        let key = SectorKey::from_hex(KeyKind::B, "A0:A1:A2:A3:A4:A5").unwrap();
        assert_eq!(key.kind, KeyKind::B);
        assert_eq!(key.bytes, [0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5]);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert_eq!(
            parse_key_bytes("FFFF"),
            Err(KeyParseError::Length { expected: 12, got: 4 })
        );
        assert_eq!(parse_key_bytes("FFFFFFFFFFFG"), Err(KeyParseError::Digit));
        assert!("C".parse::<KeyKind>().is_err());
    }

    #[test]
    fn test_debug_redacts_key_bytes() {
        let key = SectorKey::from_hex(KeyKind::A, "123456789ABC").unwrap();
        let debug = format!("{:?}", key);
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("12"));
    }
}
