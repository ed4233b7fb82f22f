//! Tag transport trait definitions
//!
//! A [`TagTransport`] is what the platform hands over when a tag enters the
//! field: a raw, unopened connection to one physical card. Platform bindings
//! (Android `MifareClassic`, a PC/SC reader, the in-memory emulator) implement
//! this trait; everything above it only talks to [`TagLink`](super::TagLink).

use crate::error::TransportError;

use super::key::SectorKey;

/// Size of one MIFARE Classic memory block in bytes
pub const BLOCK_SIZE: usize = 16;

/// Technology family a discovered tag reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagTechnology {
    /// MIFARE Classic (sector/block memory with key authentication)
    MifareClassic,
    /// MIFARE Ultralight / NTAG page memory
    MifareUltralight,
    /// ISO 14443-4 smart card (APDU based)
    IsoDep,
    /// Anything else the platform could not classify
    Unknown,
}

/// Raw transport to one physical tag
///
/// Implementations perform one radio round-trip per call and may block for
/// its duration. Errors are reported as they occur; no call retries
/// internally.
///
/// ## Example
///
/// ```ignore
/// impl TagTransport for AndroidMifare {
///     fn technology(&self) -> TagTechnology {
///         TagTechnology::MifareClassic
///     }
///
///     fn read_block(&mut self, block: u16) -> Result<Vec<u8>, TransportError> {
///         self.inner.read_block(block).map_err(|e| TransportError::Io(e.to_string()))
///     }
///     // ...
/// }
/// ```
pub trait TagTransport {
    /// Technology family this tag belongs to
    fn technology(&self) -> TagTechnology;

    /// Anti-collision UID of the tag
    fn uid(&self) -> &[u8];

    /// Number of sectors the tag reports
    fn sector_count(&self) -> usize;

    /// Number of blocks the tag reports
    fn block_count(&self) -> usize;

    /// Claim the radio session for this tag
    fn connect(&mut self) -> Result<(), TransportError>;

    /// Present a key for a sector
    ///
    /// Returns `Ok(false)` when the tag answered but refused the key, and an
    /// error when the tag could not be reached at all.
    fn authenticate(&mut self, sector: u8, key: &SectorKey) -> Result<bool, TransportError>;

    /// Read one block (expected to return [`BLOCK_SIZE`] bytes)
    fn read_block(&mut self, block: u16) -> Result<Vec<u8>, TransportError>;

    /// Write one full block
    ///
    /// A failed write may have partially updated the block.
    fn write_block(&mut self, block: u16, data: &[u8; BLOCK_SIZE]) -> Result<(), TransportError>;

    /// Release the radio session
    ///
    /// Must be safe to call when the tag is already gone.
    fn close(&mut self);
}

impl<T: TagTransport + ?Sized> TagTransport for Box<T> {
    fn technology(&self) -> TagTechnology {
        (**self).technology()
    }

    fn uid(&self) -> &[u8] {
        (**self).uid()
    }

    fn sector_count(&self) -> usize {
        (**self).sector_count()
    }

    fn block_count(&self) -> usize {
        (**self).block_count()
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        (**self).connect()
    }

    fn authenticate(&mut self, sector: u8, key: &SectorKey) -> Result<bool, TransportError> {
        (**self).authenticate(sector, key)
    }

    fn read_block(&mut self, block: u16) -> Result<Vec<u8>, TransportError> {
        (**self).read_block(block)
    }

    fn write_block(&mut self, block: u16, data: &[u8; BLOCK_SIZE]) -> Result<(), TransportError> {
        (**self).write_block(block, data)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Format a UID the way readers usually print it (`04:A2:...`)
pub fn format_uid(uid: &[u8]) -> String {
    uid.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}
