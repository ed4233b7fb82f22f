//! Sector trailer access conditions
//!
//! Bytes 6..9 of every sector trailer hold three condition bits (C1, C2, C3)
//! for each of the sector's four access groups, each stored twice (once
//! inverted). Groups 0..3 are the data blocks (or blocks of five in a
//! 16-block sector); group 3 is the trailer itself.

use bitflags::bitflags;

use super::key::KeyKind;

/// Offset of the access bytes inside a trailer block
pub const ACCESS_BYTES_OFFSET: usize = 6;

/// Access bytes a factory-fresh card carries (data blocks free, trailer
/// writable with key A)
pub const TRANSPORT_ACCESS: [u8; 3] = [0xFF, 0x07, 0x80];

/// Condition `C1 C2 C3 = 0 0 0`: read and write with either key
pub const COND_OPEN: u8 = 0b000;
/// Condition `C1 C2 C3 = 0 1 0`: read with either key, never write
pub const COND_READ_ONLY: u8 = 0b010;
/// Condition `C1 C2 C3 = 1 0 0`: read with either key, write with key B
pub const COND_WRITE_B: u8 = 0b100;
/// Condition `C1 C2 C3 = 0 0 1` for the trailer group (transport setting)
pub const COND_TRAILER_TRANSPORT: u8 = 0b001;

bitflags! {
    /// What each key may do with a data block
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BlockAccess: u8 {
        /// Readable after authenticating with key A
        const READ_A  = 1 << 0;
        /// Readable after authenticating with key B
        const READ_B  = 1 << 1;
        /// Writable after authenticating with key A
        const WRITE_A = 1 << 2;
        /// Writable after authenticating with key B
        const WRITE_B = 1 << 3;

        /// Shorthand for both read permissions
        const READ = Self::READ_A.bits() | Self::READ_B.bits();
        /// Shorthand for both write permissions
        const WRITE = Self::WRITE_A.bits() | Self::WRITE_B.bits();
    }
}

impl BlockAccess {
    /// Permissions for a data block condition (`C1 C2 C3` packed as bits 2..0)
    pub fn for_data_condition(condition: u8) -> Self {
        match condition & 0b111 {
            0b000 => Self::READ | Self::WRITE,
            0b010 => Self::READ,
            0b100 | 0b110 => Self::READ | Self::WRITE_B,
            0b001 => Self::READ,
            0b011 => Self::READ_B | Self::WRITE_B,
            0b101 => Self::READ_B,
            _ => Self::empty(),
        }
    }

    /// Whether a key of the given type may write
    pub fn can_write(self, kind: KeyKind) -> bool {
        match kind {
            KeyKind::A => self.contains(Self::WRITE_A),
            KeyKind::B => self.contains(Self::WRITE_B),
        }
    }

    /// Whether any key may write
    pub fn is_writable(self) -> bool {
        self.intersects(Self::WRITE)
    }
}

/// Decoded access bits of one sector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessBits {
    c1: u8,
    c2: u8,
    c3: u8,
}

impl AccessBits {
    /// Decode the access bytes found in a trailer block
    ///
    /// Returns `None` if the trailer is too short or the inverted copies do
    /// not match (a card in this state is unusable).
    pub fn from_trailer(trailer: &[u8]) -> Option<Self> {
        let bytes = trailer.get(ACCESS_BYTES_OFFSET..ACCESS_BYTES_OFFSET + 3)?;
        Self::decode([bytes[0], bytes[1], bytes[2]])
    }

    /// Decode the three access bytes
    pub fn decode(bytes: [u8; 3]) -> Option<Self> {
        let c1 = bytes[1] >> 4;
        let c2 = bytes[2] & 0x0F;
        let c3 = bytes[2] >> 4;
        let inv_c1 = bytes[0] & 0x0F;
        let inv_c2 = bytes[0] >> 4;
        let inv_c3 = bytes[1] & 0x0F;

        if c1 != !inv_c1 & 0x0F || c2 != !inv_c2 & 0x0F || c3 != !inv_c3 & 0x0F {
            return None;
        }
        Some(Self { c1, c2, c3 })
    }

    /// Build access bits from one packed condition per group (group 3 is the trailer)
    pub fn from_conditions(conditions: [u8; 4]) -> Self {
        let mut bits = Self { c1: 0, c2: 0, c3: 0 };
        for (group, cond) in conditions.iter().enumerate() {
            bits.c1 |= ((cond >> 2) & 1) << group;
            bits.c2 |= ((cond >> 1) & 1) << group;
            bits.c3 |= (cond & 1) << group;
        }
        bits
    }

    /// Encode into the three trailer bytes
    pub fn encode(&self) -> [u8; 3] {
        [
            ((!self.c2 & 0x0F) << 4) | (!self.c1 & 0x0F),
            (self.c1 << 4) | (!self.c3 & 0x0F),
            (self.c3 << 4) | self.c2,
        ]
    }

    /// Packed `C1 C2 C3` condition of an access group
    pub fn condition(&self, group: usize) -> u8 {
        let bit = |v: u8| (v >> group) & 1;
        (bit(self.c1) << 2) | (bit(self.c2) << 1) | bit(self.c3)
    }

    /// Permissions of a data block, given its position in the sector
    pub fn data_block(&self, index_in_sector: usize, blocks_in_sector: usize) -> BlockAccess {
        BlockAccess::for_data_condition(self.condition(access_group(index_in_sector, blocks_in_sector)))
    }
}

/// Access group a block position falls into
pub fn access_group(index_in_sector: usize, blocks_in_sector: usize) -> usize {
    if blocks_in_sector <= 4 {
        index_in_sector.min(3)
    } else {
        (index_in_sector / 5).min(3)
    }
}
