//! Card payloads and the credential token layout
//!
//! A [`CardPayload`] is an ordered set of `(sector, block, bytes, key)`
//! writes. How the bytes are produced is up to the access-control backend;
//! [`CardPayload::from_token`] implements the layout the RF Access backend
//! uses: a header block followed by the token itself.
//!
//! ```text
//! header block: "RFAC" | version | len (u16 BE) | FNV-1a(token) (u32 BE) | 0-padding
//! data blocks:  token bytes, zero padded to the end of the last profile block
//! ```

use thiserror::Error;

use crate::profile::CardProfile;
use crate::tag::{SectorKey, BLOCK_SIZE};

/// Magic at the start of a credential header block
pub const CREDENTIAL_MAGIC: [u8; 4] = *b"RFAC";

/// Credential layout version written by this crate
pub const CREDENTIAL_VERSION: u8 = 1;

const HEADER_LEN_OFFSET: usize = 5;
const HEADER_CHECKSUM_OFFSET: usize = 7;

/// Errors building a payload
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    /// A payload must write at least one block
    #[error("payload has no blocks")]
    Empty,
    /// Block data must be 1..=16 bytes
    #[error("block {block}: data length {len} is not 1..=16")]
    DataLength {
        /// Offending block
        block: u16,
        /// Supplied length
        len: usize,
    },
    /// The same block appears twice
    #[error("block {0} is written more than once")]
    DuplicateBlock(u16),
    /// Two writes to one sector use different keys
    #[error("sector {0} has conflicting keys")]
    KeyConflict(u8),
    /// The token is empty
    #[error("card token is empty")]
    EmptyToken,
    /// The profile needs a header block and at least one data block
    #[error("card profile needs at least two blocks")]
    ProfileTooSmall,
    /// The token does not fit on the profile's data blocks
    #[error("card token is {len} bytes but the profile holds {capacity}")]
    TokenTooLong {
        /// Token length in bytes
        len: usize,
        /// Profile capacity in bytes
        capacity: usize,
    },
}

/// Errors decoding a credential read back from a card
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    /// Fewer blocks than a header plus one data block
    #[error("not enough blocks for a credential")]
    Missing,
    /// The header block does not start with the credential magic
    #[error("no credential header (card is blank or foreign)")]
    BadMagic,
    /// Header version is not understood
    #[error("unsupported credential version {0}")]
    Version(u8),
    /// The header announces more bytes than the blocks hold
    #[error("credential length {len} exceeds capacity {capacity}")]
    Truncated {
        /// Announced length
        len: usize,
        /// Available capacity
        capacity: usize,
    },
    /// Checksum mismatch (typically an interrupted write)
    #[error("credential checksum mismatch (card is incompletely programmed)")]
    Checksum,
    /// The token bytes are not UTF-8
    #[error("credential token is not valid UTF-8")]
    Encoding,
}

/// One block write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockWrite {
    /// Sector the block belongs to
    pub sector: u8,
    /// Absolute block index
    pub block: u16,
    /// Key that unlocks the sector
    pub key: SectorKey,
    data: Vec<u8>,
}

impl BlockWrite {
    /// Create a block write
    pub fn new(sector: u8, block: u16, data: impl Into<Vec<u8>>, key: SectorKey) -> Self {
        Self {
            sector,
            block,
            key,
            data: data.into(),
        }
    }

    /// Bytes written at the start of the block
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Full block image: the payload bytes laid over the current contents
    pub fn image_over(&self, current: &[u8]) -> [u8; BLOCK_SIZE] {
        let mut image = [0u8; BLOCK_SIZE];
        let keep = current.len().min(BLOCK_SIZE);
        image[..keep].copy_from_slice(&current[..keep]);
        image[..self.data.len()].copy_from_slice(&self.data);
        image
    }
}

/// Everything to be written onto one card
///
/// Writes are kept sorted by ascending block index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardPayload {
    writes: Vec<BlockWrite>,
}

impl CardPayload {
    /// Validate and build a payload
    pub fn new(mut writes: Vec<BlockWrite>) -> Result<Self, PayloadError> {
        if writes.is_empty() {
            return Err(PayloadError::Empty);
        }

        writes.sort_by_key(|w| w.block);

        for (i, write) in writes.iter().enumerate() {
            let len = write.data.len();
            if len == 0 || len > BLOCK_SIZE {
                return Err(PayloadError::DataLength { block: write.block, len });
            }
            if i > 0 && writes[i - 1].block == write.block {
                return Err(PayloadError::DuplicateBlock(write.block));
            }
            let conflict = writes[..i]
                .iter()
                .any(|other| other.sector == write.sector && other.key != write.key);
            if conflict {
                return Err(PayloadError::KeyConflict(write.sector));
            }
        }

        Ok(Self { writes })
    }

    /// Lay a credential token out on the blocks of a card profile
    pub fn from_token(token: &str, profile: &CardProfile) -> Result<Self, PayloadError> {
        if token.is_empty() {
            return Err(PayloadError::EmptyToken);
        }

        let mut blocks = profile.blocks.clone();
        blocks.sort_by_key(|b| b.block);
        let Some((header, data_blocks)) = blocks.split_first() else {
            return Err(PayloadError::ProfileTooSmall);
        };
        if data_blocks.is_empty() {
            return Err(PayloadError::ProfileTooSmall);
        }

        let bytes = token.as_bytes();
        let capacity = (data_blocks.len() * BLOCK_SIZE).min(u16::MAX as usize);
        if bytes.len() > capacity {
            return Err(PayloadError::TokenTooLong {
                len: bytes.len(),
                capacity,
            });
        }

        let mut writes = Vec::with_capacity(blocks.len());
        writes.push(BlockWrite::new(
            header.sector,
            header.block,
            encode_header(bytes).to_vec(),
            profile.key,
        ));
        for (i, slot) in data_blocks.iter().enumerate() {
            let mut chunk = [0u8; BLOCK_SIZE];
            let start = (i * BLOCK_SIZE).min(bytes.len());
            let end = ((i + 1) * BLOCK_SIZE).min(bytes.len());
            chunk[..end - start].copy_from_slice(&bytes[start..end]);
            writes.push(BlockWrite::new(slot.sector, slot.block, chunk.to_vec(), profile.key));
        }

        Self::new(writes)
    }

    /// All writes in ascending block order
    pub fn writes(&self) -> &[BlockWrite] {
        &self.writes
    }

    /// Number of blocks written
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Whether there are no writes (never true once built)
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Sectors touched by the payload with their keys, in ascending order
    pub fn sectors(&self) -> Vec<(u8, SectorKey)> {
        let mut sectors: Vec<(u8, SectorKey)> = Vec::new();
        for write in &self.writes {
            if !sectors.iter().any(|(s, _)| *s == write.sector) {
                sectors.push((write.sector, write.key));
            }
        }
        sectors.sort_by_key(|(s, _)| *s);
        sectors
    }
}

fn encode_header(token: &[u8]) -> [u8; BLOCK_SIZE] {
    let mut header = [0u8; BLOCK_SIZE];
    header[..4].copy_from_slice(&CREDENTIAL_MAGIC);
    header[4] = CREDENTIAL_VERSION;
    header[HEADER_LEN_OFFSET..HEADER_LEN_OFFSET + 2]
        .copy_from_slice(&(token.len() as u16).to_be_bytes());
    header[HEADER_CHECKSUM_OFFSET..HEADER_CHECKSUM_OFFSET + 4]
        .copy_from_slice(&fnv1a(token).to_be_bytes());
    header
}

/// Decode a credential token from the profile's blocks (header first)
pub fn decode_token(blocks: &[[u8; BLOCK_SIZE]]) -> Result<String, CredentialError> {
    let Some((header, data)) = blocks.split_first() else {
        return Err(CredentialError::Missing);
    };
    if data.is_empty() {
        return Err(CredentialError::Missing);
    }
    if header[..4] != CREDENTIAL_MAGIC {
        return Err(CredentialError::BadMagic);
    }
    if header[4] != CREDENTIAL_VERSION {
        return Err(CredentialError::Version(header[4]));
    }

    let len = u16::from_be_bytes([header[HEADER_LEN_OFFSET], header[HEADER_LEN_OFFSET + 1]]) as usize;
    let capacity = data.len() * BLOCK_SIZE;
    if len > capacity {
        return Err(CredentialError::Truncated { len, capacity });
    }

    let bytes: Vec<u8> = data.iter().flatten().copied().take(len).collect();
    let mut checksum = [0u8; 4];
    checksum.copy_from_slice(&header[HEADER_CHECKSUM_OFFSET..HEADER_CHECKSUM_OFFSET + 4]);
    if fnv1a(&bytes) != u32::from_be_bytes(checksum) {
        return Err(CredentialError::Checksum);
    }

    String::from_utf8(bytes).map_err(|_| CredentialError::Encoding)
}

/// 32-bit FNV-1a hash
fn fnv1a(data: &[u8]) -> u32 {
    data.iter().fold(0x811c_9dc5u32, |hash, &b| {
        (hash ^ b as u32).wrapping_mul(0x0100_0193)
    })
}
