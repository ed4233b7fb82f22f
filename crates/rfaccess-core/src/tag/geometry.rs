//! MIFARE Classic memory geometry
//!
//! Sectors 0..32 hold 4 blocks each, sectors 32..40 (4K cards only) hold 16.
//! The last block of each sector is its trailer (keys and access bits) and
//! block 0 is the read-only manufacturer block.

/// Known card sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CardSize {
    /// MIFARE Mini (320 bytes)
    Mini,
    /// MIFARE Classic 1K
    Classic1K,
    /// MIFARE Classic 2K
    Classic2K,
    /// MIFARE Classic 4K
    Classic4K,
}

impl CardSize {
    /// All supported sizes, smallest first
    pub const ALL: [CardSize; 4] = [
        CardSize::Mini,
        CardSize::Classic1K,
        CardSize::Classic2K,
        CardSize::Classic4K,
    ];

    /// Number of sectors on this card
    pub const fn sectors(self) -> usize {
        match self {
            Self::Mini => 5,
            Self::Classic1K => 16,
            Self::Classic2K => 32,
            Self::Classic4K => 40,
        }
    }

    /// Number of blocks on this card
    pub const fn blocks(self) -> usize {
        match self {
            Self::Mini => 20,
            Self::Classic1K => 64,
            Self::Classic2K => 128,
            Self::Classic4K => 256,
        }
    }

    /// Memory size in bytes
    pub const fn bytes(self) -> usize {
        self.blocks() * super::BLOCK_SIZE
    }

    /// Short name as used on the command line
    pub const fn name(self) -> &'static str {
        match self {
            Self::Mini => "mini",
            Self::Classic1K => "1k",
            Self::Classic2K => "2k",
            Self::Classic4K => "4k",
        }
    }

    /// Look up a size by its short name
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        Self::ALL.into_iter().find(|s| s.name() == name)
    }

    /// Find the size whose memory is exactly `len` bytes
    pub fn from_image_len(len: usize) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.bytes() == len)
    }
}

/// Block layout of a recognized card
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CardGeometry {
    size: CardSize,
}

/// Sectors below this index have 4 blocks
const SMALL_SECTORS: usize = 32;
const SMALL_SECTOR_BLOCKS: usize = 4;
const LARGE_SECTOR_BLOCKS: usize = 16;

impl CardGeometry {
    /// Geometry of a known card size
    pub const fn new(size: CardSize) -> Self {
        Self { size }
    }

    /// Match reported sector/block counts against the known card sizes
    ///
    /// Returns `None` for anything that is not exactly one of them,
    /// including a tag reporting zero sectors.
    pub fn from_counts(sectors: usize, blocks: usize) -> Option<Self> {
        CardSize::ALL
            .into_iter()
            .find(|s| s.sectors() == sectors && s.blocks() == blocks)
            .map(Self::new)
    }

    /// Card size
    pub fn size(&self) -> CardSize {
        self.size
    }

    /// Number of sectors
    pub fn sector_count(&self) -> usize {
        self.size.sectors()
    }

    /// Number of blocks
    pub fn block_count(&self) -> usize {
        self.size.blocks()
    }

    /// Number of blocks in a sector
    pub fn blocks_in_sector(&self, sector: u8) -> usize {
        if (sector as usize) < SMALL_SECTORS {
            SMALL_SECTOR_BLOCKS
        } else {
            LARGE_SECTOR_BLOCKS
        }
    }

    /// First block of a sector
    pub fn first_block(&self, sector: u8) -> u16 {
        let sector = sector as usize;
        let block = if sector < SMALL_SECTORS {
            sector * SMALL_SECTOR_BLOCKS
        } else {
            SMALL_SECTORS * SMALL_SECTOR_BLOCKS + (sector - SMALL_SECTORS) * LARGE_SECTOR_BLOCKS
        };
        block as u16
    }

    /// Sector trailer block of a sector
    pub fn trailer_block(&self, sector: u8) -> u16 {
        self.first_block(sector) + self.blocks_in_sector(sector) as u16 - 1
    }

    /// Sector containing a block, if the block exists on this card
    pub fn sector_of_block(&self, block: u16) -> Option<u8> {
        let block = block as usize;
        if block >= self.block_count() {
            return None;
        }
        let small_blocks = SMALL_SECTORS * SMALL_SECTOR_BLOCKS;
        let sector = if block < small_blocks {
            block / SMALL_SECTOR_BLOCKS
        } else {
            SMALL_SECTORS + (block - small_blocks) / LARGE_SECTOR_BLOCKS
        };
        Some(sector as u8)
    }

    /// Position of a block inside its sector
    pub fn index_in_sector(&self, block: u16) -> Option<usize> {
        let sector = self.sector_of_block(block)?;
        Some((block - self.first_block(sector)) as usize)
    }

    /// Whether a block is a sector trailer
    pub fn is_trailer(&self, block: u16) -> bool {
        self.sector_of_block(block)
            .is_some_and(|sector| self.trailer_block(sector) == block)
    }

    /// Whether a block may never carry payload data (trailer or block 0)
    pub fn is_reserved(&self, block: u16) -> bool {
        block == 0 || self.is_trailer(block)
    }
}
