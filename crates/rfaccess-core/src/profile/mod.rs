//! Reader and card profile configuration
//!
//! A [`CardProfile`] says where the access-control backend keeps its
//! credential on the card (which blocks, unlocked by which key). The
//! [`ReaderConfig`] pairs it with the reader's [`KeyPolicy`]. Both can be
//! loaded from TOML (see the [`toml`](self::toml) submodule).

pub mod toml;

use std::path::PathBuf;

use thiserror::Error;

use crate::tag::{CardGeometry, CardSize, KeyKind, KeyPolicy, SectorKey, MAX_KEY_ATTEMPTS};
use crate::tag::key::KeyParseError;

/// One block of a card profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProfileBlock {
    /// Sector holding the block
    pub sector: u8,
    /// Absolute block index
    pub block: u16,
}

/// Where the credential lives on the card
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardProfile {
    /// Profile name (for display)
    pub name: String,
    /// Key that unlocks the credential sectors
    pub key: SectorKey,
    /// Blocks holding the credential; the lowest one is the header
    pub blocks: Vec<ProfileBlock>,
}

impl Default for CardProfile {
    fn default() -> Self {
        Self {
            name: "rf-access-1k".into(),
            key: SectorKey::transport(KeyKind::A),
            blocks: (4..=6).map(|block| ProfileBlock { sector: 1, block }).collect(),
        }
    }
}

impl CardProfile {
    /// Check the profile against the largest supported card layout
    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.blocks.len() < 2 {
            return Err(ProfileError::Invalid(
                "profile needs a header block and at least one data block".into(),
            ));
        }

        let geometry = CardGeometry::new(CardSize::Classic4K);
        for (i, slot) in self.blocks.iter().enumerate() {
            if geometry.sector_of_block(slot.block) != Some(slot.sector) {
                return Err(ProfileError::Invalid(format!(
                    "block {} is not in sector {}",
                    slot.block, slot.sector
                )));
            }
            if geometry.is_reserved(slot.block) {
                return Err(ProfileError::Invalid(format!(
                    "block {} is a trailer or manufacturer block",
                    slot.block
                )));
            }
            if self.blocks[..i].iter().any(|other| other.block == slot.block) {
                return Err(ProfileError::Invalid(format!(
                    "block {} is listed twice",
                    slot.block
                )));
            }
        }
        Ok(())
    }

    /// Number of token bytes this profile can carry
    pub fn capacity(&self) -> usize {
        self.blocks.len().saturating_sub(1) * crate::tag::BLOCK_SIZE
    }
}

/// Complete reader configuration
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReaderConfig {
    /// Keys presented during authentication
    pub key_policy: KeyPolicy,
    /// Credential placement
    pub profile: CardProfile,
}

impl ReaderConfig {
    /// Check the whole configuration
    pub fn validate(&self) -> Result<(), ProfileError> {
        let attempts = self.key_policy.max_attempts;
        if attempts == 0 || attempts > MAX_KEY_ATTEMPTS {
            return Err(ProfileError::Invalid(format!(
                "max_key_attempts must be 1..={}, got {}",
                MAX_KEY_ATTEMPTS, attempts
            )));
        }
        self.profile.validate()
    }
}

/// Errors loading a configuration
#[derive(Debug, Error)]
pub enum ProfileError {
    /// The file could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that failed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// The TOML did not parse
    #[error("invalid configuration: {0}")]
    Parse(#[from] ::toml::de::Error),
    /// A key field was malformed
    #[error("invalid key: {0}")]
    Key(#[from] KeyParseError),
    /// The values are inconsistent
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ReaderConfig::default();
        config.validate().unwrap();
        assert_eq!(config.profile.capacity(), 32);
    }

    #[test]
    fn test_profile_rejects_trailer_and_wrong_sector() {
        let mut profile = CardProfile::default();
        profile.blocks.push(ProfileBlock { sector: 1, block: 7 });
        assert!(profile.validate().is_err());

        let mut profile = CardProfile::default();
        profile.blocks[0].sector = 2;
        assert!(profile.validate().is_err());
    }

    #[test]
    fn test_attempts_bounds() {
        let mut config = ReaderConfig::default();
        config.key_policy.max_attempts = 0;
        assert!(config.validate().is_err());
        config.key_policy.max_attempts = MAX_KEY_ATTEMPTS + 1;
        assert!(config.validate().is_err());
    }
}
