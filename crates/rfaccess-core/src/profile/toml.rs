//! TOML reader configuration parsing
//!
//! ```toml
//! [reader]
//! max_key_attempts = 2
//! default_key = "FFFFFFFFFFFF"   # "" disables the fallback key
//!
//! [profile]
//! name = "rf-access-1k"
//! key_type = "A"
//! key = "A0A1A2A3A4A5"
//!
//! [[profile.block]]
//! sector = 1
//! block = 0x04
//! ```
//!
//! Every section and field is optional; missing values fall back to
//! [`ReaderConfig::default`].

use std::fs;
use std::path::Path;

use super::{CardProfile, ProfileBlock, ProfileError, ReaderConfig};
use crate::tag::key::parse_key_bytes;
use crate::tag::{KeyKind, SectorKey};

#[derive(Debug, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlConfigFile {
    reader: Option<TomlReader>,
    profile: Option<TomlProfile>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlReader {
    max_key_attempts: Option<u8>,
    default_key: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlProfile {
    name: Option<String>,
    key_type: Option<String>,
    key: Option<String>,
    #[serde(default)]
    block: Vec<TomlBlock>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlBlock {
    #[serde(deserialize_with = "deserialize_hex_u32")]
    sector: u32,
    #[serde(deserialize_with = "deserialize_hex_u32")]
    block: u32,
}

/// Deserialize a u32 that can be hex (0x...) or decimal
fn deserialize_hex_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum HexOrInt {
        Int(u32),
        Str(String),
    }

    match HexOrInt::deserialize(deserializer)? {
        HexOrInt::Int(n) => Ok(n),
        HexOrInt::Str(s) => parse_number(&s).map_err(serde::de::Error::custom),
    }
}

/// Parse a number that can be hex (0x...) or decimal
fn parse_number(s: &str) -> Result<u32, String> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| format!("invalid hex: {}", e))
    } else {
        s.parse().map_err(|e| format!("invalid number: {}", e))
    }
}

impl ReaderConfig {
    /// Load a configuration from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ProfileError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ProfileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse a configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, ProfileError> {
        let file: TomlConfigFile = ::toml::from_str(content)?;
        let mut config = ReaderConfig::default();

        if let Some(reader) = file.reader {
            if let Some(attempts) = reader.max_key_attempts {
                config.key_policy.max_attempts = attempts;
            }
            if let Some(key) = reader.default_key {
                config.key_policy.default_key = if key.trim().is_empty() {
                    None
                } else {
                    Some(parse_key_bytes(&key)?)
                };
            }
        }

        if let Some(profile) = file.profile {
            config.profile = build_profile(profile, config.profile)?;
        }

        config.validate()?;
        log::debug!(
            "Loaded profile '{}' ({} blocks)",
            config.profile.name,
            config.profile.blocks.len()
        );
        Ok(config)
    }
}

fn build_profile(toml: TomlProfile, defaults: CardProfile) -> Result<CardProfile, ProfileError> {
    let kind = match toml.key_type {
        Some(kind) => kind.parse::<KeyKind>()?,
        None => defaults.key.kind,
    };
    let key = match toml.key {
        Some(hex) => SectorKey::from_hex(kind, &hex)?,
        None => SectorKey::new(kind, defaults.key.bytes),
    };

    let blocks = if toml.block.is_empty() {
        defaults.blocks
    } else {
        toml.block
            .into_iter()
            .map(|b| {
                let sector = u8::try_from(b.sector)
                    .map_err(|_| ProfileError::Invalid(format!("sector {} out of range", b.sector)))?;
                let block = u16::try_from(b.block)
                    .map_err(|_| ProfileError::Invalid(format!("block {} out of range", b.block)))?;
                Ok(ProfileBlock { sector, block })
            })
            .collect::<Result<Vec<_>, ProfileError>>()?
    };

    Ok(CardProfile {
        name: toml.name.unwrap_or(defaults.name),
        key,
        blocks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = ReaderConfig::from_toml_str("").unwrap();
        assert_eq!(config, ReaderConfig::default());
    }

    #[test]
    fn test_full_file() {
        let config = ReaderConfig::from_toml_str(
            r#"
            [reader]
            max_key_attempts = 1
            default_key = ""

            [profile]
            name = "lobby"
            key_type = "B"
            key = "A0A1A2A3A4A5"

            [[profile.block]]
            sector = 2
            block = "0x08"

            [[profile.block]]
            sector = 2
            block = 9
            "#,
        )
        .unwrap();

        assert_eq!(config.key_policy.max_attempts, 1);
        assert_eq!(config.key_policy.default_key, None);
        assert_eq!(config.profile.name, "lobby");
        assert_eq!(config.profile.key.kind, KeyKind::B);
        assert_eq!(config.profile.key.bytes, [0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5]);
        assert_eq!(
            config.profile.blocks,
            vec![
                ProfileBlock { sector: 2, block: 8 },
                ProfileBlock { sector: 2, block: 9 }
            ]
        );
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            ReaderConfig::from_toml_str("[profile]\nkey = \"XYZ\""),
            Err(ProfileError::Key(_))
        ));
        assert!(matches!(
            ReaderConfig::from_toml_str("[reader]\nmax_key_attempts = 9"),
            Err(ProfileError::Invalid(_))
        ));
        assert!(matches!(
            ReaderConfig::from_toml_str("[reader]\nbogus = 1"),
            Err(ProfileError::Parse(_))
        ));
    }
}
