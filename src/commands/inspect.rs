//! Inspect command implementation

use std::fs;
use std::path::Path;

use rfaccess_core::payload::decode_token;
use rfaccess_core::profile::ReaderConfig;
use rfaccess_core::tag::{format_uid, TagLink, BLOCK_SIZE};
use rfaccess_dummy::EmulatedCard;

/// Read the credential back from a card image through the tag link
pub fn run_inspect(config: &ReaderConfig, image: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let raw = fs::read(image)?;
    let card = EmulatedCard::from_image(&raw)
        .ok_or_else(|| format!("{} is not a card image ({} bytes)", image.display(), raw.len()))?;

    let profile = &config.profile;
    let mut link = TagLink::new(config.key_policy.clone());
    let mut handle = link.open(card)?;
    println!(
        "Card: MIFARE Classic {} UID {}",
        handle.geometry().size().name(),
        format_uid(handle.uid())
    );

    // the header sits in the lowest profile block
    let mut locations = profile.blocks.clone();
    locations.sort_by_key(|location| location.block);

    let mut blocks = Vec::with_capacity(locations.len());
    for location in &locations {
        if handle.granted_key(location.sector).is_none() {
            handle.authenticate_sector(location.sector, &profile.key)?;
        }
        let data = handle.read_block(location.block)?;
        let block: [u8; BLOCK_SIZE] = data
            .as_slice()
            .try_into()
            .map_err(|_| format!("block {} returned {} bytes", location.block, data.len()))?;
        blocks.push(block);
    }
    handle.close();

    match decode_token(&blocks) {
        Ok(token) => {
            println!("Profile:    {}", profile.name);
            println!("Credential: {}", token);
            Ok(())
        }
        Err(e) => Err(format!("No valid credential on card: {}", e).into()),
    }
}
