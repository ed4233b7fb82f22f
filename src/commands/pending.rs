//! Pending command implementation

use std::path::Path;
use std::time::UNIX_EPOCH;

use rfaccess_core::profile::ReaderConfig;
use rfaccess_session::{RecordStore, UserId};

use crate::store::FileStore;

/// List the pending requests of a user, oldest first
pub fn run_pending(
    config: &ReaderConfig,
    user: &str,
    store_path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = FileStore::open(store_path, config.profile.clone())?;
    let user = UserId::new(user);
    let pending = store.list_pending(&user)?;

    if pending.is_empty() {
        println!("No pending requests for {}", user);
        return Ok(());
    }

    println!("{} pending request(s) for {}:", pending.len(), user);
    for request in &pending {
        let issued = request
            .issued_at()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        println!(
            "  {:<24} issued {:>10}  {} blocks",
            request.id(),
            issued,
            request.payload().len()
        );
    }
    Ok(())
}
