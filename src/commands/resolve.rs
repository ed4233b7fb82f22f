//! Resolve command implementation

use rfaccess_core::handoff;
use rfaccess_core::profile::ReaderConfig;

use super::print_request;

/// Validate a launch URI and print the request it carries
pub fn run_resolve(config: &ReaderConfig, uri: &str) -> Result<(), Box<dyn std::error::Error>> {
    let request = handoff::resolve(uri, &config.profile)?;
    print_request(&request);
    Ok(())
}
