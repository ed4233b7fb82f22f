//! rfaccess - RF access card programmer
//!
//! Writes one-time access credentials onto MIFARE Classic cards.
//!
//! # Architecture
//!
//! A program request comes either from a launch URI handed over by the web
//! programmer page or from the pending requests of a user in the record
//! store. A `ProgramSession` arms the dispatch gate, waits for a card to
//! enter the field and runs the card protocol over the tag link:
//! authenticate, check the layout, write, read back.
//!
//! The CLI drives an emulated card, loaded from and saved to an image file,
//! and keeps the record store in a local TOML file.

mod cli;
mod commands;
mod store;

use clap::Parser;
use cli::{Cli, Commands};
use commands::ProgramArgs;
use rfaccess_core::profile::ReaderConfig;
use std::path::Path;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Set log level based on verbosity
    match cli.verbose {
        0 => {} // default (info)
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load reader configuration: {}", e);
            std::process::exit(1);
        }
    };

    match cli.command {
        Commands::Resolve { uri } => commands::run_resolve(&config, &uri),
        Commands::Program {
            source,
            store,
            image,
            card,
            remove_after,
        } => commands::run_program(
            &config,
            &ProgramArgs {
                uri: source.uri.as_deref(),
                user: source.user.as_deref(),
                store: store.as_deref(),
                image: image.as_deref(),
                card,
                remove_after,
            },
        ),
        Commands::Pending { user, store } => commands::run_pending(&config, &user, &store),
        Commands::Inspect { image } => commands::run_inspect(&config, &image),
    }
}

/// Load the reader configuration, or the built-in one when no file is given
fn load_config(path: Option<&Path>) -> Result<ReaderConfig, Box<dyn std::error::Error>> {
    let Some(path) = path else {
        log::debug!("Using built-in reader configuration");
        return Ok(ReaderConfig::default());
    };

    let config = ReaderConfig::from_toml_file(path)?;
    log::info!(
        "Loaded profile '{}' from {} ({} blocks, {} bytes of credential)",
        config.profile.name,
        path.display(),
        config.profile.blocks.len(),
        config.profile.capacity()
    );
    Ok(config)
}
