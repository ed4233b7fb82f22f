//! CLI argument parsing

use clap::{Parser, Subcommand};
use rfaccess_core::tag::CardSize;
use std::path::PathBuf;

/// Parse a card size name (mini, 1k, 2k, 4k)
fn parse_card_size(s: &str) -> Result<CardSize, String> {
    CardSize::from_name(s).ok_or_else(|| {
        let names: Vec<&str> = CardSize::ALL.iter().map(|size| size.name()).collect();
        format!("Unknown card size '{}' [available: {}]", s, names.join(", "))
    })
}

#[derive(Parser)]
#[command(name = "rfaccess")]
#[command(author, version, about = "RF access card programmer", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Reader configuration file (TOML format)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Where the request to program comes from
#[derive(clap::Args, Debug, Clone)]
#[group(required = true, multiple = false)]
pub struct RequestSource {
    /// Launch URI handed over by the web programmer page
    #[arg(long)]
    pub uri: Option<String>,

    /// Program the oldest pending request of this user (requires --store)
    #[arg(long, requires = "store")]
    pub user: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a launch URI and show the request it carries
    Resolve {
        /// Launch URI (rfaccess://, intent:// or a bare query)
        uri: String,
    },

    /// Program an emulated card
    Program {
        #[command(flatten)]
        source: RequestSource,

        /// Record store file (TOML format)
        #[arg(short, long)]
        store: Option<PathBuf>,

        /// Card image to load and save back (created if missing)
        #[arg(short, long)]
        image: Option<PathBuf>,

        /// Card size for a new card
        #[arg(long, default_value = "1k", value_parser = parse_card_size)]
        card: CardSize,

        /// Pull the card out of the field after this many operations
        #[arg(long)]
        remove_after: Option<usize>,
    },

    /// List pending requests of a user
    Pending {
        /// User to list requests for
        #[arg(short, long)]
        user: String,

        /// Record store file (TOML format)
        #[arg(short, long)]
        store: PathBuf,
    },

    /// Read the credential back from a card image
    Inspect {
        /// Card image file
        #[arg(short, long)]
        image: PathBuf,
    },
}
