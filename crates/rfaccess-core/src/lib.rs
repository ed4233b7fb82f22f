//! rfaccess-core - Core library for programming access-control cards
//!
//! This crate contains everything needed to write an access credential onto
//! a MIFARE Classic proximity card over a short-lived, unreliable link:
//!
//! - [`tag`] - the raw transport trait, card geometry, access conditions and
//!   the [`TagLink`](tag::TagLink) that owns the radio session
//! - [`protocol`] - the authenticate / verify-layout / write / verify-write
//!   state machine
//! - [`payload`] - what gets written, and the credential token layout
//! - [`handoff`] - parsing of the launch URI delivered by the web redirect
//! - [`profile`] - reader and card profile configuration (TOML)
//!
//! # Example
//!
//! ```ignore
//! use rfaccess_core::{handoff, protocol, tag::TagLink, profile::ReaderConfig};
//!
//! let config = ReaderConfig::default();
//! let request = handoff::resolve(uri, &config.profile)?;
//! let mut link = TagLink::new(config.key_policy.clone());
//! let outcome = protocol::program(&mut link, tag, request.payload(), &mut NoProgress, &NeverCancel);
//! println!("{}", outcome);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod error;
pub mod handoff;
pub mod payload;
pub mod profile;
pub mod protocol;
pub mod request;
pub mod tag;

pub use error::{ErrorClass, LinkError, Severity, TransportError};
pub use protocol::ProtocolOutcome;
pub use request::ProgramRequest;
