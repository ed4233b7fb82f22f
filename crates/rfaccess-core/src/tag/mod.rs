//! Tag transport and link layer
//!
//! This module defines the raw [`TagTransport`] trait that platform bindings
//! implement, the MIFARE Classic memory model, and the [`TagLink`] that turns
//! a presented tag into an exclusively owned [`TagHandle`].

pub mod access;
pub mod geometry;
pub mod key;
mod link;
mod traits;

pub use access::{AccessBits, BlockAccess};
pub use geometry::{CardGeometry, CardSize};
pub use key::{KeyKind, SectorKey, KEY_LEN, TRANSPORT_KEY};
pub use link::{KeyPolicy, TagHandle, TagLink, MAX_KEY_ATTEMPTS};
pub use traits::*;
