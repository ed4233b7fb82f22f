//! Error types for rfaccess-core
//!
//! Failures fall into five classes (see [`ErrorClass`]). Transport-level
//! errors never reach callers of the link directly: [`TagHandle`] folds every
//! one of them into [`LinkError::LinkLost`].
//!
//! [`TagHandle`]: crate::tag::TagHandle

use core::fmt;
use thiserror::Error;

/// How a failure should be presented to the person holding the card
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Expected during normal use (an impatient tap); just try again
    Expected,
    /// An explicit card-programming failure the user must see
    Failure,
    /// Happens outside the physical programming step; not a card failure
    Background,
}

/// The failure taxonomy shared by every layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Malformed launch input from the web handoff
    InvalidHandoff,
    /// Wrong tag technology or memory geometry
    IncompatibleTag,
    /// Authentication or write verification failed on a reachable tag
    Rejected,
    /// The tag left the field (or the attempt was cancelled)
    LinkLost,
    /// The record store could not be told about a consumed token
    Unreachable,
}

impl ErrorClass {
    /// Presentation severity for this class
    pub fn severity(self) -> Severity {
        match self {
            Self::LinkLost => Severity::Expected,
            Self::Rejected | Self::IncompatibleTag => Severity::Failure,
            Self::InvalidHandoff | Self::Unreachable => Severity::Background,
        }
    }

    /// Whether presenting a card again can succeed without changing anything
    pub fn is_retryable(self) -> bool {
        match self {
            Self::LinkLost | Self::Rejected | Self::Unreachable => true,
            Self::InvalidHandoff | Self::IncompatibleTag => false,
        }
    }

    /// Short message suitable for the presentation layer
    pub fn user_message(self) -> &'static str {
        match self {
            Self::LinkLost => "Card moved away too soon. Hold it still and try again.",
            Self::Rejected => "The card refused the new access data. Try again or use another card.",
            Self::IncompatibleTag => "This card is not supported. Use an RF Access card.",
            Self::InvalidHandoff => "This programming link is not valid. Open it again from the web page.",
            Self::Unreachable => "Card programmed. Confirmation will be sent when you are back online.",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidHandoff => "invalid handoff",
            Self::IncompatibleTag => "incompatible tag",
            Self::Rejected => "rejected",
            Self::LinkLost => "link lost",
            Self::Unreachable => "record store unreachable",
        };
        f.write_str(name)
    }
}

/// Errors reported by a raw tag transport
///
/// These are what a platform binding sees (I/O exceptions, timeouts, bad
/// CRCs). The link layer does not distinguish between them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The tag is no longer in the field
    #[error("tag left the field")]
    TagLost,
    /// The tag did not answer in time
    #[error("tag did not respond in time")]
    Timeout,
    /// A frame failed its CRC or parity check
    #[error("frame checksum failed")]
    Checksum,
    /// The tag answered with a NAK
    #[error("tag refused the command (NAK 0x{0:X})")]
    Nak(u8),
    /// Any other platform I/O failure
    #[error("transport I/O error: {0}")]
    Io(String),
}

/// Why a reachable tag refused the programming attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// No key in the attempt list was accepted for this sector
    Authentication {
        /// Sector that refused every key
        sector: u8,
    },
    /// The block is writable, but not with the key type that authenticated
    KeyNotPermitted {
        /// Block that cannot be written with the accepted key
        block: u16,
    },
    /// The block read back different bytes than were written
    VerifyMismatch {
        /// First block whose contents differ
        block: u16,
    },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authentication { sector } => {
                write!(f, "authentication refused for sector {}", sector)
            }
            Self::KeyNotPermitted { block } => {
                write!(f, "accepted key may not write block {}", block)
            }
            Self::VerifyMismatch { block } => {
                write!(f, "block {} did not take the written value", block)
            }
        }
    }
}

/// Why a tag cannot be programmed with this payload at all
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Incompatibility {
    /// The tag is not a block/sector memory card
    Technology,
    /// The sector/block counts match no known card size
    Geometry {
        /// Reported sector count
        sectors: usize,
        /// Reported block count
        blocks: usize,
    },
    /// The payload addresses a sector the card does not have
    SectorOutOfRange {
        /// Offending sector
        sector: u8,
    },
    /// The payload addresses a block beyond the end of the card
    BlockOutOfRange {
        /// Offending block
        block: u16,
    },
    /// The payload places a block in a sector it does not belong to
    SectorMismatch {
        /// Offending block
        block: u16,
        /// Sector declared by the payload
        sector: u8,
    },
    /// The payload targets a sector trailer or the manufacturer block
    ReservedBlock {
        /// Offending block
        block: u16,
    },
    /// The sector trailer's access bytes are internally inconsistent
    AccessBits {
        /// Sector whose trailer is corrupt
        sector: u8,
    },
    /// The block's access conditions never permit writing
    Locked {
        /// Locked block
        block: u16,
    },
    /// The block read back with an unexpected length
    BlockSize {
        /// Offending block
        block: u16,
        /// Length actually returned
        len: usize,
    },
}

impl fmt::Display for Incompatibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Technology => write!(f, "unsupported tag technology"),
            Self::Geometry { sectors, blocks } => {
                write!(f, "unsupported geometry ({} sectors, {} blocks)", sectors, blocks)
            }
            Self::SectorOutOfRange { sector } => write!(f, "sector {} is out of range", sector),
            Self::BlockOutOfRange { block } => write!(f, "block {} is out of range", block),
            Self::SectorMismatch { block, sector } => {
                write!(f, "block {} is not in sector {}", block, sector)
            }
            Self::ReservedBlock { block } => write!(f, "block {} is reserved", block),
            Self::AccessBits { sector } => {
                write!(f, "sector {} has corrupt access bits", sector)
            }
            Self::Locked { block } => write!(f, "block {} is permanently read-only", block),
            Self::BlockSize { block, len } => {
                write!(f, "block {} returned {} bytes", block, len)
            }
        }
    }
}

/// Errors reported by [`TagLink`](crate::tag::TagLink) and its handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LinkError {
    /// The tag became unreachable; the handle is now invalid
    #[error("link lost")]
    LinkLost,
    /// The tag is reachable but refused the operation
    #[error("rejected: {0}")]
    Rejected(RejectReason),
    /// The tag can never be programmed with this payload
    #[error("incompatible tag: {0}")]
    IncompatibleTag(Incompatibility),
}

impl LinkError {
    /// Failure class of this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::LinkLost => ErrorClass::LinkLost,
            Self::Rejected(_) => ErrorClass::Rejected,
            Self::IncompatibleTag(_) => ErrorClass::IncompatibleTag,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_lost_is_quiet_and_retryable() {
        let class = LinkError::LinkLost.class();
        assert_eq!(class.severity(), Severity::Expected);
        assert!(class.is_retryable());
    }

    #[test]
    fn test_incompatible_tag_needs_another_card() {
        let class = LinkError::IncompatibleTag(Incompatibility::Technology).class();
        assert_eq!(class.severity(), Severity::Failure);
        assert!(!class.is_retryable());
    }

    #[test]
    fn test_background_classes_are_not_card_failures() {
        assert_eq!(ErrorClass::InvalidHandoff.severity(), Severity::Background);
        assert_eq!(ErrorClass::Unreachable.severity(), Severity::Background);
    }

    #[test]
    fn test_display_includes_reason() {
        let err = LinkError::Rejected(RejectReason::VerifyMismatch { block: 4 });
        assert_eq!(err.to_string(), "rejected: block 4 did not take the written value");
    }
}
