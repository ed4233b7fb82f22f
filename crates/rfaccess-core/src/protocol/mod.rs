//! Card programming protocol
//!
//! [`program`] takes one freshly presented tag through
//! `Authenticating -> VerifyingLayout -> Writing -> VerifyingWrite` and
//! returns exactly one [`ProtocolOutcome`]. There is no retry inside the
//! protocol; a new attempt needs a new tag presentation.

mod card;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{ErrorClass, Incompatibility, LinkError, RejectReason};
use crate::payload::CardPayload;
use crate::tag::{format_uid, TagLink, TagTransport};

pub use card::CardProtocol;

/// Terminal result of one programming attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolOutcome {
    /// Every block was written and read back correctly
    Success,
    /// The tag was reachable but refused the credential
    Rejected(RejectReason),
    /// The tag left the field (or the attempt was cancelled)
    LinkLost,
    /// The tag can never take this payload
    IncompatibleTag(Incompatibility),
}

impl ProtocolOutcome {
    /// Whether the card now holds the payload
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Failure class, `None` for success
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            Self::Success => None,
            Self::Rejected(_) => Some(ErrorClass::Rejected),
            Self::LinkLost => Some(ErrorClass::LinkLost),
            Self::IncompatibleTag(_) => Some(ErrorClass::IncompatibleTag),
        }
    }

    /// Short text for the person holding the card
    pub fn user_message(&self) -> &'static str {
        match self.class() {
            None => "Card programmed.",
            Some(class) => class.user_message(),
        }
    }
}

impl From<LinkError> for ProtocolOutcome {
    fn from(e: LinkError) -> Self {
        match e {
            LinkError::LinkLost => Self::LinkLost,
            LinkError::Rejected(reason) => Self::Rejected(reason),
            LinkError::IncompatibleTag(what) => Self::IncompatibleTag(what),
        }
    }
}

impl fmt::Display for ProtocolOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Rejected(reason) => write!(f, "rejected: {}", reason),
            Self::LinkLost => write!(f, "link lost"),
            Self::IncompatibleTag(what) => write!(f, "incompatible tag: {}", what),
        }
    }
}

/// Protocol phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    /// Waiting for a handle
    Idle,
    /// Presenting keys for every payload sector
    Authenticating,
    /// Checking access conditions and block sizes
    VerifyingLayout,
    /// Writing payload blocks in ascending order
    Writing,
    /// Reading every written block back
    VerifyingWrite,
    /// Finished
    Done(ProtocolOutcome),
}

impl ProtocolState {
    /// Whether this is a terminal state
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Authenticating => write!(f, "authenticating"),
            Self::VerifyingLayout => write!(f, "verifying layout"),
            Self::Writing => write!(f, "writing"),
            Self::VerifyingWrite => write!(f, "verifying write"),
            Self::Done(outcome) => write!(f, "done ({})", outcome),
        }
    }
}

/// Progress callback for a programming attempt
///
/// All methods default to doing nothing.
pub trait ProtocolProgress {
    /// Called on every state transition
    fn state_changed(&mut self, _state: ProtocolState) {}

    /// Called after each block write
    fn block_written(&mut self, _block: u16, _done: usize, _total: usize) {}

    /// Called after each block passes verification
    fn block_verified(&mut self, _block: u16, _done: usize, _total: usize) {}
}

/// A no-op progress reporter
pub struct NoProgress;

impl ProtocolProgress for NoProgress {}

/// Cooperative cancellation, polled between protocol steps
pub trait CancelSignal {
    /// Whether the attempt should stop
    fn is_cancelled(&self) -> bool;
}

impl CancelSignal for AtomicBool {
    fn is_cancelled(&self) -> bool {
        self.load(Ordering::SeqCst)
    }
}

impl<C: CancelSignal + ?Sized> CancelSignal for Arc<C> {
    fn is_cancelled(&self) -> bool {
        (**self).is_cancelled()
    }
}

impl<C: CancelSignal + ?Sized> CancelSignal for &C {
    fn is_cancelled(&self) -> bool {
        (**self).is_cancelled()
    }
}

/// A signal that is never raised
pub struct NeverCancel;

impl CancelSignal for NeverCancel {
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Program one presented tag with a payload
///
/// Opens the tag on `link`, runs the protocol and always closes the handle
/// before returning, whatever the outcome.
pub fn program<T: TagTransport>(
    link: &mut TagLink,
    tag: T,
    payload: &CardPayload,
    progress: &mut dyn ProtocolProgress,
    cancel: &dyn CancelSignal,
) -> ProtocolOutcome {
    if cancel.is_cancelled() {
        log::debug!("Attempt cancelled before the tag was opened");
        return ProtocolOutcome::LinkLost;
    }

    let mut handle = match link.open(tag) {
        Ok(handle) => handle,
        Err(e) => {
            let outcome = ProtocolOutcome::from(e);
            log::info!("Could not open tag: {}", outcome);
            progress.state_changed(ProtocolState::Done(outcome));
            return outcome;
        }
    };

    let uid = format_uid(handle.uid());
    let mut protocol = CardProtocol::new(payload);
    let outcome = protocol.run(&mut handle, progress, cancel);
    handle.close();

    log::info!("Tag {}: {}", uid, outcome);
    outcome
}
