//! One physical reader: its tag-arrival gate and its radio
//!
//! Every [`ProgramSession`](crate::ProgramSession) built on the same
//! [`Reader`] competes for the same gate and drives the same [`TagLink`].
//! The link sits behind a mutex that a run holds from open to close, so at
//! most one tag handle is open per reader, whichever session owns the gate.

use std::sync::{Arc, Mutex, MutexGuard};

use rfaccess_core::tag::{TagLink, TagTransport};

use crate::gate::DispatchGate;

/// A tag as handed over by the platform
pub type PresentedTag = Box<dyn TagTransport + Send>;

/// Shared handle to a reader
#[derive(Clone)]
pub struct Reader {
    gate: DispatchGate<PresentedTag>,
    link: Arc<Mutex<TagLink>>,
}

impl Reader {
    /// Create a reader driving `link`
    pub fn new(link: TagLink) -> Self {
        Self {
            gate: DispatchGate::new(),
            link: Arc::new(Mutex::new(link)),
        }
    }

    /// The reader's tag-arrival gate
    pub fn gate(&self) -> &DispatchGate<PresentedTag> {
        &self.gate
    }

    /// Platform callback: a tag entered the field
    ///
    /// Hands the tag back when no session is armed.
    pub fn deliver(&self, tag: PresentedTag) -> Result<(), PresentedTag> {
        self.gate.deliver(tag)
    }

    /// Take the radio, waiting for the run that holds it to close its tag
    pub(crate) fn claim_link(&self) -> MutexGuard<'_, TagLink> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("armed", &self.gate.is_armed())
            .finish_non_exhaustive()
    }
}
