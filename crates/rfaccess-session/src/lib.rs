//! rfaccess-session - Tag dispatch and programming sessions
//!
//! This crate ties the pieces of `rfaccess-core` together for one
//! programming request at a time:
//!
//! - [`DispatchGate`] - exclusive ownership of the platform's tag-arrival
//!   channel
//! - [`Reader`] - one gate and one radio, shared by every session using it
//! - [`ProgramSession`] - arms the gate, runs the card protocol on the
//!   next tag and reports exactly one outcome per start
//! - [`RecordStore`] - the seam to the remote store of pending requests
//!
//! # Example
//!
//! ```ignore
//! use rfaccess_session::{ProgramSession, Reader};
//!
//! let reader = Reader::new(TagLink::new(policy));
//! let session = ProgramSession::new(reader.clone(), store);
//! let attempt = session.start(request)?;
//! let worker = std::thread::spawn(move || attempt.run());
//!
//! // platform callback
//! reader.deliver(Box::new(tag)).ok();
//!
//! let report = worker.join().unwrap();
//! println!("{}", report.outcome);
//! ```

#![warn(missing_docs)]

mod gate;
mod reader;
mod session;
mod store;

pub use gate::{DispatchGate, GateEvent, GateLease, RegistrationId};
pub use reader::{PresentedTag, Reader};
pub use session::{Attempt, ProgramSession, SessionError, SessionReport, SessionState};
pub use store::{fetch_pending, FlushReport, RecordStore, StoreError, SyncBacklog, UserId};
