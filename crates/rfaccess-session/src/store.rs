//! Remote record store seam
//!
//! The record store holds pending program requests and learns when a token
//! has been consumed. It lives outside this crate; [`RecordStore`] is the
//! interface a backend client implements.

use std::fmt;
use std::sync::Arc;

use rfaccess_core::{ErrorClass, ProgramRequest};
use thiserror::Error;

/// Opaque identity of the person programming cards
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserId(String);

impl UserId {
    /// Wrap an identity string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identity as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Record store errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store could not be reached or refused the call
    #[error("record store unreachable: {0}")]
    Unreachable(String),
}

impl StoreError {
    /// Failure class (always [`ErrorClass::Unreachable`])
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Unreachable
    }
}

/// Client of the remote record store
pub trait RecordStore: Send + Sync {
    /// Pending requests for a user, in the store's order
    fn list_pending(&self, user: &UserId) -> Result<Vec<ProgramRequest>, StoreError>;

    /// Record that a request's token has been written to a card
    fn mark_consumed(&self, request_id: &str) -> Result<(), StoreError>;
}

impl<S: RecordStore + ?Sized> RecordStore for Arc<S> {
    fn list_pending(&self, user: &UserId) -> Result<Vec<ProgramRequest>, StoreError> {
        (**self).list_pending(user)
    }

    fn mark_consumed(&self, request_id: &str) -> Result<(), StoreError> {
        (**self).mark_consumed(request_id)
    }
}

impl<S: RecordStore + ?Sized> RecordStore for Box<S> {
    fn list_pending(&self, user: &UserId) -> Result<Vec<ProgramRequest>, StoreError> {
        (**self).list_pending(user)
    }

    fn mark_consumed(&self, request_id: &str) -> Result<(), StoreError> {
        (**self).mark_consumed(request_id)
    }
}

/// Next request to program for a user, if any
pub fn fetch_pending(store: &dyn RecordStore, user: &UserId) -> Result<Option<ProgramRequest>, StoreError> {
    let pending = store.list_pending(user)?;
    log::debug!("{} pending request(s) for {}", pending.len(), user);
    Ok(pending.into_iter().next())
}

/// Result of flushing the sync backlog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushReport {
    /// Ids the store accepted
    pub synced: usize,
    /// Ids still waiting
    pub remaining: usize,
}

/// Request ids whose `mark_consumed` call has not gone through yet
///
/// The cards behind these ids are already programmed; only the store is
/// behind.
#[derive(Debug, Default)]
pub struct SyncBacklog {
    ids: Vec<String>,
}

impl SyncBacklog {
    /// Create an empty backlog
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an id for a later retry
    pub fn defer(&mut self, request_id: &str) {
        if !self.ids.iter().any(|id| id == request_id) {
            self.ids.push(request_id.to_string());
        }
    }

    /// Ids waiting, oldest first
    pub fn pending(&self) -> &[String] {
        &self.ids
    }

    /// Number of ids waiting
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether nothing is waiting
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Retry every waiting id, keeping those that still fail
    pub fn flush(&mut self, store: &dyn RecordStore) -> FlushReport {
        let mut report = FlushReport::default();
        self.ids.retain(|id| match store.mark_consumed(id) {
            Ok(()) => {
                report.synced += 1;
                false
            }
            Err(e) => {
                log::debug!("Request {} still not synced: {}", id, e);
                true
            }
        });
        report.remaining = self.ids.len();
        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::SystemTime;

    use super::*;
    use rfaccess_core::payload::CardPayload;
    use rfaccess_core::profile::CardProfile;

    #[derive(Default)]
    struct FlakyStore {
        down: AtomicBool,
        consumed: Mutex<Vec<String>>,
    }

    impl RecordStore for FlakyStore {
        fn list_pending(&self, user: &UserId) -> Result<Vec<ProgramRequest>, StoreError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Unreachable("offline".into()));
            }
            let profile = CardProfile::default();
            Ok(["first", "second"]
                .iter()
                .map(|token| {
                    let payload = CardPayload::from_token(token, &profile).unwrap();
                    ProgramRequest::new(format!("{}-{}", user, token), payload, SystemTime::now())
                })
                .collect())
        }

        fn mark_consumed(&self, request_id: &str) -> Result<(), StoreError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Unreachable("offline".into()));
            }
            self.consumed.lock().unwrap().push(request_id.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_fetch_pending_keeps_store_order() {
        let store = FlakyStore::default();
        let request = fetch_pending(&store, &UserId::new("jdoe")).unwrap().unwrap();
        assert_eq!(request.id(), "jdoe-first");

        store.down.store(true, Ordering::SeqCst);
        let err = fetch_pending(&store, &UserId::new("jdoe")).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Unreachable);
    }

    #[test]
    fn test_backlog_keeps_failures() {
        let store = FlakyStore::default();
        let mut backlog = SyncBacklog::new();
        backlog.defer("a");
        backlog.defer("b");
        backlog.defer("a");
        assert_eq!(backlog.len(), 2);

        store.down.store(true, Ordering::SeqCst);
        assert_eq!(backlog.flush(&store), FlushReport { synced: 0, remaining: 2 });

        store.down.store(false, Ordering::SeqCst);
        assert_eq!(backlog.flush(&store), FlushReport { synced: 2, remaining: 0 });
        assert!(backlog.is_empty());
        assert_eq!(*store.consumed.lock().unwrap(), vec!["a", "b"]);
    }
}
