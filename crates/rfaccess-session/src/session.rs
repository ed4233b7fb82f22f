//! ProgramSession - one programming request, end to end
//!
//! ```text
//!   start(request) ──► AwaitingTag ──(tag arrives)──► Programming(..) ──► Finished(report)
//!         │                 │
//!         │              cancel() / gate revoked ─────────────────────► Finished(LinkLost, cancelled)
//!         └── Busy if an attempt is already running
//! ```
//!
//! `start` arms the [`DispatchGate`] and returns an [`Attempt`]. The attempt's
//! blocking [`Attempt::run`] waits for a tag, runs the card protocol on it and
//! produces exactly one [`SessionReport`]. Run it on a worker thread; the
//! platform side feeds tags in through [`Reader::deliver`].
//!
//! Sessions sharing a [`Reader`] take the gate from each other. Losing the
//! gate cancels the attempt, also in the middle of a protocol run, and the
//! next run waits for the previous one to close its tag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, MutexGuard};

use rfaccess_core::protocol::{self, NoProgress, ProtocolProgress, ProtocolState};
use rfaccess_core::{ProgramRequest, ProtocolOutcome};
use thiserror::Error;

use crate::gate::{GateEvent, GateLease, RegistrationId};
use crate::reader::{PresentedTag, Reader};
use crate::store::{fetch_pending, FlushReport, RecordStore, StoreError, SyncBacklog, UserId};

/// Result of one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    /// Request the attempt was for
    pub request_id: String,
    /// What happened to the card
    pub outcome: ProtocolOutcome,
    /// The attempt was cancelled (or lost the gate) before finishing
    pub cancelled: bool,
    /// The card is programmed but the store has not been told yet
    pub sync_pending: bool,
}

impl SessionReport {
    /// Text for the person holding the card, `None` when nothing should be shown
    pub fn user_message(&self) -> Option<&'static str> {
        if self.cancelled {
            None
        } else {
            Some(self.outcome.user_message())
        }
    }
}

/// Where the session currently is
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No attempt started yet
    #[default]
    Idle,
    /// Armed, waiting for a tag
    AwaitingTag,
    /// Running the card protocol
    Programming(ProtocolState),
    /// Last attempt finished
    Finished(SessionReport),
}

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// This session already has an attempt in progress
    #[error("a programming attempt is already active")]
    Busy,
    /// Pending requests could not be fetched
    #[error(transparent)]
    Store(#[from] StoreError),
}

struct ActiveAttempt {
    registration: RegistrationId,
    cancel: Arc<AtomicBool>,
}

struct Shared {
    reader: Reader,
    store: Arc<dyn RecordStore>,
    state: Mutex<SessionState>,
    active: Mutex<Option<ActiveAttempt>>,
    backlog: Mutex<SyncBacklog>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        log::trace!("Session state: {:?}", state);
        *lock(&self.state) = state;
    }
}

/// Binds program requests to a reader and the card protocol
///
/// Cloning yields another handle to the same session, e.g. to cancel from
/// another thread.
#[derive(Clone)]
pub struct ProgramSession {
    shared: Arc<Shared>,
}

impl ProgramSession {
    /// Create a session programming through `reader`
    pub fn new(reader: Reader, store: Arc<dyn RecordStore>) -> Self {
        Self {
            shared: Arc::new(Shared {
                reader,
                store,
                state: Mutex::new(SessionState::Idle),
                active: Mutex::new(None),
                backlog: Mutex::new(SyncBacklog::new()),
            }),
        }
    }

    /// Arm the gate for a request
    ///
    /// Fails with [`SessionError::Busy`] while a previous attempt of this
    /// session has not finished (or been dropped). An attempt of another
    /// session on the same reader is revoked instead.
    pub fn start(&self, request: ProgramRequest) -> Result<Attempt, SessionError> {
        let mut active = lock(&self.shared.active);
        if active.is_some() {
            return Err(SessionError::Busy);
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, events) = mpsc::channel();
        let revoked = Arc::clone(&cancel);
        let lease = self.shared.reader.gate().arm(move |event| {
            if matches!(event, GateEvent::Revoked) {
                revoked.store(true, Ordering::SeqCst);
            }
            // the receiver is gone once the attempt finished
            let _ = tx.send(event);
        });
        *active = Some(ActiveAttempt {
            registration: lease.id(),
            cancel: Arc::clone(&cancel),
        });
        drop(active);
        self.shared.set_state(SessionState::AwaitingTag);
        log::info!("Waiting for a card for request {}", request.id());

        Ok(Attempt {
            shared: Arc::clone(&self.shared),
            request,
            events,
            lease: Some(lease),
            cancel,
        })
    }

    /// Fetch the user's next pending request and start it
    ///
    /// Returns `Ok(None)` when nothing is pending.
    pub fn start_pending(&self, user: &UserId) -> Result<Option<Attempt>, SessionError> {
        match fetch_pending(self.shared.store.as_ref(), user)? {
            Some(request) => self.start(request).map(Some),
            None => Ok(None),
        }
    }

    /// Cancel the running attempt, if any
    ///
    /// Safe to call any number of times and from any thread. An attempt
    /// that has not produced an outcome yet finishes with `LinkLost` and
    /// `cancelled` set; a protocol run in progress stops at its next step
    /// and still closes the tag.
    pub fn cancel(&self) -> bool {
        let active = lock(&self.shared.active);
        let Some(attempt) = active.as_ref() else {
            return false;
        };
        if attempt.cancel.swap(true, Ordering::SeqCst) {
            return false;
        }
        log::info!("Cancelling programming attempt");
        let registration = attempt.registration;
        drop(active);
        self.shared.reader.gate().revoke(registration);
        true
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        lock(&self.shared.state).clone()
    }

    /// Whether an attempt is in progress
    pub fn is_active(&self) -> bool {
        lock(&self.shared.active).is_some()
    }

    /// Request ids still waiting for `mark_consumed`
    pub fn sync_backlog(&self) -> Vec<String> {
        lock(&self.shared.backlog).pending().to_vec()
    }

    /// Retry deferred `mark_consumed` calls
    pub fn retry_sync(&self) -> FlushReport {
        let report = lock(&self.shared.backlog).flush(self.shared.store.as_ref());
        if report.synced > 0 {
            log::info!("Synced {} deferred request(s)", report.synced);
        }
        report
    }
}

/// One armed programming attempt
///
/// Dropping an attempt without running it releases the gate.
pub struct Attempt {
    shared: Arc<Shared>,
    request: ProgramRequest,
    events: Receiver<GateEvent<PresentedTag>>,
    lease: Option<GateLease<PresentedTag>>,
    cancel: Arc<AtomicBool>,
}

impl Attempt {
    /// Request being programmed
    pub fn request(&self) -> &ProgramRequest {
        &self.request
    }

    /// Wait for a tag and program it
    pub fn run(self) -> SessionReport {
        self.run_with_progress(&mut NoProgress)
    }

    /// Like [`run`](Self::run), reporting protocol progress
    pub fn run_with_progress(mut self, progress: &mut dyn ProtocolProgress) -> SessionReport {
        let (outcome, cancelled) = self.await_outcome(progress);
        self.finish(outcome, cancelled)
    }

    fn await_outcome(&mut self, progress: &mut dyn ProtocolProgress) -> (ProtocolOutcome, bool) {
        if self.cancel.load(Ordering::SeqCst) {
            return (ProtocolOutcome::LinkLost, true);
        }

        let tag = match self.events.recv() {
            Ok(GateEvent::Arrival(tag)) => tag,
            Ok(GateEvent::Revoked) | Err(_) => {
                log::info!("Attempt for {} lost the tag gate", self.request.id());
                return (ProtocolOutcome::LinkLost, true);
            }
        };

        let mut link = self.shared.reader.claim_link();
        let mut tracker = StateTracker {
            shared: &self.shared,
            inner: progress,
        };
        tracker.state_changed(ProtocolState::Idle);
        let outcome = protocol::program(&mut link, tag, self.request.payload(), &mut tracker, &*self.cancel);

        // a run that finished despite a late cancel keeps its outcome
        let cancelled = outcome == ProtocolOutcome::LinkLost && self.cancel.load(Ordering::SeqCst);
        (outcome, cancelled)
    }

    fn finish(&mut self, outcome: ProtocolOutcome, cancelled: bool) -> SessionReport {
        let request_id = self.request.id().to_string();
        self.release();

        let mut sync_pending = false;
        if outcome.is_success() {
            if let Err(e) = self.shared.store.mark_consumed(&request_id) {
                log::warn!("Card programmed, but {}; will retry", e);
                lock(&self.shared.backlog).defer(&request_id);
                sync_pending = true;
            }
        }

        let report = SessionReport {
            request_id,
            outcome,
            cancelled,
            sync_pending,
        };
        log::info!(
            "Request {}: {}{}",
            report.request_id,
            report.outcome,
            if cancelled { " (cancelled)" } else { "" }
        );
        self.shared.set_state(SessionState::Finished(report.clone()));
        report
    }

    /// Give up the gate; idempotent
    fn release(&mut self) {
        if let Some(lease) = self.lease.take() {
            let registration = lease.id();
            drop(lease);
            let mut active = lock(&self.shared.active);
            if active.as_ref().map(|a| a.registration) == Some(registration) {
                *active = None;
            }
        }
    }
}

impl Drop for Attempt {
    fn drop(&mut self) {
        if self.lease.is_some() {
            log::debug!("Attempt for {} dropped before running", self.request.id());
            self.release();
            self.shared.set_state(SessionState::Idle);
        }
    }
}

/// Mirrors protocol states into the session state
struct StateTracker<'a> {
    shared: &'a Shared,
    inner: &'a mut dyn ProtocolProgress,
}

impl ProtocolProgress for StateTracker<'_> {
    fn state_changed(&mut self, state: ProtocolState) {
        self.shared.set_state(SessionState::Programming(state));
        self.inner.state_changed(state);
    }

    fn block_written(&mut self, block: u16, done: usize, total: usize) {
        self.inner.block_written(block, done, total);
    }

    fn block_verified(&mut self, block: u16, done: usize, total: usize) {
        self.inner.block_verified(block, done, total);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::SystemTime;

    use super::*;
    use rfaccess_core::payload::{decode_token, CardPayload};
    use rfaccess_core::profile::CardProfile;
    use rfaccess_core::tag::{CardSize, TagLink, BLOCK_SIZE};
    use rfaccess_dummy::{CardOp, EmulatedCard, RadioMonitor};

    #[derive(Default)]
    struct TestStore {
        down: AtomicBool,
        pending: Mutex<Vec<ProgramRequest>>,
        consumed: Mutex<Vec<String>>,
        calls: AtomicUsize,
    }

    impl RecordStore for TestStore {
        fn list_pending(&self, _user: &UserId) -> Result<Vec<ProgramRequest>, StoreError> {
            Ok(self.pending.lock().unwrap().clone())
        }

        fn mark_consumed(&self, request_id: &str) -> Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Unreachable("no network".into()));
            }
            self.consumed.lock().unwrap().push(request_id.to_string());
            Ok(())
        }
    }

    fn request(token: &str) -> ProgramRequest {
        let payload = CardPayload::from_token(token, &CardProfile::default()).unwrap();
        ProgramRequest::new(format!("req-{}", token), payload, SystemTime::now())
    }

    fn setup() -> (ProgramSession, Reader, Arc<TestStore>) {
        let reader = Reader::new(TagLink::default());
        let store = Arc::new(TestStore::default());
        let session = ProgramSession::new(reader.clone(), store.clone());
        (session, reader, store)
    }

    fn credential(card: &EmulatedCard) -> String {
        let blocks: Vec<[u8; BLOCK_SIZE]> = (4..=6).map(|b| card.block(b)).collect();
        decode_token(&blocks).unwrap()
    }

    #[test]
    fn test_success_marks_consumed() {
        let (session, reader, store) = setup();
        let card = EmulatedCard::new(CardSize::Classic1K);

        let attempt = session.start(request("tok1")).unwrap();
        assert_eq!(session.state(), SessionState::AwaitingTag);
        assert!(reader.deliver(Box::new(card.clone())).is_ok());

        let report = attempt.run();
        assert_eq!(report.outcome, ProtocolOutcome::Success);
        assert!(!report.cancelled);
        assert!(!report.sync_pending);
        assert_eq!(*store.consumed.lock().unwrap(), vec!["req-tok1"]);
        assert_eq!(credential(&card), "tok1");

        assert_eq!(session.state(), SessionState::Finished(report));
        assert!(!reader.gate().is_armed());
        assert!(!session.is_active());
    }

    #[test]
    fn test_store_failure_keeps_local_success() {
        let (session, reader, store) = setup();
        store.down.store(true, Ordering::SeqCst);

        let attempt = session.start(request("tok2")).unwrap();
        reader.deliver(Box::new(EmulatedCard::new(CardSize::Classic1K))).ok();
        let report = attempt.run();

        assert_eq!(report.outcome, ProtocolOutcome::Success);
        assert!(report.sync_pending);
        assert_eq!(session.sync_backlog(), vec!["req-tok2"]);

        assert_eq!(session.retry_sync(), FlushReport { synced: 0, remaining: 1 });
        store.down.store(false, Ordering::SeqCst);
        assert_eq!(session.retry_sync(), FlushReport { synced: 1, remaining: 0 });
        assert_eq!(*store.consumed.lock().unwrap(), vec!["req-tok2"]);
    }

    #[test]
    fn test_failed_attempt_does_not_consume() {
        let (session, reader, store) = setup();
        let card = EmulatedCard::new(CardSize::Classic1K);
        card.lock_block(5);

        let attempt = session.start(request("tok3")).unwrap();
        reader.deliver(Box::new(card)).ok();
        let report = attempt.run();

        assert!(matches!(report.outcome, ProtocolOutcome::IncompatibleTag(_)));
        assert!(report.user_message().is_some());
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_before_tag() {
        let (session, reader, store) = setup();
        let attempt = session.start(request("tok4")).unwrap();

        assert!(session.cancel());
        assert!(!session.cancel());
        assert!(!reader.gate().is_armed());

        let report = attempt.run();
        assert_eq!(report.outcome, ProtocolOutcome::LinkLost);
        assert!(report.cancelled);
        assert_eq!(report.user_message(), None);
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);

        // nobody listens any more
        let card = EmulatedCard::new(CardSize::Classic1K);
        assert!(reader.deliver(Box::new(card.clone())).is_err());
        assert!(card.ops().is_empty());
        assert!(!session.cancel());
    }

    #[test]
    fn test_cancel_from_another_thread_wakes_waiting_run() {
        let (session, _reader, _store) = setup();
        let attempt = session.start(request("tok5")).unwrap();

        let worker = thread::spawn(move || attempt.run());
        session.cancel();
        let report = worker.join().unwrap();

        assert_eq!(report.outcome, ProtocolOutcome::LinkLost);
        assert!(report.cancelled);
    }

    #[test]
    fn test_cancel_during_protocol_closes_tag() {
        struct CancelWhenWriting(ProgramSession);
        impl ProtocolProgress for CancelWhenWriting {
            fn state_changed(&mut self, state: ProtocolState) {
                if state == ProtocolState::Writing {
                    self.0.cancel();
                }
            }
        }

        let (session, reader, _store) = setup();
        let card = EmulatedCard::new(CardSize::Classic1K);
        let attempt = session.start(request("tok6")).unwrap();
        reader.deliver(Box::new(card.clone())).ok();

        let report = attempt.run_with_progress(&mut CancelWhenWriting(session.clone()));
        assert_eq!(report.outcome, ProtocolOutcome::LinkLost);
        assert!(report.cancelled);
        assert!(!card.ops().iter().any(|op| matches!(op, CardOp::Write(_))));
        assert_eq!(card.ops().last(), Some(&CardOp::Close));
        assert_eq!(card.radio().open_sessions(), 0);
    }

    #[test]
    fn test_rearming_revokes_previous_session() {
        let reader = Reader::new(TagLink::default());
        let store: Arc<TestStore> = Arc::default();
        let first = ProgramSession::new(reader.clone(), store.clone());
        let second = ProgramSession::new(reader.clone(), store.clone());

        let stale = first.start(request("old")).unwrap();
        let current = second.start(request("new")).unwrap();

        let card = EmulatedCard::new(CardSize::Classic1K);
        reader.deliver(Box::new(card.clone())).ok();

        let stale_report = stale.run();
        assert_eq!(stale_report.outcome, ProtocolOutcome::LinkLost);
        assert!(stale_report.cancelled);

        assert_eq!(current.run().outcome, ProtocolOutcome::Success);
        assert_eq!(credential(&card), "new");
        assert_eq!(*store.consumed.lock().unwrap(), vec!["req-new"]);
    }

    #[test]
    fn test_busy_until_attempt_finishes() {
        let (session, _reader, _store) = setup();
        let attempt = session.start(request("a")).unwrap();
        assert!(matches!(session.start(request("b")), Err(SessionError::Busy)));

        drop(attempt);
        assert_eq!(session.state(), SessionState::Idle);
        let again = session.start(request("b")).unwrap();
        assert_eq!(again.request().id(), "req-b");
    }

    #[test]
    fn test_one_outcome_per_start() {
        let (session, reader, _store) = setup();
        let card = EmulatedCard::new(CardSize::Classic1K);
        card.inject(rfaccess_dummy::Fault::RemoveOnWrite { nth: 1 });

        let attempt = session.start(request("tok7")).unwrap();
        reader.deliver(Box::new(card.clone())).ok();
        assert_eq!(attempt.run().outcome, ProtocolOutcome::LinkLost);

        // a retry needs a fresh start and a fresh presentation
        card.reinsert();
        assert!(reader.deliver(Box::new(card.clone())).is_err());
        let retry = session.start(request("tok7")).unwrap();
        reader.deliver(Box::new(card.clone())).ok();
        assert_eq!(retry.run().outcome, ProtocolOutcome::Success);
        assert_eq!(credential(&card), "tok7");
    }

    #[test]
    fn test_start_pending() {
        let (session, reader, store) = setup();
        assert!(session.start_pending(&UserId::new("jdoe")).unwrap().is_none());

        store.pending.lock().unwrap().push(request("queued"));
        let attempt = session.start_pending(&UserId::new("jdoe")).unwrap().unwrap();
        reader.deliver(Box::new(EmulatedCard::new(CardSize::Classic1K))).ok();
        assert_eq!(attempt.run().request_id, "req-queued");
    }

    #[test]
    fn test_one_radio_session_at_a_time() {
        let (session, reader, _store) = setup();
        let radio = RadioMonitor::new();

        for i in 0..4 {
            let attempt = session.start(request(&format!("t{}", i))).unwrap();
            let worker = thread::spawn(move || attempt.run());

            let card = EmulatedCard::new(CardSize::Classic1K).with_radio(Arc::clone(&radio));
            reader.deliver(Box::new(card)).ok();
            assert_eq!(worker.join().unwrap().outcome, ProtocolOutcome::Success);
        }

        assert_eq!(radio.sessions(), 4);
        assert_eq!(radio.peak(), 1);
        assert_eq!(radio.open_sessions(), 0);
    }

    struct RearmWhenWriting {
        second: ProgramSession,
        reader: Reader,
        card: EmulatedCard,
        worker: Option<thread::JoinHandle<SessionReport>>,
    }

    impl ProtocolProgress for RearmWhenWriting {
        fn state_changed(&mut self, state: ProtocolState) {
            if state == ProtocolState::Writing && self.worker.is_none() {
                let attempt = self.second.start(request("second")).unwrap();
                assert!(self.reader.deliver(Box::new(self.card.clone())).is_ok());
                self.worker = Some(thread::spawn(move || attempt.run()));
            }
        }
    }

    #[test]
    fn test_rearm_during_run_cancels_it() {
        let reader = Reader::new(TagLink::default());
        let store: Arc<TestStore> = Arc::default();
        let first = ProgramSession::new(reader.clone(), store.clone());
        let second = ProgramSession::new(reader.clone(), store.clone());

        let radio = RadioMonitor::new();
        let first_card = EmulatedCard::new(CardSize::Classic1K).with_radio(Arc::clone(&radio));
        let second_card = EmulatedCard::new(CardSize::Classic1K).with_radio(Arc::clone(&radio));

        let attempt = first.start(request("first")).unwrap();
        reader.deliver(Box::new(first_card.clone())).ok();

        let mut progress = RearmWhenWriting {
            second,
            reader: reader.clone(),
            card: second_card.clone(),
            worker: None,
        };
        let report = attempt.run_with_progress(&mut progress);
        assert_eq!(report.outcome, ProtocolOutcome::LinkLost);
        assert!(report.cancelled);
        assert!(!first_card.ops().iter().any(|op| matches!(op, CardOp::Write(_))));
        assert_eq!(first_card.ops().last(), Some(&CardOp::Close));

        let worker = progress.worker.take().unwrap();
        let second_report = worker.join().unwrap();
        assert_eq!(second_report.outcome, ProtocolOutcome::Success);
        assert_eq!(credential(&second_card), "second");
        assert_eq!(*store.consumed.lock().unwrap(), vec!["req-second"]);

        assert_eq!(radio.sessions(), 2);
        assert_eq!(radio.peak(), 1);
        assert_eq!(radio.open_sessions(), 0);
        assert!(!first.is_active());
    }

    #[test]
    fn test_disarm_during_run_cancels_it() {
        struct DisarmWhenWriting(Reader);
        impl ProtocolProgress for DisarmWhenWriting {
            fn state_changed(&mut self, state: ProtocolState) {
                if state == ProtocolState::Writing {
                    self.0.gate().disarm();
                }
            }
        }

        let (session, reader, store) = setup();
        let card = EmulatedCard::new(CardSize::Classic1K);
        let attempt = session.start(request("tok8")).unwrap();
        reader.deliver(Box::new(card.clone())).ok();

        let report = attempt.run_with_progress(&mut DisarmWhenWriting(reader.clone()));
        assert_eq!(report.outcome, ProtocolOutcome::LinkLost);
        assert!(report.cancelled);
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
        assert_eq!(card.radio().open_sessions(), 0);
        assert!(!session.is_active());
    }
}
