//! DispatchGate - exclusive ownership of tag-arrival events
//!
//! The platform has one tag-arrival channel. Whoever holds the gate gets
//! every arrival; nobody else sees any. Arming replaces the previous owner,
//! which is told it lost the gate with [`GateEvent::Revoked`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Event delivered to the gate owner
pub enum GateEvent<T> {
    /// A tag entered the field
    Arrival(T),
    /// The gate was taken away (disarmed, revoked or re-armed by someone else)
    Revoked,
}

impl<T> fmt::Debug for GateEvent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Arrival(_) => write!(f, "Arrival(..)"),
            Self::Revoked => write!(f, "Revoked"),
        }
    }
}

/// Identifies one `arm` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(u64);

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type Consumer<T> = Box<dyn Fn(GateEvent<T>) + Send + Sync>;

struct Owner<T> {
    id: RegistrationId,
    consumer: Consumer<T>,
}

struct GateInner<T> {
    owner: Mutex<Option<Owner<T>>>,
    next_id: AtomicU64,
}

/// Router of tag arrivals to at most one consumer
///
/// Cloning yields another handle to the same gate. Consumers are called
/// with the gate locked, so they must hand the event off (e.g. over a
/// channel) and must not call back into the gate.
pub struct DispatchGate<T> {
    inner: Arc<GateInner<T>>,
}

impl<T> Clone for DispatchGate<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for DispatchGate<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DispatchGate<T> {
    /// Create an unarmed gate
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GateInner {
                owner: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Owner<T>>> {
        self.inner.owner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim the gate for `consumer`
    ///
    /// A previous owner receives [`GateEvent::Revoked`]. The returned lease
    /// releases the gate when dropped, unless it was replaced meanwhile.
    pub fn arm<F>(&self, consumer: F) -> GateLease<T>
    where
        F: Fn(GateEvent<T>) + Send + Sync + 'static,
    {
        let id = RegistrationId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let mut owner = self.lock();
        if let Some(previous) = owner.replace(Owner {
            id,
            consumer: Box::new(consumer),
        }) {
            log::debug!("Gate registration {} replaced by {}", previous.id, id);
            (previous.consumer)(GateEvent::Revoked);
        } else {
            log::debug!("Gate armed by {}", id);
        }
        GateLease {
            gate: self.clone(),
            id,
        }
    }

    /// Release the gate whoever owns it; idempotent
    ///
    /// Returns whether an owner was removed.
    pub fn disarm(&self) -> bool {
        match self.lock().take() {
            Some(previous) => {
                log::debug!("Gate disarmed (was {})", previous.id);
                (previous.consumer)(GateEvent::Revoked);
                true
            }
            None => false,
        }
    }

    /// Revoke a registration if it still owns the gate
    pub fn revoke(&self, id: RegistrationId) -> bool {
        let mut owner = self.lock();
        if owner.as_ref().map(|o| o.id) != Some(id) {
            return false;
        }
        if let Some(previous) = owner.take() {
            log::debug!("Gate registration {} revoked", id);
            (previous.consumer)(GateEvent::Revoked);
        }
        true
    }

    /// Silently release a registration if it still owns the gate
    pub fn release(&self, id: RegistrationId) -> bool {
        let mut owner = self.lock();
        if owner.as_ref().map(|o| o.id) != Some(id) {
            return false;
        }
        *owner = None;
        log::debug!("Gate released by {}", id);
        true
    }

    /// Hand a newly arrived tag to the owner
    ///
    /// Returns the tag back when nobody holds the gate.
    pub fn deliver(&self, tag: T) -> Result<(), T> {
        let owner = self.lock();
        match owner.as_ref() {
            Some(owner) => {
                log::trace!("Delivering tag to {}", owner.id);
                (owner.consumer)(GateEvent::Arrival(tag));
                Ok(())
            }
            None => {
                log::debug!("Tag arrived with no armed session");
                Err(tag)
            }
        }
    }

    /// Whether anyone holds the gate
    pub fn is_armed(&self) -> bool {
        self.lock().is_some()
    }

    /// Current owner
    pub fn owner(&self) -> Option<RegistrationId> {
        self.lock().as_ref().map(|o| o.id)
    }
}

/// Scoped ownership of a [`DispatchGate`]
///
/// Dropping the lease releases the gate on every exit path.
pub struct GateLease<T> {
    gate: DispatchGate<T>,
    id: RegistrationId,
}

impl<T> GateLease<T> {
    /// Registration this lease stands for
    pub fn id(&self) -> RegistrationId {
        self.id
    }

    /// Whether this lease still owns the gate
    pub fn is_current(&self) -> bool {
        self.gate.owner() == Some(self.id)
    }
}

impl<T> Drop for GateLease<T> {
    fn drop(&mut self) {
        self.gate.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Log = Arc<Mutex<Vec<String>>>;

    fn recorder(name: &'static str, log: &Log) -> impl Fn(GateEvent<u32>) + Send + Sync + 'static {
        let log = Arc::clone(log);
        move |event| {
            let entry = match event {
                GateEvent::Arrival(tag) => format!("{} got {}", name, tag),
                GateEvent::Revoked => format!("{} revoked", name),
            };
            log.lock().unwrap().push(entry);
        }
    }

    #[test]
    fn test_unarmed_gate_returns_tag() {
        let gate = DispatchGate::<u32>::new();
        assert_eq!(gate.deliver(7), Err(7));
        assert!(!gate.disarm());
    }

    #[test]
    fn test_arrivals_reach_only_current_owner() {
        let gate = DispatchGate::new();
        let log: Log = Arc::default();

        let first = gate.arm(recorder("first", &log));
        gate.deliver(1).unwrap();
        let second = gate.arm(recorder("second", &log));
        gate.deliver(2).unwrap();

        assert!(!first.is_current());
        assert!(second.is_current());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first got 1", "first revoked", "second got 2"]
        );
    }

    #[test]
    fn test_stale_lease_does_not_release_new_owner() {
        let gate = DispatchGate::new();
        let log: Log = Arc::default();

        let first = gate.arm(recorder("first", &log));
        let second = gate.arm(recorder("second", &log));
        drop(first);
        assert_eq!(gate.owner(), Some(second.id()));

        drop(second);
        assert!(!gate.is_armed());
        // a released owner is not told it was revoked
        assert_eq!(*log.lock().unwrap(), vec!["first revoked"]);
    }

    #[test]
    fn test_disarm_and_revoke() {
        let gate = DispatchGate::new();
        let log: Log = Arc::default();

        let lease = gate.arm(recorder("a", &log));
        assert!(gate.disarm());
        assert!(!gate.disarm());
        assert!(!gate.revoke(lease.id()));

        let lease = gate.arm(recorder("b", &log));
        assert!(gate.revoke(lease.id()));
        assert_eq!(gate.deliver(3), Err(3));
        assert_eq!(*log.lock().unwrap(), vec!["a revoked", "b revoked"]);
    }
}
