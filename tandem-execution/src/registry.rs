//! Remote object bookkeeping
//!
//! Every instantiated remote object is registered under a token. Whoever
//! unregisters the token first owns the disposal, so an object is disposed
//! at most once no matter how many paths race for it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::thread::{Thread, WeakThread};

/// Handle to one registry entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationToken(u64);

impl fmt::Display for RegistrationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where a remote object lives
#[derive(Debug, Clone)]
pub struct Registration {
    pub object_id: u64,
    pub thread: WeakThread,
    /// The thread is locked for this object
    pub exclusive: bool,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<RegistrationToken, Registration>,
    next_token: u64,
}

/// Shared table of live remote objects
#[derive(Clone, Default)]
pub struct ObjectRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, object_id: u64, thread: &Thread, exclusive: bool) -> RegistrationToken {
        let mut state = self.state.lock();
        state.next_token += 1;
        let token = RegistrationToken(state.next_token);
        state.entries.insert(
            token,
            Registration {
                object_id,
                thread: thread.downgrade(),
                exclusive,
            },
        );
        token
    }

    /// Remove an entry. Only the first call for a token gets it back.
    pub fn unregister(&self, token: RegistrationToken) -> Option<Registration> {
        self.state.lock().entries.remove(&token)
    }

    /// Whether any live object is hosted on `thread`
    pub fn has_objects_on(&self, thread: &Thread) -> bool {
        self.state
            .lock()
            .entries
            .values()
            .any(|registration| registration.thread.is(thread))
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every entry without disposing anything
    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }
}

impl fmt::Debug for ObjectRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRegistry")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockFactory;

    #[tokio::test]
    async fn test_unregister_is_exactly_once() {
        let registry = ObjectRegistry::new();
        let thread = Thread::new(MockFactory::silent()).unwrap();
        let other = Thread::new(MockFactory::silent()).unwrap();

        let token = registry.register(42, &thread, true);
        assert!(registry.has_objects_on(&thread));
        assert!(!registry.has_objects_on(&other));

        let registration = registry.unregister(token).unwrap();
        assert_eq!(registration.object_id, 42);
        assert!(registration.exclusive);
        assert_eq!(registration.thread.upgrade(), Some(thread.clone()));

        assert!(registry.unregister(token).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_registration_does_not_keep_thread_alive() {
        let registry = ObjectRegistry::new();
        let thread = Thread::new(MockFactory::silent()).unwrap();
        let token = registry.register(1, &thread, false);
        drop(thread);

        let registration = registry.unregister(token).unwrap();
        assert!(registration.thread.upgrade().is_none());
    }
}
