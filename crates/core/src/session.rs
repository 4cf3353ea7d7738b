use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{BackendError, Result};

enum State<T> {
    Uninitialized,
    Ready(Arc<T>),
    Stopped,
}

/// Owns a backend's live connection handle and enforces
/// `Uninitialized -> Ready -> Stopped`.
///
/// Operations clone the handle out under a short read lock, so concurrent
/// transfers never contend on it.
pub struct Session<T> {
    backend: &'static str,
    state: RwLock<State<T>>,
}

impl<T> Session<T> {
    pub fn new(backend: &'static str) -> Self {
        Self {
            backend,
            state: RwLock::new(State::Uninitialized),
        }
    }

    pub fn open(&self, handle: T) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match *state {
            State::Uninitialized => {
                *state = State::Ready(Arc::new(handle));
                Ok(())
            }
            State::Ready(_) => Err(self.misuse("init called twice")),
            State::Stopped => Err(self.misuse("init called after stop")),
        }
    }

    /// Fails like [`Session::open`] would, without opening anything. Lets
    /// `init` reject misuse before resolving credentials.
    pub fn ensure_unopened(&self) -> Result<()> {
        match *self.state.read().unwrap_or_else(PoisonError::into_inner) {
            State::Uninitialized => Ok(()),
            State::Ready(_) => Err(self.misuse("init called twice")),
            State::Stopped => Err(self.misuse("init called after stop")),
        }
    }

    pub fn get(&self) -> Result<Arc<T>> {
        match &*self.state.read().unwrap_or_else(PoisonError::into_inner) {
            State::Ready(handle) => Ok(Arc::clone(handle)),
            State::Uninitialized => Err(self.misuse("operation before init")),
            State::Stopped => Err(self.misuse("operation after stop")),
        }
    }

    /// Drops the handle. Stopping is terminal and repeatable.
    pub fn close(&self) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = State::Stopped;
    }

    pub fn is_ready(&self) -> bool {
        matches!(
            *self.state.read().unwrap_or_else(PoisonError::into_inner),
            State::Ready(_)
        )
    }

    fn misuse(&self, what: &str) -> BackendError {
        BackendError::Misuse(format!("{}: {what}", self.backend))
    }
}
