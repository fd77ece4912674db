//! Lifecycle state shared by channels and listeners.

use std::fmt;

use parking_lot::Mutex;

use crate::error::CommunicationError;

/// Lifecycle of a communication object.
///
/// `Faulted` is absorbing except for [`CommunicationObject::abort`], which
/// moves any state to `Closed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommunicationState {
    /// Constructed but not yet opened.
    Created,
    /// An open is in progress.
    Opening,
    /// Usable.
    Opened,
    /// A graceful close is in progress.
    Closing,
    /// Closed or aborted.
    Closed,
    /// Failed; only abort remains.
    Faulted,
}

impl fmt::Display for CommunicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "Created",
            Self::Opening => "Opening",
            Self::Opened => "Opened",
            Self::Closing => "Closing",
            Self::Closed => "Closed",
            Self::Faulted => "Faulted",
        };
        f.write_str(name)
    }
}

/// Thread-safe state cell enforcing the lifecycle transitions.
#[derive(Debug)]
pub struct CommunicationObject {
    name: &'static str,
    state: Mutex<CommunicationState>,
}

impl CommunicationObject {
    /// A new object in the `Created` state, named `name` in errors.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(CommunicationState::Created),
        }
    }

    /// A new object that starts `Opened`.
    #[must_use]
    pub fn opened(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(CommunicationState::Opened),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> CommunicationState { *self.state.lock() }

    fn invalid(&self, state: CommunicationState) -> CommunicationError {
        if state == CommunicationState::Faulted {
            CommunicationError::ObjectFaulted(self.name)
        } else {
            CommunicationError::InvalidState {
                object: self.name,
                state,
            }
        }
    }

    /// Move from `Created` to `Opening`.
    ///
    /// # Errors
    ///
    /// Fails with [`CommunicationError::InvalidState`] (or `ObjectFaulted`)
    /// from any other state.
    pub fn begin_open(&self) -> Result<(), CommunicationError> {
        let mut state = self.state.lock();
        if *state != CommunicationState::Created {
            return Err(self.invalid(*state));
        }
        *state = CommunicationState::Opening;
        Ok(())
    }

    /// Move from `Opening` to `Opened`.
    ///
    /// # Errors
    ///
    /// Fails if the object was faulted or aborted while opening.
    pub fn complete_open(&self) -> Result<(), CommunicationError> {
        let mut state = self.state.lock();
        if *state != CommunicationState::Opening {
            return Err(self.invalid(*state));
        }
        *state = CommunicationState::Opened;
        Ok(())
    }

    /// Fail unless the object is `Opened`.
    ///
    /// # Errors
    ///
    /// [`CommunicationError::ObjectFaulted`] when faulted, otherwise
    /// [`CommunicationError::InvalidState`].
    pub fn ensure_opened(&self) -> Result<(), CommunicationError> {
        let state = self.state();
        if state == CommunicationState::Opened {
            Ok(())
        } else {
            Err(self.invalid(state))
        }
    }

    /// Start a graceful close.
    ///
    /// Returns `true` when the caller should run the close handshake. An
    /// object that never opened is closed on the spot, and closing an
    /// object already closing or closed is a no-op; both return `false`.
    ///
    /// # Errors
    ///
    /// Fails while an open is in progress or once faulted.
    pub fn begin_close(&self) -> Result<bool, CommunicationError> {
        let mut state = self.state.lock();
        match *state {
            CommunicationState::Opened => {
                *state = CommunicationState::Closing;
                Ok(true)
            }
            CommunicationState::Created => {
                *state = CommunicationState::Closed;
                Ok(false)
            }
            CommunicationState::Closing | CommunicationState::Closed => Ok(false),
            other => Err(self.invalid(other)),
        }
    }

    /// Finish a graceful close. Has no effect on a faulted object.
    pub fn complete_close(&self) {
        let mut state = self.state.lock();
        if *state != CommunicationState::Faulted {
            *state = CommunicationState::Closed;
        }
    }

    /// Fault the object. Returns `true` if this call caused the transition.
    pub fn fault(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            CommunicationState::Closed | CommunicationState::Faulted => false,
            _ => {
                *state = CommunicationState::Faulted;
                true
            }
        }
    }

    /// Close without a handshake. Returns `true` unless already closed.
    pub fn abort(&self) -> bool {
        let mut state = self.state.lock();
        if *state == CommunicationState::Closed {
            return false;
        }
        *state = CommunicationState::Closed;
        true
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn full_lifecycle() {
        let object = CommunicationObject::new("channel");
        object.begin_open().expect("created");
        object.complete_open().expect("opening");
        object.ensure_opened().expect("opened");
        assert!(object.begin_close().expect("opened"));
        assert!(!object.begin_close().expect("already closing"));
        object.complete_close();
        assert_eq!(object.state(), CommunicationState::Closed);
    }

    #[test]
    fn faulted_state_absorbs_everything_but_abort() {
        let object = CommunicationObject::opened("channel");
        assert!(object.fault());
        assert!(!object.fault());
        object.complete_close();
        assert_eq!(object.state(), CommunicationState::Faulted);
        assert!(matches!(
            object.ensure_opened(),
            Err(CommunicationError::ObjectFaulted("channel"))
        ));
        assert!(matches!(
            object.begin_close(),
            Err(CommunicationError::ObjectFaulted(_))
        ));
        assert!(object.abort());
        assert_eq!(object.state(), CommunicationState::Closed);
    }

    #[rstest]
    #[case::created(CommunicationState::Created)]
    #[case::opening(CommunicationState::Opening)]
    #[case::closed(CommunicationState::Closed)]
    fn ensure_opened_reports_the_state(#[case] state: CommunicationState) {
        let object = CommunicationObject::new("listener");
        *object.state.lock() = state;
        match object.ensure_opened() {
            Err(CommunicationError::InvalidState { object, state: seen }) => {
                assert_eq!(object, "listener");
                assert_eq!(seen, state);
            }
            other => panic!("expected InvalidState, got {other:?}"),
        }
    }

    #[test]
    fn closing_an_unopened_object_skips_the_handshake() {
        let object = CommunicationObject::new("channel");
        assert!(!object.begin_close().expect("created"));
        assert_eq!(object.state(), CommunicationState::Closed);
        assert!(object.begin_open().is_err());
    }
}
