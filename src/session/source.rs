//! One-caller-at-a-time access to a session reader.

use std::time::Duration;

use tokio::sync::Mutex;

use super::SessionConnectionReader;
use crate::{
    error::CommunicationError,
    framing::SessionDecoder,
    message::Message,
    timeout::TimeoutHelper,
};

/// Serializes receives over a [`SessionConnectionReader`].
///
/// Waiting for the lock counts against the caller's timeout. The reader can
/// be taken out for connection reuse, after which receives fail.
pub struct SynchronizedMessageSource<D> {
    reader: Mutex<Option<SessionConnectionReader<D>>>,
}

impl<D: SessionDecoder> SynchronizedMessageSource<D> {
    /// Wrap `reader`.
    pub fn new(reader: SessionConnectionReader<D>) -> Self {
        Self {
            reader: Mutex::new(Some(reader)),
        }
    }

    /// Receive the next message within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`CommunicationError::Timeout`] naming `"receive"` if the lock
    /// or the read does not complete in time, and whatever the reader
    /// reports otherwise.
    pub async fn receive(&self, timeout: Duration) -> Result<Option<Message>, CommunicationError> {
        let helper = TimeoutHelper::new(timeout);
        let mut slot = helper.run("receive", self.reader.lock()).await?;
        let reader = slot.as_mut().ok_or(CommunicationError::Aborted("session reader"))?;
        helper.run("receive", reader.receive()).await?
    }

    /// Wait up to `timeout` for the next receive to be ready.
    ///
    /// Returns `false` if nothing arrived in time. A message, end of session
    /// or error that did arrive is kept for the next
    /// [`receive`](Self::receive).
    ///
    /// # Errors
    ///
    /// Returns [`CommunicationError::Timeout`] naming `"wait_for_message"`
    /// if another caller holds the reader past the deadline.
    pub async fn wait_for_message(&self, timeout: Duration) -> Result<bool, CommunicationError> {
        let helper = TimeoutHelper::new(timeout);
        let mut slot = helper.run("wait_for_message", self.reader.lock()).await?;
        let reader = slot.as_mut().ok_or(CommunicationError::Aborted("session reader"))?;
        Ok(helper.run("wait_for_message", reader.wait_for_message()).await.is_ok())
    }

    /// Take the reader out, waiting for any in-flight receive.
    pub async fn take(&self) -> Option<SessionConnectionReader<D>> { self.reader.lock().await.take() }
}

impl<D> std::fmt::Debug for SynchronizedMessageSource<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynchronizedMessageSource").finish_non_exhaustive()
    }
}
