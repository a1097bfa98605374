//! Cancellation and deadlines for blocking operations.
//!
//! A [`Context`] is cheap to clone and may be waited on from any number of
//! threads at once. Cancelling drops the only sender of an internal channel,
//! which wakes every waiter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, after, at, bounded, never, select};
use parking_lot::Mutex;

use crate::error::Error;

struct CancelState {
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

/// Carries an optional cancellation signal and an optional deadline.
#[derive(Clone, Default)]
pub struct Context {
    cancel: Option<Arc<CancelState>>,
    deadline: Option<Instant>,
}

/// Cancels the [`Context`] it was created with, and every clone of it.
///
/// Dropping the handle does not cancel.
#[derive(Clone)]
pub struct CancelHandle(Arc<CancelState>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.tx.lock().take();
    }
}

/// Outcome of waiting on a channel under a context.
pub(crate) enum Waited<T> {
    Ready(T),
    Disconnected,
    Interrupted(Error),
}

impl Context {
    /// Never cancelled, no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context that is done when the returned handle is cancelled.
    pub fn cancellable() -> (Self, CancelHandle) {
        let (tx, rx) = bounded(0);
        let state = Arc::new(CancelState {
            tx: Mutex::new(Some(tx)),
            rx,
        });
        let ctx = Self {
            cancel: Some(state.clone()),
            deadline: None,
        };
        (ctx, CancelHandle(state))
    }

    /// Add a deadline `timeout` from now, keeping any earlier one.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.tx.lock().is_none())
    }

    /// Why the context is done, or `None` while it is still live.
    pub fn err(&self) -> Option<Error> {
        if self.is_cancelled() {
            Some(Error::Cancelled)
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some(Error::TimedOut)
        } else {
            None
        }
    }

    /// Block until the context is done.
    pub fn done(&self) -> Error {
        match self.recv(&never::<()>()) {
            Waited::Interrupted(err) => err,
            Waited::Ready(()) | Waited::Disconnected => Error::Cancelled,
        }
    }

    /// Sleep for `dur` unless the context finishes first.
    pub fn sleep(&self, dur: Duration) -> Result<(), Error> {
        match self.recv(&after(dur)) {
            Waited::Ready(_) | Waited::Disconnected => Ok(()),
            Waited::Interrupted(err) => Err(err),
        }
    }

    fn cancel_rx(&self) -> Receiver<()> {
        match &self.cancel {
            Some(state) => state.rx.clone(),
            None => never(),
        }
    }

    fn deadline_rx(&self) -> Receiver<Instant> {
        match self.deadline {
            Some(deadline) => at(deadline),
            None => never(),
        }
    }

    /// Receive from `rx`, giving up when the context is done.
    ///
    /// A value that is already waiting wins over cancellation.
    pub(crate) fn recv<T>(&self, rx: &Receiver<T>) -> Waited<T> {
        if let Ok(value) = rx.try_recv() {
            return Waited::Ready(value);
        }
        if let Some(err) = self.err() {
            return Waited::Interrupted(err);
        }
        let cancel = self.cancel_rx();
        let deadline = self.deadline_rx();
        select! {
            recv(rx) -> msg => match msg {
                Ok(value) => Waited::Ready(value),
                Err(_) => Waited::Disconnected,
            },
            recv(cancel) -> _ => Waited::Interrupted(Error::Cancelled),
            recv(deadline) -> _ => Waited::Interrupted(Error::TimedOut),
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.deadline)
            .finish()
    }
}
