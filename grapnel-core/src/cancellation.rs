use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::status::Status;

/// Why a call was cancelled. Observers use this to derive the right status:
/// a fired deadline reports `deadline-exceeded` locally while everything
/// else reports `cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Cancelled explicitly by the local side.
    Local,
    /// The call's deadline expired.
    DeadlineExceeded,
    /// The transport reset or dropped the stream.
    TransportLost,
}

impl CancelReason {
    /// The status a task that observed this cancellation should report.
    pub fn to_status(self) -> Status {
        match self {
            CancelReason::Local => Status::cancelled("call was cancelled"),
            CancelReason::DeadlineExceeded => Status::deadline_exceeded("deadline exceeded"),
            CancelReason::TransportLost => Status::cancelled("stream was reset"),
        }
    }
}

/// Identifier of a registered cancellation callback.
///
/// [`CallbackId::SENTINEL`] is returned when the token was already cancelled
/// and the callback ran synchronously; it never matches a live registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackId(u64);

impl CallbackId {
    pub const SENTINEL: CallbackId = CallbackId(0);
}

type Callback = Box<dyn FnOnce(CancelReason) + Send>;

struct State {
    cancelled: Option<CancelReason>,
    callbacks: Vec<(u64, Callback)>,
    next_id: u64,
}

struct Shared {
    state: Mutex<State>,
    signal: watch::Sender<Option<CancelReason>>,
}

/// One-shot, per-call cancellation fan-out.
///
/// The token transitions from live to cancelled exactly once. Any number of
/// callbacks may be registered and any number of tasks may suspend in
/// [`await_cancelled`](CancellationToken::await_cancelled); on cancellation
/// every callback is invoked once and every waiter is resumed once.
/// Callbacks run outside the internal lock and must not block.
#[derive(Clone)]
pub struct CancellationToken {
    shared: Arc<Shared>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        CancellationToken::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(None);
        CancellationToken {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    cancelled: None,
                    callbacks: Vec::new(),
                    next_id: 1,
                }),
                signal,
            }),
        }
    }

    /// Cancel the call. Idempotent: only the first call has any effect, and
    /// it reports `true`.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let callbacks = {
            let mut state = self.shared.state.lock().expect("cancellation lock poisoned");
            if state.cancelled.is_some() {
                return false;
            }
            state.cancelled = Some(reason);
            std::mem::take(&mut state.callbacks)
        };

        // Resume waiters first, then drain callbacks, all outside the lock.
        self.shared.signal.send_replace(Some(reason));
        for (_, callback) in callbacks {
            callback(reason);
        }
        true
    }

    /// Register a callback to run on cancellation.
    ///
    /// If the token is already cancelled the callback runs synchronously and
    /// [`CallbackId::SENTINEL`] is returned; otherwise the returned id can be
    /// passed to [`remove_callback`](CancellationToken::remove_callback).
    pub fn add_callback(&self, callback: impl FnOnce(CancelReason) + Send + 'static) -> CallbackId {
        let reason = {
            let mut state = self.shared.state.lock().expect("cancellation lock poisoned");
            match state.cancelled {
                Some(reason) => Some(reason),
                None => {
                    let id = state.next_id;
                    state.next_id += 1;
                    state.callbacks.push((id, Box::new(callback)));
                    return CallbackId(id);
                }
            }
        };
        if let Some(reason) = reason {
            callback(reason);
        }
        CallbackId::SENTINEL
    }

    /// Remove a registered callback; returns whether it was still pending.
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        let mut state = self.shared.state.lock().expect("cancellation lock poisoned");
        let before = state.callbacks.len();
        state.callbacks.retain(|(cb_id, _)| *cb_id != id.0);
        state.callbacks.len() != before
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared
            .state
            .lock()
            .expect("cancellation lock poisoned")
            .cancelled
            .is_some()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.shared
            .state
            .lock()
            .expect("cancellation lock poisoned")
            .cancelled
    }

    /// Suspend until the call is cancelled. Resumes exactly once per waiter;
    /// a waiter whose own task is cancelled simply drops the future.
    pub async fn await_cancelled(&self) -> CancelReason {
        let mut rx = self.shared.signal.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            // The sender lives inside our shared state, so it cannot close
            // while this token is alive.
            let _ = rx.changed().await;
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.reason())
            .finish()
    }
}
