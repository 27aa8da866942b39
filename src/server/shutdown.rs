use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::watch;

use crate::error::CloseError;

/// One-shot, broadcast-once stop flag.
///
/// Unlike a broadcast channel, a task that starts waiting after the signal
/// fired still sees it.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal. Returns `true` only for the call that flipped it.
    pub fn fire(&self) -> bool {
        self.tx.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        })
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal has fired, immediately if it already has.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this only returns once fired.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

/// Where the server is in its serve/stop lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShutdownPhase {
    Serving = 0,
    Draining = 1,
    Stopped = 2,
}

impl ShutdownPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Serving,
            1 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serving => write!(f, "Serving"),
            Self::Draining => write!(f, "Draining"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Atomic holder for the current phase. Transitions only move forward.
#[derive(Debug)]
pub(crate) struct PhaseCell(AtomicU8);

impl PhaseCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(ShutdownPhase::Serving as u8))
    }

    pub(crate) fn get(&self) -> ShutdownPhase {
        ShutdownPhase::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move `from -> to`; fails if another caller already moved on.
    pub(crate) fn advance(&self, from: ShutdownPhase, to: ShutdownPhase) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// What a call to `Server::shutdown` did.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Connections that were still registered when close-all ran.
    pub closed: usize,
    /// Connections whose close failed; the rest were still closed.
    pub close_failures: Vec<CloseError>,
    /// Whether every session task was seen to exit before returning.
    pub drained: bool,
}
