use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream as StdTcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::CloseError;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier for one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Anything the registry can track and later force closed.
pub trait TrackedConnection: Clone + Send + Sync + 'static {
    fn id(&self) -> ConnectionId;
    fn close(&self) -> io::Result<()>;
}

/// Non-owning reference to a live TCP connection.
///
/// Holds a duplicate of the socket descriptor so the registry can shut the
/// connection down underneath the session that owns the stream. Shutting it
/// down wakes any read or write the session is parked on.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: SocketAddr,
    socket: Arc<StdTcpStream>,
    force_closed: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub fn new(peer: SocketAddr, socket: StdTcpStream) -> Self {
        Self {
            id: ConnectionId::next(),
            peer,
            socket: Arc::new(socket),
            force_closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// True once `close` has been called through the registry.
    pub fn was_force_closed(&self) -> bool {
        self.force_closed.load(Ordering::Acquire)
    }
}

impl TrackedConnection for ConnectionHandle {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn close(&self) -> io::Result<()> {
        self.force_closed.store(true, Ordering::Release);
        self.socket.shutdown(Shutdown::Both)
    }
}

/// Lock-guarded set of the connections whose sessions are currently running.
pub struct ConnectionRegistry<H = ConnectionHandle> {
    conns: Arc<Mutex<HashMap<ConnectionId, H>>>,
}

impl<H> Clone for ConnectionRegistry<H> {
    fn clone(&self) -> Self {
        Self {
            conns: Arc::clone(&self.conns),
        }
    }
}

impl<H: TrackedConnection> Default for ConnectionRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: TrackedConnection> ConnectionRegistry<H> {
    pub fn new() -> Self {
        Self {
            conns: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    // Nothing panics while holding this lock, but a poisoned map is still usable.
    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, H>> {
        self.conns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track `handle`. Adding the same handle twice keeps one entry.
    pub fn add(&self, handle: H) {
        self.lock().insert(handle.id(), handle);
    }

    /// Stop tracking `handle`. Returns whether it was present; absence is not an error.
    pub fn remove(&self, handle: &H) -> bool {
        self.lock().remove(&handle.id()).is_some()
    }

    /// Add `handle` and hand back a guard that removes it when dropped.
    pub fn register(&self, handle: H) -> Registration<H> {
        self.add(handle.clone());
        Registration {
            registry: self.clone(),
            handle,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Close every tracked connection, holding the lock throughout.
    ///
    /// A failed close does not stop the rest; every failure is returned.
    /// Entries stay in the map until their sessions deregister.
    pub fn close_all(&self) -> CloseAll {
        let conns = self.lock();
        let snapshot: Vec<H> = conns.values().cloned().collect();

        let failures = snapshot
            .iter()
            .filter_map(|handle| {
                handle.close().err().map(|source| CloseError {
                    id: handle.id(),
                    source,
                })
            })
            .collect();

        CloseAll {
            attempted: snapshot.len(),
            failures,
        }
    }
}

/// Result of [`ConnectionRegistry::close_all`].
#[derive(Debug, Default)]
pub struct CloseAll {
    pub attempted: usize,
    pub failures: Vec<CloseError>,
}

/// Keeps a connection registered for as long as it lives.
pub struct Registration<H: TrackedConnection = ConnectionHandle> {
    registry: ConnectionRegistry<H>,
    handle: H,
}

impl<H: TrackedConnection> Registration<H> {
    pub fn handle(&self) -> &H {
        &self.handle
    }
}

impl<H: TrackedConnection> Drop for Registration<H> {
    fn drop(&mut self) {
        self.registry.remove(&self.handle);
    }
}
