use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::logger::Logger;
use crate::server::session::{SessionContext, spawn_session};
use crate::server::shutdown::ShutdownSignal;

/// Counting gate bounding how many sessions run at once.
#[derive(Clone, Debug)]
pub struct AdmissionGate {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl AdmissionGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently held by sessions.
    pub fn outstanding(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    /// Wait for a free slot. `None` once the gate has been closed.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.permits).acquire_owned().await.ok()
    }

    /// Resolve once every permit is back, i.e. no session is running.
    ///
    /// The permits are returned immediately; only the wait matters.
    pub async fn wait_idle(&self) {
        // `validate` keeps capacity within u32.
        let all = u32::try_from(self.capacity).unwrap_or(u32::MAX);
        let _ = self.permits.acquire_many(all).await;
    }
}

/// Where the accept loop gets its connections from.
pub(crate) trait Acceptor: Send + Sync + 'static {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl Acceptor for TcpListener {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }
}

/// Accept until shutdown fires, one permit per accepted connection.
///
/// The permit is taken before `accept` so a backlog of pending sockets can
/// never push the process past its capacity. Returns (dropping the listener)
/// once the signal is observed.
pub(crate) async fn accept_loop<A: Acceptor>(
    listener: A,
    gate: AdmissionGate,
    signal: ShutdownSignal,
    ctx: Arc<SessionContext>,
    accept_error_backoff: Duration,
    logger: Logger,
) {
    loop {
        // 1) Race a free slot against shutdown
        let permit = tokio::select! {
            biased;
            _ = signal.wait() => break,
            permit = gate.acquire() => match permit {
                Some(permit) => permit,
                None => break,
            },
        };

        // 2) Wait for the next client, still watching for shutdown
        let accepted = tokio::select! {
            biased;
            _ = signal.wait() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                // Accept and shutdown landed together; shutdown wins.
                if signal.is_fired() {
                    drop(stream);
                    break;
                }

                if let Err(e) = stream.set_nodelay(true) {
                    logger.warn(&format!("⚠️ Failed to set TCP_NODELAY for {}: {}", peer, e));
                }

                match spawn_session(stream, peer, permit, Arc::clone(&ctx)) {
                    Ok(id) => logger.info(&format!(
                        "🔌 {} connected ({}). Active connections: {}",
                        peer,
                        id,
                        ctx.registry.len()
                    )),
                    Err(e) => logger.warn(&format!("⚠️ Failed to set up session for {}: {}", peer, e)),
                }
            }
            Err(e) => {
                if signal.is_fired() {
                    break;
                }
                // No connection materialized, so hand the slot back
                drop(permit);
                logger.warn(&format!("⚠️ Failed to accept connection: {}", e));

                tokio::select! {
                    biased;
                    _ = signal.wait() => break,
                    _ = tokio::time::sleep(accept_error_backoff) => {}
                }
            }
        }
    }

    drop(listener);
    logger.info("🧹 Listener closed; no new connections will be accepted.");
}
