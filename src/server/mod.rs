// === IMPORTS ===

// Standard library type for holding an IP address and port together.
use std::net::SocketAddr;

// Shared ownership of the session context, plus the slots written once at start.
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

// Tokio's non-blocking TCP listener and the handle of the accept task.
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

// Deadline arithmetic for shutdown.
use tokio::time::{self, Duration, Instant};

// === MODULES ===

pub mod admission;   // counting gate + accept loop
pub mod registry;    // live connection tracking
mod session;         // per-connection request/response loop
pub mod shutdown;    // stop signal, phases, report

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::logger::Logger;
use crate::protocol::{Transform, default_transform};

use crate::server::admission::{AdmissionGate, accept_loop};
use crate::server::registry::ConnectionRegistry;
use crate::server::session::SessionContext;
use crate::server::shutdown::{PhaseCell, ShutdownPhase, ShutdownReport, ShutdownSignal};

// === SERVER ===

/// Bounded-concurrency echo server.
///
/// `start` binds and spawns the accept loop; `shutdown` stops accepting,
/// force closes every open connection and, when `wait_for_sessions` is set,
/// waits for the session tasks to exit within the deadline.
pub struct Server {
    config: ServerConfig,
    logger: Logger,
    gate: AdmissionGate,
    signal: ShutdownSignal,
    phase: PhaseCell,
    ctx: Arc<SessionContext>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: OnceLock<SocketAddr>,
}

impl Server {
    /// Server that echoes every message with a fresh receive timestamp.
    pub fn new(config: ServerConfig, logger: Logger) -> Self {
        Self::with_transform(config, logger, default_transform())
    }

    /// Server that applies `transform` to every decoded message before replying.
    pub fn with_transform(config: ServerConfig, logger: Logger, transform: Transform) -> Self {
        let ctx = Arc::new(SessionContext {
            registry: ConnectionRegistry::new(),
            transform,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            max_frame_bytes: config.max_frame_bytes,
            logger: logger.clone(),
        });

        Self {
            gate: AdmissionGate::new(config.max_connections),
            signal: ShutdownSignal::new(),
            phase: PhaseCell::new(),
            ctx,
            accept_task: Mutex::new(None),
            local_addr: OnceLock::new(),
            config,
            logger,
        }
    }

    /// Bind the listener and start accepting. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        if self.phase.get() != ShutdownPhase::Serving {
            return Err(ServerError::ShuttingDown);
        }
        if self.local_addr.get().is_some() {
            return Err(ServerError::AlreadyStarted);
        }
        self.config.validate()?;

        // Open a TCP listener on that address
        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local = listener.local_addr()?;

        if self.local_addr.set(local).is_err() {
            return Err(ServerError::AlreadyStarted);
        }

        self.logger.info(&format!(
            "🚀 Rust server listening on {} (max {} connections)",
            local,
            self.gate.capacity()
        ));

        let task = tokio::spawn(accept_loop(
            listener,
            self.gate.clone(),
            self.signal.clone(),
            Arc::clone(&self.ctx),
            Duration::from_millis(self.config.accept_error_backoff_ms),
            self.logger.clone(),
        ));
        *self.accept_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);

        Ok(local)
    }

    /// Stop the server within `deadline`.
    ///
    /// Serving -> Draining: fire the signal and wait for the accept loop to
    /// drop the listener. Draining -> Stopped: close every registered
    /// connection. With `wait_for_sessions`, then wait until every session has
    /// released its permit; `DeadlineExceeded` means some had not by the
    /// deadline. Without it, return as soon as the closes are issued, failing
    /// only if the deadline had already passed. Calls after the first are no-ops.
    pub async fn shutdown(&self, deadline: Duration) -> Result<ShutdownReport, ServerError> {
        let deadline_at = Instant::now() + deadline;

        if !self.phase.advance(ShutdownPhase::Serving, ShutdownPhase::Draining) {
            self.logger.debug("Shutdown already requested; ignoring.");
            return Ok(ShutdownReport::default());
        }

        self.logger.warn(&format!("🛑 Shutdown initiated (deadline {:?}).", deadline));
        self.signal.fire();

        // Listener is dropped when the accept loop returns
        let accept_task = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut task) = accept_task {
            match time::timeout_at(deadline_at, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => self.logger.error(&format!("Accept loop ended abnormally: {}", e)),
                Err(_) => {
                    self.logger.warn("Accept loop did not stop in time; aborting it.");
                    task.abort();
                }
            }
        }

        let outcome = self.ctx.registry.close_all();
        for failure in &outcome.failures {
            self.logger.warn(&format!("❌ Error closing connection: {}", failure));
        }
        self.logger.info(&format!(
            "🧹 Closed {} open connection(s), {} failure(s).",
            outcome.attempted,
            outcome.failures.len()
        ));
        self.phase.advance(ShutdownPhase::Draining, ShutdownPhase::Stopped);

        let mut report = ShutdownReport {
            closed: outcome.attempted,
            close_failures: outcome.failures,
            drained: false,
        };

        if self.config.wait_for_sessions {
            if time::timeout_at(deadline_at, self.gate.wait_idle()).await.is_err() {
                return Err(self.deadline_exceeded(deadline));
            }
            report.drained = true;
            self.logger.info("✅ All sessions drained.");
        } else if Instant::now() >= deadline_at {
            return Err(self.deadline_exceeded(deadline));
        }

        Ok(report)
    }

    fn deadline_exceeded(&self, deadline: Duration) -> ServerError {
        let outstanding = self.gate.outstanding();
        self.logger.error(&format!(
            "⏰ Shutdown deadline {:?} exceeded; {} session(s) still running.",
            deadline, outstanding
        ));
        ServerError::DeadlineExceeded {
            deadline,
            outstanding,
        }
    }

    /// Connections currently registered.
    pub fn active_connections(&self) -> usize {
        self.ctx.registry.len()
    }

    pub fn phase(&self) -> ShutdownPhase {
        self.phase.get()
    }

    /// Bound address, once `start` has succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

// === RUN_SERVER ===

/// Run until SIGINT/SIGTERM, then shut down with the configured deadline.
///
/// Only bind failures and shutdown deadline failures come back as errors.
pub async fn run_server(config: ServerConfig, logger: Logger) -> Result<(), ServerError> {
    let deadline = config.shutdown_timeout;
    let server = Server::new(config, logger.clone());
    server.start().await?;

    wait_for_termination(&logger).await?;

    let report = server.shutdown(deadline).await?;
    logger.info(&format!(
        "👋 Server stopped: {} connection(s) closed, {} close failure(s), drained={}.",
        report.closed,
        report.close_failures.len(),
        report.drained
    ));
    Ok(())
}

/// Resolve on Ctrl+C, or SIGTERM on unix.
async fn wait_for_termination(logger: &Logger) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    logger.warn("🛑 Termination signal received, shutting down.");
    Ok(())
}
