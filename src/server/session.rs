use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::OwnedSemaphorePermit;
use tokio::time;

use crate::error::SessionError;
use crate::logger::Logger;
use crate::protocol::{FrameReader, Message, Transform, decode, write_frame};
use crate::server::registry::{ConnectionHandle, ConnectionId, ConnectionRegistry, TrackedConnection};

/// Everything a session needs besides its own stream, shared by all sessions.
pub(crate) struct SessionContext {
    pub(crate) registry: ConnectionRegistry,
    pub(crate) transform: Transform,
    pub(crate) read_timeout: Duration,
    pub(crate) write_timeout: Duration,
    pub(crate) max_frame_bytes: usize,
    pub(crate) logger: Logger,
}

/// Register the stream and spawn its request/response loop.
///
/// The spawned task owns the stream and the admission permit. On every exit
/// path it closes the stream, then deregisters, then releases the permit, so a
/// free permit always means the registry no longer lists that connection.
pub(crate) fn spawn_session(
    stream: TcpStream,
    peer: SocketAddr,
    permit: OwnedSemaphorePermit,
    ctx: Arc<SessionContext>,
) -> io::Result<ConnectionId> {
    // Keep a duplicate descriptor for the registry so shutdown can close it.
    let std_stream = stream.into_std()?;
    let handle = ConnectionHandle::new(peer, std_stream.try_clone()?);
    let stream = TcpStream::from_std(std_stream)?;

    let registration = ctx.registry.register(handle);
    let id = registration.handle().id();

    tokio::spawn(async move {
        let handle = registration.handle();
        let result = run_session(stream, handle, &ctx).await;
        log_session_end(&ctx.logger, handle, result);

        drop(registration);
        drop(permit);
    });

    Ok(id)
}

/// Decode, transform, encode; one response per request until the stream ends.
async fn run_session(
    stream: TcpStream,
    handle: &ConnectionHandle,
    ctx: &SessionContext,
) -> Result<(), SessionError> {
    let (reader_half, mut writer_half) = stream.into_split();
    let mut frames = FrameReader::new(BufReader::new(reader_half), ctx.max_frame_bytes);

    loop {
        let frame = match time::timeout(ctx.read_timeout, frames.next_frame()).await {
            Ok(frame) => frame?,
            Err(_) => return Err(SessionError::ReadTimeout(ctx.read_timeout)),
        };
        let Some(frame) = frame else {
            return Ok(());
        };

        let msg = decode(&frame)?;
        ctx.logger.debug(&received_line(handle, &msg));

        let reply = (ctx.transform)(msg);

        match time::timeout(ctx.write_timeout, write_frame(&mut writer_half, &reply)).await {
            Ok(written) => written?,
            Err(_) => return Err(SessionError::WriteTimeout(ctx.write_timeout)),
        }
    }
}

fn received_line(handle: &ConnectionHandle, msg: &Message) -> String {
    format!(
        "📨 From {} ({}): id={} type={} source={} time={} payload={}",
        handle.peer(),
        handle.id(),
        msg.id,
        msg.kind,
        msg.source,
        msg.time.to_rfc3339(),
        msg.payload
    )
}

fn log_session_end(logger: &Logger, handle: &ConnectionHandle, result: Result<(), SessionError>) {
    let peer = handle.peer();
    let id = handle.id();

    if handle.was_force_closed() {
        logger.info(&format!("🛑 {} ({}) disconnected due to shutdown.", peer, id));
        return;
    }

    match result {
        Ok(()) => logger.info(&format!("⚠️ {} ({}) disconnected gracefully.", peer, id)),
        Err(e @ SessionError::Decode(_)) => {
            logger.warn(&format!("❌ Error decoding message from {} ({}): {}", peer, id, e))
        }
        Err(e @ SessionError::Encode(_)) | Err(e @ SessionError::WriteTimeout(_)) => {
            logger.warn(&format!("❌ Error sending response to {} ({}): {}", peer, id, e))
        }
        Err(e @ SessionError::ReadTimeout(_)) => {
            logger.info(&format!("⏰ {} ({}) timed out: {}", peer, id, e))
        }
        Err(e) => logger.warn(&format!("❌ Error reading from {} ({}): {}", peer, id, e)),
    }
}
