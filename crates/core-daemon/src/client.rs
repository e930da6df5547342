//! The other end of the wire: connecting to an already-running daemon and
//! issuing the RPCs in spec §6. Used by the shell-hook client, the TTY host
//! and the meta TUI — none of them embed a [`crate::Daemon`] of their own.

use core_protocol::{read_frame, write_frame, DaemonRequest, DaemonResponse, ExitCodeEvent};
use std::path::Path;
use thiserror::Error;
use tokio::net::UnixStream;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon socket unreachable: {0}")]
    Connect(#[source] std::io::Error),
    #[error("framing error: {0}")]
    Framing(#[from] core_protocol::FramingError),
    #[error("daemon closed the connection without a response")]
    NoResponse,
    #[error("daemon reported a protocol error: {0}")]
    Daemon(String),
}

/// Dials the daemon socket, sends one request, and reads back the matching
/// response. One connection per call: every request here is answered with
/// exactly one reply and the daemon would otherwise keep the connection open
/// reading for a next request that never comes.
pub async fn call(socket_path: &Path, request: DaemonRequest) -> Result<DaemonResponse, ClientError> {
    let mut stream = UnixStream::connect(socket_path)
        .await
        .map_err(ClientError::Connect)?;
    write_frame(&mut stream, &request).await?;
    read_frame(&mut stream).await?.ok_or(ClientError::NoResponse)
}

/// Opens the `NewExitCodeStream` server-streaming call for `tty` and returns
/// the connection positioned to read a sequence of [`ExitCodeEvent`] frames
/// until the daemon ends the stream (spec §4.4 step 3). Held open for the
/// lifetime of the TTY host's D3 task.
pub async fn open_exit_code_stream(
    socket_path: &Path,
    tty: String,
) -> Result<UnixStream, ClientError> {
    let mut stream = UnixStream::connect(socket_path)
        .await
        .map_err(ClientError::Connect)?;
    write_frame(&mut stream, &DaemonRequest::NewExitCodeStream { tty }).await?;
    Ok(stream)
}

/// Reads the next event off a stream opened with [`open_exit_code_stream`].
/// `Ok(None)` means the daemon closed the stream; an `Error` response (e.g.
/// a missing-TTY rejection surfacing late) is folded into a `Daemon` error.
pub async fn recv_exit_code(
    stream: &mut UnixStream,
) -> Result<Option<ExitCodeEvent>, ClientError> {
    match read_frame::<_, DaemonResponse>(stream).await? {
        Some(DaemonResponse::ExitCode(event)) => Ok(Some(event)),
        Some(DaemonResponse::Error(e)) => Err(ClientError::Daemon(e)),
        Some(_) => Err(ClientError::Daemon("unexpected response on exit-code stream".into())),
        None => Ok(None),
    }
}
