//! Wire types and framing shared by every RPC participant in metashell: the
//! daemon, the shell-hook client, the TTY host, the meta TUI, and plugin
//! subprocesses. This crate does no I/O of its own beyond the frame codec;
//! callers own the socket.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Sentinel key value recognised on the `PostRunReport` return path as a
/// no-op (I2). Issued by `PreRunQuery` whenever the key service is empty.
pub const INIT_KEY: &str = "INIT";

/// Identity tuple for one command entry, mirrored from the key service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandEntry {
    pub command: String,
    pub tty: String,
    pub timestamp: i64,
}

/// Response-format tag a plugin declares for one of its metacommands.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResponseFormat {
    ShellInjection,
    ShellInjectionList,
    Screen,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetacommandInfo {
    pub name: String,
    pub format: ResponseFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginSummary {
    pub name: String,
    pub version: String,
    pub accepts_command_reports: bool,
    pub metacommands: Vec<MetacommandInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetacommandRequest {
    pub plugin_name: String,
    pub meta_command: String,
    pub args: Vec<String>,
    /// Extra arguments the caller appends itself, e.g. `size=WxH` for `Screen`
    /// format metacommands (spec §4.5).
    pub format_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetacommandResponse {
    pub data: Vec<u8>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GetPluginInfoRequest {
    pub plugin_name_prefix: String,
    pub metacommand_name_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GetPluginInfoResponse {
    pub plugins: Vec<PluginSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitCodeEvent {
    pub key: String,
    pub exit_code: i32,
}

/// Every call the daemon accepts, shell-client service and TTY-host/TUI
/// service combined (spec §6). `NewExitCodeStream` is handled specially by
/// the transport (it upgrades the connection to a stream of
/// [`ExitCodeEvent`]) rather than returning a single [`DaemonResponse`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DaemonRequest {
    PreRunQuery(CommandEntry),
    PostRunReport { key: String, exit_code: i32 },
    RegisterCommandEntry(CommandEntry),
    NewExitCodeStream { tty: String },
    Metacommand(MetacommandRequest),
    GetPluginInfo(GetPluginInfoRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DaemonResponse {
    Key(String),
    Ack,
    MetacommandResult(MetacommandResponse),
    PluginInfo(GetPluginInfoResponse),
    /// Pushed repeatedly over a `NewExitCodeStream` connection; never sent
    /// as the reply to any other request.
    ExitCode(ExitCodeEvent),
    /// Protocol/argument violations only (spec §7): missing TTY header,
    /// empty argument on a two-arg subcommand. Expected-absence conditions
    /// (unknown key, unregistered TTY) are folded into `Ack`, never this.
    Error(String),
}

/// Handshake constants for the plugin subprocess protocol (spec §6),
/// grounded on the HashiCorp go-plugin handshake the original implementation
/// uses (`examples/original_source/pkg/plugin/proto/shared/interface.go`):
/// a magic cookie key/value plus a protocol version, exchanged before the
/// plugin prints the endpoint the host should dial.
pub const HANDSHAKE_COOKIE_KEY: &str = "METASHELL_PLUGIN";
pub const HANDSHAKE_COOKIE_VALUE: &str = "metashell-plugin-v1";
pub const HANDSHAKE_PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake {
    pub cookie_key: String,
    pub cookie_value: String,
    pub protocol_version: u32,
}

impl Handshake {
    pub fn current() -> Self {
        Self {
            cookie_key: HANDSHAKE_COOKIE_KEY.to_string(),
            cookie_value: HANDSHAKE_COOKIE_VALUE.to_string(),
            protocol_version: HANDSHAKE_PROTOCOL_VERSION,
        }
    }

    pub fn is_compatible(&self) -> bool {
        self.cookie_key == HANDSHAKE_COOKIE_KEY
            && self.cookie_value == HANDSHAKE_COOKIE_VALUE
            && self.protocol_version == HANDSHAKE_PROTOCOL_VERSION
    }
}

/// Requests the host may send a connected plugin (spec §4.2 capability set).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PluginRequest {
    Info,
    Init {
        config: Vec<u8>,
        log_dir: String,
    },
    ReportCommand {
        command: String,
        tty: String,
        timestamp: i64,
        exit_code: i32,
    },
    Metacommand {
        name: String,
        args: Vec<String>,
    },
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PluginResponse {
    Info {
        name: String,
        version: String,
        accepts_command_reports: bool,
        metacommands: Vec<MetacommandInfo>,
    },
    Ack,
    MetacommandResult(MetacommandResponse),
    Error(String),
}

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("frame exceeds maximum size of {max} bytes: {actual}")]
    TooLarge { max: u32, actual: u32 },
    #[error("connection closed while reading frame")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
}

/// Frames larger than this are rejected outright; nothing in this protocol
/// legitimately needs more (plugin list screens included).
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Writes one length-prefixed, bincode-encoded frame: a 4-byte big-endian
/// length followed by the payload. Mirrors the framing used by
/// `examples/other_examples/ade742f1_studium-ignotum-ignis-term__mac-client-src-pty-mod.rs.rs`.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = bincode::serialize(value)?;
    let len: u32 = body
        .len()
        .try_into()
        .map_err(|_| FramingError::TooLarge { max: MAX_FRAME_LEN, actual: u32::MAX })?;
    if len > MAX_FRAME_LEN {
        return Err(FramingError::TooLarge { max: MAX_FRAME_LEN, actual: len });
    }
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed frame written by [`write_frame`]. Returns
/// `Ok(None)` on a clean EOF before any bytes of the next frame arrive.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, FramingError>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(FramingError::TooLarge { max: MAX_FRAME_LEN, actual: len });
    }
    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                FramingError::Closed
            } else {
                FramingError::Io(e)
            }
        })?;
    Ok(Some(bincode::deserialize(&body)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn round_trips_a_daemon_request() {
        let (mut a, mut b) = duplex(4096);
        let req = DaemonRequest::PreRunQuery(CommandEntry {
            command: "ls -l".into(),
            tty: "/dev/pts/3".into(),
            timestamp: 1000,
        });
        write_frame(&mut a, &req).await.unwrap();
        let got: DaemonRequest = read_frame(&mut b).await.unwrap().unwrap();
        match got {
            DaemonRequest::PreRunQuery(entry) => {
                assert_eq!(entry.command, "ls -l");
                assert_eq!(entry.tty, "/dev/pts/3");
                assert_eq!(entry.timestamp, 1000);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let (a, mut b) = duplex(64);
        drop(a);
        let got: Option<DaemonResponse> = read_frame(&mut b).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = duplex(8);
        a.write_all(&(MAX_FRAME_LEN + 1).to_be_bytes()).await.unwrap();
        let err = read_frame::<_, DaemonResponse>(&mut b).await.unwrap_err();
        assert!(matches!(err, FramingError::TooLarge { .. }));
    }

    #[test]
    fn handshake_rejects_mismatched_cookie() {
        let mut h = Handshake::current();
        assert!(h.is_compatible());
        h.cookie_value = "wrong".into();
        assert!(!h.is_compatible());
    }
}
