//! Binds the key service and plugin host to a Unix socket and answers every
//! RPC in spec §6: `PreRunQuery`, `PostRunReport`, `RegisterCommandEntry`,
//! `NewExitCodeStream`, `Metacommand`, `GetPluginInfo`.
//!
//! Startup order follows the "bind last" discipline (spec §4.3, §9 pattern
//! 1): stale-socket cleanup and plugin discovery happen before the listener
//! is ever bound, so a client dialing the socket never observes a daemon that
//! isn't ready to answer.

pub mod client;

use core_keyservice::{CommandVector, KeyService};
use core_protocol::{
    read_frame, write_frame, CommandEntry, DaemonRequest, DaemonResponse, ExitCodeEvent,
    GetPluginInfoRequest, GetPluginInfoResponse, MetacommandRequest, MetacommandResponse,
    PluginSummary, INIT_KEY,
};
use core_pluginhost::PluginHost;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub plugins_dir: PathBuf,
    pub root_dir: PathBuf,
}

/// Sending half kept per registered TTY; bounded to 1 since the TTY host
/// only ever has one outstanding command at a time (spec §5 STR task).
struct ExitCodeStream {
    sender: mpsc::Sender<ExitCodeEvent>,
}

/// Shared daemon state. Cheap to clone via `Arc<Daemon>`; every method takes
/// `&self` so multiple connection-handler tasks can hold it concurrently.
pub struct Daemon {
    key_service: KeyService,
    plugin_host: PluginHost,
    exit_streams: Mutex<HashMap<String, ExitCodeStream>>,
}

impl Daemon {
    pub fn new(plugins_dir: impl Into<PathBuf>, root_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            key_service: KeyService::new(),
            plugin_host: PluginHost::new(plugins_dir, root_dir),
            exit_streams: Mutex::new(HashMap::new()),
        })
    }

    pub async fn reload_plugins(&self) -> usize {
        self.plugin_host.reload().await
    }

    /// `PreRunQuery` (spec §4.3, I2): returns `INIT` whenever the key
    /// service has no same-TTY candidate, never a caller-visible error.
    pub fn pre_run_query(&self, entry: CommandEntry) -> String {
        let vector = CommandVector::new(entry.tty, entry.command, entry.timestamp);
        let key = self.key_service.lookup(&vector);
        if key.is_empty() {
            INIT_KEY.to_string()
        } else {
            key
        }
    }

    /// `RegisterCommandEntry` (spec §4.3).
    pub fn register_command_entry(&self, entry: CommandEntry) -> String {
        let vector = CommandVector::new(entry.tty, entry.command, entry.timestamp);
        self.key_service.register(vector)
    }

    /// `PostRunReport` (spec §4.3). The `INIT` sentinel is a silent no-op
    /// (I2); an unknown key is logged and otherwise ignored rather than
    /// surfaced as an error, since the shell side has no useful recovery
    /// from a report for a command it never saw paired. Exit-code delivery
    /// and plugin command-report fan-out both run as detached tasks so this
    /// call returns as soon as the key has been redeemed (spec §5 FAN-A/
    /// FAN-B).
    pub async fn post_run_report(self: &Arc<Self>, key: String, exit_code: i32) {
        if key == INIT_KEY {
            tracing::debug!(target: "daemon.postrun", "got INIT, nothing to report");
            return;
        }

        let vector = match self.key_service.redeem(&key) {
            Some(v) => v,
            None => {
                tracing::warn!(target: "daemon.postrun", key = %key, "no vector found for key");
                return;
            }
        };

        let this = Arc::clone(self);
        let tty = vector.tty.clone();
        let send_key = key.clone();
        tokio::spawn(async move {
            this.deliver_exit_code(&tty, send_key, exit_code).await;
        });

        let this = Arc::clone(self);
        let command = vector.command.clone();
        let tty = vector.tty.clone();
        let timestamp = vector.timestamp;
        tokio::spawn(async move {
            this.plugin_host
                .command_report(&command, &tty, timestamp, exit_code)
                .await;
        });
    }

    async fn deliver_exit_code(&self, tty: &str, key: String, exit_code: i32) {
        let sender = {
            let streams = self.exit_streams.lock().expect("exit stream map poisoned");
            streams.get(tty).map(|s| s.sender.clone())
        };
        match sender {
            Some(sender) => {
                if sender.send(ExitCodeEvent { key, exit_code }).await.is_err() {
                    tracing::warn!(target: "daemon.postrun", tty, "exit code stream receiver dropped");
                }
            }
            None => {
                tracing::warn!(target: "daemon.postrun", tty, "got post run report for a non-connected tty");
            }
        }
    }

    /// `NewExitCodeStream` (spec §4.3): registers (and replaces any
    /// previous) exit-code channel for `tty`, returning the receiving half
    /// for the caller to forward over the wire.
    pub fn register_exit_code_stream(&self, tty: String) -> mpsc::Receiver<ExitCodeEvent> {
        let (tx, rx) = mpsc::channel(1);
        let mut streams = self.exit_streams.lock().expect("exit stream map poisoned");
        tracing::info!(target: "daemon.stream", tty = %tty, "registered new tty");
        streams.insert(tty, ExitCodeStream { sender: tx });
        rx
    }

    pub fn deregister_exit_code_stream(&self, tty: &str) {
        self.exit_streams
            .lock()
            .expect("exit stream map poisoned")
            .remove(tty);
    }

    /// `Metacommand` (spec §4.3). `format_args` (e.g. the `size=WxH` the TUI
    /// appends for `SCREEN`-format metacommands, spec §4.5) rides along after
    /// the caller-supplied `args`.
    pub async fn metacommand(&self, req: MetacommandRequest) -> MetacommandResponse {
        let mut args = req.args;
        args.extend(req.format_args);
        match self
            .plugin_host
            .metacommand(&req.plugin_name, &req.meta_command, args)
            .await
        {
            Ok(response) => response,
            Err(e) => MetacommandResponse {
                data: Vec::new(),
                error: Some(e.to_string()),
            },
        }
    }

    /// `GetPluginInfo` (spec §4.3).
    pub async fn get_plugin_info(&self, req: GetPluginInfoRequest) -> GetPluginInfoResponse {
        let plugins: Vec<PluginSummary> = self
            .plugin_host
            .get_plugin_info(&req.plugin_name_prefix, &req.metacommand_name_prefix)
            .await;
        GetPluginInfoResponse { plugins }
    }
}

/// Removes a stale socket file left behind by an unclean shutdown, binds the
/// listener, and serves connections until `shutdown` resolves. Plugin
/// discovery must have already happened (via [`Daemon::reload_plugins`])
/// before calling this — binding last means the socket only appears once
/// the daemon can actually answer every RPC.
pub async fn serve(
    daemon: Arc<Daemon>,
    socket_path: &std::path::Path,
    shutdown: impl std::future::Future<Output = ()>,
) -> anyhow::Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    let listener = UnixListener::bind(socket_path)?;
    tracing::info!(target: "daemon.startup", socket = %socket_path.display(), "listening");

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                tracing::info!(target: "daemon.shutdown", "shutting down");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let daemon = Arc::clone(&daemon);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(daemon, stream).await {
                                tracing::warn!(target: "daemon.connection", error = %e, "connection ended with an error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(target: "daemon.accept", error = %e, "accept failed");
                    }
                }
            }
        }
    }

    let _ = std::fs::remove_file(socket_path);
    Ok(())
}

async fn handle_connection(daemon: Arc<Daemon>, mut stream: UnixStream) -> anyhow::Result<()> {
    loop {
        let request: Option<DaemonRequest> = read_frame(&mut stream).await?;
        let request = match request {
            Some(r) => r,
            None => return Ok(()),
        };

        match request {
            DaemonRequest::PreRunQuery(entry) => {
                let key = daemon.pre_run_query(entry);
                write_frame(&mut stream, &DaemonResponse::Key(key)).await?;
            }
            DaemonRequest::RegisterCommandEntry(entry) => {
                let key = daemon.register_command_entry(entry);
                write_frame(&mut stream, &DaemonResponse::Key(key)).await?;
            }
            DaemonRequest::PostRunReport { key, exit_code } => {
                daemon.post_run_report(key, exit_code).await;
                write_frame(&mut stream, &DaemonResponse::Ack).await?;
            }
            DaemonRequest::Metacommand(req) => {
                let result = daemon.metacommand(req).await;
                write_frame(&mut stream, &DaemonResponse::MetacommandResult(result)).await?;
            }
            DaemonRequest::GetPluginInfo(req) => {
                let result = daemon.get_plugin_info(req).await;
                write_frame(&mut stream, &DaemonResponse::PluginInfo(result)).await?;
            }
            DaemonRequest::NewExitCodeStream { tty } => {
                if tty.is_empty() {
                    write_frame(
                        &mut stream,
                        &DaemonResponse::Error("no tty given in metadata".into()),
                    )
                    .await?;
                    continue;
                }
                let mut rx = daemon.register_exit_code_stream(tty.clone());
                while let Some(event) = rx.recv().await {
                    if write_frame(&mut stream, &DaemonResponse::ExitCode(event)).await.is_err() {
                        break;
                    }
                }
                daemon.deregister_exit_code_stream(&tty);
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_protocol::CommandEntry;

    #[tokio::test]
    async fn init_sentinel_is_a_silent_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        let daemon = Daemon::new(tmp.path().join("plugins"), tmp.path());
        daemon.reload_plugins().await;
        daemon.post_run_report(INIT_KEY.to_string(), 0).await;
    }

    #[tokio::test]
    async fn pre_run_query_on_empty_service_returns_init() {
        let tmp = tempfile::tempdir().unwrap();
        let daemon = Daemon::new(tmp.path().join("plugins"), tmp.path());
        let key = daemon.pre_run_query(CommandEntry {
            command: "ls".into(),
            tty: "/dev/pts/3".into(),
            timestamp: 1,
        });
        assert_eq!(key, INIT_KEY);
    }

    #[tokio::test]
    async fn register_then_query_round_trips_a_key() {
        let tmp = tempfile::tempdir().unwrap();
        let daemon = Daemon::new(tmp.path().join("plugins"), tmp.path());
        let entry = CommandEntry {
            command: "ls -l".into(),
            tty: "/dev/pts/3".into(),
            timestamp: 1000,
        };
        let registered = daemon.register_command_entry(entry.clone());
        let queried = daemon.pre_run_query(entry);
        assert_eq!(registered, queried);
    }

    #[tokio::test]
    async fn exit_code_delivery_for_an_unconnected_tty_is_swallowed() {
        let tmp = tempfile::tempdir().unwrap();
        let daemon = Daemon::new(tmp.path().join("plugins"), tmp.path());
        let entry = CommandEntry {
            command: "ls".into(),
            tty: "/dev/pts/9".into(),
            timestamp: 1,
        };
        let key = daemon.register_command_entry(entry);
        daemon.post_run_report(key, 0).await;
    }

    #[tokio::test]
    async fn exit_code_stream_receives_a_reported_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let daemon = Daemon::new(tmp.path().join("plugins"), tmp.path());
        let entry = CommandEntry {
            command: "ls".into(),
            tty: "/dev/pts/3".into(),
            timestamp: 1,
        };
        let key = daemon.register_command_entry(entry);
        let mut rx = daemon.register_exit_code_stream("/dev/pts/3".into());
        daemon.post_run_report(key.clone(), 7).await;
        let event = rx.recv().await.expect("exit code should be delivered");
        assert_eq!(event.key, key);
        assert_eq!(event.exit_code, 7);
    }

    #[tokio::test]
    async fn metacommand_against_unknown_plugin_reports_an_error_not_a_panic() {
        let tmp = tempfile::tempdir().unwrap();
        let daemon = Daemon::new(tmp.path().join("plugins"), tmp.path());
        daemon.reload_plugins().await;
        let response = daemon
            .metacommand(MetacommandRequest {
                plugin_name: "nope".into(),
                meta_command: "last".into(),
                args: vec![],
                format_args: vec![],
            })
            .await;
        assert!(response.error.is_some());
    }

    #[tokio::test]
    async fn get_plugin_info_on_empty_host_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let daemon = Daemon::new(tmp.path().join("plugins"), tmp.path());
        daemon.reload_plugins().await;
        let response = daemon
            .get_plugin_info(GetPluginInfoRequest {
                plugin_name_prefix: String::new(),
                metacommand_name_prefix: String::new(),
            })
            .await;
        assert!(response.plugins.is_empty());
    }
}
