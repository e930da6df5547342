//! Runtime plugin authors embed in their own binaries to speak the
//! metashell plugin protocol (spec §6), mirroring
//! `examples/ArliT1-F-helix/helix-plugin-sdk/src/lib.rs`'s `Plugin`
//! trait + `run()` entry point — adapted from stdio-JSON-lines to the
//! length-prefixed `bincode` framing over a Unix socket that
//! `core-pluginhost` actually dials (spec §6, `core-protocol::{read_frame,
//! write_frame}`).
//!
//! The host binds the socket and spawns the plugin process with its path
//! and the handshake constants in its environment (`core-pluginhost`'s
//! `PluginProcess::spawn`); the plugin connects out, writes one
//! [`core_protocol::Handshake`] frame, and then answers requests until it
//! is told to shut down.

use anyhow::{bail, Context, Result};
use core_protocol::{
    read_frame, write_frame, Handshake, MetacommandInfo, MetacommandResponse, PluginRequest,
    PluginResponse,
};
use std::env;
use tokio::net::UnixStream;

/// Plugins implement this to participate in the runtime.
pub trait Plugin: Send {
    /// Name reported in `Info`; must be non-empty or the host discards the
    /// whole plugin (spec §4.2).
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    /// Whether this plugin wants `ReportCommand` deliveries. Most plugins
    /// only implement metacommands and leave this `false`.
    fn accepts_command_reports(&self) -> bool {
        false
    }

    /// Metacommands this plugin exposes, with their declared response
    /// format — dispatch downstream happens on this declaration, never on
    /// response contents (spec §4.5).
    fn metacommands(&self) -> Vec<MetacommandInfo>;

    /// Called once per connection before the request loop starts. Default
    /// is a no-op; most plugins have nothing to do here since the host
    /// never actually sends `PluginRequest::Init` today.
    fn init(&mut self, _config: Vec<u8>, _log_dir: &str) -> Result<()> {
        Ok(())
    }

    /// A `ReportCommand` delivery (I6: fire-and-forget, order unspecified).
    /// Default is a no-op for plugins that never set
    /// `accepts_command_reports`.
    fn report_command(&mut self, _command: &str, _tty: &str, _timestamp: i64, _exit_code: i32) {}

    /// Executes one metacommand. `Err` becomes `PluginResponse::Error`, not
    /// a transport failure — the host treats it as ordinary command
    /// failure (spec §4.5).
    fn metacommand(&mut self, name: &str, args: Vec<String>) -> Result<MetacommandResponse, String>;
}

/// Connects to the host, performs the handshake, and serves requests until
/// `Shutdown`. Builds its own single-threaded runtime, so plugin binaries
/// don't need a `#[tokio::main]` of their own.
pub fn run<P: Plugin>(plugin: P) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building plugin runtime")?;
    runtime.block_on(run_async(plugin))
}

async fn run_async<P: Plugin>(mut plugin: P) -> Result<()> {
    let expected_cookie_key = env::var("METASHELL_HANDSHAKE_COOKIE_KEY")
        .context("METASHELL_HANDSHAKE_COOKIE_KEY not set — this binary must be launched by metashell")?;
    let expected_cookie_value = env::var("METASHELL_HANDSHAKE_COOKIE_VALUE")
        .context("METASHELL_HANDSHAKE_COOKIE_VALUE not set")?;
    let expected_version: u32 = env::var("METASHELL_HANDSHAKE_PROTOCOL_VERSION")
        .context("METASHELL_HANDSHAKE_PROTOCOL_VERSION not set")?
        .parse()
        .context("METASHELL_HANDSHAKE_PROTOCOL_VERSION is not a valid integer")?;
    let socket_path = env::var("METASHELL_PLUGIN_SOCKET").context("METASHELL_PLUGIN_SOCKET not set")?;

    let handshake = Handshake {
        cookie_key: expected_cookie_key,
        cookie_value: expected_cookie_value,
        protocol_version: expected_version,
    };
    if !handshake.is_compatible() {
        bail!("environment presented a handshake this sdk build does not recognize");
    }

    let mut stream = UnixStream::connect(&socket_path)
        .await
        .with_context(|| format!("connecting to host socket {socket_path}"))?;
    write_frame(&mut stream, &handshake).await?;

    loop {
        let request: Option<PluginRequest> = read_frame(&mut stream).await?;
        let Some(request) = request else {
            tracing::debug!(target: "plugin_sdk", "host closed the connection");
            return Ok(());
        };

        match request {
            PluginRequest::Info => {
                let response = PluginResponse::Info {
                    name: plugin.name().to_string(),
                    version: plugin.version().to_string(),
                    accepts_command_reports: plugin.accepts_command_reports(),
                    metacommands: plugin.metacommands(),
                };
                write_frame(&mut stream, &response).await?;
            }
            PluginRequest::Init { config, log_dir } => {
                let response = match plugin.init(config, &log_dir) {
                    Ok(()) => PluginResponse::Ack,
                    Err(e) => PluginResponse::Error(e.to_string()),
                };
                write_frame(&mut stream, &response).await?;
            }
            PluginRequest::ReportCommand { command, tty, timestamp, exit_code } => {
                plugin.report_command(&command, &tty, timestamp, exit_code);
                write_frame(&mut stream, &PluginResponse::Ack).await?;
            }
            PluginRequest::Metacommand { name, args } => {
                let response = match plugin.metacommand(&name, args) {
                    Ok(result) => PluginResponse::MetacommandResult(result),
                    Err(message) => PluginResponse::Error(message),
                };
                write_frame(&mut stream, &response).await?;
            }
            PluginRequest::Shutdown => {
                write_frame(&mut stream, &PluginResponse::Ack).await?;
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo {
        last: Option<String>,
    }

    impl Plugin for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn version(&self) -> &str {
            "0.1.0"
        }

        fn accepts_command_reports(&self) -> bool {
            true
        }

        fn metacommands(&self) -> Vec<MetacommandInfo> {
            vec![MetacommandInfo {
                name: "last".to_string(),
                format: core_protocol::ResponseFormat::ShellInjection,
            }]
        }

        fn report_command(&mut self, command: &str, _tty: &str, _timestamp: i64, _exit_code: i32) {
            self.last = Some(command.to_string());
        }

        fn metacommand(&mut self, name: &str, _args: Vec<String>) -> Result<MetacommandResponse, String> {
            match name {
                "last" => Ok(MetacommandResponse {
                    data: self.last.clone().unwrap_or_default().into_bytes(),
                    error: None,
                }),
                other => Err(format!("unknown metacommand `{other}`")),
            }
        }
    }

    #[test]
    fn declares_its_own_metacommands() {
        let plugin = Echo { last: None };
        let commands = plugin.metacommands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].name, "last");
    }

    #[test]
    fn report_then_metacommand_replays_the_last_command() {
        let mut plugin = Echo { last: None };
        plugin.report_command("ls -l", "/dev/pts/3", 1, 0);
        let response = plugin.metacommand("last", vec![]).unwrap();
        assert_eq!(response.data, b"ls -l");
    }

    #[test]
    fn unknown_metacommand_is_an_error_not_a_panic() {
        let mut plugin = Echo { last: None };
        assert!(plugin.metacommand("nope", vec![]).is_err());
    }
}
