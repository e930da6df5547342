//! Unified CLI entrypoint (spec §6): `daemon`, `metashell`, `shellclient`,
//! `install`, `plugin list`, `config`. Each subcommand loads the shared
//! [`core_config::Config`], wires up a component-scoped logger, and hands off
//! to the relevant core crate — this binary is plumbing, not logic.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing_appender::non_blocking::WorkerGuard;

#[derive(Parser, Debug)]
#[command(name = "metashell", version, about = "Interposes on a shell to correlate commands with exit codes and dispatch plugin events")]
struct Cli {
    /// Overrides the default `~/.metashell` root directory.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run or stop the background daemon.
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
    /// Run the TTY host in the current terminal.
    Metashell,
    /// Single-shot hook handler, invoked from the shell's `DEBUG` trap and
    /// prompt command.
    Shellclient(ShellClientArgs),
    /// Print the hook shim sourced into the interactive shell.
    Install,
    /// Manage plugins known to the daemon.
    Plugin {
        #[command(subcommand)]
        action: PluginAction,
    },
    /// Print the effective configuration.
    Config,
}

#[derive(Subcommand, Debug)]
enum DaemonAction {
    /// Start the daemon (detaches into the background unless `--foreground`).
    Start {
        #[arg(long)]
        foreground: bool,
    },
    /// Stop a running daemon.
    Stop,
}

#[derive(Subcommand, Debug)]
enum PluginAction {
    /// List plugins the daemon currently has loaded.
    List,
}

#[derive(clap::Args, Debug)]
struct ShellClientArgs {
    #[arg(long)]
    tty: Option<String>,
    #[arg(long)]
    cmd: Option<String>,
    #[arg(long = "cmdKey")]
    cmd_key: Option<String>,
    #[arg(long = "exit-code")]
    exit_code: Option<i32>,
}

fn main() -> Result<()> {
    install_panic_hook();
    let cli = Cli::parse();

    match cli.command {
        Command::Daemon { action } => run_daemon(cli.root, action),
        Command::Metashell => run_metashell(cli.root),
        Command::Shellclient(args) => run_shellclient(cli.root, args),
        Command::Install => run_install(),
        Command::Plugin { action } => run_plugin(cli.root, action),
        Command::Config => run_config(cli.root),
    }
}

fn install_panic_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let default_panic = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            tracing::error!(target: "runtime.panic", ?info, "panic");
            default_panic(info);
        }));
    });
}

/// Mirrors the original's `<unix-timestamp>.log`-per-process-start rotation
/// (`examples/original_source/internal/log/logging.go`), one subdirectory per
/// component under the configured log root, rather than a single ambient
/// logger singleton (spec §9, SPEC_FULL.md §1).
fn configure_logging(log_root: &Path, component: &str) -> Result<WorkerGuard> {
    let dir = log_root.join(component);
    core_config::ensure_dir(&dir).with_context(|| format!("creating log dir {}", dir.display()))?;

    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let file_name = format!("{ts}.log");

    let file_appender = tracing_appender::rolling::never(&dir, &file_name);
    let (nb_writer, guard) = tracing_appender::non_blocking(file_appender);
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(nb_writer)
        .with_target(true)
        .try_init();
    Ok(guard)
}

fn tokio_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")
}

// ---------------------------------------------------------------------
// daemon start / stop
// ---------------------------------------------------------------------

fn run_daemon(root: Option<PathBuf>, action: DaemonAction) -> Result<()> {
    match action {
        DaemonAction::Start { foreground } => run_daemon_start(root, foreground),
        DaemonAction::Stop => run_daemon_stop(root),
    }
}

/// Startup sequence (spec §4.3, in order): detach, write PID file, install
/// signal handlers, delete stale socket, reload plugins, bind and serve.
/// Detaching happens *before* any tokio runtime exists — forking a
/// multi-threaded process is unsafe, so `nix::unistd::daemon` must run first.
fn run_daemon_start(root: Option<PathBuf>, foreground: bool) -> Result<()> {
    if !foreground {
        // `nochdir=true` (stay in the current directory), `noclose=false`
        // (redirect stdio to /dev/null) — the parent half of this call
        // exits immediately; only the detached child returns here.
        nix::unistd::daemon(true, false).context("daemonizing")?;
    }

    let config = core_config::load(root)?;
    let _guard = configure_logging(&config.log_dir(), "daemon")?;

    let pid_path = config.pid_path();
    std::fs::write(&pid_path, std::process::id().to_string())
        .with_context(|| format!("writing pid file {}", pid_path.display()))?;

    let socket_path = config.socket_path();
    let plugins_dir = config.plugins_dir();
    let root_dir = config.root_dir.clone();

    let runtime = tokio_runtime()?;
    let result = runtime.block_on(async move {
        let daemon = core_daemon::Daemon::new(plugins_dir, root_dir);
        let loaded = daemon.reload_plugins().await;
        tracing::info!(target: "daemon.startup", loaded_plugins = loaded, "plugin discovery complete");

        let shutdown = async {
            let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
                .expect("registering SIGINT handler");
            let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("registering SIGTERM handler");
            let mut sigquit = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::quit())
                .expect("registering SIGQUIT handler");
            tokio::select! {
                _ = sigint.recv() => tracing::info!(target: "daemon.signal", "received SIGINT"),
                _ = sigterm.recv() => tracing::info!(target: "daemon.signal", "received SIGTERM"),
                _ = sigquit.recv() => tracing::info!(target: "daemon.signal", "received SIGQUIT"),
            }
        };

        core_daemon::serve(daemon, &socket_path, shutdown).await
    });

    let _ = std::fs::remove_file(&pid_path);
    result
}

/// Reads the PID file and sends `SIGTERM`; the daemon's own signal handler
/// performs the graceful shutdown (spec §4.3 step 2).
fn run_daemon_stop(root: Option<PathBuf>) -> Result<()> {
    let config = core_config::load(root)?;
    let pid_path = config.pid_path();
    let contents = std::fs::read_to_string(&pid_path)
        .with_context(|| format!("reading pid file {}", pid_path.display()))?;
    let pid: i32 = contents
        .trim()
        .parse()
        .with_context(|| format!("pid file {} does not contain a valid pid", pid_path.display()))?;

    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::Signal::SIGTERM)
        .with_context(|| format!("sending SIGTERM to pid {pid}"))?;
    let _ = std::fs::remove_file(&pid_path);
    println!("stopped daemon (pid {pid})");
    Ok(())
}

// ---------------------------------------------------------------------
// metashell (TTY host)
// ---------------------------------------------------------------------

fn run_metashell(root: Option<PathBuf>) -> Result<()> {
    let config = core_config::load(root)?;
    let _guard = configure_logging(&config.log_dir(), "metashell")?;

    let exe_path = std::env::current_exe()
        .context("resolving this binary's path")
        .and_then(|p| std::fs::canonicalize(&p).with_context(|| format!("resolving symlinks for {}", p.display())))?;

    let runtime = tokio_runtime()?;
    runtime.block_on(core_tty::run(core_tty::TtyHostConfig {
        shell: config.file.metashell.shell.clone(),
        daemon_socket: config.socket_path(),
        exe_path,
        prompt: config.file.metashell.prompt.clone(),
        plugin_name_delim: config.file.metashell.plugin_name_delim.clone(),
    }))
}

// ---------------------------------------------------------------------
// shellclient
// ---------------------------------------------------------------------

fn run_shellclient(root: Option<PathBuf>, args: ShellClientArgs) -> Result<()> {
    let config = core_config::load(root)?;
    let _guard = configure_logging(&config.log_dir(), "shellclient")?;

    let is_pre_run = args.tty.is_some() && args.cmd.is_some();
    let is_post_run = args.cmd_key.is_some() && args.exit_code.is_some();

    if is_pre_run == is_post_run {
        anyhow::bail!("exactly one of --tty/--cmd or --cmdKey/--exit-code must be given");
    }

    let runtime = tokio_runtime()?;
    runtime.block_on(async move {
        if is_pre_run {
            let entry = core_protocol::CommandEntry {
                command: args.cmd.unwrap(),
                tty: args.tty.unwrap(),
                timestamp: now_seconds(),
            };
            let response = core_daemon::client::call(
                &config.socket_path(),
                core_protocol::DaemonRequest::PreRunQuery(entry),
            )
            .await
            .context("calling PreRunQuery")?;
            match response {
                core_protocol::DaemonResponse::Key(key) => {
                    print!("{key}");
                    Ok(())
                }
                other => anyhow::bail!("unexpected daemon response to PreRunQuery: {other:?}"),
            }
        } else {
            let response = core_daemon::client::call(
                &config.socket_path(),
                core_protocol::DaemonRequest::PostRunReport {
                    key: args.cmd_key.unwrap(),
                    exit_code: args.exit_code.unwrap(),
                },
            )
            .await
            .context("calling PostRunReport")?;
            match response {
                core_protocol::DaemonResponse::Ack => Ok(()),
                other => anyhow::bail!("unexpected daemon response to PostRunReport: {other:?}"),
            }
        }
    })
}

fn now_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------
// install
// ---------------------------------------------------------------------

/// The hook shim (spec §6 "Hook shim"): a `DEBUG`-trap function that
/// registers the about-to-run command and a prompt-command function that
/// reports its exit code, both calling back into this binary's `shellclient`
/// subcommand. Grounded verbatim on
/// `examples/original_source/internal/installer/shellInstallationScript.go`,
/// adapted to this binary's `--tty`/`--cmd`/`--cmdKey`/`--exit-code` flags.
const HOOK_SHIM_TEMPLATE: &str = r#"
PROMPT_COMMAND=__metashell_post_run
METASHELL_EXEC="{exe} shellclient"
export METASHELL_CMD_KEY=INIT

trap __metashell_pre_run DEBUG

__metashell_pre_run() {{
	case "$BASH_COMMAND" in
		$PROMPT_COMMAND)
			;;
		*)
			METASHELL_TTY=$(tty)
			METASHELL_CMD_KEY=$($METASHELL_EXEC --tty "$METASHELL_TTY" --cmd "$BASH_COMMAND")
	esac
}}

__metashell_post_run() {{
	$METASHELL_EXEC --cmdKey "$METASHELL_CMD_KEY" --exit-code $?
}}
"#;

fn run_install() -> Result<()> {
    let exe_path = std::env::current_exe()
        .context("resolving this binary's path")
        .and_then(|p| std::fs::canonicalize(&p).with_context(|| format!("resolving symlinks for {}", p.display())))?;
    print!("{}", HOOK_SHIM_TEMPLATE.replace("{exe}", &exe_path.display().to_string()));
    Ok(())
}

// ---------------------------------------------------------------------
// plugin list
// ---------------------------------------------------------------------

fn run_plugin(root: Option<PathBuf>, action: PluginAction) -> Result<()> {
    match action {
        PluginAction::List => run_plugin_list(root),
    }
}

fn run_plugin_list(root: Option<PathBuf>) -> Result<()> {
    let config = core_config::load(root)?;
    let runtime = tokio_runtime()?;
    runtime.block_on(async move {
        let response = core_daemon::client::call(
            &config.socket_path(),
            core_protocol::DaemonRequest::GetPluginInfo(core_protocol::GetPluginInfoRequest {
                plugin_name_prefix: String::new(),
                metacommand_name_prefix: String::new(),
            }),
        )
        .await
        .context("calling GetPluginInfo")?;

        let plugins = match response {
            core_protocol::DaemonResponse::PluginInfo(info) => info.plugins,
            other => anyhow::bail!("unexpected daemon response to GetPluginInfo: {other:?}"),
        };

        if plugins.is_empty() {
            println!("No plugins found.");
            return Ok(());
        }

        for plugin in plugins {
            println!("Name:        {}", plugin.name);
            println!("Version:     {}", plugin.version);
            println!("Accepts reports: {}", plugin.accepts_command_reports);
            if !plugin.metacommands.is_empty() {
                let names: Vec<&str> = plugin.metacommands.iter().map(|m| m.name.as_str()).collect();
                println!("Commands:    {}", names.join(", "));
            }
            println!();
        }
        Ok(())
    })
}

// ---------------------------------------------------------------------
// config
// ---------------------------------------------------------------------

fn run_config(root: Option<PathBuf>) -> Result<()> {
    let config = core_config::load(root)?;
    let rendered = toml::to_string_pretty(&config.file).context("rendering effective configuration")?;
    println!("root_dir = {:?}", config.root_dir);
    print!("{rendered}");
    Ok(())
}
