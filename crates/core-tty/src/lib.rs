//! The TTY Host (spec §4.4): spawns the configured shell under a PTY,
//! forwards bytes bidirectionally between it and the real terminal, and
//! intercepts a single keystroke to enter the Meta TUI. Grounded on
//! `examples/original_source/internal/metashell/metashell.go`, which this
//! module follows task-for-task (D1–D4 below correspond to its `start()`
//! goroutine, its `io.Copy(stdout, ptmx)` call, its exit-code receive
//! goroutine, and its signal-channel loop); the async task/shutdown-notify
//! idiom is carried over from the teacher's
//! `crates/core-input/src/async_service.rs`.

use anyhow::{anyhow, Context, Result};
use core_daemon::client;
use core_protocol::{CommandEntry, DaemonRequest};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;

pub struct TtyHostConfig {
    pub shell: String,
    pub daemon_socket: PathBuf,
    /// Absolute path to this binary, used both for `ensureDaemon`'s
    /// self-spawn and for the `". <(exe install)"` hook-shim injection.
    pub exe_path: PathBuf,
    pub prompt: String,
    pub plugin_name_delim: String,
}

type SharedMaster = Arc<StdMutex<Box<dyn MasterPty + Send>>>;
type SharedWriter = Arc<StdMutex<Box<dyn Write + Send>>>;

struct PtySession {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    reader: Box<dyn Read + Send>,
    child: Box<dyn Child + Send + Sync>,
    /// The slave device path, doubling as the logical `TTY` identity used in
    /// every RPC this host issues (spec §4.3/§4.4).
    tty: String,
}

/// Entry point for the `metashell` subcommand.
pub async fn run(config: TtyHostConfig) -> Result<()> {
    ensure_daemon(&config.daemon_socket, &config.exe_path).await?;

    let pty = spawn_pty_shell(&config.shell)?;
    let tty = pty.tty.clone();
    let child_pid = pty.child.process_id().map(|p| p as i32);
    let master: SharedMaster = Arc::new(StdMutex::new(pty.master));
    let writer: SharedWriter = Arc::new(StdMutex::new(pty.writer));

    resize_to_current(&master)?;
    write_hook_shim(&writer, &config.exe_path)?;

    // Raw mode must outlive every forwarding task; restored on drop (I8)
    // regardless of which path out of this function we take.
    let _raw_guard = core_terminal::RawModeGuard::enter()?;

    let cmd_is_running = Arc::new(AtomicBool::new(false));
    let shutdown = Arc::new(Notify::new());

    let reader = pty.reader;
    let shutdown_d2 = Arc::clone(&shutdown);
    let d2 = tokio::task::spawn_blocking(move || {
        forward_ptmx_to_stdout(reader);
        // The child shell exiting is this host's primary shutdown trigger.
        shutdown_d2.notify_waiters();
    });

    let d3 = tokio::spawn(exit_code_consumer(
        config.daemon_socket.clone(),
        tty.clone(),
        Arc::clone(&cmd_is_running),
        Arc::clone(&shutdown),
    ));

    let d4 = tokio::spawn(signal_task(Arc::clone(&shutdown), Arc::clone(&master), child_pid));

    let d1 = tokio::task::spawn_blocking({
        let writer = Arc::clone(&writer);
        let daemon_socket = config.daemon_socket.clone();
        let tty = tty.clone();
        move || {
            forward_stdin_to_ptmx(
                writer,
                daemon_socket,
                tty,
                cmd_is_running,
                config.prompt,
                config.plugin_name_delim,
            )
        }
    });

    tokio::select! {
        biased;
        _ = shutdown.notified() => {}
        res = d1 => {
            if let Err(e) = res {
                tracing::warn!(target: "tty.shutdown", error = %e, "stdin forwarder task panicked");
            }
        }
    }

    shutdown.notify_waiters();
    d2.abort();
    d3.abort();
    d4.abort();

    Ok(())
}

/// Checks for the daemon socket; if unreachable, spawns `exe_path daemon
/// start` once, waits ~500ms, and tries exactly once more (spec §7,
/// SPEC_FULL.md §2).
async fn ensure_daemon(socket_path: &Path, exe_path: &Path) -> Result<()> {
    if tokio::net::UnixStream::connect(socket_path).await.is_ok() {
        return Ok(());
    }
    tracing::info!(target: "tty.ensure_daemon", path = %exe_path.display(), "daemon unreachable, spawning");
    tokio::process::Command::new(exe_path)
        .args(["daemon", "start"])
        .spawn()
        .context("spawning daemon subprocess")?;
    tokio::time::sleep(Duration::from_millis(500)).await;
    tokio::net::UnixStream::connect(socket_path)
        .await
        .map(|_| ())
        .context("daemon still unreachable after spawning it once")
}

fn spawn_pty_shell(shell: &str) -> Result<PtySession> {
    let pty_system = native_pty_system();
    let (cols, rows) = crossterm::terminal::size().unwrap_or((80, 24));
    let pair = pty_system
        .openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .context("opening pty")?;

    let cmd = CommandBuilder::new(shell);
    let child = pair
        .slave
        .spawn_command(cmd)
        .with_context(|| format!("spawning shell '{shell}' under pty"))?;
    // Dropping the slave end closes the host's copy of the fd; the child
    // keeps its own, so this doesn't affect the running shell.
    drop(pair.slave);

    let master = pair.master;
    let reader = master.try_clone_reader().context("cloning pty reader")?;
    let writer = master.take_writer().context("taking pty writer")?;
    let pid = child
        .process_id()
        .ok_or_else(|| anyhow!("could not determine child pid"))?;
    let tty = tty_path_for_pid(pid)?;

    Ok(PtySession { master, writer, reader, child, tty })
}

/// Resolves the slave device path the same way `ms.cmd.Stdin.(*os.File).Name()`
/// does in the original implementation, but from this side of the fork:
/// the child's fd 0 is the pty slave, and `/proc/<pid>/fd/0` resolves to its
/// device node on Linux.
fn tty_path_for_pid(pid: u32) -> Result<String> {
    let link = format!("/proc/{pid}/fd/0");
    let target = std::fs::read_link(&link).with_context(|| format!("reading {link}"))?;
    Ok(target.to_string_lossy().into_owned())
}

fn write_hook_shim(writer: &SharedWriter, exe_path: &Path) -> Result<()> {
    let line = format!(". <({} install)\n", exe_path.display());
    let mut w = writer.lock().expect("pty writer lock poisoned");
    w.write_all(line.as_bytes())?;
    w.flush()?;
    Ok(())
}

fn resize_to_current(master: &SharedMaster) -> Result<()> {
    let (cols, rows) = crossterm::terminal::size().unwrap_or((80, 24));
    master
        .lock()
        .expect("pty master lock poisoned")
        .resize(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 })?;
    Ok(())
}

/// (D2) PTY master → real stdout, byte-for-byte, no interpretation.
fn forward_ptmx_to_stdout(mut reader: Box<dyn Read + Send>) {
    let mut stdout = std::io::stdout();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if stdout.write_all(&buf[..n]).is_err() || stdout.flush().is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(target: "tty.forward_out", error = %e, "pty read failed");
                break;
            }
        }
    }
}

/// (D3) consumes the exit-code stream opened for this host's TTY; every
/// event flips `cmdIsRunning` false, regardless of which key it carries —
/// the daemon only ever delivers events for this TTY (I7), and only one
/// command can be outstanding on it at a time.
async fn exit_code_consumer(
    socket_path: PathBuf,
    tty: String,
    cmd_is_running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
) {
    let mut stream = match client::open_exit_code_stream(&socket_path, tty).await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(target: "tty.exitstream", error = %e, "could not open exit code stream");
            return;
        }
    };

    loop {
        tokio::select! {
            biased;
            _ = shutdown.notified() => return,
            event = client::recv_exit_code(&mut stream) => {
                match event {
                    Ok(Some(_)) => cmd_is_running.store(false, Ordering::SeqCst),
                    Ok(None) => return,
                    Err(e) => {
                        tracing::warn!(target: "tty.exitstream", error = %e, "exit code stream ended with an error");
                        return;
                    }
                }
            }
        }
    }
}

/// (D4) `SIGWINCH` resizes the pty; `SIGTERM` is forwarded to the child and
/// then ends the host; `SIGINT` is forwarded but never terminates it
/// (spec §4.4 step 8, SPEC_FULL.md §2). `SIGKILL` is never registered here —
/// it cannot be caught (Open Question 3 resolution, DESIGN.md).
async fn signal_task(shutdown: Arc<Notify>, master: SharedMaster, child_pid: Option<i32>) {
    let mut sigwinch = match signal(SignalKind::window_change()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(target: "tty.signals", error = %e, "could not register SIGWINCH handler");
            return;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(target: "tty.signals", error = %e, "could not register SIGTERM handler");
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(target: "tty.signals", error = %e, "could not register SIGINT handler");
            return;
        }
    };

    loop {
        tokio::select! {
            biased;
            _ = shutdown.notified() => return,
            _ = sigwinch.recv() => {
                if let Err(e) = resize_to_current(&master) {
                    tracing::warn!(target: "tty.signals", error = %e, "resize failed");
                }
            }
            _ = sigterm.recv() => {
                forward_signal(child_pid, nix::sys::signal::Signal::SIGTERM);
                shutdown.notify_waiters();
                return;
            }
            _ = sigint.recv() => {
                forward_signal(child_pid, nix::sys::signal::Signal::SIGINT);
            }
        }
    }
}

fn forward_signal(pid: Option<i32>, sig: nix::sys::signal::Signal) {
    let Some(pid) = pid else { return };
    if let Err(e) = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), sig) {
        tracing::warn!(target: "tty.signals", error = %e, pid, ?sig, "failed to forward signal to child");
    }
}

/// (D1) real stdin → PTY master, applying the interception state machine
/// from spec §4.4. Blocking: reads one byte at a time off the real
/// controlling terminal, which is safe only because raw mode (`VMIN=1
/// VTIME=0`-equivalent) guarantees each `read` returns promptly.
fn forward_stdin_to_ptmx(
    writer: SharedWriter,
    daemon_socket: PathBuf,
    tty: String,
    cmd_is_running: Arc<AtomicBool>,
    prompt: String,
    delim: String,
) -> Result<()> {
    let handle = tokio::runtime::Handle::current();
    let mut stdin = std::io::stdin();
    let mut buf = [0u8; 1];
    let mut command_buffer = String::new();

    loop {
        let n = stdin.read(&mut buf).context("reading stdin")?;
        if n == 0 {
            return Ok(());
        }
        let byte = buf[0];

        if cmd_is_running.load(Ordering::SeqCst) {
            write_byte(&writer, byte)?;
            continue;
        }

        match byte {
            0x1B => {
                let tui_config = core_tui::MetaTuiConfig {
                    socket_path: daemon_socket.clone(),
                    prompt: prompt.clone(),
                    plugin_name_delim: delim.clone(),
                };
                match core_tui::run(tui_config) {
                    Ok(Some(injection)) => write_bytes(&writer, injection.as_bytes())?,
                    Ok(None) => {}
                    Err(e) => tracing::warn!(target: "tty.metatui", error = %e, "meta tui exited with an error"),
                }
            }
            0x0D => {
                let entry = CommandEntry {
                    command: std::mem::take(&mut command_buffer),
                    tty: tty.clone(),
                    timestamp: now_seconds(),
                };
                let daemon_socket = daemon_socket.clone();
                let _ = handle.block_on(client::call(
                    &daemon_socket,
                    DaemonRequest::RegisterCommandEntry(entry),
                ));
                cmd_is_running.store(true, Ordering::SeqCst);
                write_byte(&writer, byte)?;
            }
            other => {
                command_buffer.push(other as char);
                write_byte(&writer, byte)?;
            }
        }
    }
}

fn write_byte(writer: &SharedWriter, byte: u8) -> Result<()> {
    write_bytes(writer, &[byte])
}

fn write_bytes(writer: &SharedWriter, bytes: &[u8]) -> Result<()> {
    let mut w = writer.lock().expect("pty writer lock poisoned");
    w.write_all(bytes)?;
    w.flush()?;
    Ok(())
}

/// Seconds since epoch (spec §3: "Timestamp is seconds since epoch").
fn now_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A `Write` sink that mirrors every write into a shared buffer, so tests
    /// can inspect what was sent through a `SharedWriter` trait object.
    struct RecordingSink(Arc<StdMutex<Vec<u8>>>);

    impl Write for RecordingSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn hook_shim_injects_the_given_binary_path() {
        let recorded = Arc::new(StdMutex::new(Vec::new()));
        let writer: SharedWriter = Arc::new(StdMutex::new(Box::new(RecordingSink(Arc::clone(&recorded)))));
        write_hook_shim(&writer, Path::new("/usr/local/bin/metashell")).unwrap();
        let bytes = recorded.lock().unwrap().clone();
        assert_eq!(String::from_utf8(bytes).unwrap(), ". <(/usr/local/bin/metashell install)\n");
    }

    #[test]
    fn now_seconds_is_monotonic_nondecreasing_across_calls() {
        let a = now_seconds();
        let b = now_seconds();
        assert!(b >= a);
    }
}
