//! Discovers plugin executables under a directory, starts each under the
//! handshake-then-dial-socket protocol (spec §6), interrogates them for
//! capabilities, and exposes `commandReport`/`metacommand`/
//! `getMetacommandPluginInfoMatches` to the daemon (spec §4.2).

use core_protocol::{
    read_frame, write_frame, Handshake, MetacommandInfo, MetacommandResponse, PluginRequest,
    PluginResponse, ResponseFormat,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex as AsyncMutex;

#[derive(Debug, thiserror::Error)]
pub enum PluginHostError {
    #[error("plugin {0} not found")]
    NotFound(String),
    #[error("plugin {name} transport error: {source}")]
    Transport {
        name: String,
        #[source]
        source: core_protocol::FramingError,
    },
    #[error("plugin reported an error: {0}")]
    PluginError(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One plugin's advertised capabilities and its live connection.
struct PluginRecord {
    version: String,
    accepts_reports: bool,
    metacommands: HashMap<String, ResponseFormat>,
    process: PluginProcess,
}

impl PluginRecord {
    fn summary(&self, name: &str) -> core_protocol::PluginSummary {
        core_protocol::PluginSummary {
            name: name.to_string(),
            version: self.version.clone(),
            accepts_command_reports: self.accepts_reports,
            metacommands: self
                .metacommands
                .iter()
                .map(|(name, format)| MetacommandInfo {
                    name: name.clone(),
                    format: *format,
                })
                .collect(),
        }
    }
}

#[derive(Clone)]
struct PluginProcess {
    inner: Arc<PluginProcessInner>,
}

struct PluginProcessInner {
    name: String,
    stream: AsyncMutex<UnixStream>,
    child: AsyncMutex<Option<Child>>,
    socket_path: PathBuf,
}

impl PluginProcess {
    async fn spawn(path: &Path, name_hint: &str, root_dir: &Path) -> anyhow::Result<(Self, core_protocol::PluginResponse)> {
        let socket_path = root_dir.join(format!("plugin-{name_hint}-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path)?;

        let mut command = Command::new(path);
        command.kill_on_drop(true);
        command.env("METASHELL_HANDSHAKE_COOKIE_KEY", core_protocol::HANDSHAKE_COOKIE_KEY);
        command.env("METASHELL_HANDSHAKE_COOKIE_VALUE", core_protocol::HANDSHAKE_COOKIE_VALUE);
        command.env(
            "METASHELL_HANDSHAKE_PROTOCOL_VERSION",
            core_protocol::HANDSHAKE_PROTOCOL_VERSION.to_string(),
        );
        command.env("METASHELL_PLUGIN_SOCKET", &socket_path);
        command.env("METASHELL_PLUGIN_NAME", name_hint);
        command.env("METASHELL_ROOT_DIR", root_dir);
        command.stdout(std::process::Stdio::piped());
        command.stderr(std::process::Stdio::piped());
        command.stdin(std::process::Stdio::null());

        let mut child = command.spawn()?;
        let stderr = child.stderr.take();

        let (mut stream, _addr) =
            tokio::time::timeout(Duration::from_secs(5), listener.accept()).await??;

        let handshake: Option<Handshake> = read_frame(&mut stream).await.map_err(|e| {
            anyhow::anyhow!("plugin {name_hint} handshake transport error: {e}")
        })?;
        let handshake = handshake.ok_or_else(|| anyhow::anyhow!("plugin {name_hint} closed before handshake"))?;
        if !handshake.is_compatible() {
            anyhow::bail!("plugin {name_hint} presented an incompatible handshake");
        }

        write_frame(&mut stream, &PluginRequest::Info).await?;
        let response: Option<PluginResponse> = read_frame(&mut stream).await?;
        let response = response.ok_or_else(|| anyhow::anyhow!("plugin {name_hint} closed during Info"))?;

        let process = Self {
            inner: Arc::new(PluginProcessInner {
                name: name_hint.to_string(),
                stream: AsyncMutex::new(stream),
                child: AsyncMutex::new(Some(child)),
                socket_path,
            }),
        };

        if let Some(stderr) = stderr {
            process.spawn_stderr_task(stderr);
        }

        Ok((process, response))
    }

    fn spawn_stderr_task(&self, stderr: ChildStderr) {
        let name = self.inner.name.clone();
        let mut lines = BufReader::new(stderr).lines();
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(target: "pluginhost.stderr", plugin = %name, "{line}");
            }
        });
    }

    async fn call(&self, request: PluginRequest) -> Result<PluginResponse, PluginHostError> {
        let mut stream = self.inner.stream.lock().await;
        write_frame(&mut *stream, &request)
            .await
            .map_err(|source| PluginHostError::Transport { name: self.inner.name.clone(), source })?;
        let response: Option<PluginResponse> = read_frame(&mut *stream)
            .await
            .map_err(|source| PluginHostError::Transport { name: self.inner.name.clone(), source })?;
        response.ok_or_else(|| PluginHostError::Transport {
            name: self.inner.name.clone(),
            source: core_protocol::FramingError::Closed,
        })
    }

    async fn shutdown(&self) {
        let _ = self.call(PluginRequest::Shutdown).await;
        if let Some(mut child) = self.inner.child.lock().await.take() {
            let _ = tokio::time::timeout(Duration::from_millis(500), child.wait()).await;
            let _ = child.start_kill();
        }
        let _ = std::fs::remove_file(&self.inner.socket_path);
    }
}

/// Immutable snapshot of one reload generation.
type Generation = HashMap<String, PluginRecord>;

/// The plugin host: discovers, spawns, and routes calls to plugin
/// subprocesses. Mutated only by [`PluginHost::reload`]; every other method
/// reads a consistent copy-on-reload snapshot (spec §4.2 concurrency note).
pub struct PluginHost {
    plugins_dir: PathBuf,
    root_dir: PathBuf,
    generation: AsyncMutex<Arc<Generation>>,
}

impl PluginHost {
    pub fn new(plugins_dir: impl Into<PathBuf>, root_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugins_dir: plugins_dir.into(),
            root_dir: root_dir.into(),
            generation: AsyncMutex::new(Arc::new(Generation::new())),
        }
    }

    async fn snapshot(&self) -> Arc<Generation> {
        self.generation.lock().await.clone()
    }

    /// Closes every subprocess in the current generation, re-enumerates the
    /// plugins directory (non-recursive), and spawns a fresh generation.
    /// A missing directory yields zero plugins, not an error. Any
    /// individual plugin's spawn/handshake/dispense/Info failure is logged
    /// and that plugin is skipped; the whole reload never aborts because of
    /// one bad plugin (spec §4.2 step 3).
    pub async fn reload(&self) -> usize {
        let old = {
            let mut guard = self.generation.lock().await;
            std::mem::replace(&mut *guard, Arc::new(Generation::new()))
        };
        for (name, record) in old.iter() {
            tracing::debug!(target: "pluginhost.reload", plugin = %name, "closing previous generation");
            record.process.shutdown().await;
        }

        let mut next = Generation::new();

        let entries = match std::fs::read_dir(&self.plugins_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(target: "pluginhost.reload", dir = %self.plugins_dir.display(), "plugins directory missing, no plugins loaded");
                *self.generation.lock().await = Arc::new(next);
                return 0;
            }
            Err(e) => {
                tracing::warn!(target: "pluginhost.reload", error = %e, "failed to read plugins directory");
                *self.generation.lock().await = Arc::new(next);
                return 0;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            match entry.file_type() {
                Ok(ft) if ft.is_file() => {}
                _ => continue,
            }
            let name_hint = path
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or("plugin")
                .to_string();

            match PluginProcess::spawn(&path, &name_hint, &self.root_dir).await {
                Ok((process, PluginResponse::Info { name, version, accepts_command_reports, metacommands })) => {
                    if name.is_empty() {
                        tracing::warn!(target: "pluginhost.reload", path = %path.display(), "plugin reported an empty name, skipping");
                        process.shutdown().await;
                        continue;
                    }
                    tracing::info!(target: "pluginhost.reload", path = %path.display(), plugin = %name, "loaded plugin");
                    next.insert(
                        name,
                        PluginRecord {
                            version,
                            accepts_reports: accepts_command_reports,
                            metacommands: metacommands
                                .into_iter()
                                .map(|mc| (mc.name, mc.format))
                                .collect(),
                            process,
                        },
                    );
                }
                Ok((process, other)) => {
                    tracing::warn!(target: "pluginhost.reload", path = %path.display(), response = ?other, "plugin did not answer Info with Info, skipping");
                    process.shutdown().await;
                }
                Err(e) => {
                    tracing::warn!(target: "pluginhost.reload", path = %path.display(), error = %e, "failed to load plugin, skipping");
                }
            }
        }

        let count = next.len();
        *self.generation.lock().await = Arc::new(next);
        count
    }

    /// Fans `ReportCommand` out to every plugin with `accepts_reports`;
    /// delivery order is unspecified and may be concurrent (I6, spec §4.2).
    /// Transport errors are logged and swallowed.
    pub async fn command_report(&self, command: &str, tty: &str, timestamp: i64, exit_code: i32) {
        let snapshot = self.snapshot().await;
        let calls = snapshot
            .iter()
            .filter(|(_, record)| record.accepts_reports)
            .map(|(name, record)| {
                let process = record.process.clone();
                let name = name.clone();
                let command = command.to_string();
                let tty = tty.to_string();
                async move {
                    let request = PluginRequest::ReportCommand {
                        command,
                        tty,
                        timestamp,
                        exit_code,
                    };
                    if let Err(e) = process.call(request).await {
                        tracing::warn!(target: "pluginhost.report", plugin = %name, error = %e, "command report delivery failed");
                    }
                }
            });
        futures_lite_join_all(calls).await;
    }

    /// Exact-name lookup only (spec §4.2); absent plugin is a caller-visible
    /// error.
    pub async fn metacommand(
        &self,
        plugin_name: &str,
        name: &str,
        args: Vec<String>,
    ) -> Result<MetacommandResponse, PluginHostError> {
        let snapshot = self.snapshot().await;
        let record = snapshot
            .get(plugin_name)
            .ok_or_else(|| PluginHostError::NotFound(plugin_name.to_string()))?;

        let response = record
            .process
            .call(PluginRequest::Metacommand { name: name.to_string(), args })
            .await?;

        match response {
            PluginResponse::MetacommandResult(result) => Ok(result),
            PluginResponse::Error(message) => Err(PluginHostError::PluginError(message)),
            _ => Err(PluginHostError::PluginError("unexpected plugin response".into())),
        }
    }

    /// Exact match wins immediately; otherwise the first plugin (in
    /// iteration order) whose name starts with `prefix` — and, when
    /// `require_metacommands` is set, that has at least one metacommand —
    /// is returned. The loop stops at the first hit (spec §4.2, §9 Open
    /// Question 2: a deliberate product decision, not a bug).
    pub async fn get_plugin_matches(&self, prefix: &str, require_metacommands: bool) -> Vec<core_protocol::PluginSummary> {
        let snapshot = self.snapshot().await;
        if let Some(record) = snapshot.get(prefix) {
            if !require_metacommands || !record.metacommands.is_empty() {
                return vec![record.summary(prefix)];
            }
        }

        let mut names: Vec<&String> = snapshot.keys().collect();
        names.sort();
        for name in names {
            let record = &snapshot[name];
            if !name.starts_with(prefix) {
                continue;
            }
            if require_metacommands && record.metacommands.is_empty() {
                continue;
            }
            return vec![record.summary(name)];
        }
        Vec::new()
    }

    /// `getMetacommandPluginInfoMatches(prefix)` (spec §4.2).
    pub async fn get_metacommand_plugin_info_matches(&self, prefix: &str) -> Vec<core_protocol::PluginSummary> {
        self.get_plugin_matches(prefix, true).await
    }

    /// `GetPluginInfo(pluginNamePrefix, metacommandNamePrefix)` (spec §4.3):
    /// matches plugins by name prefix (first-hit semantics above), then
    /// filters each match's metacommands by `metacommand_prefix`, emitting
    /// the plugin only if the filtered list is non-empty.
    pub async fn get_plugin_info(
        &self,
        plugin_name_prefix: &str,
        metacommand_name_prefix: &str,
    ) -> Vec<core_protocol::PluginSummary> {
        self.get_plugin_matches(plugin_name_prefix, false)
            .await
            .into_iter()
            .filter_map(|mut summary| {
                summary
                    .metacommands
                    .retain(|mc| mc.name.starts_with(metacommand_name_prefix));
                if summary.metacommands.is_empty() {
                    None
                } else {
                    Some(summary)
                }
            })
            .collect()
    }
}

/// Small stand-in for `futures::future::join_all` so this crate doesn't pull
/// in the `futures` umbrella crate for one call site.
async fn futures_lite_join_all<I>(iter: I)
where
    I: IntoIterator,
    I::Item: std::future::Future<Output = ()>,
{
    let mut set = tokio::task::JoinSet::new();
    for fut in iter {
        set.spawn(fut);
    }
    while set.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reload_on_missing_directory_yields_no_plugins() {
        let tmp = tempfile::tempdir().unwrap();
        let host = PluginHost::new(tmp.path().join("does-not-exist"), tmp.path());
        let count = host.reload().await;
        assert_eq!(count, 0);
        assert!(host.get_metacommand_plugin_info_matches("anything").await.is_empty());
    }

    #[tokio::test]
    async fn metacommand_on_unknown_plugin_is_a_caller_visible_error() {
        let tmp = tempfile::tempdir().unwrap();
        let host = PluginHost::new(tmp.path(), tmp.path());
        host.reload().await;
        let err = host.metacommand("nope", "last", vec![]).await.unwrap_err();
        assert!(matches!(err, PluginHostError::NotFound(name) if name == "nope"));
    }

    #[tokio::test]
    async fn repeated_reload_on_empty_directory_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("plugins")).unwrap();
        let host = PluginHost::new(tmp.path().join("plugins"), tmp.path());
        assert_eq!(host.reload().await, 0);
        assert_eq!(host.reload().await, 0);
    }
}
