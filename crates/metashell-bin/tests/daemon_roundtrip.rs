//! End-to-end exercise of the pieces `metashell-bin`'s subcommands wire
//! together: a daemon bound to a real Unix socket, queried the same way the
//! `shellclient` and `plugin list` subcommands do through `core_daemon::client`.

use core_daemon::client;
use core_protocol::{CommandEntry, DaemonRequest, DaemonResponse, GetPluginInfoRequest};
use std::sync::Arc;
use tokio::sync::Notify;

async fn spawn_daemon(root: &std::path::Path) -> (std::path::PathBuf, Arc<Notify>) {
    let socket_path = root.join("daemon.sock");
    let daemon = core_daemon::Daemon::new(root.join("plugins"), root.to_path_buf());
    daemon.reload_plugins().await;

    let shutdown = Arc::new(Notify::new());
    let shutdown_task = Arc::clone(&shutdown);
    let socket_for_task = socket_path.clone();
    tokio::spawn(async move {
        let _ = core_daemon::serve(daemon, &socket_for_task, async move {
            shutdown_task.notified().await;
        })
        .await;
    });

    // Give the listener a moment to bind before the test dials it.
    for _ in 0..50 {
        if tokio::net::UnixStream::connect(&socket_path).await.is_ok() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    (socket_path, shutdown)
}

#[tokio::test]
async fn pre_run_query_then_post_run_report_matches_shellclient_flow() {
    let tmp = tempfile::tempdir().unwrap();
    let (socket_path, shutdown) = spawn_daemon(tmp.path()).await;

    let entry = CommandEntry {
        command: "ls -l".into(),
        tty: "/dev/pts/4".into(),
        timestamp: 1_000,
    };
    let response = client::call(&socket_path, DaemonRequest::RegisterCommandEntry(entry.clone()))
        .await
        .unwrap();
    let key = match response {
        DaemonResponse::Key(k) => k,
        other => panic!("unexpected response: {other:?}"),
    };
    assert_ne!(key, core_protocol::INIT_KEY);

    let response = client::call(
        &socket_path,
        DaemonRequest::PostRunReport { key, exit_code: 0 },
    )
    .await
    .unwrap();
    assert!(matches!(response, DaemonResponse::Ack));

    shutdown.notify_waiters();
}

#[tokio::test]
async fn plugin_list_against_an_empty_host_reports_no_plugins() {
    let tmp = tempfile::tempdir().unwrap();
    let (socket_path, shutdown) = spawn_daemon(tmp.path()).await;

    let response = client::call(
        &socket_path,
        DaemonRequest::GetPluginInfo(GetPluginInfoRequest {
            plugin_name_prefix: String::new(),
            metacommand_name_prefix: String::new(),
        }),
    )
    .await
    .unwrap();
    match response {
        DaemonResponse::PluginInfo(info) => assert!(info.plugins.is_empty()),
        other => panic!("unexpected response: {other:?}"),
    }

    shutdown.notify_waiters();
}
