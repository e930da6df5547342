//! Synchronous wrappers around the async daemon client, for the TUI's
//! blocking crossterm event loop. Valid only when called from inside a
//! `tokio::task::spawn_blocking` closure, where a runtime handle is always
//! reachable; the TTY host (`core-tty`) is the only caller.

use anyhow::{anyhow, Result};
use core_daemon::client;
use core_protocol::{
    DaemonRequest, DaemonResponse, GetPluginInfoRequest, GetPluginInfoResponse,
    MetacommandRequest, MetacommandResponse,
};
use std::path::Path;

fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    tokio::runtime::Handle::current().block_on(fut)
}

pub fn get_plugin_info(socket_path: &Path, req: GetPluginInfoRequest) -> Result<GetPluginInfoResponse> {
    match block_on(client::call(socket_path, DaemonRequest::GetPluginInfo(req)))? {
        DaemonResponse::PluginInfo(info) => Ok(info),
        other => Err(anyhow!("unexpected daemon response to GetPluginInfo: {other:?}")),
    }
}

pub fn metacommand(socket_path: &Path, req: MetacommandRequest) -> Result<MetacommandResponse> {
    match block_on(client::call(socket_path, DaemonRequest::Metacommand(req)))? {
        DaemonResponse::MetacommandResult(result) => Ok(result),
        other => Err(anyhow!("unexpected daemon response to Metacommand: {other:?}")),
    }
}
