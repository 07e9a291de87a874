//! Config watcher for `concourse serve`.
//!
//! Watches the concourse.toml config file using the `notify` crate. On each
//! detected change (with 100ms debounce), it re-parses the config, diffs the
//! server table against the last applied one and feeds the gateway:
//! - added, modified, or re-activated servers → `on_server_active`
//! - removed or `status = "inactive"` servers → `on_server_inactive`
//!
//! Connected MCP client peers then receive tools/resources/prompts
//! list-changed notifications; stale peers are pruned on notification error.
//! On parse failure the previous state is kept and a warning is logged.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::RecursiveMode;
use notify::Watcher;
use tokio_util::sync::CancellationToken;

use crate::config::{GatewayConfig, ServerConfig};
use crate::error::ConcourseError;
use crate::gateway::Gateway;
use crate::standalone::server::PeerList;

/// One configuration-source event.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Active(ServerConfig),
    Inactive(String),
}

/// Events that move the gateway from `previous` to `next`, ordered by server name.
pub fn diff_servers(
    previous: &HashMap<String, ServerConfig>,
    next: &HashMap<String, ServerConfig>,
) -> Vec<ServerEvent> {
    let names: BTreeSet<&String> = previous.keys().chain(next.keys()).collect();
    let mut events = Vec::new();
    for name in names {
        match (previous.get(name), next.get(name)) {
            (Some(old), Some(new)) if old == new => {}
            (_, Some(new)) if new.is_active() => events.push(ServerEvent::Active(new.clone())),
            (Some(old), Some(_)) if !old.is_active() => {}
            _ => events.push(ServerEvent::Inactive(name.clone())),
        }
    }
    events
}

/// Feed `events` into the gateway. Connect failures are logged; the
/// gateway's reconnect schedule takes it from there.
pub async fn apply_events(gateway: &Gateway, events: Vec<ServerEvent>) {
    for event in events {
        match event {
            ServerEvent::Active(config) => {
                let name = config.name.clone();
                if let Err(e) = gateway.on_server_active(config).await {
                    tracing::warn!(server = %name, error = %e, "server failed to connect after config change");
                }
            }
            ServerEvent::Inactive(name) => gateway.on_server_inactive(&name).await,
        }
    }
}

/// Load, parse and validate the config file.
pub async fn load_config(config_path: &Path) -> crate::Result<GatewayConfig> {
    let content = tokio::fs::read_to_string(config_path)
        .await
        .map_err(|e| ConcourseError::InvalidConfig("config-watch".into(), e.to_string()))?;
    let config = GatewayConfig::from_toml_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Watch `config_path` and apply server changes to `gateway` until `cancel`.
///
/// `initial` is the config the gateway was started with; only differences
/// from it (and from each later applied config) produce events.
pub async fn run_config_watch(
    config_path: PathBuf,
    initial: GatewayConfig,
    gateway: Arc<Gateway>,
    peers_handle: PeerList,
    cancel: CancellationToken,
) {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<notify::Result<notify::Event>>();

    // notify's EventHandler is implemented for FnMut, not for tokio's UnboundedSender.
    let mut watcher = match notify::recommended_watcher(move |event| {
        let _ = tx.send(event);
    }) {
        Ok(w) => w,
        Err(e) => {
            tracing::error!(error = %e, "failed to create file watcher");
            return;
        }
    };

    if let Err(e) = watcher.watch(&config_path, RecursiveMode::NonRecursive) {
        tracing::error!(
            path = %config_path.display(),
            error = %e,
            "failed to watch config file"
        );
        return;
    }

    // Dropping the watcher stops the OS-level watch.
    let _watcher = watcher;

    tracing::info!(path = %config_path.display(), "watching config file");

    let mut current = initial;
    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(Ok(_)) => {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        while rx.try_recv().is_ok() {}

                        match load_config(&config_path).await {
                            Ok(next) => {
                                if next.proxy != current.proxy || next.reconnect != current.reconnect {
                                    tracing::warn!("proxy and reconnect settings apply on restart only");
                                }
                                let events = diff_servers(&current.servers, &next.servers);
                                current = next;
                                if events.is_empty() {
                                    tracing::debug!("config changed, no server changes");
                                    continue;
                                }
                                tracing::info!(
                                    changes = events.len(),
                                    path = %config_path.display(),
                                    "applying config changes"
                                );
                                apply_events(&gateway, events).await;
                                notify_peers(&peers_handle).await;
                            }
                            Err(e) => {
                                tracing::warn!(
                                    error = %e,
                                    path = %config_path.display(),
                                    "config reload failed, keeping previous config"
                                );
                            }
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "file watcher error");
                    }
                    None => {
                        tracing::debug!("config watcher channel closed");
                        return;
                    }
                }
            }
            _ = cancel.cancelled() => {
                tracing::debug!("config watch cancelled");
                return;
            }
        }
    }
}

/// Notify all connected peers that every capability list may have changed.
///
/// Peers that fail with a transport error are pruned from the vec.
async fn notify_peers(peers_handle: &PeerList) {
    let mut peers = peers_handle.lock().await;
    let mut live_peers = Vec::with_capacity(peers.len());
    for peer in peers.drain(..) {
        let result = async {
            peer.notify_tool_list_changed().await?;
            peer.notify_resource_list_changed().await?;
            peer.notify_prompt_list_changed().await
        }
        .await;
        match result {
            Ok(()) => live_peers.push(peer),
            Err(e) => {
                tracing::debug!(error = %e, "pruning stale peer after list-changed error");
            }
        }
    }
    *peers = live_peers;
}
