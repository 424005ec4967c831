//! Daemon-local static configuration. Parses a TOML file into a
//! strongly-typed structure and supports hot-reloading via the
//! `notify` crate. This is the ambient settings surface for the
//! embedding daemon (log level, status port); the data-plane's own
//! wiring comes from node URLs (see `podlink-chain::node`), not from
//! this file.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Result as NotifyResult, Watcher};
use serde::Deserialize;
use std::{fs, path::Path, sync::Arc};
use tokio::sync::watch;

use crate::error::CoreError;

/// Top-level daemon settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Tracing filter directive, e.g. `"info"` or `"podlink_transport=debug"`.
    pub log_level: String,
    /// Local address the status/health HTTP endpoint binds to.
    pub status_addr: String,
    /// Default dial timeout applied to nodes that omit `timeout`.
    pub dial_timeout_secs: u64,
    /// Listener-side node URLs, one per router the daemon serves.
    pub serve_nodes: Vec<String>,
    /// Single chain-side node URL (may fan out to several hops).
    pub chain_nodes: String,
    /// Whole-chain dial retries before giving up (spec §5).
    pub retries: u32,
    /// `ssh_config(5)` alias to chase (via `ProxyJump`) for the optional
    /// jump forwarder; empty disables it (spec §4.9).
    pub ssh_alias: String,
    /// Local address the ssh-jump forwarder binds to.
    pub ssh_local_endpoint: String,
    /// Remote host the ssh-jump forwarder dials once a local connection
    /// is accepted.
    pub ssh_remote_host: String,
    /// Remote port the ssh-jump forwarder dials.
    pub ssh_remote_port: u16,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            status_addr: "127.0.0.1:9823".to_string(),
            dial_timeout_secs: 10,
            serve_nodes: Vec::new(),
            chain_nodes: String::new(),
            retries: 0,
            ssh_alias: String::new(),
            ssh_local_endpoint: String::new(),
            ssh_remote_host: String::new(),
            ssh_remote_port: 0,
        }
    }
}

impl DaemonConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::error::Result<Self> {
        let data = fs::read_to_string(&path)?;
        let cfg = toml::from_str::<DaemonConfig>(&data)?;
        Ok(cfg)
    }

    /// Watch the configuration file for changes, returning the initial
    /// value and a channel that yields a fresh `Arc<DaemonConfig>`
    /// every time the file is modified on disk.
    pub fn watch_file<P: AsRef<Path>>(
        path: P,
    ) -> crate::error::Result<(Arc<DaemonConfig>, watch::Receiver<Arc<DaemonConfig>>)> {
        let path_buf = path.as_ref().to_path_buf();
        let initial = Arc::new(Self::from_file(&path_buf)?);
        let path_in_closure = path_buf.clone();
        let (tx, rx) = watch::channel(initial.clone());

        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: NotifyResult<Event>| {
                if let Ok(event) = res {
                    if matches!(event.kind, EventKind::Modify(_)) {
                        if let Ok(updated) = Self::from_file(&path_in_closure) {
                            let _ = tx.send(Arc::new(updated));
                        }
                    }
                }
            })
            .map_err(|e| CoreError::config(e.to_string()))?;

        watcher
            .watch(&path_buf, RecursiveMode::NonRecursive)
            .map_err(|e| CoreError::config(e.to_string()))?;
        // The watcher must outlive this call; the background task it
        // drives is the only thing keeping routes current, so we leak
        // it for the process lifetime rather than thread a guard type
        // through the daemon's public API.
        std::mem::forget(watcher);

        Ok((initial, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_file_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("podlink.toml");
        fs::write(&path, "").unwrap();
        let cfg = DaemonConfig::from_file(&path).unwrap();
        assert_eq!(cfg.status_addr, "127.0.0.1:9823");
    }

    #[test]
    fn overrides_apply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("podlink.toml");
        fs::write(&path, "log_level = \"debug\"\nstatus_addr = \"0.0.0.0:1\"\n").unwrap();
        let cfg = DaemonConfig::from_file(&path).unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.status_addr, "0.0.0.0:1");
    }
}
