#![forbid(unsafe_code)]

//! Embedding skeleton for the tunnel core: loads a route spec, builds
//! routers via `podlink_chain::build_routers`, and serves them
//! alongside a status endpoint (grounded on `nyx-daemon::main`'s
//! tracing-init + axum-serve shape, with the `tonic` RPC surface
//! dropped in favor of a minimal `axum` health/status page).

mod status;

use podlink_chain::{build_routers, Router, RouteSpec};
use podlink_core::config::DaemonConfig;
use podlink_ssh::forward::ForwardSpec;
use podlink_ssh::client::SshTarget;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn config_path() -> String {
    std::env::args().nth(1).unwrap_or_else(|| "podlink.toml".to_string())
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Spawns the ssh-jump forwarder named by `config.ssh_alias` and waits
/// for its local listener to come up before returning, so a chain node
/// dialing `ssh_local_endpoint` won't race the bind. A no-op when no
/// alias is configured.
async fn bootstrap_ssh_forwarder(config: &DaemonConfig) -> anyhow::Result<()> {
    if config.ssh_alias.is_empty() {
        return Ok(());
    }

    let spec = ForwardSpec {
        target: SshTarget {
            addr: String::new(),
            user: String::new(),
            password: None,
            keyfile: None,
            config_alias: Some(config.ssh_alias.clone()),
        },
        local_endpoint: config.ssh_local_endpoint.clone(),
        remote_host: config.ssh_remote_host.clone(),
        remote_port: config.ssh_remote_port,
    };
    let alias = config.ssh_alias.clone();
    let local_endpoint = config.ssh_local_endpoint.clone();

    let (ready_tx, ready_rx) = oneshot::channel();
    tokio::spawn(async move {
        if let Err(e) = podlink_ssh::forward::run(spec, ready_tx).await {
            error!(%alias, error = %e, "ssh-jump forwarder exited with error");
        }
    });
    ready_rx
        .await
        .map_err(|_| anyhow::anyhow!("ssh-jump forwarder for {alias} at {local_endpoint} died before binding"))?;
    info!(%alias, %local_endpoint, "ssh-jump forwarder listening");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = config_path();
    let config = match DaemonConfig::from_file(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load {path}: {e}, using defaults");
            DaemonConfig::default()
        }
    };

    init_tracing(&config.log_level);
    info!(%path, status_addr = %config.status_addr, "podlink daemon starting");

    bootstrap_ssh_forwarder(&config).await?;

    let route_spec = RouteSpec {
        serve_nodes: config.serve_nodes.clone(),
        chain_nodes: config.chain_nodes.clone(),
        retries: config.retries,
    };
    let routers: Vec<Arc<Router>> = build_routers(&route_spec).await?.into_iter().map(Arc::new).collect();
    if routers.is_empty() {
        warn!("no serve_nodes configured, daemon will only expose the status endpoint");
    }

    let mut serve_tasks = Vec::with_capacity(routers.len());
    for router in &routers {
        let router = Arc::clone(router);
        serve_tasks.push(tokio::spawn(async move {
            if let Err(e) = router.serve().await {
                error!(addr = %router.addr(), error = %e, "router exited with error");
            }
        }));
    }

    let status_addr = config.status_addr.clone();
    let status_routers = routers.clone();
    let status_task = tokio::spawn(async move {
        if let Err(e) = status::serve(&status_addr, status_routers).await {
            error!(error = %e, "status endpoint exited with error");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, closing routers");
    for router in routers.iter() {
        router.close();
    }
    status_task.abort();
    for task in serve_tasks {
        task.abort();
    }
    Ok(())
}
