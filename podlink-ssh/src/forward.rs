//! SSH-jump forwarder: binds a local listener and proxies each
//! accepted connection through an SSH session to a remote endpoint
//! (spec §4.9, grounded on `pkg/util/ssh.go`'s `Main` / `handleClient`).

use crate::client::{SshSession, SshTarget};
use podlink_core::error::CoreError;
use tokio::io::copy_bidirectional;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// State machine for one accepted local connection, per spec §4.9:
/// `Accepted → Dialing-remote → Proxying → Closing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    DialingRemote,
    Proxying,
    Closing,
}

/// Parameters for one forwarder instance.
pub struct ForwardSpec {
    pub target: SshTarget,
    pub local_endpoint: String,
    pub remote_host: String,
    pub remote_port: u16,
}

/// Runs the forwarder until cancelled or the session dies. Sends on
/// `ready` once the local listener is live, so callers can proceed to
/// dial it (spec §4.9: "the `done` signal is emitted once the local
/// listener is live").
pub async fn run(spec: ForwardSpec, ready: oneshot::Sender<()>) -> Result<(), CoreError> {
    let session = std::sync::Arc::new(SshSession::dial(&spec.target).await?);
    let listener = TcpListener::bind(&spec.local_endpoint)
        .await
        .map_err(|e| CoreError::fatal(format!("bind {}: {e}", spec.local_endpoint)))?;

    let _ = ready.send(());

    loop {
        let (local, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => return Err(CoreError::fatal(format!("accept failed: {e}"))),
        };
        debug!(%peer, state = ?ConnectionState::Accepted, "forwarder accepted connection");

        let session = std::sync::Arc::clone(&session);
        let remote_host = spec.remote_host.clone();
        let remote_port = spec.remote_port;
        tokio::spawn(async move {
            if let Err(e) = proxy_one(&session, local, &remote_host, remote_port).await {
                warn!(%peer, error = %e, "forwarder connection failed");
            }
        });
    }
}

async fn proxy_one(
    session: &SshSession,
    mut local: tokio::net::TcpStream,
    remote_host: &str,
    remote_port: u16,
) -> Result<(), CoreError> {
    debug!(state = ?ConnectionState::DialingRemote, %remote_host, remote_port, "dialing remote via ssh");
    let mut remote = session.dial_remote(remote_host, remote_port).await?;

    debug!(state = ?ConnectionState::Proxying, "proxying bytes");
    let result = copy_bidirectional(&mut local, &mut remote).await;

    debug!(state = ?ConnectionState::Closing, "closing forwarded connection");
    result.map(|_| ()).map_err(CoreError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_states_are_ordered_by_declaration() {
        let states = [
            ConnectionState::Accepted,
            ConnectionState::DialingRemote,
            ConnectionState::Proxying,
            ConnectionState::Closing,
        ];
        assert_eq!(states.len(), 4);
    }
}
