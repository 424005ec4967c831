//! TCP direct-forward handler: dials a fixed remote target and copies
//! bytes bidirectionally, the `TCPDirectForwardHandler` variant from
//! spec §4 / `core.TCPDirectForwardHandler` in the original
//! implementation.

use crate::tcp::TcpTransport;
use podlink_core::error::CoreError;
use tokio::io::{AsyncRead, AsyncWrite};

/// Dials `remote` and relays `conn` to it until either side closes.
pub async fn direct_forward<C>(mut conn: C, remote: &str) -> Result<(), CoreError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let transport = TcpTransport::default();
    let mut upstream = transport.dial(remote).await?;
    tokio::io::copy_bidirectional(&mut conn, &mut upstream)
        .await
        .map_err(CoreError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn relays_bytes_to_remote_and_back() {
        let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = remote.local_addr().unwrap();

        let echo_task = tokio::spawn(async move {
            let (mut sock, _) = remote.accept().await.unwrap();
            let mut buf = [0u8; 32];
            let n = tokio::io::AsyncReadExt::read(&mut sock, &mut buf).await.unwrap();
            tokio::io::AsyncWriteExt::write_all(&mut sock, &buf[..n]).await.unwrap();
        });

        let (mut client, server_side) = tokio::io::duplex(1024);
        let remote_addr_str = remote_addr.to_string();
        let forward_task =
            tokio::spawn(async move { direct_forward(server_side, &remote_addr_str).await });

        tokio::io::AsyncWriteExt::write_all(&mut client, b"hello").await.unwrap();
        let mut buf = [0u8; 32];
        let n = tokio::io::AsyncReadExt::read(&mut client, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        drop(client);
        echo_task.await.unwrap();
        let _ = forward_task.await.unwrap();
    }
}
