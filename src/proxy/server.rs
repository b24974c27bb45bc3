use log::{debug, warn};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::address::NetLocation;
use crate::async_stream::AsyncStream;
use crate::config::{parse_transport_uri, transport_endpoint, RelayServerConfig, TransportSettings};
use crate::relay::relay;
use crate::resolver::resolve_location;
use crate::route::TargetedStream;
use crate::socket_util::set_keepalive;
use crate::transport::{create_transport, Transport, DIAL_TIMEOUT};

/// The outlet end of the tunnel: listens via the configured transport and
/// relays every delivered connection to its resolved destination.
pub async fn run_relay_server(
    config: RelayServerConfig,
    settings: TransportSettings,
) -> std::io::Result<()> {
    let uri = parse_transport_uri(&config.listen_uri)?;
    let transport = create_transport(&uri, &settings)?;
    let endpoint = transport_endpoint(&uri)?;

    println!("Starting relay server at {}", config.listen_uri);

    let mut connections = transport.listen(&endpoint).await?;

    while let Some(TargetedStream { stream, target }) = connections.recv().await {
        tokio::spawn(async move {
            match dial_target(&target).await {
                Ok(remote) => {
                    debug!("relaying to {target}");
                    relay(stream, remote).await;
                }
                Err(e) => {
                    warn!("dial {target}: {e}");
                    // stream is dropped, closing the client connection.
                }
            }
        });
    }

    Err(std::io::Error::other(format!(
        "listener at {} terminated",
        config.listen_uri
    )))
}

async fn dial_target(target: &NetLocation) -> std::io::Result<Box<dyn AsyncStream>> {
    let addr = resolve_location(target).await?;

    let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("dial {target}: timed out"),
            )
        })?
        .map_err(|e| std::io::Error::new(e.kind(), format!("dial {target}: {e}")))?;

    set_keepalive(&stream)
        .map_err(|e| std::io::Error::new(e.kind(), format!("set keepalive: {e}")))?;

    Ok(Box::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::write_target;
    use crate::transport::{TcpTransport, Transport};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_relay_server_end_to_end() {
        // The "destination server" the relay should connect out to.
        let destination = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let destination_addr = destination.local_addr().unwrap();
        let destination_task = tokio::spawn(async move {
            let (mut stream, _) = destination.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            stream.write_all(b"world").await.unwrap();
        });

        let relay_port = {
            std::net::TcpListener::bind("127.0.0.1:0")
                .unwrap()
                .local_addr()
                .unwrap()
                .port()
        };
        let listen_uri = format!("tcp://127.0.0.1:{relay_port}");
        let server_config = RelayServerConfig {
            listen_uri: listen_uri.clone(),
        };
        tokio::spawn(run_relay_server(server_config, TransportSettings::default()));

        // Give the listener a moment to bind.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        // A tunnel client frames the destination and sends payload.
        let transport = TcpTransport::new();
        let target = NetLocation::from_str(&destination_addr.to_string(), None).unwrap();
        let mut stream = transport
            .dial(&format!("127.0.0.1:{relay_port}"), None)
            .await
            .unwrap();
        write_target(&mut stream, Some(&target)).await.unwrap();
        stream.write_all(b"hello").await.unwrap();

        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        destination_task.await.unwrap();
    }
}
