use async_trait::async_trait;
use log::{debug, error};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::time::timeout;

use crate::address::NetLocation;
use crate::async_stream::AsyncStream;
use crate::resolver::resolve_endpoint;
use crate::route::{write_target, TargetedStream};
use crate::socket_util::set_keepalive;
use crate::transport::{spawn_sniff_worker, Transport, DIAL_TIMEOUT};

/// The baseline transport: one TCP connection per tunneled connection.
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn dial(
        &self,
        remote: &str,
        target: Option<&NetLocation>,
    ) -> std::io::Result<Box<dyn AsyncStream>> {
        let addr = resolve_endpoint(remote).await?;

        let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("dial {remote}: timed out"),
                )
            })?
            .map_err(|e| std::io::Error::new(e.kind(), format!("dial {remote}: {e}")))?;

        set_keepalive(&stream)
            .map_err(|e| std::io::Error::new(e.kind(), format!("set keepalive: {e}")))?;

        let mut stream: Box<dyn AsyncStream> = Box::new(stream);
        write_target(&mut stream, target).await?;
        Ok(stream)
    }

    async fn listen(&self, local: &str) -> std::io::Result<UnboundedReceiver<TargetedStream>> {
        let listener = TcpListener::bind(local)
            .await
            .map_err(|e| std::io::Error::new(e.kind(), format!("bind {local}: {e}")))?;

        let (sender, receiver) = unbounded_channel();

        tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(v) => v,
                    Err(e) => {
                        // The socket is broken; this listener cannot heal
                        // itself. Dropping the sender surfaces the failure.
                        error!("tcp accept failed, stopping listener: {e}");
                        break;
                    }
                };
                if let Err(e) = set_keepalive(&stream) {
                    debug!("{peer}: set keepalive: {e}");
                }
                spawn_sniff_worker(Box::new(stream), peer.to_string(), sender.clone());
            }
        });

        Ok(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn test_dial_and_listen_round_trip() {
        let local = format!("127.0.0.1:{}", free_port());
        let transport = TcpTransport::new();
        let mut connections = transport.listen(&local).await.unwrap();

        let target = NetLocation::from_str("example.com:8080", None).unwrap();
        let mut outbound = transport.dial(&local, Some(&target)).await.unwrap();
        outbound.write_all(b"payload").await.unwrap();

        let tagged = tokio::time::timeout(Duration::from_secs(5), connections.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tagged.target, target);

        let mut stream = tagged.stream;
        let mut buf = [0u8; 7];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[tokio::test]
    async fn test_failed_sniff_never_delivers() {
        let local = format!("127.0.0.1:{}", free_port());
        let transport = TcpTransport::new();
        let mut connections = transport.listen(&local).await.unwrap();

        // Connects and closes without sending a byte: sniffing fails and
        // the connection must neither appear nor block later deliveries.
        let dead = TcpStream::connect(&local).await.unwrap();
        drop(dead);

        let target = NetLocation::from_str("example.com:443", None).unwrap();
        let _outbound = transport.dial(&local, Some(&target)).await.unwrap();

        let tagged = tokio::time::timeout(Duration::from_secs(5), connections.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tagged.target, target);
    }

    #[tokio::test]
    async fn test_dial_unreachable_fails_fast() {
        let transport = TcpTransport::new();
        // Port 9 on localhost is almost certainly closed.
        let result = transport.dial("127.0.0.1:9", None).await;
        assert!(result.is_err());
    }
}
