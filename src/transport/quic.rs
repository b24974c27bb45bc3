use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error};
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::address::NetLocation;
use crate::async_stream::AsyncStream;
use crate::config::QuicSettings;
use crate::resolver::resolve_endpoint;
use crate::route::{write_target, TargetedStream};
use crate::rustls_util::{create_client_config, create_server_config};
use crate::transport::{spawn_sniff_worker, Transport, DIAL_TIMEOUT};

/// Multiplexed UDP transport: many tunneled connections share one QUIC
/// session as individual bidirectional streams. The dial side keeps a
/// single cached session per remote; with no keep-alive pings, the idle
/// timeout tears the session down once its last stream has closed, and the
/// next dial reconnects.
pub struct QuicTransport {
    settings: QuicSettings,
    // The one piece of state shared between dial workers.
    session: Mutex<Option<Session>>,
}

struct Session {
    remote: String,
    // Kept alive alongside its connection; dropping the endpoint would
    // stop the datagram driver.
    _endpoint: quinn::Endpoint,
    connection: quinn::Connection,
}

impl QuicTransport {
    pub fn new(settings: QuicSettings) -> Self {
        Self {
            settings,
            session: Mutex::new(None),
        }
    }

    fn idle_timeout(&self) -> std::io::Result<quinn::IdleTimeout> {
        Duration::from_secs(self.settings.idle_timeout_secs)
            .try_into()
            .map_err(|e| std::io::Error::other(format!("quic idle timeout: {e}")))
    }

    async fn session_connection(&self, remote: &str) -> std::io::Result<quinn::Connection> {
        let mut guard = self.session.lock().await;

        if let Some(session) = guard.as_ref() {
            if session.remote == remote && session.connection.close_reason().is_none() {
                return Ok(session.connection.clone());
            }
        }

        let (endpoint, connection) = self.connect(remote).await?;
        debug!("established quic session with {remote}");
        *guard = Some(Session {
            remote: remote.to_string(),
            _endpoint: endpoint,
            connection: connection.clone(),
        });
        Ok(connection)
    }

    async fn connect(
        &self,
        remote: &str,
    ) -> std::io::Result<(quinn::Endpoint, quinn::Connection)> {
        let addr = resolve_endpoint(remote).await?;

        let bind_addr: SocketAddr = if addr.is_ipv6() {
            "[::]:0".parse().unwrap()
        } else {
            "0.0.0.0:0".parse().unwrap()
        };
        let mut endpoint = quinn::Endpoint::client(bind_addr)
            .map_err(|e| std::io::Error::new(e.kind(), format!("create quic endpoint: {e}")))?;

        let crypto: QuicClientConfig = Arc::new(create_client_config())
            .try_into()
            .map_err(|e| std::io::Error::other(format!("quic client crypto: {e}")))?;
        let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));

        let mut transport_config = quinn::TransportConfig::default();
        transport_config.max_idle_timeout(Some(self.idle_timeout()?));
        client_config.transport_config(Arc::new(transport_config));
        endpoint.set_default_client_config(client_config);

        // The certificate is never verified, so the server name only has
        // to be well-formed.
        let server_name = match NetLocation::from_str(remote, None) {
            Ok(location) => location.address().to_string(),
            Err(_) => remote.to_string(),
        };

        let connecting = endpoint
            .connect(addr, &server_name)
            .map_err(|e| std::io::Error::other(format!("quic connect {remote}: {e}")))?;

        let connection = timeout(DIAL_TIMEOUT, connecting)
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("quic connect {remote}: timed out"),
                )
            })?
            .map_err(|e| std::io::Error::other(format!("quic connect {remote}: {e}")))?;

        Ok((endpoint, connection))
    }
}

#[async_trait]
impl Transport for QuicTransport {
    async fn dial(
        &self,
        remote: &str,
        target: Option<&NetLocation>,
    ) -> std::io::Result<Box<dyn AsyncStream>> {
        let connection = self.session_connection(remote).await?;

        let (send, recv) = match connection.open_bi().await {
            Ok(streams) => streams,
            Err(e) => {
                // The session died under us; forget it so the next dial
                // reconnects instead of failing forever.
                self.session.lock().await.take();
                return Err(std::io::Error::other(format!(
                    "open stream to {remote}: {e}"
                )));
            }
        };

        let mut stream: Box<dyn AsyncStream> = Box::new(QuicStream::new(send, recv));
        write_target(&mut stream, target).await?;
        Ok(stream)
    }

    async fn listen(&self, local: &str) -> std::io::Result<UnboundedReceiver<TargetedStream>> {
        let addr = resolve_endpoint(local).await?;

        let crypto: QuicServerConfig = Arc::new(create_server_config()?)
            .try_into()
            .map_err(|e| std::io::Error::other(format!("quic server crypto: {e}")))?;
        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));

        Arc::get_mut(&mut server_config.transport)
            .unwrap()
            .max_concurrent_bidi_streams(self.settings.max_incoming_streams.into())
            .max_concurrent_uni_streams(0_u8.into())
            .max_idle_timeout(Some(self.idle_timeout()?));

        let endpoint = quinn::Endpoint::server(server_config, addr)
            .map_err(|e| std::io::Error::new(e.kind(), format!("bind quic {local}: {e}")))?;

        let (sender, receiver) = unbounded_channel();

        tokio::spawn(async move {
            while let Some(incoming) = endpoint.accept().await {
                let sender = sender.clone();
                tokio::spawn(async move {
                    if let Err(e) = accept_session(incoming, sender).await {
                        debug!("quic session ended: {e}");
                    }
                });
            }
            error!("quic endpoint stopped accepting, stopping listener");
        });

        Ok(receiver)
    }
}

/// Accepts every stream of one client session, sniffing each independently.
async fn accept_session(
    incoming: quinn::Incoming,
    sender: UnboundedSender<TargetedStream>,
) -> std::io::Result<()> {
    let connection = incoming
        .await
        .map_err(|e| std::io::Error::other(format!("quic handshake: {e}")))?;
    let peer = connection.remote_address();
    debug!("new quic session from {peer}");

    loop {
        match connection.accept_bi().await {
            Ok((send, recv)) => {
                spawn_sniff_worker(
                    Box::new(QuicStream::new(send, recv)),
                    peer.to_string(),
                    sender.clone(),
                );
            }
            Err(quinn::ConnectionError::ApplicationClosed { .. })
            | Err(quinn::ConnectionError::TimedOut) => {
                debug!("quic session from {peer} closed");
                return Ok(());
            }
            Err(e) => {
                return Err(std::io::Error::other(format!("accept quic stream: {e}")));
            }
        }
    }
}

/// A QUIC bidirectional stream as one duplex byte stream.
pub struct QuicStream {
    send_stream: quinn::SendStream,
    recv_stream: quinn::RecvStream,
}

impl QuicStream {
    pub fn new(send_stream: quinn::SendStream, recv_stream: quinn::RecvStream) -> Self {
        Self {
            send_stream,
            recv_stream,
        }
    }
}

impl AsyncRead for QuicStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().recv_stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        tokio::io::AsyncWrite::poll_write(Pin::new(&mut self.get_mut().send_stream), cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().send_stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().send_stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn free_udp_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn test_dial_and_listen_round_trip() {
        let local = format!("127.0.0.1:{}", free_udp_port());

        let listener = QuicTransport::new(QuicSettings::default());
        let mut connections = listener.listen(&local).await.unwrap();

        let dialer = QuicTransport::new(QuicSettings::default());
        let target = NetLocation::from_str("example.com:8080", None).unwrap();
        let mut outbound = dialer.dial(&local, Some(&target)).await.unwrap();
        outbound.write_all(b"payload").await.unwrap();
        outbound.flush().await.unwrap();

        let tagged = tokio::time::timeout(std::time::Duration::from_secs(10), connections.recv())
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
    async fn test_session_is_reused_across_dials() {
        let local = format!("127.0.0.1:{}", free_udp_port());

        let listener = QuicTransport::new(QuicSettings::default());
        let mut connections = listener.listen(&local).await.unwrap();

        let dialer = QuicTransport::new(QuicSettings::default());
        let target = NetLocation::from_str("example.com:80", None).unwrap();

        let mut first = dialer.dial(&local, Some(&target)).await.unwrap();
        let mut second = dialer.dial(&local, Some(&target)).await.unwrap();
        first.write_all(b"one").await.unwrap();
        first.flush().await.unwrap();
        second.write_all(b"two").await.unwrap();
        second.flush().await.unwrap();

        for _ in 0..2 {
            let tagged =
                tokio::time::timeout(std::time::Duration::from_secs(10), connections.recv())
                    .await
                    .unwrap()
                    .unwrap();
            assert_eq!(tagged.target, target);
        }

        let session = dialer.session.lock().await;
        assert!(session.is_some());
    }
}
