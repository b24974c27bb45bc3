use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use crate::address::{Address, NetLocation};
use crate::async_stream::AsyncStream;
use crate::line_reader::LineReader;
use crate::resolver::resolve_endpoint;
use crate::route::TargetedStream;
use crate::socket_util::set_keepalive;
use crate::tee_stream::TeeStream;
use crate::transport::{Transport, DIAL_TIMEOUT};

pub const VER_SOCKS5: u8 = 0x05;

pub const METHOD_NONE: u8 = 0x00;
pub const METHOD_INVALID: u8 = 0xff;

pub const CMD_CONNECT: u8 = 0x01;

pub const RESULT_SUCCESS: u8 = 0x00;

pub const ADDR_TYPE_IPV4: u8 = 0x01;
pub const ADDR_TYPE_DOMAIN_NAME: u8 = 0x03;
pub const ADDR_TYPE_IPV6: u8 = 0x04;

/// Escape hatch for environments that already have an egress proxy: instead
/// of framing an address toward a shunt outlet, speak the SOCKS5 CONNECT
/// handshake to a fixed upstream.
pub struct Socks5Transport;

impl Socks5Transport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Socks5Transport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for Socks5Transport {
    async fn dial(
        &self,
        remote: &str,
        target: Option<&NetLocation>,
    ) -> std::io::Result<Box<dyn AsyncStream>> {
        // SOCKS5 has no equivalent of "destination decided later".
        let target = target.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "socks5 upstream requires an explicit target address",
            )
        })?;

        let addr = resolve_endpoint(remote).await?;
        let mut stream = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("dial socks5 upstream {remote}: timed out"),
                )
            })?
            .map_err(|e| {
                std::io::Error::new(e.kind(), format!("dial socks5 upstream {remote}: {e}"))
            })?;
        set_keepalive(&stream)
            .map_err(|e| std::io::Error::new(e.kind(), format!("set keepalive: {e}")))?;

        // Greeting, no-auth only, and the connect request in one write.
        let mut request = vec![VER_SOCKS5, 1, METHOD_NONE, VER_SOCKS5, CMD_CONNECT, 0x00];
        encode_location(&mut request, target);
        stream.write_all(&request).await?;
        stream.flush().await?;

        let mut reader = LineReader::with_buffer_size(512);

        let version = reader.read_u8(&mut stream).await?;
        if version != VER_SOCKS5 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unsupported socks version: {version}"),
            ));
        }

        let method = reader.read_u8(&mut stream).await?;
        if method != METHOD_NONE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("socks5 upstream rejected auth method: {method:#04x}"),
            ));
        }

        let version = reader.read_u8(&mut stream).await?;
        if version != VER_SOCKS5 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unsupported socks version in reply: {version}"),
            ));
        }

        let status = reader.read_u8(&mut stream).await?;
        if status != RESULT_SUCCESS {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("socks5 connect to {target} failed: status {status}"),
            ));
        }

        let _reserved = reader.read_u8(&mut stream).await?;

        // Bound address in the reply; nothing useful in it for us.
        let address_type = reader.read_u8(&mut stream).await?;
        match address_type {
            ADDR_TYPE_IPV4 => {
                reader.read_slice(&mut stream, 4 + 2).await?;
            }
            ADDR_TYPE_IPV6 => {
                reader.read_slice(&mut stream, 16 + 2).await?;
            }
            ADDR_TYPE_DOMAIN_NAME => {
                let len = reader.read_u8(&mut stream).await? as usize;
                reader.read_slice(&mut stream, len + 2).await?;
            }
            _ => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unknown address type in socks5 reply: {address_type}"),
                ));
            }
        }

        // Early remote bytes may have been coalesced with the reply; they
        // belong to the stream the caller gets back.
        let leftover = reader.unparsed_data();
        let stream: Box<dyn AsyncStream> = if leftover.is_empty() {
            Box::new(stream)
        } else {
            Box::new(TeeStream::with_replay(stream, leftover.to_vec()))
        };
        Ok(stream)
    }

    async fn listen(&self, _local: &str) -> std::io::Result<UnboundedReceiver<TargetedStream>> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "socks5 transport cannot listen",
        ))
    }
}

fn encode_location(buf: &mut Vec<u8>, location: &NetLocation) {
    let (address, port) = location.components();
    match address {
        Address::Ipv4(addr) => {
            buf.push(ADDR_TYPE_IPV4);
            buf.extend_from_slice(&addr.octets());
        }
        Address::Ipv6(addr) => {
            buf.push(ADDR_TYPE_IPV6);
            buf.extend_from_slice(&addr.octets());
        }
        Address::Hostname(hostname) => {
            buf.push(ADDR_TYPE_DOMAIN_NAME);
            buf.push(hostname.len() as u8);
            buf.extend_from_slice(hostname.as_bytes());
        }
    }
    buf.extend_from_slice(&port.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn run_fake_upstream(listener: TcpListener) {
        let (mut stream, _) = listener.accept().await.unwrap();

        let mut greeting = [0u8; 3];
        stream.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [VER_SOCKS5, 1, METHOD_NONE]);
        stream.write_all(&[VER_SOCKS5, METHOD_NONE]).await.unwrap();

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await.unwrap();
        assert_eq!(head, [VER_SOCKS5, CMD_CONNECT, 0x00, ADDR_TYPE_DOMAIN_NAME]);

        let mut len = [0u8; 1];
        stream.read_exact(&mut len).await.unwrap();
        let mut name = vec![0u8; len[0] as usize + 2];
        stream.read_exact(&mut name).await.unwrap();
        assert_eq!(&name[..len[0] as usize], b"example.com");
        assert_eq!(&name[len[0] as usize..], &8080u16.to_be_bytes()[..]);

        stream
            .write_all(&[
                VER_SOCKS5,
                RESULT_SUCCESS,
                0x00,
                ADDR_TYPE_IPV4,
                0,
                0,
                0,
                0,
                0,
                0,
            ])
            .await
            .unwrap();

        // Echo one round of payload.
        let mut payload = [0u8; 4];
        stream.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"ping");
        stream.write_all(b"pong").await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = listener.local_addr().unwrap();
        let upstream = tokio::spawn(run_fake_upstream(listener));

        let transport = Socks5Transport::new();
        let target = NetLocation::from_str("example.com:8080", None).unwrap();
        let mut stream = transport
            .dial(&upstream_addr.to_string(), Some(&target))
            .await
            .unwrap();

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        upstream.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_without_target_is_rejected() {
        let transport = Socks5Transport::new();
        let err = transport.dial("127.0.0.1:1080", None).await.err().unwrap();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_listen_is_unsupported() {
        let transport = Socks5Transport::new();
        let err = transport.listen("127.0.0.1:1080").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::Unsupported);
    }
}
