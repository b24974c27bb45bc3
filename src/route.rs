//! Address framing and protocol sniffing: the zero-round-trip scheme that
//! lets one listening socket serve framed tunnel clients, raw TLS, and raw
//! HTTP without any pre-negotiation.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::address::{Address, NetLocation};
use crate::async_stream::AsyncStream;
use crate::line_reader::LineReader;
use crate::tee_stream::TeeStream;
use crate::tls_sniff;

/// Marks a framed tunnel connection. ASCII ESC: it can lead neither a TLS
/// handshake record (0x16) nor an HTTP request line (an ASCII letter).
pub const SIGNAL: u8 = 0x1b;

/// Practical DNS name length bound.
pub const MAX_ADDRESS_LEN: usize = 253;

/// A connection whose destination has been resolved, either from an address
/// frame or by sniffing the first bytes of the stream.
pub struct TargetedStream {
    pub stream: Box<dyn AsyncStream>,
    pub target: NetLocation,
}

/// Frames `target` into a freshly dialed stream: `[signal][len][addr]`.
///
/// With no target nothing is written and the peer sees the stream
/// untouched; its listen side is expected to sniff the destination instead.
/// An oversized address shuts the stream down without transmitting any part
/// of the frame.
pub async fn write_target<S: AsyncWrite + Unpin>(
    stream: &mut S,
    target: Option<&NetLocation>,
) -> std::io::Result<()> {
    let target = match target {
        Some(target) => target,
        None => return Ok(()),
    };

    let addr = target.to_string();
    if addr.len() > MAX_ADDRESS_LEN {
        let _ = stream.shutdown().await;
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("target address is too long ({} bytes): {addr}", addr.len()),
        ));
    }

    let mut frame = Vec::with_capacity(2 + addr.len());
    frame.push(SIGNAL);
    frame.push(addr.len() as u8);
    frame.extend_from_slice(addr.as_bytes());

    let result = async {
        stream.write_all(&frame).await?;
        stream.flush().await
    }
    .await;

    if let Err(e) = result {
        let _ = stream.shutdown().await;
        return Err(std::io::Error::new(
            e.kind(),
            format!("write target address: {e}"),
        ));
    }
    Ok(())
}

/// Classifies an inbound connection by its first byte and resolves the
/// destination it is for.
///
/// The returned stream yields exactly what the destination server needs to
/// see next: for framed connections, the raw bytes following the frame; for
/// sniffed TLS/HTTP connections, a replay of the entire ClientHello or
/// request head. On error the connection is dropped (closed) with the tee.
pub async fn parse_target(
    stream: Box<dyn AsyncStream>,
) -> std::io::Result<(Box<dyn AsyncStream>, NetLocation)> {
    let mut tee = TeeStream::new(stream);
    tee.start_or_reset();

    let mut signal = [0u8; 1];
    tee.read_exact(&mut signal)
        .await
        .map_err(|e| std::io::Error::new(e.kind(), format!("read protocol signal: {e}")))?;

    match signal[0] {
        SIGNAL => {
            // The frame is consumed from the raw stream; nothing replays.
            let mut stream = tee.into_inner();
            let target = read_framed_target(&mut stream).await?;
            Ok((stream, target))
        }
        tls_sniff::RECORD_TYPE_HANDSHAKE => {
            tee.start_or_reset();
            let host = tls_sniff::read_sni_host(&mut tee).await?;
            tee.stop();
            // TLS carries no destination port; 443 is assumed.
            let target = NetLocation::new(Address::from(&host)?, 443);
            Ok((Box::new(tee), target))
        }
        _ => {
            tee.start_or_reset();
            let target = read_http_target(&mut tee).await?;
            tee.stop();
            Ok((Box::new(tee), target))
        }
    }
}

async fn read_framed_target<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<NetLocation> {
    let mut len = [0u8; 1];
    stream
        .read_exact(&mut len)
        .await
        .map_err(|e| std::io::Error::new(e.kind(), format!("read address length: {e}")))?;

    let mut addr = vec![0u8; len[0] as usize];
    stream
        .read_exact(&mut addr)
        .await
        .map_err(|e| std::io::Error::new(e.kind(), format!("read framed address: {e}")))?;

    let addr = String::from_utf8(addr).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("framed address is not utf-8: {e}"),
        )
    })?;

    NetLocation::from_str(&addr, None)
        .map_err(|e| std::io::Error::new(e.kind(), format!("parse framed address: {e}")))
}

async fn read_http_target<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<NetLocation> {
    let mut reader = LineReader::new();

    {
        let line = reader
            .read_line(stream)
            .await
            .map_err(|e| std::io::Error::new(e.kind(), format!("read http request line: {e}")))?;

        if !line.ends_with(" HTTP/1.0") && !line.ends_with(" HTTP/1.1") {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unrecognized http request: {line}"),
            ));
        }

        let line = &line[0..line.len() - 9];
        let space_index = line.find(' ').ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("malformed http request line: {line}"),
            )
        })?;

        // Absolute-form proxy requests carry the destination in the request
        // target itself.
        let uri = &line[space_index + 1..];
        if let Some(rest) = uri.strip_prefix("http://") {
            let host = match rest.find('/') {
                Some(i) => &rest[0..i],
                None => rest,
            };
            if !host.is_empty() {
                return NetLocation::from_str(host, Some(80));
            }
        }
    }

    loop {
        let line = reader
            .read_line(stream)
            .await
            .map_err(|e| std::io::Error::new(e.kind(), format!("read http header: {e}")))?;

        if line.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "no host header in http request",
            ));
        }

        if line.len() > 5 && line[0..5].eq_ignore_ascii_case("host:") {
            let host = line[5..].trim();
            return NetLocation::from_str(host, Some(80)).map_err(|e| {
                std::io::Error::new(e.kind(), format!("parse host header: {e}"))
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls_sniff::build_client_hello;
    use tokio::io::duplex;

    async fn parse(server: tokio::io::DuplexStream) -> std::io::Result<(Box<dyn AsyncStream>, NetLocation)> {
        parse_target(Box::new(server)).await
    }

    #[tokio::test]
    async fn test_framed_target_round_trip() {
        let (mut client, server) = duplex(4096);

        let target = NetLocation::from_str("example.com:8080", None).unwrap();
        write_target(&mut client, Some(&target)).await.unwrap();
        client.write_all(b"payload").await.unwrap();

        let (mut stream, parsed) = parse(server).await.unwrap();
        assert_eq!(parsed, target);

        let mut buf = [0u8; 7];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[tokio::test]
    async fn test_framed_target_round_trips_max_length() {
        let (mut client, server) = duplex(4096);

        let host = format!("{}.example.com", "a".repeat(MAX_ADDRESS_LEN - 15));
        let addr = format!("{host}:80");
        assert_eq!(addr.len(), MAX_ADDRESS_LEN);
        let target = NetLocation::from_str(&addr, None).unwrap();

        write_target(&mut client, Some(&target)).await.unwrap();
        let (_stream, parsed) = parse(server).await.unwrap();
        assert_eq!(parsed.to_string(), addr);
    }

    #[tokio::test]
    async fn test_no_target_writes_nothing() {
        let (mut client, mut server) = duplex(4096);

        write_target(&mut client, None).await.unwrap();
        client.write_all(b"untouched").await.unwrap();

        let mut buf = [0u8; 9];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"untouched");
    }

    #[tokio::test]
    async fn test_oversized_target_closes_without_writing() {
        let (mut client, mut server) = duplex(4096);

        let host = "a".repeat(MAX_ADDRESS_LEN);
        let target = NetLocation::from_str(&format!("{host}:80"), None).unwrap();

        let err = write_target(&mut client, Some(&target)).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);

        // The write side was shut down with no bytes transmitted.
        let mut buf = [0u8; 16];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_sniff_http_request() {
        let (mut client, server) = duplex(4096);

        let request = b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\nabc";
        client.write_all(request).await.unwrap();

        let (mut stream, target) = parse(server).await.unwrap();
        assert_eq!(target.to_string(), "example.com:80");

        // The downstream consumer sees the identical request, body included.
        let mut replay = vec![0u8; request.len()];
        stream.read_exact(&mut replay).await.unwrap();
        assert_eq!(replay, request);
    }

    #[tokio::test]
    async fn test_sniff_http_host_header_port() {
        let (mut client, server) = duplex(4096);
        client
            .write_all(b"POST /submit HTTP/1.1\r\nAccept: */*\r\nHost: example.com:8080\r\n\r\n")
            .await
            .unwrap();

        let (_stream, target) = parse(server).await.unwrap();
        assert_eq!(target.to_string(), "example.com:8080");
    }

    #[tokio::test]
    async fn test_sniff_tls_client_hello() {
        let (mut client, server) = duplex(4096);

        let hello = build_client_hello("example.com");
        client.write_all(&hello).await.unwrap();

        let (mut stream, target) = parse(server).await.unwrap();
        assert_eq!(target.to_string(), "example.com:443");

        // The full record replays for the destination server.
        let mut replay = vec![0u8; hello.len()];
        stream.read_exact(&mut replay).await.unwrap();
        assert_eq!(replay, hello);
    }

    #[tokio::test]
    async fn test_framed_signal_takes_precedence_over_tls_chaser() {
        let (mut client, server) = duplex(4096);

        let target = NetLocation::from_str("example.com:8080", None).unwrap();
        write_target(&mut client, Some(&target)).await.unwrap();
        let hello = build_client_hello("mismatched.example");
        client.write_all(&hello).await.unwrap();

        let (mut stream, parsed) = parse(server).await.unwrap();
        assert_eq!(parsed, target);

        // The chaser is application payload, readable untouched.
        let mut replay = vec![0u8; hello.len()];
        stream.read_exact(&mut replay).await.unwrap();
        assert_eq!(replay, hello);
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_error() {
        let (mut client, server) = duplex(4096);

        client.write_all(&[SIGNAL, 20, b'e', b'x']).await.unwrap();
        drop(client);

        let err = parse(server).await.err().unwrap();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_http_without_host_is_an_error() {
        let (mut client, server) = duplex(4096);
        client
            .write_all(b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n")
            .await
            .unwrap();

        let err = parse(server).await.err().unwrap();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
