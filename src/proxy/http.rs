use std::sync::Arc;

use log::{debug, error};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use crate::address::NetLocation;
use crate::config::{parse_transport_uri, transport_endpoint, HttpProxyConfig, TransportSettings};
use crate::line_reader::LineReader;
use crate::relay::relay;
use crate::socket_util::set_keepalive;
use crate::transport::{create_transport, Transport};

const CONNECTION_HEADER_PREFIX: &str = "connection:";
const PROXY_CONNECTION_HEADER_PREFIX: &str = "proxy-connection:";
const PROXY_AUTH_HEADER_PREFIX: &str = "proxy-authorization:";

const MAX_REQUEST_LEN: usize = 16384;

/// Explicit HTTP proxy front end: CONNECT requests become tunnels,
/// absolute-form requests are rewritten to origin form and forwarded.
pub async fn run_http_proxy(
    config: HttpProxyConfig,
    settings: TransportSettings,
) -> std::io::Result<()> {
    let uri = parse_transport_uri(&config.outlet_uri)?;
    let transport = create_transport(&uri, &settings)?;
    let outlet = Arc::new(transport_endpoint(&uri)?);

    let listener = TcpListener::bind(&config.listen_address)
        .await
        .map_err(|e| {
            std::io::Error::new(e.kind(), format!("bind {}: {e}", config.listen_address))
        })?;

    println!("Starting http proxy at {}", config.listen_address);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                return Err(std::io::Error::new(
                    e.kind(),
                    format!("accept on {}: {e}", config.listen_address),
                ));
            }
        };
        if let Err(e) = set_keepalive(&stream) {
            debug!("{peer}: set keepalive: {e}");
        }

        let transport = transport.clone();
        let outlet = outlet.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, transport, &outlet).await {
                error!("{peer} finished with error: {e}");
            } else {
                debug!("{peer} finished successfully");
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    transport: Arc<dyn Transport>,
    outlet: &str,
) -> std::io::Result<()> {
    let mut reader = LineReader::new();

    let line = reader.read_line(&mut stream).await?.to_string();
    if !line.ends_with(" HTTP/1.0") && !line.ends_with(" HTTP/1.1") {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("unrecognized http request: {line}"),
        ));
    }

    // Shortest well-formed line: "GET http://a.ab/ HTTP/1.1".
    if line.len() < 19 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid http request: {line}"),
        ));
    }

    let http_version = line[line.len() - 8..].to_string();

    if let Some(address) = line
        .strip_prefix("CONNECT ")
        .map(|rest| &rest[..rest.len() - 9])
    {
        handle_connect(stream, reader, transport, outlet, &http_version, address).await
    } else {
        handle_forward(stream, reader, transport, outlet, &http_version, &line).await
    }
}

async fn handle_connect(
    mut stream: TcpStream,
    mut reader: LineReader,
    transport: Arc<dyn Transport>,
    outlet: &str,
    http_version: &str,
    address: &str,
) -> std::io::Result<()> {
    let target = NetLocation::from_str(address, None).map_err(|e| {
        std::io::Error::new(e.kind(), format!("parse connect address {address}: {e}"))
    })?;

    // Drain the request head; there is no auth to check (non-goal).
    loop {
        let line = reader.read_line(&mut stream).await?;
        if line.is_empty() {
            break;
        }
        debug!("ignored connect header: {line}");
    }

    // For port 443 the outlet can recover the destination from the SNI of
    // the ClientHello that follows, so no frame is spent on it.
    let upstream_target = if target.port() != 443 {
        Some(&target)
    } else {
        None
    };
    let mut upstream = transport.dial(outlet, upstream_target).await?;

    stream
        .write_all(format!("{http_version} 200 Connection established\r\n\r\n").as_bytes())
        .await?;
    stream.flush().await?;

    // Bytes the client sent behind its request head, e.g. an eager TLS
    // hello, must reach the outlet first.
    let leftover = reader.unparsed_data();
    if !leftover.is_empty() {
        upstream.write_all(leftover).await?;
        upstream.flush().await?;
    }

    relay(Box::new(stream), upstream).await;
    Ok(())
}

async fn handle_forward(
    mut stream: TcpStream,
    mut reader: LineReader,
    transport: Arc<dyn Transport>,
    outlet: &str,
    http_version: &str,
    line: &str,
) -> std::io::Result<()> {
    let line = &line[..line.len() - 9];
    let space_index = line.find(' ').ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("unrecognized http request: {line} {http_version}"),
        )
    })?;

    let method = &line[..space_index];
    let url = &line[space_index + 1..];

    // Only plain http can be forwarded this way; https arrives via CONNECT.
    let rest = url.strip_prefix("http://").ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("unsupported http forward url: {url}"),
        )
    })?;

    let (address, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };

    // Validates the authority early; the outlet re-derives the destination
    // from the Host header of the rewritten request.
    let target = NetLocation::from_str(address, Some(80))
        .map_err(|e| std::io::Error::new(e.kind(), format!("parse forward url host: {e}")))?;

    let mut request = format!("{method} {path} {http_version}\r\n");

    loop {
        let line = reader.read_line(&mut stream).await?;
        if line.is_empty() {
            break;
        }

        // Hop-by-hop headers stay here. A Connection header would also
        // force us to parse the remote response to find its end before the
        // next request, so the rewritten request always closes instead.
        let lowercase_line = line.to_ascii_lowercase();
        if lowercase_line.starts_with(CONNECTION_HEADER_PREFIX)
            || lowercase_line.starts_with(PROXY_CONNECTION_HEADER_PREFIX)
            || lowercase_line.starts_with(PROXY_AUTH_HEADER_PREFIX)
        {
            continue;
        }

        request.push_str(line);
        request.push_str("\r\n");

        if request.len() > MAX_REQUEST_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "http request head is too long",
            ));
        }
    }

    request.push_str("Connection: close\r\n\r\n");
    debug!("forwarding {method} request for {target}");

    let mut upstream = transport.dial(outlet, None).await?;
    upstream.write_all(request.as_bytes()).await?;

    let leftover = reader.unparsed_data();
    if !leftover.is_empty() {
        upstream.write_all(leftover).await?;
    }
    upstream.flush().await?;

    // The origin's own response is what the client expects; no status line
    // is interposed here.
    relay(Box::new(stream), upstream).await;
    Ok(())
}
