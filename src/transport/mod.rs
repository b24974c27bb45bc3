//! Pluggable stream transports behind a `{dial, listen}` capability
//! interface. The dial side frames the destination address into the new
//! connection; the listen side sniffs every accepted connection and
//! delivers it already resolved to a destination.

mod kcp;
mod quic;
mod socks5;
mod tcp;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::timeout;
use url::Url;

use crate::address::NetLocation;
use crate::async_stream::AsyncStream;
use crate::config::TransportSettings;
use crate::route::{parse_target, TargetedStream};

pub use kcp::KcpTransport;
pub use quic::QuicTransport;
pub use socks5::Socks5Transport;
pub use tcp::TcpTransport;

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Read deadline for sniffing an accepted connection, so a silent client
/// cannot pin a worker forever.
pub const SNIFF_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait Transport: Send + Sync {
    /// Establishes a connection to `remote` (the next hop) and frames
    /// `target` into it. Fails fast; retrying is the caller's policy.
    async fn dial(
        &self,
        remote: &str,
        target: Option<&NetLocation>,
    ) -> std::io::Result<Box<dyn AsyncStream>>;

    /// Listens on `local` and delivers sniffed, address-tagged connections.
    /// Connections that fail sniffing are closed and never delivered. The
    /// channel closes when the accept loop dies; that is fatal for this
    /// listener only.
    async fn listen(&self, local: &str) -> std::io::Result<UnboundedReceiver<TargetedStream>>;
}

/// Selects a transport backend by URI scheme. Unknown schemes were already
/// rejected during config validation, but listeners must never come up
/// half-configured, so this checks again.
pub fn create_transport(
    uri: &Url,
    settings: &TransportSettings,
) -> std::io::Result<Arc<dyn Transport>> {
    match uri.scheme() {
        "tcp" => Ok(Arc::new(TcpTransport::new())),
        "kcp" => Ok(Arc::new(KcpTransport::new(settings.kcp.clone()))),
        "quic" => Ok(Arc::new(QuicTransport::new(settings.quic.clone()))),
        "socks5" => Ok(Arc::new(Socks5Transport::new())),
        scheme => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("unknown transport scheme {scheme} in {uri}"),
        )),
    }
}

/// One worker per accepted connection: sniff under the read deadline, then
/// deliver. A failed sniff drops (closes) the connection without blocking
/// later deliveries.
pub(crate) fn spawn_sniff_worker(
    stream: Box<dyn AsyncStream>,
    peer: String,
    sender: UnboundedSender<TargetedStream>,
) {
    tokio::spawn(async move {
        match timeout(SNIFF_TIMEOUT, parse_target(stream)).await {
            Ok(Ok((stream, target))) => {
                debug!("{peer}: sniffed destination {target}");
                let _ = sender.send(TargetedStream { stream, target });
            }
            Ok(Err(e)) => {
                debug!("{peer}: sniff failed: {e}");
            }
            Err(_) => {
                debug!("{peer}: sniff timed out");
            }
        }
    });
}
