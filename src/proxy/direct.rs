use std::sync::Arc;

use log::{debug, warn};
use tokio::net::TcpListener;

use crate::address::NetLocation;
use crate::config::{parse_transport_uri, transport_endpoint, DirectProxyConfig, TransportSettings};
use crate::relay::relay;
use crate::socket_util::set_keepalive;
use crate::transport::{create_transport, Transport};

/// Front end with a fixed destination: everything accepted on the listen
/// address is tunneled to `target_address` through the outlet.
pub async fn run_direct_proxy(
    config: DirectProxyConfig,
    settings: TransportSettings,
) -> std::io::Result<()> {
    let uri = parse_transport_uri(&config.outlet_uri)?;
    let transport = create_transport(&uri, &settings)?;
    let outlet = Arc::new(transport_endpoint(&uri)?);
    let target = Arc::new(NetLocation::from_str(&config.target_address, None)?);

    let listener = TcpListener::bind(&config.listen_address)
        .await
        .map_err(|e| {
            std::io::Error::new(e.kind(), format!("bind {}: {e}", config.listen_address))
        })?;

    println!(
        "Starting direct proxy at {} for {}",
        config.listen_address, target
    );

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
        let target = target.clone();
        tokio::spawn(async move {
            match transport.dial(&outlet, Some(&target)).await {
                Ok(remote) => relay(Box::new(stream), remote).await,
                Err(e) => warn!("{peer}: dial outlet: {e}"),
            }
        });
    }
}
