use std::sync::Arc;

use log::{debug, error, warn};
use tokio::net::TcpListener;
use tokio::time::timeout;

use crate::config::{
    parse_transport_uri, transport_endpoint, TransparentProxyConfig, TransportSettings,
};
use crate::relay::relay;
use crate::route::parse_target;
use crate::socket_util::set_keepalive;
use crate::transport::{create_transport, Transport, SNIFF_TIMEOUT};

/// Transparent front end: the DNS redirect component steers selected
/// domains to `serve_ip`, whose ports 80 and 443 land here. Each connection
/// is sniffed locally for its real destination, then tunneled through the
/// outlet with the destination framed; the sniffed bytes replay into the
/// tunnel untouched.
pub async fn run_transparent_proxy(
    config: TransparentProxyConfig,
    settings: TransportSettings,
) -> std::io::Result<()> {
    let uri = parse_transport_uri(&config.outlet_uri)?;
    let transport = create_transport(&uri, &settings)?;
    let outlet = Arc::new(transport_endpoint(&uri)?);

    let mut listeners = Vec::with_capacity(2);
    for port in [80u16, 443] {
        let listen_address = format!("{}:{}", config.serve_ip, port);
        let listener = TcpListener::bind(&listen_address)
            .await
            .map_err(|e| std::io::Error::new(e.kind(), format!("bind {listen_address}: {e}")))?;
        println!("Starting transparent proxy at {listen_address}");
        listeners.push((listen_address, listener));
    }

    let mut tasks = Vec::with_capacity(listeners.len());
    for (listen_address, listener) in listeners {
        let transport = transport.clone();
        let outlet = outlet.clone();
        tasks.push(tokio::spawn(async move {
            run_listener(listen_address, listener, transport, outlet).await
        }));
    }

    // Each listener failure is its own; the front end as a whole reports
    // the first one.
    for task in tasks {
        match task.await {
            Ok(result) => result?,
            Err(e) => return Err(std::io::Error::other(format!("listener task: {e}"))),
        }
    }
    unreachable!("transparent listeners run forever");
}

async fn run_listener(
    listen_address: String,
    listener: TcpListener,
    transport: Arc<dyn Transport>,
    outlet: Arc<String>,
) -> std::io::Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                error!("accept on {listen_address} failed: {e}");
                return Err(std::io::Error::new(
                    e.kind(),
                    format!("accept on {listen_address}: {e}"),
                ));
            }
        };
        if let Err(e) = set_keepalive(&stream) {
            debug!("{peer}: set keepalive: {e}");
        }

        let transport = transport.clone();
        let outlet = outlet.clone();
        tokio::spawn(async move {
            let sniffed = match timeout(SNIFF_TIMEOUT, parse_target(Box::new(stream))).await {
                Ok(Ok(v)) => v,
                Ok(Err(e)) => {
                    debug!("{peer}: sniff failed: {e}");
                    return;
                }
                Err(_) => {
                    debug!("{peer}: sniff timed out");
                    return;
                }
            };

            let (stream, target) = sniffed;
            match transport.dial(&outlet, Some(&target)).await {
                Ok(remote) => {
                    debug!("{peer}: tunneling to {target}");
                    relay(stream, remote).await;
                }
                Err(e) => warn!("{peer}: dial outlet for {target}: {e}"),
            }
        });
    }
}
