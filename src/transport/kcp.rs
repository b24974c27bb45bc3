use async_trait::async_trait;
use log::error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::time::timeout;
use tokio_kcp::{KcpConfig, KcpListener, KcpNoDelayConfig, KcpStream};

use crate::address::NetLocation;
use crate::async_stream::AsyncStream;
use crate::config::KcpSettings;
use crate::resolver::resolve_endpoint;
use crate::route::{write_target, TargetedStream};
use crate::transport::{spawn_sniff_worker, Transport, DIAL_TIMEOUT};

/// UDP-based stream transport for lossy links: KCP's aggressive ARQ keeps
/// goodput up where TCP's congestion control collapses.
pub struct KcpTransport {
    settings: KcpSettings,
}

impl KcpTransport {
    pub fn new(settings: KcpSettings) -> Self {
        Self { settings }
    }

    fn kcp_config(&self) -> KcpConfig {
        let mut config = KcpConfig::default();
        config.mtu = self.settings.mtu;
        config.wnd_size = (self.settings.snd_wnd, self.settings.rcv_wnd);
        config.nodelay = if self.settings.nodelay {
            KcpNoDelayConfig::fastest()
        } else {
            KcpNoDelayConfig::normal()
        };
        // Byte stream, not datagrams: the framing codec and the sniffer
        // both assume stream semantics.
        config.stream = true;
        config
    }
}

#[async_trait]
impl Transport for KcpTransport {
    async fn dial(
        &self,
        remote: &str,
        target: Option<&NetLocation>,
    ) -> std::io::Result<Box<dyn AsyncStream>> {
        let addr = resolve_endpoint(remote).await?;
        let config = self.kcp_config();

        let stream = timeout(DIAL_TIMEOUT, KcpStream::connect(&config, addr))
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("dial {remote} over kcp: timed out"),
                )
            })?
            .map_err(|e| std::io::Error::other(format!("dial {remote} over kcp: {e}")))?;

        let mut stream: Box<dyn AsyncStream> = Box::new(stream);
        write_target(&mut stream, target).await?;
        Ok(stream)
    }

    async fn listen(&self, local: &str) -> std::io::Result<UnboundedReceiver<TargetedStream>> {
        let addr = resolve_endpoint(local).await?;
        let mut listener = KcpListener::bind(self.kcp_config(), addr)
            .await
            .map_err(|e| std::io::Error::other(format!("bind kcp {local}: {e}")))?;

        let (sender, receiver) = unbounded_channel();

        tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(v) => v,
                    Err(e) => {
                        error!("kcp accept failed, stopping listener: {e}");
                        break;
                    }
                };
                spawn_sniff_worker(Box::new(stream), peer.to_string(), sender.clone());
            }
        });

        Ok(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_map_onto_kcp_config() {
        let transport = KcpTransport::new(KcpSettings {
            mtu: 1400,
            snd_wnd: 512,
            rcv_wnd: 256,
            nodelay: true,
        });
        let config = transport.kcp_config();
        assert_eq!(config.mtu, 1400);
        assert_eq!(config.wnd_size, (512, 256));
        assert!(config.stream);
    }
}
