use serde::Deserialize;
use url::Url;

use crate::address::NetLocation;

/// Process configuration, constructed once at startup and passed into each
/// front end. There is no global configuration state; a config-file change
/// is handled by tearing the servers down and starting over with a freshly
/// loaded value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The outlet end: listens via a transport and relays to the framed or
    /// sniffed destination.
    #[serde(default)]
    pub relay: Option<RelayServerConfig>,

    #[serde(default)]
    pub http_proxies: Vec<HttpProxyConfig>,

    #[serde(default)]
    pub direct_proxies: Vec<DirectProxyConfig>,

    #[serde(default)]
    pub transparent: Option<TransparentProxyConfig>,

    #[serde(default)]
    pub transports: TransportSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayServerConfig {
    /// Transport URI to listen on, e.g. `tcp://0.0.0.0:5533`.
    pub listen_uri: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpProxyConfig {
    pub listen_address: String,
    /// Transport URI of the outlet, e.g. `kcp://proxy.example.com:5533`.
    pub outlet_uri: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirectProxyConfig {
    pub listen_address: String,
    pub outlet_uri: String,
    /// Fixed destination every accepted connection is tunneled to.
    pub target_address: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransparentProxyConfig {
    /// Local IP whose ports 80 and 443 receive the DNS-redirected traffic.
    pub serve_ip: String,
    pub outlet_uri: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransportSettings {
    #[serde(default)]
    pub kcp: KcpSettings,
    #[serde(default)]
    pub quic: QuicSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct KcpSettings {
    pub mtu: usize,
    pub snd_wnd: u16,
    pub rcv_wnd: u16,
    /// Trades bandwidth for latency: turns off the usual delayed-ack and
    /// congestion-window behavior.
    pub nodelay: bool,
}

impl Default for KcpSettings {
    fn default() -> Self {
        Self {
            mtu: 1350,
            snd_wnd: 1024,
            rcv_wnd: 1024,
            nodelay: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct QuicSettings {
    /// Sessions are torn down after this long with no open streams.
    pub idle_timeout_secs: u64,
    pub max_incoming_streams: u32,
}

impl Default for QuicSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30,
            max_incoming_streams: 1024,
        }
    }
}

pub async fn load_config(path: &str) -> std::io::Result<Config> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| std::io::Error::new(e.kind(), format!("read config {path}: {e}")))?;

    let config: Config = serde_yaml::from_str(&contents).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("parse config {path}: {e}"),
        )
    })?;

    config.validate()?;
    Ok(config)
}

impl Config {
    /// Startup validation: every URI must parse with a known scheme and a
    /// usable endpoint. A listener must never come up in a degraded mode,
    /// so any failure here is fatal.
    pub fn validate(&self) -> std::io::Result<()> {
        if self.relay.is_none()
            && self.http_proxies.is_empty()
            && self.direct_proxies.is_empty()
            && self.transparent.is_none()
        {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "config defines no servers",
            ));
        }

        if let Some(relay) = &self.relay {
            let uri = parse_transport_uri(&relay.listen_uri)?;
            if uri.scheme() == "socks5" {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "a socks5 upstream cannot be listened on",
                ));
            }
        }

        for proxy in &self.http_proxies {
            parse_transport_uri(&proxy.outlet_uri)?;
        }

        for proxy in &self.direct_proxies {
            parse_transport_uri(&proxy.outlet_uri)?;
            NetLocation::from_str(&proxy.target_address, None).map_err(|e| {
                std::io::Error::new(
                    e.kind(),
                    format!("invalid target address {}: {e}", proxy.target_address),
                )
            })?;
        }

        if let Some(transparent) = &self.transparent {
            parse_transport_uri(&transparent.outlet_uri)?;
        }

        Ok(())
    }
}

pub const TRANSPORT_SCHEMES: &[&str] = &["tcp", "kcp", "quic", "socks5"];

/// Parses and checks a transport URI: known scheme, host and port present.
pub fn parse_transport_uri(uri: &str) -> std::io::Result<Url> {
    let parsed = Url::parse(uri).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid transport uri {uri}: {e}"),
        )
    })?;

    if !TRANSPORT_SCHEMES.contains(&parsed.scheme()) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("unknown transport scheme {} in {uri}", parsed.scheme()),
        ));
    }

    transport_endpoint(&parsed)?;
    Ok(parsed)
}

/// The `host:port` a transport URI dials or listens on.
pub fn transport_endpoint(uri: &Url) -> std::io::Result<String> {
    let host = uri.host_str().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("no host in transport uri: {uri}"),
        )
    })?;
    let port = uri.port().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("no port in transport uri: {uri}"),
        )
    })?;
    Ok(format!("{host}:{port}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
relay:
  listen_uri: "tcp://0.0.0.0:5533"
http_proxies:
  - listen_address: "127.0.0.1:8080"
    outlet_uri: "kcp://proxy.example.com:5533"
direct_proxies:
  - listen_address: "127.0.0.1:2222"
    outlet_uri: "quic://proxy.example.com:5533"
    target_address: "ssh.example.com:22"
transparent:
  serve_ip: "10.0.0.2"
  outlet_uri: "tcp://proxy.example.com:5533"
transports:
  kcp:
    mtu: 1400
    nodelay: true
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.transports.kcp.mtu, 1400);
        assert!(config.transports.kcp.nodelay);
        // Unspecified settings keep their defaults.
        assert_eq!(config.transports.kcp.snd_wnd, 1024);
        assert_eq!(config.transports.quic.idle_timeout_secs, 30);
    }

    #[test]
    fn test_unknown_scheme_is_fatal() {
        let yaml = r#"
http_proxies:
  - listen_address: "127.0.0.1:8080"
    outlet_uri: "carrier-pigeon://proxy.example.com:5533"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_config_is_rejected() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_socks5_cannot_listen() {
        let yaml = r#"
relay:
  listen_uri: "socks5://0.0.0.0:1080"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }
}
