use std::net::SocketAddr;

use log::debug;

use crate::address::NetLocation;

/// Resolves a destination to a single socket address using the system
/// resolver. Which domains are steered into this proxy at all is the DNS
/// redirect component's business, not ours, so plain `lookup_host` is
/// enough here.
pub async fn resolve_location(location: &NetLocation) -> std::io::Result<SocketAddr> {
    if let Some(addr) = location.to_socket_addr_nonblocking() {
        return Ok(addr);
    }

    let results = tokio::net::lookup_host((location.address().to_string(), location.port()))
        .await
        .map_err(|e| std::io::Error::new(e.kind(), format!("resolve {location}: {e}")))?
        .filter(|addr| !addr.ip().is_unspecified())
        .collect::<Vec<_>>();

    debug!("resolved {location} -> {results:?}");

    results.first().copied().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("could not resolve location: {location}"),
        )
    })
}

/// Resolves a `host:port` endpoint string, e.g. the host part of an outlet
/// URI or a listen address.
pub async fn resolve_endpoint(endpoint: &str) -> std::io::Result<SocketAddr> {
    let location = NetLocation::from_str(endpoint, None)
        .map_err(|e| std::io::Error::new(e.kind(), format!("parse endpoint {endpoint}: {e}")))?;
    resolve_location(&location).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_literal_addresses() {
        let addr = resolve_endpoint("127.0.0.1:8080").await.unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:8080");

        let location = NetLocation::new(crate::address::Address::from("::1").unwrap(), 53);
        let addr = resolve_location(&location).await.unwrap();
        assert!(addr.is_ipv6());
        assert_eq!(addr.port(), 53);
    }
}
