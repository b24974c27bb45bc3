//! shunt - a protocol-sniffing forward proxy.
//!
//! A single listening socket serves three kinds of client without any
//! pre-negotiation: framed tunnel connections, raw TLS, and raw HTTP. The
//! first byte decides; the destination comes from the address frame, the
//! ClientHello SNI, or the Host header. Resolved connections are relayed
//! over one of several pluggable stream transports (TCP, KCP over UDP,
//! multiplexed QUIC streams, or a fixed SOCKS5 upstream).

pub mod address;
pub mod async_stream;
pub mod buf_reader;
pub mod config;
pub mod line_reader;
pub mod proxy;
pub mod relay;
pub mod resolver;
pub mod route;
pub mod rustls_util;
pub mod socket_util;
pub mod tee_stream;
pub mod tls_sniff;
pub mod transport;
