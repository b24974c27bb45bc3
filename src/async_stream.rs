use tokio::io::{AsyncRead, AsyncWrite};

/// Object-safe bound for the duplex byte streams this crate relays.
///
/// Transport backends hand out `Box<dyn AsyncStream>` so that the sniffer
/// and the relay never care whether bytes travel over TCP, KCP, a QUIC
/// stream, or an in-memory pipe in tests.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}
