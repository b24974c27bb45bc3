use socket2::SockRef;
use tokio::net::TcpStream;

/// Enables TCP keepalive on a dialed or accepted socket, so half-dead
/// tunnel connections are eventually reaped by the kernel instead of
/// pinning a relay forever.
#[inline]
pub fn set_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    SockRef::from(stream).set_keepalive(true)
}
