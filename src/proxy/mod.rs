//! Proxy front ends: orchestration that accepts connections, obtains or
//! forwards a destination, selects a transport, and invokes the relay.

mod direct;
mod http;
mod server;
mod transparent;

pub use direct::run_direct_proxy;
pub use http::run_http_proxy;
pub use server::run_relay_server;
pub use transparent::run_transparent_proxy;
