//! Direct forward proxy
//!
//! - Plain HTTP requests are forwarded to the origin and the response is
//!   relayed back
//! - CONNECT requests are turned into raw byte tunnels
//! - Every session logs one summary line on success

pub mod codec;
pub mod engine;
pub mod format;
pub mod server;
pub mod session;
pub mod sink;
pub mod transport;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::{DirectEngine, ResponseSummary};
pub use format::{beautify_duration, beautify_size};
pub use server::ProxyServer;
pub use session::{Session, SessionLogger, SessionTag, TracingLogger};
pub use sink::{ConnSink, ResponseSink};
pub use transport::{DirectTransport, ProxyBody, ProxyConnection, Transport};
pub use tunnel::{TunnelState, TunnelSummary, CONNECT_ACK};
