//! Virtual-host routing for tunneled HTTP and HTTPS traffic.
//!
//! A shared [`RouteTable`] maps `(host, path prefix)` pairs (or bare SNI
//! hosts) to the tunnel that registered them; the [`http`] and [`https`]
//! handlers consume accepted connections and splice them into work
//! connections pulled from that tunnel.

pub mod http;
pub mod https;
pub mod sni;
pub mod table;

pub use http::{handle_http_connection, HttpProxyConfig};
pub use https::{handle_https_connection, DEFAULT_SNI_TIMEOUT};
pub use table::{BoxedStream, IoStream, RouteMatch, RouteTable, RouteTarget, VhostError, VhostRoute};
