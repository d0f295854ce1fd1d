//! Connection demultiplexing for the shared listening port.
//!
//! Two layers: [`port`] fans one TCP listener into protocol-typed
//! sub-listeners by sniffing first bytes; [`stream`] carries many logical
//! streams over a single client connection.

pub mod port;
pub mod sniff;
pub mod stream;

pub use port::{MuxedConn, PortMux, SniffedStream, SubListener};
pub use stream::{MuxConfig, MuxSession, MuxStream};
