//! iroh transport for qrdrop.
//!
//! [`IrohEndpoint`] implements [`qrdrop_core::PeerEndpoint`]: the endpoint id
//! is the session identifier shared in the link, and each connection
//! carries one bidirectional stream framed by `qrdrop_core`.

pub mod endpoint;
pub mod identity;
pub mod monitor;
pub mod protocol;

pub use endpoint::{IrohChannel, IrohEndpoint};
pub use identity::generate_session_key;
pub use protocol::ALPN;
