//! The RPC proxy surface: wire framing, the accept loop, and the backend
//! forwarder.

pub mod forward;
pub mod server;
pub mod wire;
