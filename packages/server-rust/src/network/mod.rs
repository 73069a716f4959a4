//! Networking: framed TCP listener, per-connection request/response
//! loops, command routing, and graceful shutdown.

pub mod codec;
pub mod connection;
pub mod handlers;
pub mod registry;
pub mod server;
pub mod shutdown;

pub use codec::FrameCodec;
pub use registry::{ConnectionHandle, ConnectionRegistry};
pub use server::{Server, ServerHandle, ServerState};
pub use shutdown::{HealthState, InFlightGuard, ShutdownController};
