//! Connection Registry: upstream server sessions, their states, and recovery.

mod reconnect;
mod registry;
mod state;

pub use reconnect::ReconnectPolicy;
pub use registry::{ConnectionRegistry, ConnectionSnapshot};
pub use state::ConnectionState;
