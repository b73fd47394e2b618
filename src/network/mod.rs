//! Network subsystem for UDP sample transport

pub mod receiver;
pub mod udp;

pub use receiver::{AcquisitionStats, LoopEvent};
pub use udp::{bind, unbind, Endpoint, EndpointHandle, TransportOptions};
