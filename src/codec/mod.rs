//! Sample matrix wire codec
//!
//! Converts between UDP datagram bodies and channel-major sample frames
//! using the configured sample format and layout.

pub mod decoder;
pub mod encoder;

pub use decoder::{DecoderStats, FrameDecoder};
pub use encoder::FrameEncoder;
