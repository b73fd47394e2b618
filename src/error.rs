//! Error types for the acquisition bridge

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Bind error: {0}")]
    Bind(#[from] BindError),

    #[error("Read error: {0}")]
    Read(#[from] ReadError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Failed to parse settings: {0}")]
    ParseSettings(#[from] toml::de::Error),

    #[error("Failed to write settings: {0}")]
    WriteSettings(#[from] toml::ser::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Rejected configuration writes. The previous value is always retained.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Port {0} outside (1023, 65535)")]
    PortOutOfRange(i64),

    #[error("Sample rate {0} Hz outside (0, 50000]")]
    SampleRateOutOfRange(f64),

    #[error("Channel scale {0} outside (0, 9999.9)")]
    ScaleOutOfRange(f64),

    #[error("Channel offset {0} outside [0, 65536)")]
    OffsetOutOfRange(f64),

    #[error("Channel count must be positive")]
    ZeroChannels,

    #[error("Samples per frame must be positive")]
    ZeroSamplesPerFrame,

    #[error("Ring capacity {capacity} cannot hold one frame of {samples_per_frame} samples")]
    CapacityTooSmall {
        capacity: usize,
        samples_per_frame: usize,
    },

    #[error("Frame of {needed} bytes exceeds the largest accepted datagram ({max} bytes)")]
    FrameTooLarge { needed: usize, max: usize },

    #[error("Read timeout {0:?} outside (0, stop timeout)")]
    ReadTimeoutOutOfRange(std::time::Duration),

    #[error("Datagram limit {0} bytes outside (0, 65507]")]
    DatagramLimitOutOfRange(usize),

    #[error("Geometry cannot change while streaming")]
    GeometryLocked,
}

/// Transport bind failures
#[derive(Error, Debug)]
pub enum BindError {
    #[error("Socket creation failed: {0}")]
    Socket(std::io::Error),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    #[error("Failed to configure socket: {0}")]
    Configure(std::io::Error),
}

/// Transport receive failures
#[derive(Error, Debug)]
pub enum ReadError {
    #[error("Endpoint closed")]
    Closed,

    #[error("Datagram exceeded the {capacity} byte receive buffer")]
    Truncated { capacity: usize },

    #[error("Receive timed out")]
    TimedOut,

    #[error("Receive failed: {0}")]
    Io(std::io::Error),
}

impl ReadError {
    /// Whether the receive loop must exit after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReadError::Closed)
    }
}

/// Frame decoding failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Short frame: got {got} bytes, expected {expected}")]
    ShortFrame { got: usize, expected: usize },
}

/// Frame encoding failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("Invalid frame geometry: {got_channels}x{got_samples}, expected {channels}x{samples}")]
    InvalidFrameSize {
        got_channels: usize,
        got_samples: usize,
        channels: usize,
        samples: usize,
    },
}

/// Ring buffer failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("Buffer overflow: frame needs {needed} slots, {free} free")]
    Overflow { needed: usize, free: usize },

    #[error("Frame has {got} channels, buffer holds {expected}")]
    ChannelMismatch { got: usize, expected: usize },

    #[error("Wait for free space interrupted")]
    Interrupted,
}

/// Lifecycle errors reported by the acquisition engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Operation {op} not valid in state {state:?}")]
    InvalidState {
        op: &'static str,
        state: crate::acquisition::EngineState,
    },

    #[error("Failed to spawn receive thread: {0}")]
    Spawn(std::io::Error),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
