//! # Gemini Bridge
//!
//! Low-latency acquisition of a multichannel sample stream over UDP into a
//! bounded ring buffer drained by a real-time processing pipeline.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          SAMPLE SOURCE                               │
//! │        one datagram per frame: channels x samples, no header         │
//! └──────────────────────────────────┬───────────────────────────────────┘
//!                                    │ UDP
//!                                    ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                      ACQUISITION ENGINE                              │
//! │                                                                      │
//! │  connect() ──► network::udp::bind ── Endpoint (exclusive port)       │
//! │                                                                      │
//! │  start_acquisition() spawns the receive thread:                      │
//! │  ┌────────────────────────────────────────────────────────────────┐  │
//! │  │  Endpoint.receive ─► FrameDecoder ─► SampleSequencer ─► push   │  │
//! │  │   (timed, stop-aware)  (format/layout)  (index, ts, events)    │  │
//! │  └────────────────────────────────────────────────────────┬───────┘  │
//! │                                                           ▼          │
//! │                                     ┌───────────────────────────┐    │
//! │                                     │     SampleRingBuffer      │    │
//! │                                     │  columnar, bounded, SPSC  │    │
//! │                                     └─────────────┬─────────────┘    │
//! └───────────────────────────────────────────────────┼──────────────────┘
//!                                                     │ drain once per cycle
//!                                                     ▼
//!                                       downstream processing pipeline
//! ```

pub mod acquisition;
pub mod codec;
pub mod config;
pub mod error;
pub mod network;

pub use acquisition::{AcquisitionEngine, DataSource, DrainedBlock, EngineState, StopOutcome};
pub use config::Configuration;
pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default UDP port for the sample stream
    pub const DEFAULT_PORT: u16 = 51002;

    /// Default sample rate in Hz
    pub const DEFAULT_SAMPLE_RATE: f64 = 30000.0;

    /// Default per-channel scale
    pub const DEFAULT_DATA_SCALE: f64 = 1.0;

    /// Default per-channel offset
    pub const DEFAULT_DATA_OFFSET: f64 = 0.0;

    /// Default ring buffer capacity in sample slots
    pub const DEFAULT_RING_CAPACITY: usize = 12000;

    /// Default channel count
    pub const DEFAULT_NUM_CHANNELS: usize = 192;

    /// Default samples carried by one datagram
    pub const DEFAULT_NUM_SAMPLES: usize = 30;

    /// Port limits, both exclusive
    pub const MIN_PORT: i64 = 1023;
    pub const MAX_PORT: i64 = 65535;

    /// Sample rate limits, lower exclusive
    pub const MIN_SAMPLE_RATE: f64 = 0.0;
    pub const MAX_SAMPLE_RATE: f64 = 50000.0;

    /// Scale limits, both exclusive
    pub const MIN_DATA_SCALE: f64 = 0.0;
    pub const MAX_DATA_SCALE: f64 = 9999.9;

    /// Offset limits, upper exclusive
    pub const MIN_DATA_OFFSET: f64 = 0.0;
    pub const MAX_DATA_OFFSET: f64 = 65536.0;

    /// Maximum UDP payload over IPv4
    pub const MAX_DATAGRAM_SIZE: usize = 65507;

    /// Receive timeout used to re-check the stop flag
    pub const DEFAULT_READ_TIMEOUT_MS: u64 = 50;

    /// Bounded wait for the receive loop on stop
    pub const STOP_TIMEOUT_MS: u64 = 500;
}
