//! Acquisition configuration
//!
//! The parameter set is owned by the caller and handed to the engine. Every
//! setter validates against the node limits and leaves the previous value in
//! place when a write is rejected, so a bad entry from a parameter UI or a
//! stale settings file can never push the engine into an invalid state.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{ConfigError, Result};

/// Numeric encoding of one sample value on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
    I16Le,
    I16Be,
    U16Le,
    U16Be,
    I32Le,
    I32Be,
    F32Le,
    F32Be,
}

impl SampleFormat {
    /// Width of one sample in bytes
    pub fn width(&self) -> usize {
        match self {
            SampleFormat::I16Le | SampleFormat::I16Be | SampleFormat::U16Le | SampleFormat::U16Be => 2,
            SampleFormat::I32Le | SampleFormat::I32Be | SampleFormat::F32Le | SampleFormat::F32Be => 4,
        }
    }
}

/// Order of sample values inside a datagram body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleLayout {
    /// All channels of sample 0, then all channels of sample 1, ...
    Interleaved,
    /// All samples of channel 0, then all samples of channel 1, ...
    ChannelMajor,
}

/// What the ring buffer does when the consumer falls behind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Block the producer until the consumer frees enough slots
    Block,
    /// Fail the push with `BufferError::Overflow`
    Reject,
}

/// Validated acquisition parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    port: u16,
    sample_rate_hz: f64,
    channel_scale: f64,
    channel_offset: f64,
    channel_count: usize,
    samples_per_frame: usize,
    ring_capacity: usize,
    sample_format: SampleFormat,
    read_timeout: Duration,
    max_datagram_bytes: usize,

    /// Wire ordering of the sample matrix
    pub layout: SampleLayout,
    /// Local address to bind, all IPv4 interfaces by default
    pub bind_address: IpAddr,
    /// Ring buffer behaviour when full
    pub overflow_policy: OverflowPolicy,
    /// Kernel receive buffer size, OS default when `None`
    pub recv_buffer_bytes: Option<usize>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            sample_rate_hz: DEFAULT_SAMPLE_RATE,
            channel_scale: DEFAULT_DATA_SCALE,
            channel_offset: DEFAULT_DATA_OFFSET,
            channel_count: DEFAULT_NUM_CHANNELS,
            samples_per_frame: DEFAULT_NUM_SAMPLES,
            ring_capacity: DEFAULT_RING_CAPACITY,
            sample_format: SampleFormat::I16Le,
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            max_datagram_bytes: MAX_DATAGRAM_SIZE,
            layout: SampleLayout::Interleaved,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            overflow_policy: OverflowPolicy::Block,
            recv_buffer_bytes: None,
        }
    }
}

impl Configuration {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn sample_rate_hz(&self) -> f64 {
        self.sample_rate_hz
    }

    pub fn channel_scale(&self) -> f64 {
        self.channel_scale
    }

    pub fn channel_offset(&self) -> f64 {
        self.channel_offset
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    pub fn samples_per_frame(&self) -> usize {
        self.samples_per_frame
    }

    pub fn ring_capacity(&self) -> usize {
        self.ring_capacity
    }

    /// Wire encoding of a sample value
    pub fn sample_format(&self) -> SampleFormat {
        self.sample_format
    }

    /// Receive timeout used to re-check the stop flag
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Largest datagram accepted before it is reported as truncated
    pub fn max_datagram_bytes(&self) -> usize {
        self.max_datagram_bytes
    }

    /// Payload bytes needed to populate one full sample frame
    pub fn frame_bytes(&self) -> usize {
        payload_bytes(self.channel_count, self.samples_per_frame, self.sample_format)
    }

    /// Set the UDP port. Both bounds are exclusive.
    pub fn set_port(&mut self, port: i64) -> std::result::Result<u16, ConfigError> {
        if port > MIN_PORT && port < MAX_PORT {
            self.port = port as u16;
            Ok(self.port)
        } else {
            Err(ConfigError::PortOutOfRange(port))
        }
    }

    pub fn set_sample_rate(&mut self, hz: f64) -> std::result::Result<f64, ConfigError> {
        if hz > MIN_SAMPLE_RATE && hz <= MAX_SAMPLE_RATE {
            self.sample_rate_hz = hz;
            Ok(hz)
        } else {
            Err(ConfigError::SampleRateOutOfRange(hz))
        }
    }

    pub fn set_channel_scale(&mut self, scale: f64) -> std::result::Result<f64, ConfigError> {
        if scale > MIN_DATA_SCALE && scale < MAX_DATA_SCALE {
            self.channel_scale = scale;
            Ok(scale)
        } else {
            Err(ConfigError::ScaleOutOfRange(scale))
        }
    }

    pub fn set_channel_offset(&mut self, offset: f64) -> std::result::Result<f64, ConfigError> {
        if offset >= MIN_DATA_OFFSET && offset < MAX_DATA_OFFSET {
            self.channel_offset = offset;
            Ok(offset)
        } else {
            Err(ConfigError::OffsetOutOfRange(offset))
        }
    }

    /// Set channel count and samples per frame together.
    ///
    /// The frame must fit in one datagram and in the ring buffer.
    pub fn set_geometry(
        &mut self,
        channel_count: usize,
        samples_per_frame: usize,
    ) -> std::result::Result<(usize, usize), ConfigError> {
        if channel_count == 0 {
            return Err(ConfigError::ZeroChannels);
        }
        if samples_per_frame == 0 {
            return Err(ConfigError::ZeroSamplesPerFrame);
        }
        let needed = payload_bytes(channel_count, samples_per_frame, self.sample_format);
        if needed > self.max_datagram_bytes {
            return Err(ConfigError::FrameTooLarge {
                needed,
                max: self.max_datagram_bytes,
            });
        }
        if samples_per_frame > self.ring_capacity {
            return Err(ConfigError::CapacityTooSmall {
                capacity: self.ring_capacity,
                samples_per_frame,
            });
        }
        self.channel_count = channel_count;
        self.samples_per_frame = samples_per_frame;
        Ok((channel_count, samples_per_frame))
    }

    /// Set the ring buffer capacity in sample slots
    pub fn set_ring_capacity(&mut self, capacity: usize) -> std::result::Result<usize, ConfigError> {
        if capacity < self.samples_per_frame {
            return Err(ConfigError::CapacityTooSmall {
                capacity,
                samples_per_frame: self.samples_per_frame,
            });
        }
        self.ring_capacity = capacity;
        Ok(capacity)
    }

    /// Change the wire encoding. The current geometry must still fit one datagram.
    pub fn set_sample_format(&mut self, format: SampleFormat) -> std::result::Result<SampleFormat, ConfigError> {
        let needed = payload_bytes(self.channel_count, self.samples_per_frame, format);
        if needed > self.max_datagram_bytes {
            return Err(ConfigError::FrameTooLarge {
                needed,
                max: self.max_datagram_bytes,
            });
        }
        self.sample_format = format;
        Ok(format)
    }

    /// Set the receive timeout. It must be positive and shorter than the stop wait.
    pub fn set_read_timeout(&mut self, timeout: Duration) -> std::result::Result<Duration, ConfigError> {
        if timeout.is_zero() || timeout >= Duration::from_millis(STOP_TIMEOUT_MS) {
            return Err(ConfigError::ReadTimeoutOutOfRange(timeout));
        }
        self.read_timeout = timeout;
        Ok(timeout)
    }

    /// Set the datagram size limit, at most one IPv4 UDP payload and at least one frame
    pub fn set_max_datagram_bytes(&mut self, bytes: usize) -> std::result::Result<usize, ConfigError> {
        if bytes == 0 || bytes > MAX_DATAGRAM_SIZE {
            return Err(ConfigError::DatagramLimitOutOfRange(bytes));
        }
        let needed = self.frame_bytes();
        if needed > bytes {
            return Err(ConfigError::FrameTooLarge { needed, max: bytes });
        }
        self.max_datagram_bytes = bytes;
        Ok(bytes)
    }

    /// Restore persisted parameters through the validating setters.
    ///
    /// Every rejected field keeps its current value; the rejections are returned
    /// so the caller can report them.
    pub fn restore(&mut self, saved: &PersistedParameters) -> Vec<ConfigError> {
        let mut rejected = Vec::new();
        if let Err(e) = self.set_port(saved.port) {
            rejected.push(e);
        }
        if let Err(e) = self.set_sample_rate(saved.fs) {
            rejected.push(e);
        }
        if let Err(e) = self.set_channel_scale(saved.scale) {
            rejected.push(e);
        }
        if let Err(e) = self.set_channel_offset(saved.offset) {
            rejected.push(e);
        }
        rejected
    }

    /// Snapshot of the user-facing parameters for persistence
    pub fn persisted(&self) -> PersistedParameters {
        PersistedParameters {
            port: self.port as i64,
            fs: self.sample_rate_hz,
            scale: self.channel_scale,
            offset: self.channel_offset,
        }
    }
}

/// Bytes of one frame on the wire, saturating at `usize::MAX`
fn payload_bytes(channel_count: usize, samples_per_frame: usize, format: SampleFormat) -> usize {
    channel_count
        .checked_mul(samples_per_frame)
        .and_then(|values| values.checked_mul(format.width()))
        .unwrap_or(usize::MAX)
}

/// The four user-set parameters saved between sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedParameters {
    pub port: i64,
    pub fs: f64,
    pub scale: f64,
    pub offset: f64,
}

impl Default for PersistedParameters {
    fn default() -> Self {
        Configuration::default().persisted()
    }
}

impl PersistedParameters {
    /// Default settings file location in the platform config directory
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "gemini-bridge")
            .map(|dirs| dirs.config_dir().join("parameters.toml"))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }
}
