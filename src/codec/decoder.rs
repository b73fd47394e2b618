//! Datagram to sample frame decoder
//!
//! A datagram body is a flat sample matrix with no header. The decoder
//! validates the length before touching the output, so a short datagram
//! never leaves a partially populated frame behind.

use bytes::Buf;

use crate::acquisition::frame::RawFrame;
use crate::config::{Configuration, SampleFormat, SampleLayout};
use crate::error::DecodeError;

/// Fixed-geometry frame decoder
pub struct FrameDecoder {
    channel_count: usize,
    samples_per_frame: usize,
    format: SampleFormat,
    layout: SampleLayout,
    scale: f64,
    offset: f64,
    /// Frames decoded
    frames_decoded: u64,
    /// Datagrams rejected as short
    short_frames: u64,
    /// Trailing padding bytes discarded
    bytes_discarded: u64,
}

impl FrameDecoder {
    /// Create a decoder with unit scale and zero offset
    pub fn new(
        channel_count: usize,
        samples_per_frame: usize,
        format: SampleFormat,
        layout: SampleLayout,
    ) -> Self {
        Self {
            channel_count,
            samples_per_frame,
            format,
            layout,
            scale: 1.0,
            offset: 0.0,
            frames_decoded: 0,
            short_frames: 0,
            bytes_discarded: 0,
        }
    }

    /// Create a decoder matching the configured geometry, format and scaling
    pub fn from_config(config: &Configuration) -> Self {
        Self::new(
            config.channel_count(),
            config.samples_per_frame(),
            config.sample_format(),
            config.layout,
        )
        .with_scaling(config.channel_scale(), config.channel_offset())
    }

    /// Apply `(raw - offset) * scale` to every decoded value
    pub fn with_scaling(mut self, scale: f64, offset: f64) -> Self {
        self.scale = scale;
        self.offset = offset;
        self
    }

    /// Bytes required for one full frame
    pub fn expected_len(&self) -> usize {
        self.channel_count
            .saturating_mul(self.samples_per_frame)
            .saturating_mul(self.format.width())
    }

    /// Decode one datagram into a newly allocated frame
    pub fn decode(&mut self, data: &[u8]) -> Result<RawFrame, DecodeError> {
        let mut frame = RawFrame::new(self.channel_count, self.samples_per_frame);
        self.decode_into(data, &mut frame)?;
        Ok(frame)
    }

    /// Decode one datagram into a reusable frame.
    ///
    /// `out` is left untouched when the datagram is short. Bytes past the
    /// expected length are padding and are discarded.
    pub fn decode_into(&mut self, data: &[u8], out: &mut RawFrame) -> Result<(), DecodeError> {
        let expected = self.expected_len();
        if data.len() < expected {
            self.short_frames += 1;
            return Err(DecodeError::ShortFrame {
                got: data.len(),
                expected,
            });
        }

        if data.len() > expected {
            let excess = data.len() - expected;
            self.bytes_discarded += excess as u64;
            tracing::trace!("Discarding {} padding bytes", excess);
        }

        if out.channel_count != self.channel_count || out.samples_per_frame != self.samples_per_frame {
            out.reshape(self.channel_count, self.samples_per_frame);
        }

        let mut body = &data[..expected];
        let total = self.channel_count * self.samples_per_frame;
        for i in 0..total {
            let (channel, sample) = match self.layout {
                SampleLayout::Interleaved => (i % self.channel_count, i / self.channel_count),
                SampleLayout::ChannelMajor => (i / self.samples_per_frame, i % self.samples_per_frame),
            };
            let raw = read_sample(&mut body, self.format);
            out.samples[channel * self.samples_per_frame + sample] =
                ((raw - self.offset) * self.scale) as f32;
        }

        self.frames_decoded += 1;
        Ok(())
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    pub fn samples_per_frame(&self) -> usize {
        self.samples_per_frame
    }

    /// Get statistics
    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            frames_decoded: self.frames_decoded,
            short_frames: self.short_frames,
            bytes_discarded: self.bytes_discarded,
        }
    }

    /// Reset statistics
    pub fn reset_stats(&mut self) {
        self.frames_decoded = 0;
        self.short_frames = 0;
        self.bytes_discarded = 0;
    }
}

fn read_sample(buf: &mut &[u8], format: SampleFormat) -> f64 {
    match format {
        SampleFormat::I16Le => buf.get_i16_le() as f64,
        SampleFormat::I16Be => buf.get_i16() as f64,
        SampleFormat::U16Le => buf.get_u16_le() as f64,
        SampleFormat::U16Be => buf.get_u16() as f64,
        SampleFormat::I32Le => buf.get_i32_le() as f64,
        SampleFormat::I32Be => buf.get_i32() as f64,
        SampleFormat::F32Le => buf.get_f32_le() as f64,
        SampleFormat::F32Be => buf.get_f32() as f64,
    }
}

/// Decoder statistics
#[derive(Debug, Clone, Default)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    pub short_frames: u64,
    pub bytes_discarded: u64,
}
