//! Sample frame to datagram encoder
//!
//! The inverse of [`FrameDecoder`](super::FrameDecoder), used by the
//! synthetic sender and by loopback tests. Values are written as raw counts;
//! no scale or offset is applied.

use bytes::{BufMut, Bytes, BytesMut};

use crate::acquisition::frame::RawFrame;
use crate::config::{SampleFormat, SampleLayout};
use crate::error::EncodeError;

/// Fixed-geometry frame encoder
pub struct FrameEncoder {
    channel_count: usize,
    samples_per_frame: usize,
    format: SampleFormat,
    layout: SampleLayout,
    /// Frame counter for statistics
    frames_encoded: u64,
}

impl FrameEncoder {
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
            frames_encoded: 0,
        }
    }

    /// Datagram size produced for one frame
    pub fn frame_len(&self) -> usize {
        self.channel_count * self.samples_per_frame * self.format.width()
    }

    /// Encode one frame into a new datagram body
    pub fn encode(&self, frame: &RawFrame) -> Result<Bytes, EncodeError> {
        let mut buf = BytesMut::with_capacity(self.frame_len());
        self.encode_into(frame, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Append one encoded frame to `buf`
    pub fn encode_into(&self, frame: &RawFrame, buf: &mut BytesMut) -> Result<(), EncodeError> {
        if frame.channel_count != self.channel_count || frame.samples_per_frame != self.samples_per_frame {
            return Err(EncodeError::InvalidFrameSize {
                got_channels: frame.channel_count,
                got_samples: frame.samples_per_frame,
                channels: self.channel_count,
                samples: self.samples_per_frame,
            });
        }

        buf.reserve(self.frame_len());
        match self.layout {
            SampleLayout::Interleaved => {
                for sample in 0..self.samples_per_frame {
                    for channel in 0..self.channel_count {
                        write_sample(buf, self.format, frame.get(channel, sample));
                    }
                }
            }
            SampleLayout::ChannelMajor => {
                for &value in &frame.samples {
                    write_sample(buf, self.format, value);
                }
            }
        }
        Ok(())
    }

    /// Encode and count a frame
    pub fn encode_counted(&mut self, frame: &RawFrame) -> Result<Bytes, EncodeError> {
        let bytes = self.encode(frame)?;
        self.frames_encoded += 1;
        Ok(bytes)
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded
    }
}

fn write_sample(buf: &mut BytesMut, format: SampleFormat, value: f32) {
    match format {
        SampleFormat::I16Le => buf.put_i16_le(value as i16),
        SampleFormat::I16Be => buf.put_i16(value as i16),
        SampleFormat::U16Le => buf.put_u16_le(value as u16),
        SampleFormat::U16Be => buf.put_u16(value as u16),
        SampleFormat::I32Le => buf.put_i32_le(value as i32),
        SampleFormat::I32Be => buf.put_i32(value as i32),
        SampleFormat::F32Le => buf.put_f32_le(value),
        SampleFormat::F32Be => buf.put_f32(value),
    }
}
