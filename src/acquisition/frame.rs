//! Sample frame types
//!
//! A frame is a `channel_count x samples_per_frame` matrix stored
//! channel-major, so each channel's samples are one contiguous slice.

/// Decoded sample matrix without sequencing metadata
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    /// Channel-major samples, `channel_count * samples_per_frame` values
    pub samples: Vec<f32>,
    pub channel_count: usize,
    pub samples_per_frame: usize,
}

impl RawFrame {
    /// Create a zero-filled frame with the given geometry
    pub fn new(channel_count: usize, samples_per_frame: usize) -> Self {
        Self {
            samples: vec![0.0; channel_count * samples_per_frame],
            channel_count,
            samples_per_frame,
        }
    }

    /// Resize in place, reusing the allocation where possible
    pub fn reshape(&mut self, channel_count: usize, samples_per_frame: usize) {
        self.channel_count = channel_count;
        self.samples_per_frame = samples_per_frame;
        self.samples.resize(channel_count * samples_per_frame, 0.0);
    }

    /// All samples of one channel
    pub fn channel(&self, channel: usize) -> &[f32] {
        let start = channel * self.samples_per_frame;
        &self.samples[start..start + self.samples_per_frame]
    }

    pub fn channel_mut(&mut self, channel: usize) -> &mut [f32] {
        let start = channel * self.samples_per_frame;
        &mut self.samples[start..start + self.samples_per_frame]
    }

    pub fn get(&self, channel: usize, sample: usize) -> f32 {
        self.samples[channel * self.samples_per_frame + sample]
    }
}

/// Decoded frame tagged with per-sample metadata
#[derive(Debug, Clone, PartialEq)]
pub struct SampleFrame {
    pub data: RawFrame,
    /// Session sample index of each column
    pub sample_indices: Vec<u64>,
    /// Seconds since acquisition start, `sample_index / sample_rate`
    pub timestamps: Vec<f64>,
    /// Digital-event word snapshot for each column
    pub event_words: Vec<u64>,
}

impl SampleFrame {
    pub fn new(channel_count: usize, samples_per_frame: usize) -> Self {
        Self {
            data: RawFrame::new(channel_count, samples_per_frame),
            sample_indices: vec![0; samples_per_frame],
            timestamps: vec![0.0; samples_per_frame],
            event_words: vec![0; samples_per_frame],
        }
    }

    pub fn channel_count(&self) -> usize {
        self.data.channel_count
    }

    pub fn samples_per_frame(&self) -> usize {
        self.data.samples_per_frame
    }

    /// First sample index carried by this frame
    pub fn first_index(&self) -> Option<u64> {
        self.sample_indices.first().copied()
    }
}
