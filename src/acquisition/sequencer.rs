//! Sample index, timestamp and event word assignment

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::frame::{RawFrame, SampleFrame};

/// Digital-event word shared with the external event subsystem
pub type EventWord = Arc<AtomicU64>;

/// Assigns contiguous sample indices within one acquisition session
pub struct SampleSequencer {
    /// Next sample index to hand out
    counter: u64,
    sample_rate_hz: f64,
    event_word: EventWord,
}

impl SampleSequencer {
    pub fn new(sample_rate_hz: f64, event_word: EventWord) -> Self {
        Self {
            counter: 0,
            sample_rate_hz,
            event_word,
        }
    }

    /// Restart the session at sample index zero
    pub fn reset(&mut self) {
        self.counter = 0;
    }

    /// Index the next tagged sample will receive
    pub fn next_index(&self) -> u64 {
        self.counter
    }

    /// Tag a decoded frame, taking ownership of its samples
    pub fn tag(&mut self, raw: RawFrame) -> SampleFrame {
        let samples = raw.samples_per_frame;
        let mut frame = SampleFrame {
            data: raw,
            sample_indices: vec![0; samples],
            timestamps: vec![0.0; samples],
            event_words: vec![0; samples],
        };
        self.stamp(&mut frame);
        frame
    }

    /// Fill the metadata columns of `frame` in place.
    ///
    /// The event word is sampled once and applied to every column.
    pub fn stamp(&mut self, frame: &mut SampleFrame) {
        let samples = frame.data.samples_per_frame;
        frame.sample_indices.resize(samples, 0);
        frame.timestamps.resize(samples, 0.0);
        frame.event_words.resize(samples, 0);

        let word = self.event_word.load(Ordering::Acquire);
        for column in 0..samples {
            let index = self.counter;
            self.counter += 1;
            frame.sample_indices[column] = index;
            frame.timestamps[column] = index as f64 / self.sample_rate_hz;
            frame.event_words[column] = word;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indices_are_contiguous_across_frames() {
        let mut sequencer = SampleSequencer::new(1000.0, EventWord::default());

        let first = sequencer.tag(RawFrame::new(2, 3));
        let second = sequencer.tag(RawFrame::new(2, 3));

        assert_eq!(first.sample_indices, vec![0, 1, 2]);
        assert_eq!(second.sample_indices, vec![3, 4, 5]);
        assert_eq!(second.timestamps, vec![0.003, 0.004, 0.005]);
        assert_eq!(sequencer.next_index(), 6);
    }

    #[test]
    fn test_event_word_snapshot_per_frame() {
        let word = EventWord::default();
        let mut sequencer = SampleSequencer::new(30000.0, word.clone());

        word.store(0b101, Ordering::Release);
        let frame = sequencer.tag(RawFrame::new(1, 4));
        assert_eq!(frame.event_words, vec![0b101; 4]);

        word.store(0, Ordering::Release);
        let frame = sequencer.tag(RawFrame::new(1, 4));
        assert_eq!(frame.event_words, vec![0; 4]);
    }

    #[test]
    fn test_reset() {
        let mut sequencer = SampleSequencer::new(30000.0, EventWord::default());
        sequencer.tag(RawFrame::new(1, 30));
        sequencer.reset();

        let frame = sequencer.tag(RawFrame::new(1, 2));
        assert_eq!(frame.first_index(), Some(0));
    }
}
