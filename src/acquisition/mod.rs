//! Acquisition subsystem: frames, sequencing, buffering and the engine

pub mod buffer;
pub mod engine;
pub mod frame;
pub mod sequencer;

pub use buffer::{DrainedBlock, SampleRingBuffer, SharedRingBuffer};
pub use engine::{AcquisitionEngine, DataSource, EngineState, EngineStats, StopOutcome};
pub use frame::{RawFrame, SampleFrame};
pub use sequencer::{EventWord, SampleSequencer};
