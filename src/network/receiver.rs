//! Background receive loop
//!
//! One dedicated thread per acquisition session:
//! receive -> decode -> sequence -> push. Non-fatal failures set the shared
//! error flag and the loop carries on with the next datagram; only a closed
//! endpoint ends the session from inside the loop.

use crossbeam::atomic::AtomicCell;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::acquisition::buffer::SharedRingBuffer;
use crate::acquisition::frame::SampleFrame;
use crate::acquisition::sequencer::SampleSequencer;
use crate::acquisition::EngineState;
use crate::codec::FrameDecoder;
use crate::error::{BufferError, EngineError, ReadError};
use crate::network::udp::EndpointHandle;

/// Capacity of the loop to engine event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Notable things the loop reports to the engine
#[derive(Debug, Clone, PartialEq)]
pub enum LoopEvent {
    /// Datagram dropped, loop continues
    Warning(String),
    /// Unrecoverable fault, loop exited
    Fault(String),
}

/// State shared between the engine and its receive loop
pub struct LoopShared {
    pub running: AtomicBool,
    pub error_flag: AtomicBool,
    pub state: AtomicCell<EngineState>,
    pub counters: LoopCounters,
}

impl LoopShared {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            error_flag: AtomicBool::new(false),
            state: AtomicCell::new(EngineState::Idle),
            counters: LoopCounters::default(),
        }
    }
}

impl Default for LoopShared {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-session counters
#[derive(Default)]
pub struct LoopCounters {
    pub datagrams: AtomicU64,
    pub frames: AtomicU64,
    pub samples: AtomicU64,
    pub decode_errors: AtomicU64,
    pub read_errors: AtomicU64,
    pub truncated: AtomicU64,
    pub overflows: AtomicU64,
}

impl LoopCounters {
    pub fn reset(&self) {
        for counter in [
            &self.datagrams,
            &self.frames,
            &self.samples,
            &self.decode_errors,
            &self.read_errors,
            &self.truncated,
            &self.overflows,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> AcquisitionStats {
        AcquisitionStats {
            datagrams_received: self.datagrams.load(Ordering::Relaxed),
            frames_decoded: self.frames.load(Ordering::Relaxed),
            samples_pushed: self.samples.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            truncated_datagrams: self.truncated.load(Ordering::Relaxed),
            overflow_events: self.overflows.load(Ordering::Relaxed),
        }
    }
}

/// Acquisition statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AcquisitionStats {
    pub datagrams_received: u64,
    pub frames_decoded: u64,
    pub samples_pushed: u64,
    pub decode_errors: u64,
    pub read_errors: u64,
    pub truncated_datagrams: u64,
    pub overflow_events: u64,
}

/// Everything the loop owns for one session
pub struct ReceiveLoop {
    pub endpoint: EndpointHandle,
    pub decoder: FrameDecoder,
    pub sequencer: SampleSequencer,
    pub buffer: SharedRingBuffer,
    pub shared: Arc<LoopShared>,
    pub events: Sender<LoopEvent>,
    /// Datagram scratch, one sentinel byte past the largest datagram
    pub recv_buf: Vec<u8>,
    /// Frame scratch reused across iterations
    pub frame: SampleFrame,
}

/// Outcome of one loop iteration
enum Step {
    Continue,
    Exit,
}

impl ReceiveLoop {
    /// Run until the engine clears `running` or the endpoint closes
    pub fn run(mut self) {
        tracing::info!("Receive loop started on {}", self.endpoint.local_addr());

        while self.shared.running.load(Ordering::Acquire) {
            if let Step::Exit = self.iterate() {
                break;
            }
        }

        tracing::info!(
            "Receive loop exiting after {} frames",
            self.shared.counters.frames.load(Ordering::Relaxed)
        );
    }

    fn iterate(&mut self) -> Step {
        let counters = &self.shared.counters;
        match self.endpoint.receive(&mut self.recv_buf) {
            Ok(n) => {
                counters.datagrams.fetch_add(1, Ordering::Relaxed);
                self.handle_datagram(n)
            }
            Err(ReadError::TimedOut) => Step::Continue,
            Err(ReadError::Closed) => {
                if self.shared.running.load(Ordering::Acquire) {
                    self.fault("Endpoint closed while streaming".to_string());
                }
                Step::Exit
            }
            Err(e @ ReadError::Truncated { .. }) => {
                counters.truncated.fetch_add(1, Ordering::Relaxed);
                self.warn(format!("Dropped datagram: {}", e));
                Step::Continue
            }
            Err(e @ ReadError::Io(_)) => {
                counters.read_errors.fetch_add(1, Ordering::Relaxed);
                self.warn(format!("Receive failed: {}", e));
                Step::Continue
            }
        }
    }

    fn handle_datagram(&mut self, len: usize) -> Step {
        let counters = &self.shared.counters;

        if let Err(e) = self.decoder.decode_into(&self.recv_buf[..len], &mut self.frame.data) {
            counters.decode_errors.fetch_add(1, Ordering::Relaxed);
            self.warn(format!("Dropped datagram: {}", e));
            return Step::Continue;
        }

        self.sequencer.stamp(&mut self.frame);

        match self.buffer.push(&self.frame) {
            Ok(()) => {
                counters.frames.fetch_add(1, Ordering::Relaxed);
                counters
                    .samples
                    .fetch_add(self.frame.samples_per_frame() as u64, Ordering::Relaxed);
                Step::Continue
            }
            Err(BufferError::Interrupted) => Step::Exit,
            Err(e) => {
                counters.overflows.fetch_add(1, Ordering::Relaxed);
                self.warn(format!("Frame not buffered: {}", e));
                Step::Continue
            }
        }
    }

    // Events are queued before the flag flips so a caller that observes the
    // flag can already poll the matching status.
    fn warn(&self, message: String) {
        tracing::warn!("{}", message);
        let _ = self.events.try_send(LoopEvent::Warning(message));
        self.shared.error_flag.store(true, Ordering::Release);
    }

    fn fault(&self, message: String) {
        tracing::error!("{}", message);
        let _ = self.events.try_send(LoopEvent::Fault(message));
        self.shared.error_flag.store(true, Ordering::Release);
        self.shared.state.store(EngineState::Error);
    }
}

/// Signals loop exit even if the loop panics
struct ExitNotice(Sender<()>);

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.0.try_send(());
    }
}

/// Handle to a running receive loop thread
pub struct ReceiveLoopHandle {
    thread: Option<JoinHandle<()>>,
    exited: Receiver<()>,
}

impl ReceiveLoopHandle {
    /// Wait up to `timeout` for the loop to exit.
    ///
    /// Returns `false` and detaches the thread when it does not finish in time.
    pub fn join_timeout(mut self, timeout: Duration) -> bool {
        match self.exited.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(thread) = self.thread.take() {
                    if thread.join().is_err() {
                        tracing::error!("Receive loop panicked");
                    }
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                self.thread.take();
                false
            }
        }
    }
}

/// Create the event channel consumed by the engine
pub fn event_channel() -> (Sender<LoopEvent>, Receiver<LoopEvent>) {
    bounded(EVENT_CHANNEL_CAPACITY)
}

/// Start `receive_loop` on its own named thread
pub fn spawn(receive_loop: ReceiveLoop) -> Result<ReceiveLoopHandle, EngineError> {
    let name = format!("udp-receive-{}", receive_loop.endpoint.port());
    spawn_named(name, move || receive_loop.run())
}

/// Run `work` on a named thread that signals its exit to the handle
pub(crate) fn spawn_named<F>(name: String, work: F) -> Result<ReceiveLoopHandle, EngineError>
where
    F: FnOnce() + Send + 'static,
{
    let (exit_tx, exit_rx) = bounded::<()>(1);

    let thread = thread::Builder::new()
        .name(name)
        .spawn(move || {
            let _notice = ExitNotice(exit_tx);
            work();
        })
        .map_err(EngineError::Spawn)?;

    Ok(ReceiveLoopHandle {
        thread: Some(thread),
        exited: exit_rx,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::buffer::SampleRingBuffer;
    use crate::acquisition::sequencer::EventWord;
    use crate::config::{OverflowPolicy, SampleFormat, SampleLayout};
    use crate::network::udp::{self, TransportOptions};
    use std::net::{IpAddr, Ipv4Addr, UdpSocket};

    fn start_loop(channels: usize, samples: usize) -> (ReceiveLoopHandle, Arc<LoopShared>, SharedRingBuffer, EndpointHandle) {
        let options = TransportOptions {
            read_timeout: Some(Duration::from_millis(10)),
            recv_buffer_bytes: None,
        };
        let endpoint = udp::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, &options).unwrap();
        let buffer = Arc::new(SampleRingBuffer::new(channels, 1000, OverflowPolicy::Reject));
        let shared = Arc::new(LoopShared::new());
        shared.running.store(true, Ordering::Release);
        let (events, _rx) = event_channel();

        let receive_loop = ReceiveLoop {
            endpoint: endpoint.clone(),
            decoder: FrameDecoder::new(channels, samples, SampleFormat::I16Le, SampleLayout::Interleaved),
            sequencer: SampleSequencer::new(1000.0, EventWord::default()),
            buffer: buffer.clone(),
            shared: shared.clone(),
            events,
            recv_buf: vec![0; 1025],
            frame: SampleFrame::new(channels, samples),
        };
        (spawn(receive_loop).unwrap(), shared, buffer, endpoint)
    }

    fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_loop_decodes_and_skips_short_datagrams() {
        let (handle, shared, buffer, endpoint) = start_loop(2, 2);
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();

        sender.send_to(&[1, 0, 2, 0, 3, 0, 4, 0], endpoint.local_addr()).unwrap();
        sender.send_to(&[1, 0], endpoint.local_addr()).unwrap();
        sender.send_to(&[5, 0, 6, 0, 7, 0, 8, 0], endpoint.local_addr()).unwrap();

        wait_for(|| shared.counters.datagrams.load(Ordering::Relaxed) == 3);
        wait_for(|| buffer.len() == 4);

        let block = buffer.drain_all();
        assert_eq!(block.sample_indices, vec![0, 1, 2, 3]);
        assert_eq!(block.channel(0), &[1.0, 3.0, 5.0, 7.0]);
        assert_eq!(shared.counters.decode_errors.load(Ordering::Relaxed), 1);
        assert!(shared.error_flag.load(Ordering::Acquire));

        shared.running.store(false, Ordering::Release);
        assert!(handle.join_timeout(Duration::from_millis(500)));
    }

    #[test]
    fn test_unbind_while_running_is_fatal() {
        let (handle, shared, _buffer, endpoint) = start_loop(1, 1);
        shared.state.store(EngineState::Streaming);

        udp::unbind(&endpoint);

        assert!(handle.join_timeout(Duration::from_millis(500)));
        assert_eq!(shared.state.load(), EngineState::Error);
        assert!(shared.error_flag.load(Ordering::Acquire));
    }
}
