//! Acquisition engine
//!
//! Owns the endpoint, the ring buffer and the receive loop thread, and
//! drives them through `Idle -> Bound -> Streaming -> Idle`. Any state can
//! fall into `Error` when the loop hits an unrecoverable fault; an explicit
//! disconnect (or a stop) brings it back to `Idle`. Nothing here retries or
//! reconnects on its own.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::buffer::{BufferStats, DrainedBlock, SampleRingBuffer, SharedRingBuffer};
use super::frame::SampleFrame;
use super::sequencer::{EventWord, SampleSequencer};
use crate::codec::FrameDecoder;
use crate::config::Configuration;
use crate::constants::STOP_TIMEOUT_MS;
use crate::error::{ConfigError, EngineError, Result};
use crate::network::receiver::{self, AcquisitionStats, LoopEvent, LoopShared, ReceiveLoop, ReceiveLoopHandle};
use crate::network::udp::{self, EndpointHandle, TransportOptions};

/// Engine connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    /// No endpoint bound
    Idle,
    /// Endpoint bound, loop not running
    Bound,
    /// Receive loop active
    Streaming,
    /// Unrecoverable fault, cleared by disconnect
    Error,
}

/// How a stop request completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Loop exited within the timeout
    Stopped,
    /// Loop did not exit in time and was abandoned
    TimedOut,
    /// No loop was running
    NotRunning,
}

/// Lifecycle surface the host pipeline drives
pub trait DataSource {
    /// Bind the configured port, releasing any previous binding first
    fn connect(&mut self) -> Result<()>;

    /// Release the endpoint. Safe in any state.
    fn disconnect(&mut self);

    /// Start streaming. Only valid while `Bound`.
    fn start_acquisition(&mut self) -> Result<()>;

    /// Stop streaming with a bounded wait. Always ends `Idle`.
    fn stop_acquisition(&mut self) -> StopOutcome;

    /// Whether a fault occurred since the last start
    fn error_flag(&self) -> bool;

    /// Whether an endpoint is currently bound
    fn found_input_source(&self) -> bool;

    /// Change channel count and ring capacity. Not valid while streaming.
    fn resize_buffers(&mut self, channel_count: usize, capacity: usize) -> Result<()>;

    /// Move buffered samples to the consumer, once per processing cycle
    fn drain_into(&self, block: &mut DrainedBlock, max_samples: usize) -> usize;

    /// Last human-readable status
    fn status_message(&self) -> String;
}

/// Serializable engine snapshot
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub state: EngineState,
    pub error_flag: bool,
    pub acquisition: AcquisitionStats,
    pub buffer: BufferStats,
}

/// UDP acquisition engine
pub struct AcquisitionEngine {
    config: RwLock<Configuration>,
    endpoint: Option<EndpointHandle>,
    buffer: SharedRingBuffer,
    shared: Arc<LoopShared>,
    event_word: EventWord,
    events_tx: Sender<LoopEvent>,
    events_rx: Receiver<LoopEvent>,
    receive_loop: Option<ReceiveLoopHandle>,
    status: Mutex<String>,
    stop_timeout: Duration,
}

impl AcquisitionEngine {
    pub fn new(config: Configuration) -> Self {
        let buffer = Arc::new(SampleRingBuffer::new(
            config.channel_count(),
            config.ring_capacity(),
            config.overflow_policy,
        ));
        let (events_tx, events_rx) = receiver::event_channel();

        Self {
            config: RwLock::new(config),
            endpoint: None,
            buffer,
            shared: Arc::new(LoopShared::new()),
            event_word: EventWord::default(),
            events_tx,
            events_rx,
            receive_loop: None,
            status: Mutex::new(String::new()),
            stop_timeout: Duration::from_millis(STOP_TIMEOUT_MS),
        }
    }

    pub fn state(&self) -> EngineState {
        self.shared.state.load()
    }

    /// Copy of the current configuration
    pub fn config(&self) -> Configuration {
        self.config.read().clone()
    }

    /// Apply validated configuration changes.
    ///
    /// Changes are read at the next connect or start. Geometry, ring
    /// capacity and wire format are locked while streaming; such an edit is
    /// rolled back and reported as [`ConfigError::GeometryLocked`].
    pub fn configure<R, F>(&self, f: F) -> std::result::Result<R, ConfigError>
    where
        F: FnOnce(&mut Configuration) -> std::result::Result<R, ConfigError>,
    {
        let mut config = self.config.write();
        let before = config.clone();
        let result = f(&mut *config)?;

        let geometry_changed = config.channel_count() != before.channel_count()
            || config.samples_per_frame() != before.samples_per_frame()
            || config.ring_capacity() != before.ring_capacity()
            || config.sample_format() != before.sample_format()
            || config.layout != before.layout;
        if geometry_changed && self.state() == EngineState::Streaming {
            *config = before;
            return Err(ConfigError::GeometryLocked);
        }
        Ok(result)
    }

    /// Shared handle for a consumer on another thread
    pub fn buffer(&self) -> SharedRingBuffer {
        self.buffer.clone()
    }

    /// Update the digital-event word stamped on subsequent samples
    pub fn set_event_word(&self, word: u64) {
        self.event_word.store(word, Ordering::Release);
    }

    /// Override the bounded wait used by `stop_acquisition`
    pub fn set_stop_timeout(&mut self, timeout: Duration) {
        self.stop_timeout = timeout;
    }

    /// Local address of the bound endpoint
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.endpoint.as_ref().map(|endpoint| endpoint.local_addr())
    }

    /// Fold pending loop events into the status message and return them
    pub fn poll_events(&self) -> Vec<LoopEvent> {
        let events: Vec<LoopEvent> = self.events_rx.try_iter().collect();
        if let Some(last) = events.last() {
            let message = match last {
                LoopEvent::Warning(m) => m.clone(),
                LoopEvent::Fault(m) => format!("Acquisition fault: {}", m),
            };
            self.set_status(message);
        }
        events
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            state: self.state(),
            error_flag: self.error_flag(),
            acquisition: self.shared.counters.snapshot(),
            buffer: self.buffer.stats(),
        }
    }

    fn set_status(&self, message: impl Into<String>) {
        *self.status.lock() = message.into();
    }

    fn release_endpoint(&mut self) -> bool {
        match self.endpoint.take() {
            Some(endpoint) => {
                udp::unbind(&endpoint);
                true
            }
            None => false,
        }
    }

    /// Stop the loop thread if one is running
    fn halt_loop(&mut self) -> StopOutcome {
        let Some(handle) = self.receive_loop.take() else {
            return StopOutcome::NotRunning;
        };

        self.shared.running.store(false, Ordering::Release);
        self.buffer.interrupt();
        if let Some(endpoint) = &self.endpoint {
            udp::unbind(endpoint);
        }

        let started = Instant::now();
        if handle.join_timeout(self.stop_timeout) {
            tracing::debug!("Receive loop joined in {:?}", started.elapsed());
            StopOutcome::Stopped
        } else {
            tracing::warn!(
                "Receive loop did not stop within {:?}, abandoning it",
                self.stop_timeout
            );
            StopOutcome::TimedOut
        }
    }
}

impl DataSource for AcquisitionEngine {
    fn connect(&mut self) -> Result<()> {
        if self.receive_loop.is_some() {
            self.stop_acquisition();
        }
        if self.release_endpoint() {
            tracing::debug!("Released previous binding before reconnecting");
        }

        let config = self.config();
        let options = TransportOptions::from_config(&config);
        match udp::bind(config.bind_address, config.port(), &options) {
            Ok(endpoint) => {
                self.endpoint = Some(endpoint);
                self.shared.state.store(EngineState::Bound);
                tracing::info!("Connected on port {}", config.port());
                self.set_status("Socket connected and ready to receive data.");
                Ok(())
            }
            Err(e) => {
                self.shared.state.store(EngineState::Idle);
                tracing::error!("Failed to connect: {}", e);
                self.set_status("Socket could not connect.");
                Err(e.into())
            }
        }
    }

    fn disconnect(&mut self) {
        self.halt_loop();
        if self.release_endpoint() {
            tracing::info!("Socket disconnected");
            self.set_status("Socket disconnected.");
        }
        self.buffer.clear();
        self.shared.state.store(EngineState::Idle);
    }

    fn start_acquisition(&mut self) -> Result<()> {
        let state = self.state();
        if state != EngineState::Bound {
            return Err(EngineError::InvalidState {
                op: "start_acquisition",
                state,
            }
            .into());
        }
        let endpoint = match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => {
                return Err(EngineError::InvalidState {
                    op: "start_acquisition",
                    state,
                }
                .into())
            }
        };

        let config = self.config();
        self.buffer.set_policy(config.overflow_policy);
        self.buffer.resize(config.channel_count(), config.ring_capacity());
        self.buffer.reset_stats();
        self.event_word.store(0, Ordering::Release);
        self.shared.error_flag.store(false, Ordering::Release);
        self.shared.counters.reset();
        while self.events_rx.try_recv().is_ok() {}

        let receive_loop = ReceiveLoop {
            endpoint,
            decoder: FrameDecoder::from_config(&config),
            sequencer: SampleSequencer::new(config.sample_rate_hz(), self.event_word.clone()),
            buffer: self.buffer.clone(),
            shared: self.shared.clone(),
            events: self.events_tx.clone(),
            recv_buf: vec![0; config.max_datagram_bytes() + 1],
            frame: SampleFrame::new(config.channel_count(), config.samples_per_frame()),
        };

        self.shared.running.store(true, Ordering::Release);
        self.shared.state.store(EngineState::Streaming);
        match receiver::spawn(receive_loop) {
            Ok(handle) => {
                self.receive_loop = Some(handle);
                tracing::info!(
                    "Acquisition started: {} channels x {} samples per frame at {} Hz",
                    config.channel_count(),
                    config.samples_per_frame(),
                    config.sample_rate_hz()
                );
                self.set_status("Acquisition started.");
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                self.shared.state.store(EngineState::Bound);
                Err(e.into())
            }
        }
    }

    fn stop_acquisition(&mut self) -> StopOutcome {
        let outcome = self.halt_loop();
        self.release_endpoint();
        self.buffer.clear();
        self.shared.state.store(EngineState::Idle);

        match outcome {
            StopOutcome::TimedOut => {
                self.set_status("Acquisition stopped; receive loop did not exit in time.")
            }
            StopOutcome::Stopped => self.set_status("Acquisition stopped."),
            StopOutcome::NotRunning => {}
        }
        tracing::info!("Acquisition stopped ({:?})", outcome);
        outcome
    }

    fn error_flag(&self) -> bool {
        self.shared.error_flag.load(Ordering::Acquire)
    }

    fn found_input_source(&self) -> bool {
        self.endpoint.as_ref().map_or(false, |endpoint| endpoint.is_open())
    }

    fn resize_buffers(&mut self, channel_count: usize, capacity: usize) -> Result<()> {
        let state = self.state();
        if state == EngineState::Streaming {
            return Err(EngineError::InvalidState {
                op: "resize_buffers",
                state,
            }
            .into());
        }

        self.configure(|config| {
            let mut next = config.clone();
            next.set_ring_capacity(capacity.max(next.samples_per_frame()))?;
            next.set_geometry(channel_count, next.samples_per_frame())?;
            next.set_ring_capacity(capacity)?;
            *config = next;
            Ok(())
        })?;
        self.buffer.resize(channel_count, capacity);
        tracing::debug!("Buffers resized to {} channels x {} slots", channel_count, capacity);
        Ok(())
    }

    fn drain_into(&self, block: &mut DrainedBlock, max_samples: usize) -> usize {
        self.buffer.drain_into(block, max_samples)
    }

    fn status_message(&self) -> String {
        self.poll_events();
        self.status.lock().clone()
    }
}

impl Drop for AcquisitionEngine {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FrameEncoder;
    use crate::config::OverflowPolicy;
    use crate::acquisition::frame::RawFrame;
    use crate::error::Error;
    use std::net::{IpAddr, Ipv4Addr, UdpSocket};
    use std::thread;

    fn free_port() -> u16 {
        loop {
            let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
            let port = probe.local_addr().unwrap().port();
            if port > 1023 && port < 65535 {
                return port;
            }
        }
    }

    fn test_config(channels: usize, samples: usize) -> Configuration {
        let mut config = Configuration::default();
        config.bind_address = IpAddr::V4(Ipv4Addr::LOCALHOST);
        config.set_read_timeout(Duration::from_millis(10)).unwrap();
        config.set_port(free_port() as i64).unwrap();
        config.set_sample_rate(1000.0).unwrap();
        config.set_ring_capacity(1000).unwrap();
        config.set_geometry(channels, samples).unwrap();
        config
    }

    fn send_frames(engine: &AcquisitionEngine, count: usize) {
        let config = engine.config();
        let encoder = FrameEncoder::new(
            config.channel_count(),
            config.samples_per_frame(),
            config.sample_format(),
            config.layout,
        );
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = engine.local_addr().unwrap();
        for k in 0..count {
            let mut frame = RawFrame::new(config.channel_count(), config.samples_per_frame());
            frame.samples.iter_mut().for_each(|v| *v = k as f32);
            sender.send_to(&encoder.encode(&frame).unwrap(), target).unwrap();
            // loopback drops bursts on busy hosts
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_session_produces_contiguous_indices() {
        let mut engine = AcquisitionEngine::new(test_config(4, 5));
        engine.connect().unwrap();
        assert_eq!(engine.state(), EngineState::Bound);
        engine.start_acquisition().unwrap();
        assert_eq!(engine.state(), EngineState::Streaming);

        send_frames(&engine, 10);
        let buffer = engine.buffer();
        wait_for(|| buffer.len() == 50);

        let mut block = DrainedBlock::new();
        assert_eq!(engine.drain_into(&mut block, usize::MAX), 50);
        assert_eq!(block.sample_indices, (0..50).collect::<Vec<u64>>());
        assert_eq!(block.channel(3)[49], 9.0);
        assert!(!engine.error_flag());

        assert_eq!(engine.stop_acquisition(), StopOutcome::Stopped);
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_restart_resets_sample_counter() {
        let mut engine = AcquisitionEngine::new(test_config(2, 3));
        let buffer = engine.buffer();

        for _ in 0..2 {
            engine.connect().unwrap();
            engine.start_acquisition().unwrap();
            send_frames(&engine, 2);
            wait_for(|| buffer.len() == 6);
            assert_eq!(buffer.drain_all().sample_indices, vec![0, 1, 2, 3, 4, 5]);
            engine.stop_acquisition();
        }
    }

    #[test]
    fn test_stop_is_bounded_and_clears_buffer() {
        let mut config = test_config(1, 4);
        config.overflow_policy = OverflowPolicy::Block;
        config.set_ring_capacity(4).unwrap();
        let mut engine = AcquisitionEngine::new(config);
        engine.connect().unwrap();
        engine.start_acquisition().unwrap();

        // the second frame blocks the producer until stop interrupts it
        send_frames(&engine, 3);
        let buffer = engine.buffer();
        wait_for(|| buffer.len() == 4);

        let started = Instant::now();
        engine.stop_acquisition();
        assert!(started.elapsed() < Duration::from_millis(600));
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(buffer.is_empty());
        assert!(!engine.found_input_source());
    }

    #[test]
    fn test_stop_returns_quickly_with_long_read_timeout() {
        let mut config = test_config(2, 2);
        config.set_read_timeout(Duration::from_millis(450)).unwrap();
        let port = config.port();
        let mut engine = AcquisitionEngine::new(config);
        engine.connect().unwrap();
        engine.start_acquisition().unwrap();
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        assert_eq!(engine.stop_acquisition(), StopOutcome::Stopped);
        assert!(started.elapsed() < Duration::from_millis(300));

        engine.connect().unwrap();
        assert_eq!(engine.local_addr().map(|addr| addr.port()), Some(port));
    }

    #[test]
    fn test_stop_abandons_stuck_loop_within_timeout() {
        let mut engine = AcquisitionEngine::new(test_config(1, 2));
        engine.set_stop_timeout(Duration::from_millis(100));
        engine.connect().unwrap();
        let port = engine.config().port();

        // a loop thread that ignores the stop request and keeps its endpoint handle
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
        let endpoint = engine.endpoint.clone().unwrap();
        let stuck = receiver::spawn_named("stuck-loop".to_string(), move || {
            let _endpoint = endpoint;
            let _ = release_rx.recv();
        })
        .unwrap();
        engine.receive_loop = Some(stuck);
        engine.shared.state.store(EngineState::Streaming);

        let mut frame = SampleFrame::new(1, 2);
        frame.sample_indices.copy_from_slice(&[0, 1]);
        engine.buffer().push(&frame).unwrap();

        let started = Instant::now();
        assert_eq!(engine.stop_acquisition(), StopOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_millis(100 + 250));
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(engine.buffer().is_empty());
        assert!(engine.status_message().contains("did not exit in time"));

        engine.connect().unwrap();
        assert_eq!(engine.state(), EngineState::Bound);
        assert_eq!(engine.local_addr().map(|addr| addr.port()), Some(port));

        release_tx.send(()).unwrap();
    }

    #[test]
    fn test_connect_twice_releases_first_socket() {
        let mut engine = AcquisitionEngine::new(test_config(1, 1));
        engine.connect().unwrap();
        engine.connect().unwrap();
        assert_eq!(engine.state(), EngineState::Bound);
        assert!(engine.found_input_source());

        engine.disconnect();
        engine.disconnect();
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(engine.status_message(), "Socket disconnected.");
    }

    #[test]
    fn test_bind_failure_stays_idle() {
        let config = test_config(1, 1);
        let _squatter = UdpSocket::bind(("127.0.0.1", config.port())).unwrap();
        let mut engine = AcquisitionEngine::new(config);

        assert!(matches!(engine.connect(), Err(Error::Bind(_))));
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(engine.status_message(), "Socket could not connect.");
    }

    #[test]
    fn test_start_requires_bound() {
        let mut engine = AcquisitionEngine::new(test_config(1, 1));
        let result = engine.start_acquisition();

        assert!(matches!(
            result,
            Err(Error::Engine(EngineError::InvalidState { state: EngineState::Idle, .. }))
        ));
    }

    #[test]
    fn test_short_datagram_sets_error_flag_and_keeps_counter() {
        let mut engine = AcquisitionEngine::new(test_config(2, 2));
        engine.connect().unwrap();
        engine.start_acquisition().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&[0u8; 3], engine.local_addr().unwrap()).unwrap();
        wait_for(|| engine.error_flag());
        assert!(engine.status_message().contains("Short frame"));

        send_frames(&engine, 1);
        let buffer = engine.buffer();
        wait_for(|| buffer.len() == 2);
        assert_eq!(buffer.drain_all().sample_indices, vec![0, 1]);
        assert_eq!(engine.stats().acquisition.decode_errors, 1);

        engine.stop_acquisition();
        engine.connect().unwrap();
        engine.start_acquisition().unwrap();
        assert!(!engine.error_flag());
    }

    #[test]
    fn test_event_word_applies_to_samples() {
        let mut engine = AcquisitionEngine::new(test_config(1, 2));
        engine.connect().unwrap();
        engine.start_acquisition().unwrap();
        engine.set_event_word(0b11);

        send_frames(&engine, 1);
        let buffer = engine.buffer();
        wait_for(|| buffer.len() == 2);
        assert_eq!(buffer.drain_all().event_words, vec![0b11, 0b11]);
    }

    #[test]
    fn test_geometry_locked_while_streaming() {
        let mut engine = AcquisitionEngine::new(test_config(2, 2));
        engine.connect().unwrap();
        engine.start_acquisition().unwrap();

        assert_eq!(
            engine.configure(|c| c.set_geometry(4, 2)),
            Err(ConfigError::GeometryLocked)
        );
        assert_eq!(engine.config().channel_count(), 2);
        assert_eq!(engine.configure(|c| c.set_channel_scale(2.0)), Ok(2.0));
        assert!(engine.resize_buffers(4, 100).is_err());

        engine.stop_acquisition();
        engine.resize_buffers(4, 100).unwrap();
        assert_eq!(engine.buffer().channel_count(), 4);
        assert_eq!(engine.config().ring_capacity(), 100);
    }

    #[test]
    fn test_endpoint_closed_underneath_loop_enters_error() {
        let mut engine = AcquisitionEngine::new(test_config(1, 1));
        engine.connect().unwrap();
        engine.start_acquisition().unwrap();

        if let Some(endpoint) = &engine.endpoint {
            udp::unbind(endpoint);
        }
        wait_for(|| engine.state() == EngineState::Error);
        assert!(engine.error_flag());
        assert!(engine.status_message().starts_with("Acquisition fault"));

        engine.disconnect();
        assert_eq!(engine.state(), EngineState::Idle);
        engine.connect().unwrap();
        assert_eq!(engine.state(), EngineState::Bound);
    }
}
