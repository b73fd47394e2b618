//! Synthetic Sample Sender
//!
//! Streams generated sample frames to a receiver over UDP at the configured
//! sample rate. Useful for loopback testing without acquisition hardware.

use anyhow::Result;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gemini_bridge::{acquisition::RawFrame, codec::FrameEncoder, Configuration};

/// Peak amplitude of the generated sine, in raw counts
const AMPLITUDE: f32 = 1000.0;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Configuration::default();

    // Get target address from args or use default
    let target_addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| format!("127.0.0.1:{}", config.port()))
        .parse()?;

    let channels = config.channel_count();
    let samples = config.samples_per_frame();
    let sample_rate = config.sample_rate_hz();
    let encoder = FrameEncoder::new(channels, samples, config.sample_format(), config.layout);

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let period = Duration::from_secs_f64(samples as f64 / sample_rate);

    tracing::info!(
        "Sending {}x{} frames ({} bytes) to {} every {:?}",
        channels,
        samples,
        encoder.frame_len(),
        target_addr,
        period
    );

    let mut frame = RawFrame::new(channels, samples);
    let mut datagram = BytesMut::with_capacity(encoder.frame_len());
    let mut sample_index: u64 = 0;
    let mut sent: u64 = 0;
    let mut last_report = Instant::now();

    let mut ticker = tokio::time::interval(period);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // each channel carries a sine at (channel + 1) * 10 Hz
                for channel in 0..channels {
                    let freq = (channel + 1) as f64 * 10.0;
                    for (s, value) in frame.channel_mut(channel).iter_mut().enumerate() {
                        let t = (sample_index + s as u64) as f64 / sample_rate;
                        *value = (t * freq * std::f64::consts::TAU).sin() as f32 * AMPLITUDE;
                    }
                }
                sample_index += samples as u64;

                datagram.clear();
                encoder.encode_into(&frame, &mut datagram)?;
                if let Err(e) = socket.send_to(&datagram, target_addr).await {
                    tracing::warn!("Failed to send datagram: {}", e);
                    continue;
                }
                sent += 1;

                if last_report.elapsed() >= Duration::from_secs(5) {
                    last_report = Instant::now();
                    tracing::info!("{} datagrams sent, {} samples", sent, sample_index);
                }
            }
            _ = &mut shutdown => break,
        }
    }

    tracing::info!("Sender stopped after {} datagrams", sent);
    Ok(())
}
