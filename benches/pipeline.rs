use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use gemini_bridge::acquisition::{EventWord, RawFrame, SampleFrame, SampleRingBuffer, SampleSequencer};
use gemini_bridge::codec::{FrameDecoder, FrameEncoder};
use gemini_bridge::config::{OverflowPolicy, SampleFormat, SampleLayout};
use gemini_bridge::constants::{DEFAULT_NUM_CHANNELS, DEFAULT_NUM_SAMPLES, DEFAULT_RING_CAPACITY};

fn datagram() -> Vec<u8> {
    let mut frame = RawFrame::new(DEFAULT_NUM_CHANNELS, DEFAULT_NUM_SAMPLES);
    for (i, value) in frame.samples.iter_mut().enumerate() {
        *value = (i % 2000) as f32 - 1000.0;
    }
    let encoder = FrameEncoder::new(
        DEFAULT_NUM_CHANNELS,
        DEFAULT_NUM_SAMPLES,
        SampleFormat::I16Le,
        SampleLayout::Interleaved,
    );
    encoder.encode(&frame).unwrap().to_vec()
}

fn bench_decode(c: &mut Criterion) {
    let data = datagram();
    let mut decoder = FrameDecoder::new(
        DEFAULT_NUM_CHANNELS,
        DEFAULT_NUM_SAMPLES,
        SampleFormat::I16Le,
        SampleLayout::Interleaved,
    )
    .with_scaling(0.195, 0.0);
    let mut out = RawFrame::new(DEFAULT_NUM_CHANNELS, DEFAULT_NUM_SAMPLES);

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("i16_interleaved_192x30", |b| {
        b.iter(|| decoder.decode_into(black_box(&data), &mut out).unwrap())
    });
    group.finish();
}

fn bench_pipeline(c: &mut Criterion) {
    let data = datagram();
    let mut decoder = FrameDecoder::new(
        DEFAULT_NUM_CHANNELS,
        DEFAULT_NUM_SAMPLES,
        SampleFormat::I16Le,
        SampleLayout::Interleaved,
    );
    let mut sequencer = SampleSequencer::new(30000.0, EventWord::default());
    let buffer = SampleRingBuffer::new(DEFAULT_NUM_CHANNELS, DEFAULT_RING_CAPACITY, OverflowPolicy::Reject);
    let mut frame = SampleFrame::new(DEFAULT_NUM_CHANNELS, DEFAULT_NUM_SAMPLES);

    c.bench_function("decode_stamp_push_drain", |b| {
        b.iter(|| {
            decoder.decode_into(black_box(&data), &mut frame.data).unwrap();
            sequencer.stamp(&mut frame);
            buffer.push(&frame).unwrap();
            black_box(buffer.drain_all());
        })
    });
}

criterion_group!(benches, bench_decode, bench_pipeline);
criterion_main!(benches);
