//! Record build and read throughput per codec.
//!
//! Run with: `cargo bench --bench record_codec`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use hipo_evio::{ByteOrder, CompressionType, Reader, Writer, WriterMT, WriterOptions};

const EVENTS: usize = 2_000;

fn events(order: ByteOrder) -> Vec<Vec<u8>> {
    (0..EVENTS)
        .map(|i| {
            let mut ev = Vec::new();
            order.put_u32(&mut ev, 65);
            order.put_u32(&mut ev, (i as u32 & 0xffff) << 16 | 0x0100);
            for w in 0..64u32 {
                order.put_u32(&mut ev, w.wrapping_mul(i as u32) % 1024);
            }
            ev
        })
        .collect()
}

fn codecs() -> Vec<CompressionType> {
    [
        CompressionType::None,
        CompressionType::Lz4,
        CompressionType::Lz4Best,
        CompressionType::Gzip,
    ]
    .into_iter()
    .filter(|c| c.is_available())
    .collect()
}

fn write_buffer(opts: &WriterOptions, events: &[Vec<u8>]) -> Vec<u8> {
    let mut writer = Writer::to_buffer(opts.clone()).unwrap();
    for ev in events {
        writer.add_event(ev).unwrap();
    }
    writer.into_buffer().unwrap()
}

fn bench_write(c: &mut Criterion) {
    let order = ByteOrder::native();
    let events = events(order);
    let bytes: u64 = events.iter().map(|e| e.len() as u64).sum();

    let mut group = c.benchmark_group("write");
    group.throughput(Throughput::Bytes(bytes));
    for codec in codecs() {
        let opts = WriterOptions::default()
            .with_compression(codec)
            .with_max_event_count(200);
        group.bench_with_input(BenchmarkId::new("single", codec), &opts, |b, opts| {
            b.iter(|| black_box(write_buffer(opts, &events)))
        });
        if codec.is_compressed() {
            let opts = opts.clone().with_threads(4);
            group.bench_with_input(BenchmarkId::new("threads4", codec), &opts, |b, opts| {
                b.iter(|| {
                    let mut writer = WriterMT::to_buffer(opts.clone()).unwrap();
                    for ev in &events {
                        writer.add_event(ev).unwrap();
                    }
                    black_box(writer.into_buffer().unwrap())
                })
            });
        }
    }
    group.finish();
}

fn bench_read(c: &mut Criterion) {
    let order = ByteOrder::native();
    let events = events(order);

    let mut group = c.benchmark_group("read");
    group.sample_size(20);
    for codec in codecs() {
        let opts = WriterOptions::default()
            .with_compression(codec)
            .with_max_event_count(200);
        let buffer = write_buffer(&opts, &events);
        group.bench_with_input(BenchmarkId::from_parameter(codec), &buffer, |b, buffer| {
            b.iter(|| {
                let mut reader = Reader::from_buffer(buffer.clone()).unwrap();
                let mut total = 0;
                while let Some(ev) = reader.get_next_event().unwrap() {
                    total += ev.len();
                }
                black_box(total)
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_write, bench_read);
criterion_main!(benches);
