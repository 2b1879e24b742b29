use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use sluice_io::RingBuffer;

fn copy_in(ring: &mut RingBuffer, chunk: &[u8]) -> usize {
    let (a, b) = ring.writing_view();
    let n = a.len().min(chunk.len());
    a[..n].copy_from_slice(&chunk[..n]);
    let m = b.len().min(chunk.len() - n);
    b[..m].copy_from_slice(&chunk[n..n + m]);
    ring.write_finish(n + m);
    n + m
}

fn drain(ring: &mut RingBuffer) -> usize {
    let (a, b) = ring.reading_view();
    let n = a.len() + b.len();
    black_box((a.first().copied(), b.last().copied()));
    ring.read_finish(n);
    n
}

/// Steady-state FIFO traffic with chunk sizes that force regular wraparound.
fn fifo_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_buffer");
    for &chunk_len in &[64usize, 512, 1500] {
        group.bench_function(format!("fifo_{chunk_len}"), |b| {
            let mut ring = RingBuffer::new(4096);
            let chunk = vec![0xa5u8; chunk_len];
            b.iter(|| {
                let wrote = copy_in(&mut ring, &chunk);
                let read = drain(&mut ring);
                black_box((wrote, read));
            });
        });
    }
    group.finish();
}

criterion_group!(benches, fifo_round_trip);
criterion_main!(benches);
