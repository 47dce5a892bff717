//! Benchmarks for the yEnc hot path
//!
//! Encoding and full decoder-chain throughput over payload sizes typical
//! of Usenet article bodies.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use newsreap::codec::{ChainOutput, DecodeStep, Decoded, Decoder, YencDecoder};
use newsreap::yenc_encode;

fn payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 256) as u8).collect()
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("yenc_encode");
    for size in [64 * 1024, 512 * 1024] {
        let data = payload(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| yenc_encode(black_box(data), "bench.bin", 128, None).expect("encode"));
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("yenc_decode");
    let work_dir = std::env::temp_dir().join("newsreap-bench");

    for size in [64 * 1024, 512 * 1024] {
        let encoded = yenc_encode(&payload(size), "bench.bin", 128, None).expect("encode");
        let lines: Vec<Vec<u8>> = encoded
            .split(|&b| b == b'\n')
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line).to_vec())
            .filter(|line| !line.is_empty())
            .collect();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &lines, |b, lines| {
            b.iter(|| {
                let mut decoder = YencDecoder::new(&work_dir);
                let mut decoded = None;
                for line in lines {
                    if let DecodeStep::Done(Decoded::Payload(content)) =
                        decoder.feed(black_box(line))
                    {
                        decoded = Some(content);
                    }
                }
                decoded.expect("decoded payload")
            });
        });
    }
    group.finish();
}

fn bench_chain_overhead(c: &mut Criterion) {
    use newsreap::codec::DecoderChain;

    let work_dir = std::env::temp_dir().join("newsreap-bench");
    let encoded = yenc_encode(&payload(64 * 1024), "bench.bin", 128, None).expect("encode");
    let lines: Vec<Vec<u8>> = encoded
        .split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line).to_vec())
        .filter(|line| !line.is_empty())
        .collect();

    c.bench_function("decoder_chain_64k", |b| {
        b.iter(|| {
            let mut chain = DecoderChain::new(vec![Box::new(YencDecoder::new(&work_dir))]);
            let mut produced = 0;
            for line in &lines {
                if let ChainOutput::Produced(_) = chain.feed(black_box(line)) {
                    produced += 1;
                }
            }
            produced
        });
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_chain_overhead);
criterion_main!(benches);
