//! Benchmarks for DNS message decoding and redirect synthesis.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use std::net::Ipv4Addr;

use portal_dns::dns::{Message, Record, TYPE_A};
use portal_dns::synth;

const PORTAL: Ipv4Addr = Ipv4Addr::new(192, 168, 254, 254);

fn build_query() -> Vec<u8> {
    Message::query(0x1234, "www.example.com".parse().unwrap(), TYPE_A)
        .encode()
        .unwrap()
}

fn build_response() -> Vec<u8> {
    let mut msg = Message::query(0x1234, "www.example.com".parse().unwrap(), TYPE_A);
    msg.header.response = true;
    for last in 1..=4 {
        msg.answers.push(Record::a(
            "www.example.com".parse().unwrap(),
            Ipv4Addr::new(93, 184, 216, last),
            300,
        ));
    }
    msg.encode().unwrap()
}

fn bench_decode(c: &mut Criterion) {
    let query = build_query();
    let response = build_response();

    c.bench_function("decode_query", |b| {
        b.iter(|| Message::decode(black_box(&query)))
    });
    c.bench_function("decode_response_4_answers", |b| {
        b.iter(|| Message::decode(black_box(&response)))
    });
}

fn bench_redirect(c: &mut Criterion) {
    let query = Message::decode(&build_query()).unwrap();

    c.bench_function("redirect_and_encode", |b| {
        b.iter(|| {
            synth::redirect(black_box(&query), PORTAL)
                .map(|answer| answer.encode())
        })
    });
}

criterion_group!(benches, bench_decode, bench_redirect);
criterion_main!(benches);
