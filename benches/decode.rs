//! Decode and query benchmarks

use std::net::{TcpListener, TcpStream};

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use httptcpinfo::output::output_json;
use httptcpinfo::tcp_info::{TcpInfo, WScale, query_socket};

fn bench_wscale_decode(c: &mut Criterion) {
    c.bench_function("wscale_decode", |b| {
        b.iter(|| WScale::from_raw(black_box(0x79)))
    });
}

fn bench_output_json(c: &mut Criterion) {
    let info = TcpInfo {
        state: 1,
        rtt: 112,
        rtt_var: 56,
        snd_cwnd: 10,
        bytes_acked: 1 << 20,
        pacing_rate: -1,
        ..Default::default()
    };

    c.bench_function("output_json", |b| {
        b.iter(|| output_json(black_box(&info), false))
    });
}

fn bench_query_loopback(c: &mut Criterion) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (_server, _) = listener.accept().unwrap();

    c.bench_function("query_loopback", |b| {
        b.iter(|| query_socket(black_box(&client)))
    });
}

criterion_group!(
    benches,
    bench_wscale_decode,
    bench_output_json,
    bench_query_loopback
);
criterion_main!(benches);
