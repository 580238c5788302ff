//! Request-head formatting throughput across the plain, proxied, and
//! CONNECT-tunnel code paths `format_request_head` branches on.

use axeda_agent::http::request::Request;
use axeda_agent::http::transaction::format_request_head;
use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn sample_request(header_count: usize) -> Request {
    let mut req = Request::post(
        "device.example.com",
        443,
        "/eMessage",
        Bytes::from_static(b"<eMessage/>"),
        "text/xml",
    );
    for i in 0..header_count {
        req = req.header(format!("X-Custom-{i}"), "value");
    }
    req
}

fn bench_format_request_head(c: &mut Criterion) {
    let mut group = c.benchmark_group("http_head_format");

    group.bench_function("direct", |b| {
        let req = sample_request(4);
        b.iter(|| black_box(format_request_head(&req, false, false, false, false)));
    });

    group.bench_function("via_http_proxy", |b| {
        let req = sample_request(4);
        b.iter(|| black_box(format_request_head(&req, true, false, false, false)));
    });

    group.bench_function("connect_tunnel", |b| {
        let req = sample_request(4);
        b.iter(|| black_box(format_request_head(&req, true, true, false, false)));
    });

    group.bench_function("many_headers", |b| {
        let req = sample_request(64);
        b.iter(|| black_box(format_request_head(&req, false, false, false, false)));
    });

    group.finish();
}

criterion_group!(benches, bench_format_request_head);
criterion_main!(benches);
