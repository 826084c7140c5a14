//! Session-management microbenchmarks.
//!
//! Measures:
//! 1. SM packet codec throughput
//! 2. Idle event-loop tick latency
//!
//! Run with:
//! ```bash
//! cargo bench --bench sm_bench
//! ```

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use udrpc::{
    FakeTransport, Nexus, NexusConfig, Rpc, RpcConfig, SessionEndpoint, SmPkt, SmPktType,
    TransportType, SM_PKT_WIRE_SIZE,
};

fn sample_pkt() -> SmPkt {
    let mut client = SessionEndpoint::new(TransportType::Fake, "bench-client", 0, 1);
    client.session_num = 12;
    client.secret = 0x1234_5678_9abc;
    let mut server = SessionEndpoint::new(TransportType::Fake, "bench-server", 0, 2);
    server.secret = client.secret;
    SmPkt::new(SmPktType::ConnectReq, client, server)
}

fn bench_sm_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("sm_codec");
    group.throughput(Throughput::Bytes(SM_PKT_WIRE_SIZE as u64));

    let pkt = sample_pkt();
    group.bench_function("serialize", |b| b.iter(|| black_box(pkt.to_bytes())));

    let bytes = pkt.to_bytes();
    group.bench_function("deserialize", |b| {
        b.iter(|| SmPkt::from_bytes(black_box(&bytes)).unwrap())
    });

    group.finish();
}

fn bench_event_loop_idle(c: &mut Criterion) {
    let config = NexusConfig::new("127.0.0.1")
        .with_sm_udp_port(0)
        .with_sm_thread(false);
    let nexus = Nexus::new(config).unwrap();
    let rpc = Rpc::new(
        &nexus,
        1,
        |_session_num, _event, _err| {},
        FakeTransport::new(1024),
        RpcConfig::default(),
    )
    .unwrap();

    c.bench_function("event_loop_idle_tick", |b| b.iter(|| rpc.run_event_loop_one()));
}

criterion_group!(benches, bench_sm_codec, bench_event_loop_idle);
criterion_main!(benches);
