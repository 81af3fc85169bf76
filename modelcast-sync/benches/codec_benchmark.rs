use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};
use modelcast_core::Operation;
use modelcast_sync::broadcast::{client_channel, ClientInfo, Pump};
use modelcast_sync::protocol::{decode_value, encode_value, InnerMessage};
use serde_json::json;

fn sample_apply() -> InnerMessage {
    InnerMessage::apply(vec![
        Operation::set("stats.cpu", 0.42),
        Operation::merge("stats.mem", json!({"rss": 1024, "heap": 512})),
        Operation::circular_append("log", json!({"level": "info", "msg": "tick"}), 100),
    ])
}

fn bench_envelope_encode(c: &mut Criterion) {
    let value = sample_apply().to_value().unwrap();

    c.bench_function("envelope_encode_apply", |b| {
        b.iter(|| black_box(encode_value(black_box(&value))))
    });
}

fn bench_envelope_decode(c: &mut Criterion) {
    let frame = sample_apply().encode().unwrap();

    c.bench_function("envelope_decode_apply", |b| {
        b.iter(|| black_box(decode_value(black_box(&frame)).unwrap()))
    });
}

fn bench_inner_decode(c: &mut Criterion) {
    let frame = sample_apply().encode().unwrap();

    c.bench_function("inner_message_decode_apply", |b| {
        b.iter(|| black_box(InnerMessage::decode(black_box(&frame)).unwrap()))
    });
}

fn bench_pump_broadcast(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let frame: Arc<str> = Arc::from(sample_apply().encode().unwrap());

    c.bench_function("pump_broadcast_100_msgs_100_clients", |b| {
        b.iter(|| {
            rt.block_on(async {
                let pump = Pump::spawn(20, Duration::from_secs(5));
                let mut receivers = Vec::new();
                for i in 0..100 {
                    let info = ClientInfo {
                        client_id: format!("client-{i}"),
                        remote_ip: "127.0.0.1".into(),
                        connected_at: 0,
                    };
                    let (handle, rx) = client_channel(info, 256);
                    let _ = pump.attach(handle, Arc::from("{}")).await;
                    receivers.push(rx);
                }

                for _ in 0..100 {
                    pump.broadcast(black_box(Arc::clone(&frame)));
                }
                for rx in &mut receivers {
                    for _ in 0..101 {
                        black_box(rx.recv().await);
                    }
                }
                pump.shutdown().await;
            });
        })
    });
}

criterion_group!(
    benches,
    bench_envelope_encode,
    bench_envelope_decode,
    bench_inner_decode,
    bench_pump_broadcast,
);
criterion_main!(benches);
