use criterion::{criterion_group, criterion_main, Criterion};
use modelcast_core::{apply_operations, full_refresh, Document, Operation};
use serde_json::json;
use std::hint::black_box;

fn bench_set_nested(c: &mut Criterion) {
    let ops = vec![Operation::set("a.b.c.d", 42)];

    c.bench_function("set_nested_path", |b| {
        b.iter(|| {
            let mut doc = Document::new();
            apply_operations(&mut doc, black_box(&ops)).unwrap();
            black_box(doc);
        })
    });
}

fn bench_circular_append(c: &mut Criterion) {
    let op = Operation::circular_append("log", json!({"level": "info", "msg": "tick"}), 100);
    let mut doc = Document::new();

    c.bench_function("circular_append_max100", |b| {
        b.iter(|| {
            apply_operations(&mut doc, black_box(std::slice::from_ref(&op))).unwrap();
        })
    });
}

fn bench_deep_merge(c: &mut Criterion) {
    let patch = json!({
        "stats": {"cpu": 0.5, "mem": {"rss": 1024, "heap": 512}},
        "flags": {"a": true, "b": false}
    });
    let ops = vec![Operation::merge("state", patch)];
    let mut doc = Document::new();

    c.bench_function("deep_merge", |b| {
        b.iter(|| {
            apply_operations(&mut doc, black_box(&ops)).unwrap();
        })
    });
}

fn bench_full_refresh(c: &mut Criterion) {
    let mut source = Document::new();
    let ops: Vec<Operation> = (0..1000)
        .map(|i| Operation::set(format!("items.k{i}"), json!({"n": i, "s": "value"})))
        .collect();
    apply_operations(&mut source, &ops).unwrap();

    c.bench_function("full_refresh_1000_keys", |b| {
        b.iter(|| {
            let mut replica = Document::new();
            apply_operations(&mut replica, &full_refresh(black_box(&source))).unwrap();
            black_box(replica);
        })
    });
}

criterion_group!(
    benches,
    bench_set_nested,
    bench_circular_append,
    bench_deep_merge,
    bench_full_refresh,
);
criterion_main!(benches);
