//! Benchmarks for the message and HTTP dispatch paths.
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use gsm_core::cloud::{CloudBackend, InMemoryCloud};
use gsm_core::config::PluginConfig;
use gsm_core::manager::{parse_module_path, FixedMemoryProbe, PluginManager, RecordingExit};
use gsm_core::message::{Message, PluginId, PluginVersion};
use gsm_core::modules::builtin::{COUNTER, ECHO};
use gsm_core::modules::ModuleCatalog;
use std::sync::Arc;
use uuid::Uuid;

const MANIFEST: &str = r#"
name = "bench"
plugin_id = 1
version = 1.0

[[modules]]
class = "gsm.builtin.Echo"

[[modules]]
class = "gsm.builtin.Counter"
"#;

fn manager(rt: &tokio::runtime::Runtime) -> Arc<PluginManager> {
    let cloud: Arc<dyn CloudBackend> = Arc::new(InMemoryCloud::new());
    let manager = PluginManager::new(
        PluginConfig::default(),
        Uuid::new_v4(),
        "bench",
        cloud,
        Arc::new(ModuleCatalog::with_builtins()),
        Arc::new(RecordingExit::new()),
    )
    .unwrap()
    .with_memory_probe(Arc::new(FixedMemoryProbe::new(u64::MAX)));
    let manager = Arc::new(manager);
    rt.block_on(async {
        manager.install_module(PluginId(1), PluginVersion(1.0), "bench", MANIFEST.as_bytes().to_vec()).await.unwrap();
    });
    manager
}

fn bench_parse_module_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_module_path");
    for (label, path) in [("root", "/1/v1.0"), ("subpath", "/42/v2.5/orders/123/items"), ("not_a_module", "/static/app.js")] {
        group.bench_with_input(BenchmarkId::from_parameter(label), path, |b, p| { b.iter(|| black_box(parse_module_path(p))); });
    }
    group.finish();
}

fn bench_message_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_codec");
    let message = Message::to_module(1, 1.0, ECHO, serde_json::json!({"order": 7, "items": [1, 2, 3]}))
        .with_source(Uuid::new_v4(), "eu-west", Some(PluginId(5)));
    let raw = message.to_json().unwrap();
    group.bench_function("encode", |b| { b.iter(|| black_box(message.to_json().unwrap())); });
    group.bench_function("decode", |b| { b.iter(|| black_box(Message::from_json(&raw).unwrap())); });
    group.finish();
}

fn bench_process_event(c: &mut Criterion) {
    let mut group = c.benchmark_group("process_event");
    let rt = tokio::runtime::Runtime::new().unwrap();
    let manager = manager(&rt);
    for class in [ECHO, COUNTER] {
        let message = Message::to_module(1, 1.0, class, serde_json::json!({"n": 1})).with_source(Uuid::new_v4(), "bench", None);
        group.bench_with_input(BenchmarkId::from_parameter(class), &message, |b, m| {
            b.iter(|| { rt.block_on(async { black_box(manager.process(m).await.unwrap()); }); });
        });
    }
    group.finish();
}

fn bench_live_module_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("live_module_lookup");
    let rt = tokio::runtime::Runtime::new().unwrap();
    let manager = manager(&rt);
    for n in [100, 1_000] {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| { rt.block_on(async { for _ in 0..n { black_box(manager.get_live_module_list("bench").await); } }); });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_parse_module_path, bench_message_codec, bench_process_event, bench_live_module_lookup);
criterion_main!(benches);
