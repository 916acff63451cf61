//! Performance benchmarks for a3s-flowhub
//!
//! Run with: cargo bench

use a3s_flowhub::flow::decode_item;
use a3s_flowhub::{
    FlowItem, FlowStore, HubConfig, HubError, LocalHub, OpenMode, PersistentData, PublishTimeout,
    ResumeKind, TypeRegistry,
};
use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::Arc;

#[derive(Debug, Default, Clone)]
struct Tick(u64);

impl PersistentData for Tick {
    fn serialize(&self) -> Vec<u8> {
        self.0.to_le_bytes().to_vec()
    }

    fn deserialize(&mut self, data: &[u8]) -> a3s_flowhub::Result<()> {
        let bytes: [u8; 8] = data
            .try_into()
            .map_err(|_| HubError::Decode("bad tick".to_string()))?;
        self.0 = u64::from_le_bytes(bytes);
        Ok(())
    }
}

fn registry() -> Arc<TypeRegistry> {
    let reg = TypeRegistry::new();
    reg.register_default::<Tick>().unwrap();
    Arc::new(reg)
}

fn bench_record_codec(c: &mut Criterion) {
    let reg = registry();
    let item = FlowItem::new(0, 42, Tick(7));

    c.bench_function("FlowItem encode", |b| {
        let mut buf = BytesMut::with_capacity(64);
        b.iter(|| {
            buf.clear();
            item.encode(&reg, &mut buf).unwrap();
        });
    });

    let mut encoded = BytesMut::new();
    item.encode(&reg, &mut encoded).unwrap();
    let encoded = encoded.freeze();
    c.bench_function("FlowItem decode (pooled)", |b| {
        b.iter(|| decode_item(&mut encoded.clone(), &reg).unwrap());
    });
}

fn bench_memory_publish(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("LocalHub publish (no subscribers)", |b| {
        let hub = LocalHub::new(HubConfig::in_memory("bench"), registry()).unwrap();
        b.to_async(&rt).iter(|| async {
            hub.publish("ticks", Tick(1), PublishTimeout::NonBlocking)
                .await
                .unwrap()
        });
    });
}

fn bench_fan_out(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("fan_out");
    for subscribers in [1, 10, 100] {
        group.bench_function(format!("{} subscribers x 100 items", subscribers), |b| {
            b.to_async(&rt).iter(|| async move {
                let hub = LocalHub::new(HubConfig::in_memory("bench"), registry()).unwrap();
                let mut subs = Vec::with_capacity(subscribers);
                for i in 0..subscribers {
                    subs.push(
                        hub.subscribe("ticks", &format!("s{}", i), ResumeKind::Quick)
                            .await
                            .unwrap(),
                    );
                }
                for i in 0..100 {
                    hub.publish("ticks", Tick(i), PublishTimeout::NonBlocking)
                        .await
                        .unwrap();
                }
                subs
            });
        });
    }
    group.finish();
}

fn bench_flow_store(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let reg = registry();

    c.bench_function("FlowStore write", |b| {
        let mut store = FlowStore::new(dir.path().join("write.flow"), reg.clone());
        store.open(OpenMode::WriteOnly).unwrap();
        let mut seq = 0u64;
        b.iter(|| {
            seq += 1;
            store.write(&FlowItem::new(0, seq, Tick(seq))).unwrap();
        });
        store.close().unwrap();
    });

    // Pre-populate
    let path = dir.path().join("replay.flow");
    let mut store = FlowStore::new(&path, reg.clone());
    store.open(OpenMode::WriteOnly).unwrap();
    for seq in 1..=1000 {
        store.write(&FlowItem::new(0, seq, Tick(seq))).unwrap();
    }
    store.close().unwrap();

    c.bench_function("FlowStore replay 1000", |b| {
        b.iter(|| {
            let mut reader = FlowStore::new(&path, reg.clone());
            reader.open(OpenMode::ReadOnly).unwrap();
            let mut count = 0;
            while reader.read().is_ok() {
                count += 1;
            }
            count
        });
    });
}

criterion_group!(
    benches,
    bench_record_codec,
    bench_memory_publish,
    bench_fan_out,
    bench_flow_store,
);
criterion_main!(benches);
