//! EMessage assembly throughput: how cheaply `EMessageBuilder` can pack a
//! full message of telemetry items before hitting its byte budget.

use axeda_agent::config::ServerTimestampMode;
use axeda_agent::domain_types::{DeviceId, EMessageByteBudget};
use axeda_agent::emessage::{format_timestamp, EMessageBuilder, EMessageKind};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::SystemTime;

fn bench_add_data_items(c: &mut Criterion) {
    let mut group = c.benchmark_group("emessage_assembly");
    let device_id = DeviceId::new(1);
    let timestamp = format_timestamp(SystemTime::now(), ServerTimestampMode::Device);

    for item_count in [16_usize, 128, 1024] {
        group.throughput(Throughput::Elements(item_count as u64));
        group.bench_with_input(
            BenchmarkId::new("add_data", item_count),
            &item_count,
            |b, &item_count| {
                b.iter(|| {
                    let budget = EMessageByteBudget::try_new(1_048_576).unwrap();
                    let mut builder = EMessageBuilder::new(EMessageKind::Standard, 1, budget);
                    for i in 0..item_count {
                        let name = format!("sensor_{i}");
                        let value = format!("{i}.5");
                        black_box(builder.add_data(device_id, &name, &value, &timestamp));
                    }
                    black_box(builder.finish());
                });
            },
        );
    }

    group.finish();
}

fn bench_finish_near_budget(c: &mut Criterion) {
    let mut group = c.benchmark_group("emessage_assembly");
    let device_id = DeviceId::new(1);
    let timestamp = format_timestamp(SystemTime::now(), ServerTimestampMode::Device);

    group.bench_function("fill_to_budget", |b| {
        b.iter(|| {
            let budget = EMessageByteBudget::try_new(4_096).unwrap();
            let mut builder = EMessageBuilder::new(EMessageKind::Standard, 1, budget);
            while builder.add_data(device_id, "sensor", "1.0", &timestamp) {}
            black_box(builder.finish());
        });
    });

    group.finish();
}

criterion_group!(benches, bench_add_data_items, bench_finish_near_budget);
criterion_main!(benches);
