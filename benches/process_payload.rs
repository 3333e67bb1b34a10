use std::collections::BTreeSet;
use std::fmt::Write as _;

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use event_schema::enrichment::{EnrichmentRule, EventIdRule};
use event_schema::mapping::NoopMapper;
use event_schema::processor::{Processor, parse_json_line};

fn generate_payload(lines: usize) -> Vec<u8> {
    let mut payload = String::new();
    for i in 0..lines {
        let kind = match i % 3 {
            0 => "page",
            1 => "click",
            _ => "signup",
        };
        let day = (i % 28) + 1;
        let _ = writeln!(
            payload,
            "{{\"_timestamp\":\"2024-01-{day:02}T10:00:00Z\",\"event_type\":\"{kind}\",\"user\":{{\"id\":{i},\"plan\":\"pro\"}},\"amount\":{}.5,\"tags\":[\"a\",\"b\"]}}",
            i % 100
        );
    }
    payload.into_bytes()
}

fn bench_process_payload(c: &mut Criterion) {
    let payload = generate_payload(10_000);
    let rules: Vec<Box<dyn EnrichmentRule>> = vec![Box::new(EventIdRule)];
    let processor = Processor::new(
        "{{.event_type}}_{{._timestamp.Format \"2006_01\"}}",
        Box::new(NoopMapper),
        BTreeSet::new(),
        rules,
    )
    .expect("valid template");

    let mut group = c.benchmark_group("process_file_payload");
    group.throughput(Throughput::Bytes(payload.len() as u64));

    group.bench_function("lenient", |b| {
        b.iter(|| {
            processor
                .process_file_payload("bench.jsonl", &payload, false, parse_json_line)
                .expect("process payload")
        });
    });

    group.bench_function("break_on_error", |b| {
        b.iter(|| {
            processor
                .process_file_payload("bench.jsonl", &payload, true, parse_json_line)
                .expect("process payload")
        });
    });

    group.finish();
}

criterion_group!(benches, bench_process_payload);
criterion_main!(benches);
