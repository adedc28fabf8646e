use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use packdb_common::config::TableOptions;
use packdb_common::types::{Field, FieldType, IndexKind, Row, Schema, Value};
use packdb_storage::{CancellationToken, Condition, Query, Store, Table};

fn schema() -> Schema {
    Schema::new(vec![
        Field::primary("id"),
        Field::new("n", FieldType::Int64).with_index(IndexKind::Integer),
        Field::new("name", FieldType::String),
    ])
    .unwrap()
}

fn rows(n: u64) -> Vec<Row> {
    (1..=n)
        .map(|pk| {
            vec![
                Value::Uint64(pk),
                Value::Int64((pk % 1000) as i64),
                Value::String(format!("row-{pk}")),
            ]
        })
        .collect()
}

fn bench_flush(c: &mut Criterion) {
    let ctx = CancellationToken::new();
    let data = rows(100_000);

    c.bench_function("flush_100k", |b| {
        b.iter_batched(
            || {
                let table = Table::create(
                    Store::temporary().unwrap(),
                    "bench",
                    schema(),
                    TableOptions::default().with_pack_size(1 << 14),
                )
                .unwrap();
                table.insert(&ctx, data.clone()).unwrap();
                table
            },
            |table| table.flush(black_box(&ctx)).unwrap(),
            BatchSize::PerIteration,
        );
    });
}

fn bench_scan(c: &mut Criterion) {
    let ctx = CancellationToken::new();
    let table = Table::create(
        Store::temporary().unwrap(),
        "bench",
        schema(),
        TableOptions::default().with_pack_size(1 << 14),
    )
    .unwrap();
    table.insert(&ctx, rows(200_000)).unwrap();
    table.flush(&ctx).unwrap();

    let range = Query::new("range").and(Condition::range("id", 150_000u64, 150_999u64));
    c.bench_function("scan_pk_range", |b| {
        b.iter(|| table.count(&ctx, black_box(&range)).unwrap());
    });

    let indexed = Query::new("indexed").and(Condition::equal("n", 42i64));
    c.bench_function("scan_indexed_equal", |b| {
        b.iter(|| table.count(&ctx, black_box(&indexed)).unwrap());
    });
}

criterion_group!(benches, bench_flush, bench_scan);
criterion_main!(benches);
