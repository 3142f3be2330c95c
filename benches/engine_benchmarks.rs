//! Performance Benchmarks for the Custodian engine
//!
//! Measures RQL translation, nested creates and filtered reads.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use custodian_core::node::Node;
use custodian_core::*;
use serde_json::json;
use std::sync::Arc;

const SEEDED_PARENTS: usize = 256;

fn registry() -> Arc<MetaRegistry> {
    let registry = Arc::new(MetaRegistry::new());
    registry
        .create_many(vec![
            MetaDescription::new("author", "id")
                .with_field(FieldSpec::key("id"))
                .with_field(FieldSpec::new("name", FieldType::String))
                .with_field(FieldSpec::array("books", "book", "author")),
            MetaDescription::new("book", "id")
                .with_field(FieldSpec::key("id"))
                .with_field(FieldSpec::new("title", FieldType::String))
                .with_field(FieldSpec::object("author", "author").on_delete("cascade"))
                .with_field(FieldSpec::objects("tags", "tag")),
            MetaDescription::new("tag", "id")
                .with_field(FieldSpec::key("id"))
                .with_field(FieldSpec::new("label", FieldType::String)),
        ])
        .expect("schema");
    registry
}

fn processor() -> Processor {
    let registry = registry();
    let store = Arc::new(MemoryStore::new(registry.clone()));
    Processor::new(registry, store, EngineConfig::default())
}

fn author(index: usize) -> ValueMap {
    map_from_json(json!({
        "name": format!("author-{}", index),
        "books": [
            {"title": format!("first-{}", index), "tags": [{"label": "new"}]},
            {"title": format!("second-{}", index)},
        ],
    }))
}

fn rql_translation(c: &mut Criterion) {
    let registry = registry();
    let root = Node::query_root(registry.require_meta("book").expect("book"));
    let translator = SqlTranslator::new(registry.as_ref(), "o_");
    let query = RqlParser::parse("and(eq(author.name,someone),or(like(title,*rust*),eq(tags.label,new))),sort(-title),limit(20)")
        .expect("query");

    let mut group = c.benchmark_group("rql");
    group.throughput(Throughput::Elements(1));
    group.bench_function("parse", |b| {
        b.iter(|| black_box(RqlParser::parse("and(eq(author.name,someone),in(id,(1,2,3))),limit(10)")))
    });
    group.bench_function("translate", |b| b.iter(|| black_box(translator.translate(&query, &root))));
    group.finish();
}

fn nested_writes(c: &mut Criterion) {
    let mut group = c.benchmark_group("write");
    group.sample_size(30);
    let processor = processor();
    let mut index = 0usize;
    group.throughput(Throughput::Elements(4));
    group.bench_function("create_nested_author", |b| {
        b.iter(|| {
            index += 1;
            black_box(processor.create_record("author", author(index), None))
        })
    });
    group.finish();
}

fn filtered_reads(c: &mut Criterion) {
    let processor = processor();
    for index in 0..SEEDED_PARENTS {
        processor.create_record("author", author(index), None).expect("seed");
    }
    let options = GetOptions::new().with_depth(2);

    let mut group = c.benchmark_group("read");
    group.bench_function("get_depth_2", |b| b.iter(|| black_box(processor.get("author", 7i64, &options))));
    group.bench_function("get_bulk_relation_filter", |b| {
        b.iter(|| black_box(processor.get_bulk("book", "eq(author.name,'author-42')", &GetOptions::new())))
    });
    group.finish();
}

criterion_group!(benches, rql_translation, nested_writes, filtered_reads);
criterion_main!(benches);
