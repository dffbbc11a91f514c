//! Benchmarks for structured-output extraction.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use genflow::extract::{ExpectedShape, StructuredExtractor};

const FENCED: &str = "Here is the plan:\n```json\n{\"headline\": \"Cold lemonade\", \"style\": \"bold\", \"palette\": [\"#ffdd00\", \"#ffffff\"]}\n```\nLet me know if you need changes.";
const BROKEN: &str = "Sure! {\"headline\": \"Cold lemonade\", \"style\": \"bold\", \"palette\": [\"#ffdd00\", \"#ffffff\",],";

fn extract_benchmark(c: &mut Criterion) {
    let extractor = StructuredExtractor::new();
    let shape = ExpectedShape::object_with_keys(["headline", "style"]);

    c.bench_function("extract_fenced", |b| {
        b.iter(|| extractor.extract(black_box(FENCED), &shape, None))
    });
    c.bench_function("extract_bracket_repair", |b| {
        b.iter(|| extractor.extract(black_box(BROKEN), &shape, None))
    });
}

criterion_group!(benches, extract_benchmark);
criterion_main!(benches);
