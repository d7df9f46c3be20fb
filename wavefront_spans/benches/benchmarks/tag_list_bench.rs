use criterion::{black_box, criterion_group, Criterion};
use wavefront_spans::{
    tag_list::{DefaultTags, TagList},
    ApplicationTags, Span, SpanKind, TraceContext,
};

fn derive(c: &mut Criterion) {
    let mut group = c.benchmark_group("TagList");

    let defaults = DefaultTags::new(
        &ApplicationTags::new("bench", "bench")
            .with_cluster("us-west")
            .with_custom_tag("team", "tracing"),
    );

    let plain = Span::new("plain");
    let plain_context = TraceContext::default();
    group.bench_function("no tags", |bencher| {
        bencher.iter(|| black_box(TagList::new(&defaults, &plain_context, &plain)))
    });

    let mut busy = Span::new("busy");
    busy.kind = SpanKind::Client;
    for i in 0..16 {
        busy.put_tag(format!("tag.{i}"), format!("value-{i}"));
    }
    busy.put_tag("Error", "");
    busy.put_tag("application", "overridden");
    busy.put_tag("component", "bench");
    busy.annotate(1_600_000_000_000_000, "an annotation");
    let busy_context = TraceContext {
        debug: true,
        ..Default::default()
    };
    group.bench_function("sixteen tags", |bencher| {
        bencher.iter(|| black_box(TagList::new(&defaults, &busy_context, &busy)))
    });
}

criterion_group!(benches, derive);
