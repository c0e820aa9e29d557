//! Benchmarks for the admission-path hot spots.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use gpu_governor::budget::ledger::BudgetLedger;
use gpu_governor::cache::layer::LayerSpec;
use gpu_governor::cache::residency::LayerCache;
use gpu_governor::config::{BudgetConfig, CacheConfig, FirewallConfig};
use gpu_governor::firewall::analyzer::Firewall;
use gpu_governor::firewall::request::{CapacityRequest, Intent};

fn bench_firewall_analyze(c: &mut Criterion) {
    let request = CapacityRequest {
        intent: Intent::Inference,
        resource: "qwen2.5:7b-instruct".to_string(),
        actor: "brain_api".to_string(),
        capacity_mb: 3500,
        estimated_duration_secs: 30.0,
        parent_token: None,
    };

    // Fresh firewall per iteration: an approved request is recorded in the
    // rate window, which would otherwise grow across iterations.
    c.bench_function("firewall_analyze_clean", |b| {
        b.iter_batched(
            || Firewall::new(FirewallConfig::default()),
            |mut fw| black_box(fw.analyze(black_box(&request))),
            BatchSize::SmallInput,
        )
    });

    let mut firewall = Firewall::new(FirewallConfig::default());
    let hostile = CapacityRequest {
        resource: "gpu-benchmark-loop".to_string(),
        ..request.clone()
    };
    c.bench_function("firewall_analyze_suspicious", |b| {
        b.iter(|| black_box(firewall.analyze(black_box(&hostile))))
    });
}

fn bench_budget_quote(c: &mut Criterion) {
    let mut ledger = BudgetLedger::new(BudgetConfig::default());
    for i in 0..1000 {
        ledger.register_actor(&format!("actor-{i}"), 1e9, 1e6, (i % 10) as u32, 1.0);
    }

    c.bench_function("budget_quote", |b| {
        b.iter(|| black_box(ledger.quote(black_box("actor-500"), 3500, 30.0, 1.0)))
    });

    c.bench_function("budget_queue_position_1k_actors", |b| {
        b.iter(|| black_box(ledger.queue_position(black_box("actor-500"))))
    });
}

fn bench_eviction_selection(c: &mut Criterion) {
    // A node packed with 1,000 small resident layers; every admit of the big
    // layer scans and evicts from the full candidate set.
    c.bench_function("cache_admit_with_eviction_1k_layers", |b| {
        b.iter_with_setup(
            || {
                let mut cache = LayerCache::new("bench", 10_000, CacheConfig::default());
                let specs: Vec<LayerSpec> = (0..1000)
                    .map(|i| LayerSpec {
                        name: format!("layer-{i}"),
                        size_mb: 10.0,
                        category: "attention".to_string(),
                    })
                    .collect();
                cache.register_resource("packed", &specs).unwrap();
                for spec in &specs {
                    cache.ensure_resident("packed", &spec.name).unwrap();
                }
                cache
                    .register_resource(
                        "big",
                        &[LayerSpec {
                            name: "big-layer".to_string(),
                            size_mb: 500.0,
                            category: "ffn".to_string(),
                        }],
                    )
                    .unwrap();
                cache
            },
            |mut cache| {
                black_box(cache.ensure_resident("big", "big-layer").unwrap());
            },
        )
    });
}

criterion_group!(
    benches,
    bench_firewall_analyze,
    bench_budget_quote,
    bench_eviction_selection
);
criterion_main!(benches);
