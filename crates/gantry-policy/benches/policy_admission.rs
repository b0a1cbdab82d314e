// SPDX-License-Identifier: MIT OR Apache-2.0
use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use gantry_core::{Tier, TenantId};
use gantry_policy::{tier_defaults, AllowedTools, PolicyEngine, PolicyLimits};

fn bench_admission_check(c: &mut Criterion) {
    let engine = PolicyEngine::new();
    let tenant = TenantId::from("bench-tenant");
    let now = Utc::now();
    engine.set_policy(
        &tenant,
        PolicyLimits { allowed_tools: AllowedTools::Any, ..tier_defaults(Tier::Enterprise) },
        now,
    );

    c.bench_function("policy_check_request", |b| {
        b.iter(|| {
            black_box(engine.check_request(&tenant, "audit-website", 0.01, Tier::Enterprise, now).ok());
        })
    });
}

criterion_group!(benches, bench_admission_check);
criterion_main!(benches);
