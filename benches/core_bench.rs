use arca::hasher::{cache_key, dependency_list_fingerprint, repo_id};
use arca::result::ExecutionResult;
use arca::Task;
use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::hint::black_box;

fn benchmark_fingerprints(c: &mut Criterion) {
    let mut group = c.benchmark_group("fingerprints");

    group.bench_function("repo_id", |b| {
        b.iter(|| repo_id(black_box("https://github.com/mikicz/arca.git")));
    });

    group.bench_function("cache_key", |b| {
        let commit = "a".repeat(40);
        b.iter(|| {
            cache_key(
                black_box("https://github.com/mikicz/arca.git"),
                black_box("master"),
                &commit,
                black_box("task-fingerprint"),
            )
        });
    });

    group.bench_function("dependency_list_50", |b| {
        let dependencies: Vec<String> = (0..50).map(|i| format!("lib{}-dev", i)).collect();
        b.iter(|| dependency_list_fingerprint(black_box(&dependencies)));
    });

    group.finish();
}

fn benchmark_tasks(c: &mut Criterion) {
    let mut group = c.benchmark_group("tasks");

    group.bench_function("build_with_kwargs", |b| {
        b.iter(|| {
            Task::builder(black_box("package.module:Class.method"))
                .arg(1)
                .arg("two")
                .kwarg("nested", json!({"b": [1, 2, 3], "a": null}))
                .kwarg("flag", true)
                .build()
        });
    });

    group.bench_function("result_roundtrip", |b| {
        let result = ExecutionResult::Success {
            output: json!({"rows": (0..100).collect::<Vec<_>>()}),
            stdout: String::new(),
            stderr: String::new(),
        };
        b.iter(|| {
            let bytes = result.to_bytes().ok();
            black_box(bytes.and_then(|b| ExecutionResult::from_bytes(&b).ok()))
        });
    });

    group.finish();
}

criterion_group!(benches, benchmark_fingerprints, benchmark_tasks);
criterion_main!(benches);
