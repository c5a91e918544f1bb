// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Criterion benchmarks for the job queue hot paths: claiming jobs, requeueing
// and serializing a long queue.

use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};

use printfarm_core::types::Job;
use printfarm_print::queue::JobQueue;

/// Queue of `finished` terminal jobs followed by `ready` unclaimed ones.
fn build_queue(finished: usize, ready: usize) -> JobQueue {
    let queue = JobQueue::new();
    for i in 0..finished {
        let job = queue.add(Job::new(format!("/g/done-{i}.gcode")));
        queue.print_finished(&job);
    }
    for i in 0..ready {
        queue.add(Job::new(format!("/g/ready-{i}.gcode")));
    }
    queue
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

/// Claim every ready job in a queue with a long finished tail.
fn bench_try_claim(c: &mut Criterion) {
    c.bench_function("try_claim (100 ready, 1000 finished)", |b| {
        b.iter_batched(
            || build_queue(1000, 100),
            |queue| {
                while let Some(job) = queue.try_claim(black_box("p1")) {
                    black_box(job);
                }
            },
            BatchSize::SmallInput,
        );
    });
}

/// Requeue a claimed job, which moves it in front of the unclaimed ones.
fn bench_enqueue_existing(c: &mut Criterion) {
    let queue = build_queue(500, 500);

    c.bench_function("enqueue existing (1000 jobs)", |b| {
        b.iter(|| {
            if let Some(job) = queue.try_claim("p1") {
                queue.enqueue(black_box(&job));
            }
        });
    });
}

/// Render the queue as the JSON served to the dashboard.
fn bench_to_json(c: &mut Criterion) {
    let queue = build_queue(900, 100);

    c.bench_function("to_json (1000 jobs)", |b| {
        b.iter(|| {
            let json = queue.to_json();
            assert!(json.is_ok());
            black_box(json)
        });
    });
}

criterion_group!(
    benches,
    bench_try_claim,
    bench_enqueue_existing,
    bench_to_json,
);
criterion_main!(benches);
