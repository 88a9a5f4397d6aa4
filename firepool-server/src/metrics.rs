//! Prometheus text exposition for pool, provider, and VM metrics.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use firepool_core::{MetricsSink, RunnerCounts};

type PoolKey = String;
type OpKey = (String, String);

#[derive(Debug, Default, Clone, Copy)]
struct Summary {
    sum: f64,
    count: u64,
}

impl Summary {
    fn observe(&mut self, elapsed: Duration) {
        self.sum += elapsed.as_secs_f64();
        self.count += 1;
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct PoolGauges {
    min_runners: usize,
    max_runners: usize,
    active: bool,
    counts: RunnerCounts,
}

#[derive(Debug, Default)]
struct Families {
    pools: BTreeMap<PoolKey, PoolGauges>,
    scale_requests: BTreeMap<PoolKey, u64>,
    scale_successes: BTreeMap<PoolKey, u64>,
    scale_failures: BTreeMap<PoolKey, u64>,
    provider_requests: BTreeMap<OpKey, u64>,
    provider_errors: BTreeMap<OpKey, u64>,
    vm_creation: BTreeMap<PoolKey, Summary>,
    vm_lifetime: BTreeMap<PoolKey, Summary>,
    image_pull: BTreeMap<PoolKey, Summary>,
}

/// In-process metrics sink rendered at `GET /metrics`.
#[derive(Debug, Default)]
pub struct PrometheusRecorder {
    families: Mutex<Families>,
}

impl PrometheusRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Families) -> R) -> R {
        let mut families = self.families.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut families)
    }

    /// Render every family in Prometheus text format.
    #[must_use]
    pub fn render(&self) -> String {
        self.with(|f| {
            let mut out = String::with_capacity(4096);

            let gauge = |out: &mut String, name: &str, help: &str, value: fn(&PoolGauges) -> usize| {
                header(out, name, help, "gauge");
                for (pool, g) in &f.pools {
                    let _ = writeln!(out, "{name}{{pool=\"{}\"}} {}", escape(pool), value(g));
                }
            };
            gauge(&mut out, "firepool_pool_min_runners", "Configured runner floor", |g| g.min_runners);
            gauge(&mut out, "firepool_pool_max_runners", "Configured runner ceiling", |g| g.max_runners);
            gauge(&mut out, "firepool_pool_active", "1 if the pool is scaling, 0 if paused", |g| usize::from(g.active));
            gauge(&mut out, "firepool_pool_current_runners", "Tracked runner records", |g| g.counts.total());
            gauge(&mut out, "firepool_pool_starting_runners", "Runners being registered or booted", |g| g.counts.starting);
            gauge(&mut out, "firepool_pool_idle_runners", "Runners waiting for a job", |g| g.counts.idle);
            gauge(&mut out, "firepool_pool_busy_runners", "Runners executing a job", |g| g.counts.busy);
            gauge(&mut out, "firepool_pool_stopping_runners", "Runners being torn down", |g| g.counts.stopping);

            pool_counter(&mut out, "firepool_pool_scale_requests_total", "Runner spawns requested", &f.scale_requests);
            pool_counter(&mut out, "firepool_pool_scale_successes_total", "Runner spawns that booted a VM", &f.scale_successes);
            pool_counter(&mut out, "firepool_pool_scale_failures_total", "Runner spawns that failed", &f.scale_failures);

            op_counter(&mut out, "firepool_provider_requests_total", "CI provider API requests", &f.provider_requests);
            op_counter(&mut out, "firepool_provider_errors_total", "CI provider API errors", &f.provider_errors);

            summary(&mut out, "firepool_vm_creation_duration_seconds", "Spawn to booted VM", &f.vm_creation);
            summary(&mut out, "firepool_vm_lifetime_duration_seconds", "Spawn to VM exit", &f.vm_lifetime);
            summary(&mut out, "firepool_vm_image_pull_duration_seconds", "Container image pulls", &f.image_pull);

            out
        })
    }
}

fn header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

fn pool_counter(out: &mut String, name: &str, help: &str, values: &BTreeMap<PoolKey, u64>) {
    header(out, name, help, "counter");
    for (pool, v) in values {
        let _ = writeln!(out, "{name}{{pool=\"{}\"}} {v}", escape(pool));
    }
}

fn op_counter(out: &mut String, name: &str, help: &str, values: &BTreeMap<OpKey, u64>) {
    header(out, name, help, "counter");
    for ((pool, op), v) in values {
        let _ = writeln!(out, "{name}{{pool=\"{}\",operation=\"{}\"}} {v}", escape(pool), escape(op));
    }
}

fn summary(out: &mut String, name: &str, help: &str, values: &BTreeMap<PoolKey, Summary>) {
    header(out, name, help, "summary");
    for (pool, s) in values {
        let pool = escape(pool);
        let _ = writeln!(out, "{name}_sum{{pool=\"{pool}\"}} {}", s.sum);
        let _ = writeln!(out, "{name}_count{{pool=\"{pool}\"}} {}", s.count);
    }
}

fn escape(label: &str) -> String {
    label.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

fn bump<K: Ord>(map: &mut BTreeMap<K, u64>, key: K) {
    *map.entry(key).or_default() += 1;
}

impl MetricsSink for PrometheusRecorder {
    fn pool_limits(&self, pool: &str, min: usize, max: usize) {
        self.with(|f| {
            let g = f.pools.entry(pool.to_owned()).or_default();
            g.min_runners = min;
            g.max_runners = max;
        });
    }

    fn pool_active(&self, pool: &str, active: bool) {
        self.with(|f| f.pools.entry(pool.to_owned()).or_default().active = active);
    }

    fn runner_counts(&self, pool: &str, counts: &RunnerCounts) {
        self.with(|f| f.pools.entry(pool.to_owned()).or_default().counts = *counts);
    }

    fn scale_requested(&self, pool: &str) {
        self.with(|f| bump(&mut f.scale_requests, pool.to_owned()));
    }

    fn scale_succeeded(&self, pool: &str) {
        self.with(|f| bump(&mut f.scale_successes, pool.to_owned()));
    }

    fn scale_failed(&self, pool: &str) {
        self.with(|f| bump(&mut f.scale_failures, pool.to_owned()));
    }

    fn provider_request(&self, pool: &str, operation: &str) {
        self.with(|f| bump(&mut f.provider_requests, (pool.to_owned(), operation.to_owned())));
    }

    fn provider_error(&self, pool: &str, operation: &str) {
        self.with(|f| bump(&mut f.provider_errors, (pool.to_owned(), operation.to_owned())));
    }

    fn vm_created(&self, pool: &str, elapsed: Duration) {
        self.with(|f| f.vm_creation.entry(pool.to_owned()).or_default().observe(elapsed));
    }

    fn vm_lifetime(&self, pool: &str, elapsed: Duration) {
        self.with(|f| f.vm_lifetime.entry(pool.to_owned()).or_default().observe(elapsed));
    }

    fn image_pulled(&self, pool: &str, elapsed: Duration) {
        self.with(|f| f.image_pull.entry(pool.to_owned()).or_default().observe(elapsed));
    }
}
