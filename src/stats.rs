//! Lightweight per-method call statistics.
//!
//! Components that talk to external systems (the redis mailbox, the backend
//! client) wrap each operation in [`MethodTracker::instrument`] so operators
//! can read call counts, failure counts and cumulative latency without a
//! metrics backend attached.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;

/// A component that exposes per-method statistics, collected by the private
/// stats endpoint.
pub trait StatsSource: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn stats(&self) -> Vec<MethodSnapshot>;
}

#[derive(Default)]
struct MethodStats {
    calls: AtomicU64,
    failures: AtomicU64,
    total_micros: AtomicU64,
}

/// Point-in-time view of one method's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodSnapshot {
    pub method: &'static str,
    pub calls: u64,
    pub failures: u64,
    pub avg_latency_micros: u64,
}

/// Concurrent counter table keyed by method name.
///
/// Methods are registered up front so snapshots always list every method,
/// including ones that have not been called yet.
pub struct MethodTracker {
    methods: DashMap<&'static str, MethodStats>,
}

impl MethodTracker {
    pub fn new(methods: &[&'static str]) -> Self {
        let table = DashMap::with_capacity(methods.len());
        for method in methods {
            table.insert(*method, MethodStats::default());
        }
        MethodTracker { methods: table }
    }

    /// Runs `fut`, recording the call, its latency, and whether it failed.
    ///
    /// Unregistered method names are counted too; they get a row on first
    /// use.
    pub async fn instrument<T, E, F>(&self, method: &'static str, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let result = fut.await;
        let elapsed = started.elapsed().as_micros() as u64;

        let stats = self.methods.entry(method).or_default();
        stats.calls.fetch_add(1, Ordering::Relaxed);
        stats.total_micros.fetch_add(elapsed, Ordering::Relaxed);
        if result.is_err() {
            stats.failures.fetch_add(1, Ordering::Relaxed);
        }

        result
    }

    pub fn snapshot(&self) -> Vec<MethodSnapshot> {
        let mut rows: Vec<MethodSnapshot> = self
            .methods
            .iter()
            .map(|entry| {
                let calls = entry.calls.load(Ordering::Relaxed);
                let total = entry.total_micros.load(Ordering::Relaxed);
                MethodSnapshot {
                    method: entry.key(),
                    calls,
                    failures: entry.failures.load(Ordering::Relaxed),
                    avg_latency_micros: if calls == 0 { 0 } else { total / calls },
                }
            })
            .collect();
        rows.sort_by_key(|row| row.method);
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counts_calls_and_failures() {
        let tracker = MethodTracker::new(&["insert", "retrieve"]);

        let ok: Result<u32, &str> = tracker.instrument("insert", async { Ok(1) }).await;
        assert_eq!(ok, Ok(1));
        let err: Result<u32, &str> = tracker.instrument("insert", async { Err("boom") }).await;
        assert_eq!(err, Err("boom"));

        let rows = tracker.snapshot();
        let insert = rows.iter().find(|row| row.method == "insert").unwrap();
        assert_eq!(insert.calls, 2);
        assert_eq!(insert.failures, 1);

        let retrieve = rows.iter().find(|row| row.method == "retrieve").unwrap();
        assert_eq!(retrieve.calls, 0);
    }
}
