//! Contender attribution
//!
//! The suspect is the task whose own signal jumped the most relative to its
//! recent baseline. Equal deltas resolve to the task seen first, so callers
//! pass tasks in a stable order.

use crate::metrics::TaskMetricStore;
use crate::models::{ContendedResource, TaskId};

/// Per-resource attribution signal of a task, `None` when the resource
/// cannot be attributed
pub fn contention_signal(store: &TaskMetricStore, resource: ContendedResource) -> Option<f64> {
    match resource {
        ContendedResource::Llc => Some(store.llc_occupancy_delta()),
        ContendedResource::MemoryBw => Some(store.latest_memory_bandwidth()),
        ContendedResource::Tdp => Some(store.freq_delta()),
        ContendedResource::CpuCycles | ContendedResource::Unknown => None,
    }
}

/// Name the single most likely contender of `contended` on `resource`
///
/// Only strictly positive signals qualify; no contender is named otherwise.
pub fn find_contender<'a, I>(contended: &str, resource: ContendedResource, tasks: I) -> Option<TaskId>
where
    I: IntoIterator<Item = &'a TaskMetricStore>,
{
    let mut best: Option<(&'a TaskMetricStore, f64)> = None;

    for store in tasks {
        if store.task_id() == contended {
            continue;
        }
        let Some(delta) = contention_signal(store, resource) else {
            return None;
        };
        if delta <= 0.0 {
            continue;
        }
        if best.map_or(true, |(_, max)| delta > max) {
            best = Some((store, delta));
        }
    }

    best.map(|(store, _)| store.task_id().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskMeasurements;

    /// Store whose LLC occupancy history ends with a jump of `delta` KiB
    fn store_with_llc_delta(id: &str, delta: f64) -> TaskMetricStore {
        let mut store = TaskMetricStore::new(id, 5);
        let base = 10.0 * 1024.0;
        let samples = [base, base, base + delta * 1024.0];
        for (i, bytes) in samples.iter().enumerate() {
            let m = TaskMeasurements {
                llc_occupancy_bytes: *bytes,
                ..Default::default()
            };
            store.update_measurement(i as f64, &m, true);
        }
        store
    }

    #[test]
    fn test_largest_positive_delta_wins() {
        let tasks = vec![
            store_with_llc_delta("lc", 100.0),
            store_with_llc_delta("be-1", 5.0),
            store_with_llc_delta("be-2", 12.0),
        ];

        let contender = find_contender("lc", ContendedResource::Llc, &tasks);
        assert_eq!(contender.as_deref(), Some("be-2"));
    }

    #[test]
    fn test_never_names_non_positive_delta() {
        let tasks = vec![
            store_with_llc_delta("lc", 0.0),
            store_with_llc_delta("be-1", 0.0),
            store_with_llc_delta("be-2", -4.0),
        ];

        assert_eq!(find_contender("lc", ContendedResource::Llc, &tasks), None);
    }

    #[test]
    fn test_equal_deltas_keep_first_seen() {
        let tasks = vec![
            store_with_llc_delta("lc", 100.0),
            store_with_llc_delta("be-1", 8.0),
            store_with_llc_delta("be-2", 8.0),
        ];
        assert_eq!(
            find_contender("lc", ContendedResource::Llc, &tasks).as_deref(),
            Some("be-1")
        );

        let reversed: Vec<_> = tasks.into_iter().rev().collect();
        assert_eq!(
            find_contender("lc", ContendedResource::Llc, &reversed).as_deref(),
            Some("be-2")
        );
    }

    #[test]
    fn test_contended_task_is_skipped() {
        let tasks = vec![store_with_llc_delta("lc", 50.0)];
        assert_eq!(find_contender("lc", ContendedResource::Llc, &tasks), None);
    }

    #[test]
    fn test_unknown_has_no_contender() {
        let tasks = vec![store_with_llc_delta("lc", 1.0), store_with_llc_delta("be", 9.0)];
        assert_eq!(find_contender("lc", ContendedResource::Unknown, &tasks), None);
    }

    #[test]
    fn test_memory_bw_uses_latest_bandwidth() {
        let mut busy = TaskMetricStore::new("be", 5);
        let bytes = |b: f64| TaskMeasurements {
            memory_bandwidth_bytes: b,
            ..Default::default()
        };
        busy.update_measurement(0.0, &bytes(0.0), true);
        busy.update_measurement(1.0, &bytes(64.0 * 1024.0 * 1024.0), true);

        let idle = TaskMetricStore::new("idle", 5);
        let tasks = vec![idle, busy];

        assert_eq!(
            find_contender("lc", ContendedResource::MemoryBw, &tasks).as_deref(),
            Some("be")
        );
    }
}
