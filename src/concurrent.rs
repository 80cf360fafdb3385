//! Reusable concurrency building blocks.
//!
//! The dispatcher in `pipeline` is built from the same ideas, but these helpers are
//! useful standalone: an order-preserving parallel map, an even chunk partitioner,
//! a named multi-task runner with isolated failure handling, and a binary search
//! over a monotonic predicate.

use log::{error, warn};
use rayon::prelude::*;
use std::collections::HashMap;
use std::error::Error;
use std::thread;

/// Outcome of one named task: either its value or the error it surfaced.
pub type TaskResult<R> = Result<R, Box<dyn Error + Send + Sync>>;

/// A task for [`run_named_tasks`]: a name and the closure to run under it.
pub type NamedTask<'a, R> = (String, Box<dyn FnOnce() -> TaskResult<R> + Send + 'a>);

/// Applies `func` to every item on a worker pool, returning results in input order
/// (not completion order).
///
/// `max_workers` of `None` uses the global rayon pool; `Some(n)` runs the map on a
/// dedicated pool of `n` threads, which bounds this call's parallelism without
/// reconfiguring the rest of the process. A per-item failure is the caller's
/// concern: map to a `Result` item type and collect, or use [`run_named_tasks`]
/// when failures must be isolated.
pub fn ordered_parallel_map<T, R, F>(items: Vec<T>, max_workers: Option<usize>, func: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync + Send,
{
    match max_workers {
        Some(n) if n > 0 => match rayon::ThreadPoolBuilder::new().num_threads(n).build() {
            Ok(pool) => pool.install(|| items.into_par_iter().map(&func).collect()),
            Err(e) => {
                warn!("could not build a {n}-thread pool ({e}); using the global pool");
                items.into_par_iter().map(&func).collect()
            }
        },
        _ => items.into_par_iter().map(&func).collect(),
    }
}

/// How to split a slice for [`partition_into_chunks`].
#[derive(Debug, Clone, Copy)]
pub enum ChunkPlan {
    /// Split into exactly this many chunks (before empty chunks are skipped).
    NumChunks(usize),
    /// Split into `ceil(len / size)` chunks of roughly this size.
    ChunkSize(usize),
}

/// Lazily yields `(chunk_index, chunk)` pairs splitting `items` as evenly as
/// possible.
///
/// The remainder is distributed one extra item per chunk starting from chunk 0, so
/// ten items in three chunks come out as sizes 4, 3, 3. Chunks that would be empty
/// are skipped. Concatenating the chunks in index order reproduces `items` exactly.
pub fn partition_into_chunks<T>(
    items: &[T],
    plan: ChunkPlan,
) -> impl Iterator<Item = (usize, &[T])> + '_ {
    let len = items.len();
    let num_chunks = match plan {
        ChunkPlan::NumChunks(n) => n.max(1),
        ChunkPlan::ChunkSize(size) => len.div_ceil(size.max(1)).max(1),
    };
    let base = len / num_chunks;
    let remainder = len % num_chunks;

    (0..num_chunks)
        .scan(0usize, move |start, index| {
            let size = base + usize::from(index < remainder);
            let chunk = &items[*start..*start + size];
            *start += size;
            Some((index, chunk))
        })
        .filter(|(_, chunk)| !chunk.is_empty())
}

/// Runs each named task on its own thread and returns a map from name to result.
///
/// A task that returns an error, or panics, is logged under its name and simply
/// absent from the returned map; sibling tasks are unaffected. Duplicate names keep
/// the last finisher.
pub fn run_named_tasks<R: Send>(tasks: Vec<NamedTask<'_, R>>) -> HashMap<String, R> {
    let mut results = HashMap::with_capacity(tasks.len());
    thread::scope(|s| {
        let handles: Vec<_> = tasks
            .into_iter()
            .map(|(name, task)| (name, s.spawn(task)))
            .collect();
        for (name, handle) in handles {
            match handle.join() {
                Ok(Ok(value)) => {
                    results.insert(name, value);
                }
                Ok(Err(e)) => {
                    error!("task '{name}' failed: {e}");
                }
                Err(_) => {
                    error!("task '{name}' panicked");
                }
            }
        }
    });
    results
}

/// Binary search over a monotonic predicate: `items` must be ordered so that
/// `predicate` is false for some prefix and true for the rest. Returns the smallest
/// index where it holds, or `None` if it never does (the `Option` stands in for
/// the conventional `-1` sentinel).
///
/// Over `[1, 3, 5, 7, 9]`, `|v| *v >= 5` gives `Some(2)` and `|v| *v >= 100`
/// gives `None`.
///
/// This searches a boolean transition point, not a value; it is the tool for
/// questions like "first element at least this large" over pre-sorted data.
pub fn monotonic_bisect<T, P>(items: &[T], predicate: P) -> Option<usize>
where
    P: Fn(&T) -> bool,
{
    let mut low = 0usize;
    let mut high = items.len();
    let mut first_true = None;
    while low < high {
        let mid = low + (high - low) / 2;
        if predicate(&items[mid]) {
            first_true = Some(mid);
            high = mid;
        } else {
            low = mid + 1;
        }
    }
    first_true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn ordered_map_preserves_input_order() {
        let items: Vec<usize> = (0..64).collect();
        let doubled = ordered_parallel_map(items.clone(), None, |x| x * 2);
        let expected: Vec<usize> = items.iter().map(|x| x * 2).collect();
        assert_eq!(doubled, expected);
    }

    #[test]
    fn ordered_map_respects_worker_bound() {
        let peak = AtomicUsize::new(0);
        let live = AtomicUsize::new(0);
        let items: Vec<usize> = (0..32).collect();
        ordered_parallel_map(items, Some(2), |x| {
            let now = live.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(5));
            live.fetch_sub(1, Ordering::SeqCst);
            x
        });
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn ordered_map_with_result_items_surfaces_failures_to_the_caller() {
        let outcome: Result<Vec<usize>, String> =
            ordered_parallel_map(vec![1usize, 2, 3], None, |x| {
                if x == 2 {
                    Err("two is unprocessable".to_string())
                } else {
                    Ok(x)
                }
            })
            .into_iter()
            .collect();
        assert!(outcome.is_err());
    }

    #[test]
    fn ten_items_in_three_chunks_split_4_3_3() {
        let items: Vec<u32> = (0..10).collect();
        let chunks: Vec<(usize, &[u32])> =
            partition_into_chunks(&items, ChunkPlan::NumChunks(3)).collect();
        let sizes: Vec<usize> = chunks.iter().map(|(_, c)| c.len()).collect();
        assert_eq!(sizes, vec![4, 3, 3]);
        assert_eq!(chunks[0].0, 0);
        assert_eq!(chunks[2].0, 2);

        let rejoined: Vec<u32> = chunks.iter().flat_map(|(_, c)| c.iter().copied()).collect();
        assert_eq!(rejoined, items);
    }

    #[test]
    fn chunk_size_plan_rounds_up_chunk_count() {
        let items: Vec<u32> = (0..10).collect();
        let chunks: Vec<(usize, &[u32])> =
            partition_into_chunks(&items, ChunkPlan::ChunkSize(4)).collect();
        // ceil(10 / 4) = 3 chunks, evened out to 4, 3, 3.
        assert_eq!(chunks.len(), 3);
        let rejoined: Vec<u32> = chunks.iter().flat_map(|(_, c)| c.iter().copied()).collect();
        assert_eq!(rejoined, items);
    }

    #[test]
    fn more_chunks_than_items_skips_empty_chunks() {
        let items = [1, 2];
        let chunks: Vec<(usize, &[i32])> =
            partition_into_chunks(&items, ChunkPlan::NumChunks(5)).collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], (0, &items[0..1]));
        assert_eq!(chunks[1], (1, &items[1..2]));
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        let items: [u8; 0] = [];
        assert_eq!(
            partition_into_chunks(&items, ChunkPlan::NumChunks(3)).count(),
            0
        );
    }

    #[test]
    fn named_tasks_isolate_failures() {
        let tasks: Vec<NamedTask<'_, u32>> = vec![
            ("ok_a".to_string(), Box::new(|| Ok(1))),
            (
                "broken".to_string(),
                Box::new(|| Err("deliberate".to_string().into())),
            ),
            ("ok_b".to_string(), Box::new(|| Ok(2))),
        ];
        let results = run_named_tasks(tasks);
        assert_eq!(results.len(), 2);
        assert_eq!(results["ok_a"], 1);
        assert_eq!(results["ok_b"], 2);
        assert!(!results.contains_key("broken"));
    }

    #[test]
    fn named_task_panic_only_loses_that_task() {
        let tasks: Vec<NamedTask<'_, u32>> = vec![
            ("survivor".to_string(), Box::new(|| Ok(7))),
            ("crasher".to_string(), Box::new(|| panic!("boom"))),
        ];
        let results = run_named_tasks(tasks);
        assert_eq!(results.len(), 1);
        assert_eq!(results["survivor"], 7);
    }

    #[test]
    fn bisect_finds_first_true_index() {
        let items = [1, 3, 5, 7, 9];
        assert_eq!(monotonic_bisect(&items, |v| *v >= 5), Some(2));
        assert_eq!(monotonic_bisect(&items, |v| *v >= 100), None);
        assert_eq!(monotonic_bisect(&items, |v| *v >= 0), Some(0));
        assert_eq!(monotonic_bisect(&items, |v| *v >= 9), Some(4));
    }

    #[test]
    fn bisect_on_empty_slice_is_none() {
        let items: [i32; 0] = [];
        assert_eq!(monotonic_bisect(&items, |_| true), None);
    }
}
