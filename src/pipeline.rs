// ========================================================================================
//
//                       THE BOUNDED-CONCURRENCY INGESTION PIPELINE
//
// ========================================================================================
//
// This module is the coordination heart of the crate. One single-threaded dispatcher
// loop pulls serialized fragments from a lazy source, feeds them to a fixed pool of
// worker threads over a bounded channel, and folds completed results into the running
// totals. Three rules govern the loop:
//
//   1. BACKPRESSURE. At most `window = window_multiplier * pool_size` tasks are
//      outstanding (submitted but not yet harvested) at any instant. When the window
//      is full, the dispatcher blocks until it has harvested exactly one completion
//      before submitting the next fragment. A fast reader therefore cannot pile up
//      pending fragment strings ahead of a slow pool.
//
//   2. SINGLE-WRITER AGGREGATION. Only the dispatcher loop touches `RunningTotals`.
//      Workers communicate completions over a channel; harvesting happens in one
//      logical actor, so merges are serialized without a mutex. Completions are
//      harvested in completion order, not submission order, which is sound because
//      the totals are pure sums.
//
//   3. PARTIAL FAILURE. A processing failure (or a worker panic) is caught per task,
//      logged with the processor's identity and the fragment's submission index,
//      counted, and never propagated. The run always continues to the end of the
//      input and reports failures in the summary.

use crate::reader::FragmentReader;
use crate::types::{
    FragmentProcessor, PipelineConfig, PipelineError, ProcessingError, ProgressSnapshot,
    RecordCounts, RunSummary, RunningTotals,
};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{error, info};
use std::any::type_name;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::thread;
use std::time::Instant;

/// One scheduled unit of work: a fragment plus its submission index.
///
/// Ownership of the fragment string transfers to the task at submission; once the
/// task reaches a terminal state only its outcome survives.
struct Task {
    index: u64,
    fragment: String,
}

/// What became of one task. `index` identifies the originating fragment for
/// failure logs; the totals themselves do not depend on it.
struct TaskOutcome {
    index: u64,
    result: Result<RecordCounts, TaskError>,
}

enum TaskError {
    Processing(ProcessingError),
    Panicked(String),
}

/// Streams `path`, processing each `config.tag_name` fragment with `processor`.
///
/// The only errors that propagate from here are fatal setup errors (the input
/// cannot be opened). Per-fragment processing failures are absorbed into the
/// summary's failure count.
pub fn process_file<P>(
    path: &Path,
    processor: &P,
    config: &PipelineConfig,
) -> Result<RunSummary, PipelineError>
where
    P: FragmentProcessor,
{
    let reader = FragmentReader::open(path, &config.tag_name)?;
    info!(
        "processing '{}' with {} workers (window {})",
        path.display(),
        config.pool_size.max(1),
        config.window()
    );
    Ok(run_pipeline(reader, processor, config))
}

/// Runs the bounded dispatcher over any fragment source.
///
/// Generic over the source so the streaming reader and synthetic in-memory inputs
/// feed the identical code path.
pub fn run_pipeline<I, P>(fragments: I, processor: &P, config: &PipelineConfig) -> RunSummary
where
    I: IntoIterator<Item = String>,
    P: FragmentProcessor,
{
    let start = Instant::now();
    let pool_size = config.pool_size.max(1);
    let window = config.window();

    // Task capacity equals the window, so a submit can never block on channel
    // space: the dispatcher only submits while fewer than `window` tasks are
    // outstanding, and queued tasks are a subset of outstanding tasks.
    let (task_tx, task_rx) = bounded::<Task>(window);
    let (outcome_tx, outcome_rx) = bounded::<TaskOutcome>(window);

    let mut totals = RunningTotals::default();
    let mut fragments_read = 0u64;
    let mut abandoned = 0usize;

    thread::scope(|s| {
        for _ in 0..pool_size {
            let task_rx = task_rx.clone();
            let outcome_tx = outcome_tx.clone();
            s.spawn(move || worker_loop(task_rx, outcome_tx, processor, config));
        }
        // The dispatcher keeps no senders/receivers beyond the ones it uses:
        // workers exit when `task_tx` drops, and `outcome_rx` disconnects when
        // the last worker exits.
        drop(task_rx);
        drop(outcome_tx);

        let mut in_flight = 0usize;
        let mut source = fragments.into_iter();
        loop {
            if in_flight == window {
                // Window full: suspend until exactly one outstanding task
                // finishes, merge it, then go get the next fragment.
                if !harvest_one::<P>(&outcome_rx, &mut totals) {
                    break;
                }
                in_flight -= 1;
            }
            let Some(fragment) = source.next() else {
                break;
            };
            let task = Task {
                index: fragments_read,
                fragment,
            };
            if task_tx.send(task).is_err() {
                // Unreachable while workers hold the receiver; defensive exit.
                error!("worker pool disconnected; abandoning remaining input");
                break;
            }
            in_flight += 1;
            fragments_read += 1;
            if config.progress_cadence > 0 && fragments_read % config.progress_cadence == 0 {
                let snapshot = ProgressSnapshot {
                    fragments_read,
                    elapsed: start.elapsed(),
                    totals,
                };
                info!("{snapshot}");
            }
        }

        // Input exhausted: close the task channel and drain every task still in
        // flight. Workers drain their queue before exiting, so each remaining
        // outcome is guaranteed to arrive.
        drop(task_tx);
        while in_flight > 0 {
            if !harvest_one::<P>(&outcome_rx, &mut totals) {
                break;
            }
            in_flight -= 1;
        }
        // Nonzero only on the defensive disconnect paths above; a normal run
        // always drains to zero.
        abandoned = in_flight;
    });

    let summary = RunSummary {
        fragments_read,
        succeeded: totals.succeeded,
        failed: totals.failed,
        counts: totals.counts,
        elapsed: start.elapsed(),
    };
    if abandoned > 0 {
        error!(
            "{abandoned} submitted task(s) were never harvested; \
             fragments_read exceeds succeeded + failed by that amount"
        );
    }
    info!(
        "finished: {} fragments, {} succeeded, {} failed; {} in {:.2?}",
        summary.fragments_read, summary.succeeded, summary.failed, summary.counts, summary.elapsed
    );
    summary
}

/// Receives one completion, whichever task finished first, and merges it.
/// Returns false only if the outcome channel disconnected unexpectedly.
fn harvest_one<P>(outcome_rx: &Receiver<TaskOutcome>, totals: &mut RunningTotals) -> bool
where
    P: FragmentProcessor,
{
    let outcome = match outcome_rx.recv() {
        Ok(outcome) => outcome,
        Err(_) => {
            error!("outcome channel closed with tasks still outstanding");
            return false;
        }
    };
    match outcome.result {
        Ok(counts) => totals.record_success(counts),
        Err(TaskError::Processing(e)) => {
            error!(
                "fragment {} failed in {}: {e}",
                outcome.index,
                type_name::<P>()
            );
            let mut cause = std::error::Error::source(&e);
            while let Some(inner) = cause {
                error!("  caused by: {inner}");
                cause = inner.source();
            }
            totals.record_failure();
        }
        Err(TaskError::Panicked(message)) => {
            error!(
                "fragment {} panicked in {}: {message}",
                outcome.index,
                type_name::<P>()
            );
            totals.record_failure();
        }
    }
    true
}

/// One worker: pull a task, run the processor, report the terminal state.
///
/// Runs until the task channel is closed and drained. A panic in the processor is
/// contained here so the pool (and the run) survives it.
fn worker_loop<P>(
    task_rx: Receiver<Task>,
    outcome_tx: Sender<TaskOutcome>,
    processor: &P,
    config: &PipelineConfig,
) where
    P: FragmentProcessor,
{
    for task in task_rx.iter() {
        let Task { index, fragment } = task;
        let result =
            match panic::catch_unwind(AssertUnwindSafe(|| processor.process(&fragment, config))) {
                Ok(Ok(counts)) => Ok(counts),
                Ok(Err(e)) => Err(TaskError::Processing(e)),
                Err(payload) => Err(TaskError::Panicked(panic_message(&payload))),
            };
        // Fragment string dropped here; only the outcome travels back.
        drop(fragment);
        if outcome_tx.send(TaskOutcome { index, result }).is_err() {
            break;
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
