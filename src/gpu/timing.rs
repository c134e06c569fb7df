//! Device timing collection
//!
//! Completions are queued with a statistic name and reaped once the device
//! reports them done. The mutex only shields short queue operations; it is
//! never held across a blocking wait.

use std::collections::VecDeque;
use std::sync::{Mutex, OnceLock};

use super::completion::Completion;
use crate::core::stats;

struct PendingSample {
    completion: Completion,
    stat: String,
}

fn pending() -> &'static Mutex<VecDeque<PendingSample>> {
    static PENDING: OnceLock<Mutex<VecDeque<PendingSample>>> = OnceLock::new();
    PENDING.get_or_init(|| Mutex::new(VecDeque::new()))
}

/// Queue a completion for timing under the named statistic, reaping any
/// samples that have already finished.
pub fn time_completion(completion: Completion, stat: &str) {
    let mut queue = pending().lock().unwrap();
    queue.push_back(PendingSample {
        completion,
        stat: stat.to_string(),
    });
    stats::global().peak_add("events.peak", 1);
    flush_locked(&mut queue);
}

/// Drain every sample that is ready. With `finalize`, wait for stragglers;
/// call this once at the end of a run.
pub fn flush(finalize: bool) {
    if finalize {
        // Waits happen outside the lock so concurrent submitters never
        // block behind a device stall.
        loop {
            let front = {
                let mut queue = pending().lock().unwrap();
                flush_locked(&mut queue);
                match queue.pop_front() {
                    Some(sample) => sample,
                    None => return,
                }
            };
            log::debug!("waiting for straggling event {}", front.stat);
            front.completion.wait();
            record(&front);
        }
    } else {
        let mut queue = pending().lock().unwrap();
        flush_locked(&mut queue);
    }
}

fn flush_locked(queue: &mut VecDeque<PendingSample>) {
    while let Some(front) = queue.front() {
        if !front.completion.is_ready() {
            return;
        }
        let sample = queue.pop_front().unwrap();
        record(&sample);
    }
}

fn record(sample: &PendingSample) {
    stats::global().variable_add(&sample.stat, sample.completion.elapsed().as_secs_f64());
    stats::global().peak_add("events.peak", -1);
}
