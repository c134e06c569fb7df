//! Completion handles for asynchronous device work
//!
//! Enqueue operations return a `Completion` instead of taking callbacks:
//! the caller decides when to block. The handle is cheap to clone and can
//! cross threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Fires once everything submitted to the queue before its creation has
/// executed on the device.
#[derive(Clone)]
pub struct Completion {
    device: wgpu::Device,
    done: Arc<AtomicBool>,
    submitted: Instant,
}

impl Completion {
    /// Capture a completion point covering all work submitted so far.
    pub fn new(device: &wgpu::Device, queue: &wgpu::Queue) -> Self {
        let done = Arc::new(AtomicBool::new(false));
        let signal = Arc::clone(&done);
        queue.on_submitted_work_done(move || {
            signal.store(true, Ordering::Release);
        });
        Self {
            device: device.clone(),
            done,
            submitted: Instant::now(),
        }
    }

    /// Non-blocking readiness check, pumping the device once.
    pub fn is_ready(&self) -> bool {
        if self.done.load(Ordering::Acquire) {
            return true;
        }
        let _ = self.device.poll(wgpu::PollType::Poll);
        self.done.load(Ordering::Acquire)
    }

    /// Block until the covered work has executed.
    pub fn wait(&self) {
        while !self.done.load(Ordering::Acquire) {
            let _ = self.device.poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            });
        }
    }

    /// Wall-clock time since the completion point was captured.
    pub fn elapsed(&self) -> Duration {
        self.submitted.elapsed()
    }
}
