//! Fixed-capacity ring arena with blocking allocation
//!
//! A contiguous byte region from which element runs are checked out by a
//! producer and released by a consumer in FIFO order. The backing region
//! wraps circularly, so the oldest outstanding allocation must be the first
//! one freed. When the arena is full, `allocate` suspends the calling thread
//! until a `free` makes room.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::{Condvar, Mutex};

use bytemuck::Pod;

use crate::core::error::Error;
use crate::core::stats;
use crate::core::types::Result;

/// Runs are padded to this alignment so any Pod element type up to 8-byte
/// alignment can be viewed through an allocation.
const RUN_ALIGN: usize = 8;

struct LiveRun {
    offset: usize,
    bytes: usize,
}

struct RingState {
    /// Next allocation offset
    head: usize,
    /// Outstanding runs, oldest first
    live: VecDeque<LiveRun>,
}

/// Fixed-size circular byte arena.
pub struct RingBuffer {
    name: String,
    // u64 words keep the base 8-aligned for typed views of the runs
    storage: Box<[UnsafeCell<u64>]>,
    capacity: usize,
    state: Mutex<RingState>,
    freed: Condvar,
}

// The allocator only hands out disjoint ranges (see `grant`), so concurrent
// access to the storage through separate allocations cannot alias.
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Create an arena of `capacity` bytes. The name identifies it in the
    /// memory statistics.
    pub fn new(name: &str, capacity: usize) -> Self {
        assert!(capacity > 0, "arena capacity must be non-zero");
        let words = capacity.div_ceil(RUN_ALIGN);
        stats::global().peak_add("mem.all", capacity as i64);
        stats::global().peak_add(name, capacity as i64);
        Self {
            name: name.to_string(),
            storage: (0..words).map(|_| UnsafeCell::new(0u64)).collect(),
            capacity,
            state: Mutex::new(RingState {
                head: 0,
                live: VecDeque::new(),
            }),
            freed: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total capacity in bytes.
    pub fn size(&self) -> usize {
        self.capacity
    }

    /// Check out a contiguous run of up to `max_elements` elements of
    /// `element_size` bytes each.
    ///
    /// The returned run holds between 1 and `max_elements` elements: the
    /// count is capped to what fits contiguously before wraparound. Blocks
    /// while the arena is full.
    ///
    /// Fails with `InvalidArgument` if `max_elements` is zero or a single
    /// element can never fit.
    pub fn allocate(&self, element_size: usize, max_elements: usize) -> Result<Allocation> {
        if max_elements == 0 {
            return Err(Error::InvalidArgument(format!(
                "{}: cannot allocate zero elements",
                self.name
            )));
        }
        if element_size == 0 || element_size > self.capacity {
            return Err(Error::InvalidArgument(format!(
                "{}: element size {} cannot fit in arena of {} bytes",
                self.name, element_size, self.capacity
            )));
        }

        let mut state = self.state.lock().unwrap();
        loop {
            if state.live.is_empty() {
                // Whole arena free; restart from the beginning for the
                // largest possible contiguous run.
                state.head = 0;
                let count = max_elements.min(self.capacity / element_size);
                return Ok(self.grant(&mut state, 0, element_size, count));
            }

            let front = state.live.front().unwrap().offset;
            let head = state.head;
            // Free space: [head, front) when head is behind the oldest run,
            // otherwise [head, capacity) plus the wrapped region [0, front).
            let (primary, secondary) = if head > front {
                (self.capacity - head, front)
            } else if head < front {
                (front - head, 0)
            } else {
                (0, 0) // full
            };

            if primary >= element_size {
                let count = max_elements.min(primary / element_size);
                return Ok(self.grant(&mut state, head, element_size, count));
            }
            if secondary >= element_size {
                // The tail sliver cannot hold one element; wrap to the start.
                let count = max_elements.min(secondary / element_size);
                return Ok(self.grant(&mut state, 0, element_size, count));
            }

            state = self.freed.wait(state).unwrap();
        }
    }

    fn grant(
        &self,
        state: &mut RingState,
        offset: usize,
        element_size: usize,
        count: usize,
    ) -> Allocation {
        debug_assert!(count >= 1);
        let payload = count * element_size;
        // Pad so the next run starts aligned; the padding stays inside the
        // region that was verified free (it is only consumed up to capacity).
        let bytes = payload.next_multiple_of(RUN_ALIGN).min(self.capacity - offset);
        state.live.push_back(LiveRun { offset, bytes });
        state.head = offset + bytes;

        let base = UnsafeCell::raw_get(self.storage.as_ptr()) as *mut u8;
        // Offset is within the arena and the run does not overlap any other
        // live run, which grant's callers established under the state lock.
        let ptr = unsafe { NonNull::new_unchecked(base.add(offset)) };
        Allocation {
            ptr,
            offset,
            element_size,
            count,
        }
    }

    /// Release a run previously returned by `allocate`.
    ///
    /// Runs must come back in the order they were granted; the arena panics
    /// otherwise rather than corrupting its accounting.
    pub fn free(&self, allocation: Allocation) {
        let mut state = self.state.lock().unwrap();
        let front = state
            .live
            .pop_front()
            .expect("free called on an arena with no outstanding allocations");
        assert_eq!(
            front.offset, allocation.offset,
            "{}: allocations must be freed in FIFO order",
            self.name
        );
        drop(state);
        self.freed.notify_all();
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !state.live.is_empty() {
            log::warn!(
                "{}: arena dropped with {} outstanding allocations",
                self.name,
                state.live.len()
            );
        }
        stats::global().peak_add("mem.all", -(self.capacity as i64));
        stats::global().peak_add(&self.name, -(self.capacity as i64));
    }
}

/// A contiguous run of elements checked out from a [`RingBuffer`].
///
/// The run is exclusively owned until it is passed back to
/// [`RingBuffer::free`]; it is `Send` so a producer can fill it and hand it
/// to a consumer through a queue. A run must never outlive its arena; share
/// the arena behind an `Arc` when runs cross threads.
pub struct Allocation {
    ptr: NonNull<u8>,
    offset: usize,
    element_size: usize,
    count: usize,
}

unsafe impl Send for Allocation {}

impl Allocation {
    /// Number of elements in the run (1 ..= the requested maximum).
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// View the run as a slice of `T`. `T` must match the element size the
    /// run was allocated with.
    pub fn as_slice<T: Pod>(&self) -> &[T] {
        assert_eq!(std::mem::size_of::<T>(), self.element_size);
        debug_assert_eq!(self.ptr.as_ptr() as usize % std::mem::align_of::<T>(), 0);
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const T, self.count) }
    }

    /// Mutable view of the run.
    pub fn as_mut_slice<T: Pod>(&mut self) -> &mut [T] {
        assert_eq!(std::mem::size_of::<T>(), self.element_size);
        debug_assert_eq!(self.ptr.as_ptr() as usize % std::mem::align_of::<T>(), 0);
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr() as *mut T, self.count) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::queue::WorkQueue;
    use std::sync::Arc;

    #[test]
    fn test_allocate_free() {
        let buffer = RingBuffer::new("test", 16);
        let mut run = buffer.allocate(std::mem::size_of::<u16>(), 2).unwrap();
        assert!(run.len() >= 1 && run.len() <= 2);

        let values = run.as_mut_slice::<u16>();
        values[0] = 123;
        if values.len() > 1 {
            values[1] = 456;
        }
        buffer.free(run);
    }

    #[test]
    fn test_size() {
        let buffer = RingBuffer::new("test", 1000);
        assert_eq!(buffer.size(), 1000);
    }

    #[test]
    fn test_statistics() {
        // The per-arena stat is observed rather than mem.all, which other
        // concurrently running tests also touch.
        let buffer = RingBuffer::new("mem.ring_stats_test", 1000);
        assert_eq!(stats::global().peak("mem.ring_stats_test").current, 1000);
        drop(buffer);
        let after = stats::global().peak("mem.ring_stats_test");
        assert_eq!(after.current, 0);
        assert_eq!(after.peak, 1000);
    }

    #[test]
    fn test_big_max() {
        // A huge requested count is capped, not overflowed
        let buffer = RingBuffer::new("test", 1000);
        let run = buffer.allocate(4, 0x1000000000000).unwrap();
        assert!(run.len() > 0);
        assert!(run.len() <= 250);
        buffer.free(run);
    }

    #[test]
    fn test_element_too_large() {
        let buffer = RingBuffer::new("test", 16);
        assert!(matches!(
            buffer.allocate(24, 4),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_max_zero() {
        let buffer = RingBuffer::new("test", 16);
        assert!(matches!(
            buffer.allocate(4, 0),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    #[should_panic(expected = "FIFO order")]
    fn test_out_of_order_free_panics() {
        let buffer = RingBuffer::new("test", 64);
        let a = buffer.allocate(8, 2).unwrap();
        let b = buffer.allocate(8, 2).unwrap();
        let _keep = a;
        buffer.free(b);
    }

    /// Push millions of sequential integers through arena runs and a work
    /// queue, checking they arrive intact, in order, with no loss or
    /// duplication. The small arena forces constant wraparound and blocking
    /// on both the full and empty conditions.
    #[test]
    fn test_stress() {
        const TOTAL: u64 = 2_000_000;

        struct Item {
            run: Option<Allocation>,
        }

        let buffer = Arc::new(RingBuffer::new("mem.stress", 123));
        let queue = Arc::new(WorkQueue::<Item>::new(10));

        let producer = {
            let buffer = Arc::clone(&buffer);
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                let elem = std::mem::size_of::<u64>();
                let mut cur: u64 = 0;
                // Vary the chunk size so runs wrap at irregular offsets
                let mut chunk = 1usize;
                while cur < TOTAL {
                    let max = chunk.min((TOTAL - cur) as usize);
                    let mut run = buffer.allocate(elem, max).unwrap();
                    assert!(run.len() >= 1 && run.len() <= max);
                    for v in run.as_mut_slice::<u64>() {
                        *v = cur;
                        cur += 1;
                    }
                    queue.push(Item { run: Some(run) });
                    chunk = chunk % 29 + 1;
                }
                queue.push(Item { run: None });
            })
        };

        let mut expect: u64 = 0;
        loop {
            let item = queue.pop();
            let Some(run) = item.run else { break };
            assert!(run.len() > 0 && run.len() < buffer.size());
            for &v in run.as_slice::<u64>() {
                assert_eq!(v, expect);
                expect += 1;
            }
            buffer.free(run);
        }
        assert_eq!(expect, TOTAL);

        producer.join().unwrap();
    }
}
