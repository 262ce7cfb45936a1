//! Time-sliced task queues.
//!
//! A `TaskRunner` holds plain task values and paces them: one bounded unit of
//! work per due slice, slices spaced by a configured delay, so a large tree
//! never blocks the host's event loop. The runner owns scheduling only; the
//! tracker drives the protocol per due slice: take the current task, run one
//! unit, put it back, evict finished tasks, then either report the queue
//! empty or schedule the next slice.
//!
//! Indexing uses FIFO order. Removal uses LIFO so a task spawned for a nested
//! duplicate folder runs before the task that spawned it, descending first.

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOrder {
    Fifo,
    Lifo,
}

/// Spacing between work slices.
pub const DEFAULT_SLICE_DELAY_MS: u64 = 50;

#[derive(Debug)]
pub struct TaskRunner<T> {
    order: QueueOrder,
    slice_delay_ms: u64,
    queue: VecDeque<T>,
    paused: bool,
    ready_at: Option<u64>,
}

impl<T> TaskRunner<T> {
    pub fn new(order: QueueOrder, slice_delay_ms: u64) -> Self {
        Self {
            order,
            slice_delay_ms,
            queue: VecDeque::new(),
            paused: false,
            ready_at: None,
        }
    }

    /// Enqueue a task; the first slice comes due one delay from `now`.
    /// Posting a task that is already queued is an invariant violation.
    pub fn post(&mut self, task: T, now: u64)
    where
        T: PartialEq,
    {
        debug_assert!(
            !self.queue.contains(&task),
            "task posted twice to the same queue"
        );
        self.queue.push_front(task);
        if self.ready_at.is_none() && !self.paused {
            self.ready_at = Some(now + self.slice_delay_ms);
        }
    }

    pub fn slice_due(&self, now: u64) -> bool {
        !self.paused && self.ready_at.is_some_and(|at| now >= at)
    }

    /// Deadline of the next slice, if one is armed.
    pub fn next_slice_at(&self) -> Option<u64> {
        if self.paused { None } else { self.ready_at }
    }

    /// Detach the current task: the oldest for FIFO, the newest for LIFO.
    pub fn take_current(&mut self) -> Option<T> {
        match self.order {
            QueueOrder::Fifo => self.queue.pop_back(),
            QueueOrder::Lifo => self.queue.pop_front(),
        }
    }

    /// Return a task taken with `take_current` to its slot.
    pub fn put_back(&mut self, task: T) {
        match self.order {
            QueueOrder::Fifo => self.queue.push_back(task),
            QueueOrder::Lifo => self.queue.push_front(task),
        }
    }

    pub fn peek_current(&self) -> Option<&T> {
        match self.order {
            QueueOrder::Fifo => self.queue.back(),
            QueueOrder::Lifo => self.queue.front(),
        }
    }

    pub fn evict_current(&mut self) -> Option<T> {
        self.take_current()
    }

    /// Arm the next slice, or disarm when there is nothing left to run.
    pub fn schedule_next(&mut self, now: u64) {
        self.ready_at = if self.queue.is_empty() || self.paused {
            None
        } else {
            Some(now + self.slice_delay_ms)
        };
    }

    pub fn pause(&mut self) {
        debug_assert!(!self.paused, "runner already paused");
        self.paused = true;
        self.ready_at = None;
    }

    pub fn unpause(&mut self, now: u64) {
        debug_assert!(self.paused, "runner not paused");
        self.paused = false;
        if !self.queue.is_empty() {
            self.ready_at = Some(now + self.slice_delay_ms);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Drop every queued task and all pacing state.
    pub fn reset(&mut self) {
        self.queue.clear();
        self.paused = false;
        self.ready_at = None;
    }
}
