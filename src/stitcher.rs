//! Per-thread call stitching
//!
//! Intercepted libraries call into each other: an `H5Dwrite` may issue an
//! `MPI_File_write_at`, which in turn issues `pwrite`. Each thread keeps a
//! depth counter and a FIFO of the events entered since it was last at depth
//! zero. When the outermost call returns, the whole FIFO is released in entry
//! order, so a nested cascade always reaches the grammar in the same textual
//! order regardless of how the calls returned.
//!
//! Stacks live in a concurrent map keyed by thread id. Each entry is only
//! touched by its own thread; the map shard lock is the only synchronization.

use crate::record::CallEvent;
use dashmap::DashMap;
use tracing::warn;

#[derive(Debug, Default)]
struct ThreadStack {
    depth: u32,
    pending: Vec<CallEvent>,
}

/// Result of a call exit
#[derive(Debug, PartialEq)]
pub enum ExitOutcome {
    /// Still nested inside an outer call
    Pending,
    /// Outermost call returned; events in entry order
    Flush(Vec<CallEvent>),
    /// No matching enter on this thread
    Unmatched,
}

/// Concurrent map of per-thread call stacks
#[derive(Debug, Default)]
pub struct CallStitcher {
    stacks: DashMap<u64, ThreadStack>,
}

impl CallStitcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call entry, returning the depth assigned to it
    ///
    /// # Example
    /// ```
    /// use iorecorder::record::CallEvent;
    /// use iorecorder::stitcher::{CallStitcher, ExitOutcome};
    ///
    /// let stitcher = CallStitcher::new();
    /// assert_eq!(stitcher.on_call_enter(CallEvent::with_args(1, 0, ["f"], 0.0)), 0);
    /// assert_eq!(stitcher.on_call_enter(CallEvent::with_args(1, 1, ["3"], 0.1)), 1);
    ///
    /// assert_eq!(stitcher.on_call_exit(1, 0.2, None), ExitOutcome::Pending);
    /// match stitcher.on_call_exit(1, 0.3, None) {
    ///     ExitOutcome::Flush(events) => assert_eq!(events.len(), 2),
    ///     other => panic!("unexpected {:?}", other),
    /// }
    /// ```
    pub fn on_call_enter(&self, mut event: CallEvent) -> u8 {
        let mut stack = self.stacks.entry(event.thread_id).or_default();
        let depth = u8::try_from(stack.depth).unwrap_or(u8::MAX);
        event.depth = depth;
        stack.depth = stack.depth.saturating_add(1);
        stack.pending.push(event);
        depth
    }

    /// Register a call exit on `thread_id`
    ///
    /// The completed event is the most recent pending one at the depth being
    /// left; its end time and return value are filled in before the flush
    /// check.
    pub fn on_call_exit(&self, thread_id: u64, tend: f64, return_value: Option<String>) -> ExitOutcome {
        let Some(mut stack) = self.stacks.get_mut(&thread_id) else {
            warn!("call exit on thread {} without a matching enter", thread_id);
            return ExitOutcome::Unmatched;
        };
        if stack.depth == 0 {
            warn!("call exit on thread {} without a matching enter", thread_id);
            return ExitOutcome::Unmatched;
        }

        stack.depth -= 1;
        let leaving = u8::try_from(stack.depth).unwrap_or(u8::MAX);
        if let Some(event) = stack.pending.iter_mut().rev().find(|e| e.depth == leaving) {
            event.tend = tend;
            event.return_value = return_value;
        }

        if stack.depth == 0 {
            ExitOutcome::Flush(std::mem::take(&mut stack.pending))
        } else {
            ExitOutcome::Pending
        }
    }

    /// Current depth of `thread_id`
    pub fn depth(&self, thread_id: u64) -> u32 {
        self.stacks.get(&thread_id).map(|s| s.depth).unwrap_or(0)
    }

    /// Events entered but not yet released, across all threads
    pub fn in_flight(&self) -> usize {
        self.stacks.iter().map(|s| s.pending.len()).sum()
    }

    pub fn threads(&self) -> usize {
        self.stacks.len()
    }
}
