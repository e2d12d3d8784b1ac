//! Per-frame query buffer.
//!
//! Queries are appended into fixed-capacity chunks that are allocated on
//! demand and kept across frames. A chunk is handed to a worker the moment
//! it fills; the trailing partial chunk goes out when the frame is flushed.

use crate::datum::{
    Delegate, OverlapDatum, OverlapDelegate, QueryDatum, QueryKind, TraceDatum, TraceDelegate, TraceHandle,
};
use crate::dispatch::{AsyncTraceMetrics, Chunk, TaskToken, TraceDispatcher};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::ops::Range;
use std::sync::Arc;

/// Datums per chunk, and so per worker task.
pub const CHUNK_CAPACITY: usize = 64;

/// True when the datum at `index` was the last slot of its chunk, which is
/// the only time an unforced dispatch has work to hand out.
#[inline]
pub(crate) fn chunk_just_filled(index: usize) -> bool {
    (index + 1) % CHUNK_CAPACITY == 0
}

/// Lifecycle of one frame's buffer. Only `Open` accepts submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferPhase {
    Open,
    /// Trailing chunks are being dispatched.
    Flushing,
    /// Everything is dispatched; results pending.
    Closed,
    /// Tasks finished and delegates fired; results readable.
    Harvested,
}

// ============================================================================
// 1. DATUM QUEUE (one per query kind)
// ============================================================================

pub(crate) struct DatumQueue<D> {
    chunks: Vec<Chunk<D>>,
    count: usize,
    /// Chunks `0..dispatched` have been handed to a task.
    dispatched: usize,
    /// Ascending by index.
    delegates: Vec<(u32, Delegate<D>)>,
}

impl<D: QueryDatum> DatumQueue<D> {
    fn new() -> Self {
        Self {
            chunks: Vec::new(),
            count: 0,
            dispatched: 0,
            delegates: Vec::new(),
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub(crate) fn allocated_chunks(&self) -> usize {
        self.chunks.len()
    }

    fn push(&mut self, datum: D, delegate: Option<Delegate<D>>) -> u32 {
        let index = self.count;
        let chunk_index = index / CHUNK_CAPACITY;
        if chunk_index == self.chunks.len() {
            self.chunks
                .push(Arc::new(Mutex::new(Vec::with_capacity(CHUNK_CAPACITY))));
        }
        // Not yet dispatched, so no task holds this lock.
        self.chunks[chunk_index].lock().push(datum);
        self.count += 1;

        let index = index as u32;
        if let Some(delegate) = delegate {
            self.delegates.push((index, delegate));
        }
        index
    }

    /// Chunks that may be dispatched now and have not been yet.
    fn ready_chunks(&self, force_all: bool) -> Range<usize> {
        let full = self.count / CHUNK_CAPACITY;
        let end = if force_all && self.count % CHUNK_CAPACITY != 0 {
            full + 1
        } else {
            full
        };
        self.dispatched..end.max(self.dispatched)
    }

    fn dispatch_ready(
        &mut self,
        force_all: bool,
        dispatcher: &TraceDispatcher,
        frame: u32,
        tokens: &mut Vec<TaskToken>,
    ) -> usize {
        if !force_all && (self.count == 0 || !chunk_just_filled(self.count - 1)) {
            return 0;
        }
        let ready = self.ready_chunks(force_all);
        let dispatched = ready.len();
        for chunk_index in ready {
            let chunk = Arc::clone(&self.chunks[chunk_index]);
            tokens.push(dispatcher.dispatch(chunk, frame, chunk_index));
        }
        self.dispatched += dispatched;
        dispatched
    }

    fn with_datum<R>(&self, index: u32, f: impl FnOnce(&D) -> R) -> Option<R> {
        let index = index as usize;
        if index >= self.count {
            return None;
        }
        let chunk = self.chunks[index / CHUNK_CAPACITY].lock();
        chunk.get(index % CHUNK_CAPACITY).map(f)
    }

    /// Runs and drops every delegate. Caller guarantees all tasks are done.
    fn fire_delegates(&mut self, frame: u32) -> usize {
        let delegates = std::mem::take(&mut self.delegates);
        let fired = delegates.len();
        for (index, delegate) in delegates {
            let i = index as usize;
            let chunk = self.chunks[i / CHUNK_CAPACITY].lock();
            if let Some(datum) = chunk.get(i % CHUNK_CAPACITY) {
                delegate(&TraceHandle::new(frame, index), datum);
            }
        }
        fired
    }

    /// Empties the queue but keeps chunk allocations.
    fn reset(&mut self) {
        for chunk in &self.chunks {
            chunk.lock().clear();
        }
        self.count = 0;
        self.dispatched = 0;
        self.delegates.clear();
    }
}

// ============================================================================
// 2. PER-FRAME BUFFER
// ============================================================================

/// Everything queued during one frame.
pub struct AsyncTraceData {
    frame_number: u32,
    phase: BufferPhase,
    traces: DatumQueue<TraceDatum>,
    overlaps: DatumQueue<OverlapDatum>,
    tokens: Vec<TaskToken>,
}

impl AsyncTraceData {
    pub(crate) fn new(frame_number: u32, phase: BufferPhase) -> Self {
        Self {
            frame_number,
            phase,
            traces: DatumQueue::new(),
            overlaps: DatumQueue::new(),
            tokens: Vec::new(),
        }
    }

    #[inline]
    pub fn frame_number(&self) -> u32 {
        self.frame_number
    }

    #[inline]
    pub fn phase(&self) -> BufferPhase {
        self.phase
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.phase == BufferPhase::Open
    }

    /// Queued count of one kind.
    pub fn len(&self, kind: QueryKind) -> usize {
        match kind {
            QueryKind::Trace => self.traces.len(),
            QueryKind::Overlap => self.overlaps.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.traces.len() == 0 && self.overlaps.len() == 0
    }

    pub fn allocated_chunks(&self, kind: QueryKind) -> usize {
        match kind {
            QueryKind::Trace => self.traces.allocated_chunks(),
            QueryKind::Overlap => self.overlaps.allocated_chunks(),
        }
    }

    /// Tasks dispatched for this frame and not yet waited on.
    pub(crate) fn outstanding_tasks(&mut self) -> usize {
        self.tokens.iter_mut().map(|t| t.is_complete()).filter(|done| !done).count()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::SchedulerClosed {
                frame: self.frame_number,
            })
        }
    }

    pub(crate) fn append_trace(&mut self, datum: TraceDatum, delegate: Option<TraceDelegate>) -> Result<u32> {
        self.ensure_open()?;
        Ok(self.traces.push(datum, delegate))
    }

    pub(crate) fn append_overlap(&mut self, datum: OverlapDatum, delegate: Option<OverlapDelegate>) -> Result<u32> {
        self.ensure_open()?;
        Ok(self.overlaps.push(datum, delegate))
    }

    /// Dispatches every chunk of `kind` that just filled, plus the trailing
    /// partial chunk when `force_all`. Returns the number of tasks started.
    pub(crate) fn execute_if_available(
        &mut self,
        kind: QueryKind,
        force_all: bool,
        dispatcher: &TraceDispatcher,
    ) -> usize {
        let frame = self.frame_number;
        match kind {
            QueryKind::Trace => self
                .traces
                .dispatch_ready(force_all, dispatcher, frame, &mut self.tokens),
            QueryKind::Overlap => self
                .overlaps
                .dispatch_ready(force_all, dispatcher, frame, &mut self.tokens),
        }
    }

    /// Open -> Flushing -> (trailing chunks dispatched) -> Closed.
    pub(crate) fn flush_and_close(&mut self, dispatcher: &TraceDispatcher) -> usize {
        self.phase = BufferPhase::Flushing;
        let dispatched = self.execute_if_available(QueryKind::Trace, true, dispatcher)
            + self.execute_if_available(QueryKind::Overlap, true, dispatcher);
        self.close();
        dispatched
    }

    #[inline]
    pub(crate) fn close(&mut self) {
        self.phase = BufferPhase::Closed;
    }

    /// Blocks until every dispatched task of this frame has finished.
    pub(crate) fn wait_for_tasks(&mut self) {
        for token in &mut self.tokens {
            token.wait();
        }
        self.tokens.clear();
    }

    /// Waits, fires trace delegates then overlap delegates, marks harvested.
    pub(crate) fn harvest(&mut self, metrics: &AsyncTraceMetrics) -> usize {
        self.wait_for_tasks();
        let fired = self.traces.fire_delegates(self.frame_number)
            + self.overlaps.fire_delegates(self.frame_number);
        metrics.delegates_fired.fetch_add(fired, std::sync::atomic::Ordering::Relaxed);
        self.phase = BufferPhase::Harvested;
        fired
    }

    /// Drops pending delegates without calling them.
    pub(crate) fn discard_delegates(&mut self) -> usize {
        let discarded = self.traces.delegates.len() + self.overlaps.delegates.len();
        self.traces.delegates.clear();
        self.overlaps.delegates.clear();
        discarded
    }

    /// Recycles the buffer for `frame_number`.
    pub(crate) fn reset(&mut self, frame_number: u32) {
        self.wait_for_tasks();
        self.traces.reset();
        self.overlaps.reset();
        self.frame_number = frame_number;
        self.phase = BufferPhase::Open;
    }

    pub(crate) fn trace_datum(&self, index: u32) -> Option<TraceDatum> {
        self.traces.with_datum(index, TraceDatum::clone)
    }

    pub(crate) fn overlap_datum(&self, index: u32) -> Option<OverlapDatum> {
        self.overlaps.with_datum(index, OverlapDatum::clone)
    }
}
