// src/scheduler.rs
//! Frame-indexed asynchronous collision query scheduler.
//!
//! Lifecycle of a query submitted during frame `N`:
//!
//! 1. `submit_*` copies it into frame `N`'s buffer and returns a [`TraceHandle`].
//!    Every time a chunk of [`CHUNK_CAPACITY`] queries fills, it is executed
//!    on the worker pool immediately.
//! 2. [`AsyncTraceScheduler::finish_frame`] dispatches the trailing partial
//!    chunk, closes the buffer and starts frame `N + 1`.
//! 3. [`AsyncTraceScheduler::harvest_previous_frame`] waits for frame `N`'s
//!    tasks, runs its delegates on the calling thread and makes its results
//!    readable.
//! 4. Results stay readable for the whole of frame `N + 1`, then the buffer is
//!    recycled for frame `N + 2`.
//!
//! All methods are meant to be called from one driver thread.
//!
//! [`CHUNK_CAPACITY`]: crate::buffer::CHUNK_CAPACITY

use crate::buffer::{AsyncTraceData, BufferPhase};
use crate::config::AsyncTraceConfig;
use crate::datum::{
    OverlapDatum, OverlapDelegate, OverlapRequest, QueryKind, TraceDatum, TraceDelegate, TraceHandle, TraceRequest,
};
use crate::dispatch::{AsyncTraceMetrics, AsyncTraceStats, TraceDispatcher};
use crate::state::WorldAsyncTraceState;
use crate::{Error, Result};
use log::{debug, error, info};
use std::sync::Arc;
use tracing::debug_span;

pub struct AsyncTraceScheduler {
    state: WorldAsyncTraceState,
    dispatcher: TraceDispatcher,
    metrics: Arc<AsyncTraceMetrics>,
    shut_down: bool,
}

impl AsyncTraceScheduler {
    pub fn new(config: AsyncTraceConfig) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(AsyncTraceMetrics::default());
        let dispatcher = TraceDispatcher::new(&config, Arc::clone(&metrics))
            .map_err(|e| e.context("starting async trace scheduler"))?;
        info!(
            "async trace scheduler ready ({})",
            if dispatcher.is_threaded() { "worker pool" } else { "inline" }
        );
        Ok(Self {
            state: WorldAsyncTraceState::new(),
            dispatcher,
            metrics,
            shut_down: false,
        })
    }

    #[inline]
    pub fn current_frame(&self) -> u32 {
        self.state.current_frame()
    }

    #[inline]
    pub fn previous_frame(&self) -> Option<u32> {
        self.state.previous_frame()
    }

    #[inline]
    pub fn state(&self) -> &WorldAsyncTraceState {
        &self.state
    }

    #[inline]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn stats(&self) -> AsyncTraceStats {
        self.metrics.snapshot()
    }

    pub fn metrics(&self) -> Arc<AsyncTraceMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Tasks of either buffer still running.
    pub fn outstanding_tasks(&mut self) -> usize {
        self.state.buffers_mut().map(|b| b.outstanding_tasks()).sum()
    }

    // ------------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------------

    /// Queues a trace or sweep into the current frame.
    pub fn submit_trace(&mut self, request: TraceRequest, delegate: Option<TraceDelegate>) -> Result<TraceHandle> {
        let frame = self.state.current_frame();
        let buffer = self.state.current_buffer_mut();
        let index = buffer
            .append_trace(request.into_datum(frame), delegate)
            .map_err(|e| Self::reject(&self.metrics, QueryKind::Trace, e))?;

        AsyncTraceMetrics::bump(&self.metrics.submitted_traces);
        buffer.execute_if_available(QueryKind::Trace, false, &self.dispatcher);
        Ok(TraceHandle::new(frame, index))
    }

    /// Queues an overlap into the current frame.
    pub fn submit_overlap(
        &mut self,
        request: OverlapRequest,
        delegate: Option<OverlapDelegate>,
    ) -> Result<TraceHandle> {
        let frame = self.state.current_frame();
        let buffer = self.state.current_buffer_mut();
        let index = buffer
            .append_overlap(request.into_datum(frame), delegate)
            .map_err(|e| Self::reject(&self.metrics, QueryKind::Overlap, e))?;

        AsyncTraceMetrics::bump(&self.metrics.submitted_overlaps);
        buffer.execute_if_available(QueryKind::Overlap, false, &self.dispatcher);
        Ok(TraceHandle::new(frame, index))
    }

    fn reject(metrics: &AsyncTraceMetrics, kind: QueryKind, err: Error) -> Error {
        AsyncTraceMetrics::bump(&metrics.rejected_submissions);
        error!("dropping async {kind} query: {err}");
        err
    }

    // ------------------------------------------------------------------------
    // Results
    // ------------------------------------------------------------------------

    /// True while the handle addresses a queued query of the given kind in
    /// the current or previous frame.
    pub fn is_valid(&self, handle: TraceHandle, is_overlap: bool) -> bool {
        let kind = if is_overlap {
            QueryKind::Overlap
        } else {
            QueryKind::Trace
        };
        self.window_buffer(handle.frame_number)
            .map_or(false, |b| (handle.index as usize) < b.len(kind))
    }

    pub fn try_get_trace_result(&self, handle: TraceHandle) -> Result<TraceDatum> {
        let buffer = self.readable_buffer(handle, QueryKind::Trace)?;
        buffer
            .trace_datum(handle.index)
            .ok_or(Error::InvalidHandle {
                handle,
                kind: QueryKind::Trace,
            })
    }

    pub fn try_get_overlap_result(&self, handle: TraceHandle) -> Result<OverlapDatum> {
        let buffer = self.readable_buffer(handle, QueryKind::Overlap)?;
        buffer
            .overlap_datum(handle.index)
            .ok_or(Error::InvalidHandle {
                handle,
                kind: QueryKind::Overlap,
            })
    }

    /// Buffer of the current or previous frame, if `frame` is one of them.
    fn window_buffer(&self, frame: u32) -> Option<&AsyncTraceData> {
        if frame == self.state.current_frame() {
            Some(self.state.current_buffer())
        } else if self.state.previous_frame() == Some(frame) {
            self.state.previous_buffer()
        } else {
            None
        }
    }

    fn readable_buffer(&self, handle: TraceHandle, kind: QueryKind) -> Result<&AsyncTraceData> {
        let buffer = self.window_buffer(handle.frame_number).ok_or(Error::HandleExpired {
            handle,
            current_frame: self.state.current_frame(),
        })?;
        if handle.index as usize >= buffer.len(kind) {
            return Err(Error::InvalidHandle { handle, kind });
        }
        if handle.frame_number == self.state.current_frame() || buffer.phase() != BufferPhase::Harvested {
            return Err(Error::ResultNotReady { handle });
        }
        Ok(buffer)
    }

    // ------------------------------------------------------------------------
    // Frame boundary
    // ------------------------------------------------------------------------

    /// End of tick: flush and close the current frame, then advance.
    ///
    /// If last frame was never harvested it is harvested here first, since
    /// its buffer is the one being recycled.
    pub fn finish_frame(&mut self) {
        if self.shut_down {
            return;
        }
        let frame = self.state.current_frame();
        let _span = debug_span!("async_trace.finish_frame", frame).entered();

        self.harvest_previous_frame();

        let buffer = self.state.current_buffer_mut();
        let (traces, overlaps) = (buffer.len(QueryKind::Trace), buffer.len(QueryKind::Overlap));
        let flushed = buffer.flush_and_close(&self.dispatcher);
        self.state.advance();

        debug!("frame {frame} closed with {traces} traces, {overlaps} overlaps ({flushed} trailing tasks)");
    }

    /// Start of tick: wait for last frame's tasks and fire its delegates.
    /// Returns the number of delegates fired; repeated calls do nothing.
    pub fn harvest_previous_frame(&mut self) -> usize {
        if self.shut_down {
            return 0;
        }
        let metrics = &self.metrics;
        let Some(buffer) = self.state.previous_buffer_mut() else {
            return 0;
        };
        if buffer.phase() != BufferPhase::Closed {
            return 0;
        }
        let _span = debug_span!("async_trace.harvest", frame = buffer.frame_number()).entered();
        buffer.harvest(metrics)
    }

    /// One full frame boundary: [`finish_frame`](Self::finish_frame) then
    /// [`harvest_previous_frame`](Self::harvest_previous_frame).
    pub fn drive_frame_boundary(&mut self) {
        self.finish_frame();
        self.harvest_previous_frame();
    }

    /// Blocks until every dispatched task has finished. Delegates are not run.
    pub fn wait_for_all_tasks(&mut self) {
        for buffer in self.state.buffers_mut() {
            buffer.wait_for_tasks();
        }
    }

    /// Waits for outstanding work, drops undelivered delegates and refuses
    /// further submissions.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.wait_for_all_tasks();
        let mut discarded = 0;
        for buffer in self.state.buffers_mut() {
            discarded += buffer.discard_delegates();
        }
        self.state.current_buffer_mut().close();
        self.shut_down = true;
        info!("async trace scheduler shut down ({discarded} delegates discarded)");
    }
}

impl Drop for AsyncTraceScheduler {
    fn drop(&mut self) {
        self.wait_for_all_tasks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::RecordingBackend;
    use crate::backend::{CollisionBackend, WorldRef};
    use crate::buffer::CHUNK_CAPACITY;
    use crate::collision::{CollisionChannel, CollisionParameters, CollisionShape};
    use crate::datum::TraceType;
    use glam::Vec3;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn setup() -> (AsyncTraceScheduler, Arc<RecordingBackend>, WorldRef) {
        init_logger();
        let config = AsyncTraceConfig {
            worker_threads: 2,
            ..AsyncTraceConfig::default()
        };
        let scheduler = AsyncTraceScheduler::new(config).unwrap();
        let backend = Arc::new(RecordingBackend::new());
        let dyn_backend: Arc<dyn CollisionBackend> = backend.clone();
        let world = Arc::downgrade(&dyn_backend);
        (scheduler, backend, world)
    }

    fn line(world: &WorldRef, x: f32) -> TraceRequest {
        TraceRequest::line(
            world.clone(),
            TraceType::Single,
            Vec3::new(x, 0.0, 0.0),
            Vec3::new(x, 0.0, -50.0),
            CollisionChannel::Visibility,
            CollisionParameters::default(),
        )
    }

    fn overlap(world: &WorldRef) -> OverlapRequest {
        OverlapRequest::new(
            world.clone(),
            CollisionShape::make_sphere(2.0),
            Vec3::ZERO,
            CollisionChannel::Pawn,
            CollisionParameters::default(),
        )
    }

    #[test]
    fn test_indices_are_monotonic_per_kind() {
        let (mut scheduler, _backend, world) = setup();

        for expected in 0..3 {
            let handle = scheduler.submit_trace(line(&world, 0.0), None).unwrap();
            assert_eq!(handle, TraceHandle::new(0, expected));
        }
        for expected in 0..2 {
            let handle = scheduler.submit_overlap(overlap(&world), None).unwrap();
            assert_eq!(handle, TraceHandle::new(0, expected));
        }

        scheduler.drive_frame_boundary();
        let handle = scheduler.submit_trace(line(&world, 0.0), None).unwrap();
        assert_eq!(handle, TraceHandle::new(1, 0));
    }

    #[test]
    fn test_two_frame_validity_window() {
        let (mut scheduler, _backend, world) = setup();
        let handle = scheduler.submit_trace(line(&world, 0.0), None).unwrap();

        assert!(scheduler.is_valid(handle, false));
        assert!(!scheduler.is_valid(handle, true));
        assert!(!scheduler.is_valid(TraceHandle::new(0, 1), false));

        scheduler.drive_frame_boundary();
        assert!(scheduler.is_valid(handle, false));

        scheduler.drive_frame_boundary();
        assert!(!scheduler.is_valid(handle, false));
        assert!(!scheduler.is_valid(TraceHandle::INVALID, false));
    }

    #[test]
    fn test_results_only_readable_next_frame() {
        let (mut scheduler, _backend, world) = setup();
        let handle = scheduler.submit_trace(line(&world, 1.0), None).unwrap();

        let err = scheduler.try_get_trace_result(handle).unwrap_err();
        assert!(matches!(err, Error::ResultNotReady { .. }));

        scheduler.drive_frame_boundary();
        let datum = scheduler.try_get_trace_result(handle).unwrap();
        assert!(datum.has_blocking_hit());
        assert_eq!(datum.frame_number, 0);
        assert_eq!(datum.start, Vec3::new(1.0, 0.0, 0.0));

        scheduler.drive_frame_boundary();
        let err = scheduler.try_get_trace_result(handle).unwrap_err();
        assert!(matches!(err, Error::HandleExpired { current_frame: 2, .. }));
    }

    #[test]
    fn test_split_boundary_defers_results_until_harvest() {
        let (mut scheduler, _backend, world) = setup();
        let handle = scheduler.submit_overlap(overlap(&world), None).unwrap();

        scheduler.finish_frame();
        assert_eq!(scheduler.current_frame(), 1);
        assert!(scheduler.try_get_overlap_result(handle).unwrap_err().is_not_ready());

        scheduler.harvest_previous_frame();
        let datum = scheduler.try_get_overlap_result(handle).unwrap();
        assert_eq!(datum.out_overlaps.len(), 1);
        assert_eq!(scheduler.harvest_previous_frame(), 0);
    }

    #[test]
    fn test_unharvested_frame_is_harvested_before_recycling() {
        let (mut scheduler, _backend, world) = setup();
        let fired = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&fired);
        scheduler
            .submit_trace(
                line(&world, 0.0),
                Some(Box::new(move |_: &TraceHandle, _: &TraceDatum| *counter.borrow_mut() += 1)),
            )
            .unwrap();

        scheduler.finish_frame();
        scheduler.finish_frame();
        assert_eq!(*fired.borrow(), 1);
    }

    #[test]
    fn test_bad_handles() {
        let (mut scheduler, _backend, world) = setup();
        scheduler.submit_trace(line(&world, 0.0), None).unwrap();

        // nothing has completed yet
        let err = scheduler.try_get_trace_result(TraceHandle::new(u32::MAX, 0)).unwrap_err();
        assert!(err.is_expired());

        let err = scheduler.try_get_trace_result(TraceHandle::new(0, 5)).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidHandle {
                kind: QueryKind::Trace,
                ..
            }
        ));

        scheduler.drive_frame_boundary();
        let err = scheduler.try_get_overlap_result(TraceHandle::new(0, 0)).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidHandle {
                kind: QueryKind::Overlap,
                ..
            }
        ));
        assert!(scheduler.try_get_trace_result(TraceHandle::new(7, 0)).unwrap_err().is_expired());
    }

    #[test]
    fn test_chunk_triggered_dispatch() {
        let (mut scheduler, _backend, world) = setup();

        for i in 0..CHUNK_CAPACITY {
            scheduler.submit_trace(line(&world, i as f32), None).unwrap();
        }
        assert_eq!(scheduler.stats().dispatched_tasks, 1);
        scheduler.drive_frame_boundary();
        assert_eq!(scheduler.stats().dispatched_tasks, 1);

        for i in 0..=CHUNK_CAPACITY {
            scheduler.submit_trace(line(&world, i as f32), None).unwrap();
        }
        assert_eq!(scheduler.stats().dispatched_tasks, 2);
        scheduler.drive_frame_boundary();
        assert_eq!(scheduler.stats().dispatched_tasks, 3);
    }

    #[test]
    fn test_empty_frames_dispatch_nothing() {
        let (mut scheduler, backend, _world) = setup();
        for _ in 0..4 {
            scheduler.drive_frame_boundary();
        }
        assert_eq!(scheduler.current_frame(), 4);
        assert_eq!(scheduler.stats().dispatched_tasks, 0);
        assert_eq!(backend.call_count(), 0);
    }

    #[test]
    fn test_callbacks_fire_once_on_driver_thread_in_order() {
        let (mut scheduler, _backend, world) = setup();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let n = CHUNK_CAPACITY + 10;

        let log = Rc::clone(&seen);
        scheduler
            .submit_overlap(
                overlap(&world),
                Some(Box::new(move |h: &TraceHandle, _: &OverlapDatum| {
                    log.borrow_mut()
                        .push((QueryKind::Overlap, h.index, std::thread::current().id()));
                })),
            )
            .unwrap();
        for i in 0..n {
            let log = Rc::clone(&seen);
            scheduler
                .submit_trace(
                    line(&world, i as f32),
                    Some(Box::new(move |h: &TraceHandle, d: &TraceDatum| {
                        assert_eq!(d.start.x, h.index as f32);
                        log.borrow_mut()
                            .push((QueryKind::Trace, h.index, std::thread::current().id()));
                    })),
                )
                .unwrap();
        }
        assert!(seen.borrow().is_empty());

        scheduler.drive_frame_boundary();
        scheduler.drive_frame_boundary();

        let seen = seen.borrow();
        assert_eq!(seen.len(), n + 1);
        let main = std::thread::current().id();
        assert!(seen.iter().all(|(_, _, thread)| *thread == main));
        for (i, (kind, index, _)) in seen[..n].iter().enumerate() {
            assert_eq!(*kind, QueryKind::Trace);
            assert_eq!(*index as usize, i);
        }
        assert_eq!(seen[n].0, QueryKind::Overlap);
        assert_eq!(scheduler.stats().delegates_fired, n + 1);
    }

    #[test]
    fn test_stale_world_completes_empty() {
        let (mut scheduler, backend, world) = setup();
        let fired = Rc::new(RefCell::new(false));
        let flag = Rc::clone(&fired);
        let handle = scheduler
            .submit_trace(
                line(&world, 0.0),
                Some(Box::new(move |_: &TraceHandle, d: &TraceDatum| {
                    assert!(d.out_hits.is_empty());
                    *flag.borrow_mut() = true;
                })),
            )
            .unwrap();

        drop(backend);
        scheduler.drive_frame_boundary();

        assert!(*fired.borrow());
        assert!(scheduler.try_get_trace_result(handle).unwrap().out_hits.is_empty());
        assert_eq!(scheduler.stats().stale_world_skips, 1);
    }

    #[test]
    fn test_degenerate_shape_matches_line_trace() {
        let (mut scheduler, backend, world) = setup();
        let ray = scheduler.submit_trace(line(&world, 3.0), None).unwrap();
        let mut request = line(&world, 3.0);
        request.shape = CollisionShape::make_capsule(1.0e-6, 1.0e-6);
        let degenerate = scheduler.submit_trace(request, None).unwrap();

        scheduler.drive_frame_boundary();

        let ray = scheduler.try_get_trace_result(ray).unwrap();
        let degenerate = scheduler.try_get_trace_result(degenerate).unwrap();
        assert_eq!(ray.out_hits, degenerate.out_hits);
        assert_eq!(backend.call_count(), 2);
    }

    #[test]
    fn test_sixty_five_queries_in_frame_five() {
        let (mut scheduler, _backend, world) = setup();
        for _ in 0..5 {
            scheduler.drive_frame_boundary();
        }
        assert_eq!(scheduler.current_frame(), 5);

        let fired = Rc::new(RefCell::new(0usize));
        let handles: Vec<_> = (0..65)
            .map(|i| {
                let counter = Rc::clone(&fired);
                scheduler
                    .submit_trace(
                        line(&world, i as f32),
                        Some(Box::new(move |_: &TraceHandle, _: &TraceDatum| *counter.borrow_mut() += 1)),
                    )
                    .unwrap()
            })
            .collect();
        assert_eq!(handles[64], TraceHandle::new(5, 64));
        assert_eq!(scheduler.stats().dispatched_tasks, 1);

        scheduler.drive_frame_boundary();
        assert_eq!(scheduler.stats().dispatched_tasks, 2);
        assert_eq!(scheduler.current_frame(), 6);
        assert_eq!(*fired.borrow(), 65);
        for (i, handle) in handles.iter().enumerate() {
            let datum = scheduler.try_get_trace_result(*handle).unwrap();
            assert_eq!(datum.start.x, i as f32);
            assert!(datum.has_blocking_hit());
        }

        let next = scheduler.submit_trace(line(&world, 0.0), None).unwrap();
        assert_eq!(next, TraceHandle::new(6, 0));
    }

    #[test]
    fn test_submit_after_shutdown_is_rejected() {
        let (mut scheduler, _backend, world) = setup();
        let fired = Rc::new(RefCell::new(false));
        let flag = Rc::clone(&fired);
        scheduler
            .submit_trace(
                line(&world, 0.0),
                Some(Box::new(move |_: &TraceHandle, _: &TraceDatum| *flag.borrow_mut() = true)),
            )
            .unwrap();

        scheduler.shutdown();
        assert!(scheduler.is_shut_down());

        let err = scheduler.submit_trace(line(&world, 0.0), None).unwrap_err();
        assert!(err.is_closed());
        assert!(scheduler.submit_overlap(overlap(&world), None).is_err());
        assert_eq!(scheduler.stats().rejected_submissions, 2);

        scheduler.drive_frame_boundary();
        assert_eq!(scheduler.current_frame(), 0);
        assert!(!*fired.borrow());
    }

    #[test]
    fn test_inline_mode_runs_on_submitting_thread() {
        init_logger();
        let mut scheduler = AsyncTraceScheduler::new(AsyncTraceConfig::synchronous()).unwrap();
        let backend = Arc::new(RecordingBackend::new());
        let dyn_backend: Arc<dyn CollisionBackend> = backend.clone();
        let world = Arc::downgrade(&dyn_backend);

        for i in 0..CHUNK_CAPACITY {
            scheduler.submit_trace(line(&world, i as f32), None).unwrap();
        }
        // the full chunk ran during the last submit
        assert_eq!(backend.call_count(), CHUNK_CAPACITY);
        let main = std::thread::current().id();
        assert!(backend.calls().iter().all(|c| c.thread == main));
        assert_eq!(scheduler.outstanding_tasks(), 0);
    }

    #[test]
    fn test_wait_for_all_tasks_does_not_fire_delegates() {
        let (mut scheduler, backend, world) = setup();
        let fired = Rc::new(RefCell::new(false));
        for i in 0..CHUNK_CAPACITY {
            let flag = Rc::clone(&fired);
            scheduler
                .submit_trace(
                    line(&world, i as f32),
                    Some(Box::new(move |_: &TraceHandle, _: &TraceDatum| *flag.borrow_mut() = true)),
                )
                .unwrap();
        }

        scheduler.wait_for_all_tasks();
        assert_eq!(backend.call_count(), CHUNK_CAPACITY);
        assert_eq!(scheduler.outstanding_tasks(), 0);
        assert!(!*fired.borrow());
    }
}
