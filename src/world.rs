// src/world.rs
//! World-level async trace API.
//!
//! [`World`] owns a collision backend and an [`AsyncTraceScheduler`] and
//! exposes the familiar per-world entry points. A typical frame:
//!
//! ```ignore
//! world.tick(|world| {
//!     // results and delegates from last frame are available here
//!     let handle = world.async_line_trace_by_channel(TraceType::Single, start, end,
//!         CollisionChannel::Visibility, &query, &response, None, 0)?;
//!     Ok(())
//! })?;
//! ```

use crate::backend::{CollisionBackend, WorldRef};
use crate::collision::{
    CollisionChannel, CollisionObjectQueryParams, CollisionParameters, CollisionQueryParams, CollisionResponseParams,
    CollisionShape,
};
use crate::config::AsyncTraceConfig;
use crate::datum::{
    OverlapDatum, OverlapDelegate, OverlapRequest, TraceDatum, TraceDelegate, TraceHandle, TraceRequest, TraceType,
};
use crate::dispatch::AsyncTraceStats;
use crate::scheduler::AsyncTraceScheduler;
use crate::Result;
use glam::{Quat, Vec3};
use std::sync::Arc;

pub struct World<B: CollisionBackend + 'static> {
    // Dropped first: waits for in-flight tasks while the backend is still alive.
    scheduler: AsyncTraceScheduler,
    backend: Arc<B>,
}

impl<B: CollisionBackend + 'static> World<B> {
    pub fn new(backend: Arc<B>, config: AsyncTraceConfig) -> Result<Self> {
        Ok(Self {
            scheduler: AsyncTraceScheduler::new(config)?,
            backend,
        })
    }

    #[inline]
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    #[inline]
    pub fn scheduler(&self) -> &AsyncTraceScheduler {
        &self.scheduler
    }

    #[inline]
    pub fn scheduler_mut(&mut self) -> &mut AsyncTraceScheduler {
        &mut self.scheduler
    }

    #[inline]
    pub fn frame_number(&self) -> u32 {
        self.scheduler.current_frame()
    }

    pub fn stats(&self) -> AsyncTraceStats {
        self.scheduler.stats()
    }

    /// Weak reference handed to every queued query.
    pub fn world_ref(&self) -> WorldRef {
        let backend: Arc<dyn CollisionBackend> = self.backend.clone();
        Arc::downgrade(&backend)
    }

    // ------------------------------------------------------------------------
    // Traces
    // ------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn async_line_trace_by_channel(
        &mut self,
        trace_type: TraceType,
        start: Vec3,
        end: Vec3,
        channel: CollisionChannel,
        query: &CollisionQueryParams,
        response: &CollisionResponseParams,
        delegate: Option<TraceDelegate>,
        user_data: u32,
    ) -> Result<TraceHandle> {
        let params = CollisionParameters::by_channel(query.clone(), *response);
        let request =
            TraceRequest::line(self.world_ref(), trace_type, start, end, channel, params).with_user_data(user_data);
        self.scheduler.submit_trace(request, delegate)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn async_line_trace_by_object_type(
        &mut self,
        trace_type: TraceType,
        start: Vec3,
        end: Vec3,
        objects: &CollisionObjectQueryParams,
        query: &CollisionQueryParams,
        delegate: Option<TraceDelegate>,
        user_data: u32,
    ) -> Result<TraceHandle> {
        let params = CollisionParameters::by_object_type(query.clone(), *objects);
        let request = TraceRequest::line(self.world_ref(), trace_type, start, end, CollisionChannel::default(), params)
            .with_user_data(user_data);
        self.scheduler.submit_trace(request, delegate)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn async_sweep_by_channel(
        &mut self,
        trace_type: TraceType,
        start: Vec3,
        end: Vec3,
        rotation: Quat,
        channel: CollisionChannel,
        shape: &CollisionShape,
        query: &CollisionQueryParams,
        response: &CollisionResponseParams,
        delegate: Option<TraceDelegate>,
        user_data: u32,
    ) -> Result<TraceHandle> {
        let params = CollisionParameters::by_channel(query.clone(), *response);
        let request = TraceRequest::sweep(self.world_ref(), trace_type, *shape, start, end, channel, params)
            .with_rotation(rotation)
            .with_user_data(user_data);
        self.scheduler.submit_trace(request, delegate)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn async_sweep_by_object_type(
        &mut self,
        trace_type: TraceType,
        start: Vec3,
        end: Vec3,
        rotation: Quat,
        objects: &CollisionObjectQueryParams,
        shape: &CollisionShape,
        query: &CollisionQueryParams,
        delegate: Option<TraceDelegate>,
        user_data: u32,
    ) -> Result<TraceHandle> {
        let params = CollisionParameters::by_object_type(query.clone(), *objects);
        let request = TraceRequest::sweep(
            self.world_ref(),
            trace_type,
            *shape,
            start,
            end,
            CollisionChannel::default(),
            params,
        )
        .with_rotation(rotation)
        .with_user_data(user_data);
        self.scheduler.submit_trace(request, delegate)
    }

    // ------------------------------------------------------------------------
    // Overlaps
    // ------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn async_overlap_by_channel(
        &mut self,
        position: Vec3,
        rotation: Quat,
        channel: CollisionChannel,
        shape: &CollisionShape,
        query: &CollisionQueryParams,
        response: &CollisionResponseParams,
        delegate: Option<OverlapDelegate>,
        user_data: u32,
    ) -> Result<TraceHandle> {
        let params = CollisionParameters::by_channel(query.clone(), *response);
        let request = OverlapRequest::new(self.world_ref(), *shape, position, channel, params)
            .with_rotation(rotation)
            .with_user_data(user_data);
        self.scheduler.submit_overlap(request, delegate)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn async_overlap_by_object_type(
        &mut self,
        position: Vec3,
        rotation: Quat,
        objects: &CollisionObjectQueryParams,
        shape: &CollisionShape,
        query: &CollisionQueryParams,
        delegate: Option<OverlapDelegate>,
        user_data: u32,
    ) -> Result<TraceHandle> {
        let params = CollisionParameters::by_object_type(query.clone(), *objects);
        let request = OverlapRequest::new(self.world_ref(), *shape, position, CollisionChannel::default(), params)
            .with_rotation(rotation)
            .with_user_data(user_data);
        self.scheduler.submit_overlap(request, delegate)
    }

    // ------------------------------------------------------------------------
    // Results
    // ------------------------------------------------------------------------

    pub fn query_trace_data(&self, handle: TraceHandle) -> Result<TraceDatum> {
        self.scheduler.try_get_trace_result(handle)
    }

    pub fn query_overlap_data(&self, handle: TraceHandle) -> Result<OverlapDatum> {
        self.scheduler.try_get_overlap_result(handle)
    }

    pub fn is_trace_handle_valid(&self, handle: TraceHandle, is_overlap: bool) -> bool {
        self.scheduler.is_valid(handle, is_overlap)
    }

    // ------------------------------------------------------------------------
    // Tick hooks
    // ------------------------------------------------------------------------

    /// Start of tick: completes last frame and runs its delegates.
    pub fn reset_async_trace(&mut self) -> usize {
        self.scheduler.harvest_previous_frame()
    }

    /// End of tick: flushes this frame's queries and advances the frame.
    pub fn finish_async_trace(&mut self) {
        self.scheduler.finish_frame();
    }

    /// Runs one frame of gameplay between the two tick hooks.
    pub fn tick<R>(&mut self, gameplay: impl FnOnce(&mut Self) -> R) -> R {
        self.reset_async_trace();
        let result = gameplay(self);
        self.finish_async_trace();
        result
    }

    /// Waits for in-flight queries and stops accepting new ones.
    pub fn destroy(&mut self) {
        self.scheduler.shutdown();
    }
}
