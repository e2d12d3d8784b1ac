//! Query records, handles and completion delegates.
//!
//! A datum is the request a caller submitted plus the output slot a worker
//! fills. Workers only ever see datums; delegates stay with the per-frame
//! buffer on the driver thread.

use crate::backend::{CollisionBackend, WorldRef};
use crate::collision::{CollisionChannel, CollisionParameters, CollisionShape};
use crate::hit::{HitResult, OverlapResult};
use glam::{Quat, Vec3};
use std::fmt;

// ============================================================================
// 1. HANDLES & KINDS
// ============================================================================

/// Ticket identifying one submitted query: the frame it was queued in and
/// its position within that frame's list of the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceHandle {
    pub frame_number: u32,
    pub index: u32,
}

impl TraceHandle {
    /// Never issued by a scheduler.
    pub const INVALID: Self = Self {
        frame_number: u32::MAX,
        index: u32::MAX,
    };

    #[inline]
    pub const fn new(frame_number: u32, index: u32) -> Self {
        Self {
            frame_number,
            index,
        }
    }

    /// Packs the handle into one word, frame in the high half.
    #[inline]
    pub const fn to_bits(self) -> u64 {
        ((self.frame_number as u64) << 32) | self.index as u64
    }

    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self {
            frame_number: (bits >> 32) as u32,
            index: bits as u32,
        }
    }

    #[inline]
    pub fn is_invalid(&self) -> bool {
        *self == Self::INVALID
    }
}

impl Default for TraceHandle {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for TraceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame {} #{}", self.frame_number, self.index)
    }
}

/// Traces and overlaps are indexed independently within a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Trace,
    Overlap,
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Trace => "trace",
            Self::Overlap => "overlap",
        })
    }
}

/// How much a trace reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TraceType {
    /// Yes/no: at most one synthetic blocking hit.
    Test,
    /// First blocking hit.
    #[default]
    Single,
    /// Touches up to and including the first block.
    Multi,
}

/// One-shot completion callback, run on the driver thread during harvest.
pub type Delegate<D> = Box<dyn FnOnce(&TraceHandle, &D)>;
pub type TraceDelegate = Delegate<TraceDatum>;
pub type OverlapDelegate = Delegate<OverlapDatum>;

// ============================================================================
// 2. REQUESTS
// ============================================================================

/// A trace or sweep as submitted by the caller.
#[derive(Debug, Clone)]
pub struct TraceRequest {
    pub world: WorldRef,
    pub trace_type: TraceType,
    pub shape: CollisionShape,
    pub rotation: Quat,
    pub start: Vec3,
    pub end: Vec3,
    pub channel: CollisionChannel,
    pub params: CollisionParameters,
    pub user_data: u32,
}

impl TraceRequest {
    pub fn line(
        world: WorldRef,
        trace_type: TraceType,
        start: Vec3,
        end: Vec3,
        channel: CollisionChannel,
        params: CollisionParameters,
    ) -> Self {
        Self::sweep(world, trace_type, CollisionShape::Line, start, end, channel, params)
    }

    pub fn sweep(
        world: WorldRef,
        trace_type: TraceType,
        shape: CollisionShape,
        start: Vec3,
        end: Vec3,
        channel: CollisionChannel,
        params: CollisionParameters,
    ) -> Self {
        Self {
            world,
            trace_type,
            shape,
            rotation: Quat::IDENTITY,
            start,
            end,
            channel,
            params,
            user_data: 0,
        }
    }

    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_user_data(mut self, user_data: u32) -> Self {
        self.user_data = user_data;
        self
    }

    pub(crate) fn into_datum(self, frame_number: u32) -> TraceDatum {
        TraceDatum {
            world: self.world,
            trace_type: self.trace_type,
            shape: self.shape,
            rotation: self.rotation,
            start: self.start,
            end: self.end,
            channel: self.channel,
            params: self.params,
            frame_number,
            user_data: self.user_data,
            out_hits: Vec::new(),
        }
    }
}

/// An overlap as submitted by the caller.
#[derive(Debug, Clone)]
pub struct OverlapRequest {
    pub world: WorldRef,
    pub shape: CollisionShape,
    pub position: Vec3,
    pub rotation: Quat,
    pub channel: CollisionChannel,
    pub params: CollisionParameters,
    pub user_data: u32,
}

impl OverlapRequest {
    pub fn new(
        world: WorldRef,
        shape: CollisionShape,
        position: Vec3,
        channel: CollisionChannel,
        params: CollisionParameters,
    ) -> Self {
        Self {
            world,
            shape,
            position,
            rotation: Quat::IDENTITY,
            channel,
            params,
            user_data: 0,
        }
    }

    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_user_data(mut self, user_data: u32) -> Self {
        self.user_data = user_data;
        self
    }

    pub(crate) fn into_datum(self, frame_number: u32) -> OverlapDatum {
        OverlapDatum {
            world: self.world,
            shape: self.shape,
            position: self.position,
            rotation: self.rotation,
            channel: self.channel,
            params: self.params,
            frame_number,
            user_data: self.user_data,
            out_overlaps: Vec::new(),
        }
    }
}

// ============================================================================
// 3. DATUMS
// ============================================================================

/// A queued trace and, once its frame is harvested, its hits.
#[derive(Debug, Clone)]
pub struct TraceDatum {
    pub world: WorldRef,
    pub trace_type: TraceType,
    pub shape: CollisionShape,
    pub rotation: Quat,
    pub start: Vec3,
    pub end: Vec3,
    pub channel: CollisionChannel,
    pub params: CollisionParameters,
    pub frame_number: u32,
    pub user_data: u32,
    pub out_hits: Vec<HitResult>,
}

impl TraceDatum {
    #[inline]
    pub fn has_blocking_hit(&self) -> bool {
        crate::hit::has_blocking_hit(&self.out_hits)
    }

    /// First blocking hit, if any.
    pub fn blocking_hit(&self) -> Option<&HitResult> {
        self.out_hits.iter().find(|h| h.blocking_hit)
    }

    fn run(&self, backend: &dyn CollisionBackend, epsilon: f32) -> Vec<HitResult> {
        let (start, end, channel, params) = (self.start, self.end, self.channel, &self.params);
        let shape = self.shape.effective(epsilon);

        match (self.trace_type, shape.is_line()) {
            (TraceType::Test, true) => backend
                .raycast_test(start, end, channel, params)
                .then(|| HitResult::blocking_test_hit(start, end))
                .into_iter()
                .collect(),
            (TraceType::Single, true) => backend
                .raycast_single(start, end, channel, params)
                .into_iter()
                .collect(),
            (TraceType::Multi, true) => backend.raycast_multi(start, end, channel, params),
            (TraceType::Test, false) => backend
                .sweep_test(&shape, self.rotation, start, end, channel, params)
                .then(|| HitResult::blocking_test_hit(start, end))
                .into_iter()
                .collect(),
            (TraceType::Single, false) => backend
                .sweep_single(&shape, self.rotation, start, end, channel, params)
                .into_iter()
                .collect(),
            (TraceType::Multi, false) => {
                backend.sweep_multi(&shape, self.rotation, start, end, channel, params)
            }
        }
    }
}

/// A queued overlap and, once its frame is harvested, what it touched.
#[derive(Debug, Clone)]
pub struct OverlapDatum {
    pub world: WorldRef,
    pub shape: CollisionShape,
    pub position: Vec3,
    pub rotation: Quat,
    pub channel: CollisionChannel,
    pub params: CollisionParameters,
    pub frame_number: u32,
    pub user_data: u32,
    pub out_overlaps: Vec<OverlapResult>,
}

impl OverlapDatum {
    #[inline]
    pub fn has_blocking_overlap(&self) -> bool {
        self.out_overlaps.iter().any(|o| o.blocking_hit)
    }
}

// ============================================================================
// 4. EXECUTION
// ============================================================================

/// What happened when a worker ran one datum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExecuteOutcome {
    Executed,
    /// The world was gone; output left empty.
    StaleWorld,
}

/// A datum a worker task can execute in place.
pub(crate) trait QueryDatum: Send + 'static {
    const KIND: QueryKind;

    fn execute(&mut self, epsilon: f32) -> ExecuteOutcome;
}

impl QueryDatum for TraceDatum {
    const KIND: QueryKind = QueryKind::Trace;

    fn execute(&mut self, epsilon: f32) -> ExecuteOutcome {
        self.out_hits.clear();
        let Some(backend) = self.world.upgrade() else {
            return ExecuteOutcome::StaleWorld;
        };
        self.out_hits = self.run(backend.as_ref(), epsilon);
        ExecuteOutcome::Executed
    }
}

impl QueryDatum for OverlapDatum {
    const KIND: QueryKind = QueryKind::Overlap;

    fn execute(&mut self, epsilon: f32) -> ExecuteOutcome {
        self.out_overlaps.clear();
        let Some(backend) = self.world.upgrade() else {
            return ExecuteOutcome::StaleWorld;
        };
        // degenerate volume -> point containment
        let shape = self.shape.effective(epsilon);
        self.out_overlaps =
            backend.overlap_multi(&shape, self.position, self.rotation, self.channel, &self.params);
        ExecuteOutcome::Executed
    }
}
