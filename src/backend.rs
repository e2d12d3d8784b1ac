//! The physics backend capability set consumed by the scheduler.
//!
//! The scheduler never does geometry itself. Worker tasks upgrade a datum's
//! [`WorldRef`] and call exactly one of these methods per datum.

use crate::collision::{CollisionChannel, CollisionParameters, CollisionShape};
use crate::hit::{HitResult, OverlapResult};
use glam::{Quat, Vec3};
use std::sync::Weak;

/// Weak, nullable reference to a physics world. A failed upgrade means the
/// world was torn down and the query silently produces nothing.
pub type WorldRef = Weak<dyn CollisionBackend>;

/// Synchronous scene queries. Implementations must tolerate concurrent calls
/// from several worker threads.
pub trait CollisionBackend: Send + Sync {
    /// True if anything blocks the segment.
    fn raycast_test(
        &self,
        start: Vec3,
        end: Vec3,
        channel: CollisionChannel,
        params: &CollisionParameters,
    ) -> bool;

    /// First blocking hit along the segment.
    fn raycast_single(
        &self,
        start: Vec3,
        end: Vec3,
        channel: CollisionChannel,
        params: &CollisionParameters,
    ) -> Option<HitResult>;

    /// Touches up to and including the first block, ordered by distance.
    fn raycast_multi(
        &self,
        start: Vec3,
        end: Vec3,
        channel: CollisionChannel,
        params: &CollisionParameters,
    ) -> Vec<HitResult>;

    fn sweep_test(
        &self,
        shape: &CollisionShape,
        rotation: Quat,
        start: Vec3,
        end: Vec3,
        channel: CollisionChannel,
        params: &CollisionParameters,
    ) -> bool;

    fn sweep_single(
        &self,
        shape: &CollisionShape,
        rotation: Quat,
        start: Vec3,
        end: Vec3,
        channel: CollisionChannel,
        params: &CollisionParameters,
    ) -> Option<HitResult>;

    fn sweep_multi(
        &self,
        shape: &CollisionShape,
        rotation: Quat,
        start: Vec3,
        end: Vec3,
        channel: CollisionChannel,
        params: &CollisionParameters,
    ) -> Vec<HitResult>;

    /// Everything the shape overlaps at `position`. A `Line` shape is a point query.
    fn overlap_multi(
        &self,
        shape: &CollisionShape,
        position: Vec3,
        rotation: Quat,
        channel: CollisionChannel,
        params: &CollisionParameters,
    ) -> Vec<OverlapResult>;
}
