//! Query results written by the backend into a datum's output slot.

use crate::collision::{ActorId, ComponentId};
use glam::Vec3;

/// One hit along a trace or sweep.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HitResult {
    /// The hit stops the query (as opposed to a touch).
    pub blocking_hit: bool,
    /// The query started inside the hit object.
    pub start_penetrating: bool,
    /// Fraction along `trace_start → trace_end` in `[0, 1]`.
    pub time: f32,
    /// World-space distance from `trace_start` to `location`.
    pub distance: f32,
    /// Where the query shape ended up. Equals `impact_point` for rays.
    pub location: Vec3,
    /// Contact point on the hit object.
    pub impact_point: Vec3,
    /// Normal of the sweep shape at `location`.
    pub normal: Vec3,
    /// Surface normal of the hit object at `impact_point`.
    pub impact_normal: Vec3,
    pub trace_start: Vec3,
    pub trace_end: Vec3,
    pub penetration_depth: f32,
    pub face_index: Option<u32>,
    pub actor: Option<ActorId>,
    pub component: Option<ComponentId>,
}

impl HitResult {
    /// An empty record for a query from `start` to `end`, `time = 1`.
    pub fn new(start: Vec3, end: Vec3) -> Self {
        Self {
            time: 1.0,
            trace_start: start,
            trace_end: end,
            ..Self::default()
        }
    }

    /// The synthetic yes/no hit produced by Test queries. No location data.
    pub fn blocking_test_hit(start: Vec3, end: Vec3) -> Self {
        Self {
            blocking_hit: true,
            ..Self::new(start, end)
        }
    }

    #[inline]
    pub fn is_touch(&self) -> bool {
        !self.blocking_hit
    }

    /// Rebuilds `location` and `distance` from `time`.
    pub fn set_time(&mut self, time: f32) {
        self.time = time.clamp(0.0, 1.0);
        self.location = self.trace_start.lerp(self.trace_end, self.time);
        self.distance = self.trace_start.distance(self.location);
    }
}

/// One object found by an overlap query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OverlapResult {
    pub actor: Option<ActorId>,
    pub component: Option<ComponentId>,
    pub blocking_hit: bool,
}

/// Sorts by distance and cuts after the first blocking hit.
///
/// Touches beyond the first block are dropped, the block itself is kept last.
pub fn finalize_multi_hits(hits: &mut Vec<HitResult>) {
    hits.sort_by(|a, b| a.time.total_cmp(&b.time));
    if let Some(first_block) = hits.iter().position(|h| h.blocking_hit) {
        hits.truncate(first_block + 1);
    }
}

/// True if any hit in the slice blocks.
#[inline]
pub fn has_blocking_hit(hits: &[HitResult]) -> bool {
    hits.iter().any(|h| h.blocking_hit)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(time: f32, blocking: bool) -> HitResult {
        let mut h = HitResult::new(Vec3::ZERO, Vec3::X * 10.0);
        h.blocking_hit = blocking;
        h.set_time(time);
        h
    }

    #[test]
    fn test_set_time_updates_location() {
        let h = hit(0.25, true);
        assert_eq!(h.location, Vec3::new(2.5, 0.0, 0.0));
        assert!((h.distance - 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_finalize_multi_hits_stops_at_first_block() {
        let mut hits = vec![hit(0.9, false), hit(0.5, true), hit(0.1, false), hit(0.7, true)];
        finalize_multi_hits(&mut hits);

        assert_eq!(hits.len(), 2);
        assert!(hits[0].is_touch());
        assert_eq!(hits[0].time, 0.1);
        assert!(hits[1].blocking_hit);
        assert_eq!(hits[1].time, 0.5);
    }

    #[test]
    fn test_finalize_multi_hits_all_touches() {
        let mut hits = vec![hit(0.3, false), hit(0.2, false)];
        finalize_multi_hits(&mut hits);
        assert_eq!(hits.len(), 2);
        assert!(!has_blocking_hit(&hits));
    }

    #[test]
    fn test_blocking_test_hit_has_no_location() {
        let h = HitResult::blocking_test_hit(Vec3::ZERO, Vec3::Y);
        assert!(h.blocking_hit);
        assert_eq!(h.location, Vec3::ZERO);
        assert_eq!(h.actor, None);
    }
}
