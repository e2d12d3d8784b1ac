//! Rapier-backed collision scene.
//!
//! Static query scene: colliders are registered with collision metadata and
//! moved explicitly, nothing is simulated. Every query takes the read lock,
//! so any number of worker tasks can query concurrently while the game thread
//! waits for the write lock to mutate the scene between frames.

use crate::backend::CollisionBackend;
use crate::collision::{
    ActorId, CollisionChannel, CollisionParameters, CollisionResponse, CollisionShape, ComponentId, Mobility,
    ResponseContainer,
};
use crate::config::RapierSceneConfig;
use crate::hit::{finalize_multi_hits, HitResult, OverlapResult};
use glam::{Quat, Vec3};
use log::debug;
use nalgebra::{Quaternion, Translation3, UnitQuaternion};
use parking_lot::RwLock;
use rapier3d::parry::query::{RayIntersection, TOIStatus, TOI};
use rapier3d::parry::shape::FeatureId;
use rapier3d::prelude::*;
use std::collections::HashMap;

/// Segments shorter than this are not traced.
const MIN_TRACE_LENGTH_SQUARED: f32 = 1.0e-8;

// ============================================================================
// 1. COLLIDER METADATA
// ============================================================================

/// Which trace mode a collider answers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollisionComplexity {
    /// Only simple-collision traces (`trace_complex == false`).
    Simple,
    /// Only complex-collision traces.
    Complex,
    #[default]
    Both,
}

impl CollisionComplexity {
    #[inline]
    pub fn answers(self, trace_complex: bool) -> bool {
        match self {
            Self::Simple => !trace_complex,
            Self::Complex => trace_complex,
            Self::Both => true,
        }
    }
}

/// Gameplay-side description of a registered collider.
#[derive(Debug, Clone, PartialEq)]
pub struct ColliderDesc {
    pub actor: Option<ActorId>,
    pub component: Option<ComponentId>,
    /// Channel the object is seen as by object-type queries and response tables.
    pub object_type: CollisionChannel,
    /// How the object responds to each trace channel.
    pub responses: ResponseContainer,
    pub mobility: Mobility,
    pub complexity: CollisionComplexity,
}

impl Default for ColliderDesc {
    fn default() -> Self {
        Self {
            actor: None,
            component: None,
            object_type: CollisionChannel::WorldStatic,
            responses: ResponseContainer::default(),
            mobility: Mobility::Static,
            complexity: CollisionComplexity::Both,
        }
    }
}

impl ColliderDesc {
    pub fn new(object_type: CollisionChannel) -> Self {
        Self {
            object_type,
            mobility: if object_type == CollisionChannel::WorldStatic {
                Mobility::Static
            } else {
                Mobility::Movable
            },
            ..Self::default()
        }
    }

    pub fn with_actor(mut self, actor: ActorId, component: ComponentId) -> Self {
        self.actor = Some(actor);
        self.component = Some(component);
        self
    }

    pub fn with_response(mut self, channel: CollisionChannel, response: CollisionResponse) -> Self {
        self.responses.set(channel, response);
        self
    }

    pub fn with_mobility(mut self, mobility: Mobility) -> Self {
        self.mobility = mobility;
        self
    }

    pub fn with_complexity(mut self, complexity: CollisionComplexity) -> Self {
        self.complexity = complexity;
        self
    }
}

// ============================================================================
// 2. CONVERSIONS
// ============================================================================

#[inline]
fn to_point(v: Vec3) -> Point<Real> {
    point![v.x, v.y, v.z]
}

#[inline]
fn to_vector(v: Vec3) -> Vector<Real> {
    vector![v.x, v.y, v.z]
}

#[inline]
fn to_rotation(q: Quat) -> UnitQuaternion<Real> {
    UnitQuaternion::from_quaternion(Quaternion::new(q.w, q.x, q.y, q.z))
}

#[inline]
fn to_isometry(position: Vec3, rotation: Quat) -> Isometry<Real> {
    Isometry::from_parts(Translation3::new(position.x, position.y, position.z), to_rotation(rotation))
}

#[inline]
fn to_glam(v: &Vector<Real>) -> Vec3 {
    Vec3::new(v.x, v.y, v.z)
}

/// Rapier shape for a volumetric query shape. `None` for `Line`.
fn shared_shape(shape: &CollisionShape) -> Option<SharedShape> {
    match *shape {
        CollisionShape::Line => None,
        CollisionShape::Box { half_extent } => Some(SharedShape::cuboid(half_extent.x, half_extent.y, half_extent.z)),
        CollisionShape::Sphere { radius } => Some(SharedShape::ball(radius)),
        CollisionShape::Capsule {
            radius,
            half_height,
        } => Some(SharedShape::capsule_y((half_height - radius).max(0.0), radius)),
    }
}

// ============================================================================
// 3. SCENE
// ============================================================================

struct SceneState {
    islands: IslandManager,
    bodies: RigidBodySet,
    colliders: ColliderSet,
    query_pipeline: QueryPipeline,
    meta: HashMap<ColliderHandle, ColliderDesc>,
}

impl SceneState {
    fn refresh(&mut self) {
        self.query_pipeline.update(&self.bodies, &self.colliders);
    }

    fn desc(&self, handle: ColliderHandle) -> Option<&ColliderDesc> {
        self.meta.get(&handle)
    }

    /// Effective response of one collider to one query, after filters.
    fn response(&self, handle: ColliderHandle, channel: CollisionChannel, params: &CollisionParameters) -> CollisionResponse {
        let Some(desc) = self.desc(handle) else {
            return CollisionResponse::Ignore;
        };
        let query = &params.query;
        if !query.mobility.accepts(desc.mobility)
            || !desc.complexity.answers(query.trace_complex)
            || query.is_ignored(desc.actor, desc.component)
        {
            return CollisionResponse::Ignore;
        }
        params.resolve_response(channel, desc.object_type, &desc.responses)
    }

    /// Blocking flag for a multi-query result. Object-type multi queries
    /// report everything as touches.
    fn blocks_in_multi(&self, response: CollisionResponse, params: &CollisionParameters) -> bool {
        response == CollisionResponse::Block && !params.is_object_query()
    }

    fn tag(&self, hit: &mut HitResult, handle: ColliderHandle) {
        if let Some(desc) = self.desc(handle) {
            hit.actor = desc.actor;
            hit.component = desc.component;
        }
    }

    fn ray_hit(
        &self,
        start: Vec3,
        end: Vec3,
        handle: ColliderHandle,
        intersection: &RayIntersection,
        params: &CollisionParameters,
    ) -> HitResult {
        let mut hit = HitResult::new(start, end);
        hit.set_time(intersection.toi);
        hit.impact_point = hit.location;
        hit.impact_normal = to_glam(&intersection.normal).normalize_or_zero();
        hit.normal = hit.impact_normal;
        hit.start_penetrating = intersection.toi <= 0.0;
        if params.query.return_face_index {
            if let FeatureId::Face(face) = intersection.feature {
                hit.face_index = Some(face);
            }
        }
        self.tag(&mut hit, handle);
        hit
    }

    fn sweep_hit(&self, start: Vec3, end: Vec3, rotation: Quat, handle: ColliderHandle, toi: &TOI) -> HitResult {
        let mut hit = HitResult::new(start, end);
        hit.set_time(toi.toi);
        // witness2/normal2 are local to the swept shape; place them at the impact pose
        let pose = to_isometry(hit.location, rotation);
        let contact = pose * toi.witness2;
        let outward = pose.rotation * toi.normal2.into_inner();
        hit.impact_point = Vec3::new(contact.x, contact.y, contact.z);
        hit.impact_normal = -to_glam(&outward).normalize_or_zero();
        hit.normal = hit.impact_normal;
        hit.start_penetrating = matches!(toi.status, TOIStatus::Penetrating);
        self.tag(&mut hit, handle);
        hit
    }
}

/// Collision scene implementing every [`CollisionBackend`] capability with rapier.
pub struct RapierScene {
    config: RapierSceneConfig,
    state: RwLock<SceneState>,
}

impl Default for RapierScene {
    fn default() -> Self {
        Self::new(RapierSceneConfig::default())
    }
}

impl RapierScene {
    pub fn new(config: RapierSceneConfig) -> Self {
        Self {
            config,
            state: RwLock::new(SceneState {
                islands: IslandManager::new(),
                bodies: RigidBodySet::new(),
                colliders: ColliderSet::new(),
                query_pipeline: QueryPipeline::new(),
                meta: HashMap::new(),
            }),
        }
    }

    #[inline]
    pub fn config(&self) -> &RapierSceneConfig {
        &self.config
    }

    /// Registers a collider. `Line` has no volume and is refused with `None`.
    pub fn add_collider(
        &self,
        shape: &CollisionShape,
        position: Vec3,
        rotation: Quat,
        desc: ColliderDesc,
    ) -> Option<ColliderHandle> {
        let shape = shared_shape(shape)?;
        let collider = ColliderBuilder::new(shape)
            .position(to_isometry(position, rotation))
            .build();

        let mut state = self.state.write();
        let handle = state.colliders.insert(collider);
        state.meta.insert(handle, desc);
        state.refresh();
        debug!("scene collider added: {handle:?}");
        Some(handle)
    }

    /// Moves a collider. Returns false for unknown handles.
    pub fn set_collider_pose(&self, handle: ColliderHandle, position: Vec3, rotation: Quat) -> bool {
        let mut state = self.state.write();
        let Some(collider) = state.colliders.get_mut(handle) else {
            return false;
        };
        collider.set_position(to_isometry(position, rotation));
        state.refresh();
        true
    }

    pub fn remove_collider(&self, handle: ColliderHandle) -> Option<ColliderDesc> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        state
            .colliders
            .remove(handle, &mut state.islands, &mut state.bodies, false)?;
        let desc = state.meta.remove(&handle);
        state.refresh();
        desc
    }

    pub fn collider_desc(&self, handle: ColliderHandle) -> Option<ColliderDesc> {
        self.state.read().desc(handle).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().colliders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ray(start: Vec3, end: Vec3) -> Option<Ray> {
        let dir = end - start;
        (dir.length_squared() > MIN_TRACE_LENGTH_SQUARED).then(|| Ray::new(to_point(start), to_vector(dir)))
    }

    fn first_blocking_sweep(
        &self,
        state: &SceneState,
        shape: &SharedShape,
        rotation: Quat,
        start: Vec3,
        end: Vec3,
        channel: CollisionChannel,
        params: &CollisionParameters,
    ) -> Option<(ColliderHandle, TOI)> {
        let blocks = |handle: ColliderHandle, _: &Collider| {
            state.response(handle, channel, params) == CollisionResponse::Block
        };
        state.query_pipeline.cast_shape(
            &state.bodies,
            &state.colliders,
            &to_isometry(start, rotation),
            &to_vector(end - start),
            &**shape,
            1.0,
            params.query.find_initial_overlaps,
            QueryFilter::default().predicate(&blocks),
        )
    }
}

impl CollisionBackend for RapierScene {
    fn raycast_test(&self, start: Vec3, end: Vec3, channel: CollisionChannel, params: &CollisionParameters) -> bool {
        let Some(ray) = Self::ray(start, end) else {
            return false;
        };
        let state = self.state.read();
        let blocks = |handle: ColliderHandle, _: &Collider| {
            state.response(handle, channel, params) == CollisionResponse::Block
        };
        state
            .query_pipeline
            .cast_ray(
                &state.bodies,
                &state.colliders,
                &ray,
                1.0,
                params.query.find_initial_overlaps,
                QueryFilter::default().predicate(&blocks),
            )
            .is_some()
    }

    fn raycast_single(
        &self,
        start: Vec3,
        end: Vec3,
        channel: CollisionChannel,
        params: &CollisionParameters,
    ) -> Option<HitResult> {
        let ray = Self::ray(start, end)?;
        let state = self.state.read();
        let blocks = |handle: ColliderHandle, _: &Collider| {
            state.response(handle, channel, params) == CollisionResponse::Block
        };
        let (handle, intersection) = state.query_pipeline.cast_ray_and_get_normal(
            &state.bodies,
            &state.colliders,
            &ray,
            1.0,
            params.query.find_initial_overlaps,
            QueryFilter::default().predicate(&blocks),
        )?;
        let mut hit = state.ray_hit(start, end, handle, &intersection, params);
        hit.blocking_hit = true;
        Some(hit)
    }

    fn raycast_multi(&self, start: Vec3, end: Vec3, channel: CollisionChannel, params: &CollisionParameters) -> Vec<HitResult> {
        let Some(ray) = Self::ray(start, end) else {
            return Vec::new();
        };
        let state = self.state.read();
        let responds = |handle: ColliderHandle, _: &Collider| {
            state.response(handle, channel, params) != CollisionResponse::Ignore
        };

        let mut hits = Vec::new();
        state.query_pipeline.intersections_with_ray(
            &state.bodies,
            &state.colliders,
            &ray,
            1.0,
            params.query.find_initial_overlaps,
            QueryFilter::default().predicate(&responds),
            |handle, intersection| {
                let mut hit = state.ray_hit(start, end, handle, &intersection, params);
                hit.blocking_hit = state.blocks_in_multi(state.response(handle, channel, params), params);
                hits.push(hit);
                true
            },
        );
        finalize_multi_hits(&mut hits);
        hits
    }

    fn sweep_test(
        &self,
        shape: &CollisionShape,
        rotation: Quat,
        start: Vec3,
        end: Vec3,
        channel: CollisionChannel,
        params: &CollisionParameters,
    ) -> bool {
        let Some(shared) = shared_shape(shape) else {
            return self.raycast_test(start, end, channel, params);
        };
        let state = self.state.read();
        self.first_blocking_sweep(&state, &shared, rotation, start, end, channel, params)
            .is_some()
    }

    fn sweep_single(
        &self,
        shape: &CollisionShape,
        rotation: Quat,
        start: Vec3,
        end: Vec3,
        channel: CollisionChannel,
        params: &CollisionParameters,
    ) -> Option<HitResult> {
        let Some(shared) = shared_shape(shape) else {
            return self.raycast_single(start, end, channel, params);
        };
        let state = self.state.read();
        let (handle, toi) = self.first_blocking_sweep(&state, &shared, rotation, start, end, channel, params)?;
        let mut hit = state.sweep_hit(start, end, rotation, handle, &toi);
        hit.blocking_hit = true;
        Some(hit)
    }

    fn sweep_multi(
        &self,
        shape: &CollisionShape,
        rotation: Quat,
        start: Vec3,
        end: Vec3,
        channel: CollisionChannel,
        params: &CollisionParameters,
    ) -> Vec<HitResult> {
        let Some(shared) = shared_shape(shape) else {
            return self.raycast_multi(start, end, channel, params);
        };
        let state = self.state.read();
        let pose = to_isometry(start, rotation);
        let velocity = to_vector(end - start);

        let mut hits = Vec::new();
        let mut seen: Vec<ColliderHandle> = Vec::new();
        while hits.len() < self.config.max_sweep_hits {
            let responds = |handle: ColliderHandle, _: &Collider| {
                !seen.contains(&handle) && state.response(handle, channel, params) != CollisionResponse::Ignore
            };
            let Some((handle, toi)) = state.query_pipeline.cast_shape(
                &state.bodies,
                &state.colliders,
                &pose,
                &velocity,
                &*shared,
                1.0,
                params.query.find_initial_overlaps,
                QueryFilter::default().predicate(&responds),
            ) else {
                break;
            };

            let mut hit = state.sweep_hit(start, end, rotation, handle, &toi);
            hit.blocking_hit = state.blocks_in_multi(state.response(handle, channel, params), params);
            let stop = hit.blocking_hit;
            hits.push(hit);
            seen.push(handle);
            if stop {
                break;
            }
        }
        finalize_multi_hits(&mut hits);
        hits
    }

    fn overlap_multi(
        &self,
        shape: &CollisionShape,
        position: Vec3,
        rotation: Quat,
        channel: CollisionChannel,
        params: &CollisionParameters,
    ) -> Vec<OverlapResult> {
        let state = self.state.read();
        let responds = |handle: ColliderHandle, _: &Collider| {
            state.response(handle, channel, params) != CollisionResponse::Ignore
        };
        let filter = QueryFilter::default().predicate(&responds);

        let mut overlaps = Vec::new();
        let mut collect = |handle: ColliderHandle| {
            let desc = state.desc(handle);
            overlaps.push(OverlapResult {
                actor: desc.and_then(|d| d.actor),
                component: desc.and_then(|d| d.component),
                blocking_hit: state.response(handle, channel, params) == CollisionResponse::Block,
            });
            true
        };

        match shared_shape(shape) {
            Some(shared) => state.query_pipeline.intersections_with_shape(
                &state.bodies,
                &state.colliders,
                &to_isometry(position, rotation),
                &*shared,
                filter,
                &mut collect,
            ),
            None => state.query_pipeline.intersections_with_point(
                &state.bodies,
                &state.colliders,
                &to_point(position),
                filter,
                &mut collect,
            ),
        }
        overlaps
    }
}
