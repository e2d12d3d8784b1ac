//! Collision query descriptors: shapes, channels, responses and query parameters.
//!
//! Everything here is a plain value type. The scheduler copies these into a
//! datum at submission time, so callers are free to reuse or mutate their own
//! copies immediately after submitting.

use glam::Vec3;

/// Dimensions at or below this are considered degenerate (the engine's `KINDA_SMALL_NUMBER`).
pub const DEFAULT_SHAPE_EPSILON: f32 = 1.0e-4;

// ============================================================================
// 1. IDENTIFIERS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(pub u32);

// ============================================================================
// 2. SHAPES
// ============================================================================

/// Query volume. `Line` is a plain ray.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum CollisionShape {
    #[default]
    Line,
    Box { half_extent: Vec3 },
    Sphere { radius: f32 },
    /// `half_height` includes the hemispherical caps.
    Capsule { radius: f32, half_height: f32 },
}

impl CollisionShape {
    #[inline]
    pub fn make_box(half_extent: Vec3) -> Self {
        Self::Box {
            half_extent: half_extent.abs(),
        }
    }

    #[inline]
    pub fn make_sphere(radius: f32) -> Self {
        Self::Sphere {
            radius: radius.abs(),
        }
    }

    /// Half height is clamped so the capsule is never shorter than a sphere of `radius`.
    #[inline]
    pub fn make_capsule(radius: f32, half_height: f32) -> Self {
        let radius = radius.abs();
        Self::Capsule {
            radius,
            half_height: half_height.abs().max(radius),
        }
    }

    #[inline]
    pub fn is_line(&self) -> bool {
        matches!(self, Self::Line)
    }

    /// True when every dimension is at or below `epsilon`.
    pub fn is_nearly_zero(&self, epsilon: f32) -> bool {
        match *self {
            Self::Line => true,
            Self::Box { half_extent } => half_extent.max_element() <= epsilon,
            Self::Sphere { radius } => radius <= epsilon,
            Self::Capsule {
                radius,
                half_height,
            } => radius <= epsilon && half_height <= epsilon,
        }
    }

    /// The shape actually used for execution: degenerate volumes collapse to `Line`.
    #[inline]
    pub fn effective(&self, epsilon: f32) -> Self {
        if self.is_nearly_zero(epsilon) {
            Self::Line
        } else {
            *self
        }
    }
}

// ============================================================================
// 3. CHANNELS & RESPONSES
// ============================================================================

/// Number of addressable channels in a [`ResponseContainer`].
pub const NUM_COLLISION_CHANNELS: usize = 32;

/// Highest index accepted by [`CollisionChannel::GameTraceChannel`].
pub const MAX_GAME_TRACE_CHANNELS: u8 = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CollisionChannel {
    #[default]
    WorldStatic,
    WorldDynamic,
    Pawn,
    Visibility,
    Camera,
    PhysicsBody,
    Vehicle,
    Destructible,
    /// Project-defined channel, `1..=MAX_GAME_TRACE_CHANNELS`.
    GameTraceChannel(u8),
}

impl CollisionChannel {
    /// Bit index of this channel in response tables and object-type masks.
    pub fn index(self) -> usize {
        match self {
            Self::WorldStatic => 0,
            Self::WorldDynamic => 1,
            Self::Pawn => 2,
            Self::Visibility => 3,
            Self::Camera => 4,
            Self::PhysicsBody => 5,
            Self::Vehicle => 6,
            Self::Destructible => 7,
            Self::GameTraceChannel(n) => {
                7 + n.clamp(1, MAX_GAME_TRACE_CHANNELS) as usize
            }
        }
    }

    #[inline]
    pub fn bit(self) -> u32 {
        1 << self.index()
    }
}

/// Ordered so the effective response of a pair is `min(a, b)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum CollisionResponse {
    Ignore,
    Overlap,
    #[default]
    Block,
}

/// Per-channel response table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseContainer {
    responses: [CollisionResponse; NUM_COLLISION_CHANNELS],
}

impl Default for ResponseContainer {
    fn default() -> Self {
        Self::all(CollisionResponse::Block)
    }
}

impl ResponseContainer {
    pub fn all(response: CollisionResponse) -> Self {
        Self {
            responses: [response; NUM_COLLISION_CHANNELS],
        }
    }

    #[inline]
    pub fn get(&self, channel: CollisionChannel) -> CollisionResponse {
        self.responses[channel.index()]
    }

    #[inline]
    pub fn set(&mut self, channel: CollisionChannel, response: CollisionResponse) {
        self.responses[channel.index()] = response;
    }

    pub fn with(mut self, channel: CollisionChannel, response: CollisionResponse) -> Self {
        self.set(channel, response);
        self
    }
}

// ============================================================================
// 4. QUERY PARAMETERS
// ============================================================================

/// Which object mobilities a query considers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryMobility {
    #[default]
    Any,
    Static,
    Dynamic,
}

/// Mobility of a registered collision object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mobility {
    #[default]
    Static,
    Movable,
}

impl QueryMobility {
    #[inline]
    pub fn accepts(self, mobility: Mobility) -> bool {
        match self {
            Self::Any => true,
            Self::Static => mobility == Mobility::Static,
            Self::Dynamic => mobility == Mobility::Movable,
        }
    }
}

/// General query flags and ignore lists.
#[derive(Debug, Clone, PartialEq)]
pub struct CollisionQueryParams {
    /// Free-form tag for debugging and profiling.
    pub trace_tag: String,
    /// Trace against complex (per-poly) collision instead of simple collision.
    pub trace_complex: bool,
    /// Report hits for shapes the query starts inside of.
    pub find_initial_overlaps: bool,
    /// Fill `HitResult::face_index` when the backend knows it.
    pub return_face_index: bool,
    /// Drop non-blocking (touch) results.
    pub ignore_touches: bool,
    /// Drop blocking results.
    pub ignore_blocks: bool,
    pub mobility: QueryMobility,
    pub ignored_actors: Vec<ActorId>,
    pub ignored_components: Vec<ComponentId>,
}

impl Default for CollisionQueryParams {
    fn default() -> Self {
        Self {
            trace_tag: String::new(),
            trace_complex: false,
            find_initial_overlaps: true,
            return_face_index: false,
            ignore_touches: false,
            ignore_blocks: false,
            mobility: QueryMobility::Any,
            ignored_actors: Vec::new(),
            ignored_components: Vec::new(),
        }
    }
}

impl CollisionQueryParams {
    pub fn new(trace_tag: impl Into<String>, trace_complex: bool) -> Self {
        Self {
            trace_tag: trace_tag.into(),
            trace_complex,
            ..Self::default()
        }
    }

    pub fn add_ignored_actor(&mut self, actor: ActorId) {
        if !self.ignored_actors.contains(&actor) {
            self.ignored_actors.push(actor);
        }
    }

    pub fn add_ignored_component(&mut self, component: ComponentId) {
        if !self.ignored_components.contains(&component) {
            self.ignored_components.push(component);
        }
    }

    #[inline]
    pub fn is_ignored(&self, actor: Option<ActorId>, component: Option<ComponentId>) -> bool {
        actor.map_or(false, |a| self.ignored_actors.contains(&a))
            || component.map_or(false, |c| self.ignored_components.contains(&c))
    }

    /// Applies `ignore_touches` / `ignore_blocks` to a resolved response.
    #[inline]
    pub fn filter_response(&self, response: CollisionResponse) -> CollisionResponse {
        match response {
            CollisionResponse::Overlap if self.ignore_touches => CollisionResponse::Ignore,
            CollisionResponse::Block if self.ignore_blocks => CollisionResponse::Ignore,
            other => other,
        }
    }
}

/// The query's own response to each object type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CollisionResponseParams {
    pub response: ResponseContainer,
}

impl CollisionResponseParams {
    pub fn new(response: ResponseContainer) -> Self {
        Self { response }
    }
}

/// Object types to query. An empty mask means the query runs by channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CollisionObjectQueryParams {
    pub object_types: u32,
}

impl CollisionObjectQueryParams {
    pub const ALL_STATIC: Self = Self {
        object_types: 1 << 0,
    };
    pub const ALL_DYNAMIC: Self = Self {
        object_types: (1 << 1) | (1 << 2) | (1 << 5) | (1 << 6) | (1 << 7),
    };
    pub const ALL_OBJECTS: Self = Self {
        object_types: Self::ALL_STATIC.object_types | Self::ALL_DYNAMIC.object_types,
    };

    pub fn from_channels(channels: &[CollisionChannel]) -> Self {
        let mut params = Self::default();
        for &channel in channels {
            params.add_object_type(channel);
        }
        params
    }

    #[inline]
    pub fn add_object_type(&mut self, channel: CollisionChannel) {
        self.object_types |= channel.bit();
    }

    #[inline]
    pub fn contains(&self, channel: CollisionChannel) -> bool {
        self.object_types & channel.bit() != 0
    }

    /// A non-empty mask turns the query into an object-type query.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.object_types != 0
    }
}

/// Everything besides geometry that a backend needs to evaluate one query.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CollisionParameters {
    pub query: CollisionQueryParams,
    pub response: CollisionResponseParams,
    pub object_query: CollisionObjectQueryParams,
}

impl CollisionParameters {
    pub fn by_channel(query: CollisionQueryParams, response: CollisionResponseParams) -> Self {
        Self {
            query,
            response,
            object_query: CollisionObjectQueryParams::default(),
        }
    }

    pub fn by_object_type(query: CollisionQueryParams, object_query: CollisionObjectQueryParams) -> Self {
        Self {
            query,
            response: CollisionResponseParams::default(),
            object_query,
        }
    }

    #[inline]
    pub fn is_object_query(&self) -> bool {
        self.object_query.is_valid()
    }

    /// Resolves how a query on `trace_channel` treats an object.
    ///
    /// Object-type queries block on every matching type and ignore the rest.
    /// Channel queries use the weaker of the object's response to the trace
    /// channel and the query's response to the object's type.
    pub fn resolve_response(
        &self,
        trace_channel: CollisionChannel,
        object_type: CollisionChannel,
        object_responses: &ResponseContainer,
    ) -> CollisionResponse {
        let response = if self.is_object_query() {
            if self.object_query.contains(object_type) {
                CollisionResponse::Block
            } else {
                CollisionResponse::Ignore
            }
        } else {
            object_responses
                .get(trace_channel)
                .min(self.response.response.get(object_type))
        };
        self.query.filter_response(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degenerate_shapes() {
        let eps = DEFAULT_SHAPE_EPSILON;
        assert!(CollisionShape::Line.is_nearly_zero(eps));
        assert!(CollisionShape::make_sphere(1.0e-6).is_nearly_zero(eps));
        assert!(!CollisionShape::make_sphere(0.5).is_nearly_zero(eps));
        assert!(CollisionShape::make_box(Vec3::splat(1.0e-5)).is_nearly_zero(eps));
        // one real dimension keeps the box volumetric
        assert!(!CollisionShape::make_box(Vec3::new(1.0e-5, 2.0, 1.0e-5)).is_nearly_zero(eps));
        assert_eq!(
            CollisionShape::make_capsule(1.0e-6, 1.0e-6).effective(eps),
            CollisionShape::Line
        );
    }

    #[test]
    fn test_capsule_half_height_clamped() {
        match CollisionShape::make_capsule(2.0, 0.5) {
            CollisionShape::Capsule {
                radius,
                half_height,
            } => {
                assert_eq!(radius, 2.0);
                assert_eq!(half_height, 2.0);
            }
            other => panic!("unexpected shape {other:?}"),
        }
    }

    #[test]
    fn test_channel_bits_are_distinct() {
        let channels = [
            CollisionChannel::WorldStatic,
            CollisionChannel::WorldDynamic,
            CollisionChannel::Pawn,
            CollisionChannel::Visibility,
            CollisionChannel::Camera,
            CollisionChannel::PhysicsBody,
            CollisionChannel::Vehicle,
            CollisionChannel::Destructible,
            CollisionChannel::GameTraceChannel(1),
            CollisionChannel::GameTraceChannel(MAX_GAME_TRACE_CHANNELS),
        ];
        let mut mask = 0u32;
        for c in channels {
            assert!(c.index() < NUM_COLLISION_CHANNELS);
            assert_eq!(mask & c.bit(), 0, "{c:?} collides with an earlier channel");
            mask |= c.bit();
        }
    }

    #[test]
    fn test_resolve_response_by_channel() {
        let params = CollisionParameters::by_channel(
            CollisionQueryParams::default(),
            CollisionResponseParams::new(
                ResponseContainer::default().with(CollisionChannel::Pawn, CollisionResponse::Overlap),
            ),
        );
        let object = ResponseContainer::default()
            .with(CollisionChannel::Camera, CollisionResponse::Ignore);

        // object ignores the camera channel
        assert_eq!(
            params.resolve_response(CollisionChannel::Camera, CollisionChannel::WorldStatic, &object),
            CollisionResponse::Ignore
        );
        // query only overlaps pawns
        assert_eq!(
            params.resolve_response(CollisionChannel::Visibility, CollisionChannel::Pawn, &object),
            CollisionResponse::Overlap
        );
        assert_eq!(
            params.resolve_response(CollisionChannel::Visibility, CollisionChannel::WorldStatic, &object),
            CollisionResponse::Block
        );
    }

    #[test]
    fn test_resolve_response_by_object_type() {
        let params = CollisionParameters::by_object_type(
            CollisionQueryParams::default(),
            CollisionObjectQueryParams::from_channels(&[CollisionChannel::Pawn]),
        );
        let object = ResponseContainer::all(CollisionResponse::Ignore);

        assert!(params.is_object_query());
        assert_eq!(
            params.resolve_response(CollisionChannel::Visibility, CollisionChannel::Pawn, &object),
            CollisionResponse::Block
        );
        assert_eq!(
            params.resolve_response(CollisionChannel::Visibility, CollisionChannel::Vehicle, &object),
            CollisionResponse::Ignore
        );
    }

    #[test]
    fn test_ignore_flags() {
        let mut query = CollisionQueryParams::new("flags", false);
        query.ignore_touches = true;
        assert_eq!(query.filter_response(CollisionResponse::Overlap), CollisionResponse::Ignore);
        assert_eq!(query.filter_response(CollisionResponse::Block), CollisionResponse::Block);

        query.add_ignored_actor(ActorId(7));
        query.add_ignored_actor(ActorId(7));
        assert_eq!(query.ignored_actors.len(), 1);
        assert!(query.is_ignored(Some(ActorId(7)), None));
        assert!(!query.is_ignored(Some(ActorId(8)), Some(ComponentId(1))));
    }
}
