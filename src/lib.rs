// src/lib.rs
//! Asynchronous, frame-indexed collision queries.
//!
//! Gameplay code submits raycasts, sweeps and overlaps during a frame and gets
//! a [`TraceHandle`] back immediately. Queries run on a worker pool in chunks
//! while the frame continues; results are read (or delivered to a delegate)
//! during the next frame.
//!
//! - [`World`] is the convenience surface: a backend plus a scheduler with
//!   per-tick hooks.
//! - [`AsyncTraceScheduler`] is the double-buffered engine underneath.
//! - [`CollisionBackend`] is the seam to the geometry code; [`RapierScene`]
//!   implements it with rapier.

pub mod backend;
pub mod buffer;
pub mod collision;
pub mod config;
pub mod datum;
pub mod dispatch;
pub mod error;
pub mod hit;
pub mod physics;
pub mod scheduler;
pub mod state;
pub mod world;

pub use backend::{CollisionBackend, WorldRef};
pub use buffer::{BufferPhase, CHUNK_CAPACITY};
pub use collision::{
    ActorId, CollisionChannel, CollisionObjectQueryParams, CollisionParameters, CollisionQueryParams,
    CollisionResponse, CollisionResponseParams, CollisionShape, ComponentId, Mobility, QueryMobility,
    ResponseContainer,
};
pub use config::{AsyncTraceConfig, RapierSceneConfig};
pub use datum::{
    OverlapDatum, OverlapDelegate, OverlapRequest, QueryKind, TraceDatum, TraceDelegate, TraceHandle, TraceRequest,
    TraceType,
};
pub use dispatch::{AsyncTraceMetrics, AsyncTraceStats};
pub use error::{Error, Result};
pub use hit::{HitResult, OverlapResult};
pub use physics::{ColliderDesc, CollisionComplexity, RapierScene};
pub use scheduler::AsyncTraceScheduler;
pub use world::World;
