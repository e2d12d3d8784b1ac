//! Demo driver: a random obstacle field queried by a few hundred async traces
//! per frame.
//!
//! Usage: `async_trace_demo [config.json]`. `RUST_LOG` and the
//! `ASYNC_TRACE_*` variables override the defaults.

use anyhow::{Context, Result};
use async_trace::{
    ActorId, AsyncTraceConfig, ColliderDesc, CollisionChannel, CollisionQueryParams, CollisionResponse,
    CollisionResponseParams, CollisionShape, ComponentId, OverlapDatum, RapierScene, RapierSceneConfig,
    TraceDatum, TraceHandle, TraceType, World,
};
use glam::{Quat, Vec3};
use log::{error, info, warn, LevelFilter};
use rand::Rng;
use std::backtrace::Backtrace;
use std::cell::Cell;
use std::panic;
use std::rc::Rc;
use std::sync::Arc;

// mimalloc is noticeably faster than the system allocator for the many
// small per-query allocations made by worker threads.
#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const FRAMES: u32 = 120;
const TRACES_PER_FRAME: usize = 200;
const OVERLAPS_PER_FRAME: usize = 40;
const OBSTACLES: u32 = 256;
const FIELD_HALF_SIZE: f32 = 100.0;

fn main() -> Result<()> {
    setup_diagnostics();

    let config = load_config()?;
    info!("Starting async trace demo with {config:?}");

    let mut rng = rand::thread_rng();
    let scene = Arc::new(build_scene(&mut rng));
    let mut world = World::new(scene, config).context("creating world")?;

    let delivered_hits = Rc::new(Cell::new(0usize));
    let delivered_overlaps = Rc::new(Cell::new(0usize));
    let mut polled_hits = 0usize;
    let mut pending: Vec<TraceHandle> = Vec::new();

    let query = CollisionQueryParams::new("demo", false);
    let response = CollisionResponseParams::default();

    for _ in 0..FRAMES {
        world.tick(|world| -> Result<()> {
            // Last frame's handles are readable for exactly this frame.
            for handle in pending.drain(..) {
                match world.query_trace_data(handle) {
                    Ok(datum) => polled_hits += usize::from(datum.has_blocking_hit()),
                    Err(e) if e.is_unavailable() => warn!("lost result: {e}"),
                    Err(e) => return Err(e.into()),
                }
            }

            for i in 0..TRACES_PER_FRAME {
                let start = random_point(&mut rng, 1.0);
                let end = random_point(&mut rng, 1.0);
                let hits = Rc::clone(&delivered_hits);

                // Every fourth query is polled instead of using a delegate.
                let handle = if i % 4 == 0 {
                    world.async_line_trace_by_channel(
                        TraceType::Single,
                        start,
                        end,
                        CollisionChannel::Visibility,
                        &query,
                        &response,
                        None,
                        i as u32,
                    )?
                } else {
                    world.async_sweep_by_channel(
                        TraceType::Multi,
                        start,
                        end,
                        Quat::IDENTITY,
                        CollisionChannel::Pawn,
                        &CollisionShape::make_capsule(0.5, 1.8),
                        &query,
                        &response,
                        Some(Box::new(move |_: &TraceHandle, d: &TraceDatum| {
                            hits.set(hits.get() + d.out_hits.len());
                        })),
                        i as u32,
                    )?
                };
                if i % 4 == 0 {
                    pending.push(handle);
                }
            }

            for _ in 0..OVERLAPS_PER_FRAME {
                let overlaps = Rc::clone(&delivered_overlaps);
                world.async_overlap_by_channel(
                    random_point(&mut rng, 1.0),
                    Quat::IDENTITY,
                    CollisionChannel::Pawn,
                    &CollisionShape::make_sphere(rng.gen_range(0.5..4.0)),
                    &query,
                    &response,
                    Some(Box::new(move |_: &TraceHandle, d: &OverlapDatum| {
                        overlaps.set(overlaps.get() + d.out_overlaps.len());
                    })),
                    0,
                )?;
            }
            Ok(())
        })?;
    }

    // Deliver the final frame before tearing down.
    world.reset_async_trace();
    world.destroy();

    let stats = world.stats();
    info!("Finished {} frames: {stats:?}", world.frame_number());
    println!(
        "{} traces, {} overlaps in {} tasks; {} swept hits and {} overlaps delivered, {} polled blocking hits",
        stats.submitted_traces,
        stats.submitted_overlaps,
        stats.dispatched_tasks,
        delivered_hits.get(),
        delivered_overlaps.get(),
        polled_hits
    );
    Ok(())
}

fn load_config() -> Result<AsyncTraceConfig> {
    let config = match std::env::args().nth(1) {
        Some(path) => AsyncTraceConfig::from_json_file(&path)?,
        None => AsyncTraceConfig::default(),
    };
    Ok(config.with_env_overrides()?)
}

fn random_point(rng: &mut impl Rng, height: f32) -> Vec3 {
    Vec3::new(
        rng.gen_range(-FIELD_HALF_SIZE..FIELD_HALF_SIZE),
        height,
        rng.gen_range(-FIELD_HALF_SIZE..FIELD_HALF_SIZE),
    )
}

/// Static walls plus a sprinkling of pawns that only overlap the visibility channel.
fn build_scene(rng: &mut impl Rng) -> RapierScene {
    let scene = RapierScene::new(RapierSceneConfig::default());
    for id in 0..OBSTACLES {
        let half_extent = Vec3::new(rng.gen_range(0.5..6.0), rng.gen_range(1.0..4.0), rng.gen_range(0.5..6.0));
        let yaw = Quat::from_rotation_y(rng.gen_range(0.0..std::f32::consts::TAU));
        let desc = if id % 8 == 0 {
            ColliderDesc::new(CollisionChannel::Pawn)
                .with_response(CollisionChannel::Visibility, CollisionResponse::Overlap)
        } else {
            ColliderDesc::new(CollisionChannel::WorldStatic)
        }
        .with_actor(ActorId(id), ComponentId(0));

        scene.add_collider(
            &CollisionShape::make_box(half_extent),
            random_point(rng, half_extent.y),
            yaw,
            desc,
        );
    }
    info!("Scene built with {} colliders", scene.len());
    scene
}

/// Sets up logging and panic reporting.
fn setup_diagnostics() {
    env_logger::Builder::new()
        .filter_level(if cfg!(debug_assertions) {
            LevelFilter::Debug
        } else {
            LevelFilter::Warn
        })
        .format_timestamp_millis()
        .format_target(false)
        .parse_default_env()
        .init();

    panic::set_hook(Box::new(|panic_info| {
        let msg = match panic_info.payload().downcast_ref::<&'static str>() {
            Some(s) => *s,
            None => match panic_info.payload().downcast_ref::<String>() {
                Some(s) => &s[..],
                None => "Box<dyn Any>",
            },
        };
        let location = panic_info
            .location()
            .map_or("unknown location".to_string(), |loc| format!("{}:{}", loc.file(), loc.line()));
        let thread = std::thread::current();

        error!(
            "panic on thread '{}': {msg} at {location}\n{}",
            thread.name().unwrap_or("<unnamed>"),
            Backtrace::capture()
        );
    }));
}
