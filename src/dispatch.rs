//! Chunk dispatch: worker pool, completion tokens and shared metrics.
//!
//! A dispatched chunk is executed by exactly one task, front to back. The
//! task holds the chunk's lock for its whole run and signals its token when
//! done, so the driver never observes a half-executed chunk.

use crate::config::AsyncTraceConfig;
use crate::datum::{ExecuteOutcome, QueryDatum};
use crate::Result;
use crossbeam::channel::{bounded, Receiver, TryRecvError};
use log::{debug, warn};
use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A fixed-capacity run of datums, shared between the buffer and one task.
pub(crate) type Chunk<D> = Arc<Mutex<Vec<D>>>;

// ============================================================================
// 1. METRICS
// ============================================================================

/// Counters shared by the scheduler and its worker tasks.
#[derive(Debug, Default)]
pub struct AsyncTraceMetrics {
    pub submitted_traces: AtomicUsize,
    pub submitted_overlaps: AtomicUsize,
    pub rejected_submissions: AtomicUsize,
    pub dispatched_tasks: AtomicUsize,
    pub executed_datums: AtomicUsize,
    pub stale_world_skips: AtomicUsize,
    pub delegates_fired: AtomicUsize,
}

/// Point-in-time copy of [`AsyncTraceMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AsyncTraceStats {
    pub submitted_traces: usize,
    pub submitted_overlaps: usize,
    pub rejected_submissions: usize,
    pub dispatched_tasks: usize,
    pub executed_datums: usize,
    pub stale_world_skips: usize,
    pub delegates_fired: usize,
}

impl AsyncTraceMetrics {
    #[inline]
    pub(crate) fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AsyncTraceStats {
        AsyncTraceStats {
            submitted_traces: self.submitted_traces.load(Ordering::Relaxed),
            submitted_overlaps: self.submitted_overlaps.load(Ordering::Relaxed),
            rejected_submissions: self.rejected_submissions.load(Ordering::Relaxed),
            dispatched_tasks: self.dispatched_tasks.load(Ordering::Relaxed),
            executed_datums: self.executed_datums.load(Ordering::Relaxed),
            stale_world_skips: self.stale_world_skips.load(Ordering::Relaxed),
            delegates_fired: self.delegates_fired.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// 2. COMPLETION TOKEN
// ============================================================================

/// Signalled once the task executing a chunk has finished.
///
/// A task that panicked drops its sender without sending; that also counts
/// as finished.
#[derive(Debug)]
pub(crate) struct TaskToken {
    done: Option<Receiver<()>>,
}

impl TaskToken {
    pub(crate) fn completed() -> Self {
        Self { done: None }
    }

    fn pending(done: Receiver<()>) -> Self {
        Self { done: Some(done) }
    }

    pub(crate) fn is_complete(&mut self) -> bool {
        let finished = match &self.done {
            None => return true,
            Some(rx) => !matches!(rx.try_recv(), Err(TryRecvError::Empty)),
        };
        if finished {
            self.done = None;
        }
        finished
    }

    /// Blocks until the task is done.
    pub(crate) fn wait(&mut self) {
        if let Some(rx) = self.done.take() {
            // Err means the sender was dropped by a panicking task
            let _ = rx.recv();
        }
    }
}

// ============================================================================
// 3. DISPATCHER
// ============================================================================

/// Runs chunks either on a dedicated rayon pool or inline.
pub(crate) struct TraceDispatcher {
    pool: Option<ThreadPool>,
    epsilon: f32,
    metrics: Arc<AsyncTraceMetrics>,
}

impl TraceDispatcher {
    pub(crate) fn new(config: &AsyncTraceConfig, metrics: Arc<AsyncTraceMetrics>) -> Result<Self> {
        let pool = if config.run_on_worker_threads {
            let prefix = config.thread_name_prefix.clone();
            let pool = ThreadPoolBuilder::new()
                .num_threads(config.worker_threads)
                .thread_name(move |i| format!("{prefix}-{i}"))
                .panic_handler(|_| warn!("async trace task panicked; its chunk keeps partial results"))
                .build()?;
            debug!("async trace pool started with {} threads", pool.current_num_threads());
            Some(pool)
        } else {
            None
        };

        Ok(Self {
            pool,
            epsilon: config.degenerate_shape_epsilon,
            metrics,
        })
    }

    #[inline]
    pub(crate) fn is_threaded(&self) -> bool {
        self.pool.is_some()
    }

    /// Hands one chunk to a task. `frame` and `chunk_index` are for logging only.
    pub(crate) fn dispatch<D: QueryDatum>(&self, chunk: Chunk<D>, frame: u32, chunk_index: usize) -> TaskToken {
        AsyncTraceMetrics::bump(&self.metrics.dispatched_tasks);
        debug!(
            "dispatching {} chunk {} of frame {} ({} datums)",
            D::KIND,
            chunk_index,
            frame,
            chunk.lock().len()
        );

        let Some(pool) = &self.pool else {
            run_chunk(&chunk, self.epsilon, &self.metrics);
            return TaskToken::completed();
        };

        let (tx, rx) = bounded(1);
        let epsilon = self.epsilon;
        let metrics = Arc::clone(&self.metrics);
        pool.spawn(move || {
            run_chunk(&chunk, epsilon, &metrics);
            let _ = tx.send(());
        });
        TaskToken::pending(rx)
    }
}

fn run_chunk<D: QueryDatum>(chunk: &Mutex<Vec<D>>, epsilon: f32, metrics: &AsyncTraceMetrics) {
    let mut datums = chunk.lock();
    for datum in datums.iter_mut() {
        match datum.execute(epsilon) {
            ExecuteOutcome::Executed => AsyncTraceMetrics::bump(&metrics.executed_datums),
            ExecuteOutcome::StaleWorld => {
                AsyncTraceMetrics::bump(&metrics.stale_world_skips);
                debug!("skipping {} query: world is gone", D::KIND);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::RecordingBackend;
    use crate::backend::{CollisionBackend, WorldRef};
    use crate::collision::{CollisionChannel, CollisionParameters};
    use crate::datum::{TraceDatum, TraceRequest, TraceType};
    use glam::Vec3;

    fn chunk_of(world: &WorldRef, n: usize) -> Chunk<TraceDatum> {
        let datums = (0..n)
            .map(|i| {
                TraceRequest::line(
                    world.clone(),
                    TraceType::Single,
                    Vec3::new(i as f32, 0.0, 0.0),
                    Vec3::new(i as f32, 10.0, 0.0),
                    CollisionChannel::Visibility,
                    CollisionParameters::default(),
                )
                .into_datum(0)
            })
            .collect();
        Arc::new(Mutex::new(datums))
    }

    #[test]
    fn test_threaded_dispatch_runs_on_named_worker() {
        let backend = Arc::new(RecordingBackend::new());
        let dyn_backend: Arc<dyn CollisionBackend> = backend.clone();
        let world = Arc::downgrade(&dyn_backend);
        let metrics = Arc::new(AsyncTraceMetrics::default());
        let config = AsyncTraceConfig {
            worker_threads: 2,
            thread_name_prefix: "trace-test".into(),
            ..AsyncTraceConfig::default()
        };
        let dispatcher = TraceDispatcher::new(&config, Arc::clone(&metrics)).unwrap();
        assert!(dispatcher.is_threaded());

        let chunk = chunk_of(&world, 8);
        let mut token = dispatcher.dispatch(Arc::clone(&chunk), 0, 0);
        token.wait();
        assert!(token.is_complete());

        assert!(chunk.lock().iter().all(|d| d.has_blocking_hit()));
        let calls = backend.calls();
        assert_eq!(calls.len(), 8);
        // submission order within a chunk
        assert!(calls.windows(2).all(|w| w[0].start.x < w[1].start.x));
        assert_ne!(calls[0].thread, std::thread::current().id());

        let stats = metrics.snapshot();
        assert_eq!(stats.dispatched_tasks, 1);
        assert_eq!(stats.executed_datums, 8);
    }

    #[test]
    fn test_inline_dispatch_and_stale_world() {
        let backend: Arc<dyn CollisionBackend> = Arc::new(RecordingBackend::new());
        let world = Arc::downgrade(&backend);
        drop(backend);

        let metrics = Arc::new(AsyncTraceMetrics::default());
        let dispatcher = TraceDispatcher::new(&AsyncTraceConfig::synchronous(), Arc::clone(&metrics)).unwrap();
        assert!(!dispatcher.is_threaded());

        let chunk = chunk_of(&world, 3);
        let mut token = dispatcher.dispatch(Arc::clone(&chunk), 0, 0);
        assert!(token.is_complete());
        assert!(chunk.lock().iter().all(|d| d.out_hits.is_empty()));
        assert_eq!(metrics.snapshot().stale_world_skips, 3);
    }

    #[test]
    fn test_dropped_sender_completes_token() {
        let (tx, rx) = bounded::<()>(1);
        let mut token = TaskToken::pending(rx);
        assert!(!token.is_complete());
        drop(tx);
        token.wait();
        assert!(token.is_complete());
    }
}
