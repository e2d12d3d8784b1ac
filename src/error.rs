// src/error.rs
//! Error handling for the async trace scheduler.
//!
//! - **Expected outcomes**: expired handles, results that are not ready yet and
//!   out-of-range handles are ordinary `Err` values. Callers poll every frame, so
//!   none of these ever panic.
//! - **Programming errors**: a submission into a closed buffer is reported as
//!   [`Error::SchedulerClosed`] and logged; the query is dropped.
//! - **Ambient**: worker pool construction and config loading errors convert with `?`.

use crate::datum::{QueryKind, TraceHandle};
use thiserror::Error;

/// Main error type. Send + Sync + 'static.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A query arrived for a frame buffer that no longer accepts work.
    #[error("async trace buffer for frame {frame} is closed to new submissions")]
    SchedulerClosed { frame: u32 },

    /// The handle is outside the two-frame validity window.
    #[error("trace handle {handle} has expired (current frame {current_frame})")]
    HandleExpired {
        handle: TraceHandle,
        current_frame: u32,
    },

    /// The handle belongs to a frame whose results have not been harvested yet.
    #[error("result for trace handle {handle} is not ready yet")]
    ResultNotReady { handle: TraceHandle },

    /// The frame is right but no query of this kind was queued at that index.
    #[error("trace handle {handle} does not address a queued {kind} query")]
    InvalidHandle { handle: TraceHandle, kind: QueryKind },

    /// The worker pool could not be created.
    #[error("failed to build async trace worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// I/O errors (config files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization of configuration.
    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// A configuration value is out of range or unparsable.
    #[error("invalid config value for `{key}`: {value}")]
    InvalidConfig { key: &'static str, value: String },

    /// Rich context chaining.
    #[error("{message}: {source}")]
    WithContext {
        message: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Add context to any error (chainable, like `.context()` in anyhow).
    #[inline]
    pub fn context<C: Into<String>>(self, context: C) -> Self {
        Self::WithContext {
            message: context.into(),
            source: Box::new(self),
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        matches!(self.root(), Error::SchedulerClosed { .. })
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        matches!(self.root(), Error::HandleExpired { .. })
    }

    #[inline]
    pub fn is_not_ready(&self) -> bool {
        matches!(self.root(), Error::ResultNotReady { .. })
    }

    /// True for the handle errors a polling caller is expected to see routinely.
    #[inline]
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self.root(),
            Error::HandleExpired { .. } | Error::ResultNotReady { .. } | Error::InvalidHandle { .. }
        )
    }

    /// Innermost error under any number of context layers.
    pub fn root(&self) -> &Error {
        let mut current = self;
        while let Error::WithContext { source, .. } = current {
            current = source;
        }
        current
    }
}

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, Error>;
