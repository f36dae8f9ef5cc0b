//! Logging setup and the runtime-adjustable log level.
//!
//! RPC clients see numeric levels: 0=error, 1=warn, 2=info, 3=debug,
//! 4=trace. The binary installs an `EnvFilter` behind a reload layer so
//! `core.set_loglevel` changes what is actually emitted.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter};

const LEVEL_NAMES: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// Highest numeric level.
pub const MAX_LEVEL: u8 = 4;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("unknown log level '{0}'")]
    UnknownLevel(String),
    #[error("log level {0} out of range 0..={MAX_LEVEL}")]
    OutOfRange(i64),
    #[error("failed to apply log filter: {0}")]
    Apply(String),
}

/// Numeric level for a level name such as `debug`.
pub fn level_from_name(name: &str) -> Result<u8, LogError> {
    LEVEL_NAMES
        .iter()
        .position(|n| n.eq_ignore_ascii_case(name.trim()))
        .and_then(|pos| u8::try_from(pos).ok())
        .ok_or_else(|| LogError::UnknownLevel(name.to_string()))
}

/// Level name for a numeric level.
pub fn level_name(level: u8) -> &'static str {
    LEVEL_NAMES
        .get(usize::from(level))
        .copied()
        .unwrap_or("trace")
}

type Apply = Box<dyn Fn(&str) -> Result<(), String> + Send + Sync>;

/// Current log level, shared by the server and the `core.*` methods.
pub struct LogLevel {
    current: AtomicU8,
    apply: Option<Apply>,
}

impl LogLevel {
    /// A level that is only recorded, not wired to a subscriber.
    pub fn detached(level: u8) -> Arc<Self> {
        Arc::new(Self {
            current: AtomicU8::new(level.min(MAX_LEVEL)),
            apply: None,
        })
    }

    pub fn get(&self) -> u8 {
        self.current.load(Ordering::Relaxed)
    }

    /// Change the level, reconfiguring the subscriber if one is attached.
    pub fn set(&self, level: i64) -> Result<(), LogError> {
        let level = u8::try_from(level)
            .ok()
            .filter(|l| *l <= MAX_LEVEL)
            .ok_or(LogError::OutOfRange(level))?;
        if let Some(apply) = &self.apply {
            apply(level_name(level)).map_err(LogError::Apply)?;
        }
        self.current.store(level, Ordering::Relaxed);
        info!(level = level_name(level), "Log level changed");
        Ok(())
    }
}

/// Install the global subscriber. `RUST_LOG` takes precedence over
/// `default_level` at startup.
pub fn init(default_level: &str) -> Result<Arc<LogLevel>, LogError> {
    let level = level_from_name(default_level)?;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_name(level)));
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();

    let apply: Apply = Box::new(move |name: &str| {
        handle
            .reload(EnvFilter::new(name))
            .map_err(|e| e.to_string())
    });

    Ok(Arc::new(LogLevel {
        current: AtomicU8::new(level),
        apply: Some(apply),
    }))
}
