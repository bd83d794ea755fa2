//! Pool configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::context::{ContextSpawner, ProcessSpawner, ThreadSpawner};

/// Concurrency used when none is requested.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Environment variable overriding the pool size.
pub const WORKERS_ENV: &str = "PIXELPOOL_WORKERS";

/// Environment variable selecting the isolation mode.
pub const ISOLATION_ENV: &str = "PIXELPOOL_ISOLATION";

/// How execution contexts are hosted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// One OS thread per context.
    #[default]
    Thread,
    /// One `pixelpool-worker` process per context.
    Process,
}

impl fmt::Display for Isolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Isolation::Thread => f.write_str("thread"),
            Isolation::Process => f.write_str("process"),
        }
    }
}

impl FromStr for Isolation {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "thread" => Ok(Isolation::Thread),
            "process" => Ok(Isolation::Process),
            other => Err(format!("unknown isolation mode: {}", other)),
        }
    }
}

/// Configuration for a [`WorkerPool`](crate::WorkerPool).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of execution contexts. Always at least 1.
    pub size: usize,
    pub isolation: Isolation,
    /// Worker binary for process isolation. Discovered when `None`.
    pub worker_path: Option<PathBuf>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: clamp_concurrency(DEFAULT_CONCURRENCY),
            isolation: Isolation::default(),
            worker_path: None,
        }
    }
}

impl PoolConfig {
    /// Defaults overridden by `PIXELPOOL_WORKERS`, `PIXELPOOL_ISOLATION`
    /// and `PIXELPOOL_WORKER_PATH`. Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(value) = std::env::var(WORKERS_ENV) {
            match value.trim().parse::<usize>() {
                Ok(n) => config = config.with_concurrency(n),
                Err(_) => tracing::warn!("Ignoring invalid {}={}", WORKERS_ENV, value),
            }
        }

        if let Ok(value) = std::env::var(ISOLATION_ENV) {
            match value.parse() {
                Ok(isolation) => config.isolation = isolation,
                Err(e) => tracing::warn!("Ignoring {}: {}", ISOLATION_ENV, e),
            }
        }

        if let Ok(path) = std::env::var(crate::context::WORKER_PATH_ENV) {
            config.worker_path = Some(PathBuf::from(path));
        }

        config
    }

    /// Request a concurrency level, clamped to `1..=available_parallelism()`.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.size = clamp_concurrency(concurrency);
        self
    }

    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_worker_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.worker_path = Some(path.into());
        self
    }

    /// Build the context spawner for this configuration.
    pub fn spawner(&self) -> Box<dyn ContextSpawner> {
        match self.isolation {
            Isolation::Thread => Box::new(ThreadSpawner::default()),
            Isolation::Process => Box::new(ProcessSpawner::new(self.worker_path.clone())),
        }
    }
}

/// Parallelism available to this process, at least 1.
pub fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Clamp a requested concurrency to what the host can run in parallel.
pub fn clamp_concurrency(requested: usize) -> usize {
    requested.clamp(1, available_parallelism())
}
