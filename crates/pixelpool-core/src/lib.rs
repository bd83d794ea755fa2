//! Core engine for Pixelpool local image conversion.
//!
//! This crate provides:
//! - A fixed-size pool of isolated execution contexts (threads or processes)
//! - FIFO dispatch of conversion jobs with at most one job per context
//! - Request correlation, scoped and pool-wide failure handling
//! - The rkyv wire protocol spoken between dispatcher and worker processes
//! - An `image`-backed codec for WebP, PNG and JPEG output

pub mod codec;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod job;
pub mod pool;
pub mod protocol;

pub use codec::{Codec, CodecError, CodecLoader, ImageCodec, ImageCodecLoader};
pub use config::{DEFAULT_CONCURRENCY, Isolation, PoolConfig};
pub use context::{
    ContextEvent, ContextHandle, ContextHandler, ContextSpawner, EventSink, ProcessSpawner,
    SlotEvent, ThreadSpawner,
};
pub use dispatch::{PoolSnapshot, PoolState, SlotSnapshot};
pub use error::{Error, Result};
pub use job::{ConvertJob, ImageFormat, RequestId, UnknownFormat};
pub use pool::{Conversion, WorkerPool};
pub use protocol::{ContextCommand, ContextResponse};
