//! Codec module executed inside each execution context.
//!
//! The dispatcher treats the codec as a black box: bytes in, bytes out. Each
//! context loads its own instance once through a [`CodecLoader`] and keeps it
//! for the rest of its lifetime.
//!
//! # Architecture
//!
//! ```text
//! CodecLoader::load()          (once per context, may fail)
//!     │
//!     └── Box<dyn Codec>
//!             │
//!             └── convert(job) → encoded bytes | CodecError
//! ```

mod image_codec;

use thiserror::Error;

use crate::job::ConvertJob;

pub use image_codec::{ImageCodec, ImageCodecLoader};

/// Errors produced by a codec.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The codec module could not be loaded.
    #[error("failed to load codec: {0}")]
    Load(String),

    /// The input could not be decoded.
    #[error("failed to decode image: {0}")]
    Decode(String),

    /// The image could not be encoded to the requested format.
    #[error("failed to encode image: {0}")]
    Encode(String),
}

/// A loaded codec: one synchronous conversion per call.
pub trait Codec: Send {
    /// Convert the job's input according to its parameters.
    fn convert(&self, job: &ConvertJob) -> Result<Vec<u8>, CodecError>;
}

/// Loads a codec instance for one execution context.
pub trait CodecLoader: Send + Sync {
    fn load(&self) -> Result<Box<dyn Codec>, CodecError>;
}

impl<F> CodecLoader for F
where
    F: Fn() -> Result<Box<dyn Codec>, CodecError> + Send + Sync,
{
    fn load(&self) -> Result<Box<dyn Codec>, CodecError> {
        self()
    }
}
