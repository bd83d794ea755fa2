//! Messages exchanged between the dispatcher and its execution contexts.
//!
//! In-process contexts receive these values directly over channels. Contexts
//! hosted in a worker process use length-prefixed rkyv frames over
//! stdin/stdout. Format: 4-byte length (u32 LE) + rkyv-encoded message.

use std::io::{Read, Write};

use rkyv::api::high::{HighSerializer, HighValidator};
use rkyv::bytecheck::CheckBytes;
use rkyv::rancor::Strategy;
use rkyv::ser::allocator::ArenaHandle;
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::job::{ConvertJob, RequestId};

/// Frames above this size are rejected before allocating.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Command sent from the dispatcher to an execution context.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum ContextCommand {
    /// Load the codec module. Answered with `Ready` or an unscoped `Error`.
    Init,

    /// Convert one image.
    Convert {
        request_id: RequestId,
        job: ConvertJob,
    },

    /// Exit the context gracefully.
    Shutdown,
}

/// Response sent from an execution context back to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum ContextResponse {
    /// The codec module is loaded. Repeated for every `Init` after the first.
    Ready,

    /// A conversion completed.
    Output {
        request_id: RequestId,
        output: Vec<u8>,
    },

    /// A failure. Without a request id the failure concerns the whole context.
    Error {
        request_id: Option<RequestId>,
        error: String,
    },
}

impl ContextResponse {
    /// Build an error scoped to one request.
    pub fn scoped_error(request_id: RequestId, error: impl Into<String>) -> Self {
        ContextResponse::Error {
            request_id: Some(request_id),
            error: error.into(),
        }
    }

    /// Build an error that concerns the whole context.
    pub fn unscoped_error(error: impl Into<String>) -> Self {
        ContextResponse::Error {
            request_id: None,
            error: error.into(),
        }
    }
}

/// Encode a message into a frame body no larger than `limit` bytes.
///
/// Fails with [`Error::FrameTooLarge`] when the encoded message is over the
/// limit, so a caller can reject it before anything reaches the stream.
pub fn encode_message<T>(message: &T, limit: usize) -> Result<AlignedVec>
where
    T: for<'a> Serialize<HighSerializer<AlignedVec, ArenaHandle<'a>, rkyv::rancor::Error>>,
{
    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(message)
        .map_err(|e| Error::Serialization(format!("Failed to encode IPC message: {}", e)))?;

    if bytes.len() > limit {
        return Err(Error::FrameTooLarge {
            len: bytes.len(),
            limit,
        });
    }
    Ok(bytes)
}

/// Encode a response, replacing an output that does not fit in a frame with
/// an error scoped to its request.
pub fn encode_response(response: &ContextResponse, limit: usize) -> Result<AlignedVec> {
    match encode_message(response, limit) {
        Err(e @ Error::FrameTooLarge { .. }) => match response {
            ContextResponse::Output { request_id, .. } => {
                encode_message(&ContextResponse::scoped_error(*request_id, e.to_string()), limit)
            }
            _ => Err(e),
        },
        other => other,
    }
}

/// Write an encoded frame body with its length prefix.
pub fn write_frame<W: Write>(writer: &mut W, body: &[u8]) -> Result<()> {
    let len = u32::try_from(body.len()).map_err(|_| Error::FrameTooLarge {
        len: body.len(),
        limit: MAX_FRAME_LEN,
    })?;
    writer
        .write_all(&len.to_le_bytes())
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message length: {}", e)))?;
    writer
        .write_all(body)
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message body: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))?;

    Ok(())
}

/// Write a message to a writer using length-prefixed rkyv encoding.
///
/// Messages over [`MAX_FRAME_LEN`] are rejected before any byte is written.
pub fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: Write,
    T: for<'a> Serialize<HighSerializer<AlignedVec, ArenaHandle<'a>, rkyv::rancor::Error>>,
{
    let body = encode_message(message, MAX_FRAME_LEN)?;
    write_frame(writer, &body)
}

/// Read a message from a reader using length-prefixed rkyv encoding.
///
/// Transport failures (including EOF) are reported as `Error::Ipc`. A frame
/// that arrives intact but does not validate is reported as
/// `Error::Serialization`.
pub fn read_message<R, T>(reader: &mut R) -> Result<T>
where
    R: Read,
    T: Archive,
    T::Archived: for<'a> CheckBytes<HighValidator<'a, rkyv::rancor::Error>>
        + Deserialize<T, Strategy<rkyv::de::Pool, rkyv::rancor::Error>>,
{
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message length: {}", e)))?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_FRAME_LEN {
        return Err(Error::Serialization(format!(
            "IPC message too large: {} bytes",
            len
        )));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message body: {}", e)))?;

    // Archived data must be aligned for validation to succeed.
    let mut aligned = AlignedVec::<16>::with_capacity(len);
    aligned.extend_from_slice(&body);

    rkyv::from_bytes::<T, rkyv::rancor::Error>(&aligned)
        .map_err(|e| Error::Serialization(format!("Failed to decode IPC message: {}", e)))
}
