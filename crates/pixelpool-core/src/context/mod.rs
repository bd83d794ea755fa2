//! Execution contexts: isolated, single-threaded hosts for one codec instance.
//!
//! A context never shares memory with the dispatcher. It receives
//! [`ContextCommand`]s, answers with [`ContextResponse`]s, and processes one
//! conversion at a time.
//!
//! # Transports
//!
//! - **`ThreadSpawner`** - Each context is a dedicated OS thread owning its own
//!   codec instance. Cheap to start, but a runaway codec cannot be killed.
//! - **`ProcessSpawner`** - Each context is a `pixelpool-worker` child process.
//!   Provides crash and memory isolation; terminated with a kill signal.
//!
//! ```text
//! Dispatcher
//!     │
//!     ├── ContextHandle::send(ContextCommand)   (fire and forget)
//!     │
//!     └── EventSink ← ContextEvent { Response | Exited | Malformed }
//!                         (tagged with the slot index)
//! ```

mod process;
mod thread;

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::codec::{Codec, CodecLoader};
use crate::error::Result;
use crate::job::{ConvertJob, RequestId};
use crate::protocol::{ContextCommand, ContextResponse};

pub use process::{ProcessSpawner, WORKER_PATH_ENV, find_worker_binary};
pub use thread::ThreadSpawner;

/// Something that happened to an execution context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextEvent {
    /// The context sent a message.
    Response(ContextResponse),

    /// The context stopped without being asked to.
    Exited { reason: String },

    /// The context sent something that could not be decoded.
    Malformed { reason: String },
}

/// A [`ContextEvent`] tagged with the slot it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotEvent {
    pub slot: usize,
    pub event: ContextEvent,
}

/// Delivers events from one context to the dispatcher.
#[derive(Debug, Clone)]
pub struct EventSink {
    slot: usize,
    tx: mpsc::UnboundedSender<SlotEvent>,
}

impl EventSink {
    pub fn new(slot: usize, tx: mpsc::UnboundedSender<SlotEvent>) -> Self {
        Self { slot, tx }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Send an event. Returns `false` once the dispatcher is gone.
    pub fn emit(&self, event: ContextEvent) -> bool {
        self.tx
            .send(SlotEvent {
                slot: self.slot,
                event,
            })
            .is_ok()
    }
}

/// Dispatcher-side handle to a running execution context.
pub trait ContextHandle: Send {
    /// Queue a command for the context. Never waits for the reply.
    fn send(&mut self, command: ContextCommand) -> Result<()>;

    /// Stop the context. Safe to call more than once.
    fn terminate(&mut self);
}

/// Creates execution contexts for the pool.
pub trait ContextSpawner: Send {
    fn spawn(&self, slot: usize, sink: EventSink) -> Result<Box<dyn ContextHandle>>;
}

enum CodecState {
    Unloaded,
    Loaded(Box<dyn Codec>),
    LoadFailed(String),
}

/// Message handler running inside an execution context.
///
/// Loads the codec on the first `Init` and answers conversions with it.
/// Loading is attempted at most once; a failed load is reported again on
/// every later `Init`.
pub struct ContextHandler {
    loader: Arc<dyn CodecLoader>,
    codec: CodecState,
}

impl ContextHandler {
    pub fn new(loader: Arc<dyn CodecLoader>) -> Self {
        Self {
            loader,
            codec: CodecState::Unloaded,
        }
    }

    /// Whether the codec has been loaded.
    pub fn is_initialized(&self) -> bool {
        matches!(self.codec, CodecState::Loaded(_))
    }

    /// Handle one command. Returns `None` for `Shutdown`, after which the
    /// context should exit.
    pub fn handle(&mut self, command: ContextCommand) -> Option<ContextResponse> {
        match command {
            ContextCommand::Init => Some(self.handle_init()),
            ContextCommand::Convert { request_id, job } => {
                Some(self.handle_convert(request_id, job))
            }
            ContextCommand::Shutdown => None,
        }
    }

    fn handle_init(&mut self) -> ContextResponse {
        match &self.codec {
            CodecState::Loaded(_) => return ContextResponse::Ready,
            CodecState::LoadFailed(message) => {
                return ContextResponse::unscoped_error(message.clone());
            }
            CodecState::Unloaded => {}
        }

        match self.loader.load() {
            Ok(codec) => {
                tracing::debug!("Codec loaded");
                self.codec = CodecState::Loaded(codec);
                ContextResponse::Ready
            }
            Err(e) => {
                let message = e.to_string();
                tracing::warn!("Codec failed to load: {}", message);
                self.codec = CodecState::LoadFailed(message.clone());
                ContextResponse::unscoped_error(message)
            }
        }
    }

    fn handle_convert(&mut self, request_id: RequestId, job: ConvertJob) -> ContextResponse {
        let CodecState::Loaded(codec) = &self.codec else {
            return ContextResponse::scoped_error(request_id, "Execution context is not initialized");
        };

        match panic::catch_unwind(AssertUnwindSafe(|| codec.convert(&job))) {
            Ok(Ok(output)) => ContextResponse::Output { request_id, output },
            Ok(Err(e)) => ContextResponse::scoped_error(request_id, e.to_string()),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::warn!("Codec panicked on {}: {}", request_id, message);
                ContextResponse::scoped_error(request_id, format!("codec panicked: {}", message))
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecError;
    use crate::job::ImageFormat;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Reverse;

    impl Codec for Reverse {
        fn convert(&self, job: &ConvertJob) -> std::result::Result<Vec<u8>, CodecError> {
            match job.input.as_slice() {
                b"fail" => Err(CodecError::Decode("unsupported input".to_string())),
                b"panic" => panic!("boom"),
                input => Ok(input.iter().rev().copied().collect()),
            }
        }
    }

    fn handler() -> ContextHandler {
        ContextHandler::new(Arc::new(|| -> std::result::Result<Box<dyn Codec>, CodecError> {
            Ok(Box::new(Reverse))
        }))
    }

    fn convert(input: &[u8]) -> ContextCommand {
        ContextCommand::Convert {
            request_id: RequestId::new(3),
            job: ConvertJob::new(input.to_vec(), ImageFormat::Png),
        }
    }

    #[test]
    fn test_init_then_convert() {
        let mut handler = handler();
        assert_eq!(handler.handle(ContextCommand::Init), Some(ContextResponse::Ready));
        assert!(handler.is_initialized());

        assert_eq!(
            handler.handle(convert(b"abc")),
            Some(ContextResponse::Output {
                request_id: RequestId::new(3),
                output: b"cba".to_vec(),
            })
        );
    }

    #[test]
    fn test_convert_before_init_is_scoped_error() {
        let mut handler = handler();
        let response = handler.handle(convert(b"abc"));

        assert_eq!(
            response,
            Some(ContextResponse::scoped_error(
                RequestId::new(3),
                "Execution context is not initialized"
            ))
        );
    }

    #[test]
    fn test_repeated_init_loads_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let mut handler = ContextHandler::new(Arc::new(
            move || -> std::result::Result<Box<dyn Codec>, CodecError> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(Reverse))
            },
        ));

        assert_eq!(handler.handle(ContextCommand::Init), Some(ContextResponse::Ready));
        assert_eq!(handler.handle(ContextCommand::Init), Some(ContextResponse::Ready));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_load_is_unscoped_and_not_retried() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let mut handler = ContextHandler::new(Arc::new(
            move || -> std::result::Result<Box<dyn Codec>, CodecError> {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(CodecError::Load("missing symbol".to_string()))
            },
        ));

        let expected = ContextResponse::unscoped_error("failed to load codec: missing symbol");
        assert_eq!(handler.handle(ContextCommand::Init), Some(expected.clone()));
        assert_eq!(handler.handle(ContextCommand::Init), Some(expected));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(!handler.is_initialized());
    }

    #[test]
    fn test_codec_error_is_scoped() {
        let mut handler = handler();
        handler.handle(ContextCommand::Init);

        assert_eq!(
            handler.handle(convert(b"fail")),
            Some(ContextResponse::scoped_error(
                RequestId::new(3),
                "failed to decode image: unsupported input"
            ))
        );
    }

    #[test]
    fn test_codec_panic_is_scoped() {
        let mut handler = handler();
        handler.handle(ContextCommand::Init);

        assert_eq!(
            handler.handle(convert(b"panic")),
            Some(ContextResponse::scoped_error(RequestId::new(3), "codec panicked: boom"))
        );

        // The context keeps serving after a caught panic.
        assert!(matches!(
            handler.handle(convert(b"xy")),
            Some(ContextResponse::Output { .. })
        ));
    }

    #[test]
    fn test_shutdown_has_no_reply() {
        let mut handler = handler();
        assert_eq!(handler.handle(ContextCommand::Shutdown), None);
    }
}
