//! Execution contexts hosted on dedicated OS threads.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use super::{ContextEvent, ContextHandle, ContextHandler, ContextSpawner, EventSink};
use crate::codec::{CodecLoader, ImageCodecLoader};
use crate::error::{Error, Result};
use crate::protocol::ContextCommand;

/// Spawns one thread per execution context, each with its own codec.
#[derive(Clone)]
pub struct ThreadSpawner {
    loader: Arc<dyn CodecLoader>,
}

impl ThreadSpawner {
    pub fn new(loader: impl CodecLoader + 'static) -> Self {
        Self {
            loader: Arc::new(loader),
        }
    }
}

impl Default for ThreadSpawner {
    fn default() -> Self {
        Self::new(ImageCodecLoader)
    }
}

impl ContextSpawner for ThreadSpawner {
    fn spawn(&self, slot: usize, sink: EventSink) -> Result<Box<dyn ContextHandle>> {
        let (tx, rx) = mpsc::channel();
        let handler = ContextHandler::new(self.loader.clone());

        thread::Builder::new()
            .name(format!("pixelpool-context-{}", slot))
            .spawn(move || run_context(handler, rx, sink))
            .map_err(|e| Error::Io(format!("Failed to spawn context thread {}: {}", slot, e)))?;

        Ok(Box::new(ThreadContext {
            slot,
            commands: Some(tx),
        }))
    }
}

/// Handle to a context thread.
///
/// Terminating drops the command channel; the thread exits once its current
/// conversion (if any) returns. A running codec call cannot be preempted.
struct ThreadContext {
    slot: usize,
    commands: Option<Sender<ContextCommand>>,
}

impl ContextHandle for ThreadContext {
    fn send(&mut self, command: ContextCommand) -> Result<()> {
        let commands = self
            .commands
            .as_ref()
            .ok_or_else(|| Error::Ipc(format!("Execution context {} was terminated", self.slot)))?;
        commands
            .send(command)
            .map_err(|_| Error::Ipc(format!("Execution context {} has exited", self.slot)))
    }

    fn terminate(&mut self) {
        if self.commands.take().is_some() {
            tracing::debug!("Terminating context thread {}", self.slot);
        }
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn run_context(mut handler: ContextHandler, commands: Receiver<ContextCommand>, sink: EventSink) {
    let _guard = PanicGuard { sink: sink.clone() };

    while let Ok(command) = commands.recv() {
        let Some(response) = handler.handle(command) else {
            break;
        };
        if !sink.emit(ContextEvent::Response(response)) {
            break;
        }
    }

    tracing::debug!("Context thread {} exiting", sink.slot());
}

/// Reports the thread as exited if it unwinds.
struct PanicGuard {
    sink: EventSink,
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            self.sink.emit(ContextEvent::Exited {
                reason: format!("execution context thread {} panicked", self.sink.slot()),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Codec, CodecError};
    use crate::context::SlotEvent;
    use crate::job::{ConvertJob, ImageFormat, RequestId};
    use crate::protocol::ContextResponse;

    struct Echo;

    impl Codec for Echo {
        fn convert(&self, job: &ConvertJob) -> std::result::Result<Vec<u8>, CodecError> {
            Ok(job.input.clone())
        }
    }

    fn echo_spawner() -> ThreadSpawner {
        ThreadSpawner::new(|| -> std::result::Result<Box<dyn Codec>, CodecError> { Ok(Box::new(Echo)) })
    }

    #[tokio::test]
    async fn test_thread_context_roundtrip() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut context = echo_spawner().spawn(2, EventSink::new(2, tx)).unwrap();

        context.send(ContextCommand::Init).unwrap();
        context
            .send(ContextCommand::Convert {
                request_id: RequestId::new(1),
                job: ConvertJob::new(vec![9, 8, 7], ImageFormat::Png),
            })
            .unwrap();

        assert_eq!(
            rx.recv().await,
            Some(SlotEvent {
                slot: 2,
                event: ContextEvent::Response(ContextResponse::Ready),
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(SlotEvent {
                slot: 2,
                event: ContextEvent::Response(ContextResponse::Output {
                    request_id: RequestId::new(1),
                    output: vec![9, 8, 7],
                }),
            })
        );
    }

    #[tokio::test]
    async fn test_send_after_terminate_fails() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mut context = echo_spawner().spawn(0, EventSink::new(0, tx)).unwrap();

        context.terminate();
        context.terminate();
        assert!(matches!(context.send(ContextCommand::Init), Err(Error::Ipc(_))));
    }
}
