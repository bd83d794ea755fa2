//! Execution contexts hosted in `pixelpool-worker` child processes.
//!
//! Each context owns three things: the child process, a writer thread that
//! feeds commands into the child's stdin, and a reader thread that decodes
//! responses from its stdout and forwards them to the dispatcher.

use std::io::{BufReader, BufWriter, Read};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use rkyv::util::AlignedVec;

use super::{ContextEvent, ContextHandle, ContextSpawner, EventSink};
use crate::error::{Error, Result};
use crate::protocol::{
    ContextCommand, ContextResponse, MAX_FRAME_LEN, encode_message, read_message, write_frame,
};

/// Environment variable overriding the worker binary location.
pub const WORKER_PATH_ENV: &str = "PIXELPOOL_WORKER_PATH";

const WORKER_NAME: &str = if cfg!(windows) {
    "pixelpool-worker.exe"
} else {
    "pixelpool-worker"
};

/// Spawns one worker process per execution context.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpawner {
    worker_path: Option<PathBuf>,
}

impl ProcessSpawner {
    /// Use an explicit worker binary, or discover one with
    /// [`find_worker_binary`] when `None`.
    pub fn new(worker_path: Option<PathBuf>) -> Self {
        Self { worker_path }
    }
}

impl ContextSpawner for ProcessSpawner {
    fn spawn(&self, slot: usize, sink: EventSink) -> Result<Box<dyn ContextHandle>> {
        let worker_path = match &self.worker_path {
            Some(path) => path.clone(),
            None => find_worker_binary()?,
        };

        let child = Command::new(&worker_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Let worker logs pass through
            .spawn()
            .map_err(|e| {
                Error::Ipc(format!(
                    "Failed to spawn worker process '{}': {}",
                    worker_path.display(),
                    e
                ))
            })?;

        let context = ProcessContext::start(slot, child, sink, MAX_FRAME_LEN)?;
        tracing::debug!(
            "Spawned worker process {} for slot {}",
            context.child.id(),
            slot
        );
        Ok(Box::new(context))
    }
}

/// Handle to a worker process.
struct ProcessContext {
    slot: usize,
    child: Child,
    /// Encoded commands for the writer thread.
    frames: Option<Sender<AlignedVec>>,
    max_frame_len: usize,
    /// Set before the child is stopped so the reader stays quiet about EOF.
    terminating: Arc<AtomicBool>,
}

impl ProcessContext {
    /// Attach the writer and reader threads to a freshly spawned child.
    fn start(slot: usize, mut child: Child, sink: EventSink, max_frame_len: usize) -> Result<Self> {
        let pipes = child.stdin.take().zip(child.stdout.take());
        let Some((stdin, stdout)) = pipes else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Ipc(format!(
                "Failed to get stdio pipes for worker {}",
                slot
            )));
        };

        let terminating = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        let writer = thread::Builder::new()
            .name(format!("pixelpool-writer-{}", slot))
            .spawn(move || write_commands(slot, rx, stdin));
        let reader_flag = terminating.clone();
        let reader = thread::Builder::new()
            .name(format!("pixelpool-reader-{}", slot))
            .spawn(move || read_responses(stdout, sink, reader_flag));

        if let Err(e) = writer.and(reader) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Io(format!(
                "Failed to spawn IPC threads for worker {}: {}",
                slot, e
            )));
        }

        Ok(Self {
            slot,
            child,
            frames: Some(tx),
            max_frame_len,
            terminating,
        })
    }
}

impl ContextHandle for ProcessContext {
    fn send(&mut self, command: ContextCommand) -> Result<()> {
        let frames = self
            .frames
            .as_ref()
            .ok_or_else(|| Error::Ipc(format!("Worker {} was terminated", self.slot)))?;
        // Encoded here so an oversized command is refused before it is queued.
        let frame = encode_message(&command, self.max_frame_len)?;
        frames
            .send(frame)
            .map_err(|_| Error::Ipc(format!("Worker {} stdin is closed", self.slot)))
    }

    fn terminate(&mut self) {
        if self.terminating.swap(true, Ordering::SeqCst) {
            return;
        }

        // Ask for a graceful exit, then kill whatever is still running.
        if let Some(frames) = self.frames.take() {
            if let Ok(frame) = encode_message(&ContextCommand::Shutdown, self.max_frame_len) {
                let _ = frames.send(frame);
            }
        }

        if !matches!(self.child.try_wait(), Ok(Some(_))) {
            if let Err(e) = self.child.kill() {
                if e.kind() != std::io::ErrorKind::InvalidInput {
                    tracing::warn!("Failed to kill worker {}: {}", self.slot, e);
                }
            }
        }

        // Reap the zombie
        let _ = self.child.wait();
    }
}

impl Drop for ProcessContext {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Feed encoded commands into the child's stdin until the handle goes away.
fn write_commands(slot: usize, frames: Receiver<AlignedVec>, stdin: ChildStdin) {
    let mut stdin = BufWriter::new(stdin);

    while let Ok(frame) = frames.recv() {
        if let Err(e) = write_frame(&mut stdin, &frame) {
            // The reader observes the dead pipe and reports it.
            tracing::debug!("Worker {} stdin write failed: {}", slot, e);
            break;
        }
    }
}

fn read_responses<R: Read>(stdout: R, sink: EventSink, terminating: Arc<AtomicBool>) {
    let mut stdout = BufReader::new(stdout);

    loop {
        match read_message::<_, ContextResponse>(&mut stdout) {
            Ok(response) => {
                if !sink.emit(ContextEvent::Response(response)) {
                    return;
                }
            }
            Err(e) => {
                if terminating.load(Ordering::SeqCst) {
                    return;
                }
                let event = match e {
                    Error::Serialization(reason) => ContextEvent::Malformed { reason },
                    other => ContextEvent::Exited {
                        reason: format!("worker process exited unexpectedly: {}", other),
                    },
                };
                sink.emit(event);
                return;
            }
        }
    }
}

/// Find the pixelpool-worker binary path.
///
/// Looks in the following order:
/// 1. `PIXELPOOL_WORKER_PATH` environment variable
/// 2. Same directory as the current executable (and its parent, for test
///    binaries under `target/<profile>/deps`)
/// 3. System PATH
/// 4. The workspace `target/debug` or `target/release` directory
pub fn find_worker_binary() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(WORKER_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
    }

    if let Ok(exe_path) = std::env::current_exe() {
        for dir in exe_path.ancestors().skip(1).take(2) {
            let worker_path = dir.join(WORKER_NAME);
            if worker_path.exists() {
                return Ok(worker_path);
            }
        }
    }

    if let Ok(path) = which::which(WORKER_NAME) {
        return Ok(path);
    }

    if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
        for profile in ["debug", "release"] {
            let path = PathBuf::from(&manifest_dir)
                .join("..")
                .join("..")
                .join("target")
                .join(profile)
                .join(WORKER_NAME);
            if path.exists() {
                return Ok(path.canonicalize().unwrap_or(path));
            }
        }
    }

    Err(Error::Ipc(format!(
        "Could not find {} binary. Set {} or ensure it's in PATH.",
        WORKER_NAME, WORKER_PATH_ENV
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SlotEvent;
    use crate::job::{ConvertJob, ImageFormat, RequestId};
    use std::io::Cursor;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn sink(slot: usize) -> (EventSink, UnboundedReceiver<SlotEvent>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (EventSink::new(slot, tx), rx)
    }

    fn drain(mut rx: UnboundedReceiver<SlotEvent>) -> Vec<ContextEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.blocking_recv() {
            events.push(event.event);
        }
        events
    }

    #[test]
    fn test_reader_forwards_responses_then_reports_exit() {
        let mut stream = Vec::new();
        crate::protocol::write_message(&mut stream, &ContextResponse::Ready).unwrap();
        let (sink, rx) = sink(2);

        read_responses(Cursor::new(stream), sink, Arc::new(AtomicBool::new(false)));

        let events = drain(rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], ContextEvent::Response(ContextResponse::Ready));
        assert!(matches!(events[1], ContextEvent::Exited { .. }));
    }

    #[test]
    fn test_reader_reports_malformed_frame() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&4u32.to_le_bytes());
        stream.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        let (sink, rx) = sink(0);

        read_responses(Cursor::new(stream), sink, Arc::new(AtomicBool::new(false)));

        let events = drain(rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ContextEvent::Malformed { .. }));
    }

    #[test]
    fn test_reader_is_quiet_while_terminating() {
        let (sink, rx) = sink(0);

        read_responses(Cursor::new(Vec::new()), sink, Arc::new(AtomicBool::new(true)));

        assert!(drain(rx).is_empty());
    }

    #[cfg(unix)]
    fn start_child(
        program: &str,
        args: &[&str],
        max_frame_len: usize,
    ) -> (ProcessContext, UnboundedReceiver<SlotEvent>) {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let (sink, rx) = sink(0);
        let context = ProcessContext::start(0, child, sink, max_frame_len).unwrap();
        (context, rx)
    }

    #[cfg(unix)]
    #[test]
    fn test_child_exit_is_reported() {
        let (_context, rx) = start_child("true", &[], MAX_FRAME_LEN);

        let events = drain(rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ContextEvent::Exited { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_oversized_command_is_refused_and_terminate_is_quiet() {
        let (mut context, rx) = start_child("sleep", &["30"], 256);

        let big = ContextCommand::Convert {
            request_id: RequestId::new(1),
            job: ConvertJob::new(vec![0; 1024], ImageFormat::Png),
        };
        assert!(matches!(
            context.send(big),
            Err(Error::FrameTooLarge { limit: 256, .. })
        ));

        let small = ContextCommand::Convert {
            request_id: RequestId::new(2),
            job: ConvertJob::new(vec![0; 8], ImageFormat::Png),
        };
        context.send(small).unwrap();

        context.terminate();
        context.terminate();
        assert!(drain(rx).is_empty());
        assert!(matches!(context.send(ContextCommand::Init), Err(Error::Ipc(_))));
    }

    #[test]
    fn test_missing_explicit_worker_fails_to_spawn() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let spawner = ProcessSpawner::new(Some(PathBuf::from("/nonexistent/pixelpool-worker")));

        let result = spawner.spawn(0, EventSink::new(0, tx));
        assert!(matches!(result, Err(Error::Ipc(_))));
    }

    // Note: this test requires the pixelpool-worker binary to be built.
    // Run `cargo build -p pixelpool-worker` first.
    #[tokio::test]
    #[ignore = "Requires pixelpool-worker binary"]
    async fn test_worker_process_ready() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut context = ProcessSpawner::default()
            .spawn(0, EventSink::new(0, tx))
            .unwrap();

        context.send(ContextCommand::Init).unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event, ContextEvent::Response(ContextResponse::Ready));

        context.terminate();
    }
}
