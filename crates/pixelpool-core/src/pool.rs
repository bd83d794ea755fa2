//! Async handle to the worker pool.
//!
//! [`WorkerPool`] spawns an actor task that owns the [`Dispatcher`]. Caller
//! requests and context events both arrive at that task over channels and are
//! applied one at a time, so the dispatcher's bookkeeping is never touched
//! concurrently.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot, watch};

use crate::config::PoolConfig;
use crate::context::{ContextSpawner, SlotEvent};
use crate::dispatch::{Dispatcher, InitWaiter, PoolSnapshot, PoolState, Responder};
use crate::error::{Error, Result};
use crate::job::ConvertJob;

enum PoolCommand {
    Init(InitWaiter),
    Submit {
        job: ConvertJob,
        responder: Responder,
    },
    Snapshot(oneshot::Sender<PoolSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// A fixed-size pool of execution contexts converting images in parallel.
///
/// Must be created inside a tokio runtime. Dropping the pool shuts it down.
///
/// # Example
///
/// ```no_run
/// use pixelpool_core::{ConvertJob, ImageFormat, PoolConfig, WorkerPool};
///
/// # async fn example(png: Vec<u8>) -> pixelpool_core::Result<()> {
/// let pool = WorkerPool::new(&PoolConfig::default().with_concurrency(2));
/// pool.init().await?;
///
/// let webp = pool.submit(ConvertJob::new(png, ImageFormat::Webp)).await?;
/// println!("converted to {} bytes", webp.len());
///
/// pool.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct WorkerPool {
    size: usize,
    commands: mpsc::UnboundedSender<PoolCommand>,
    state: watch::Receiver<PoolState>,
}

impl WorkerPool {
    /// Create a pool from configuration. Contexts start on [`init`](Self::init).
    pub fn new(config: &PoolConfig) -> Self {
        Self::with_spawner(config.size, config.spawner())
    }

    /// Create a pool of `size` contexts (at least one) made by `spawner`.
    pub fn with_spawner(size: usize, spawner: Box<dyn ContextSpawner>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let dispatcher = Dispatcher::new(size, spawner, events_tx);
        let size = dispatcher.size();
        let state = dispatcher.subscribe();

        tokio::spawn(run_dispatcher(dispatcher, commands_rx, events_rx));

        Self {
            size,
            commands: commands_tx,
            state,
        }
    }

    /// Number of execution contexts.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PoolState {
        *self.state.borrow()
    }

    /// Start every context and wait until all of them are ready.
    ///
    /// Concurrent calls share one initialization. Calling again after success
    /// returns immediately.
    pub async fn init(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(PoolCommand::Init(tx))
            .map_err(|_| Error::Destroyed)?;
        rx.await.map_err(|_| Error::Destroyed)?
    }

    /// Submit a conversion.
    ///
    /// Returns immediately. The returned future resolves with the converted
    /// bytes or the job's error. Dropping it abandons the job: a queued job
    /// is never started and a running job's result is discarded.
    pub fn submit(&self, job: ConvertJob) -> Conversion {
        match self.state() {
            PoolState::Ready => {}
            PoolState::Destroyed => return Conversion::failed(Error::Destroyed),
            _ => return Conversion::failed(Error::NotInitialized),
        }

        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(PoolCommand::Submit { job, responder: tx })
            .is_err()
        {
            return Conversion::failed(Error::Destroyed);
        }
        Conversion::pending(rx)
    }

    /// Fail all outstanding work and stop every context. Idempotent.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(PoolCommand::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Inspect slots, backlog and in-flight count.
    pub async fn snapshot(&self) -> Result<PoolSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(PoolCommand::Snapshot(tx))
            .map_err(|_| Error::Destroyed)?;
        rx.await.map_err(|_| Error::Destroyed)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let (tx, _rx) = oneshot::channel();
        let _ = self.commands.send(PoolCommand::Shutdown(tx));
    }
}

async fn run_dispatcher(
    mut dispatcher: Dispatcher,
    mut commands: mpsc::UnboundedReceiver<PoolCommand>,
    mut events: mpsc::UnboundedReceiver<SlotEvent>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => handle_command(&mut dispatcher, command),
                None => break,
            },
            Some(event) = events.recv() => dispatcher.handle_event(event),
        }
    }

    dispatcher.shutdown();
    tracing::debug!("Worker pool dispatcher stopped");
}

fn handle_command(dispatcher: &mut Dispatcher, command: PoolCommand) {
    match command {
        PoolCommand::Init(waiter) => dispatcher.init(waiter),
        PoolCommand::Submit { job, responder } => {
            dispatcher.submit(job, responder);
        }
        PoolCommand::Snapshot(reply) => {
            let _ = reply.send(dispatcher.snapshot());
        }
        PoolCommand::Shutdown(done) => {
            dispatcher.shutdown();
            let _ = done.send(());
        }
    }
}

/// Future of one submitted conversion. Settles exactly once.
#[must_use = "dropping a Conversion abandons the job"]
pub struct Conversion {
    inner: ConversionInner,
}

enum ConversionInner {
    Pending(oneshot::Receiver<Result<Vec<u8>>>),
    Failed(Option<Error>),
}

impl Conversion {
    fn pending(rx: oneshot::Receiver<Result<Vec<u8>>>) -> Self {
        Self {
            inner: ConversionInner::Pending(rx),
        }
    }

    fn failed(error: Error) -> Self {
        Self {
            inner: ConversionInner::Failed(Some(error)),
        }
    }
}

impl Future for Conversion {
    type Output = Result<Vec<u8>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            ConversionInner::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|received| received.unwrap_or_else(|_| Err(Error::Destroyed))),
            ConversionInner::Failed(error) => {
                Poll::Ready(Err(error.take().unwrap_or(Error::Destroyed)))
            }
        }
    }
}
