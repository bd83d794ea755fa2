//! Dispatcher state machine for the worker pool.
//!
//! The [`Dispatcher`] is the single owner of every piece of pool bookkeeping:
//! the context slots, the FIFO backlog, the map of in-flight requests and the
//! init waiters. It performs no I/O of its own beyond handing commands to
//! context handles and settling oneshot channels, and it is driven one call at
//! a time by the pool actor, so no locking is needed.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized ──init()──▶ Initializing ──all slots ready──▶ Ready
//!                                │                              │
//!                     startup or context failure      shutdown() or context failure
//!                                ▼                              ▼
//!                              Failed ─────shutdown()─────▶ Destroyed
//! ```
//!
//! # Dispatch pass
//!
//! Runs after every readiness event and every settlement. Slots are scanned
//! in index order; each slot that is ready and idle takes the head of the
//! backlog. Jobs are therefore started in submission order, but a fast slot
//! may serve more jobs than a slow one.

use std::collections::VecDeque;
use std::fmt;

use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot, watch};

use crate::context::{ContextEvent, ContextHandle, ContextSpawner, EventSink, SlotEvent};
use crate::error::{Error, Result};
use crate::job::{ConvertJob, RequestId};
use crate::protocol::{ContextCommand, ContextResponse};

/// Settles one conversion.
pub type Responder = oneshot::Sender<Result<Vec<u8>>>;

/// Settles one `init` call.
pub type InitWaiter = oneshot::Sender<Result<()>>;

/// Lifecycle of the pool as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolState {
    Uninitialized,
    Initializing,
    /// Every slot has reported ready; submissions are accepted.
    Ready,
    /// Initialization failed. A new pool is needed.
    Failed,
    /// Shut down, or torn down after an unattributed context failure.
    Destroyed,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoolState::Uninitialized => "uninitialized",
            PoolState::Initializing => "initializing",
            PoolState::Ready => "ready",
            PoolState::Failed => "failed",
            PoolState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub ready: bool,
    pub busy: bool,
    /// The request currently assigned to this slot.
    pub request: Option<RequestId>,
}

/// Point-in-time view of the whole dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub state: PoolState,
    pub slots: Vec<SlotSnapshot>,
    /// Queued requests, head first.
    pub queued: Vec<RequestId>,
    /// Requests that have not settled yet, queued or assigned.
    pub in_flight: usize,
}

impl PoolSnapshot {
    /// Requests currently assigned to a slot, in slot order.
    pub fn assigned(&self) -> Vec<RequestId> {
        self.slots.iter().filter_map(|slot| slot.request).collect()
    }
}

/// Bookkeeping for one execution context.
struct ContextSlot {
    handle: Box<dyn ContextHandle>,
    ready: bool,
    /// At most one job runs per slot.
    assigned: Option<RequestId>,
}

impl ContextSlot {
    fn is_busy(&self) -> bool {
        self.assigned.is_some()
    }

    fn is_free(&self) -> bool {
        self.ready && !self.is_busy()
    }
}

struct PendingEntry {
    /// Slot running the job, `None` while it waits in the backlog.
    slot: Option<usize>,
    responder: Responder,
}

struct QueuedJob {
    request_id: RequestId,
    job: ConvertJob,
}

/// Owns the pool's slots, backlog and in-flight requests.
pub struct Dispatcher {
    size: usize,
    state: PoolState,
    state_tx: watch::Sender<PoolState>,
    /// Why initialization failed, reported to later `init` calls.
    failure: Option<String>,
    spawner: Box<dyn ContextSpawner>,
    events: mpsc::UnboundedSender<SlotEvent>,
    slots: Vec<ContextSlot>,
    backlog: VecDeque<QueuedJob>,
    pending: FxHashMap<RequestId, PendingEntry>,
    init_waiters: Vec<InitWaiter>,
    next_request_id: u64,
}

impl Dispatcher {
    /// Create a dispatcher for `size` contexts (at least one).
    ///
    /// Contexts report back through `events`; the owner must feed everything
    /// received there into [`Dispatcher::handle_event`].
    pub fn new(
        size: usize,
        spawner: Box<dyn ContextSpawner>,
        events: mpsc::UnboundedSender<SlotEvent>,
    ) -> Self {
        let (state_tx, _) = watch::channel(PoolState::Uninitialized);
        Self {
            size: size.max(1),
            state: PoolState::Uninitialized,
            state_tx,
            failure: None,
            spawner,
            events,
            slots: Vec::new(),
            backlog: VecDeque::new(),
            pending: FxHashMap::default(),
            init_waiters: Vec::new(),
            next_request_id: 1,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn state(&self) -> PoolState {
        self.state
    }

    /// Observe lifecycle changes without going through the owner.
    pub fn subscribe(&self) -> watch::Receiver<PoolState> {
        self.state_tx.subscribe()
    }

    /// Start the contexts, or join an initialization already under way.
    ///
    /// The waiter settles once every context is ready, or as soon as any of
    /// them fails.
    pub fn init(&mut self, waiter: InitWaiter) {
        match self.state {
            PoolState::Ready => {
                let _ = waiter.send(Ok(()));
            }
            PoolState::Initializing => self.init_waiters.push(waiter),
            PoolState::Failed => {
                let reason = self.failure.clone().unwrap_or_default();
                let _ = waiter.send(Err(Error::InitFailed(reason)));
            }
            PoolState::Destroyed => {
                let _ = waiter.send(Err(Error::Destroyed));
            }
            PoolState::Uninitialized => {
                self.init_waiters.push(waiter);
                self.set_state(PoolState::Initializing);
                tracing::debug!("Starting {} execution contexts", self.size);

                if let Err(e) = self.start_contexts() {
                    self.fail_init(e.to_string());
                }
            }
        }
    }

    fn start_contexts(&mut self) -> Result<()> {
        for index in 0..self.size {
            let sink = EventSink::new(index, self.events.clone());
            let handle = self.spawner.spawn(index, sink)?;
            self.slots.push(ContextSlot {
                handle,
                ready: false,
                assigned: None,
            });
        }

        for slot in &mut self.slots {
            slot.handle.send(ContextCommand::Init)?;
        }

        Ok(())
    }

    /// Queue a conversion and start it if a slot is free.
    ///
    /// Returns the allocated request id, or `None` when the pool is not
    /// ready, in which case the responder has already been failed.
    pub fn submit(&mut self, job: ConvertJob, responder: Responder) -> Option<RequestId> {
        match self.state {
            PoolState::Ready => {}
            PoolState::Destroyed => {
                let _ = responder.send(Err(Error::Destroyed));
                return None;
            }
            _ => {
                let _ = responder.send(Err(Error::NotInitialized));
                return None;
            }
        }

        let request_id = RequestId(self.next_request_id);
        self.next_request_id += 1;

        tracing::debug!("Queued {} ({:?})", request_id, job);
        self.pending.insert(
            request_id,
            PendingEntry {
                slot: None,
                responder,
            },
        );
        self.backlog.push_back(QueuedJob { request_id, job });

        self.dispatch();
        Some(request_id)
    }

    /// Apply one event reported by a context.
    pub fn handle_event(&mut self, event: SlotEvent) {
        if !matches!(self.state, PoolState::Initializing | PoolState::Ready) {
            return;
        }
        let SlotEvent { slot, event } = event;
        if slot >= self.slots.len() {
            tracing::warn!("Ignoring event from unknown slot {}", slot);
            return;
        }

        match event {
            ContextEvent::Response(ContextResponse::Ready) => self.mark_ready(slot),
            ContextEvent::Response(ContextResponse::Output { request_id, output }) => {
                self.settle(request_id, Ok(output));
            }
            ContextEvent::Response(ContextResponse::Error {
                request_id: Some(request_id),
                error,
            }) => {
                self.settle(request_id, Err(Error::Conversion(error)));
            }
            ContextEvent::Response(ContextResponse::Error {
                request_id: None,
                error,
            }) => {
                self.fail_pool(format!("context {}: {}", slot, error));
            }
            ContextEvent::Exited { reason } => {
                self.fail_pool(format!("context {}: {}", slot, reason));
            }
            ContextEvent::Malformed { reason } => {
                self.fail_pool(format!(
                    "received malformed message from context {}: {}",
                    slot, reason
                ));
            }
        }
    }

    /// Fail everything outstanding and stop every context. Idempotent.
    pub fn shutdown(&mut self) {
        if self.state == PoolState::Destroyed {
            return;
        }

        tracing::debug!(
            "Shutting down worker pool ({} requests outstanding)",
            self.pending.len()
        );
        self.set_state(PoolState::Destroyed);
        self.fail_all(&Error::Destroyed);
        self.stop_contexts();
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            state: self.state,
            slots: self
                .slots
                .iter()
                .map(|slot| SlotSnapshot {
                    ready: slot.ready,
                    busy: slot.is_busy(),
                    request: slot.assigned,
                })
                .collect(),
            queued: self.backlog.iter().map(|queued| queued.request_id).collect(),
            in_flight: self.pending.len(),
        }
    }

    fn mark_ready(&mut self, slot: usize) {
        self.slots[slot].ready = true;

        if self.state == PoolState::Initializing && self.slots.iter().all(|s| s.ready) {
            tracing::debug!("All {} execution contexts ready", self.size);
            self.set_state(PoolState::Ready);
            for waiter in self.init_waiters.drain(..) {
                let _ = waiter.send(Ok(()));
            }
        }

        self.dispatch();
    }

    /// Settle a request and free its slot. Unknown ids are ignored: they
    /// belong to requests already failed by a shutdown or pool failure.
    fn settle(&mut self, request_id: RequestId, outcome: Result<Vec<u8>>) {
        let Some(entry) = self.pending.remove(&request_id) else {
            tracing::debug!("Ignoring reply for settled request {}", request_id);
            return;
        };

        match entry.slot {
            Some(index) => {
                if let Some(slot) = self.slots.get_mut(index) {
                    if slot.assigned == Some(request_id) {
                        slot.assigned = None;
                    }
                }
            }
            None => {
                tracing::warn!("Reply for {} arrived before it was dispatched", request_id);
                self.backlog.retain(|queued| queued.request_id != request_id);
            }
        }

        if entry.responder.send(outcome).is_err() {
            tracing::debug!("Caller dropped {}, discarding its result", request_id);
        }

        self.dispatch();
    }

    fn dispatch(&mut self) {
        if self.state != PoolState::Ready {
            return;
        }

        let mut failure = None;
        let mut index = 0;
        while index < self.slots.len() {
            if self.backlog.is_empty() {
                break;
            }
            if !self.slots[index].is_free() {
                index += 1;
                continue;
            }
            let Some(QueuedJob { request_id, job }) = self.next_queued() else {
                break;
            };

            if let Some(entry) = self.pending.get_mut(&request_id) {
                entry.slot = Some(index);
            }
            let slot = &mut self.slots[index];
            slot.assigned = Some(request_id);
            tracing::debug!("Dispatching {} to slot {}", request_id, index);

            match slot
                .handle
                .send(ContextCommand::Convert { request_id, job })
            {
                Ok(()) => index += 1,
                Err(e @ Error::FrameTooLarge { .. }) => {
                    // Nothing reached the context; the slot stays free for the next job.
                    slot.assigned = None;
                    tracing::warn!("Rejecting {}: {}", request_id, e);
                    if let Some(entry) = self.pending.remove(&request_id) {
                        let _ = entry.responder.send(Err(Error::Conversion(e.to_string())));
                    }
                }
                Err(e) => {
                    failure = Some(format!("failed to send {} to context {}: {}", request_id, index, e));
                    break;
                }
            }
        }

        if let Some(reason) = failure {
            self.fail_pool(reason);
        }
    }

    /// Pop the next queued job whose caller is still waiting for it.
    fn next_queued(&mut self) -> Option<QueuedJob> {
        while let Some(queued) = self.backlog.pop_front() {
            match self.pending.get(&queued.request_id) {
                Some(entry) if !entry.responder.is_closed() => return Some(queued),
                Some(_) => {
                    tracing::debug!("Dropping abandoned request {}", queued.request_id);
                    self.pending.remove(&queued.request_id);
                }
                None => {}
            }
        }
        None
    }

    /// A context failed without attributing it to a request.
    ///
    /// Slot bookkeeping can no longer be trusted, so the whole pool goes down.
    fn fail_pool(&mut self, reason: String) {
        match self.state {
            PoolState::Initializing => self.fail_init(reason),
            PoolState::Ready => {
                tracing::error!("Execution context failure, tearing down pool: {}", reason);
                self.set_state(PoolState::Destroyed);
                self.fail_all(&Error::ContextFailure(reason));
                self.stop_contexts();
            }
            _ => {}
        }
    }

    fn fail_init(&mut self, reason: String) {
        tracing::error!("Worker pool failed to initialize: {}", reason);
        self.set_state(PoolState::Failed);
        self.fail_all(&Error::InitFailed(reason.clone()));
        self.failure = Some(reason);
        self.stop_contexts();
    }

    fn fail_all(&mut self, error: &Error) {
        for (_, entry) in self.pending.drain() {
            let _ = entry.responder.send(Err(error.clone()));
        }
        self.backlog.clear();

        for waiter in self.init_waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    fn stop_contexts(&mut self) {
        for mut slot in self.slots.drain(..) {
            slot.handle.terminate();
        }
    }

    fn set_state(&mut self, state: PoolState) {
        self.state = state;
        self.state_tx.send_replace(state);
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
