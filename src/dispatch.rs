//! The per-call dispatch state machine behind the client RPC surface.
//!
//! Each client-facing RPC becomes a pending call in an arena keyed by a
//! `u64` tag. Tags travel through an unbounded mpsc channel (the
//! completion queue); worker tasks pop tags and advance the owning call
//! through its phases:
//!
//! ```text
//! Create  → (first pop)   run HandleRequest via the RequestHandler seam
//! Process → (completion)  reply stored, tag re-enqueued
//! Finish  → (second pop)  reply written to the responder
//! Cleanup → (third pop)   arena slot reclaimed, exactly once
//! ```
//!
//! Mutations cannot complete synchronously: the replica's commit callback
//! fires on a raft-adjacent task, which only stores the reply and wakes
//! the queue through [`Completion::complete`]. The responder itself is
//! touched by queue workers alone, so commit callbacks never block on or
//! race the transport. A responder whose client went away is detected at
//! the Finish step and the call proceeds to Cleanup regardless.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use crate::types::{MutationResult, ReadResult, ServerInfo};

// ── Requests and replies ──────────────────────────────────────────────────────

/// A decoded client RPC, one variant per kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallRequest {
    Get { key: Vec<u8> },
    Put { key: Vec<u8>, value: Vec<u8> },
    Update { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    GetLeaderId,
    GetClusterEndpoints,
}

/// The reply matching each request kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallReply {
    Read(ReadResult),
    Mutation(MutationResult),
    LeaderId(i32),
    ClusterEndpoints(Vec<ServerInfo>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Create,
    Process,
    Finish,
    Cleanup,
}

struct PendingCall {
    phase: Phase,
    request: Option<CallRequest>,
    reply: Option<CallReply>,
    responder: Option<oneshot::Sender<CallReply>>,
}

// ── Handler seam ──────────────────────────────────────────────────────────────

/// Application logic behind the dispatcher. The production implementation
/// runs against the replica; tests substitute stubs.
///
/// `handle` must arrange for `completion.complete(reply)` to be called
/// exactly once. It may complete inline (reads, leader queries) or from
/// another task (commit callbacks). In blocking return mode the future
/// awaits the commit, occupying the worker; in callback mode it returns
/// immediately.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(
        &self,
        request: CallRequest,
        completion: Completion,
    ) -> impl Future<Output = ()> + Send;

    /// Invoked on each worker task before it first touches the engine.
    fn worker_started(&self) {}

    fn worker_stopped(&self) {}
}

/// One-shot ticket for finishing a pending call. Stores the reply in the
/// arena and wakes the completion queue; never touches the responder.
pub struct Completion {
    tag: u64,
    calls: Arc<Mutex<HashMap<u64, PendingCall>>>,
    queue_tx: mpsc::UnboundedSender<u64>,
}

impl Completion {
    pub fn complete(self, reply: CallReply) {
        {
            let mut calls = self.calls.lock().unwrap();
            match calls.get_mut(&self.tag) {
                Some(call) if call.phase == Phase::Process => {
                    call.reply = Some(reply);
                    call.phase = Phase::Finish;
                }
                Some(call) => {
                    warn!(tag = self.tag, phase = ?call.phase, "completion in unexpected phase");
                    return;
                }
                None => {
                    warn!(tag = self.tag, "completion for unknown call");
                    return;
                }
            }
        }
        let _ = self.queue_tx.send(self.tag);
    }
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

/// The arena, the completion queue, and the worker pool.
pub struct Dispatcher<H: RequestHandler> {
    handler: Arc<H>,
    calls: Arc<Mutex<HashMap<u64, PendingCall>>>,
    next_tag: AtomicU64,
    queue_tx: mpsc::UnboundedSender<u64>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<u64>>>,
    shutdown_tx: watch::Sender<bool>,
    created: AtomicU64,
    cleaned: AtomicU64,
}

impl<H: RequestHandler> Dispatcher<H> {
    pub fn new(handler: Arc<H>) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            handler,
            calls: Arc::new(Mutex::new(HashMap::new())),
            next_tag: AtomicU64::new(1),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            shutdown_tx,
            created: AtomicU64::new(0),
            cleaned: AtomicU64::new(0),
        })
    }

    /// Register a new call. The returned receiver resolves with the reply;
    /// it errors if the dispatcher shuts down first.
    pub fn submit(&self, request: CallRequest) -> oneshot::Receiver<CallReply> {
        let (responder, rx) = oneshot::channel();
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);

        self.calls.lock().unwrap().insert(
            tag,
            PendingCall {
                phase: Phase::Create,
                request: Some(request),
                reply: None,
                responder: Some(responder),
            },
        );
        self.created.fetch_add(1, Ordering::Relaxed);

        if self.queue_tx.send(tag).is_err() {
            // Queue torn down; reclaim the slot so nothing leaks.
            self.calls.lock().unwrap().remove(&tag);
            self.cleaned.fetch_add(1, Ordering::Relaxed);
        }
        rx
    }

    /// Spawn `n` worker tasks draining the completion queue. Call once.
    pub fn run_workers(self: &Arc<Self>, n: usize) {
        let queue_rx = self
            .queue_rx
            .lock()
            .unwrap()
            .take()
            .expect("run_workers called twice");
        let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));

        for worker in 0..n.max(1) {
            let dispatcher = Arc::clone(self);
            let queue_rx = Arc::clone(&queue_rx);
            let mut shutdown_rx = self.shutdown_tx.subscribe();

            tokio::spawn(async move {
                dispatcher.handler.worker_started();
                debug!(worker, "dispatch worker started");

                loop {
                    let tag = tokio::select! {
                        tag = async { queue_rx.lock().await.recv().await } => tag,
                        _ = shutdown_rx.changed() => None,
                    };
                    match tag {
                        Some(tag) => dispatcher.proceed(tag).await,
                        None => break,
                    }
                }

                dispatcher.handler.worker_stopped();
                debug!(worker, "dispatch worker stopped");
            });
        }
    }

    /// Stop the workers. Pending calls are dropped; their callers observe
    /// a closed responder.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Calls currently alive in the arena.
    pub fn pending_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// `(created, cleaned)` lifetime counters. Equal when idle: every call
    /// that enters the arena leaves through Cleanup exactly once.
    pub fn call_stats(&self) -> (u64, u64) {
        (
            self.created.load(Ordering::Relaxed),
            self.cleaned.load(Ordering::Relaxed),
        )
    }

    async fn proceed(&self, tag: u64) {
        enum Action {
            Handle(CallRequest),
            Respond(CallReply, Option<oneshot::Sender<CallReply>>),
            Destroy,
            Stale,
        }

        let action = {
            let mut calls = self.calls.lock().unwrap();
            match calls.get_mut(&tag) {
                None => Action::Stale,
                Some(call) => match call.phase {
                    Phase::Create => {
                        call.phase = Phase::Process;
                        Action::Handle(call.request.take().expect("request set in Create"))
                    }
                    Phase::Finish => {
                        let reply = call.reply.take().expect("reply set in Finish");
                        let responder = call.responder.take();
                        call.phase = Phase::Cleanup;
                        Action::Respond(reply, responder)
                    }
                    Phase::Cleanup => {
                        calls.remove(&tag);
                        Action::Destroy
                    }
                    Phase::Process => {
                        // Wakeups only arrive from Completion, which has
                        // already advanced the phase.
                        warn!(tag, "spurious wakeup in Process phase");
                        Action::Stale
                    }
                },
            }
        };

        match action {
            Action::Handle(request) => {
                trace!(tag, "dispatching request");
                let completion = Completion {
                    tag,
                    calls: Arc::clone(&self.calls),
                    queue_tx: self.queue_tx.clone(),
                };
                self.handler.handle(request, completion).await;
            }
            Action::Respond(reply, responder) => {
                match responder {
                    Some(tx) => {
                        if tx.send(reply).is_err() {
                            // Client cancelled; transport-layer only. The
                            // call still proceeds to Cleanup.
                            debug!(tag, "responder closed before reply write");
                        }
                    }
                    None => warn!(tag, "responder missing at Finish"),
                }
                let _ = self.queue_tx.send(tag);
            }
            Action::Destroy => {
                self.cleaned.fetch_add(1, Ordering::Relaxed);
                trace!(tag, "call destroyed");
            }
            Action::Stale => {}
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
