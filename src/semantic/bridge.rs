//! Request/response calls over the compute context.
//!
//! Every call gets a fresh id and a oneshot completion in the pending map. A
//! dispatcher task reads worker messages, settles calls by id and applies
//! status pushes. Whoever removes a pending entry first (dispatcher, timeout,
//! a dropped caller, or teardown) settles the call; everyone after is a no-op.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::semantic::lifecycle::{LifecycleStatus, StatusSnapshot};
use crate::semantic::protocol::{
    CallId, Envelope, StatusPhase, StatusUpdate, WorkerMessage, WorkerReply, WorkerRequest,
};
use crate::semantic::worker::{ContextChannels, ContextSpawner};

/// Per-call failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    #[error("Compute context not initialized")]
    NotInitialized,

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Compute context error: {0}")]
    Remote(String),

    #[error("Compute context terminated")]
    Terminated,

    #[error("Call cancelled")]
    Cancelled,

    #[error("Failed to start compute context: {0}")]
    Spawn(String),
}

type Completion = oneshot::Sender<Result<WorkerReply, BridgeError>>;

struct LiveContext {
    generation: u64,
    requests: mpsc::UnboundedSender<Envelope>,
    dispatcher: JoinHandle<()>,
}

struct Inner {
    spawner: Arc<dyn ContextSpawner>,
    next_call_id: AtomicU64,
    next_generation: AtomicU64,
    /// Lock order: `context` before `pending`
    context: Mutex<Option<LiveContext>>,
    pending: Mutex<HashMap<CallId, Completion>>,
    status: watch::Sender<StatusSnapshot>,
}

/// Owns the compute context, the correlation map and the lifecycle status.
///
/// Dropping the bridge tears the context down.
pub struct ComputeBridge {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // guarded sections never panic halfway through an update
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ComputeBridge {
    /// Create a bridge with no compute context. Status starts `disabled`.
    pub fn new(spawner: Arc<dyn ContextSpawner>) -> Self {
        let (status, _) = watch::channel(StatusSnapshot::new(LifecycleStatus::Disabled));
        Self {
            inner: Arc::new(Inner {
                spawner,
                next_call_id: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
                context: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                status,
            }),
        }
    }

    /// Start a compute context if none is running. A `disabled` status becomes
    /// `idle`; any other status is kept.
    ///
    /// Must be called from within a tokio runtime.
    pub fn provision(&self) -> Result<(), BridgeError> {
        let mut context = lock(&self.inner.context);
        if context.is_some() {
            return Ok(());
        }

        let ContextChannels { requests, messages } = self
            .inner
            .spawner
            .spawn()
            .map_err(|e| BridgeError::Spawn(e.to_string()))?;

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let dispatcher = tokio::spawn(dispatch(Arc::downgrade(&self.inner), generation, messages));

        *context = Some(LiveContext {
            generation,
            requests,
            dispatcher,
        });
        // leave `loading` or `error` alone; a caller mid-initialize owns it
        self.inner.status.send_if_modified(|snapshot| {
            if snapshot.status != LifecycleStatus::Disabled {
                return false;
            }
            *snapshot = StatusSnapshot::new(LifecycleStatus::Idle);
            true
        });

        log::info!("compute context provisioned");
        Ok(())
    }

    /// Stop the compute context and reject every outstanding call.
    ///
    /// Status is `disabled` when this returns. The worker thread finishes its
    /// current request and exits; its reply is dropped.
    pub fn teardown(&self) {
        let mut context = lock(&self.inner.context);
        self.inner
            .status
            .send_replace(StatusSnapshot::new(LifecycleStatus::Disabled));

        if let Some(live) = context.take() {
            live.dispatcher.abort();
            drop(live.requests);
            let rejected = self.inner.reject_all(BridgeError::Terminated);
            log::info!(
                "compute context terminated, {} pending call(s) rejected",
                rejected
            );
        }
    }

    pub fn is_provisioned(&self) -> bool {
        lock(&self.inner.context).is_some()
    }

    /// Send `request` and wait for its correlated reply.
    ///
    /// Dropping the returned future abandons the call and frees its slot.
    pub async fn call(
        &self,
        request: WorkerRequest,
        timeout: Duration,
    ) -> Result<WorkerReply, BridgeError> {
        let (id, rx) = {
            let context = lock(&self.inner.context);
            let live = context.as_ref().ok_or(BridgeError::NotInitialized)?;

            let id = self.inner.next_call_id.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            lock(&self.inner.pending).insert(id, tx);

            log::debug!("call {} ({}) sent", id, request.kind());
            if live.requests.send(Envelope { id, request }).is_err() {
                lock(&self.inner.pending).remove(&id);
                return Err(BridgeError::Terminated);
            }
            (id, rx)
        };

        let _slot = PendingSlot {
            inner: &self.inner,
            id,
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // completion dropped without a value
            Ok(Err(_)) => Err(BridgeError::Terminated),
            Err(_) => {
                log::warn!("call {} timed out after {:?}", id, timeout);
                Err(BridgeError::Timeout(timeout))
            }
        }
    }

    /// Number of calls currently awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.inner.status.subscribe()
    }

    /// Atomically modify the status; `modify` returns whether it changed anything.
    pub(crate) fn update_status<F>(&self, modify: F) -> bool
    where
        F: FnOnce(&mut StatusSnapshot) -> bool,
    {
        self.inner.status.send_if_modified(modify)
    }
}

impl Drop for ComputeBridge {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Removes a call's pending entry when its caller stops waiting.
struct PendingSlot<'a> {
    inner: &'a Inner,
    id: CallId,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        lock(&self.inner.pending).remove(&self.id);
    }
}

impl Inner {
    fn settle(&self, id: CallId, result: Result<WorkerReply, BridgeError>) {
        let completion = lock(&self.pending).remove(&id);
        match completion {
            Some(tx) => {
                // receiver may have given up between removal and send
                let _ = tx.send(result);
            }
            None => log::debug!("dropping late reply for call {}", id),
        }
    }

    fn reject_all(&self, err: BridgeError) -> usize {
        let drained: Vec<Completion> = lock(&self.pending).drain().map(|(_, tx)| tx).collect();
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(err.clone()));
        }
        count
    }

    fn apply_status(&self, update: StatusUpdate) {
        self.status.send_if_modified(|snapshot| {
            if snapshot.status == LifecycleStatus::Disabled {
                return false;
            }
            snapshot.status = match update.phase {
                StatusPhase::Loading => LifecycleStatus::Loading,
                StatusPhase::Ready => LifecycleStatus::Ready,
                StatusPhase::Error => LifecycleStatus::Error,
            };
            snapshot.message = Some(update.message);
            snapshot.progress = update.progress;
            true
        });
    }

    /// The worker closed its channel on its own (thread exit or panic).
    fn context_lost(&self, generation: u64) {
        let mut context = lock(&self.context);
        if context.as_ref().map(|c| c.generation) != Some(generation) {
            return;
        }
        context.take();

        let rejected = self.reject_all(BridgeError::Terminated);
        log::error!(
            "compute context exited unexpectedly, {} pending call(s) rejected",
            rejected
        );
        self.status.send_replace(StatusSnapshot {
            status: LifecycleStatus::Error,
            message: Some("Compute context exited unexpectedly".to_string()),
            progress: None,
        });
    }
}

async fn dispatch(
    inner: Weak<Inner>,
    generation: u64,
    mut messages: mpsc::UnboundedReceiver<WorkerMessage>,
) {
    while let Some(message) = messages.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };

        match message {
            WorkerMessage::Response { id, result } => {
                log::debug!("call {} settled", id);
                inner.settle(id, result.map_err(BridgeError::Remote));
            }
            WorkerMessage::Status(update) => inner.apply_status(update),
        }
    }

    if let Some(inner) = inner.upgrade() {
        inner.context_lost(generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::protocol::Progress;

    /// A context whose worker side is driven by the test.
    struct ManualSpawner {
        worker: Mutex<Option<WorkerEnds>>,
    }

    struct WorkerEnds {
        requests: mpsc::UnboundedReceiver<Envelope>,
        messages: mpsc::UnboundedSender<WorkerMessage>,
    }

    impl ManualSpawner {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                worker: Mutex::new(None),
            })
        }

        fn take(&self) -> WorkerEnds {
            self.worker.lock().unwrap().take().expect("context not spawned")
        }
    }

    impl ContextSpawner for ManualSpawner {
        fn spawn(&self) -> std::io::Result<ContextChannels> {
            let (request_tx, request_rx) = mpsc::unbounded_channel();
            let (message_tx, message_rx) = mpsc::unbounded_channel();
            *self.worker.lock().unwrap() = Some(WorkerEnds {
                requests: request_rx,
                messages: message_tx,
            });
            Ok(ContextChannels {
                requests: request_tx,
                messages: message_rx,
            })
        }
    }

    fn embed(text: &str) -> WorkerRequest {
        WorkerRequest::Embed {
            texts: vec![text.to_string()],
        }
    }

    fn embeddings(value: f32) -> WorkerReply {
        WorkerReply::Embeddings {
            model: "m".to_string(),
            vectors: vec![vec![value]],
        }
    }

    fn provisioned() -> (Arc<ComputeBridge>, WorkerEnds) {
        let spawner = ManualSpawner::new();
        let bridge = Arc::new(ComputeBridge::new(spawner.clone()));
        bridge.provision().unwrap();
        (bridge, spawner.take())
    }

    #[tokio::test]
    async fn test_call_without_context_fails_fast() {
        let bridge = ComputeBridge::new(ManualSpawner::new());

        let result = bridge.call(embed("a"), Duration::from_secs(3600)).await;
        assert_eq!(result, Err(BridgeError::NotInitialized));
        assert_eq!(bridge.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_replies_are_correlated() {
        let (bridge, mut worker) = provisioned();

        let first = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.call(embed("first"), Duration::from_secs(5)).await }
        });
        let second = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.call(embed("second"), Duration::from_secs(5)).await }
        });

        let a = worker.requests.recv().await.unwrap();
        let b = worker.requests.recv().await.unwrap();
        assert_ne!(a.id, b.id);

        let value_for = |env: &Envelope| match &env.request {
            WorkerRequest::Embed { texts } if texts[0] == "first" => 1.0,
            _ => 2.0,
        };

        // reply in reverse order
        worker
            .messages
            .send(WorkerMessage::Response {
                id: b.id,
                result: Ok(embeddings(value_for(&b))),
            })
            .unwrap();
        worker
            .messages
            .send(WorkerMessage::Response {
                id: a.id,
                result: Ok(embeddings(value_for(&a))),
            })
            .unwrap();

        assert_eq!(first.await.unwrap(), Ok(embeddings(1.0)));
        assert_eq!(second.await.unwrap(), Ok(embeddings(2.0)));
        assert_eq!(bridge.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_remote_error_rejects_call() {
        let (bridge, mut worker) = provisioned();

        let call = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.call(embed("bad"), Duration::from_secs(5)).await }
        });

        let env = worker.requests.recv().await.unwrap();
        worker
            .messages
            .send(WorkerMessage::Response {
                id: env.id,
                result: Err("malformed input".to_string()),
            })
            .unwrap();

        assert_eq!(
            call.await.unwrap(),
            Err(BridgeError::Remote("malformed input".to_string()))
        );
        assert_eq!(bridge.pending_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_after_timeout_is_dropped() {
        let (bridge, mut worker) = provisioned();

        let result = bridge.call(embed("slow"), Duration::from_secs(10)).await;
        assert_eq!(result, Err(BridgeError::Timeout(Duration::from_secs(10))));
        assert_eq!(bridge.pending_calls(), 0);

        // the worker finishes anyway; nothing to settle
        let env = worker.requests.recv().await.unwrap();
        worker
            .messages
            .send(WorkerMessage::Response {
                id: env.id,
                result: Ok(embeddings(1.0)),
            })
            .unwrap();
        tokio::task::yield_now().await;

        assert_eq!(bridge.pending_calls(), 0);
        assert_eq!(bridge.snapshot().status, LifecycleStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_just_before_deadline_resolves() {
        let (bridge, mut worker) = provisioned();

        let responder = tokio::spawn(async move {
            let env = worker.requests.recv().await.unwrap();
            tokio::time::sleep(Duration::from_millis(9_999)).await;
            worker
                .messages
                .send(WorkerMessage::Response {
                    id: env.id,
                    result: Ok(embeddings(3.0)),
                })
                .unwrap();
            worker
        });

        let result = bridge.call(embed("edge"), Duration::from_secs(10)).await;
        assert_eq!(result, Ok(embeddings(3.0)));
        assert_eq!(bridge.pending_calls(), 0);
        drop(responder.await.unwrap());
    }

    #[tokio::test]
    async fn test_abandoned_call_frees_slot() {
        let (bridge, mut worker) = provisioned();

        let call = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.call(embed("gone"), Duration::from_secs(60)).await }
        });
        worker.requests.recv().await.unwrap();
        assert_eq!(bridge.pending_calls(), 1);

        call.abort();
        let _ = call.await;
        assert_eq!(bridge.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_teardown_rejects_outstanding_calls() {
        let (bridge, mut worker) = provisioned();

        let call = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.call(embed("pending"), Duration::from_secs(60)).await }
        });
        worker.requests.recv().await.unwrap();

        bridge.teardown();
        assert_eq!(bridge.snapshot().status, LifecycleStatus::Disabled);
        assert!(!bridge.is_provisioned());

        assert_eq!(call.await.unwrap(), Err(BridgeError::Terminated));
        assert_eq!(bridge.pending_calls(), 0);

        // no further calls are accepted
        let again = bridge.call(embed("after"), Duration::from_secs(1)).await;
        assert_eq!(again, Err(BridgeError::NotInitialized));

        // and the worker side sees its request channel close
        assert!(worker.requests.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_status_push_updates_snapshot() {
        let (bridge, worker) = provisioned();
        let mut rx = bridge.subscribe();

        worker
            .messages
            .send(WorkerMessage::Status(StatusUpdate {
                phase: StatusPhase::Loading,
                message: "downloading".to_string(),
                progress: Some(Progress { current: 3, total: 8 }),
            }))
            .unwrap();

        rx.changed().await.unwrap();
        let snapshot = rx.borrow().clone();
        assert_eq!(snapshot.status, LifecycleStatus::Loading);
        assert_eq!(snapshot.message.as_deref(), Some("downloading"));
        assert_eq!(snapshot.progress, Some(Progress { current: 3, total: 8 }));
        assert_eq!(bridge.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_worker_exit_rejects_calls_and_reports_error() {
        let (bridge, mut worker) = provisioned();

        let call = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.call(embed("x"), Duration::from_secs(60)).await }
        });
        worker.requests.recv().await.unwrap();

        drop(worker);

        assert_eq!(call.await.unwrap(), Err(BridgeError::Terminated));
        assert_eq!(bridge.snapshot().status, LifecycleStatus::Error);
        assert!(!bridge.is_provisioned());
    }

    #[tokio::test]
    async fn test_call_ids_are_unique() {
        let (bridge, mut worker) = provisioned();

        let mut calls = Vec::new();
        for i in 0..20 {
            let bridge = bridge.clone();
            calls.push(tokio::spawn(async move {
                bridge
                    .call(embed(&i.to_string()), Duration::from_secs(5))
                    .await
            }));
        }

        let mut ids = std::collections::HashSet::new();
        for _ in 0..20 {
            let env = worker.requests.recv().await.unwrap();
            assert!(ids.insert(env.id));
            worker
                .messages
                .send(WorkerMessage::Response {
                    id: env.id,
                    result: Ok(embeddings(0.0)),
                })
                .unwrap();
        }

        for call in calls {
            assert!(call.await.unwrap().is_ok());
        }
    }
}
