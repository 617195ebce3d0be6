//! Topic based message bus
//!
//! Topics are plain string keys with no hierarchy or wildcards. Handlers are
//! typed; a handler only receives messages whose payload type matches the
//! type it subscribed with, anything else is skipped silently.
//!
//! Publishing fans out to a snapshot of the topic's handlers taken under the
//! topic lock, runs them concurrently and waits for all of them. Each handler
//! invocation is isolated: an error or panic in one handler is recorded in
//! the [`PublishReport`] and never prevents its siblings from completing.
//!
//! Request/response is layered on top: [`MessageBus::request`] publishes an
//! [`RpcEnvelope`] carrying a fresh correlation id and waits for a responder
//! to call [`MessageBus::complete_request`].

mod pool;

pub use pool::{RpcEnvelope, RpcEnvelopePool};

use crate::error::{Error, HandlerFailure, Result};
use dashmap::DashMap;
use futures_util::FutureExt;
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Result returned by bus handlers
pub type HandlerResult = anyhow::Result<()>;

type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;
type ResponseSlot = oneshot::Sender<Box<dyn Any + Send>>;

trait ErasedHandler: Send + Sync {
    fn payload_type(&self) -> TypeId;

    /// `None` when the message is not of this handler's payload type
    fn invoke(&self, message: &(dyn Any + Send + Sync)) -> Option<HandlerFuture>;
}

struct TypedHandler<T, F> {
    handler: F,
    _payload: std::marker::PhantomData<fn(T)>,
}

impl<T, F, Fut> ErasedHandler for TypedHandler<T, F>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn payload_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn invoke(&self, message: &(dyn Any + Send + Sync)) -> Option<HandlerFuture> {
        let message = message.downcast_ref::<T>()?;
        Some(Box::pin((self.handler)(message.clone())))
    }
}

#[derive(Clone)]
struct HandlerEntry {
    id: u64,
    owner: Option<String>,
    handler: Arc<dyn ErasedHandler>,
}

type TopicHandlers = Arc<Mutex<Vec<HandlerEntry>>>;

/// Token identifying one subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    topic: String,
    id: u64,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Outcome of a publish
#[derive(Debug, Clone, Default)]
pub struct PublishReport {
    pub topic: String,
    /// Handlers whose payload type matched and were invoked
    pub delivered: usize,
    pub failures: Vec<HandlerFailure>,
}

impl PublishReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Turn soft handler failures into an error for callers that need strictness
    pub fn into_result(self) -> Result<usize> {
        if self.failures.is_empty() {
            Ok(self.delivered)
        } else {
            Err(Error::HandlerFailures {
                topic: self.topic,
                failures: self.failures,
            })
        }
    }
}

pub struct MessageBus {
    topics: DashMap<String, TopicHandlers>,
    pending: DashMap<Uuid, ResponseSlot>,
    pool: RpcEnvelopePool,
    next_subscription: AtomicU64,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("topics", &self.topics.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        Self::with_pool_capacity(64)
    }

    pub fn with_pool_capacity(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            pending: DashMap::new(),
            pool: RpcEnvelopePool::new(capacity),
            next_subscription: AtomicU64::new(1),
        }
    }

    /// Register a typed handler under `topic`
    pub fn subscribe<T, F, Fut>(&self, topic: &str, handler: F) -> Subscription
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.insert_handler(None, topic, handler)
    }

    /// Register a handler owned by a plugin, removable with [`Self::unsubscribe_owner`]
    pub fn subscribe_for<T, F, Fut>(&self, owner: &str, topic: &str, handler: F) -> Subscription
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.insert_handler(Some(owner.to_string()), topic, handler)
    }

    fn insert_handler<T, F, Fut>(&self, owner: Option<String>, topic: &str, handler: F) -> Subscription
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let entry = HandlerEntry {
            id,
            owner,
            handler: Arc::new(TypedHandler::<T, F> {
                handler,
                _payload: std::marker::PhantomData,
            }),
        };

        // Pushed under the map entry so a concurrent prune cannot drop it.
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .lock()
            .push(entry);
        debug!(topic, subscription = id, "Handler subscribed");

        Subscription {
            topic: topic.to_string(),
            id,
        }
    }

    /// Drop `topic` once its last handler is gone
    fn prune_topic(&self, topic: &str) {
        if self
            .topics
            .remove_if(topic, |_, handlers| handlers.lock().is_empty())
            .is_some()
        {
            debug!(topic, "Removed empty topic");
        }
    }

    /// Remove one subscription; false if it was already gone
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let Some(handlers) = self.topics.get(&subscription.topic).map(|h| h.value().clone()) else {
            return false;
        };
        let removed = {
            let mut guard = handlers.lock();
            let before = guard.len();
            guard.retain(|entry| entry.id != subscription.id);
            before != guard.len()
        };
        self.prune_topic(&subscription.topic);
        removed
    }

    /// Remove every subscription registered by `owner`, across all topics
    pub fn unsubscribe_owner(&self, owner: &str) -> usize {
        let all: Vec<(String, TopicHandlers)> = self
            .topics
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let mut removed = 0;
        for (topic, handlers) in all {
            {
                let mut guard = handlers.lock();
                let before = guard.len();
                guard.retain(|entry| entry.owner.as_deref() != Some(owner));
                removed += before - guard.len();
            }
            self.prune_topic(&topic);
        }
        if removed > 0 {
            debug!(owner, removed, "Removed owner subscriptions");
        }
        removed
    }

    /// Topics with at least one handler
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Handlers registered under `topic`, regardless of payload type
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|h| h.value().lock().len())
            .unwrap_or(0)
    }

    /// Handlers under `topic` that accept payload type `T`
    pub fn typed_subscriber_count<T: 'static>(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|h| {
                h.value()
                    .lock()
                    .iter()
                    .filter(|e| e.handler.payload_type() == TypeId::of::<T>())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Publish to every handler subscribed at this moment and wait for all of them
    pub async fn publish<T>(&self, topic: &str, message: T) -> PublishReport
    where
        T: Clone + Send + Sync + 'static,
    {
        let snapshot: Vec<HandlerEntry> = match self.topics.get(topic).map(|h| h.value().clone()) {
            Some(handlers) => handlers.lock().clone(),
            None => Vec::new(),
        };

        let mut report = PublishReport {
            topic: topic.to_string(),
            ..PublishReport::default()
        };

        let payload: &(dyn Any + Send + Sync) = &message;
        let mut invocations = Vec::with_capacity(snapshot.len());
        for entry in &snapshot {
            match std::panic::catch_unwind(AssertUnwindSafe(|| entry.handler.invoke(payload))) {
                Ok(Some(future)) => invocations.push((entry.id, future)),
                Ok(None) => {}
                Err(panic) => report.failures.push(HandlerFailure {
                    topic: topic.to_string(),
                    subscription_id: entry.id,
                    message: panic_message(panic),
                }),
            }
        }
        report.delivered = invocations.len() + report.failures.len();

        let outcomes = join_all(invocations.into_iter().map(|(id, future)| async move {
            (id, AssertUnwindSafe(future).catch_unwind().await)
        }))
        .await;

        for (id, outcome) in outcomes {
            let message = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{e:#}"),
                Err(panic) => panic_message(panic),
            };
            report.failures.push(HandlerFailure {
                topic: topic.to_string(),
                subscription_id: id,
                message,
            });
        }

        for failure in &report.failures {
            warn!(
                topic,
                subscription = failure.subscription_id,
                error = %failure.message,
                "Bus handler failed"
            );
        }
        debug!(topic, delivered = report.delivered, "Message published");

        report
    }

    /// Send a request and wait for a typed response, up to `timeout`
    pub async fn request<Req, Resp>(&self, topic: &str, request: Req, timeout: Duration) -> Result<Resp>
    where
        Req: Clone + Send + Sync + 'static,
        Resp: Send + 'static,
    {
        self.request_with_cancel(topic, request, timeout, CancellationToken::new())
            .await
    }

    /// Same as [`Self::request`] but also aborts when `cancel` fires
    pub async fn request_with_cancel<Req, Resp>(
        &self,
        topic: &str,
        request: Req,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Resp>
    where
        Req: Clone + Send + Sync + 'static,
        Resp: Send + 'static,
    {
        enum Outcome {
            Received(std::result::Result<Box<dyn Any + Send>, oneshot::error::RecvError>),
            TimedOut,
            Cancelled,
        }

        let request_id = Uuid::new_v4();
        let deadline = Instant::now() + timeout;
        let (tx, mut rx) = oneshot::channel();
        self.pending.insert(request_id, tx);
        let _slot = PendingSlotGuard {
            pending: &self.pending,
            request_id,
        };

        let outcome = {
            let exchange = async {
                let envelope = self.pool.rent_with(request_id, request);
                let report = self.publish(topic, envelope.clone()).await;
                self.pool.give_back(envelope);
                if report.delivered == 0 {
                    debug!(topic, %request_id, "Request published with no responders");
                }
                (&mut rx).await
            };

            tokio::select! {
                received = exchange => Outcome::Received(received),
                _ = tokio::time::sleep_until(deadline) => Outcome::TimedOut,
                _ = cancel.cancelled() => Outcome::Cancelled,
            }
        };

        match outcome {
            Outcome::Received(Ok(response)) => downcast_response(request_id, response),
            Outcome::Received(Err(_)) => {
                self.pending.remove(&request_id);
                Err(Error::RequestCancelled(request_id))
            }
            Outcome::TimedOut => {
                // Whoever removes the slot first wins; if a responder got there
                // first its value is already in the channel.
                if self.pending.remove(&request_id).is_none() {
                    if let Ok(response) = rx.try_recv() {
                        return downcast_response(request_id, response);
                    }
                }
                warn!(topic, %request_id, ?timeout, "Request timed out");
                Err(Error::RequestTimeout {
                    topic: topic.to_string(),
                    request_id,
                    timeout,
                })
            }
            Outcome::Cancelled => {
                self.pending.remove(&request_id);
                Err(Error::RequestCancelled(request_id))
            }
        }
    }

    /// Complete a pending request; unknown or already completed ids are ignored
    pub fn complete_request<Resp: Send + 'static>(&self, request_id: Uuid, response: Resp) -> bool {
        match self.pending.remove(&request_id) {
            Some((_, slot)) => slot.send(Box::new(response)).is_ok(),
            None => {
                debug!(%request_id, "Discarding response for unknown request");
                false
            }
        }
    }

    /// Subscribe a responder that answers requests on `topic`
    pub fn serve<Req, Resp, F, Fut>(self: &Arc<Self>, topic: &str, handler: F) -> Subscription
    where
        Req: Clone + Send + Sync + 'static,
        Resp: Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
    {
        self.serve_inner(None, topic, handler)
    }

    /// Owned variant of [`Self::serve`]
    pub fn serve_for<Req, Resp, F, Fut>(
        self: &Arc<Self>,
        owner: &str,
        topic: &str,
        handler: F,
    ) -> Subscription
    where
        Req: Clone + Send + Sync + 'static,
        Resp: Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
    {
        self.serve_inner(Some(owner.to_string()), topic, handler)
    }

    fn serve_inner<Req, Resp, F, Fut>(
        self: &Arc<Self>,
        owner: Option<String>,
        topic: &str,
        handler: F,
    ) -> Subscription
    where
        Req: Clone + Send + Sync + 'static,
        Resp: Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
    {
        let bus = Arc::downgrade(self);
        let handler = Arc::new(handler);

        self.insert_handler(owner, topic, move |envelope: RpcEnvelope<Req>| {
            let bus = bus.clone();
            let handler = Arc::clone(&handler);
            async move {
                let (Some(request_id), Some(data)) = (envelope.request_id, envelope.data) else {
                    return Err(anyhow::anyhow!("Malformed RPC envelope"));
                };
                let response = handler(data).await?;
                if let Some(bus) = bus.upgrade() {
                    bus.complete_request(request_id, response);
                }
                Ok(())
            }
        })
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn contains_pending(&self, request_id: &Uuid) -> bool {
        self.pending.contains_key(request_id)
    }

    pub fn pool(&self) -> &RpcEnvelopePool {
        &self.pool
    }
}

/// Frees a request's response slot even when the caller drops the future
struct PendingSlotGuard<'a> {
    pending: &'a DashMap<Uuid, ResponseSlot>,
    request_id: Uuid,
}

impl Drop for PendingSlotGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.request_id);
    }
}

fn downcast_response<Resp: 'static>(request_id: Uuid, response: Box<dyn Any + Send>) -> Result<Resp> {
    response
        .downcast::<Resp>()
        .map(|boxed| *boxed)
        .map_err(|_| Error::ResponseTypeMismatch {
            request_id,
            expected: std::any::type_name::<Resp>(),
        })
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}
