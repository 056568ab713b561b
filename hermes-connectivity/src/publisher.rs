// Copyright 2024, The Hermes Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::errors::Error;
use crate::utils::metrics::CounterRegistry;
use crate::{Context, FailureNotifier};
use futures::future::BoxFuture;
use futures::StreamExt;
use hermes_system::connection::{ConnectionId, Target};
use hermes_system::external::ExternalMessage;
use hermes_system::signal::{Acknowledgement, MessageResponse, Signal};
use std::fmt::{self, Display};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::{oneshot, watch};
use tokio::task;
use tokio_stream::wrappers::ReceiverStream;

/// A protocol-specific address derived from a [`Target`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishTarget {
    /// The raw target address, e.g. `POST:/ingest` for HTTP push
    pub address: String,
}

impl PublishTarget {
    /// Derives the publish target from a configured target
    #[must_use]
    pub fn from_target(target: &Target) -> Self {
        Self {
            address: target.address.clone(),
        }
    }
}

impl Display for PublishTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// What a resolved publish reports back: an acknowledgement, plus the
/// command response when the published signal was a message command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponseOrAck {
    /// The command response, for message commands only
    pub response: Option<MessageResponse>,
    /// The acknowledgement for the publish
    pub ack: Acknowledgement,
}

/// One publish call: everything a publisher needs to put a message on the
/// wire and correlate the reply.
#[derive(Debug)]
pub struct PublishRequest {
    /// The signal being published
    pub signal: Signal,
    /// The target whose acknowledgement label applies, if any
    pub auto_ack_target: Option<Target>,
    /// Where to publish
    pub target: PublishTarget,
    /// The mapped external message
    pub message: ExternalMessage,
    /// Byte cap for message-command response bodies
    pub max_total_message_size: usize,
    /// Byte cap for acknowledgement bodies
    pub ack_size_quota: usize,
}

/// In-flight publish descriptor. Lives from enqueue until the response
/// arrives or the pipeline dies; completing it resolves the result future
/// of the originating publish call.
///
/// Completion is idempotent: the first completion wins, later ones are
/// silently ignored. Dropping an incomplete context resolves the future
/// with a stream-terminated failure, so a torn-down pipeline never leaves
/// callers hanging.
#[derive(Debug)]
pub struct PublishContext {
    signal: Signal,
    auto_ack_target: Option<Target>,
    message: ExternalMessage,
    target_address: String,
    max_total_message_size: usize,
    ack_size_quota: usize,
    result_tx: Option<oneshot::Sender<Result<CommandResponseOrAck, Error>>>,
    guard: Option<InFlightGuard>,
}

impl PublishContext {
    fn new(
        request: PublishRequest,
        result_tx: oneshot::Sender<Result<CommandResponseOrAck, Error>>,
    ) -> Self {
        Self {
            signal: request.signal,
            auto_ack_target: request.auto_ack_target,
            message: request.message,
            target_address: request.target.address,
            max_total_message_size: request.max_total_message_size,
            ack_size_quota: request.ack_size_quota,
            result_tx: Some(result_tx),
            guard: None,
        }
    }

    /// The signal being published
    #[must_use]
    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    /// The target whose acknowledgement label applies
    #[must_use]
    pub fn auto_ack_target(&self) -> Option<&Target> {
        self.auto_ack_target.as_ref()
    }

    /// The mapped external message
    #[must_use]
    pub fn message(&self) -> &ExternalMessage {
        &self.message
    }

    /// The address this publish goes to
    #[must_use]
    pub fn target_address(&self) -> &str {
        &self.target_address
    }

    /// Byte cap for message-command response bodies
    #[must_use]
    pub fn max_total_message_size(&self) -> usize {
        self.max_total_message_size
    }

    /// Byte cap for acknowledgement bodies
    #[must_use]
    pub fn ack_size_quota(&self) -> usize {
        self.ack_size_quota
    }

    /// Resolves the result future. The first call wins; later calls are
    /// ignored.
    pub fn complete(&mut self, result: Result<CommandResponseOrAck, Error>) {
        if let Some(tx) = self.result_tx.take() {
            let _ = tx.send(result);
        }
        self.guard.take();
    }
}

impl Drop for PublishContext {
    fn drop(&mut self) {
        if let Some(tx) = self.result_tx.take() {
            let _ = tx.send(Err(Error::stream_terminated()));
        }
    }
}

/// Budget for queued plus in-flight publishes. Acquiring beyond the cap
/// fails immediately; the guard returns its slot on drop.
#[derive(Debug, Clone)]
struct InFlightCap {
    cap: usize,
    counter: Arc<AtomicUsize>,
}

impl InFlightCap {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            counter: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn try_acquire(&self) -> Option<InFlightGuard> {
        let num = self.counter.fetch_add(1, Ordering::AcqRel);
        if num >= self.cap {
            self.counter.fetch_sub(1, Ordering::AcqRel);
            None
        } else {
            Some(InFlightGuard(self.counter.clone()))
        }
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.counter.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The protocol seam of a publisher: builds wire requests, sends them, and
/// turns wire responses into publish outcomes.
///
/// The pipeline guarantees one `on_response` per sent request, in enqueue
/// order relative to other requests of the same publisher.
#[async_trait::async_trait]
pub trait PublishFlow: Send + Sync + 'static {
    /// The protocol request type
    type Request: Send + 'static;
    /// The protocol response type
    type Response: Send + 'static;

    /// Builds the wire request for a publish target and message
    ///
    /// # Errors
    /// If the target address or message cannot be expressed on the wire
    fn build_request(
        &self,
        target: &PublishTarget,
        message: &ExternalMessage,
    ) -> Result<Self::Request, Error>;

    /// Sends one request and returns the wire response
    async fn send(&self, request: Self::Request) -> anyhow::Result<Self::Response>;

    /// Turns the wire outcome into the publish outcome. Runs at the sink
    /// boundary; any error it returns resolves the caller's future, nothing
    /// escapes into the stream.
    async fn on_response(
        &self,
        ctx: &PublishContext,
        response: anyhow::Result<Self::Response>,
    ) -> Result<CommandResponseOrAck, Error>;
}

/// Context of a publisher, used for logging and failure escalation
#[derive(Clone)]
pub struct PublisherContext {
    connection: ConnectionId,
    notifier: FailureNotifier,
    registry: CounterRegistry,
}

impl PublisherContext {
    pub(crate) fn new(
        connection: ConnectionId,
        notifier: FailureNotifier,
        registry: CounterRegistry,
    ) -> Self {
        Self {
            connection,
            notifier,
            registry,
        }
    }
}

impl Display for PublisherContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Publisher::{}]", self.connection)
    }
}

impl Context for PublisherContext {
    fn connection(&self) -> &ConnectionId {
        &self.connection
    }

    fn notifier(&self) -> &FailureNotifier {
        &self.notifier
    }

    fn registry(&self) -> &CounterRegistry {
        &self.registry
    }
}

pub(crate) trait Publish: Send + Sync {
    fn publish(&self, request: PublishRequest) -> BoxFuture<'static, Result<CommandResponseOrAck, Error>>;
    fn stop(&self);
}

/// Handle to a running publisher pipeline
#[derive(Clone)]
pub struct Addr {
    inner: Arc<dyn Publish>,
}

impl Addr {
    /// Publishes one message. The returned future resolves exactly once:
    /// with the acknowledgement (and command response for message
    /// commands), or with a typed error.
    #[must_use]
    pub fn publish(
        &self,
        request: PublishRequest,
    ) -> BoxFuture<'static, Result<CommandResponseOrAck, Error>> {
        self.inner.publish(request)
    }

    /// Tears the pipeline down. Outstanding futures resolve with a
    /// stream-terminated failure.
    pub fn stop(&self) {
        self.inner.stop();
    }
}

struct QueuePublisher<F: PublishFlow> {
    ctx: PublisherContext,
    flow: Arc<F>,
    queue_tx: Sender<(F::Request, PublishContext)>,
    cap: InFlightCap,
    kill_tx: watch::Sender<bool>,
}

impl<F: PublishFlow> Publish for QueuePublisher<F> {
    fn publish(&self, request: PublishRequest) -> BoxFuture<'static, Result<CommandResponseOrAck, Error>> {
        let (result_tx, result_rx) = oneshot::channel();
        let target = request.target.clone();
        let mut context = PublishContext::new(request, result_tx);

        if *self.kill_tx.borrow() {
            context.complete(Err(Error::stream_terminated()));
        } else if let Some(guard) = self.cap.try_acquire() {
            context.guard = Some(guard);
            match self.flow.build_request(&target, context.message()) {
                Ok(wire) => match self.queue_tx.try_send((wire, context)) {
                    Ok(()) => {}
                    Err(TrySendError::Full((_, mut context))) => {
                        self.ctx
                            .registry()
                            .outbound_dropped(self.ctx.connection(), context.target_address())
                            .record(true);
                        context.complete(Err(Error::too_many_in_flight()));
                    }
                    Err(TrySendError::Closed((_, mut context))) => {
                        context.complete(Err(Error::stream_terminated()));
                    }
                },
                Err(e) => context.complete(Err(e)),
            }
        } else {
            debug!("{} Rejecting publish to {target}: in-flight budget exhausted.", self.ctx);
            self.ctx
                .registry()
                .outbound_dropped(self.ctx.connection(), context.target_address())
                .record(true);
            context.complete(Err(Error::too_many_in_flight()));
        }

        Box::pin(async move {
            result_rx
                .await
                .unwrap_or_else(|_| Err(Error::stream_terminated()))
        })
    }

    fn stop(&self) {
        let _ = self.kill_tx.send(true);
    }
}

/// Spawns a publisher pipeline around the given flow.
///
/// `max_queue_size` bounds queued plus in-flight publishes, rejecting the
/// newest offer beyond it; `parallelism` bounds concurrent `send` calls
/// while responses are still processed in enqueue order.
pub fn spawn<F: PublishFlow>(
    ctx: PublisherContext,
    flow: F,
    max_queue_size: usize,
    parallelism: usize,
) -> Addr {
    let capacity = max_queue_size.max(1);
    let (queue_tx, queue_rx) = channel(capacity);
    let (kill_tx, kill_rx) = watch::channel(false);
    let flow = Arc::new(flow);

    let loop_ctx = ctx.clone();
    let loop_flow = flow.clone();
    crate::spawn_task(ctx.clone(), async move {
        run(loop_ctx, loop_flow, queue_rx, kill_rx, parallelism.max(1)).await;
        Ok(())
    });

    Addr {
        inner: Arc::new(QueuePublisher {
            ctx,
            flow,
            queue_tx,
            cap: InFlightCap::new(capacity),
            kill_tx,
        }),
    }
}

async fn run<F: PublishFlow>(
    ctx: PublisherContext,
    flow: Arc<F>,
    queue_rx: Receiver<(F::Request, PublishContext)>,
    mut kill_rx: watch::Receiver<bool>,
    parallelism: usize,
) {
    let send_flow = flow.clone();
    let stream = ReceiverStream::new(queue_rx)
        .map(move |(wire, context)| {
            let flow = send_flow.clone();
            async move {
                let response = flow.send(wire).await;
                (response, context)
            }
        })
        .buffered(parallelism);
    tokio::pin!(stream);

    loop {
        tokio::select! {
            biased;
            changed = kill_rx.changed() => {
                if changed.is_err() || *kill_rx.borrow() {
                    break;
                }
            }
            next = stream.next() => {
                let Some((response, mut context)) = next else {
                    break;
                };
                let response_received = response.is_ok();
                let outcome = flow.on_response(&context, response).await;
                let registry = ctx.registry();
                registry
                    .outbound_published(ctx.connection(), context.target_address())
                    .record(outcome.is_ok());
                if response_received {
                    registry
                        .response_consumed(ctx.connection())
                        .record(outcome.is_ok());
                }
                if let Err(e) = &outcome {
                    debug!("{ctx} Publish to {} failed: {e}", context.target_address());
                }
                context.complete(outcome);
            }
        }
    }
    // dropping the stream drops queued and in-flight contexts, resolving
    // their futures with a stream-terminated failure
    info!("{ctx} Publisher stopped.");
}

#[cfg(test)]
mod test {
    use super::*;
    use hermes_system::signal::AckLabel;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn request(address: &str) -> PublishRequest {
        PublishRequest {
            signal: Signal::new("things.events:modified", "the-thing").with_topic("twin/events"),
            auto_ack_target: None,
            target: PublishTarget {
                address: address.to_string(),
            },
            message: ExternalMessage::text(BTreeMap::new(), "{}"),
            max_total_message_size: 1024,
            ack_size_quota: 512,
        }
    }

    fn ack(status: u16) -> CommandResponseOrAck {
        CommandResponseOrAck {
            response: None,
            ack: Acknowledgement {
                label: AckLabel::new("test"),
                entity_id: "the-thing".into(),
                status,
                headers: Default::default(),
                payload: None,
            },
        }
    }

    /// Flow that parks every request until a permit is released
    struct ParkedFlow {
        release: Arc<Semaphore>,
    }

    #[async_trait::async_trait]
    impl PublishFlow for ParkedFlow {
        type Request = ();
        type Response = ();

        fn build_request(&self, _target: &PublishTarget, _message: &ExternalMessage) -> Result<(), Error> {
            Ok(())
        }

        async fn send(&self, _request: ()) -> anyhow::Result<()> {
            self.release.acquire().await?.forget();
            Ok(())
        }

        async fn on_response(
            &self,
            _ctx: &PublishContext,
            response: anyhow::Result<()>,
        ) -> Result<CommandResponseOrAck, Error> {
            response.map_err(|e| Error::MessageSendingFailed {
                reason: e.to_string(),
            })?;
            Ok(ack(200))
        }
    }

    fn publisher_context() -> PublisherContext {
        PublisherContext::new(
            ConnectionId::new("conn-test"),
            FailureNotifier::dummy(ConnectionId::new("conn-test")),
            CounterRegistry::new(),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn overflow_rejects_the_newest_offer() {
        let release = Arc::new(Semaphore::new(0));
        let addr = spawn(
            publisher_context(),
            ParkedFlow {
                release: release.clone(),
            },
            2,
            1,
        );

        let a = addr.publish(request("/ack"));
        let b = addr.publish(request("/ack"));
        // budget of 2 is exhausted, the third offer resolves immediately
        let c = addr.publish(request("/ack")).await;
        assert_eq!(c, Err(Error::too_many_in_flight()));

        release.add_permits(2);
        let a = a.await.expect("a should resolve");
        let b = b.await.expect("b should resolve");
        assert_eq!(a.ack.status, 200);
        assert_eq!(b.ack.status, 200);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_resolves_outstanding_futures() {
        let release = Arc::new(Semaphore::new(0));
        let addr = spawn(publisher_context(), ParkedFlow { release }, 4, 1);
        let pending = addr.publish(request("/ack"));
        addr.stop();
        let result = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .expect("future must resolve after stop");
        assert_eq!(result, Err(Error::stream_terminated()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn publish_after_stop_fails_immediately() {
        let release = Arc::new(Semaphore::new(0));
        let addr = spawn(publisher_context(), ParkedFlow { release }, 4, 1);
        addr.stop();
        let result = addr.publish(request("/ack")).await;
        assert_eq!(result, Err(Error::stream_terminated()));
    }

    #[test]
    fn completion_is_idempotent() {
        let (tx, mut rx) = oneshot::channel();
        let mut context = PublishContext::new(request("/ack"), tx);
        context.complete(Ok(ack(200)));
        context.complete(Err(Error::too_many_in_flight()));
        drop(context);
        let first = rx.try_recv().expect("first completion must be delivered");
        assert_eq!(first, Ok(ack(200)));
    }

    #[test]
    fn in_flight_cap_returns_slots_on_drop() {
        let cap = InFlightCap::new(2);
        let a = cap.try_acquire().expect("slot");
        let b = cap.try_acquire().expect("slot");
        assert!(cap.try_acquire().is_none());
        assert_eq!(cap.in_flight(), 2);
        drop(a);
        assert_eq!(cap.in_flight(), 1);
        let _c = cap.try_acquire().expect("slot after release");
        drop(b);
    }
}
