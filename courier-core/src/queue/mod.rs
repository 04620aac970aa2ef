//! The bounded request queue. Absorbs "limited" responses from the layer
//! below and re-drives them as capacity returns.
//!
//! Requests avoid the queue entirely while it is empty: the fast path
//! attempts the delegate directly and only falls into the queue when the
//! delegate declines. Every completion of a dispatched request triggers
//! another drain pass, so queued work moves as soon as a permit frees up.

mod sticky;

pub use self::sticky::StickySessionFactory;

use std::{
    collections::VecDeque,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        Arc, OnceLock,
    },
    task::{ready, Context, Poll},
    time::Duration,
};

use courier_metrics::{Counter, Timer, TimerContext};
use futures::Future;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, Span};

use crate::{
    channel::{Channel, LimitedChannel, ResponseFuture},
    error::ClientError,
    metrics::ClientMetrics,
    types::{Endpoint, Request, Response},
};

/// Queue metrics come in a per-channel and a per-endpoint flavor. The
/// counter is created lazily because counters, unlike timers, cannot be
/// elided once they exist: they support both directions.
pub(crate) struct QueueInstrumentation {
    requests_queued: Box<dyn Fn() -> Counter + Send + Sync>,
    queued_time: Timer,
}

impl QueueInstrumentation {
    pub(crate) fn channel(metrics: &ClientMetrics) -> Self {
        let metrics = metrics.clone();
        Self {
            queued_time: metrics.request_queued_time(),
            requests_queued: Box::new(move || metrics.requests_queued()),
        }
    }

    pub(crate) fn endpoint(metrics: &ClientMetrics, endpoint: &Endpoint) -> Self {
        let metrics = metrics.clone();
        let service = endpoint.service_name().to_string();
        let name = endpoint.endpoint_name().to_string();
        Self {
            queued_time: metrics.request_endpoint_queued_time(&service, &name),
            requests_queued: Box::new(move || metrics.requests_endpoint_queued(&service, &name)),
        }
    }
}

struct DeferredCall {
    endpoint: Endpoint,
    request: Request,
    promise: oneshot::Sender<Result<Response, ClientError>>,
    timer: TimerContext,
    span: Span,
}

struct QueueInner {
    delegate: Arc<dyn LimitedChannel>,
    channel_name: Arc<str>,
    queue: Mutex<VecDeque<DeferredCall>>,
    // The deque's own length is only consulted under the lock; admission
    // decisions read this estimate instead.
    size_estimate: AtomicI32,
    max_queue_size: usize,
    queued_counter: OnceLock<Counter>,
    instrumentation: QueueInstrumentation,
    // Deliberately unsynchronized with the timer reads: a race may skip or
    // extra-record one zero timing, which is fine for a best-effort elision
    // of endpoints that never queue.
    should_record_queue_metrics: AtomicBool,
}

/// A [`Channel`] over a [`LimitedChannel`]: requests the delegate declines
/// are parked in a FIFO (up to `max_queue_size`) instead of failing.
pub struct QueuedChannel {
    inner: Arc<QueueInner>,
}

impl QueuedChannel {
    pub(crate) fn new(
        delegate: Arc<dyn LimitedChannel>,
        channel_name: Arc<str>,
        instrumentation: QueueInstrumentation,
        max_queue_size: usize,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                delegate,
                channel_name,
                queue: Mutex::new(VecDeque::new()),
                size_estimate: AtomicI32::new(0),
                max_queue_size,
                queued_counter: OnceLock::new(),
                instrumentation,
                should_record_queue_metrics: AtomicBool::new(false),
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn size_estimate(&self) -> i32 {
        self.inner.size_estimate.load(Ordering::Relaxed)
    }
}

impl Channel for QueuedChannel {
    fn execute(&self, endpoint: &Endpoint, request: &Request) -> ResponseFuture {
        match self.inner.maybe_execute(endpoint, request) {
            Some(future) => future,
            None => {
                let max_queue_size = self.inner.max_queue_size;
                Box::pin(async move { Err(ClientError::QueueFull { max_queue_size }) })
            }
        }
    }
}

impl QueueInner {
    /// Enqueues and then drives the queue as far as it will go. `None`
    /// means the queue itself was full.
    fn maybe_execute(self: &Arc<Self>, endpoint: &Endpoint, request: &Request) -> Option<ResponseFuture> {
        // Optimistically avoid the queue while it is empty; queueing adds
        // contention between callers and should only happen to shed load.
        if self.size_estimate.load(Ordering::Relaxed) <= 0 {
            if let Some(result) = self.delegate.maybe_execute(endpoint, request) {
                if self.should_record_queue_metrics.load(Ordering::Relaxed) {
                    self.instrumentation.queued_time.record(Duration::ZERO);
                }
                return Some(Box::pin(ScheduleOnComplete {
                    inner: result,
                    queue: Some(Arc::clone(self)),
                }));
            }
        }

        // Re-read the size: the optimistic attempt above may have taken
        // long enough for other callers to fill the queue.
        if self.size_estimate.load(Ordering::Relaxed) >= self.max_queue_size as i32 {
            return None;
        }

        self.should_record_queue_metrics.store(true, Ordering::Relaxed);

        let (promise, rx) = oneshot::channel();
        let call = DeferredCall {
            endpoint: endpoint.clone(),
            request: request.clone(),
            promise,
            timer: self.instrumentation.queued_time.start(),
            span: tracing::debug_span!(
                "courier.request.enqueued",
                channel = %self.channel_name,
                service = endpoint.service_name(),
                endpoint = endpoint.endpoint_name(),
            ),
        };
        self.queue.lock().push_back(call);
        let new_size = self.increment_queue_size();
        debug!(queue_size = new_size, channel = %self.channel_name, "request queued");

        self.schedule();

        Some(Box::pin(QueuedResponseFuture { rx }))
    }

    fn counter(&self) -> &Counter {
        self.queued_counter.get_or_init(|| (self.instrumentation.requests_queued)())
    }

    fn increment_queue_size(&self) -> i32 {
        self.counter().inc();
        self.size_estimate.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn decrement_queue_size(&self) {
        self.size_estimate.fetch_sub(1, Ordering::Relaxed);
        self.counter().dec();
    }

    /// Drains as many queued calls as the delegate will take. Invoked on
    /// every enqueue and every completion; safe to run from any number of
    /// tasks at once because each queue operation and each delegate
    /// attempt is individually atomic.
    fn schedule(self: &Arc<Self>) {
        let mut num_scheduled = 0usize;
        while self.schedule_next() {
            num_scheduled += 1;
        }
        debug!(num_scheduled, channel = %self.channel_name, "scheduled queued requests");
    }

    /// Attempts to dispatch the head of the queue. Returns `true` if more
    /// calls may be schedulable, `false` when the queue is empty or the
    /// delegate declined (in which case the head went back to the front).
    fn schedule_next(self: &Arc<Self>) -> bool {
        let head = { self.queue.lock().pop_front() };
        let Some(head) = head else {
            return false;
        };

        // A closed promise means the caller already cancelled; drop the
        // call without dispatching it. A cancel racing past this check is
        // handled by the forwarding task below.
        if head.promise.is_closed() {
            self.decrement_queue_size();
            head.timer.stop();
            drop(head.span);
            return true;
        }

        let attempt = head.span.enter();
        match self.delegate.maybe_execute(&head.endpoint, &head.request) {
            Some(response_future) => {
                drop(attempt);
                self.decrement_queue_size();
                head.timer.stop();
                drop(head.span);

                let this = Arc::clone(self);
                let mut promise = head.promise;
                tokio::spawn(async move {
                    let forwarded = tokio::select! {
                        result = response_future => Some(result),
                        // Cancelled mid-flight: leaving the select drops
                        // the downstream future, which propagates the
                        // cancellation.
                        _ = promise.closed() => None,
                    };
                    if let Some(result) = forwarded {
                        if let Err(unsent) = promise.send(result) {
                            // The caller is gone; nobody else will release
                            // this body.
                            if let Ok(response) = unsent {
                                response.close();
                            }
                        }
                    }
                    this.schedule();
                });
                true
            }
            None => {
                drop(attempt);
                // Nothing downstream will take it right now; put it back
                // at the front and wait for the next completion.
                self.queue.lock().push_front(head);
                false
            }
        }
    }
}

/// Caller-facing future for a queued request: resolves when the forwarding
/// task completes the promise. Dropping it is cancellation; the queue
/// observes the closed promise on its next pass.
struct QueuedResponseFuture {
    rx: oneshot::Receiver<Result<Response, ClientError>>,
}

impl Future for QueuedResponseFuture {
    type Output = Result<Response, ClientError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(Pin::new(&mut self.rx).poll(cx)) {
            Ok(result) => Poll::Ready(result),
            Err(_) => Poll::Ready(Err(ClientError::Closed)),
        }
    }
}

/// Fast-path wrapper: runs one more drain pass when the dispatched call
/// completes or is dropped, mirroring the completion hook on queued calls.
struct ScheduleOnComplete {
    inner: ResponseFuture,
    queue: Option<Arc<QueueInner>>,
}

impl Future for ScheduleOnComplete {
    type Output = Result<Response, ClientError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let result = ready!(this.inner.as_mut().poll(cx));
        if let Some(queue) = this.queue.take() {
            queue.schedule();
        }
        Poll::Ready(result)
    }
}

impl Drop for ScheduleOnComplete {
    fn drop(&mut self) {
        if let Some(queue) = self.queue.take() {
            queue.schedule();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicUsize;

    use http::{Method, StatusCode};

    use super::*;

    pub(crate) fn endpoint() -> Endpoint {
        Endpoint::new("test-service", "op", Method::GET, "/op")
    }

    /// A delegate whose admission can be toggled and whose responses
    /// complete only when the test says so.
    pub(crate) struct GateChannel {
        accepting: AtomicBool,
        pending: Mutex<Vec<oneshot::Sender<Result<Response, ClientError>>>>,
        executed: AtomicUsize,
    }

    impl GateChannel {
        pub(crate) fn new(accepting: bool) -> Arc<Self> {
            Arc::new(Self {
                accepting: AtomicBool::new(accepting),
                pending: Mutex::new(Vec::new()),
                executed: AtomicUsize::new(0),
            })
        }

        pub(crate) fn set_accepting(&self, accepting: bool) {
            self.accepting.store(accepting, Ordering::SeqCst);
        }

        pub(crate) fn executed(&self) -> usize {
            self.executed.load(Ordering::SeqCst)
        }

        pub(crate) fn pending(&self) -> usize {
            self.pending.lock().len()
        }

        pub(crate) fn complete_next(&self, status: StatusCode) {
            let tx = self.pending.lock().remove(0);
            let _ = tx.send(Ok(Response::new(status)));
        }
    }

    impl LimitedChannel for GateChannel {
        fn maybe_execute(&self, _endpoint: &Endpoint, _request: &Request) -> Option<ResponseFuture> {
            if !self.accepting.load(Ordering::SeqCst) {
                return None;
            }
            self.executed.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = oneshot::channel();
            self.pending.lock().push(tx);
            Some(Box::pin(async move { rx.await.unwrap_or(Err(ClientError::Closed)) }))
        }
    }

    fn queued(delegate: Arc<GateChannel>, max_queue_size: usize) -> (QueuedChannel, Arc<MetricRegistry>) {
        let registry = Arc::new(MetricRegistry::new());
        let metrics = ClientMetrics::of(&registry, "test-channel");
        let channel = QueuedChannel::new(
            delegate,
            metrics.channel_name().clone(),
            QueueInstrumentation::channel(&metrics),
            max_queue_size,
        );
        (channel, registry)
    }

    use courier_metrics::{MetricId, MetricRegistry};

    fn queued_counter_id() -> MetricId {
        MetricId::new(crate::metrics::REQUESTS_QUEUED).with_tag("channel-name", "test-channel")
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn fast_path_skips_the_queue() {
        let delegate = GateChannel::new(true);
        let (channel, _registry) = queued(Arc::clone(&delegate), 10);

        let fut = channel.execute(&endpoint(), &Request::new());
        assert_eq!(delegate.executed(), 1);
        assert_eq!(channel.size_estimate(), 0);

        delegate.complete_next(StatusCode::OK);
        fut.await.unwrap().close();
    }

    #[tokio::test]
    async fn full_queue_fails_synchronously() {
        let delegate = GateChannel::new(false);
        let (channel, _registry) = queued(Arc::clone(&delegate), 2);

        let first = channel.execute(&endpoint(), &Request::new());
        let second = channel.execute(&endpoint(), &Request::new());
        let third = channel.execute(&endpoint(), &Request::new());
        assert_eq!(channel.size_estimate(), 2);

        let error = third.await.unwrap_err();
        assert!(error.to_string().contains("queue is full"), "got: {error}");
        drop((first, second));
    }

    #[tokio::test]
    async fn zero_capacity_queue_only_ever_uses_the_fast_path() {
        let delegate = GateChannel::new(true);
        let (channel, _registry) = queued(Arc::clone(&delegate), 0);

        let fut = channel.execute(&endpoint(), &Request::new());
        delegate.complete_next(StatusCode::OK);
        fut.await.unwrap().close();

        delegate.set_accepting(false);
        let error = channel.execute(&endpoint(), &Request::new()).await.unwrap_err();
        assert!(matches!(error, ClientError::QueueFull { max_queue_size: 0 }));
    }

    #[tokio::test]
    async fn queued_requests_dispatch_in_fifo_order_as_capacity_returns() {
        let delegate = GateChannel::new(true);
        let (channel, _registry) = queued(Arc::clone(&delegate), 10);

        // Occupy the delegate, then close the gate so the rest queue up.
        let inflight = channel.execute(&endpoint(), &Request::new());
        delegate.set_accepting(false);

        let a = channel.execute(&endpoint(), &Request::new());
        let b = channel.execute(&endpoint(), &Request::new());
        assert_eq!(channel.size_estimate(), 2);
        assert_eq!(delegate.executed(), 1);

        // Completion of the in-flight request re-opens the gate and drains
        // the queue front-to-back.
        delegate.set_accepting(true);
        delegate.complete_next(StatusCode::OK);
        inflight.await.unwrap().close();
        settle().await;

        assert_eq!(delegate.executed(), 3);
        assert_eq!(channel.size_estimate(), 0);

        delegate.complete_next(StatusCode::OK);
        delegate.complete_next(StatusCode::CREATED);
        assert_eq!(a.await.unwrap().status(), StatusCode::OK);
        assert_eq!(b.await.unwrap().status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn cancelled_queued_request_is_dropped_without_dispatch() {
        let delegate = GateChannel::new(false);
        let (channel, registry) = queued(Arc::clone(&delegate), 10);

        let first = channel.execute(&endpoint(), &Request::new());
        let second = channel.execute(&endpoint(), &Request::new());
        assert_eq!(registry.counter_value(&queued_counter_id()), Some(2));

        drop(second);
        delegate.set_accepting(true);

        // A third submission drives the drain: the first dispatches, the
        // cancelled second is discarded.
        let third = channel.execute(&endpoint(), &Request::new());
        settle().await;
        assert_eq!(delegate.executed(), 2);
        assert_eq!(channel.size_estimate(), 0);
        assert_eq!(registry.counter_value(&queued_counter_id()), Some(0));

        delegate.complete_next(StatusCode::OK);
        delegate.complete_next(StatusCode::OK);
        first.await.unwrap().close();
        third.await.unwrap().close();
    }

    #[tokio::test]
    async fn cancelling_a_dispatched_request_reaches_the_delegate() {
        let delegate = GateChannel::new(false);
        let (channel, _registry) = queued(Arc::clone(&delegate), 10);

        let fut = channel.execute(&endpoint(), &Request::new());
        delegate.set_accepting(true);
        // Drive the drain via another enqueue.
        let other = channel.execute(&endpoint(), &Request::new());
        settle().await;
        assert_eq!(delegate.executed(), 2);
        assert_eq!(delegate.pending(), 2);

        drop(fut);
        settle().await;
        // The forwarding task dropped the downstream future; its oneshot
        // sender is now closed.
        assert_eq!(delegate.pending(), 2);
        delegate.complete_next(StatusCode::OK);
        delegate.complete_next(StatusCode::OK);
        other.await.unwrap().close();
    }

    #[tokio::test]
    async fn queue_time_zero_is_recorded_on_the_fast_path_after_first_queueing() {
        let delegate = GateChannel::new(true);
        let (channel, registry) = queued(Arc::clone(&delegate), 10);
        let timer_id = MetricId::new(crate::metrics::REQUEST_QUEUED_TIME)
            .with_tag("channel-name", "test-channel");

        // Before anything queues, the fast path records no timings.
        let fut = channel.execute(&endpoint(), &Request::new());
        delegate.complete_next(StatusCode::OK);
        fut.await.unwrap().close();
        assert_eq!(registry.timer_count(&timer_id), Some(0));

        // Force one request through the queue.
        delegate.set_accepting(false);
        let queued_fut = channel.execute(&endpoint(), &Request::new());
        delegate.set_accepting(true);
        let driver = channel.execute(&endpoint(), &Request::new());
        settle().await;
        delegate.complete_next(StatusCode::OK);
        delegate.complete_next(StatusCode::OK);
        queued_fut.await.unwrap().close();
        driver.await.unwrap().close();
        let after_queueing = registry.timer_count(&timer_id).unwrap();
        assert!(after_queueing >= 1);

        // Subsequent fast-path requests record zero timings.
        let fut = channel.execute(&endpoint(), &Request::new());
        delegate.complete_next(StatusCode::OK);
        fut.await.unwrap().close();
        assert_eq!(registry.timer_count(&timer_id), Some(after_queueing + 1));
    }
}
