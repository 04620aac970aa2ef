//! The per-host gate: wraps one host's [`Channel`] as a [`LimitedChannel`]
//! whose admissions are controlled by the AIMD limiter.

use std::{
    pin::Pin,
    sync::{Arc, Weak},
    task::{ready, Context, Poll},
};

use courier_metrics::{GaugeSource, Meter};
use futures::Future;
use tracing::debug;

use crate::{
    channel::{Channel, ChannelToLimitedChannelAdapter, LimitedChannel, ResponseFuture},
    config::ClientQos,
    error::ClientError,
    limiter::{AimdLimiter, Behavior, Outcome, Permit},
    metrics::ClientMetrics,
    types::{Endpoint, Request, Response},
};

pub(crate) struct ConcurrencyLimitedChannel {
    delegate: Arc<dyn Channel>,
    limiter: Arc<AimdLimiter>,
    limited_meter: Meter,
    // Keeps the gauge sources alive for as long as this channel lives; the
    // registry only holds weak references.
    _gauges: [Arc<LimiterGauge>; 2],
}

impl ConcurrencyLimitedChannel {
    /// Builds the host gate, or a plain always-accepting adapter when the
    /// client has opted out of sympathetic QoS.
    pub(crate) fn create(
        metrics: &ClientMetrics,
        client_qos: ClientQos,
        delegate: Arc<dyn Channel>,
        host_index: usize,
        behavior: Behavior,
    ) -> Arc<dyn LimitedChannel> {
        match client_qos {
            ClientQos::Enabled => {
                Arc::new(Self::new(metrics, delegate, host_index, behavior))
            }
            ClientQos::DangerousDisableSympatheticClientQos => {
                Arc::new(ChannelToLimitedChannelAdapter::new(delegate))
            }
        }
    }

    fn new(
        metrics: &ClientMetrics,
        delegate: Arc<dyn Channel>,
        host_index: usize,
        behavior: Behavior,
    ) -> Self {
        let limiter =
            Arc::new(AimdLimiter::new(behavior).with_leak_meter(metrics.limiter_leak()));

        let max = Arc::new(LimiterGauge { limiter: Arc::clone(&limiter), kind: GaugeKind::Max });
        let inflight =
            Arc::new(LimiterGauge { limiter: Arc::clone(&limiter), kind: GaugeKind::InFlight });
        metrics.register_limiter_max(host_index, Arc::downgrade(&max) as Weak<dyn GaugeSource>);
        metrics
            .register_limiter_in_flight(host_index, Arc::downgrade(&inflight) as Weak<dyn GaugeSource>);

        Self {
            delegate,
            limiter,
            limited_meter: metrics.limited("ConcurrencyLimitedChannel"),
            _gauges: [max, inflight],
        }
    }

    #[cfg(test)]
    pub(crate) fn limiter(&self) -> &Arc<AimdLimiter> {
        &self.limiter
    }
}

impl LimitedChannel for ConcurrencyLimitedChannel {
    fn maybe_execute(&self, endpoint: &Endpoint, request: &Request) -> Option<ResponseFuture> {
        match self.limiter.acquire() {
            Some(permit) => {
                debug!(
                    inflight = self.limiter.inflight(),
                    max = self.limiter.limit(),
                    "sending"
                );
                let inner = self.delegate.execute(endpoint, request);
                Some(Box::pin(LimitedFuture {
                    inner,
                    permit: Some(permit),
                    behavior: self.limiter.behavior(),
                }))
            }
            None => {
                debug!(max = self.limiter.limit(), "limited");
                self.limited_meter.mark();
                None
            }
        }
    }
}

enum GaugeKind {
    Max,
    InFlight,
}

struct LimiterGauge {
    limiter: Arc<AimdLimiter>,
    kind: GaugeKind,
}

impl GaugeSource for LimiterGauge {
    fn value(&self) -> f64 {
        match self.kind {
            GaugeKind::Max => self.limiter.limit(),
            GaugeKind::InFlight => f64::from(self.limiter.inflight()),
        }
    }
}

/// Owns the permit for the duration of the downstream call. The permit is
/// released with the classified outcome on completion, or with `Ignore` if
/// the future is dropped before completing (cancellation). Either way it
/// is released exactly once.
struct LimitedFuture {
    inner: ResponseFuture,
    permit: Option<Permit>,
    behavior: Behavior,
}

impl Future for LimitedFuture {
    type Output = Result<Response, ClientError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let result = ready!(this.inner.as_mut().poll(cx));
        if let Some(permit) = this.permit.take() {
            let outcome = match &result {
                Ok(response) => this.behavior.classify_status(response.status()),
                Err(error) => this.behavior.classify_error(error),
            };
            permit.release(outcome);
        }
        Poll::Ready(result)
    }
}

impl Drop for LimitedFuture {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            permit.release(Outcome::Ignore);
        }
    }
}
