//! The fixed metric catalog. Every metric the pipeline reports is named
//! here; layers obtain instruments through [`ClientMetrics`] so names and
//! tags stay consistent.

use std::sync::{Arc, Weak};

use courier_metrics::{Counter, GaugeSource, Meter, MetricId, MetricRegistry, Reduction, Timer};

/// `{channel-name, service-name, endpoint, status}`; status is `success`
/// (2xx) or `failure` (QoS, 5xx, i/o).
pub const CLIENT_RESPONSE: &str = "courier.client.response";
/// `{channel-name, reason}`; marked when a layer declines a request.
pub const CLIENT_LIMITED: &str = "courier.client.limited";
/// `{channel-name}`; requests currently sitting in the queue.
pub const REQUESTS_QUEUED: &str = "courier.client.requests.queued";
/// `{channel-name}`; time from enqueue to first dispatch.
pub const REQUEST_QUEUED_TIME: &str = "courier.client.request.queued.time";
/// `{channel-name, service-name, endpoint}`; per-endpoint queue variant.
pub const REQUESTS_ENDPOINT_QUEUED: &str = "courier.client.requests.endpoint.queued";
/// `{channel-name, service-name, endpoint}`; per-endpoint queue-time variant.
pub const REQUEST_ENDPOINT_QUEUED_TIME: &str = "courier.client.request.endpoint.queued.time";
/// `{channel-name, reason}`; reasons: `STATUS_429`, `STATUS_503`,
/// `STATUS_308`, `IO_EXCEPTION`, `TIMEOUT`.
pub const REQUEST_RETRY: &str = "courier.client.request.retry";
/// `{channel-name, hostIndex}`; min of the live limiter ceilings.
pub const LIMITER_MAX: &str = "courier.concurrencylimiter.max";
/// `{channel-name, hostIndex}`; sum of the live in-flight counts.
pub const LIMITER_IN_FLIGHT: &str = "courier.concurrencylimiter.in-flight";
/// `{channel-name}`; permits dropped without an explicit release.
pub const LIMITER_LEAK: &str = "courier.concurrencylimiter.leak";
/// `{channel-name}`; response bodies dropped without being released.
pub const RESPONSE_LEAK: &str = "courier.client.response.leak";
/// `{channel-name}`; requests that succeeded on the pinned host.
pub const PIN_SUCCESS: &str = "courier.pinuntilerror.success";
/// `{channel-name, reason}`; reasons: `limited`, `responseCode`, `throwable`.
pub const PIN_NEXT_NODE: &str = "courier.pinuntilerror.nextNode";
/// `{channel-name}`; host-order reshuffles.
pub const PIN_RESHUFFLE: &str = "courier.pinuntilerror.reshuffle";
/// `{channel-name, hostIndex}`; the balanced strategy's current score.
pub const BALANCED_SCORE: &str = "courier.balanced.score";
/// `{channel-name, strategy}`; marked when a strategy is put in place.
pub const NODE_SELECTION_STRATEGY: &str = "courier.nodeselection.strategy";

#[derive(Clone)]
pub(crate) struct ClientMetrics {
    registry: Arc<MetricRegistry>,
    channel_name: Arc<str>,
}

impl ClientMetrics {
    pub(crate) fn of(registry: &Arc<MetricRegistry>, channel_name: &str) -> Self {
        Self { registry: Arc::clone(registry), channel_name: channel_name.into() }
    }

    pub(crate) fn channel_name(&self) -> &Arc<str> {
        &self.channel_name
    }

    fn id(&self, name: &'static str) -> MetricId {
        MetricId::new(name).with_tag("channel-name", self.channel_name.to_string())
    }

    pub(crate) fn response(&self, service: &str, endpoint: &str, status: &'static str) -> Meter {
        self.registry.meter(
            self.id(CLIENT_RESPONSE)
                .with_tag("service-name", service.to_string())
                .with_tag("endpoint", endpoint.to_string())
                .with_tag("status", status),
        )
    }

    pub(crate) fn limited(&self, reason: &'static str) -> Meter {
        self.registry.meter(self.id(CLIENT_LIMITED).with_tag("reason", reason))
    }

    pub(crate) fn requests_queued(&self) -> Counter {
        self.registry.counter(self.id(REQUESTS_QUEUED))
    }

    pub(crate) fn request_queued_time(&self) -> Timer {
        self.registry.timer(self.id(REQUEST_QUEUED_TIME))
    }

    pub(crate) fn requests_endpoint_queued(&self, service: &str, endpoint: &str) -> Counter {
        self.registry.counter(
            self.id(REQUESTS_ENDPOINT_QUEUED)
                .with_tag("service-name", service.to_string())
                .with_tag("endpoint", endpoint.to_string()),
        )
    }

    pub(crate) fn request_endpoint_queued_time(&self, service: &str, endpoint: &str) -> Timer {
        self.registry.timer(
            self.id(REQUEST_ENDPOINT_QUEUED_TIME)
                .with_tag("service-name", service.to_string())
                .with_tag("endpoint", endpoint.to_string()),
        )
    }

    pub(crate) fn retry(&self, reason: &'static str) -> Meter {
        self.registry.meter(self.id(REQUEST_RETRY).with_tag("reason", reason))
    }

    pub(crate) fn limiter_leak(&self) -> Meter {
        self.registry.meter(self.id(LIMITER_LEAK))
    }

    pub(crate) fn response_leak(&self) -> Meter {
        self.registry.meter(self.id(RESPONSE_LEAK))
    }

    pub(crate) fn register_limiter_max(&self, host_index: usize, source: Weak<dyn GaugeSource>) {
        self.registry.register_gauge(
            self.id(LIMITER_MAX).with_tag("hostIndex", host_index.to_string()),
            Reduction::Min,
            source,
        );
    }

    pub(crate) fn register_limiter_in_flight(&self, host_index: usize, source: Weak<dyn GaugeSource>) {
        self.registry.register_gauge(
            self.id(LIMITER_IN_FLIGHT).with_tag("hostIndex", host_index.to_string()),
            Reduction::Sum,
            source,
        );
    }

    pub(crate) fn register_balanced_score(&self, host_index: usize, source: Weak<dyn GaugeSource>) {
        self.registry.register_gauge(
            self.id(BALANCED_SCORE).with_tag("hostIndex", host_index.to_string()),
            Reduction::Sum,
            source,
        );
    }

    pub(crate) fn pin_success(&self) -> Meter {
        self.registry.meter(self.id(PIN_SUCCESS))
    }

    pub(crate) fn pin_next_node(&self, reason: &'static str) -> Meter {
        self.registry.meter(self.id(PIN_NEXT_NODE).with_tag("reason", reason))
    }

    pub(crate) fn pin_reshuffle(&self) -> Meter {
        self.registry.meter(self.id(PIN_RESHUFFLE))
    }

    pub(crate) fn node_selection_strategy(&self, strategy: &'static str) -> Meter {
        self.registry.meter(self.id(NODE_SELECTION_STRATEGY).with_tag("strategy", strategy))
    }
}
