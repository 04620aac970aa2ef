//! Pipeline composition. Layers are glued in a fixed order per client:
//!
//! ```text
//! caller → instrumentation → RetryingChannel → QueuedChannel
//!        → NodeSelectionChannel → { ConcurrencyLimitedChannel(host_i) }
//!        → transport
//! ```

use std::sync::Arc;

use courier_metrics::{Meter, MetricRegistry};

use crate::{
    channel::{Channel, ResponseFuture},
    config::ClientConfig,
    error::BuildError,
    limited::ConcurrencyLimitedChannel,
    limiter::Behavior,
    metrics::ClientMetrics,
    queue::{QueueInstrumentation, QueuedChannel, StickySessionFactory},
    retry::RetryingChannel,
    selection::NodeSelectionChannel,
    types::{Endpoint, Request},
};

/// One upstream host: its transport channel plus the base URL used to
/// recognize redirects that point at it.
struct HostSpec {
    base_url: String,
    channel: Arc<dyn Channel>,
}

/// Assembles a [`Client`] from configuration, a metric registry, and one
/// transport channel per host.
pub struct ClientBuilder {
    config: ClientConfig,
    registry: Arc<MetricRegistry>,
    hosts: Vec<HostSpec>,
}

impl ClientBuilder {
    pub fn new(config: ClientConfig, registry: Arc<MetricRegistry>) -> Self {
        Self { config, registry, hosts: Vec::new() }
    }

    pub fn host(mut self, base_url: impl Into<String>, channel: Arc<dyn Channel>) -> Self {
        self.hosts.push(HostSpec { base_url: base_url.into(), channel });
        self
    }

    pub fn build(self) -> Result<Client, BuildError> {
        if self.hosts.is_empty() {
            return Err(BuildError::NoHosts { channel_name: self.config.channel_name });
        }

        let metrics = ClientMetrics::of(&self.registry, &self.config.channel_name);

        let limited = self
            .hosts
            .iter()
            .enumerate()
            .map(|(host_index, spec)| {
                ConcurrencyLimitedChannel::create(
                    &metrics,
                    self.config.client_qos,
                    Arc::clone(&spec.channel),
                    host_index,
                    Behavior::Host,
                )
            })
            .collect();
        let selection = Arc::new(NodeSelectionChannel::new(
            self.config.node_selection_strategy,
            limited,
            &metrics,
        ));

        let queued = QueuedChannel::new(
            Arc::clone(&selection) as _,
            metrics.channel_name().clone(),
            QueueInstrumentation::channel(&metrics),
            self.config.max_queue_size,
        );

        let retrying = RetryingChannel::new(
            Arc::new(queued),
            Arc::clone(&selection),
            self.hosts.iter().map(|spec| spec.base_url.clone()).collect(),
            &self.config,
            metrics.clone(),
        );

        let sticky = StickySessionFactory::new(
            Arc::clone(&selection),
            metrics.clone(),
            self.config.max_queue_size,
        );

        Ok(Client {
            channel: Arc::new(InstrumentedChannel::new(Arc::new(retrying), metrics.clone())),
            selection,
            metrics,
            max_queue_size: self.config.max_queue_size,
            sticky,
        })
    }
}

/// The assembled pipeline. `Client` itself is the caller-facing
/// [`Channel`]; sticky sessions and endpoint queues minted from it share
/// its hosts, limiters, and node selection.
pub struct Client {
    channel: Arc<dyn Channel>,
    selection: Arc<NodeSelectionChannel>,
    metrics: ClientMetrics,
    max_queue_size: usize,
    sticky: StickySessionFactory,
}

impl Client {
    /// A fresh session whose requests all land on one host.
    pub fn sticky_session(&self) -> QueuedChannel {
        self.sticky.session()
    }

    /// A dedicated queue for one endpoint, reported under the per-endpoint
    /// queue metrics instead of the channel-wide ones. Useful when one
    /// endpoint's bursts should not hide in the shared queue counters.
    pub fn endpoint_queue(&self, endpoint: &Endpoint) -> QueuedChannel {
        QueuedChannel::new(
            Arc::clone(&self.selection) as _,
            self.metrics.channel_name().clone(),
            QueueInstrumentation::endpoint(&self.metrics, endpoint),
            self.max_queue_size,
        )
    }
}

impl Channel for Client {
    fn execute(&self, endpoint: &Endpoint, request: &Request) -> ResponseFuture {
        self.channel.execute(endpoint, request)
    }
}

/// Outermost layer: marks the response meter for every completed call and
/// arms body-leak tracking on successful responses.
struct InstrumentedChannel {
    delegate: Arc<dyn Channel>,
    metrics: ClientMetrics,
    response_leak: Meter,
}

impl InstrumentedChannel {
    fn new(delegate: Arc<dyn Channel>, metrics: ClientMetrics) -> Self {
        let response_leak = metrics.response_leak();
        Self { delegate, metrics, response_leak }
    }
}

impl Channel for InstrumentedChannel {
    fn execute(&self, endpoint: &Endpoint, request: &Request) -> ResponseFuture {
        let inner = self.delegate.execute(endpoint, request);
        let metrics = self.metrics.clone();
        let leak_meter = self.response_leak.clone();
        let service = endpoint.service_name().to_string();
        let name = endpoint.endpoint_name().to_string();
        Box::pin(async move {
            let result = inner.await;
            match &result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        metrics.response(&service, &name, "success").mark();
                    } else if matches!(status.as_u16(), 429 | 503) || status.is_server_error() {
                        metrics.response(&service, &name, "failure").mark();
                    }
                }
                Err(crate::error::ClientError::Io(_)) | Err(crate::error::ClientError::Timeout) => {
                    metrics.response(&service, &name, "failure").mark();
                }
                Err(_) => {}
            }
            result.map(|mut response| {
                response.track_leaks(leak_meter);
                response
            })
        })
    }
}
