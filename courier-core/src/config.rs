use std::time::Duration;

/// Whether this client participates in sympathetic client-side QoS by
/// limiting its own concurrency per host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientQos {
    Enabled,
    /// Disables the per-host concurrency limiter entirely. Requests are
    /// sent regardless of how the upstream has been responding.
    DangerousDisableSympatheticClientQos,
}

/// How server-driven QoS responses (429, 503) are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerQos {
    /// Retry with backoff, honoring `Retry-After`.
    AutomaticRetry,
    /// Surface 429 and 503 responses to the caller unchanged.
    Propagate429And503ToCaller,
}

/// Whether timed-out requests are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOnTimeout {
    Disabled,
    DangerousEnableAtRiskOfRetryStorms,
}

/// How requests are spread across a client's hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeSelectionStrategy {
    PinUntilError,
    RoundRobin,
    Balanced,
}

impl NodeSelectionStrategy {
    pub(crate) fn label(self) -> &'static str {
        match self {
            NodeSelectionStrategy::PinUntilError => "PIN_UNTIL_ERROR",
            NodeSelectionStrategy::RoundRobin => "ROUND_ROBIN",
            NodeSelectionStrategy::Balanced => "BALANCED",
        }
    }
}

/// Configuration consumed by the pipeline. Parsing config files into this
/// struct is the embedding application's concern.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub channel_name: String,
    pub client_name: String,
    pub max_queue_size: usize,
    pub max_num_retries: u32,
    pub backoff_slot_size: Duration,
    pub server_qos: ServerQos,
    pub client_qos: ClientQos,
    pub retry_on_timeout: RetryOnTimeout,
    pub node_selection_strategy: NodeSelectionStrategy,
}

impl ClientConfig {
    pub fn new(channel_name: impl Into<String>) -> Self {
        let channel_name = channel_name.into();
        Self {
            client_name: channel_name.clone(),
            channel_name,
            max_queue_size: 100_000,
            max_num_retries: 4,
            backoff_slot_size: Duration::from_millis(250),
            server_qos: ServerQos::AutomaticRetry,
            client_qos: ClientQos::Enabled,
            retry_on_timeout: RetryOnTimeout::Disabled,
            node_selection_strategy: NodeSelectionStrategy::Balanced,
        }
    }

    pub fn with_client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    pub fn with_max_num_retries(mut self, max_num_retries: u32) -> Self {
        self.max_num_retries = max_num_retries;
        self
    }

    pub fn with_backoff_slot_size(mut self, backoff_slot_size: Duration) -> Self {
        self.backoff_slot_size = backoff_slot_size;
        self
    }

    pub fn with_server_qos(mut self, server_qos: ServerQos) -> Self {
        self.server_qos = server_qos;
        self
    }

    pub fn with_client_qos(mut self, client_qos: ClientQos) -> Self {
        self.client_qos = client_qos;
        self
    }

    pub fn with_retry_on_timeout(mut self, retry_on_timeout: RetryOnTimeout) -> Self {
        self.retry_on_timeout = retry_on_timeout;
        self
    }

    pub fn with_node_selection_strategy(mut self, strategy: NodeSelectionStrategy) -> Self {
        self.node_selection_strategy = strategy;
        self
    }
}
