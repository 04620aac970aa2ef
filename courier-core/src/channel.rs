use std::sync::Arc;

use futures::future::BoxFuture;

use crate::{error::ClientError, types::Endpoint, types::Request, types::Response};

/// The eventual result of a dispatched request.
pub type ResponseFuture = BoxFuture<'static, Result<Response, ClientError>>;

/// Executes a request and produces an eventual response. Implementations
/// must always complete the returned future; a future that hangs forever
/// wedges every layer above it.
pub trait Channel: Send + Sync {
    fn execute(&self, endpoint: &Endpoint, request: &Request) -> ResponseFuture;
}

/// Execute-or-decline. `None` means "limited": the caller should try
/// another host or queue the request. Implementations decide synchronously
/// and never block.
pub trait LimitedChannel: Send + Sync {
    fn maybe_execute(&self, endpoint: &Endpoint, request: &Request) -> Option<ResponseFuture>;
}

/// Adapts a [`Channel`] into a [`LimitedChannel`] that always accepts.
/// Used when client-side QoS is disabled and no limiter gates the host.
pub(crate) struct ChannelToLimitedChannelAdapter {
    delegate: Arc<dyn Channel>,
}

impl ChannelToLimitedChannelAdapter {
    pub(crate) fn new(delegate: Arc<dyn Channel>) -> Self {
        Self { delegate }
    }
}

impl LimitedChannel for ChannelToLimitedChannelAdapter {
    fn maybe_execute(&self, endpoint: &Endpoint, request: &Request) -> Option<ResponseFuture> {
        Some(self.delegate.execute(endpoint, request))
    }
}
