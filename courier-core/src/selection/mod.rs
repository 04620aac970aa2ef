//! Node selection: picks which host gets each request.
//!
//! Every strategy owns the ordered list of per-host limited channels and
//! returns the first acceptance, or `None` when every host declines.

mod balanced;
mod pin_until_error;
mod reservoir;
mod round_robin;

use std::{
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};

use futures::Future;

use self::balanced::BalancedChannel;
use self::pin_until_error::PinUntilErrorChannel;
use self::round_robin::RoundRobinChannel;

use crate::{
    channel::{LimitedChannel, ResponseFuture},
    config::NodeSelectionStrategy,
    error::ClientError,
    metrics::ClientMetrics,
    types::{Endpoint, Request, Response},
};

enum Strategy {
    PinUntilError(Arc<PinUntilErrorChannel>),
    RoundRobin(RoundRobinChannel),
    Balanced(BalancedChannel),
}

pub(crate) struct NodeSelectionChannel {
    hosts: Vec<Arc<dyn LimitedChannel>>,
    strategy: Strategy,
}

impl NodeSelectionChannel {
    pub(crate) fn new(
        kind: NodeSelectionStrategy,
        hosts: Vec<Arc<dyn LimitedChannel>>,
        metrics: &ClientMetrics,
    ) -> Self {
        metrics.node_selection_strategy(kind.label()).mark();
        let indexed: Vec<(usize, Arc<dyn LimitedChannel>)> =
            hosts.iter().cloned().enumerate().collect();
        let strategy = match kind {
            NodeSelectionStrategy::PinUntilError => {
                Strategy::PinUntilError(PinUntilErrorChannel::new(indexed, metrics))
            }
            NodeSelectionStrategy::RoundRobin => {
                Strategy::RoundRobin(RoundRobinChannel::new(indexed))
            }
            NodeSelectionStrategy::Balanced => {
                Strategy::Balanced(BalancedChannel::new(indexed, metrics))
            }
        };
        Self { hosts, strategy }
    }

    /// Dispatches to a specific host, bypassing the strategy. Used by the
    /// sticky session view and by redirect overrides.
    pub(crate) fn maybe_execute_on(
        &self,
        host: usize,
        endpoint: &Endpoint,
        request: &Request,
    ) -> Option<ResponseFuture> {
        self.hosts.get(host)?.maybe_execute(endpoint, request)
    }

    /// Strategy dispatch that also reports which host accepted.
    pub(crate) fn maybe_execute_tracked(
        &self,
        endpoint: &Endpoint,
        request: &Request,
    ) -> Option<(usize, ResponseFuture)> {
        if let Some(host) = request.host_override() {
            return self.maybe_execute_on(host, endpoint, request).map(|future| (host, future));
        }
        match &self.strategy {
            Strategy::PinUntilError(channel) => channel.maybe_execute(endpoint, request),
            Strategy::RoundRobin(channel) => channel.maybe_execute(endpoint, request),
            Strategy::Balanced(channel) => channel.maybe_execute(endpoint, request),
        }
    }
}

impl LimitedChannel for NodeSelectionChannel {
    fn maybe_execute(&self, endpoint: &Endpoint, request: &Request) -> Option<ResponseFuture> {
        self.maybe_execute_tracked(endpoint, request).map(|(_, future)| future)
    }
}

type CompletionObserver = Box<dyn FnOnce(Option<&Result<Response, ClientError>>) + Send>;

/// Wraps a dispatched future so a strategy can watch how it ends: the
/// observer receives `Some(result)` on completion or `None` when the
/// future is dropped before completing.
pub(super) struct Observed {
    inner: ResponseFuture,
    observer: Option<CompletionObserver>,
}

impl Observed {
    pub(super) fn new(
        inner: ResponseFuture,
        observer: impl FnOnce(Option<&Result<Response, ClientError>>) + Send + 'static,
    ) -> Self {
        Self { inner, observer: Some(Box::new(observer)) }
    }
}

impl Future for Observed {
    type Output = Result<Response, ClientError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let result = ready!(this.inner.as_mut().poll(cx));
        if let Some(observer) = this.observer.take() {
            observer(Some(&result));
        }
        Poll::Ready(result)
    }
}

impl Drop for Observed {
    fn drop(&mut self) {
        if let Some(observer) = self.observer.take() {
            observer(None);
        }
    }
}
