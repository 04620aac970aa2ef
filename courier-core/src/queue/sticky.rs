//! Session pinning: all requests of one session target the same host.
//!
//! A session is a [`QueuedChannel`] over a pinned view of the node
//! selection layer. The first dispatch that a host accepts decides the
//! pin; from then on the view delegates only to that host, and the queue
//! absorbs the moments when it is saturated.

use std::sync::{Arc, OnceLock};

use crate::{
    channel::{LimitedChannel, ResponseFuture},
    metrics::ClientMetrics,
    queue::{QueueInstrumentation, QueuedChannel},
    selection::NodeSelectionChannel,
    types::{Endpoint, Request},
};

pub(crate) struct StickyLimitedChannel {
    selection: Arc<NodeSelectionChannel>,
    pinned: OnceLock<usize>,
}

impl StickyLimitedChannel {
    pub(crate) fn new(selection: Arc<NodeSelectionChannel>) -> Self {
        Self { selection, pinned: OnceLock::new() }
    }

    #[cfg(test)]
    pub(crate) fn pinned(&self) -> Option<usize> {
        self.pinned.get().copied()
    }
}

impl LimitedChannel for StickyLimitedChannel {
    fn maybe_execute(&self, endpoint: &Endpoint, request: &Request) -> Option<ResponseFuture> {
        if let Some(&host) = self.pinned.get() {
            return self.selection.maybe_execute_on(host, endpoint, request);
        }
        let (host, future) = self.selection.maybe_execute_tracked(endpoint, request)?;
        // Two unpinned requests may race here; the first recorded
        // acceptance wins and later requests follow it.
        let _ = self.pinned.set(host);
        Some(future)
    }
}

/// Mints per-session sticky pipelines that share the node-selection layer
/// (and therefore the per-host limiters) with the main channel.
pub struct StickySessionFactory {
    selection: Arc<NodeSelectionChannel>,
    metrics: ClientMetrics,
    max_queue_size: usize,
}

impl StickySessionFactory {
    pub(crate) fn new(
        selection: Arc<NodeSelectionChannel>,
        metrics: ClientMetrics,
        max_queue_size: usize,
    ) -> Self {
        Self { selection, metrics, max_queue_size }
    }

    /// A fresh unpinned session.
    pub fn session(&self) -> QueuedChannel {
        let sticky = Arc::new(StickyLimitedChannel::new(Arc::clone(&self.selection)));
        QueuedChannel::new(
            sticky,
            self.metrics.channel_name().clone(),
            QueueInstrumentation::channel(&self.metrics),
            self.max_queue_size,
        )
    }
}
