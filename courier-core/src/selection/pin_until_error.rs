use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use courier_metrics::Meter;
use rand::seq::SliceRandom;
use tokio::time::Instant;
use tracing::debug;

use super::Observed;
use crate::{
    channel::{LimitedChannel, ResponseFuture},
    metrics::ClientMetrics,
    types::{Endpoint, Request},
};

/// How often the pinned host order is reshuffled, so that a fleet of
/// clients started against the same config does not stay coupled to the
/// same host forever.
const RESHUFFLE_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Clone)]
struct PinnedHost {
    index: usize,
    channel: Arc<dyn LimitedChannel>,
}

/// Sticks to one host until it misbehaves, then advances to the next in a
/// privately shuffled order.
pub(super) struct PinUntilErrorChannel {
    nodes: ArcSwap<Vec<PinnedHost>>,
    // Monotonic; the pinned node is `current % nodes.len()`.
    current: AtomicUsize,
    started: Instant,
    next_reshuffle_nanos: AtomicU64,
    success_meter: Meter,
    reshuffle_meter: Meter,
    next_node_limited: Meter,
    next_node_response: Meter,
    next_node_throwable: Meter,
}

impl PinUntilErrorChannel {
    pub(super) fn new(
        hosts: Vec<(usize, Arc<dyn LimitedChannel>)>,
        metrics: &ClientMetrics,
    ) -> Arc<Self> {
        let mut nodes: Vec<PinnedHost> =
            hosts.into_iter().map(|(index, channel)| PinnedHost { index, channel }).collect();
        nodes.shuffle(&mut rand::thread_rng());
        Arc::new(Self {
            nodes: ArcSwap::from_pointee(nodes),
            current: AtomicUsize::new(0),
            started: Instant::now(),
            next_reshuffle_nanos: AtomicU64::new(RESHUFFLE_INTERVAL.as_nanos() as u64),
            success_meter: metrics.pin_success(),
            reshuffle_meter: metrics.pin_reshuffle(),
            next_node_limited: metrics.pin_next_node("limited"),
            next_node_response: metrics.pin_next_node("responseCode"),
            next_node_throwable: metrics.pin_next_node("throwable"),
        })
    }

    pub(super) fn maybe_execute(
        self: &Arc<Self>,
        endpoint: &Endpoint,
        request: &Request,
    ) -> Option<(usize, ResponseFuture)> {
        self.maybe_reshuffle();
        let nodes = self.nodes.load();
        let n = nodes.len();
        for _ in 0..n {
            let pin = self.current.load(Ordering::Acquire);
            let node = &nodes[pin % n];
            match node.channel.maybe_execute(endpoint, request) {
                Some(future) => {
                    let this = Arc::clone(self);
                    let host = node.index;
                    let observed = Observed::new(future, move |result| match result {
                        Some(Ok(response)) if is_failure_status(response.status().as_u16()) => {
                            this.next_node(pin, NextNodeReason::ResponseCode);
                        }
                        Some(Ok(_)) => this.success_meter.mark(),
                        Some(Err(_)) => this.next_node(pin, NextNodeReason::Throwable),
                        // Cancellation says nothing about the host.
                        None => {}
                    });
                    return Some((host, Box::pin(observed)));
                }
                None => self.next_node(pin, NextNodeReason::Limited),
            }
        }
        None
    }

    /// Advances the pin past `previous`. Compare-and-swap so concurrent
    /// failures of the same pinned host advance it exactly once.
    fn next_node(&self, previous: usize, reason: NextNodeReason) {
        if self
            .current
            .compare_exchange(previous, previous.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let meter = match reason {
                NextNodeReason::Limited => &self.next_node_limited,
                NextNodeReason::ResponseCode => &self.next_node_response,
                NextNodeReason::Throwable => &self.next_node_throwable,
            };
            meter.mark();
            debug!(previous, reason = ?reason, "pinned host demoted");
        }
    }

    fn maybe_reshuffle(&self) {
        let elapsed = self.started.elapsed().as_nanos() as u64;
        let due = self.next_reshuffle_nanos.load(Ordering::Relaxed);
        if elapsed < due {
            return;
        }
        if self
            .next_reshuffle_nanos
            .compare_exchange(
                due,
                elapsed + RESHUFFLE_INTERVAL.as_nanos() as u64,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.reshuffle();
        }
    }

    fn reshuffle(&self) {
        let mut nodes: Vec<PinnedHost> = self.nodes.load().as_ref().clone();
        nodes.shuffle(&mut rand::thread_rng());
        self.nodes.store(Arc::new(nodes));
        self.reshuffle_meter.mark();
    }
}

#[derive(Debug, Clone, Copy)]
enum NextNodeReason {
    Limited,
    ResponseCode,
    Throwable,
}

/// QoS statuses, redirects, and server errors all demote the pinned host.
fn is_failure_status(status: u16) -> bool {
    matches!(status, 429 | 308) || (500..=599).contains(&status)
}
