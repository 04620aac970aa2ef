use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use crate::{
    channel::{LimitedChannel, ResponseFuture},
    types::{Endpoint, Request},
};

/// Rotates the starting host on every call, advancing past hosts that
/// decline. Declines by all hosts in one revolution mean "limited".
pub(super) struct RoundRobinChannel {
    hosts: Vec<(usize, Arc<dyn LimitedChannel>)>,
    current: AtomicUsize,
}

impl RoundRobinChannel {
    pub(super) fn new(hosts: Vec<(usize, Arc<dyn LimitedChannel>)>) -> Self {
        Self { hosts, current: AtomicUsize::new(0) }
    }

    pub(super) fn maybe_execute(
        &self,
        endpoint: &Endpoint,
        request: &Request,
    ) -> Option<(usize, ResponseFuture)> {
        let n = self.hosts.len();
        let start = self.current.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        for offset in 0..n {
            let (index, host) = &self.hosts[(start.wrapping_add(offset)) % n];
            if let Some(future) = host.maybe_execute(endpoint, request) {
                return Some((*index, future));
            }
        }
        None
    }
}
