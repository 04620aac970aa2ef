use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use courier_metrics::GaugeSource;
use rand::seq::SliceRandom;

use super::{reservoir::DecayReservoir, Observed};
use crate::{
    channel::{LimitedChannel, ResponseFuture},
    error::ClientError,
    metrics::ClientMetrics,
    types::{Endpoint, Request, Response},
};

/// How long host history stays relevant.
const FAILURE_HALF_LIFE: Duration = Duration::from_secs(30);
/// Plain failures and server errors count once.
const FAILURE_WEIGHT: f64 = 1.0;
/// A host telling us to back off is weighted much more heavily; the
/// penalty wears off with the reservoir's half-life.
const QOS_WEIGHT: f64 = 10.0;
/// Recent successes argue for sending more traffic.
const SUCCESS_CREDIT: f64 = 0.5;

struct BalancedHost {
    index: usize,
    channel: Arc<dyn LimitedChannel>,
    inflight: AtomicUsize,
    failures: DecayReservoir,
    successes: DecayReservoir,
}

impl BalancedHost {
    /// An idle host with no recent history scores exactly zero.
    fn score(&self) -> f64 {
        let raw = self.inflight.load(Ordering::Relaxed) as f64
            + FAILURE_WEIGHT * self.failures.get()
            - SUCCESS_CREDIT * self.successes.get();
        raw.max(0.0)
    }

    fn observe(&self, result: Option<&Result<Response, ClientError>>) {
        self.inflight.fetch_sub(1, Ordering::Relaxed);
        match result {
            Some(Ok(response)) => match response.status().as_u16() {
                429 | 503 => self.failures.update(QOS_WEIGHT),
                500..=599 => self.failures.update(1.0),
                _ => self.successes.update(1.0),
            },
            Some(Err(_)) => self.failures.update(1.0),
            // Cancelled before completion: no signal either way.
            None => {}
        }
    }
}

impl GaugeSource for BalancedHost {
    fn value(&self) -> f64 {
        self.score()
    }
}

/// Prefers the host that looks least loaded right now: in-flight count
/// plus exponentially decayed recent failures, minus recent successes.
/// Candidates are shuffled before the sort so equal scores tie-break
/// randomly instead of by host index.
pub(super) struct BalancedChannel {
    hosts: Vec<Arc<BalancedHost>>,
}

impl BalancedChannel {
    pub(super) fn new(
        hosts: Vec<(usize, Arc<dyn LimitedChannel>)>,
        metrics: &ClientMetrics,
    ) -> Self {
        let hosts: Vec<Arc<BalancedHost>> = hosts
            .into_iter()
            .map(|(index, channel)| {
                let host = Arc::new(BalancedHost {
                    index,
                    channel,
                    inflight: AtomicUsize::new(0),
                    failures: DecayReservoir::new(FAILURE_HALF_LIFE),
                    successes: DecayReservoir::new(FAILURE_HALF_LIFE),
                });
                metrics
                    .register_balanced_score(index, Arc::downgrade(&host) as Weak<dyn GaugeSource>);
                host
            })
            .collect();
        Self { hosts }
    }

    pub(super) fn maybe_execute(
        &self,
        endpoint: &Endpoint,
        request: &Request,
    ) -> Option<(usize, ResponseFuture)> {
        let mut candidates: Vec<(f64, Arc<BalancedHost>)> =
            self.hosts.iter().map(|host| (host.score(), Arc::clone(host))).collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.sort_by(|(a, _), (b, _)| a.total_cmp(b));

        for (_, host) in candidates {
            if let Some(future) = host.channel.maybe_execute(endpoint, request) {
                host.inflight.fetch_add(1, Ordering::Relaxed);
                let index = host.index;
                let observed = Observed::new(future, move |result| host.observe(result));
                return Some((index, Box::pin(observed)));
            }
        }
        None
    }
}
