//! Tagged metric registry for the courier client.
//!
//! The client core reports into this registry; exporting the collected
//! values to a metrics backend is the embedding application's concern.
//! Four instrument kinds are supported:
//!
//! - [`Meter`]: a monotonic event counter (`mark`).
//! - [`Counter`]: an up/down counter (`inc`/`dec`).
//! - [`Timer`]: duration accounting, driven by [`TimerContext`] handles.
//! - Gauges: pull-based, registered as weak [`GaugeSource`]s and reduced
//!   (min or sum) across the sources that are still alive.

use std::{
    borrow::Cow,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// A metric name plus its tags. Tags are kept sorted by key so that equal
/// tag sets always produce equal ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricId {
    name: Cow<'static, str>,
    tags: Vec<(Cow<'static, str>, Cow<'static, str>)>,
}

impl MetricId {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self { name: name.into(), tags: Vec::new() }
    }

    pub fn with_tag(
        mut self,
        key: impl Into<Cow<'static, str>>,
        value: impl Into<Cow<'static, str>>,
    ) -> Self {
        let key = key.into();
        let value = value.into();
        let at = self.tags.partition_point(|(k, _)| *k < key);
        self.tags.insert(at, (key, value));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_ref())
    }
}

/// A monotonic event counter.
#[derive(Debug, Clone, Default)]
pub struct Meter {
    count: Arc<AtomicU64>,
}

impl Meter {
    #[inline]
    pub fn mark(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// An up/down counter. Unlike meters, counters cannot be elided once
/// created because both directions are observable.
#[derive(Debug, Clone, Default)]
pub struct Counter {
    value: Arc<AtomicI64>,
}

impl Counter {
    #[inline]
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn count(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct TimerInner {
    count: AtomicU64,
    total_nanos: AtomicU64,
}

/// Duration accounting. `start` returns a [`TimerContext`] whose `stop`
/// records the elapsed wall-clock time.
#[derive(Debug, Clone, Default)]
pub struct Timer {
    inner: Arc<TimerInner>,
}

impl Timer {
    pub fn start(&self) -> TimerContext {
        TimerContext { timer: self.clone(), start: Instant::now() }
    }

    /// Records an externally measured duration.
    pub fn record(&self, duration: Duration) {
        self.inner.count.fetch_add(1, Ordering::Relaxed);
        self.inner.total_nanos.fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.inner.count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn total(&self) -> Duration {
        Duration::from_nanos(self.inner.total_nanos.load(Ordering::Relaxed))
    }
}

/// A running timing. Dropping the context without calling [`stop`]
/// records nothing.
///
/// [`stop`]: TimerContext::stop
#[derive(Debug)]
pub struct TimerContext {
    timer: Timer,
    start: Instant,
}

impl TimerContext {
    /// Stops the timing, records it, and returns the elapsed nanoseconds.
    pub fn stop(self) -> u64 {
        let elapsed = self.start.elapsed();
        self.timer.record(elapsed);
        elapsed.as_nanos() as u64
    }
}

/// A live value a gauge pulls from. Registered weakly: a source that has
/// been dropped silently stops contributing.
pub trait GaugeSource: Send + Sync {
    fn value(&self) -> f64;
}

/// How a gauge combines the values of its live sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    Min,
    Sum,
}

struct ReducingGauge {
    reduction: Reduction,
    sources: Mutex<Vec<Weak<dyn GaugeSource>>>,
}

impl ReducingGauge {
    fn read(&self) -> f64 {
        let mut sources = self.sources.lock();
        sources.retain(|source| source.strong_count() > 0);
        let values = sources.iter().filter_map(Weak::upgrade).map(|s| s.value());
        match self.reduction {
            Reduction::Min => values.fold(f64::INFINITY, f64::min),
            Reduction::Sum => values.sum(),
        }
    }
}

/// The registry itself. Instruments are created on first use and shared
/// thereafter; ids are `(name, sorted tags)`.
#[derive(Default)]
pub struct MetricRegistry {
    meters: Mutex<FxHashMap<MetricId, Meter>>,
    counters: Mutex<FxHashMap<MetricId, Counter>>,
    timers: Mutex<FxHashMap<MetricId, Timer>>,
    gauges: Mutex<FxHashMap<MetricId, Arc<ReducingGauge>>>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn meter(&self, id: MetricId) -> Meter {
        self.meters.lock().entry(id).or_default().clone()
    }

    pub fn counter(&self, id: MetricId) -> Counter {
        self.counters.lock().entry(id).or_default().clone()
    }

    pub fn timer(&self, id: MetricId) -> Timer {
        self.timers.lock().entry(id).or_default().clone()
    }

    /// Registers a gauge source under `id`, creating the gauge with the
    /// given reduction if it does not exist yet. Sources are held weakly;
    /// the same id may accumulate sources from several registrants.
    pub fn register_gauge(&self, id: MetricId, reduction: Reduction, source: Weak<dyn GaugeSource>) {
        let gauge = Arc::clone(self.gauges.lock().entry(id).or_insert_with(|| {
            Arc::new(ReducingGauge { reduction, sources: Mutex::new(Vec::new()) })
        }));
        gauge.sources.lock().push(source);
    }

    /// Reads the reduced value of a gauge. `None` if no gauge was ever
    /// registered under this id; a gauge whose sources have all died reads
    /// as the reduction of the empty set (0 for sum, +inf for min).
    pub fn gauge_value(&self, id: &MetricId) -> Option<f64> {
        let gauge = self.gauges.lock().get(id).cloned()?;
        Some(gauge.read())
    }

    /// Snapshot accessors for tests and exporters: read without creating.
    pub fn meter_count(&self, id: &MetricId) -> Option<u64> {
        self.meters.lock().get(id).map(Meter::count)
    }

    pub fn counter_value(&self, id: &MetricId) -> Option<i64> {
        self.counters.lock().get(id).map(Counter::count)
    }

    pub fn timer_count(&self, id: &MetricId) -> Option<u64> {
        self.timers.lock().get(id).map(Timer::count)
    }
}
