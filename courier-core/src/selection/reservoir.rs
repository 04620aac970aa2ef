use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct ReservoirState {
    value: f64,
    last_decay: Instant,
}

/// A non-negative accumulator that halves over every `half_life` of wall
/// clock. Decay is applied lazily on access, so idle reservoirs cost
/// nothing.
#[derive(Debug)]
pub(super) struct DecayReservoir {
    half_life_secs: f64,
    state: Mutex<ReservoirState>,
}

impl DecayReservoir {
    pub(super) fn new(half_life: std::time::Duration) -> Self {
        Self {
            half_life_secs: half_life.as_secs_f64(),
            state: Mutex::new(ReservoirState { value: 0.0, last_decay: Instant::now() }),
        }
    }

    pub(super) fn update(&self, delta: f64) {
        let mut state = self.state.lock();
        Self::decay(&mut state, self.half_life_secs);
        state.value = (state.value + delta).max(0.0);
    }

    pub(super) fn get(&self) -> f64 {
        let mut state = self.state.lock();
        Self::decay(&mut state, self.half_life_secs);
        state.value
    }

    fn decay(state: &mut ReservoirState, half_life_secs: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_decay).as_secs_f64();
        if elapsed > 0.0 {
            state.value *= 0.5f64.powf(elapsed / half_life_secs);
            state.last_decay = now;
        }
    }
}
