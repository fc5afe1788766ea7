use crate::constants::{
    COST_EMA_ALPHA, DUTY_CYCLE_WINDOW, INTERVAL_SMOOTHING, LAG_EMA_ALPHA, MAX_UPDATE_INTERVAL_MS,
    MIN_UPDATE_INTERVAL_MS,
};
use crate::types::StreamUpdate;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Fraction of wall time delivery work is allowed to occupy before the
/// interval is stretched.
const TARGET_DUTY_CYCLE: f64 = 0.1;

/// Payloads report their size so bigger repaints earn a slower cadence.
pub trait Weighted {
    fn weight(&self) -> usize;
}

impl Weighted for String {
    fn weight(&self) -> usize {
        self.len()
    }
}

impl Weighted for StreamUpdate {
    fn weight(&self) -> usize {
        self.text.len() + self.thoughts.len()
    }
}

struct ThrottleState<T> {
    pending: Option<T>,
    interval: Duration,
    last_flush: Instant,
    timer_due: Option<Instant>,
    cost_ema_ms: f64,
    lag_ema_ms: f64,
    window: VecDeque<(Instant, f64)>,
}

/// Coalescing rate limiter for stream updates. Each payload supersedes the
/// previous undelivered one, so the consumer always sees the freshest full
/// state and never a backlog. The delivery interval adapts to how expensive
/// the consumer proves to be: execution-cost and timer-lag EMAs plus a
/// duty-cycle correction feed the next interval, blended 70/30 with the
/// current one and clamped to the configured bounds.
pub struct AdaptiveThrottler<T: Weighted + Send + 'static> {
    state: Arc<Mutex<ThrottleState<T>>>,
    deliver: Arc<dyn Fn(T) + Send + Sync>,
    cancel: CancellationToken,
}

impl<T: Weighted + Send + 'static> Clone for AdaptiveThrottler<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            deliver: Arc::clone(&self.deliver),
            cancel: self.cancel.clone(),
        }
    }
}

impl<T: Weighted + Send + 'static> AdaptiveThrottler<T> {
    pub fn new(deliver: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self {
            state: Arc::new(Mutex::new(ThrottleState {
                pending: None,
                interval: Duration::from_millis(MIN_UPDATE_INTERVAL_MS),
                // A burst right after construction coalesces into one
                // timer-driven flush instead of firing immediately.
                last_flush: Instant::now(),
                timer_due: None,
                cost_ema_ms: 0.0,
                lag_ema_ms: 0.0,
                window: VecDeque::with_capacity(DUTY_CYCLE_WINDOW),
            })),
            deliver: Arc::new(deliver),
            cancel: CancellationToken::new(),
        }
    }

    /// Replaces the pending payload. Delivers immediately when forced or
    /// when the interval has already elapsed; otherwise arms one timer for
    /// the remainder.
    pub fn enqueue(&self, payload: T, force: bool) {
        if self.cancel.is_cancelled() {
            return;
        }
        let due = {
            let mut state = match self.state.lock() {
                Ok(s) => s,
                Err(_) => return,
            };
            state.pending = Some(payload);
            let due = state.last_flush + state.interval;
            if force || Instant::now() >= due {
                None
            } else if state.timer_due.is_none() {
                state.timer_due = Some(due);
                Some(due)
            } else {
                return;
            }
        };
        match due {
            None => self.fire(None),
            Some(due) => self.arm_timer(due),
        }
    }

    /// Delivers any pending payload. The final flush of a stream forces so
    /// the closing state is never lost to the interval.
    pub fn flush(&self, force: bool) {
        if self.cancel.is_cancelled() {
            return;
        }
        let ready = {
            let state = match self.state.lock() {
                Ok(s) => s,
                Err(_) => return,
            };
            state.pending.is_some() && (force || Instant::now() >= state.last_flush + state.interval)
        };
        if ready {
            self.fire(None);
        }
    }

    /// Permanently stops delivery. The pending payload is dropped and any
    /// armed timer becomes a no-op.
    pub fn cancel(&self) {
        self.cancel.cancel();
        if let Ok(mut state) = self.state.lock() {
            state.pending = None;
            state.timer_due = None;
        }
    }

    fn arm_timer(&self, due: Instant) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = this.cancel.cancelled() => {}
                _ = tokio::time::sleep_until(due) => {
                    if let Ok(mut state) = this.state.lock() {
                        state.timer_due = None;
                    }
                    this.fire(Some(due));
                }
            }
        });
    }

    /// Takes the pending payload and delivers it outside the lock, then
    /// folds the observed cost and lag into the next interval.
    fn fire(&self, scheduled: Option<Instant>) {
        if self.cancel.is_cancelled() {
            return;
        }
        let (payload, weight) = {
            let mut state = match self.state.lock() {
                Ok(s) => s,
                Err(_) => return,
            };
            let Some(payload) = state.pending.take() else {
                return;
            };
            if let Some(due) = scheduled {
                let lag_ms = Instant::now().saturating_duration_since(due).as_secs_f64() * 1000.0;
                state.lag_ema_ms =
                    LAG_EMA_ALPHA * lag_ms + (1.0 - LAG_EMA_ALPHA) * state.lag_ema_ms;
            }
            let weight = payload.weight();
            (payload, weight)
        };

        let started = Instant::now();
        (self.deliver)(payload);
        let cost_ms = started.elapsed().as_secs_f64() * 1000.0;

        if let Ok(mut state) = self.state.lock() {
            state.cost_ema_ms = COST_EMA_ALPHA * cost_ms + (1.0 - COST_EMA_ALPHA) * state.cost_ema_ms;
            state.window.push_back((started, cost_ms));
            while state.window.len() > DUTY_CYCLE_WINDOW {
                state.window.pop_front();
            }
            let next = Self::next_interval(&state, weight);
            state.interval = next;
            state.last_flush = Instant::now();
        }
    }

    fn next_interval(state: &ThrottleState<T>, weight: usize) -> Duration {
        let baseline = MIN_UPDATE_INTERVAL_MS as f64 + weight as f64 / 64.0;
        let mut computed = baseline + 4.0 * state.cost_ema_ms + 2.0 * state.lag_ema_ms;
        if let Some(duty) = Self::duty_cycle(state) {
            if duty > TARGET_DUTY_CYCLE {
                computed *= duty / TARGET_DUTY_CYCLE;
            }
        }
        let current = state.interval.as_secs_f64() * 1000.0;
        let blended = INTERVAL_SMOOTHING * current + (1.0 - INTERVAL_SMOOTHING) * computed;
        let clamped = blended.clamp(MIN_UPDATE_INTERVAL_MS as f64, MAX_UPDATE_INTERVAL_MS as f64);
        Duration::from_millis(clamped as u64)
    }

    /// Share of the recent window spent inside the deliver callback.
    fn duty_cycle(state: &ThrottleState<T>) -> Option<f64> {
        let (first, _) = state.window.front()?;
        let span_ms = Instant::now().saturating_duration_since(*first).as_secs_f64() * 1000.0;
        if span_ms <= 0.0 {
            return None;
        }
        let busy_ms: f64 = state.window.iter().map(|(_, cost)| cost).sum();
        Some(busy_ms / span_ms)
    }
}
