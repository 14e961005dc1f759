//! Dynamic safety window.
//!
//! The safety window is how far behind "now" the settled/tentative boundary
//! sits. A fixed window wastes latency when delivery is fast and settles
//! events too eagerly when it is slow, so [`SafeWindow`] sizes itself from
//! observed delivery lag: a smoothed lag estimate widens the window during
//! bursts, and the extra width decays back toward the base once delivery
//! recovers.
//!
//! Lag is measured against the creation instant embedded in each event's
//! [`SortableUniqueId`](crate::ident::SortableUniqueId), which assumes
//! producer clocks agree with ours to within roughly `max_extra`. Negative
//! lag from clock skew is clamped to zero.

use std::time::{Duration, Instant, SystemTime};

use crate::ident::SortableUniqueId;

/// Sizing parameters for [`SafeWindow`].
#[derive(Clone, Debug)]
pub struct SafeWindowConfig {
    /// Minimum window width; the effective window never shrinks below it.
    pub base: Duration,
    /// Cap on dynamic widening above `base`.
    pub max_extra: Duration,
    /// Smoothing factor for the lag estimate, in `(0, 1]`. Higher values
    /// react faster to lag changes.
    pub alpha: f64,
    /// Per-second multiplicative decay applied to the extra width.
    pub decay_per_second: f64,
    /// When `false`, the window is fixed at `base` and lag observations only
    /// feed telemetry.
    pub dynamic: bool,
}

impl Default for SafeWindowConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(20),
            max_extra: Duration::from_secs(30),
            alpha: 0.3,
            decay_per_second: 0.98,
            dynamic: true,
        }
    }
}

impl SafeWindowConfig {
    /// A fixed window of the given width.
    #[must_use]
    pub fn fixed(base: Duration) -> Self {
        Self {
            base,
            dynamic: false,
            ..Self::default()
        }
    }
}

/// Lag-tracking safety window.
///
/// Feed it one [`observe`](SafeWindow::observe) call per delivered event and
/// read [`effective`](SafeWindow::effective) or
/// [`threshold`](SafeWindow::threshold) whenever a boundary is needed. The
/// effective width always satisfies `base <= effective <= base + max_extra`.
#[derive(Clone, Debug)]
pub struct SafeWindow {
    config: SafeWindowConfig,
    lag_ema: Option<Duration>,
    extra: Duration,
    last_observation: Option<Instant>,
    observations: u64,
}

impl SafeWindow {
    #[must_use]
    pub fn new(config: SafeWindowConfig) -> Self {
        Self {
            config,
            lag_ema: None,
            extra: Duration::ZERO,
            last_observation: None,
            observations: 0,
        }
    }

    /// Record the delivery lag of one event, observed at `now`.
    ///
    /// Decay is applied for the time elapsed since the previous observation
    /// before the new lag is folded in, so the extra width shrinks during
    /// quiet periods rather than being pinned at its burst peak.
    pub fn observe(&mut self, lag: Duration, now: Instant) {
        self.observations += 1;

        let alpha = self.config.alpha.clamp(f64::EPSILON, 1.0);
        let ema = match self.lag_ema {
            None => lag,
            Some(previous) => {
                let smoothed =
                    alpha * lag.as_secs_f64() + (1.0 - alpha) * previous.as_secs_f64();
                Duration::from_secs_f64(smoothed.max(0.0))
            }
        };
        self.lag_ema = Some(ema);

        if !self.config.dynamic {
            self.last_observation = Some(now);
            return;
        }

        if let Some(previous) = self.last_observation {
            let elapsed = now.saturating_duration_since(previous).as_secs_f64();
            let decayed = self.extra.as_secs_f64() * self.config.decay_per_second.powf(elapsed);
            self.extra = Duration::from_secs_f64(decayed.max(0.0));
        }
        self.last_observation = Some(now);

        let spike = ema.saturating_sub(self.config.base);
        if spike > self.extra {
            self.extra = spike;
        }
        if self.extra > self.config.max_extra {
            self.extra = self.config.max_extra;
        }
    }

    /// Current window width.
    #[must_use]
    pub fn effective(&self) -> Duration {
        if self.config.dynamic {
            self.config.base + self.extra
        } else {
            self.config.base
        }
    }

    /// The settled/tentative boundary for wall-clock time `now`.
    #[must_use]
    pub fn threshold(&self, now: SystemTime) -> SortableUniqueId {
        let boundary = now
            .checked_sub(self.effective())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        SortableUniqueId::threshold(boundary)
    }

    /// Smoothed delivery lag, if any events have been observed.
    #[must_use]
    pub fn lag_ema(&self) -> Option<Duration> {
        self.lag_ema
    }

    #[must_use]
    pub fn observations(&self) -> u64 {
        self.observations
    }

    #[must_use]
    pub fn config(&self) -> &SafeWindowConfig {
        &self.config
    }

    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        self.config.dynamic
    }
}

impl Default for SafeWindow {
    fn default() -> Self {
        Self::new(SafeWindowConfig::default())
    }
}
