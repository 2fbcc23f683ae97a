//! Adaptive Controller (C7): keeps the speculation depth `K` tracking the
//! observed acceptance rate, one step at a time.
//!
//! `K` only ever moves by one per step: it steps down when the smoothed
//! acceptance rate falls below `tau - delta`, up when it rises above
//! `tau + delta`, and holds inside the band. This is the same shape as a
//! simple control loop, not a full PID — matching the Helix prototype's
//! `AdaptiveSpeculativeDecoder._adjust_k`.

use crate::config::ControllerConfig;

/// Per-request adaptive controller for speculation depth.
#[derive(Debug, Clone)]
pub struct AdaptiveController {
    smoothing: f64,
    target: f64,
    band: f64,
    k_min: usize,
    k_max: usize,
    k: usize,
    ema_acceptance: f64,
}

/// Initial smoothed acceptance rate, per spec.md §4.9 — not the first
/// observed step's rate.
const INITIAL_EMA_ACCEPTANCE: f64 = 0.5;

impl AdaptiveController {
    pub fn new(cfg: &ControllerConfig) -> Self {
        Self {
            smoothing: cfg.smoothing,
            target: cfg.target_acceptance,
            band: cfg.band,
            k_min: cfg.k_min,
            k_max: cfg.k_max,
            k: cfg.k_initial.clamp(cfg.k_min, cfg.k_max),
            ema_acceptance: INITIAL_EMA_ACCEPTANCE,
        }
    }

    /// Current speculation depth to use for the next step.
    pub fn k(&self) -> usize {
        self.k
    }

    /// Override the current depth, clamped to the configured
    /// `[k_min, k_max]` bounds — applies a request's own `initial_K`
    /// (spec.md §3) on top of the process-wide default from
    /// `ControllerConfig::k_initial`.
    pub fn set_k(&mut self, k: usize) {
        self.k = k.clamp(self.k_min, self.k_max);
    }

    /// Smoothed acceptance rate observed so far, starting at 0.5 before any
    /// step has completed.
    pub fn ema_acceptance(&self) -> f64 {
        self.ema_acceptance
    }

    /// Record one step's observed acceptance rate (`accepted / proposed`,
    /// in `[0, 1]`) and adjust `K` for the next step.
    pub fn record_step(&mut self, observed_acceptance: f64) {
        let ema = self.smoothing * observed_acceptance + (1.0 - self.smoothing) * self.ema_acceptance;
        self.ema_acceptance = ema;

        if ema < self.target - self.band {
            self.k = self.k.saturating_sub(1).max(self.k_min);
        } else if ema > self.target + self.band {
            self.k = (self.k + 1).min(self.k_max);
        }
    }
}
