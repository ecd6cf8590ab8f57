//! Cycle telemetry for external consumers (HUD, control panels).
//!
//! The scheduler is the only writer; readers clone a consistent snapshot
//! through a shared hub and never observe a torn state.

use serde::Serialize;
use std::sync::{Arc, RwLock};

/// One tick's view of the measurement-control cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    /// Ticks driven since construction.
    pub tick_index: u64,
    /// Current cadence: ticks between geometry submissions.
    pub cadence_k: u32,
    /// True while a geometry request is in flight.
    pub pending: bool,
    /// Latency of the last completed geometry call, in milliseconds.
    pub t_geom_ms: f64,
    /// Mean IQ over included cells of the last measurement.
    pub iq_mean: f64,
    /// IQ standard deviation of the last measurement.
    pub iq_stddev: f64,
    /// Fraction of included cells below the band, `[0, 1]`.
    pub pct_below: f64,
    /// Fraction of included cells inside the band.
    pub pct_within: f64,
    /// Fraction of included cells above the band.
    pub pct_above: f64,
    /// Cells with a non-OK flag in the last measurement.
    pub flags_nonzero_count: usize,
    /// Completed geometry results since construction.
    pub results_seen: u64,
    /// Results where every cell was flagged (cycle skipped).
    pub cycles_skipped: u64,
    /// Live config updates rejected by validation.
    pub config_rejections: u64,
    /// Times the worker has been torn down and recreated.
    pub worker_recycles: u64,
}

/// Shared snapshot slot between one writer and any number of readers.
#[derive(Clone, Default)]
pub struct TelemetryHub {
    inner: Arc<RwLock<TelemetrySnapshot>>,
}

impl TelemetryHub {
    /// An empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the published snapshot. Writer side only.
    pub fn publish(&self, snapshot: TelemetrySnapshot) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = snapshot;
    }

    /// Clone the latest published snapshot.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}
