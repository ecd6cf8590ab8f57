//! Prometheus metrics for the measurement-control cycle.
//!
//! Call [`init_metrics`] once at process startup. Every helper is a no-op if
//! metrics were never initialised, so the loop always runs — observability
//! simply degrades gracefully.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `foam_ticks_total` | Counter | |
//! | `foam_submissions_total` | Counter | |
//! | `foam_results_total` | Counter | |
//! | `foam_cycles_skipped_total` | Counter | |
//! | `foam_cells_flagged_total` | Counter | `flag` |
//! | `foam_config_rejections_total` | Counter | |
//! | `foam_geometry_duration_seconds` | Histogram | |
//! | `foam_cadence_k` | Gauge | |
//! | `foam_request_pending` | Gauge | |

use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramOpts, IntCounter, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// All cycle metrics, bundled so they can live in one [`OnceLock`].
pub struct Metrics {
    /// Registry that owns all metric descriptors.
    pub registry: Registry,
    /// Scheduler ticks driven.
    pub ticks_total: IntCounter,
    /// Snapshots accepted by the worker.
    pub submissions_total: IntCounter,
    /// Geometry results consumed.
    pub results_total: IntCounter,
    /// Results discarded because every cell was flagged.
    pub cycles_skipped_total: IntCounter,
    /// Flagged cells by flag kind.
    pub cells_flagged_total: CounterVec,
    /// Live config updates rejected by validation.
    pub config_rejections_total: IntCounter,
    /// Geometry call latency.
    pub geometry_duration: Histogram,
    /// Current cadence.
    pub cadence_k: Gauge,
    /// 1 while a request is in flight, else 0.
    pub request_pending: Gauge,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn register<C: prometheus::core::Collector + Clone + 'static>(
    registry: &Registry,
    collector: C,
) -> Result<C, prometheus::Error> {
    registry.register(Box::new(collector.clone()))?;
    Ok(collector)
}

/// Initialise all metrics against a private registry.
///
/// Calling it a second time is a no-op returning `Ok(())`.
///
/// # Errors
///
/// Returns the underlying `prometheus::Error` if metric construction or
/// registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if METRICS.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let ticks_total = register(
        &registry,
        IntCounter::new("foam_ticks_total", "Scheduler ticks driven")?,
    )?;
    let submissions_total = register(
        &registry,
        IntCounter::new("foam_submissions_total", "Snapshots accepted by the worker")?,
    )?;
    let results_total = register(
        &registry,
        IntCounter::new("foam_results_total", "Geometry results consumed")?,
    )?;
    let cycles_skipped_total = register(
        &registry,
        IntCounter::new(
            "foam_cycles_skipped_total",
            "Results discarded because every cell was flagged",
        )?,
    )?;
    let cells_flagged_total = register(
        &registry,
        CounterVec::new(
            Opts::new("foam_cells_flagged_total", "Flagged cells by flag kind"),
            &["flag"],
        )?,
    )?;
    let config_rejections_total = register(
        &registry,
        IntCounter::new(
            "foam_config_rejections_total",
            "Live config updates rejected by validation",
        )?,
    )?;
    let geometry_duration = register(
        &registry,
        Histogram::with_opts(HistogramOpts::new(
            "foam_geometry_duration_seconds",
            "Wall-clock latency of geometry calls",
        ))?,
    )?;
    let cadence_k = register(
        &registry,
        Gauge::new("foam_cadence_k", "Ticks between geometry submissions")?,
    )?;
    let request_pending = register(
        &registry,
        Gauge::new("foam_request_pending", "1 while a request is in flight")?,
    )?;

    // If another thread raced us, the first one wins; both bundles carry
    // identical descriptors.
    let _ = METRICS.set(Metrics {
        registry,
        ticks_total,
        submissions_total,
        results_total,
        cycles_skipped_total,
        cells_flagged_total,
        config_rejections_total,
        geometry_duration,
        cadence_k,
        request_pending,
    });

    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

/// Count one scheduler tick.
pub fn inc_tick() {
    if let Some(m) = metrics() {
        m.ticks_total.inc();
    }
}

/// Count one accepted submission.
pub fn inc_submission() {
    if let Some(m) = metrics() {
        m.submissions_total.inc();
    }
}

/// Count one consumed result.
pub fn inc_result() {
    if let Some(m) = metrics() {
        m.results_total.inc();
    }
}

/// Count one skipped cycle (all cells flagged).
pub fn inc_cycle_skipped() {
    if let Some(m) = metrics() {
        m.cycles_skipped_total.inc();
    }
}

/// Count `n` flagged cells of one kind.
pub fn add_cells_flagged(flag: &str, n: u64) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.cells_flagged_total.get_metric_with_label_values(&[flag]) {
            c.inc_by(n as f64);
        }
    }
}

/// Count one rejected live config update.
pub fn inc_config_rejection() {
    if let Some(m) = metrics() {
        m.config_rejections_total.inc();
    }
}

/// Record one geometry call's latency.
pub fn observe_geometry_ms(elapsed_ms: f64) {
    if let Some(m) = metrics() {
        m.geometry_duration.observe(elapsed_ms / 1e3);
    }
}

/// Publish the current cadence.
pub fn set_cadence(k: u32) {
    if let Some(m) = metrics() {
        m.cadence_k.set(f64::from(k));
    }
}

/// Publish the pending flag.
pub fn set_pending(pending: bool) {
    if let Some(m) = metrics() {
        m.request_pending.set(if pending { 1.0 } else { 0.0 });
    }
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics were never initialised or encoding
/// fails.
pub fn gather_metrics() -> String {
    let Some(m) = metrics() else {
        return String::new();
    };
    let families = m.registry.gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
