//! Cycle scheduler: FREEZE / MEASURE / ADJUST / RELAX.
//!
//! ## Responsibility
//! Drive the per-frame control cycle: advance the dynamics every tick, submit
//! owned snapshots to the geometry worker on cadence boundaries, consume
//! results through the IQ controller, adapt the cadence to observed latency,
//! recycle the worker, and publish telemetry.
//!
//! ## Guarantees
//! - `tick()` never blocks on geometry; channel probes are the only
//!   cross-thread interaction on the caller's thread
//! - At most one request is in flight; cadence boundaries hit while one is
//!   pending are skipped, not queued
//! - A result where every cell is flagged leaves the radii untouched and is
//!   counted as a skipped cycle; the loop always makes forward progress
//!
//! ## NOT Responsible For
//! - The dynamics themselves (behind [`DynamicsStepper`])
//! - Geometry computation (behind the worker/adapter pair)

use crate::adapter::{AdapterError, GeometryAdapter, GeometryBackend};
use crate::config::{ConfigUpdate, FoamConfig};
use crate::controller::{self, IqStats};
use crate::metrics;
use crate::stepper::DynamicsStepper;
use crate::telemetry::{TelemetryHub, TelemetrySnapshot};
use crate::worker::GeomWorker;
use crate::{FoamError, Snapshot};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Factory for backend instances; invoked once at construction and once per
/// worker recycle, so a recycled worker starts from a pristine backend.
pub type BackendFactory = Box<dyn Fn() -> Box<dyn GeometryBackend> + Send>;

/// State carried for the single request in flight.
struct PendingRequest {
    /// Tick at which the snapshot was taken.
    tick: u64,
    /// Wall-clock submission time (logging only; latency comes from the
    /// adapter's own timer).
    submitted_at: Instant,
    /// Radii the snapshot's weights were derived from.
    r_prev: Vec<f64>,
}

/// The measurement-control cycle driver.
pub struct Scheduler {
    stepper: Box<dyn DynamicsStepper>,
    worker: Option<GeomWorker>,
    backend_factory: BackendFactory,
    config: FoamConfig,
    k: u32,
    tick_index: u64,
    pending: Option<PendingRequest>,
    results_seen: u64,
    results_since_recycle: u64,
    cycles_skipped: u64,
    config_rejections: u64,
    worker_recycles: u64,
    last_iq: Vec<f64>,
    last_stats: IqStats,
    last_t_geom_ms: f64,
    last_flagged: usize,
    hub: TelemetryHub,
    shut_down: bool,
}

impl Scheduler {
    /// Build a scheduler around a stepper and a backend factory.
    ///
    /// # Errors
    ///
    /// Returns [`FoamError::Config`] with every violation when the config is
    /// invalid.
    pub fn new<F>(
        stepper: Box<dyn DynamicsStepper>,
        config: FoamConfig,
        backend_factory: F,
    ) -> Result<Self, FoamError>
    where
        F: Fn() -> Box<dyn GeometryBackend> + Send + 'static,
    {
        crate::config::validate(&config).map_err(FoamError::Config)?;
        let live_n = stepper.get_radii().len();
        if live_n != config.n {
            return Err(FoamError::Config(vec![
                crate::config::ConfigError::InvalidField {
                    field: "n".into(),
                    value: config.n.to_string(),
                    reason: format!("stepper holds {live_n} particles"),
                },
            ]));
        }
        let backend_factory: BackendFactory = Box::new(backend_factory);
        let worker = GeomWorker::spawn(GeometryAdapter::new(
            backend_factory(),
            config.chunk_max,
            config.n_max,
        ));
        let k = config.k_initial;
        info!(
            target: "foam::scheduler",
            n = config.n,
            cadence_k = k,
            "scheduler constructed"
        );
        Ok(Self {
            stepper,
            worker: Some(worker),
            backend_factory,
            config,
            k,
            tick_index: 0,
            pending: None,
            results_seen: 0,
            results_since_recycle: 0,
            cycles_skipped: 0,
            config_rejections: 0,
            worker_recycles: 0,
            last_iq: Vec::new(),
            last_stats: IqStats::default(),
            last_t_geom_ms: 0.0,
            last_flagged: 0,
            hub: TelemetryHub::new(),
            shut_down: false,
        })
    }

    /// Drive one frame of the cycle. Never blocks on geometry.
    ///
    /// # Errors
    ///
    /// [`FoamError::ShutDown`] once [`Scheduler::shutdown`] has run, and
    /// [`FoamError::Adapter`] when the stepper hands back malformed buffers
    /// at a snapshot boundary (a broken stepper contract, not a geometry
    /// failure — those are absorbed into per-cell flags).
    pub fn tick(&mut self) -> Result<(), FoamError> {
        if self.shut_down {
            warn!(target: "foam::scheduler", "tick() after shutdown rejected");
            return Err(FoamError::ShutDown);
        }

        // RELAX always advances; FREEZE is a logical snapshot marker, not a
        // hard pause.
        self.stepper.relax_step();

        if self.pending.is_some() {
            self.collect_result();
        }

        if self.pending.is_none() {
            self.maybe_recycle_worker();
        }

        if self.pending.is_none() && self.tick_index > 0 && self.tick_index % u64::from(self.k) == 0
        {
            self.submit_snapshot()?;
        }

        self.tick_index += 1;
        metrics::inc_tick();
        self.publish_telemetry();
        Ok(())
    }

    fn collect_result(&mut self) {
        let Some(worker) = self.worker.as_mut() else {
            return;
        };
        let Some(response) = worker.try_poll() else {
            return;
        };
        let Some(pending) = self.pending.take() else {
            return;
        };
        self.results_seen += 1;
        self.results_since_recycle += 1;
        metrics::inc_result();

        if response.tick != pending.tick {
            debug!(
                target: "foam::scheduler",
                expected = pending.tick,
                got = response.tick,
                "discarding late result from a superseded cycle"
            );
            return;
        }

        let result = response.result;
        self.last_t_geom_ms = result.elapsed_ms;
        self.last_flagged = result.flagged_count();
        metrics::observe_geometry_ms(result.elapsed_ms);
        for (flag, count) in flag_histogram(&result.flags) {
            metrics::add_cells_flagged(flag, count);
        }

        if result.all_flagged() {
            self.cycles_skipped += 1;
            metrics::inc_cycle_skipped();
            warn!(
                target: "foam::scheduler",
                tick = pending.tick,
                "every cell flagged; skipping adjust"
            );
        }

        let outcome = controller::apply(&self.config, &pending.r_prev, &result);
        self.stepper.set_radii(&outcome.radii);
        self.last_iq = outcome.iq;
        self.last_stats = outcome.stats;

        debug!(
            target: "foam::scheduler",
            tick = pending.tick,
            t_geom_ms = result.elapsed_ms,
            flagged = self.last_flagged,
            iq_mean = self.last_stats.mean,
            damped = outcome.damped,
            wait_ms = pending.submitted_at.elapsed().as_millis() as u64,
            "adjust applied"
        );

        self.adapt_cadence(result.elapsed_ms);
    }

    fn adapt_cadence(&mut self, t_geom_ms: f64) {
        if !self.config.auto_cadence {
            return;
        }
        let next = next_cadence(self.k, t_geom_ms, &self.config);
        if next != self.k {
            debug!(
                target: "foam::scheduler",
                from = self.k,
                to = next,
                t_geom_ms,
                "cadence adapted"
            );
            self.k = next;
        }
    }

    fn maybe_recycle_worker(&mut self) {
        if self.config.recycle_every == 0 || self.results_since_recycle < self.config.recycle_every
        {
            return;
        }
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
        }
        self.worker = Some(GeomWorker::spawn(GeometryAdapter::new(
            (self.backend_factory)(),
            self.config.chunk_max,
            self.config.n_max,
        )));
        self.results_since_recycle = 0;
        self.worker_recycles += 1;
        info!(
            target: "foam::scheduler",
            recycles = self.worker_recycles,
            results_seen = self.results_seen,
            "geometry worker recycled"
        );
    }

    fn submit_snapshot(&mut self) -> Result<(), FoamError> {
        let Some(worker) = self.worker.as_mut() else {
            return Ok(());
        };
        self.stepper.freeze();
        let points = self.stepper.get_positions01();
        let radii = self.stepper.get_radii();
        // A contract violation here is a broken stepper, not a geometry
        // failure: surface it to the caller instead of flagging the cycle.
        if let Err(err) = validate_buffers(&points, &radii, self.config.n_max) {
            self.stepper.resume();
            warn!(
                target: "foam::scheduler",
                error = %err,
                "stepper returned malformed buffers"
            );
            return Err(FoamError::Adapter(err));
        }
        let weights = radii.iter().map(|r| r * r).collect();
        let snapshot = Snapshot {
            tick: self.tick_index,
            points,
            weights,
        };
        let accepted = worker.try_submit(snapshot);
        self.stepper.resume();
        if accepted {
            metrics::inc_submission();
            self.pending = Some(PendingRequest {
                tick: self.tick_index,
                submitted_at: Instant::now(),
                r_prev: radii,
            });
            debug!(target: "foam::scheduler", tick = self.tick_index, "snapshot submitted");
        }
        Ok(())
    }

    fn publish_telemetry(&self) {
        let included = self.last_stats.below + self.last_stats.within + self.last_stats.above;
        let pct = |count: usize| {
            if included == 0 {
                0.0
            } else {
                count as f64 / included as f64
            }
        };
        metrics::set_cadence(self.k);
        metrics::set_pending(self.pending.is_some());
        self.hub.publish(TelemetrySnapshot {
            tick_index: self.tick_index,
            cadence_k: self.k,
            pending: self.pending.is_some(),
            t_geom_ms: self.last_t_geom_ms,
            iq_mean: self.last_stats.mean,
            iq_stddev: self.last_stats.stddev,
            pct_below: pct(self.last_stats.below),
            pct_within: pct(self.last_stats.within),
            pct_above: pct(self.last_stats.above),
            flags_nonzero_count: self.last_flagged,
            results_seen: self.results_seen,
            cycles_skipped: self.cycles_skipped,
            config_rejections: self.config_rejections,
            worker_recycles: self.worker_recycles,
        });
    }

    /// Latest published telemetry snapshot.
    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.hub.snapshot()
    }

    /// A hub handle for external readers; cheap to clone, safe to read from
    /// any thread.
    pub fn telemetry_hub(&self) -> TelemetryHub {
        self.hub.clone()
    }

    /// Per-cell IQ of the last measurement (NaN where excluded). Empty until
    /// the first result arrives.
    pub fn last_iq(&self) -> &[f64] {
        &self.last_iq
    }

    /// Apply a partial update of the live-tunable parameters, atomically.
    ///
    /// # Errors
    ///
    /// Returns [`FoamError::Config`] and leaves every value untouched when
    /// the merged config fails validation. Rejections are also counted in
    /// telemetry.
    pub fn set_config(&mut self, update: &ConfigUpdate) -> Result<(), FoamError> {
        match self.config.merged(update) {
            Ok(next) => {
                self.config = next;
                if let Some(k) = update.k {
                    self.k = k;
                }
                info!(target: "foam::scheduler", "live config applied");
                Ok(())
            }
            Err(errors) => {
                self.config_rejections += 1;
                metrics::inc_config_rejection();
                warn!(
                    target: "foam::scheduler",
                    rejected = errors.len(),
                    "live config update rejected"
                );
                Err(FoamError::Config(errors))
            }
        }
    }

    /// Stop the worker, discard any in-flight result, and cease publication.
    /// Subsequent `tick()` calls return [`FoamError::ShutDown`].
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
        }
        self.pending = None;
        self.shut_down = true;
        info!(
            target: "foam::scheduler",
            ticks = self.tick_index,
            results = self.results_seen,
            "scheduler shut down"
        );
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Check stepper-provided buffers against the adapter's input contract.
fn validate_buffers(
    points: &[[f64; 3]],
    radii: &[f64],
    n_max: usize,
) -> Result<(), AdapterError> {
    if points.len() != radii.len() {
        return Err(AdapterError::SizeMismatch {
            points: points.len(),
            weights: radii.len(),
        });
    }
    if radii.is_empty() {
        return Err(AdapterError::EmptyInput);
    }
    if radii.len() > n_max {
        return Err(AdapterError::TooManyPoints {
            n: radii.len(),
            n_max,
        });
    }
    Ok(())
}

/// Cadence response to one observed latency.
fn next_cadence(k: u32, t_geom_ms: f64, config: &FoamConfig) -> u32 {
    if t_geom_ms > 2.0 * config.t_target_ms && k < config.k_max {
        (k + config.dk_up).min(config.k_max)
    } else if t_geom_ms < config.t_target_ms && k > config.k_min {
        k.saturating_sub(config.dk_down).max(config.k_min)
    } else {
        k
    }
}

fn flag_histogram(flags: &[crate::CellFlag]) -> Vec<(&'static str, u64)> {
    use crate::CellFlag::*;
    let mut counts = [0u64; 7];
    for flag in flags {
        let slot = match flag {
            Ok => continue,
            Empty => 0,
            BadVolume => 1,
            ExtractFail => 2,
            GeomFail => 3,
            FacetFail => 4,
            Unknown => 5,
            TriangulationFail => 6,
        };
        counts[slot] += 1;
    }
    const NAMES: [&str; 7] = [
        "empty",
        "bad_volume",
        "extract_fail",
        "geom_fail",
        "facet_fail",
        "unknown",
        "triangulation_fail",
    ];
    NAMES
        .iter()
        .zip(counts)
        .filter(|(_, c)| *c > 0)
        .map(|(name, c)| (*name, c))
        .collect()
}
