//! # foam-orchestrator
//!
//! Adaptive measurement-control loop for a self-organising foam: a population
//! of weighted points in the periodic unit cube whose radii are steered until
//! each point's Laguerre (power) cell sits inside a prescribed roundness band.
//!
//! ## Architecture
//!
//! Three asymmetric workers coordinated by a cycle state machine:
//! ```text
//! tick() ──► DynamicsStepper (relax, every frame)
//!    │
//!    ├─ cadence boundary ──► GeomWorker (1-slot submit) ──► GeometryAdapter
//!    │                                                        │ (backend)
//!    └─ try_poll ◄── GeometryResult ◄─────────────────────────┘
//!                │
//!                └──► IQ controller ──► set_radii, telemetry, cadence update
//! ```
//!
//! The main task never blocks on geometry: requests travel over two
//! single-slot channels, at most one in flight, and slow results simply
//! stretch the measurement cadence.

use thiserror::Error;

pub mod adapter;
pub mod config;
pub mod controller;
pub mod metrics;
pub mod scheduler;
pub mod stepper;
pub mod telemetry;
pub mod worker;

// Re-exports
pub use adapter::{AdapterError, GeometryAdapter, GeometryBackend, UniformFoamBackend};
pub use config::{ConfigError, ConfigUpdate, FoamConfig};
pub use scheduler::Scheduler;
pub use stepper::{DynamicsStepper, JitteredLatticeStepper};
pub use telemetry::TelemetrySnapshot;
pub use worker::GeomWorker;

/// Orchestrator-specific errors
#[derive(Error, Debug)]
pub enum FoamError {
    /// Construction-time or live-update configuration rejection.
    #[error("configuration rejected: {}", format_config_errors(.0))]
    Config(Vec<ConfigError>),

    /// Malformed geometry input: a stepper broke its contract or an embedder
    /// fed the adapter bad buffers.
    #[error("invalid geometry input: {0}")]
    Adapter(#[from] adapter::AdapterError),

    /// The worker's channels closed unexpectedly (worker thread gone).
    #[error("geometry worker channel closed unexpectedly")]
    ChannelClosed,

    /// Operation attempted after `shutdown()`.
    #[error("scheduler is shut down")]
    ShutDown,
}

fn format_config_errors(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Per-cell status of a geometry extraction.
///
/// Any value other than `Ok` means the cell contributes zero metrics and is
/// excluded from control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellFlag {
    /// Cell extracted cleanly; metrics are valid.
    Ok,
    /// The Laguerre cell is empty (site fully dominated by neighbours).
    Empty,
    /// Volume came back non-finite or negative.
    BadVolume,
    /// Per-cell extraction raised inside the backend.
    ExtractFail,
    /// Geometry computation failed after extraction.
    GeomFail,
    /// Facet iteration failed.
    FacetFail,
    /// Backend reported an unclassified per-cell error.
    Unknown,
    /// The whole backend call crashed; every cell in the result carries this.
    TriangulationFail,
}

impl CellFlag {
    /// True for cells whose metrics may enter the controller.
    pub fn is_ok(self) -> bool {
        matches!(self, CellFlag::Ok)
    }
}

/// An owned copy of `(positions, weights)` taken at a specific tick.
///
/// Once submitted, the snapshot is transferred by value to the worker; later
/// mutation of live particle storage cannot affect in-flight work.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Tick at which the snapshot was taken.
    pub tick: u64,
    /// Positions in `[0,1)³`, one per particle, stable index order.
    pub points: Vec<[f64; 3]>,
    /// Power weights (`r_i²`), same length as `points`.
    pub weights: Vec<f64>,
}

impl Snapshot {
    /// Number of particles in the snapshot.
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    /// True if the snapshot holds no particles.
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

/// Per-cell metrics for one completed geometry call.
///
/// Invariant at success: `Σ volumes ≈ 1` (unit cube), each volume `≤ 1`,
/// each area `≤ 6`. Flagged cells carry zero metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct GeometryResult {
    /// Cell volumes, `[0, 1]`.
    pub volumes: Vec<f64>,
    /// Cell surface areas, `[0, 6]`.
    pub areas: Vec<f64>,
    /// Face counts, `[0, 100]`.
    pub face_counts: Vec<u32>,
    /// Per-cell status.
    pub flags: Vec<CellFlag>,
    /// Wall-clock duration of the backend call in milliseconds.
    pub elapsed_ms: f64,
}

impl GeometryResult {
    /// A result with every cell flagged `TriangulationFail` and zero metrics.
    ///
    /// Produced when the backend call itself crashed; the scheduler treats it
    /// as a skipped cycle.
    pub fn total_failure(n: usize, elapsed_ms: f64) -> Self {
        Self {
            volumes: vec![0.0; n],
            areas: vec![0.0; n],
            face_counts: vec![0; n],
            flags: vec![CellFlag::TriangulationFail; n],
            elapsed_ms,
        }
    }

    /// Number of cells in the result.
    pub fn len(&self) -> usize {
        self.flags.len()
    }

    /// True if the result holds no cells.
    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    /// Count of cells with a non-`Ok` flag.
    pub fn flagged_count(&self) -> usize {
        self.flags.iter().filter(|f| !f.is_ok()).count()
    }

    /// True when no cell survived extraction.
    pub fn all_flagged(&self) -> bool {
        self.flags.iter().all(|f| !f.is_ok())
    }
}

/// Initialise tracing with env-filter support. Call once at binary startup.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .try_init();
}

/// Wrap a coordinate into `[0, 1)` by repeated unit translation.
///
/// Non-finite inputs are returned unchanged; callers decide their fate.
pub fn wrap01(mut x: f64) -> f64 {
    if !x.is_finite() {
        return x;
    }
    while x < 0.0 {
        x += 1.0;
    }
    while x >= 1.0 {
        x -= 1.0;
    }
    x
}
