//! Geometry backend adapter.
//!
//! ## Responsibility
//! Wrap a fragile periodic-Laguerre backend behind a safe, total interface:
//! owned input copies, sanitisation, de-duplication, batching, per-call crash
//! containment, and output sanity clamps.
//!
//! ## Guarantees
//! - The adapter never panics and never propagates a backend crash; every
//!   runtime failure is encoded in per-cell [`CellFlag`]s
//! - Inputs are copied before the backend sees them; the caller's buffers are
//!   never retained
//! - Batched invocations pass the *full* point set on every call (periodic
//!   Laguerre cells are globally coupled) and only select which indices to
//!   extract, so a stable backend produces batch-invariant results
//!
//! ## NOT Responsible For
//! - Threading (that belongs to `worker`)
//! - Interpreting flags for control (that belongs to `controller`)

use crate::{wrap01, CellFlag, GeometryResult};
use std::ops::Range;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, warn};

/// Coordinates are clamped below `1 - COORD_EPS` after wrapping.
const COORD_EPS: f64 = 1e-9;

/// Weight clamp range; non-finite or non-positive weights become `W_MIN`.
const W_MIN: f64 = 1e-12;
const W_MAX: f64 = 1.0;

/// Output sanity bounds per cell.
const V_MAX: f64 = 1.0;
const S_MAX: f64 = 6.0;
const F_MAX: u32 = 100;

/// Raw per-cell output of a backend invocation, before sanity clamps.
#[derive(Debug, Clone, Copy)]
pub struct RawCell {
    /// Cell volume.
    pub volume: f64,
    /// Cell surface area.
    pub area: f64,
    /// Number of contributing facets.
    pub face_count: u32,
    /// Extraction status for this cell.
    pub flag: CellFlag,
}

/// A periodic weighted-Voronoi routine.
///
/// Implementations must be `Send` so the worker thread can own them. They are
/// allowed to panic: the adapter contains the crash and reports a
/// total-failure result. Per-cell failures should instead be reported through
/// [`RawCell::flag`] so the rest of the batch survives.
pub trait GeometryBackend: Send {
    /// One-time initialisation. Invoked exactly once per adapter instance
    /// before the first [`GeometryBackend::cells`] call.
    fn init(&self) {}

    /// Compute Laguerre cell metrics for the indices in `extract`, with the
    /// full point cloud visible. `points` are in `[0,1)³` with periodicity
    /// 1.0; `weights` are finite positive power weights.
    ///
    /// Must return exactly `extract.len()` cells in index order.
    fn cells(&self, points: &[[f64; 3]], weights: &[f64], extract: Range<usize>) -> Vec<RawCell>;
}

/// Typed rejections for malformed adapter input.
///
/// These cover caller bugs only; every backend-side condition is encoded in
/// flags instead.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AdapterError {
    /// Zero particles submitted.
    #[error("empty input: at least one particle is required")]
    EmptyInput,

    /// `points` and `weights` lengths disagree.
    #[error("size mismatch: {points} points vs {weights} weights")]
    SizeMismatch {
        /// Number of points supplied.
        points: usize,
        /// Number of weights supplied.
        weights: usize,
    },

    /// More particles than the configured hard cap.
    #[error("too many points: {n} exceeds the hard cap of {n_max}")]
    TooManyPoints {
        /// Number of points supplied.
        n: usize,
        /// Configured hard cap.
        n_max: usize,
    },
}

/// Safe wrapper around one [`GeometryBackend`] instance.
pub struct GeometryAdapter {
    backend: Box<dyn GeometryBackend>,
    chunk_max: usize,
    n_max: usize,
    initialized: AtomicBool,
}

impl GeometryAdapter {
    /// Wrap `backend` with the given batching bound and particle cap.
    pub fn new(backend: Box<dyn GeometryBackend>, chunk_max: usize, n_max: usize) -> Self {
        Self {
            backend,
            chunk_max: chunk_max.max(1),
            n_max,
            initialized: AtomicBool::new(false),
        }
    }

    /// Compute periodic Laguerre cell metrics for the given particle set.
    ///
    /// Inputs are copied, sanitised, and de-duplicated before the backend is
    /// invoked; the caller's slices are not accessed afterwards. A crashing
    /// backend yields a result with every flag set to
    /// [`CellFlag::TriangulationFail`] rather than an error.
    ///
    /// # Errors
    ///
    /// Only for malformed input: empty set, length mismatch, or a particle
    /// count above the hard cap.
    pub fn compute(
        &self,
        points: &[[f64; 3]],
        weights: &[f64],
    ) -> Result<GeometryResult, AdapterError> {
        let n = weights.len();
        if points.len() != n {
            return Err(AdapterError::SizeMismatch {
                points: points.len(),
                weights: n,
            });
        }
        if n == 0 {
            return Err(AdapterError::EmptyInput);
        }
        if n > self.n_max {
            return Err(AdapterError::TooManyPoints {
                n,
                n_max: self.n_max,
            });
        }

        // Owned copies; the backend may hold pointers for the whole call.
        let mut pts: Vec<[f64; 3]> = points.to_vec();
        let mut w: Vec<f64> = weights.to_vec();
        sanitize(&mut pts, &mut w);
        deduplicate(&mut pts);

        let start = Instant::now();

        if !self.initialized.swap(true, Ordering::SeqCst) {
            let init_ok = catch_unwind(AssertUnwindSafe(|| self.backend.init())).is_ok();
            if !init_ok {
                warn!(target: "foam::adapter", "backend init crashed");
                return Ok(GeometryResult::total_failure(n, elapsed_ms(start)));
            }
        }

        let mut cells: Vec<RawCell> = Vec::with_capacity(n);
        let mut lo = 0usize;
        while lo < n {
            let hi = (lo + self.chunk_max).min(n);
            let batch = catch_unwind(AssertUnwindSafe(|| self.backend.cells(&pts, &w, lo..hi)));
            match batch {
                Ok(mut out) => {
                    if out.len() != hi - lo {
                        warn!(
                            target: "foam::adapter",
                            expected = hi - lo,
                            got = out.len(),
                            "backend returned wrong batch length"
                        );
                        out = vec![
                            RawCell {
                                volume: 0.0,
                                area: 0.0,
                                face_count: 0,
                                flag: CellFlag::Unknown,
                            };
                            hi - lo
                        ];
                    }
                    cells.extend(out);
                }
                Err(_) => {
                    warn!(target: "foam::adapter", batch_start = lo, "backend call crashed");
                    return Ok(GeometryResult::total_failure(n, elapsed_ms(start)));
                }
            }
            lo = hi;
        }

        let result = finalize(cells, elapsed_ms(start));
        debug!(
            target: "foam::adapter",
            n,
            flagged = result.flagged_count(),
            elapsed_ms = result.elapsed_ms,
            "geometry call complete"
        );
        Ok(result)
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1e3
}

/// Wrap positions into `[0, 1-ε]` and clamp weights into `[W_MIN, W_MAX]`.
/// Non-finite coordinates collapse to 0.0; degenerate weights become `W_MIN`.
fn sanitize(points: &mut [[f64; 3]], weights: &mut [f64]) {
    for p in points.iter_mut() {
        for c in p.iter_mut() {
            if !c.is_finite() {
                *c = 0.0;
                continue;
            }
            *c = wrap01(*c).min(1.0 - COORD_EPS);
        }
    }
    for w in weights.iter_mut() {
        if !w.is_finite() || *w <= 0.0 {
            *w = W_MIN;
        }
        *w = w.clamp(W_MIN, W_MAX);
    }
}

/// Displace exact coincident points by a micro-jitter keyed by index.
///
/// The first occurrence of each coordinate triple keeps its position; later
/// duplicates move. The jitter is a pure function of the index, so runs are
/// bit-reproducible.
fn deduplicate(points: &mut [[f64; 3]]) {
    use std::collections::HashMap;
    let mut seen: HashMap<[u64; 3], usize> = HashMap::with_capacity(points.len());
    for i in 0..points.len() {
        let key = [
            points[i][0].to_bits(),
            points[i][1].to_bits(),
            points[i][2].to_bits(),
        ];
        if seen.insert(key, i).is_some() {
            for (c, coord) in points[i].iter_mut().enumerate() {
                let h = splitmix64((i as u64) * 3 + c as u64 + 1);
                // Offset in roughly ±1e-9, never exactly zero.
                let frac = (h >> 11) as f64 / (1u64 << 53) as f64;
                let offset = (frac - 0.5) * 2.0 * COORD_EPS + COORD_EPS * 0.01;
                *coord = wrap01(*coord + offset).min(1.0 - COORD_EPS);
            }
        }
    }
}

/// SplitMix64 — the deterministic key for de-duplication jitter.
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// Apply output sanity clamps and assemble the final result.
fn finalize(cells: Vec<RawCell>, elapsed_ms: f64) -> GeometryResult {
    let n = cells.len();
    let mut volumes = Vec::with_capacity(n);
    let mut areas = Vec::with_capacity(n);
    let mut face_counts = Vec::with_capacity(n);
    let mut flags = Vec::with_capacity(n);

    for cell in cells {
        let mut flag = cell.flag;
        let (v, s, f) = if !flag.is_ok() {
            (0.0, 0.0, 0)
        } else if !cell.volume.is_finite() || cell.volume < 0.0 || !cell.area.is_finite() {
            flag = CellFlag::BadVolume;
            (0.0, 0.0, 0)
        } else {
            (
                cell.volume.clamp(0.0, V_MAX),
                cell.area.clamp(0.0, S_MAX),
                cell.face_count.min(F_MAX),
            )
        };
        volumes.push(v);
        areas.push(s);
        face_counts.push(f);
        flags.push(flag);
    }

    GeometryResult {
        volumes,
        areas,
        face_counts,
        flags,
        elapsed_ms,
    }
}

// ============================================================================
// Uniform foam backend (testing / demo)
// ============================================================================

/// Deterministic synthetic backend for tests and demos.
///
/// Models a settled foam: each cell's volume is its weight's share of the
/// unit cube and its surface area is derived so the cell sits at a chosen IQ.
/// No real geometry is computed, which makes latency and output fully
/// scriptable.
pub struct UniformFoamBackend {
    iq_target: f64,
    latency: std::time::Duration,
}

impl UniformFoamBackend {
    /// Backend whose cells all land at IQ 0.80 with no artificial latency.
    pub fn new() -> Self {
        Self {
            iq_target: 0.80,
            latency: std::time::Duration::ZERO,
        }
    }

    /// Place every produced cell at the given isoperimetric quotient.
    pub fn with_iq(mut self, iq: f64) -> Self {
        self.iq_target = iq;
        self
    }

    /// Sleep this long inside each full `compute` call (per batch the sleep
    /// is divided proportionally), to exercise cadence adaptation.
    pub fn with_latency(mut self, latency: std::time::Duration) -> Self {
        self.latency = latency;
        self
    }
}

impl Default for UniformFoamBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GeometryBackend for UniformFoamBackend {
    fn cells(&self, points: &[[f64; 3]], weights: &[f64], extract: Range<usize>) -> Vec<RawCell> {
        if !self.latency.is_zero() {
            let share = extract.len() as f64 / points.len().max(1) as f64;
            std::thread::sleep(self.latency.mul_f64(share));
        }
        let total_w: f64 = weights.iter().sum();
        extract
            .map(|i| {
                let volume = if total_w > 0.0 {
                    weights[i] / total_w
                } else {
                    0.0
                };
                // IQ = 36π V² / S³  ⇒  S = (36π V² / IQ)^(1/3)
                let area = (36.0 * std::f64::consts::PI * volume * volume / self.iq_target)
                    .powf(1.0 / 3.0);
                RawCell {
                    volume,
                    area,
                    face_count: 14,
                    flag: CellFlag::Ok,
                }
            })
            .collect()
    }
}
