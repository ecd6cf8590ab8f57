//! IQ-banded radius controller.
//!
//! ## Responsibility
//! Turn one geometry measurement into a zero-sum, clamped, dispersion-bounded
//! radius update. Pure: same inputs and config always produce bit-identical
//! outputs.
//!
//! ## Guarantees
//! - Flagged or surface-degenerate cells are excluded and keep their radius
//! - Growth intent is preserved; the shrink pool absorbs the zero-sum
//!   imbalance
//! - No radius moves more than `dr_cap` relative per step (before the
//!   dispersion renormalisation) or leaves `[r_min, r_max]`
//! - Degenerate measurements (every cell flagged) return the previous radii
//!   untouched
//!
//! ## NOT Responsible For
//! - Scheduling measurements or writing radii back (that belongs to
//!   `scheduler`)

use crate::config::FoamConfig;
use crate::GeometryResult;
use tracing::warn;

/// Surface areas at or below this are treated as degenerate.
const EPS_SURFACE: f64 = 1e-12;

/// Imbalance below this skips the zero-sum rescale.
const EPS_ZERO_SUM: f64 = 1e-12;

/// Factor applied to every delta when a dominant cell or flagged cell is seen.
const DAMPING: f64 = 0.25;

/// Undefined-IQ sentinel stored for excluded cells.
pub const IQ_UNDEFINED: f64 = f64::NAN;

/// Summary statistics over the defined IQ values of one measurement.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IqStats {
    /// Mean IQ over included cells (0 when none).
    pub mean: f64,
    /// Population standard deviation over included cells.
    pub stddev: f64,
    /// Included cells below the band.
    pub below: usize,
    /// Included cells inside the band.
    pub within: usize,
    /// Included cells above the band.
    pub above: usize,
}

/// Result of one controller application.
#[derive(Debug, Clone)]
pub struct ControlOutcome {
    /// Updated radii, same length and order as the input.
    pub radii: Vec<f64>,
    /// Per-cell IQ; [`IQ_UNDEFINED`] where the cell was excluded.
    pub iq: Vec<f64>,
    /// Band statistics over the defined IQ values.
    pub stats: IqStats,
    /// True when the dominance/flag guard scaled the update down.
    pub damped: bool,
    /// True when the dispersion guard renormalised the radii.
    pub renormalized: bool,
}

/// Isoperimetric quotient per cell: `36π V² / S³`, with the surface floored
/// at `EPS_SURFACE` to avoid blow-ups.
pub fn compute_iq(volumes: &[f64], areas: &[f64]) -> Vec<f64> {
    volumes
        .iter()
        .zip(areas)
        .map(|(&v, &s)| {
            let s = s.max(EPS_SURFACE);
            36.0 * std::f64::consts::PI * v * v / (s * s * s)
        })
        .collect()
}

/// Apply the banded zero-sum controller to one measurement.
///
/// `r_prev` are the radii the snapshot was taken with. The returned radii
/// are ready to write back through the stepper.
pub fn apply(config: &FoamConfig, r_prev: &[f64], result: &GeometryResult) -> ControlOutcome {
    let n = r_prev.len();
    if result.len() != n {
        warn!(
            target: "foam::controller",
            radii = n,
            cells = result.len(),
            "length mismatch; skipping update"
        );
        return ControlOutcome {
            radii: r_prev.to_vec(),
            iq: vec![IQ_UNDEFINED; n],
            stats: IqStats::default(),
            damped: false,
            renormalized: false,
        };
    }

    // IQ and the inclusion mask. Excluded cells never move.
    let mut iq = vec![IQ_UNDEFINED; n];
    let mut included = vec![false; n];
    for i in 0..n {
        if result.flags[i].is_ok() && result.areas[i] > EPS_SURFACE {
            let s = result.areas[i];
            iq[i] = 36.0 * std::f64::consts::PI * result.volumes[i] * result.volumes[i]
                / (s * s * s);
            included[i] = true;
        }
    }

    let stats = band_stats(&iq, &included, config.iq_min, config.iq_max);
    let included_count = stats.below + stats.within + stats.above;
    if included_count == 0 {
        return ControlOutcome {
            radii: r_prev.to_vec(),
            iq,
            stats,
            damped: false,
            renormalized: false,
        };
    }

    let v_mean = (0..n)
        .filter(|&i| included[i])
        .map(|i| result.volumes[i])
        .sum::<f64>()
        / included_count as f64;

    // Banded volume proposal.
    let mut dv = vec![0.0; n];
    for i in 0..n {
        if !included[i] {
            continue;
        }
        if iq[i] < config.iq_min {
            dv[i] = config.beta_grow * result.volumes[i];
        } else if iq[i] > config.iq_max {
            dv[i] = -config.beta_shrink * v_mean;
        }
    }

    // Zero-sum rescale: shrinks absorb the imbalance, growth is preserved.
    let s_pos: f64 = dv.iter().filter(|&&d| d > 0.0).sum();
    let s_neg: f64 = -dv.iter().filter(|&&d| d < 0.0).sum::<f64>();
    if s_pos > 0.0 && s_neg > 0.0 && (s_pos - s_neg).abs() > EPS_ZERO_SUM {
        let scale = s_pos / s_neg;
        for d in dv.iter_mut().filter(|d| **d < 0.0) {
            *d *= scale;
        }
    }

    // dV → dr via the sphere shell: dV = 4π r² dr.
    let mut dr = vec![0.0; n];
    for i in 0..n {
        if r_prev[i] > 0.0 {
            dr[i] = dv[i] / (4.0 * std::f64::consts::PI * r_prev[i] * r_prev[i]);
        }
    }

    // Guard a: dampen everything under a dominant cell or any flagged cell.
    let max_v = result.volumes.iter().cloned().fold(0.0, f64::max);
    let damped = max_v > config.v_dom || result.flagged_count() > 0;
    if damped {
        for d in dr.iter_mut() {
            *d *= DAMPING;
        }
    }

    // Guards b + c: relative per-step cap, then absolute bounds.
    let mut radii: Vec<f64> = (0..n)
        .map(|i| {
            let cap = config.dr_cap * r_prev[i];
            let step = dr[i].clamp(-cap, cap);
            (r_prev[i] + step).clamp(config.r_min, config.r_max)
        })
        .collect();

    // Guard d: renormalise total radius if dispersion ran away.
    let mut renormalized = false;
    let mean = radii.iter().sum::<f64>() / n as f64;
    if mean > 0.0 {
        let var = radii.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / n as f64;
        if var.sqrt() / mean > config.sigma_disp {
            let prev_total: f64 = r_prev.iter().sum();
            let new_total: f64 = radii.iter().sum();
            if new_total > 0.0 {
                let scale = prev_total / new_total;
                for r in radii.iter_mut() {
                    *r *= scale;
                }
                renormalized = true;
            }
        }
    }

    ControlOutcome {
        radii,
        iq,
        stats,
        damped,
        renormalized,
    }
}

fn band_stats(iq: &[f64], included: &[bool], iq_min: f64, iq_max: f64) -> IqStats {
    let defined: Vec<f64> = iq
        .iter()
        .zip(included)
        .filter(|(_, &inc)| inc)
        .map(|(&q, _)| q)
        .collect();
    if defined.is_empty() {
        return IqStats::default();
    }
    let mean = defined.iter().sum::<f64>() / defined.len() as f64;
    let var = defined.iter().map(|q| (q - mean) * (q - mean)).sum::<f64>() / defined.len() as f64;
    let below = defined.iter().filter(|&&q| q < iq_min).count();
    let above = defined.iter().filter(|&&q| q > iq_max).count();
    IqStats {
        mean,
        stddev: var.sqrt(),
        below,
        within: defined.len() - below - above,
        above,
    }
}
