//! Dynamics stepper contract and a reference implementation.
//!
//! The scheduler is polymorphic over anything providing these six
//! capabilities; it makes no assumption about the dynamics' physics,
//! determinism, or performance. Getters must return owned copies — the
//! scheduler snapshots through them and the snapshot must not alias live
//! storage.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::wrap01;

/// Capability set the scheduler consumes.
pub trait DynamicsStepper: Send {
    /// Owned copy of all positions, wrapped into `[0,1)³`.
    fn get_positions01(&self) -> Vec<[f64; 3]>;

    /// Owned copy of all radii; each positive and finite.
    fn get_radii(&self) -> Vec<f64>;

    /// Overwrite live radii. Subsequent `get_radii` reflects the write.
    fn set_radii(&mut self, radii: &[f64]);

    /// Advance one sub-tick of dynamics. May be a no-op while frozen.
    fn relax_step(&mut self);

    /// Marker before a snapshot. Steppers may ignore it.
    fn freeze(&mut self);

    /// Marker after a snapshot; always paired with `freeze` within one tick.
    fn resume(&mut self);
}

/// Reference stepper: jittered-lattice initial layout and a seeded
/// random-walk relax.
///
/// The lattice start avoids the coincident points that degenerate-case
/// backends choke on; the walk is driven by a seeded RNG so two runs with the
/// same seed produce identical trajectories.
pub struct JitteredLatticeStepper {
    positions: Vec<[f64; 3]>,
    radii: Vec<f64>,
    rng: StdRng,
    frozen: bool,
    relax_steps: u64,
}

impl JitteredLatticeStepper {
    /// Build `n` particles on a jittered cube lattice.
    pub fn new(n: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);

        let m = ((n as f64).cbrt().round() as usize).max(4);
        let mut positions = Vec::with_capacity(n);
        'fill: for ix in 0..m {
            for iy in 0..m {
                for iz in 0..m {
                    if positions.len() == n {
                        break 'fill;
                    }
                    let cell = |k: usize| 0.05 + 0.90 * k as f64 / (m - 1) as f64;
                    positions.push([cell(ix), cell(iy), cell(iz)]);
                }
            }
        }
        // Lattice smaller than n: pad with jittered repeats of the head.
        let spacing = 1.0 / m as f64;
        let lattice_len = positions.len();
        let mut extra = 0usize;
        while positions.len() < n {
            let src = positions[extra % lattice_len];
            positions.push([
                wrap01(src[0] + (rng.gen::<f64>() - 0.5) * spacing * 0.2),
                wrap01(src[1] + (rng.gen::<f64>() - 0.5) * spacing * 0.2),
                wrap01(src[2] + (rng.gen::<f64>() - 0.5) * spacing * 0.2),
            ]);
            extra += 1;
        }
        // Small jitter everywhere so no two sites coincide exactly.
        for p in positions.iter_mut() {
            for c in p.iter_mut() {
                *c = wrap01(*c + (rng.gen::<f64>() - 0.5) * spacing * 0.1);
            }
        }

        let radii = (0..n)
            .map(|_| (0.02 + (rng.gen::<f64>() - 0.5) * 0.02).clamp(0.01, 0.05))
            .collect();

        Self {
            positions,
            radii,
            rng,
            frozen: false,
            relax_steps: 0,
        }
    }

    /// Number of relax steps actually executed (frozen ticks excluded).
    pub fn relax_steps(&self) -> u64 {
        self.relax_steps
    }
}

impl DynamicsStepper for JitteredLatticeStepper {
    fn get_positions01(&self) -> Vec<[f64; 3]> {
        self.positions.clone()
    }

    fn get_radii(&self) -> Vec<f64> {
        self.radii.clone()
    }

    fn set_radii(&mut self, radii: &[f64]) {
        if radii.len() == self.radii.len() {
            self.radii.copy_from_slice(radii);
        }
    }

    fn relax_step(&mut self) {
        if self.frozen {
            return;
        }
        for p in self.positions.iter_mut() {
            for c in p.iter_mut() {
                *c = wrap01(*c + (self.rng.gen::<f64>() - 0.5) * 0.002);
            }
        }
        self.relax_steps += 1;
    }

    fn freeze(&mut self) {
        self.frozen = true;
    }

    fn resume(&mut self) {
        self.frozen = false;
    }
}
