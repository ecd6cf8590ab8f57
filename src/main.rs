//! Demo binary for foam-orchestrator
//!
//! Wires the reference stepper and the synthetic backend into a running
//! measurement-control loop and logs telemetry as the foam settles.

use foam_orchestrator::{
    init_tracing, metrics, FoamConfig, JitteredLatticeStepper, Scheduler, UniformFoamBackend,
};
use std::time::Duration;
use tracing::info;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    metrics::init_metrics()?;

    let n = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(1000);
    let ticks: u64 = std::env::args()
        .nth(2)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(600);

    info!(n, ticks, "starting foam demo");

    let mut config = FoamConfig::with_n(n);
    config.k_initial = 24;
    let stepper = Box::new(JitteredLatticeStepper::new(n, 42));
    let mut scheduler = Scheduler::new(stepper, config, || {
        Box::new(UniformFoamBackend::new().with_latency(Duration::from_millis(8)))
    })?;

    for tick in 0..ticks {
        scheduler.tick()?;
        // Pace roughly like a display loop so geometry results interleave.
        std::thread::sleep(Duration::from_millis(1));

        if tick % 60 == 0 {
            let t = scheduler.telemetry();
            info!(
                tick = t.tick_index,
                cadence_k = t.cadence_k,
                pending = t.pending,
                t_geom_ms = format!("{:.1}", t.t_geom_ms).as_str(),
                iq_mean = format!("{:.3}", t.iq_mean).as_str(),
                results = t.results_seen,
                flagged = t.flags_nonzero_count,
                "cycle status"
            );
        }
    }

    let t = scheduler.telemetry();
    info!(
        results = t.results_seen,
        skipped = t.cycles_skipped,
        recycles = t.worker_recycles,
        "demo complete - shutting down"
    );
    scheduler.shutdown();

    print!("{}", metrics::gather_metrics());
    Ok(())
}
