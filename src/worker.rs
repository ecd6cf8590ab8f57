//! Geometry worker: single-flight background execution.
//!
//! ## Responsibility
//! Run the [`GeometryAdapter`](crate::adapter::GeometryAdapter) on a dedicated
//! OS thread behind two one-slot channels, so the scheduler's thread never
//! blocks for longer than an atomic channel probe.
//!
//! ## Guarantees
//! - At most one request in flight; `try_submit` returns `false` while one is
//! - Each accepted submission produces exactly one pollable response (a crash
//!   inside the worker surfaces as a total-failure result, never a hang)
//! - Dropping the worker joins its thread after the call in progress finishes
//!
//! ## NOT Responsible For
//! - Deciding *when* to measure (that belongs to `scheduler`)
//! - Interpreting results (that belongs to `controller`)

use crate::adapter::GeometryAdapter;
use crate::{GeometryResult, Snapshot};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A completed geometry call, tagged with the tick of its snapshot so the
/// scheduler can discard late results from a superseded cycle.
#[derive(Debug)]
pub struct GeomResponse {
    /// Tick at which the submitted snapshot was taken.
    pub tick: u64,
    /// The adapter's result, forwarded unchanged.
    pub result: GeometryResult,
}

/// Handle to one background geometry worker.
///
/// The worker owns its adapter instance; recycling (tear down and recreate)
/// therefore also resets any backend state the adapter caches.
pub struct GeomWorker {
    req_tx: Option<mpsc::Sender<Snapshot>>,
    res_rx: mpsc::Receiver<GeomResponse>,
    handle: Option<thread::JoinHandle<()>>,
    /// `(tick, n)` of the request in flight, if any.
    pending: Option<(u64, usize)>,
}

impl GeomWorker {
    /// Spawn a worker thread that owns `adapter`.
    pub fn spawn(adapter: GeometryAdapter) -> Self {
        let (req_tx, mut req_rx) = mpsc::channel::<Snapshot>(1);
        let (res_tx, res_rx) = mpsc::channel::<GeomResponse>(1);

        let handle = thread::spawn(move || {
            while let Some(snapshot) = req_rx.blocking_recv() {
                let n = snapshot.len();
                let tick = snapshot.tick;
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    adapter.compute(&snapshot.points, &snapshot.weights)
                }));
                let result = match outcome {
                    Ok(Ok(result)) => result,
                    Ok(Err(err)) => {
                        warn!(target: "foam::worker", error = %err, "adapter rejected snapshot");
                        GeometryResult::total_failure(n, 0.0)
                    }
                    Err(_) => {
                        warn!(target: "foam::worker", "worker task panicked; surfacing total failure");
                        GeometryResult::total_failure(n, 0.0)
                    }
                };
                if res_tx.blocking_send(GeomResponse { tick, result }).is_err() {
                    break;
                }
            }
            debug!(target: "foam::worker", "worker thread exiting");
        });

        Self {
            req_tx: Some(req_tx),
            res_rx,
            handle: Some(handle),
            pending: None,
        }
    }

    /// Offer a snapshot to the worker.
    ///
    /// Returns `true` and takes ownership of the snapshot iff no request is
    /// in flight; otherwise returns `false` with no side effect. Never
    /// blocks.
    pub fn try_submit(&mut self, snapshot: Snapshot) -> bool {
        if self.pending.is_some() {
            return false;
        }
        let meta = (snapshot.tick, snapshot.len());
        let Some(tx) = self.req_tx.as_ref() else {
            return false;
        };
        match tx.try_send(snapshot) {
            Ok(()) => {
                self.pending = Some(meta);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => false,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(target: "foam::worker", "request channel closed; worker is gone");
                false
            }
        }
    }

    /// Collect a completed response, if any. Consuming a response re-arms
    /// acceptance. Never blocks.
    ///
    /// If the worker thread died with a request outstanding, a synthesized
    /// total-failure response is returned so the caller always makes forward
    /// progress.
    pub fn try_poll(&mut self) -> Option<GeomResponse> {
        match self.res_rx.try_recv() {
            Ok(response) => {
                self.pending = None;
                Some(response)
            }
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                self.pending.take().map(|(tick, n)| {
                    warn!(target: "foam::worker", tick, "worker died mid-request");
                    GeomResponse {
                        tick,
                        result: GeometryResult::total_failure(n, 0.0),
                    }
                })
            }
        }
    }

    /// True while a request is in flight.
    pub fn pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Stop accepting work and join the worker thread. Any in-flight result
    /// is discarded.
    pub fn shutdown(mut self) {
        self.join_inner();
    }

    fn join_inner(&mut self) {
        // Closing the request channel makes blocking_recv return None.
        self.req_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(target: "foam::worker", "worker thread panicked during shutdown");
            }
        }
        // Drain whatever the worker managed to emit before exiting.
        while self.res_rx.try_recv().is_ok() {}
        self.pending = None;
    }
}

impl Drop for GeomWorker {
    fn drop(&mut self) {
        self.join_inner();
    }
}
