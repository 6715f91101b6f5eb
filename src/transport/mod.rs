//! Transports between the coordinator and its workers
//!
//! Two interchangeable backends implement [`Transport`]:
//!
//! - [`group::GroupTransport`]: all ranks are started together and addressed
//!   by number; every field of a unit travels as its own tagged message and
//!   both ends read them in the same fixed order.
//! - [`peer::PeerTransport`]: workers are independent listeners; the
//!   coordinator opens one connection per worker per run and exchanges one
//!   framed unit each way (see [`wire`]).
//!
//! Workers are addressed `1..=num_workers()`.

pub mod channel;
pub mod group;
pub mod peer;
pub mod wire;

use crate::error::{Error, Result};
use crate::unit::{ResultUnit, WorkUnit};
use crate::worker::WorkerId;

/// Send work units to addressed workers and receive their results
pub trait Transport: Send + Sync {
    /// Short backend name for diagnostics
    fn name(&self) -> &'static str;

    /// Number of workers reachable through this transport
    fn num_workers(&self) -> usize;

    /// Send one unit to one worker; may block until the peer can receive
    fn dispatch(&self, worker: WorkerId, unit: WorkUnit) -> Result<()>;

    /// Block until that worker's result is available
    fn collect(&self, worker: WorkerId) -> Result<ResultUnit>;

    /// Whether one worker's failure leaves the others' results usable
    fn isolates_failures(&self) -> bool;

    /// Release transport resources
    fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Check that `worker` addresses one of `num_workers` workers
pub(crate) fn check_worker(worker: WorkerId, num_workers: usize) -> Result<()> {
    if worker == 0 || worker > num_workers {
        return Err(Error::Configuration(format!(
            "worker {} out of range 1..={}",
            worker, num_workers
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_worker() {
        assert!(check_worker(0, 3).is_err());
        assert!(check_worker(1, 3).is_ok());
        assert!(check_worker(3, 3).is_ok());
        assert!(check_worker(4, 3).is_err());
    }
}
