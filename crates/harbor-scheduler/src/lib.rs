//! Per-pool instance scheduler.
//!
//! One scheduler runs per pool on the master, as a leader-elected
//! singleton: leadership is an ephemeral node at
//! `/scheduler/leader/<poolID>`, and only the holder reconciles. The
//! reconciler drives the published service definitions toward their
//! desired instance counts by creating `ServiceState`/`HostState` pairs on
//! eligible hosts and marking surplus instances for stop. Watches on the
//! pool's hosts and services re-trigger reconciliation, debounced to
//! absorb event bursts.

mod reconcile;
mod selection;

pub use reconcile::Scheduler;
pub use selection::{select_hosts, HostCandidate};

use harbor_coord::CoordError;
use harbor_model::ErrorKind;
use thiserror::Error;

/// Result type alias for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors raised by the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Coord(#[from] CoordError),

    #[error("no eligible host for service {service_id} (need {needed} bytes free)")]
    NoEligibleHost { service_id: String, needed: u64 },
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::Coord(err) => err.kind(),
            SchedulerError::NoEligibleHost { .. } => ErrorKind::PreconditionFailed,
        }
    }
}
