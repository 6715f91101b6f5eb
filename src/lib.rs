//! # distconv
//!
//! Distributed 2D kernel convolution over row bands. An RGB image is split
//! into contiguous bands of rows, each band is shipped with the kernel and
//! multiplier to a worker, and the filtered bands are stitched back together.
//!
//! ## Key Features
//!
//! - **Deterministic partitioning**: band heights differ by at most one row
//! - **Overlap rows**: each band travels with `radius` neighbour rows, so
//!   any worker count produces the same pixels as a single pass
//! - **Two transports**: an in-process rank group with tagged ordered
//!   messages, and TCP peers with framed units, timeouts and retries
//! - **Pluggable band codec**: raw, PNG or JPEG
//! - **CPU affinity**: optional pinning of rank threads to cores
//!
//! ## Architecture
//!
//! ```text
//!                     ┌──────────────┐
//!  image + kernel ──> │ Coordinator  │ ──> output + elapsed
//!                     └──────────────┘
//!                       │ WorkUnit ▲ ResultUnit
//!                       ▼          │
//!                     ┌──────────────┐
//!                     │  Transport   │  group (ranks) | peer (TCP)
//!                     └──────────────┘
//!                       │          ▲
//!              ┌────────┴──┐    ┌──┴────────┐
//!              │ Worker 1  │ .. │ Worker W  │  convolve band rows
//!              └───────────┘    └───────────┘
//! ```

#![warn(missing_docs, rust_2018_idioms)]

pub mod codec;
pub mod config;
pub mod convolve;
pub mod coordinator;
pub mod error;
pub mod grid;
pub mod kernel;
pub mod partition;
pub mod transport;
pub mod unit;
pub mod worker;

// Re-exports
pub use codec::Codec;
pub use config::{ChannelConfig, CoordinatorConfig, GroupConfig, PeerConfig};
pub use coordinator::{Coordinator, RunReport, WorkerFailure};
pub use error::{Error, Result, Stage};
pub use grid::{PixelGrid, Rgb};
pub use kernel::{Kernel, KernelRegistry, NamedKernel};
pub use partition::{Band, BandPartitioner, EdgePolicy};
pub use transport::group::GroupTransport;
pub use transport::peer::{PeerTransport, PeerWorker, PeerWorkerHandle};
pub use transport::Transport;
pub use unit::{BandGeometry, ResultUnit, WorkUnit};
pub use worker::{WorkerConfig, WorkerId, COORDINATOR};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::codec::Codec;
    pub use crate::config::{CoordinatorConfig, GroupConfig, PeerConfig};
    pub use crate::coordinator::{Coordinator, RunReport};
    pub use crate::error::{Error, Result};
    pub use crate::grid::PixelGrid;
    pub use crate::kernel::{Kernel, KernelRegistry};
    pub use crate::partition::EdgePolicy;
    pub use crate::transport::group::GroupTransport;
    pub use crate::transport::peer::{PeerTransport, PeerWorker};
    pub use crate::transport::Transport;
}
