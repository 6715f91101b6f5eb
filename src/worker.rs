//! Worker side of a run
//!
//! Workers are stateless: [`serve`] turns one [`WorkUnit`] into one
//! [`ResultUnit`] and holds nothing between calls, so restarting a worker
//! between runs is always safe. Both transports host workers on dedicated
//! threads started through [`spawn_thread`].

use std::thread::{self, JoinHandle};

use log::debug;

#[cfg(feature = "serialization")]
use serde::{Deserialize, Serialize};

use crate::convolve;
use crate::error::{Error, Result};
use crate::unit::{ResultUnit, WorkUnit};

/// Worker identifier; coordinator is rank 0, workers are `1..=W`
pub type WorkerId = usize;

/// Rank of the coordinating party
pub const COORDINATOR: WorkerId = 0;

/// Thread configuration for a worker
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub struct WorkerConfig {
    /// Worker name (used in thread names)
    pub name: Option<String>,

    /// CPU core to pin this worker to (None = no pinning)
    pub cpu_affinity: Option<usize>,

    /// Stack size for worker thread (None = default)
    pub stack_size: Option<usize>,
}

impl WorkerConfig {
    /// Create a new worker configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set CPU affinity
    pub fn with_cpu_affinity(mut self, cpu: usize) -> Self {
        self.cpu_affinity = Some(cpu);
        self
    }

    /// Set stack size
    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }
}

/// Filter one band
///
/// Decodes the window, convolves its logical rows while sampling the overlap
/// rows, and encodes the result with the same codec and geometry.
pub fn serve(unit: WorkUnit) -> Result<ResultUnit> {
    let window = unit.decode_window()?;
    let top = unit.geometry.overlap_top as usize;
    let rows = top..top + unit.geometry.band_height() as usize;
    let filtered = convolve::apply_rows(&window, &unit.kernel, unit.multiplier, rows)?;

    debug!(
        "filtered rows {}..{} ({}x{} window, kernel {}x{})",
        unit.geometry.y_start,
        unit.geometry.y_end,
        window.width(),
        window.height(),
        unit.kernel.size(),
        unit.kernel.size()
    );

    ResultUnit::new(unit.geometry, unit.codec, &filtered)
}

/// Start a named worker thread, optionally pinned to a core
pub fn spawn_thread<F, T>(
    config: &WorkerConfig,
    default_name: String,
    body: F,
) -> Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let name = match &config.name {
        Some(name) => format!("{}-{}", default_name, name),
        None => default_name,
    };
    let mut builder = thread::Builder::new().name(name.clone());
    if let Some(stack_size) = config.stack_size {
        builder = builder.stack_size(stack_size);
    }

    let cpu_affinity = config.cpu_affinity;
    builder
        .spawn(move || {
            if let Some(cpu) = cpu_affinity {
                if let Some(core_ids) = core_affinity::get_core_ids() {
                    if let Some(core) = core_ids.get(cpu % core_ids.len().max(1)) {
                        core_affinity::set_for_current(*core);
                    }
                }
            }
            body()
        })
        .map_err(|e| Error::Configuration(format!("failed to spawn thread {}: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Codec;
    use crate::grid::PixelGrid;
    use crate::kernel::KernelRegistry;
    use crate::partition::{BandPartitioner, EdgePolicy};

    #[test]
    fn test_serve_matches_whole_image_convolution() {
        let registry = KernelRegistry::builtin();
        let sharpen = registry.resolve("sharpen").unwrap();
        let image =
            PixelGrid::from_fn(12, 9, |x, y| [(x * 20) as u8, (y * 25) as u8, (x * y) as u8]);
        let expected = convolve::apply(&image, &sharpen.kernel, sharpen.multiplier).unwrap();

        let bands = BandPartitioner::new(EdgePolicy::Wrap)
            .partition(9, 3, sharpen.kernel.radius())
            .unwrap();
        for band in &bands {
            let unit =
                WorkUnit::from_band(&image, band, &sharpen.kernel, sharpen.multiplier, Codec::Png)
                    .unwrap();
            let result = serve(unit).unwrap();
            assert_eq!(result.geometry.y_start as usize, band.y_start);
            assert_eq!(result.decode().unwrap(), expected.rows(band.logical_rows()).unwrap());
        }
    }

    #[test]
    fn test_serve_rejects_corrupt_payload() {
        let registry = KernelRegistry::builtin();
        let blur = registry.resolve("blur").unwrap();
        let image = PixelGrid::filled(4, 4, [1, 2, 3]);
        let band = BandPartitioner::default().partition(4, 1, 1).unwrap()[0];
        let mut unit =
            WorkUnit::from_band(&image, &band, &blur.kernel, blur.multiplier, Codec::Png).unwrap();
        unit.payload.truncate(10);
        assert!(matches!(serve(unit), Err(Error::Codec(_))));
    }

    #[test]
    fn test_spawn_thread_names_and_runs() {
        let config = WorkerConfig::new().with_name("test").with_stack_size(256 * 1024);
        let handle = spawn_thread(&config, "rank-1".to_string(), || {
            thread::current().name().map(str::to_string)
        })
        .unwrap();
        assert_eq!(handle.join().unwrap().as_deref(), Some("rank-1-test"));
    }
}
