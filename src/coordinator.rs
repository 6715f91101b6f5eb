//! Orchestration of one distributed run
//!
//! The coordinator partitions the image, dispatches one [`WorkUnit`] per
//! worker in increasing worker order, then collects in the same order and
//! stitches each band's logical rows into the output grid.

use std::ops::Range;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::config::CoordinatorConfig;
use crate::error::{Error, Result, Stage};
use crate::grid::PixelGrid;
use crate::kernel::{validate_multiplier, Kernel, KernelRegistry};
use crate::partition::{Band, BandPartitioner};
use crate::transport::Transport;
use crate::unit::{BandGeometry, WorkUnit};
use crate::worker::WorkerId;

/// A worker whose band is missing from the output
#[derive(Debug)]
pub struct WorkerFailure {
    /// Worker that failed
    pub worker: WorkerId,

    /// Stage at which it failed
    pub stage: Stage,

    /// Output rows left unfilled
    pub rows: Range<usize>,

    /// What went wrong
    pub error: Error,
}

/// Outcome of a run
#[derive(Debug)]
pub struct RunReport {
    /// Filtered image; rows of failed workers stay black
    pub output: PixelGrid,

    /// Wall-clock time from the first dispatch to the last collect
    pub elapsed: Duration,

    /// Workers whose bands are missing
    pub failures: Vec<WorkerFailure>,
}

impl RunReport {
    /// Whether every band was written
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Elapsed time in milliseconds
    pub fn elapsed_millis(&self) -> u128 {
        self.elapsed.as_millis()
    }
}

/// Drives runs over any [`Transport`]
#[derive(Debug, Clone)]
pub struct Coordinator {
    config: CoordinatorConfig,
    registry: KernelRegistry,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new(CoordinatorConfig::default(), KernelRegistry::builtin())
    }
}

impl Coordinator {
    /// Create a coordinator with an injected kernel registry
    pub fn new(config: CoordinatorConfig, registry: KernelRegistry) -> Self {
        Self { config, registry }
    }

    /// Kernel registry used by [`Coordinator::run_named`]
    pub fn registry(&self) -> &KernelRegistry {
        &self.registry
    }

    /// Coordinator configuration
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Resolve `selector` in the registry and run with its implied multiplier
    pub fn run_named<T: Transport + ?Sized>(
        &self,
        transport: &T,
        image: &PixelGrid,
        selector: &str,
        num_workers: usize,
    ) -> Result<RunReport> {
        let named = self.registry.resolve(selector)?;
        info!(
            "kernel {} (id {}, {}x{}, multiplier {})",
            named.name,
            named.id,
            named.kernel.size(),
            named.kernel.size(),
            named.multiplier
        );
        self.run(transport, image, &named.kernel, named.multiplier, num_workers)
    }

    /// Filter `image` with `kernel` across `num_workers` workers
    ///
    /// Setup errors (workers, image, multiplier, partition) are returned
    /// before anything is sent. After that, a failing worker is recorded in
    /// the report if the transport isolates failures and is fatal otherwise.
    pub fn run<T: Transport + ?Sized>(
        &self,
        transport: &T,
        image: &PixelGrid,
        kernel: &Kernel,
        multiplier: f32,
        num_workers: usize,
    ) -> Result<RunReport> {
        if num_workers < 1 {
            return Err(Error::Configuration("at least one worker is required".to_string()));
        }
        if num_workers > transport.num_workers() {
            return Err(Error::Configuration(format!(
                "{} workers requested, {} transport has {}",
                num_workers,
                transport.name(),
                transport.num_workers()
            )));
        }
        if image.width() == 0 || image.height() == 0 {
            return Err(Error::Configuration("image is empty".to_string()));
        }
        let multiplier = validate_multiplier(multiplier)?;

        let partitioner = BandPartitioner::new(self.config.edge_policy);
        let bands = partitioner.partition(image.height(), num_workers, kernel.radius())?;

        info!(
            "filtering {}x{} image on {} workers over {} transport ({} codec, {:?} edges)",
            image.width(),
            image.height(),
            num_workers,
            transport.name(),
            self.config.codec,
            self.config.edge_policy
        );

        let isolated = transport.isolates_failures();
        let mut output = PixelGrid::new(image.width(), image.height());
        let mut failures = Vec::new();
        let mut dispatched = Vec::with_capacity(bands.len());

        let start = Instant::now();

        for band in &bands {
            let worker = band.index + 1;
            let outcome = WorkUnit::from_band(image, band, kernel, multiplier, self.config.codec)
                .and_then(|unit| transport.dispatch(worker, unit));
            match outcome {
                Ok(()) => {
                    debug!("dispatched rows {}..{} to worker {}", band.y_start, band.y_end, worker);
                    dispatched.push(band);
                }
                Err(e) if isolated => {
                    failures.push(record(worker, Stage::Dispatch, band, e));
                }
                Err(e) => return Err(e),
            }
        }

        for band in dispatched {
            let worker = band.index + 1;
            match collect_band(transport, worker, band, image.width(), &mut output) {
                Ok(()) => debug!(
                    "collected rows {}..{} from worker {}",
                    band.y_start, band.y_end, worker
                ),
                Err(e) if isolated => {
                    failures.push(record(worker, Stage::Collect, band, e));
                }
                Err(e) => return Err(e),
            }
        }

        let elapsed = start.elapsed();
        failures.sort_by_key(|f| f.worker);

        if failures.is_empty() {
            info!("run finished in {} ms", elapsed.as_millis());
        } else {
            warn!(
                "run finished in {} ms with {} of {} bands missing",
                elapsed.as_millis(),
                failures.len(),
                bands.len()
            );
        }

        Ok(RunReport {
            output,
            elapsed,
            failures,
        })
    }
}

fn collect_band<T: Transport + ?Sized>(
    transport: &T,
    worker: WorkerId,
    band: &Band,
    width: usize,
    output: &mut PixelGrid,
) -> Result<()> {
    let result = transport.collect(worker)?;
    let expected = BandGeometry::from_band(band, width)?;
    if result.geometry != expected {
        return Err(Error::Protocol(format!(
            "worker {} echoed rows {}..{}, expected {}..{}",
            worker, result.geometry.y_start, result.geometry.y_end, expected.y_start, expected.y_end
        )));
    }
    let filtered = result.decode()?;
    output.write_rows(band.y_start, &filtered)
}

fn record(worker: WorkerId, stage: Stage, band: &Band, error: Error) -> WorkerFailure {
    error!(
        "worker {} failed during {}: {}; rows {}..{} left empty",
        worker, stage, error, band.y_start, band.y_end
    );
    WorkerFailure {
        worker,
        stage,
        rows: band.logical_rows(),
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Codec;
    use crate::config::{ChannelConfig, GroupConfig, PeerConfig};
    use crate::convolve;
    use crate::partition::EdgePolicy;
    use crate::transport::group::GroupTransport;
    use crate::transport::peer::{PeerTransport, PeerWorker, PeerWorkerHandle};
    use crate::worker::WorkerConfig;
    use std::net::TcpListener;
    use std::thread;

    fn image(width: usize, height: usize) -> PixelGrid {
        PixelGrid::from_fn(width, height, |x, y| {
            [(x * 7 + y) as u8, (y * 11) as u8, ((x ^ y) * 5) as u8]
        })
    }

    fn peers(count: usize) -> Vec<PeerWorkerHandle> {
        (0..count)
            .map(|_| {
                PeerWorker::bind(
                    "127.0.0.1:0".parse().unwrap(),
                    WorkerConfig::new(),
                    Duration::from_secs(5),
                )
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_group_run_matches_single_worker() {
        let coordinator = Coordinator::new(
            CoordinatorConfig::new().with_codec(Codec::Raw),
            KernelRegistry::builtin(),
        );
        let transport = GroupTransport::launch(GroupConfig::new().with_num_workers(5)).unwrap();
        let input = image(23, 17);

        let single = coordinator.run_named(&transport, &input, "sharpen", 1).unwrap();
        let spread = coordinator.run_named(&transport, &input, "sharpen", 5).unwrap();

        assert!(single.is_complete());
        assert!(spread.is_complete());
        assert_eq!(single.output, spread.output);

        let sharpen = coordinator.registry().resolve("sharpen").unwrap();
        let reference = convolve::apply(&input, &sharpen.kernel, sharpen.multiplier).unwrap();
        assert_eq!(spread.output, reference);
    }

    #[test]
    fn test_peer_run_matches_single_worker() {
        let workers = peers(3);
        let transport =
            PeerTransport::new(PeerConfig::new(workers.iter().map(|w| w.local_addr()).collect()))
                .unwrap();
        let coordinator = Coordinator::default();
        let input = image(16, 20);

        let single = coordinator.run_named(&transport, &input, "emboss", 1).unwrap();
        let spread = coordinator.run_named(&transport, &input, "emboss", 3).unwrap();
        assert_eq!(single.output, spread.output);
    }

    #[test]
    fn test_sharpen_scenario() {
        let transport = GroupTransport::launch(GroupConfig::new().with_num_workers(4)).unwrap();
        let coordinator = Coordinator::default();
        let input = image(612, 408);

        let report = coordinator.run_named(&transport, &input, "sharpen", 4).unwrap();
        assert_eq!(report.output.width(), 612);
        assert_eq!(report.output.height(), 408);
        assert!(report.is_complete());
        assert!(report.elapsed >= Duration::ZERO);
    }

    #[test]
    fn test_clamped_edges_differ_only_at_image_border() {
        let input = image(12, 12);
        let transport = GroupTransport::launch(GroupConfig::new().with_num_workers(3)).unwrap();
        let clamp = Coordinator::new(
            CoordinatorConfig::new().with_edge_policy(EdgePolicy::Clamp),
            KernelRegistry::builtin(),
        );

        let one = clamp.run_named(&transport, &input, "blur", 1).unwrap().output;
        let three = clamp.run_named(&transport, &input, "blur", 3).unwrap().output;
        // Band seams at rows 4 and 8 see true neighbours; rows 0 and 11 do not
        assert_eq!(one.rows(1..11).unwrap(), three.rows(1..11).unwrap());
        assert_ne!(one.rows(0..1).unwrap(), three.rows(0..1).unwrap());
    }

    #[test]
    fn test_dead_peer_leaves_gap() {
        let live = peers(1);
        let dead = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let config = PeerConfig::new(vec![live[0].local_addr(), dead])
            .with_connect_timeout(Duration::from_millis(200))
            .with_max_retries(0);
        let transport = PeerTransport::new(config).unwrap();

        let input = PixelGrid::filled(8, 10, [200, 100, 50]);
        let report = Coordinator::default()
            .run_named(&transport, &input, "blur", 2)
            .unwrap();

        assert!(!report.is_complete());
        assert_eq!(report.failures.len(), 1);
        let failure = &report.failures[0];
        assert_eq!(failure.worker, 2);
        assert_eq!(failure.rows, 5..10);
        assert_eq!(report.output.get(3, 2), [200, 100, 50]);
        assert_eq!(report.output.get(3, 7), [0, 0, 0]);
    }

    #[test]
    fn test_rerun_after_timeout_uses_fresh_results() {
        let config = GroupConfig::new()
            .with_num_workers(1)
            .with_channel(
                ChannelConfig::new()
                    .with_bounded(false)
                    .with_timeout(Duration::from_millis(5)),
            );
        let transport = GroupTransport::launch(config).unwrap();
        let coordinator = Coordinator::new(
            CoordinatorConfig::new().with_codec(Codec::Raw),
            KernelRegistry::builtin(),
        );

        let first = coordinator.run_named(&transport, &image(1500, 1500), "edge_detection", 1);
        assert!(matches!(first, Err(Error::Timeout { worker: 1, stage: Stage::Collect })));

        let input = image(9, 7);
        let sharpen = coordinator.registry().resolve("sharpen").unwrap();
        let expected = convolve::apply(&input, &sharpen.kernel, sharpen.multiplier).unwrap();

        // Retry until the rank has finished the abandoned unit
        let mut rerun = None;
        for _ in 0..1000 {
            match coordinator.run_named(&transport, &input, "sharpen", 1) {
                Ok(report) => {
                    rerun = Some(report);
                    break;
                }
                Err(_) => thread::sleep(Duration::from_millis(20)),
            }
        }
        assert_eq!(rerun.unwrap().output, expected);
    }

    #[test]
    fn test_setup_errors_before_dispatch() {
        let transport = GroupTransport::launch(GroupConfig::new().with_num_workers(4)).unwrap();
        let coordinator = Coordinator::default();

        assert!(matches!(
            coordinator.run_named(&transport, &image(5, 3), "blur", 4),
            Err(Error::InvalidPartition(_))
        ));
        assert!(matches!(
            coordinator.run_named(&transport, &image(5, 3), "blur", 0),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            coordinator.run_named(&transport, &image(5, 8), "blur", 5),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            coordinator.run_named(&transport, &image(5, 8), "no-such-kernel", 2),
            Err(Error::Configuration(_))
        ));

        // Nothing was sent, so the ranks still serve a valid run
        let report = coordinator.run_named(&transport, &image(5, 8), "blur", 4).unwrap();
        assert!(report.is_complete());
    }
}
