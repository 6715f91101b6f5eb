use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{error, info};

use distconv::prelude::*;
use distconv::{PeerWorkerHandle, Stage, WorkerConfig};

/// Distributed 2D kernel convolution over row bands
#[derive(Parser, Debug)]
#[command(name = "distconv", version)]
#[command(about = "Filter an RGB image with a convolution kernel across several workers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Coordinate one run and save the filtered image
    Run(RunArgs),

    /// Serve work units as a peer worker
    Worker(WorkerArgs),

    /// List the built-in kernels
    Kernels,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Input image (PNG or JPEG)
    #[arg(short, long)]
    image: PathBuf,

    /// Kernel name or numeric id
    #[arg(short, long, default_value = "sharpen")]
    kernel: String,

    /// Number of workers
    #[arg(short, long, default_value_t = 4)]
    workers: usize,

    /// Transport backend
    #[arg(short, long, value_enum, default_value_t = Backend::Group)]
    backend: Backend,

    /// Peer worker address, repeated once per worker; local workers are
    /// started when none is given
    #[arg(long = "peer")]
    peers: Vec<SocketAddr>,

    /// Band codec: raw, png, jpeg or jpeg:QUALITY
    #[arg(long, default_value = "png")]
    codec: Codec,

    /// Rows fetched past the top and bottom image edges
    #[arg(long, value_enum, default_value_t = Edges::Wrap)]
    edges: Edges,

    /// Output image path
    #[arg(short, long, default_value = "out.png")]
    output: PathBuf,

    /// Per-worker wait for a peer result, in milliseconds
    #[arg(long, default_value_t = 30_000)]
    timeout_ms: u64,

    /// Extra attempts for a peer exchange that failed on the network
    #[arg(long, default_value_t = 2)]
    retries: u32,

    /// Pin group ranks to CPU cores
    #[arg(long)]
    pin: bool,
}

#[derive(Args, Debug)]
struct WorkerArgs {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:8082")]
    listen: SocketAddr,

    /// Socket read/write timeout, in milliseconds
    #[arg(long, default_value_t = 30_000)]
    io_timeout_ms: u64,

    /// Pin the worker thread to this core
    #[arg(long)]
    cpu: Option<usize>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Backend {
    /// In-process rank group with tagged messages
    Group,
    /// TCP peer workers
    Peer,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Edges {
    /// Continue from the opposite edge
    Wrap,
    /// Stay inside the image
    Clamp,
}

impl From<Edges> for EdgePolicy {
    fn from(edges: Edges) -> Self {
        match edges {
            Edges::Wrap => EdgePolicy::Wrap,
            Edges::Clamp => EdgePolicy::Clamp,
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Command::Run(args) => run(args),
        Command::Worker(args) => serve(args).map(|_| ExitCode::SUCCESS),
        Command::Kernels => {
            list_kernels();
            Ok(ExitCode::SUCCESS)
        }
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: RunArgs) -> Result<ExitCode> {
    let registry = KernelRegistry::builtin();
    registry
        .resolve(&args.kernel)
        .with_context(|| format!("{}: bad kernel selector", Stage::Load))?;
    let image = PixelGrid::open(&args.image)
        .with_context(|| format!("{}: bad image selector {}", Stage::Load, args.image.display()))?;

    let coordinator = Coordinator::new(
        CoordinatorConfig::new()
            .with_codec(args.codec)
            .with_edge_policy(args.edges.into()),
        registry,
    );

    // Local peers must outlive the run
    let mut local_peers: Vec<PeerWorkerHandle> = Vec::new();
    let transport: Box<dyn Transport> = match args.backend {
        Backend::Group => Box::new(GroupTransport::launch(
            GroupConfig::new()
                .with_num_workers(args.workers)
                .with_pinning(args.pin),
        )?),
        Backend::Peer => {
            let endpoints = if args.peers.is_empty() {
                for _ in 0..args.workers {
                    local_peers.push(PeerWorker::bind(
                        SocketAddr::from(([127, 0, 0, 1], 0)),
                        WorkerConfig::new(),
                        Duration::from_millis(args.timeout_ms),
                    )?);
                }
                local_peers.iter().map(|p| p.local_addr()).collect()
            } else {
                args.peers.clone()
            };
            Box::new(PeerTransport::new(
                PeerConfig::new(endpoints)
                    .with_collect_timeout(Duration::from_millis(args.timeout_ms))
                    .with_max_retries(args.retries),
            )?)
        }
    };

    let outcome = coordinator.run_named(transport.as_ref(), &image, &args.kernel, args.workers);
    if let Err(e) = transport.shutdown() {
        error!("transport shutdown failed: {}", e);
    }
    let report = outcome?;

    report
        .output
        .save(&args.output)
        .with_context(|| format!("{}: cannot write {}", Stage::Save, args.output.display()))?;
    info!("wrote {}", args.output.display());
    println!("{}", report.elapsed_millis());

    if report.is_complete() {
        return Ok(ExitCode::SUCCESS);
    }
    for failure in &report.failures {
        eprintln!(
            "worker {} failed during {} (rows {}..{}): {}",
            failure.worker, failure.stage, failure.rows.start, failure.rows.end, failure.error
        );
    }
    Ok(ExitCode::from(2))
}

fn serve(args: WorkerArgs) -> Result<()> {
    let mut config = WorkerConfig::new().with_name(args.listen.port().to_string());
    if let Some(cpu) = args.cpu {
        config = config.with_cpu_affinity(cpu);
    }
    let handle = PeerWorker::bind(args.listen, config, Duration::from_millis(args.io_timeout_ms))
        .with_context(|| format!("cannot listen on {}", args.listen))?;
    handle.wait()?;
    Ok(())
}

fn list_kernels() {
    for named in KernelRegistry::builtin().entries() {
        println!(
            "{:>2}  {:<16} {}x{}  multiplier {}",
            named.id,
            named.name,
            named.kernel.size(),
            named.kernel.size(),
            named.multiplier
        );
    }
}
