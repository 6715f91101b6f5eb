//! Peer transport: independently started workers behind TCP listeners
//!
//! A [`PeerWorker`] listens on a fixed address and answers one work frame
//! per connection. [`PeerTransport`] dials worker `i` at endpoint `i - 1`;
//! every dispatch runs on its own thread with socket timeouts and a bounded
//! number of retries, so a slow or dead worker only stalls its own band.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use super::wire::{self, FrameKind};
use super::{check_worker, Transport};
use crate::config::PeerConfig;
use crate::error::{Error, Result, Stage};
use crate::unit::{ResultUnit, WorkUnit};
use crate::worker::{self, WorkerConfig, WorkerId};

/// How long the accept loop sleeps when no connection is pending
const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// A worker server bound to one address
pub struct PeerWorker;

impl PeerWorker {
    /// Bind `addr` and start serving on a background thread
    pub fn bind(
        addr: SocketAddr,
        config: WorkerConfig,
        io_timeout: Duration,
    ) -> Result<PeerWorkerHandle> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let running = Arc::new(AtomicBool::new(true));
        let processed = Arc::new(AtomicU64::new(0));
        let loop_running = Arc::clone(&running);
        let loop_processed = Arc::clone(&processed);

        let thread_name = format!("peer-worker-{}", local_addr.port());
        let handle = worker::spawn_thread(&config, thread_name, move || {
            accept_loop(listener, local_addr, io_timeout, loop_running, loop_processed)
        })?;

        info!("worker listening on {}", local_addr);

        Ok(PeerWorkerHandle {
            local_addr,
            running,
            processed,
            thread_handle: Some(handle),
        })
    }
}

/// Handle for a running [`PeerWorker`]
pub struct PeerWorkerHandle {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    processed: Arc<AtomicU64>,
    thread_handle: Option<JoinHandle<Result<()>>>,
}

impl PeerWorkerHandle {
    /// Address the worker is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of units answered successfully
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Check if the worker is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Block until the accept loop ends
    pub fn wait(mut self) -> Result<()> {
        self.join()
    }

    /// Stop accepting connections and wait for the loop to end
    pub fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        self.join()
    }

    fn join(&mut self) -> Result<()> {
        match self.thread_handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| {
                    Error::WorkerPanicked(format!("worker {} panicked", self.local_addr))
                })?,
            None => Ok(()),
        }
    }
}

impl Drop for PeerWorkerHandle {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Clears the running flag when the accept loop ends, unwinding included
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn accept_loop(
    listener: TcpListener,
    local_addr: SocketAddr,
    io_timeout: Duration,
    running: Arc<AtomicBool>,
    processed: Arc<AtomicU64>,
) -> Result<()> {
    let _guard = RunningGuard(Arc::clone(&running));
    while running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => match handle_connection(stream, io_timeout, &processed) {
                Ok((y_start, y_end)) => {
                    info!(
                        "worker {}: processed rows {}..{} for {}",
                        local_addr, y_start, y_end, peer
                    );
                }
                Err(e) => warn!("worker {}: connection from {} failed: {}", local_addr, peer, e),
            },
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                error!("worker {}: accept failed: {}", local_addr, e);
                return Err(e.into());
            }
        }
    }
    debug!("worker {} stopped", local_addr);
    Ok(())
}

/// Read one work frame, answer with one result or failure frame
fn handle_connection(
    mut stream: TcpStream,
    io_timeout: Duration,
    processed: &AtomicU64,
) -> Result<(u32, u32)> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(io_timeout))?;
    stream.set_write_timeout(Some(io_timeout))?;
    stream.set_nodelay(true)?;

    let frame = wire::read_frame(&mut stream)?;
    if frame.kind != FrameKind::Work {
        let reason = format!("expected a work frame, got {:?}", frame.kind);
        wire::write_frame(&mut stream, FrameKind::Failure, reason.as_bytes())?;
        return Err(Error::Protocol(reason));
    }

    let outcome = wire::decode_work(frame.body).and_then(|unit| {
        let rows = (unit.geometry.y_start, unit.geometry.y_end);
        worker::serve(unit).map(|result| (rows, result))
    });

    match outcome {
        Ok((rows, result)) => {
            let body = wire::encode_result(&result)?;
            processed.fetch_add(1, Ordering::Relaxed);
            wire::write_frame(&mut stream, FrameKind::Result, &body)?;
            Ok(rows)
        }
        Err(e) => {
            wire::write_frame(&mut stream, FrameKind::Failure, e.to_string().as_bytes())?;
            Err(e)
        }
    }
}

struct Pending {
    dispatched_at: Instant,
    rx: flume::Receiver<Result<ResultUnit>>,
    handle: JoinHandle<()>,
}

/// Coordinator end of the peer transport
pub struct PeerTransport {
    config: Arc<PeerConfig>,
    pending: Mutex<HashMap<WorkerId, Pending>>,
}

impl PeerTransport {
    /// Create a transport for the configured endpoints
    pub fn new(config: PeerConfig) -> Result<Self> {
        if config.endpoints.is_empty() {
            return Err(Error::Configuration(
                "peer transport needs at least one worker endpoint".to_string(),
            ));
        }
        Ok(Self {
            config: Arc::new(config),
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Endpoint of a worker
    pub fn endpoint(&self, worker: WorkerId) -> Result<SocketAddr> {
        check_worker(worker, self.config.endpoints.len())?;
        Ok(self.config.endpoints[worker - 1])
    }
}

impl Transport for PeerTransport {
    fn name(&self) -> &'static str {
        "peer"
    }

    fn num_workers(&self) -> usize {
        self.config.endpoints.len()
    }

    fn dispatch(&self, worker: WorkerId, unit: WorkUnit) -> Result<()> {
        let addr = self.endpoint(worker)?;
        let body = wire::encode_work(&unit)?;
        let config = Arc::clone(&self.config);
        let (tx, rx) = flume::bounded(1);

        let handle = thread::Builder::new()
            .name(format!("peer-dispatch-{}", worker))
            .spawn(move || {
                let result = exchange_with_retry(worker, addr, &body, &config);
                let _ = tx.send(result);
            })
            .map_err(|e| {
                Error::transport(worker, Stage::Dispatch, format!("cannot spawn task: {}", e))
            })?;

        debug!(
            "dispatched rows {}..{} to worker {} at {}",
            unit.geometry.y_start, unit.geometry.y_end, worker, addr
        );

        let previous = self.pending.lock().insert(
            worker,
            Pending {
                dispatched_at: Instant::now(),
                rx,
                handle,
            },
        );
        if previous.is_some() {
            warn!("worker {} had an uncollected unit; it was discarded", worker);
        }
        Ok(())
    }

    fn collect(&self, worker: WorkerId) -> Result<ResultUnit> {
        check_worker(worker, self.num_workers())?;
        let pending = self
            .pending
            .lock()
            .remove(&worker)
            .ok_or_else(|| Error::transport(worker, Stage::Collect, "no unit was dispatched"))?;

        let remaining = self
            .config
            .collect_timeout
            .saturating_sub(pending.dispatched_at.elapsed());

        match pending.rx.recv_timeout(remaining) {
            Ok(result) => {
                let _ = pending.handle.join();
                result
            }
            // The dispatch thread is left to finish on its own socket timeout.
            Err(flume::RecvTimeoutError::Timeout) => Err(Error::Timeout {
                worker,
                stage: Stage::Collect,
            }),
            Err(flume::RecvTimeoutError::Disconnected) => Err(Error::WorkerPanicked(format!(
                "dispatch task for worker {} ended without a result",
                worker
            ))),
        }
    }

    fn isolates_failures(&self) -> bool {
        true
    }

    fn shutdown(&self) -> Result<()> {
        let abandoned = self.pending.lock().drain().count();
        if abandoned > 0 {
            warn!("dropping {} uncollected units", abandoned);
        }
        Ok(())
    }
}

fn exchange_with_retry(
    worker: WorkerId,
    addr: SocketAddr,
    body: &[u8],
    config: &PeerConfig,
) -> Result<ResultUnit> {
    let mut attempt = 0;
    loop {
        match exchange(worker, addr, body, config) {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                attempt += 1;
                warn!(
                    "worker {} at {}: {} (retry {}/{})",
                    worker, addr, e, attempt, config.max_retries
                );
                thread::sleep(config.retry_backoff);
            }
            Err(e) => return Err(e),
        }
    }
}

/// One connection: write the work frame, read the reply
fn exchange(
    worker: WorkerId,
    addr: SocketAddr,
    body: &[u8],
    config: &PeerConfig,
) -> Result<ResultUnit> {
    let mut stream = TcpStream::connect_timeout(&addr, config.connect_timeout)
        .map_err(|e| socket_error(worker, Stage::Dispatch, e))?;
    stream
        .set_read_timeout(Some(config.io_timeout))
        .and_then(|_| stream.set_write_timeout(Some(config.io_timeout)))
        .and_then(|_| stream.set_nodelay(true))
        .map_err(|e| socket_error(worker, Stage::Dispatch, e))?;

    wire::write_frame(&mut stream, FrameKind::Work, body)
        .map_err(|e| frame_error(worker, Stage::Dispatch, e))?;
    let frame = wire::read_frame(&mut stream).map_err(|e| frame_error(worker, Stage::Collect, e))?;

    match frame.kind {
        FrameKind::Result => wire::decode_result(frame.body),
        FrameKind::Failure => Err(Error::Remote {
            worker,
            reason: String::from_utf8_lossy(&frame.body).into_owned(),
        }),
        FrameKind::Work => Err(Error::Protocol(format!(
            "worker {} answered with a work frame",
            worker
        ))),
    }
}

fn socket_error(worker: WorkerId, stage: Stage, err: std::io::Error) -> Error {
    match err.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => Error::Timeout { worker, stage },
        _ => Error::transport(worker, stage, err.to_string()),
    }
}

fn frame_error(worker: WorkerId, stage: Stage, err: Error) -> Error {
    match err {
        Error::Io(io) => socket_error(worker, stage, io),
        other => other,
    }
}
