//! Group transport: a fixed set of ranks started together
//!
//! Rank 0 is the coordinator, ranks `1..=W` are worker threads launched in
//! one go. A work unit is sent as an ordered sequence of tagged fields:
//!
//! ```text
//! Sequence, KernelWeights, KernelSize, Width, Multiplier, Geometry, Overlap,
//! Codec, PayloadLength, Payload
//! ```
//!
//! and the reply as `ResultStatus` (status and echoed sequence) followed by
//! either `ResultError` or
//!
//! ```text
//! ResultLength, ResultPayload, ResultGeometry, ResultOverlap, ResultCodec
//! ```
//!
//! Both ends read fields in exactly the order they were written. Any fault is
//! fatal to the run, but not to the group: a rank answers a unit it could not
//! read with a failure status and waits for the next `Sequence`, and the
//! coordinator discards replies to units from an abandoned run.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use super::channel::{expect_tag, Envelope, Field, Mailbox, Tag};
use super::{check_worker, Transport};
use crate::codec::Codec;
use crate::config::GroupConfig;
use crate::error::{Error, Result, Stage};
use crate::kernel::Kernel;
use crate::unit::{BandGeometry, ResultUnit, WorkUnit};
use crate::worker::{self, WorkerId, COORDINATOR};

/// Coordinator end of a launched group
pub struct GroupTransport {
    mailboxes: Mutex<Vec<Arc<Mailbox>>>,
    ranks: Mutex<Vec<(WorkerId, JoinHandle<Result<()>>)>>,
    sequences: Vec<AtomicU32>,
    num_workers: usize,
}

impl GroupTransport {
    /// Start `config.num_workers` ranks
    ///
    /// Fails when the group would have fewer than two participants.
    pub fn launch(config: GroupConfig) -> Result<Self> {
        if config.group_size() < 2 {
            return Err(Error::Configuration(format!(
                "at least 2 participants are required (1 coordinator, 1 worker), got {}",
                config.group_size()
            )));
        }

        let mut mailboxes = Vec::with_capacity(config.num_workers);
        let mut ranks = Vec::with_capacity(config.num_workers);

        for rank in 1..=config.num_workers {
            let (coordinator_end, rank_end) = Mailbox::pair(&config.channel, COORDINATOR, rank);

            let mut worker_config = config.worker.clone();
            if config.pin_workers {
                worker_config.cpu_affinity = Some((rank - 1) % num_cpus::get().max(1));
            }

            let handle = worker::spawn_thread(&worker_config, format!("rank-{}", rank), move || {
                rank_loop(rank, rank_end)
            })?;

            mailboxes.push(Arc::new(coordinator_end));
            ranks.push((rank, handle));
        }

        info!("group transport launched with {} worker ranks", config.num_workers);

        Ok(Self {
            mailboxes: Mutex::new(mailboxes),
            ranks: Mutex::new(ranks),
            sequences: (0..config.num_workers).map(|_| AtomicU32::new(0)).collect(),
            num_workers: config.num_workers,
        })
    }

    fn with_mailbox<T>(
        &self,
        worker: WorkerId,
        stage: Stage,
        f: impl FnOnce(&Mailbox) -> Result<T>,
    ) -> Result<T> {
        check_worker(worker, self.num_workers)?;
        let mailbox = self
            .mailboxes
            .lock()
            .get(worker - 1)
            .cloned()
            .ok_or_else(|| Error::transport(worker, stage, "group has been shut down"))?;
        f(&mailbox)
    }

    /// Number the next unit for `worker`
    fn next_sequence(&self, worker: WorkerId) -> u32 {
        self.sequences[worker - 1]
            .fetch_add(1, Ordering::AcqRel)
            .wrapping_add(1)
    }

    fn last_sequence(&self, worker: WorkerId) -> u32 {
        self.sequences[worker - 1].load(Ordering::Acquire)
    }
}

impl Transport for GroupTransport {
    fn name(&self) -> &'static str {
        "group"
    }

    fn num_workers(&self) -> usize {
        self.num_workers
    }

    fn dispatch(&self, worker: WorkerId, unit: WorkUnit) -> Result<()> {
        self.with_mailbox(worker, Stage::Dispatch, |mailbox| {
            let sequence = self.next_sequence(worker);
            send_work(mailbox, sequence, &unit)?;
            debug!(
                "dispatched unit {} (rows {}..{}) to rank {}",
                sequence, unit.geometry.y_start, unit.geometry.y_end, worker
            );
            Ok(())
        })
    }

    fn collect(&self, worker: WorkerId) -> Result<ResultUnit> {
        self.with_mailbox(worker, Stage::Collect, |mailbox| {
            recv_result(mailbox, self.last_sequence(worker))
        })
    }

    fn isolates_failures(&self) -> bool {
        false
    }

    fn shutdown(&self) -> Result<()> {
        // Hanging up every mailbox ends the rank loops.
        for mailbox in self.mailboxes.lock().drain(..) {
            debug!("mailbox to rank {}: {}", mailbox.peer(), mailbox.stats());
        }

        let mut first_error = None;
        for (rank, handle) in self.ranks.lock().drain(..) {
            let outcome = handle
                .join()
                .map_err(|_| Error::WorkerPanicked(format!("rank {} panicked", rank)))
                .and_then(|r| r);
            if let Err(e) = outcome {
                error!("rank {} ended with error: {}", rank, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for GroupTransport {
    fn drop(&mut self) {
        // Best effort to stop all ranks
        let _ = self.shutdown();
    }
}

/// Serve units until the coordinator hangs up
fn rank_loop(rank: WorkerId, mailbox: Mailbox) -> Result<()> {
    debug!("rank {} started", rank);
    let mut served = 0u64;

    while let Some(envelope) = mailbox.recv_next() {
        // Leftovers of a unit that was already answered
        let sequence = match unit_sequence(envelope) {
            Ok(sequence) => sequence,
            Err(e) => {
                debug!("rank {} skipping message: {}", rank, e);
                continue;
            }
        };

        let outcome = recv_work(&mailbox).and_then(|unit| {
            let rows = (unit.geometry.y_start, unit.geometry.y_end);
            worker::serve(unit).map(|result| (rows, result))
        });

        let reply = match &outcome {
            Ok((_, result)) => send_result(&mailbox, sequence, result),
            Err(e) => {
                error!("rank {} failed on unit {}: {}", rank, sequence, e);
                send_failure(&mailbox, sequence, e)
            }
        };
        match reply {
            Ok(()) => {}
            Err(Error::Transport { .. }) => break,
            Err(e) => {
                warn!("rank {} could not answer unit {}: {}", rank, sequence, e);
                continue;
            }
        }

        if let Ok(((y_start, y_end), _)) = outcome {
            served += 1;
            info!("rank {}: processed rows {}..{}", rank, y_start, y_end);
        }
    }

    debug!(
        "rank {} stopping after {} units ({})",
        rank,
        served,
        mailbox.stats()
    );
    Ok(())
}

fn unit_sequence(envelope: Envelope) -> Result<u32> {
    match expect_tag(envelope, Tag::Sequence)? {
        Field::Ints(values) if values.len() == 1 => Ok(values[0]),
        other => Err(Error::Protocol(format!("malformed sequence {:?}", other))),
    }
}

fn send_work(mailbox: &Mailbox, sequence: u32, unit: &WorkUnit) -> Result<()> {
    let stage = Stage::Dispatch;
    let g = &unit.geometry;
    let weights = Field::Floats(unit.kernel.weights().to_vec());
    mailbox.send(Tag::Sequence, Field::Ints(vec![sequence]), stage)?;
    mailbox.send(Tag::KernelWeights, weights, stage)?;
    mailbox.send(Tag::KernelSize, Field::Ints(vec![unit.kernel.size() as u32]), stage)?;
    mailbox.send(Tag::Width, Field::Ints(vec![g.width]), stage)?;
    mailbox.send(Tag::Multiplier, Field::Floats(vec![unit.multiplier]), stage)?;
    mailbox.send(Tag::Geometry, Field::Ints(geometry_fields(g)), stage)?;
    mailbox.send(Tag::Overlap, Field::Ints(vec![g.overlap_top, g.overlap_bottom]), stage)?;
    mailbox.send(Tag::Codec, Field::Ints(codec_fields(unit.codec)), stage)?;
    let len = payload_len(&unit.payload)?;
    mailbox.send(Tag::PayloadLength, Field::Ints(vec![len]), stage)?;
    mailbox.send(Tag::Payload, Field::Bytes(unit.payload.clone()), stage)
}

/// Read the fields that follow a unit's `Sequence`
fn recv_work(mailbox: &Mailbox) -> Result<WorkUnit> {
    let stage = Stage::Dispatch;
    let weights = mailbox.recv_floats(Tag::KernelWeights, stage)?;
    let size = mailbox.recv_int(Tag::KernelSize, stage)? as usize;
    let width = mailbox.recv_int(Tag::Width, stage)?;
    let multiplier = match mailbox.recv_floats(Tag::Multiplier, stage)?.as_slice() {
        [m] => *m,
        other => {
            return Err(Error::Protocol(format!(
                "multiplier should be 1 float, got {}",
                other.len()
            )))
        }
    };
    let geometry = geometry_from(
        &mailbox.recv_ints(Tag::Geometry, 4, stage)?,
        &mailbox.recv_ints(Tag::Overlap, 2, stage)?,
    )?;
    if geometry.width != width {
        return Err(Error::Protocol(format!(
            "width field {} disagrees with geometry width {}",
            width, geometry.width
        )));
    }
    let codec = codec_from(&mailbox.recv_ints(Tag::Codec, 2, stage)?)?;
    let len = mailbox.recv_int(Tag::PayloadLength, stage)? as usize;
    let payload = mailbox.recv_bytes(Tag::Payload, len, stage)?;

    Ok(WorkUnit {
        geometry,
        kernel: Kernel::from_flat(size, weights)?,
        multiplier,
        codec,
        payload,
    })
}

fn send_result(mailbox: &Mailbox, sequence: u32, result: &ResultUnit) -> Result<()> {
    let stage = Stage::Collect;
    let g = &result.geometry;
    let len = payload_len(&result.payload)?;
    mailbox.send(Tag::ResultStatus, Field::Ints(vec![0, sequence]), stage)?;
    mailbox.send(Tag::ResultLength, Field::Ints(vec![len]), stage)?;
    mailbox.send(Tag::ResultPayload, Field::Bytes(result.payload.clone()), stage)?;
    mailbox.send(Tag::ResultGeometry, Field::Ints(geometry_fields(g)), stage)?;
    mailbox.send(Tag::ResultOverlap, Field::Ints(vec![g.overlap_top, g.overlap_bottom]), stage)?;
    mailbox.send(Tag::ResultCodec, Field::Ints(codec_fields(result.codec)), stage)
}

fn send_failure(mailbox: &Mailbox, sequence: u32, error: &Error) -> Result<()> {
    let stage = Stage::Collect;
    mailbox.send(Tag::ResultStatus, Field::Ints(vec![1, sequence]), stage)?;
    mailbox.send(Tag::ResultError, Field::Bytes(error.to_string().into_bytes()), stage)
}

/// Receive the reply to unit `expected`, discarding replies to earlier units
fn recv_result(mailbox: &Mailbox, expected: u32) -> Result<ResultUnit> {
    let stage = Stage::Collect;
    let status = loop {
        let envelope = mailbox.recv_envelope(stage)?;
        if envelope.tag != Tag::ResultStatus {
            debug!("discarding stale {:?} from rank {}", envelope.tag, envelope.source);
            continue;
        }
        match envelope.payload {
            Field::Ints(values) if values.len() == 2 && values[1] == expected => break values[0],
            Field::Ints(values) if values.len() == 2 => {
                warn!(
                    "discarding reply to unit {} from rank {}, waiting for unit {}",
                    values[1], envelope.source, expected
                );
            }
            other => {
                return Err(Error::Protocol(format!("malformed result status {:?}", other)))
            }
        }
    };

    if status != 0 {
        let reason = match mailbox.recv(Tag::ResultError, stage)? {
            Field::Bytes(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            other => format!("{:?}", other),
        };
        return Err(Error::Remote {
            worker: mailbox.peer(),
            reason,
        });
    }
    let len = mailbox.recv_int(Tag::ResultLength, stage)? as usize;
    let payload = mailbox.recv_bytes(Tag::ResultPayload, len, stage)?;
    let geometry = geometry_from(
        &mailbox.recv_ints(Tag::ResultGeometry, 4, stage)?,
        &mailbox.recv_ints(Tag::ResultOverlap, 2, stage)?,
    )?;
    let codec = codec_from(&mailbox.recv_ints(Tag::ResultCodec, 2, stage)?)?;
    Ok(ResultUnit {
        geometry,
        codec,
        payload,
    })
}

fn geometry_fields(g: &BandGeometry) -> Vec<u32> {
    vec![g.y_start, g.y_end, g.width, g.band_height()]
}

fn geometry_from(fields: &[u32], overlap: &[u32]) -> Result<BandGeometry> {
    let geometry = BandGeometry {
        y_start: fields[0],
        y_end: fields[1],
        width: fields[2],
        overlap_top: overlap[0],
        overlap_bottom: overlap[1],
    };
    if geometry.band_height() != fields[3] {
        return Err(Error::Protocol(format!(
            "band height {} disagrees with rows {}..{}",
            fields[3], fields[0], fields[1]
        )));
    }
    geometry.validate()?;
    Ok(geometry)
}

fn codec_fields(codec: Codec) -> Vec<u32> {
    vec![codec.id() as u32, codec.param() as u32]
}

fn codec_from(fields: &[u32]) -> Result<Codec> {
    let id = u8::try_from(fields[0])
        .map_err(|_| Error::Codec(format!("unknown codec id {}", fields[0])))?;
    Codec::from_wire(id, fields[1].min(u8::MAX as u32) as u8)
}

fn payload_len(payload: &[u8]) -> Result<u32> {
    u32::try_from(payload.len())
        .map_err(|_| Error::Codec(format!("payload of {} bytes too large", payload.len())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;
    use crate::convolve;
    use crate::grid::PixelGrid;
    use crate::kernel::KernelRegistry;
    use crate::partition::BandPartitioner;
    use std::time::Duration;

    fn image() -> PixelGrid {
        PixelGrid::from_fn(16, 10, |x, y| [(x * 15) as u8, (y * 25) as u8, ((x + y) * 7) as u8])
    }

    #[test]
    fn test_launch_requires_two_participants() {
        let result = GroupTransport::launch(GroupConfig::new().with_num_workers(0));
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_dispatch_and_collect_roundtrip() {
        let registry = KernelRegistry::builtin();
        let emboss = registry.resolve("emboss").unwrap();
        let image = image();
        let expected = convolve::apply(&image, &emboss.kernel, emboss.multiplier).unwrap();

        let transport = GroupTransport::launch(GroupConfig::new().with_num_workers(2)).unwrap();
        let bands = BandPartitioner::default().partition(10, 2, 1).unwrap();
        for band in &bands {
            let unit =
                WorkUnit::from_band(&image, band, &emboss.kernel, emboss.multiplier, Codec::Raw)
                    .unwrap();
            transport.dispatch(band.index + 1, unit).unwrap();
        }
        for band in &bands {
            let result = transport.collect(band.index + 1).unwrap();
            assert_eq!(result.geometry.y_start as usize, band.y_start);
            assert_eq!(result.decode().unwrap(), expected.rows(band.logical_rows()).unwrap());
        }
        transport.shutdown().unwrap();
    }

    #[test]
    fn test_worker_failure_is_reported() {
        let transport = GroupTransport::launch(GroupConfig::new().with_num_workers(1)).unwrap();
        let band = BandPartitioner::default().partition(10, 1, 0).unwrap()[0];
        let kernel = Kernel::from_flat(1, vec![1.0]).unwrap();
        let mut unit = WorkUnit::from_band(&image(), &band, &kernel, 1.0, Codec::Png).unwrap();
        unit.payload = b"garbage".to_vec();

        transport.dispatch(1, unit).unwrap();
        assert!(matches!(transport.collect(1), Err(Error::Remote { worker: 1, .. })));

        // The rank survives a failed unit
        let unit = WorkUnit::from_band(&image(), &band, &kernel, 1.0, Codec::Png).unwrap();
        transport.dispatch(1, unit).unwrap();
        assert_eq!(transport.collect(1).unwrap().decode().unwrap(), image());
    }

    #[test]
    fn test_collect_times_out() {
        let config = GroupConfig::new()
            .with_num_workers(1)
            .with_channel(ChannelConfig::new().with_timeout(Duration::from_millis(30)));
        let transport = GroupTransport::launch(config).unwrap();
        assert!(matches!(
            transport.collect(1),
            Err(Error::Timeout { worker: 1, stage: Stage::Collect })
        ));
    }

    #[test]
    fn test_unknown_rank_and_shutdown() {
        let transport = GroupTransport::launch(GroupConfig::new().with_num_workers(2)).unwrap();
        assert!(transport.collect(3).is_err());
        transport.shutdown().unwrap();
        assert!(matches!(
            transport.collect(1),
            Err(Error::Transport { worker: 1, .. })
        ));
    }

    #[test]
    fn test_abandoned_reply_is_discarded() {
        let registry = KernelRegistry::builtin();
        let edges = registry.resolve("edge_detection").unwrap();
        let sharpen = registry.resolve("sharpen").unwrap();
        let image = image();
        let band = BandPartitioner::default().partition(10, 1, 1).unwrap()[0];

        let transport = GroupTransport::launch(GroupConfig::new().with_num_workers(1)).unwrap();
        let abandoned =
            WorkUnit::from_band(&image, &band, &edges.kernel, edges.multiplier, Codec::Raw)
                .unwrap();
        transport.dispatch(1, abandoned).unwrap();

        let current =
            WorkUnit::from_band(&image, &band, &sharpen.kernel, sharpen.multiplier, Codec::Raw)
                .unwrap();
        transport.dispatch(1, current).unwrap();

        let expected = convolve::apply(&image, &sharpen.kernel, sharpen.multiplier).unwrap();
        assert_eq!(transport.collect(1).unwrap().decode().unwrap(), expected);
    }

    #[test]
    fn test_rank_survives_malformed_field() {
        let transport = GroupTransport::launch(GroupConfig::new().with_num_workers(1)).unwrap();
        transport
            .with_mailbox(1, Stage::Dispatch, |mailbox| {
                let sequence = Field::Ints(vec![transport.next_sequence(1)]);
                mailbox.send(Tag::Sequence, sequence, Stage::Dispatch)?;
                mailbox.send(Tag::KernelWeights, Field::Bytes(vec![1, 2, 3]), Stage::Dispatch)?;
                mailbox.send(Tag::Width, Field::Ints(vec![16]), Stage::Dispatch)
            })
            .unwrap();
        assert!(matches!(transport.collect(1), Err(Error::Remote { worker: 1, .. })));

        let band = BandPartitioner::default().partition(10, 1, 0).unwrap()[0];
        let kernel = Kernel::from_flat(1, vec![1.0]).unwrap();
        let unit = WorkUnit::from_band(&image(), &band, &kernel, 1.0, Codec::Raw).unwrap();
        transport.dispatch(1, unit).unwrap();
        assert_eq!(transport.collect(1).unwrap().decode().unwrap(), image());
        transport.shutdown().unwrap();
    }

    #[test]
    fn test_rank_survives_incomplete_unit() {
        let config = GroupConfig::new()
            .with_num_workers(1)
            .with_channel(ChannelConfig::new().with_timeout(Duration::from_millis(200)));
        let transport = GroupTransport::launch(config).unwrap();
        transport
            .with_mailbox(1, Stage::Dispatch, |mailbox| {
                let sequence = Field::Ints(vec![transport.next_sequence(1)]);
                mailbox.send(Tag::Sequence, sequence, Stage::Dispatch)?;
                mailbox.send(Tag::KernelWeights, Field::Floats(vec![1.0]), Stage::Dispatch)
            })
            .unwrap();

        // The rank gives up on the missing fields and reports the unit failed
        std::thread::sleep(Duration::from_millis(600));
        assert!(matches!(transport.collect(1), Err(Error::Remote { worker: 1, .. })));

        let band = BandPartitioner::default().partition(10, 1, 0).unwrap()[0];
        let kernel = Kernel::from_flat(1, vec![1.0]).unwrap();
        let unit = WorkUnit::from_band(&image(), &band, &kernel, 1.0, Codec::Raw).unwrap();
        transport.dispatch(1, unit).unwrap();
        assert_eq!(transport.collect(1).unwrap().decode().unwrap(), image());
    }
}
