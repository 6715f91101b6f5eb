//! Framing for the peer transport
//!
//! One frame per direction per connection:
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │ Magic: "DCNV" (4 bytes)              │
//! │ Version: u16                         │
//! │ Kind: u16 (work / result / failure)  │
//! │ Body length: u32                     │
//! ├──────────────────────────────────────┤
//! │ Body                                 │
//! └──────────────────────────────────────┘
//! ```
//!
//! Work body: `y_start, y_end, width, band_height, overlap_top,
//! overlap_bottom, kernel_size` (u32), `kernel_size²` weights and the
//! multiplier (f32), codec id and parameter (u8), then the length-prefixed
//! encoded window. Result body: the same six geometry integers, the codec,
//! then the length-prefixed encoded band. Failure body: a UTF-8 message.
//! All integers are big-endian.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::kernel::Kernel;
use crate::unit::{BandGeometry, ResultUnit, WorkUnit};

/// Protocol magic bytes
pub const MAGIC: [u8; 4] = *b"DCNV";

/// Protocol version
pub const VERSION: u16 = 1;

/// Largest body accepted from the network
pub const MAX_BODY_LEN: usize = 512 * 1024 * 1024;

const HEADER_LEN: usize = 4 + 2 + 2 + 4;

/// Frame kinds
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Coordinator to worker
    Work = 1,
    /// Worker to coordinator, success
    Result = 2,
    /// Worker to coordinator, the unit could not be processed
    Failure = 3,
}

impl TryFrom<u16> for FrameKind {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            1 => Ok(FrameKind::Work),
            2 => Ok(FrameKind::Result),
            3 => Ok(FrameKind::Failure),
            other => Err(Error::Protocol(format!("unknown frame kind {}", other))),
        }
    }
}

/// A decoded frame header and its body
#[derive(Debug, Clone)]
pub struct Frame {
    /// What the body holds
    pub kind: FrameKind,
    /// Raw body bytes
    pub body: Bytes,
}

/// Write one frame
pub fn write_frame<W: Write>(writer: &mut W, kind: FrameKind, body: &[u8]) -> Result<()> {
    if body.len() > MAX_BODY_LEN {
        return Err(Error::Protocol(format!("frame body of {} bytes too large", body.len())));
    }
    let mut header = BytesMut::with_capacity(HEADER_LEN);
    header.put_slice(&MAGIC);
    header.put_u16(VERSION);
    header.put_u16(kind as u16);
    header.put_u32(body.len() as u32);
    writer.write_all(&header)?;
    writer.write_all(body)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Frame> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header)?;
    let mut cursor = &header[..];

    let mut magic = [0u8; 4];
    cursor.copy_to_slice(&mut magic);
    if magic != MAGIC {
        return Err(Error::Protocol(format!("invalid magic: {:?}", magic)));
    }
    let version = cursor.get_u16();
    if version != VERSION {
        return Err(Error::Protocol(format!("unsupported version: {}", version)));
    }
    let kind = FrameKind::try_from(cursor.get_u16())?;
    let len = cursor.get_u32() as usize;
    if len > MAX_BODY_LEN {
        return Err(Error::Protocol(format!("frame body of {} bytes too large", len)));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(Frame {
        kind,
        body: Bytes::from(body),
    })
}

/// Encode the body of a work frame
pub fn encode_work(unit: &WorkUnit) -> Result<Vec<u8>> {
    let weights = unit.kernel.weights();
    let mut buf = BytesMut::with_capacity(64 + weights.len() * 4 + unit.payload.len());
    put_geometry(&mut buf, &unit.geometry);
    buf.put_u32(unit.kernel.size() as u32);
    for w in weights {
        buf.put_f32(*w);
    }
    buf.put_f32(unit.multiplier);
    put_codec_and_payload(&mut buf, unit.codec, &unit.payload)?;
    Ok(buf.to_vec())
}

/// Decode the body of a work frame
pub fn decode_work(mut body: Bytes) -> Result<WorkUnit> {
    let geometry = get_geometry(&mut body)?;
    need(&body, 4, "kernel size")?;
    let size = body.get_u32() as usize;
    let count = size
        .checked_mul(size)
        .filter(|n| *n <= body.remaining() / 4)
        .ok_or_else(|| Error::Protocol(format!("kernel size {} exceeds frame", size)))?;
    let weights = (0..count).map(|_| body.get_f32()).collect();
    need(&body, 4, "multiplier")?;
    let multiplier = body.get_f32();
    let (codec, payload) = get_codec_and_payload(&mut body)?;
    expect_end(&body)?;

    Ok(WorkUnit {
        geometry,
        kernel: Kernel::from_flat(size, weights)?,
        multiplier,
        codec,
        payload,
    })
}

/// Encode the body of a result frame
pub fn encode_result(result: &ResultUnit) -> Result<Vec<u8>> {
    let mut buf = BytesMut::with_capacity(40 + result.payload.len());
    put_geometry(&mut buf, &result.geometry);
    put_codec_and_payload(&mut buf, result.codec, &result.payload)?;
    Ok(buf.to_vec())
}

/// Decode the body of a result frame
pub fn decode_result(mut body: Bytes) -> Result<ResultUnit> {
    let geometry = get_geometry(&mut body)?;
    let (codec, payload) = get_codec_and_payload(&mut body)?;
    expect_end(&body)?;
    Ok(ResultUnit {
        geometry,
        codec,
        payload,
    })
}

fn put_geometry(buf: &mut BytesMut, g: &BandGeometry) {
    buf.put_u32(g.y_start);
    buf.put_u32(g.y_end);
    buf.put_u32(g.width);
    buf.put_u32(g.band_height());
    buf.put_u32(g.overlap_top);
    buf.put_u32(g.overlap_bottom);
}

fn get_geometry(body: &mut Bytes) -> Result<BandGeometry> {
    need(body, 24, "band geometry")?;
    let y_start = body.get_u32();
    let y_end = body.get_u32();
    let width = body.get_u32();
    let band_height = body.get_u32();
    let geometry = BandGeometry {
        y_start,
        y_end,
        width,
        overlap_top: body.get_u32(),
        overlap_bottom: body.get_u32(),
    };
    geometry.validate()?;
    if geometry.band_height() != band_height {
        return Err(Error::Protocol(format!(
            "band height {} disagrees with rows {}..{}",
            band_height, y_start, y_end
        )));
    }
    Ok(geometry)
}

fn put_codec_and_payload(buf: &mut BytesMut, codec: Codec, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::Codec(format!("payload of {} bytes too large", payload.len())))?;
    buf.put_u8(codec.id());
    buf.put_u8(codec.param());
    buf.put_u32(len);
    buf.put_slice(payload);
    Ok(())
}

fn get_codec_and_payload(body: &mut Bytes) -> Result<(Codec, Vec<u8>)> {
    need(body, 6, "codec and payload length")?;
    let codec = Codec::from_wire(body.get_u8(), body.get_u8())?;
    let len = body.get_u32() as usize;
    need(body, len, "payload")?;
    Ok((codec, body.split_to(len).to_vec()))
}

fn need(body: &Bytes, len: usize, what: &str) -> Result<()> {
    if body.remaining() < len {
        return Err(Error::Protocol(format!(
            "truncated frame: {} needs {} bytes, {} left",
            what,
            len,
            body.remaining()
        )));
    }
    Ok(())
}

fn expect_end(body: &Bytes) -> Result<()> {
    if body.has_remaining() {
        return Err(Error::Protocol(format!(
            "{} trailing bytes after unit",
            body.remaining()
        )));
    }
    Ok(())
}
