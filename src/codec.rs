//! Image codec for band payloads
//!
//! Bands travel as encoded byte buffers. `Raw` and `Png` are lossless;
//! `Jpeg` is lossy and only guarantees decoded channels close to the input
//! (smooth regions stay within a few levels, sharp edges may ring).

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, ImageFormat};

#[cfg(feature = "serialization")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::grid::PixelGrid;

/// Default JPEG quality
pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// Encoding used for band payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub enum Codec {
    /// Width, height and interleaved RGB bytes
    Raw,

    /// PNG, lossless
    #[default]
    Png,

    /// JPEG at the given quality (1..=100), lossy
    Jpeg {
        /// Encoder quality
        quality: u8,
    },
}

impl Codec {
    /// Numeric id carried on the wire
    pub fn id(&self) -> u8 {
        match self {
            Codec::Raw => 0,
            Codec::Png => 1,
            Codec::Jpeg { .. } => 2,
        }
    }

    /// Extra parameter carried next to the id
    pub fn param(&self) -> u8 {
        match self {
            Codec::Jpeg { quality } => *quality,
            _ => 0,
        }
    }

    /// Rebuild a codec from its wire id and parameter
    pub fn from_wire(id: u8, param: u8) -> Result<Self> {
        match id {
            0 => Ok(Codec::Raw),
            1 => Ok(Codec::Png),
            2 => Ok(Codec::Jpeg {
                quality: param.clamp(1, 100),
            }),
            other => Err(Error::Codec(format!("unknown codec id {}", other))),
        }
    }

    /// Whether `decode(encode(grid)) == grid` holds exactly
    pub fn is_lossless(&self) -> bool {
        !matches!(self, Codec::Jpeg { .. })
    }

    /// Serialize a grid
    pub fn encode(&self, grid: &PixelGrid) -> Result<Vec<u8>> {
        let (w, h) = dimensions(grid)?;
        match self {
            Codec::Raw => {
                let mut buf = Vec::with_capacity(8 + grid.as_bytes().len());
                buf.put_u32(w);
                buf.put_u32(h);
                buf.put_slice(grid.as_bytes());
                Ok(buf)
            }
            Codec::Png => {
                let mut buf = Vec::new();
                PngEncoder::new(&mut buf).write_image(
                    grid.as_bytes(),
                    w,
                    h,
                    ExtendedColorType::Rgb8,
                )?;
                Ok(buf)
            }
            Codec::Jpeg { quality } => {
                let mut buf = Vec::new();
                JpegEncoder::new_with_quality(&mut buf, (*quality).clamp(1, 100))
                    .write_image(grid.as_bytes(), w, h, ExtendedColorType::Rgb8)?;
                Ok(buf)
            }
        }
    }

    /// Deserialize a grid
    pub fn decode(&self, bytes: &[u8]) -> Result<PixelGrid> {
        match self {
            Codec::Raw => {
                let mut cursor = bytes;
                if cursor.remaining() < 8 {
                    return Err(Error::Codec(format!(
                        "raw payload of {} bytes is shorter than its header",
                        bytes.len()
                    )));
                }
                let w = cursor.get_u32() as usize;
                let h = cursor.get_u32() as usize;
                PixelGrid::from_raw(w, h, cursor.to_vec())
            }
            Codec::Png => decode_with(bytes, ImageFormat::Png),
            Codec::Jpeg { .. } => decode_with(bytes, ImageFormat::Jpeg),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Codec::Raw => f.write_str("raw"),
            Codec::Png => f.write_str("png"),
            Codec::Jpeg { quality } => write!(f, "jpeg:{}", quality),
        }
    }
}

impl FromStr for Codec {
    type Err = Error;

    /// Accepts `raw`, `png`, `jpeg` and `jpeg:<quality>`
    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_lowercase();
        let (name, quality) = match lower.split_once(':') {
            Some((name, q)) => {
                let q = q
                    .parse::<u8>()
                    .ok()
                    .filter(|q| (1..=100).contains(q))
                    .ok_or_else(|| Error::Configuration(format!("invalid jpeg quality {:?}", q)))?;
                (name.to_string(), Some(q))
            }
            None => (lower, None),
        };
        match (name.as_str(), quality) {
            ("raw", None) => Ok(Codec::Raw),
            ("png", None) => Ok(Codec::Png),
            ("jpeg" | "jpg", q) => Ok(Codec::Jpeg {
                quality: q.unwrap_or(DEFAULT_JPEG_QUALITY),
            }),
            _ => Err(Error::Configuration(format!(
                "unknown codec {:?}; use raw, png or jpeg[:quality]",
                s
            ))),
        }
    }
}

fn dimensions(grid: &PixelGrid) -> Result<(u32, u32)> {
    let w = u32::try_from(grid.width())
        .map_err(|_| Error::Codec(format!("width {} too large", grid.width())))?;
    let h = u32::try_from(grid.height())
        .map_err(|_| Error::Codec(format!("height {} too large", grid.height())))?;
    Ok((w, h))
}

fn decode_with(bytes: &[u8], format: ImageFormat) -> Result<PixelGrid> {
    let image = image::load_from_memory_with_format(bytes, format)?;
    Ok(PixelGrid::from(image.to_rgb8()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PixelGrid {
        PixelGrid::from_fn(23, 7, |x, y| [(x * 11) as u8, (y * 37) as u8, (x ^ y) as u8])
    }

    #[test]
    fn test_lossless_codecs_roundtrip() {
        let grid = sample();
        for codec in [Codec::Raw, Codec::Png] {
            let bytes = codec.encode(&grid).unwrap();
            assert_eq!(codec.decode(&bytes).unwrap(), grid, "codec {}", codec);
        }
    }

    #[test]
    fn test_jpeg_stays_close_on_flat_color() {
        let grid = PixelGrid::filled(32, 16, [90, 160, 30]);
        let codec = Codec::Jpeg { quality: 95 };
        let decoded = codec.decode(&codec.encode(&grid).unwrap()).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 16));
        let max_err = grid
            .as_bytes()
            .iter()
            .zip(decoded.as_bytes())
            .map(|(a, b)| a.abs_diff(*b))
            .max()
            .unwrap();
        assert!(max_err <= 6, "jpeg error {}", max_err);
    }

    #[test]
    fn test_corrupt_bytes_are_codec_errors() {
        assert!(matches!(Codec::Png.decode(b"not a png"), Err(Error::Codec(_))));
        assert!(matches!(Codec::Raw.decode(&[0, 0, 0]), Err(Error::Codec(_))));
        let mut raw = Codec::Raw.encode(&sample()).unwrap();
        raw.pop();
        assert!(matches!(Codec::Raw.decode(&raw), Err(Error::Codec(_))));

        let mut huge = vec![0xff; 8];
        huge.extend_from_slice(&[0, 0, 0]);
        assert!(matches!(Codec::Raw.decode(&huge), Err(Error::Codec(_))));
    }

    #[test]
    fn test_parse_and_wire_ids() {
        assert_eq!("png".parse::<Codec>().unwrap(), Codec::Png);
        assert_eq!("JPEG:70".parse::<Codec>().unwrap(), Codec::Jpeg { quality: 70 });
        assert_eq!("jpg".parse::<Codec>().unwrap(), Codec::Jpeg { quality: DEFAULT_JPEG_QUALITY });
        assert!("jpeg:0".parse::<Codec>().is_err());
        assert!("gif".parse::<Codec>().is_err());

        let codec = Codec::Jpeg { quality: 42 };
        assert_eq!(Codec::from_wire(codec.id(), codec.param()).unwrap(), codec);
        assert!(Codec::from_wire(9, 0).is_err());
    }
}
