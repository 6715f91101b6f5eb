//! Row-band partitioning
//!
//! Splits `[0, height)` into one contiguous band per worker. Heights differ by
//! at most one row: the first `height % workers` bands get the extra row.
//! Bands can be grown by overlap rows so a worker sees the real neighbors of
//! its edge rows; the logical range is kept separately so the coordinator can
//! drop the overlap when stitching.

use std::ops::Range;

#[cfg(feature = "serialization")]
use serde::{Deserialize, Serialize};

use crate::convolve::wrap;
use crate::error::{Error, Result};

/// How overlap rows are fetched at the top and bottom of the image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub enum EdgePolicy {
    /// Fetch overlap across the image edge from the opposite side, so the
    /// distributed result equals a toroidal convolution of the whole image
    #[default]
    Wrap,

    /// Clamp the fetch window to `[0, height)`; bands touching the image edge
    /// wrap within their own window instead
    Clamp,
}

/// A contiguous slice of image rows assigned to one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Band {
    /// Position of the band, 0-based, top to bottom
    pub index: usize,

    /// First logical row (inclusive)
    pub y_start: usize,

    /// Last logical row (exclusive)
    pub y_end: usize,

    /// Extra rows fetched above `y_start`
    pub overlap_top: usize,

    /// Extra rows fetched below `y_end`
    pub overlap_bottom: usize,
}

impl Band {
    /// Number of logical rows
    pub fn height(&self) -> usize {
        self.y_end - self.y_start
    }

    /// Logical rows in output coordinates
    pub fn logical_rows(&self) -> Range<usize> {
        self.y_start..self.y_end
    }

    /// Number of rows shipped to the worker, overlap included
    pub fn window_height(&self) -> usize {
        self.overlap_top + self.height() + self.overlap_bottom
    }

    /// Logical rows in window coordinates
    pub fn window_logical_rows(&self) -> Range<usize> {
        self.overlap_top..self.overlap_top + self.height()
    }

    /// Image row index for every window row, top to bottom
    pub fn fetch_rows(&self, image_height: usize) -> impl Iterator<Item = usize> {
        let first = self.y_start as isize - self.overlap_top as isize;
        (0..self.window_height()).map(move |i| wrap(first + i as isize, image_height))
    }
}

/// Splits image rows into worker bands
#[derive(Debug, Clone, Copy, Default)]
pub struct BandPartitioner {
    edge_policy: EdgePolicy,
}

impl BandPartitioner {
    /// Create a partitioner with the given edge policy
    pub fn new(edge_policy: EdgePolicy) -> Self {
        Self { edge_policy }
    }

    /// Edge policy in use
    pub fn edge_policy(&self) -> EdgePolicy {
        self.edge_policy
    }

    /// Split `height` rows among `num_workers` bands
    ///
    /// `overlap_radius` rows are added on each side of every band (0 for
    /// none). Fails if any worker would receive zero logical rows.
    pub fn partition(
        &self,
        height: usize,
        num_workers: usize,
        overlap_radius: usize,
    ) -> Result<Vec<Band>> {
        if num_workers < 1 {
            return Err(Error::InvalidPartition(
                "at least one worker is required".to_string(),
            ));
        }
        if height < num_workers {
            return Err(Error::InvalidPartition(format!(
                "{} rows cannot be split among {} workers",
                height, num_workers
            )));
        }

        let base = height / num_workers;
        let remainder = height % num_workers;
        let mut bands = Vec::with_capacity(num_workers);
        let mut y = 0;

        for index in 0..num_workers {
            let extra = usize::from(index < remainder);
            let y_start = y;
            let y_end = y_start + base + extra;
            let (overlap_top, overlap_bottom) = match self.edge_policy {
                EdgePolicy::Wrap => (overlap_radius, overlap_radius),
                EdgePolicy::Clamp => (
                    overlap_radius.min(y_start),
                    overlap_radius.min(height - y_end),
                ),
            };
            bands.push(Band {
                index,
                y_start,
                y_end,
                overlap_top,
                overlap_bottom,
            });
            y = y_end;
        }

        Ok(bands)
    }
}
