//! Host/device mirrored matrices.
//!
//! [`MirroredMatrix`] keeps a dense row-major matrix on the host and in two
//! device buffers. New versions are written into the back buffer and become
//! visible to readers only through [`MirroredMatrix::publish`], which requires
//! exclusive access, so a reader can never observe a half-written version.
//!
//! [`CountMatrix`] is the device-resident counter matrix that many token
//! updates increment concurrently.

use std::sync::atomic::{AtomicU32, Ordering};

use rayon::prelude::*;

use crate::device::{DeviceContext, DeviceRepr, DeviceSlice};
use crate::error::Result;

pub struct MirroredMatrix<T> {
    rows: usize,
    cols: usize,
    host: Vec<T>,
    device: [DeviceSlice<T>; 2],
    front: usize,
    version: u64,
}

impl<T: DeviceRepr + Copy> MirroredMatrix<T> {
    /// Allocate a zeroed `rows × cols` matrix on host and device.
    pub fn new(
        ctx: &DeviceContext,
        rows: usize,
        cols: usize,
        resource: &'static str,
    ) -> Result<Self> {
        let front: DeviceSlice<T> = ctx.alloc_matrix(rows, cols, resource)?;
        let back = ctx.alloc_matrix(rows, cols, resource)?;
        let len = front.len();
        Ok(Self {
            rows,
            cols,
            host: (0..len).map(|_| T::zeroed()).collect(),
            device: [front, back],
            front: 0,
            version: 0,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Number of versions published so far.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The currently published device version.
    pub fn read(&self) -> &[T] {
        self.device[self.front].as_slice()
    }

    /// The back buffer to write the next version into, alongside the
    /// published version it will replace.
    pub fn stage(&mut self) -> (&mut [T], &[T]) {
        let [a, b] = &mut self.device;
        if self.front == 0 {
            (b.as_mut_slice(), a.as_slice())
        } else {
            (a.as_mut_slice(), b.as_slice())
        }
    }

    /// Make the staged back buffer the published version.
    pub fn publish(&mut self) {
        self.front ^= 1;
        self.version += 1;
    }

    /// Copy the published version into the host mirror.
    pub fn to_host(&mut self) -> Result<&[T]> {
        self.device[self.front].copy_to_host(&mut self.host, "matrix host mirror")?;
        Ok(&self.host)
    }

    /// The host mirror as of the last [`to_host`](Self::to_host) or write.
    pub fn host(&self) -> &[T] {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut [T] {
        &mut self.host
    }

    /// Copy the host mirror into the back buffer and publish it.
    pub fn upload(&mut self) -> Result<()> {
        let back = self.front ^ 1;
        self.device[back].copy_from_host(&self.host, "matrix device buffer")?;
        self.publish();
        Ok(())
    }
}

/// Device-resident `rows × cols` counters with race-free increments.
pub struct CountMatrix {
    rows: usize,
    cols: usize,
    cells: DeviceSlice<AtomicU32>,
}

impl CountMatrix {
    pub fn new(
        ctx: &DeviceContext,
        rows: usize,
        cols: usize,
        resource: &'static str,
    ) -> Result<Self> {
        Ok(Self {
            rows,
            cols,
            cells: ctx.alloc_matrix(rows, cols, resource)?,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn increment(&self, row: usize, col: usize) {
        self.cells.as_slice()[row * self.cols + col].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> u32 {
        self.cells.as_slice()[row * self.cols + col].load(Ordering::Relaxed)
    }

    /// Sum over all cells.
    pub fn total(&self) -> u64 {
        self.cells
            .as_slice()
            .par_iter()
            .map(|c| c.load(Ordering::Relaxed) as u64)
            .sum()
    }

    /// Per-row sums.
    pub fn row_totals(&self) -> Vec<u64> {
        if self.cols == 0 {
            return vec![0; self.rows];
        }
        self.cells
            .as_slice()
            .par_chunks(self.cols)
            .map(|row| row.iter().map(|c| c.load(Ordering::Relaxed) as u64).sum())
            .collect()
    }

    pub fn reset(&mut self) {
        self.cells
            .as_mut_slice()
            .par_iter_mut()
            .for_each(|c| *c.get_mut() = 0);
    }

    /// Device-to-host copy of the counters.
    pub fn snapshot(&self) -> Vec<u32> {
        self.cells
            .as_slice()
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }
}
