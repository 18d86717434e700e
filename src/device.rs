//! Device context, device-resident slices and the device memory ledger.
//!
//! The device is a dedicated rayon pool with its own memory arena. Device
//! slices are separate allocations from any host array and are only reachable
//! from the host through [`DeviceSlice::copy_from_host`] and
//! [`DeviceSlice::copy_to_host`]. Every allocation is charged against the
//! context's byte budget; exceeding it is an allocation failure, never a
//! silent fallback.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use log::{debug, info};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{EngineError, Result};

/// Element types that can live in device memory.
pub trait DeviceRepr: Send + Sync + Sized {
    fn zeroed() -> Self;
}

impl DeviceRepr for u32 {
    fn zeroed() -> Self {
        0
    }
}

impl DeviceRepr for f32 {
    fn zeroed() -> Self {
        0.0
    }
}

impl DeviceRepr for AtomicU32 {
    fn zeroed() -> Self {
        AtomicU32::new(0)
    }
}

/// Executor and memory settings for a device context.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceConfig {
    /// Worker threads; `None` uses one per logical core.
    pub threads: Option<usize>,
    /// Device memory budget in bytes; `None` is unbounded.
    pub memory_limit: Option<usize>,
}

impl DeviceConfig {
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }
}

#[derive(Debug)]
struct MemoryLedger {
    limit: usize,
    used: AtomicUsize,
}

impl MemoryLedger {
    fn available(&self) -> usize {
        self.limit.saturating_sub(self.used.load(Ordering::Acquire))
    }

    fn reserve(&self, bytes: usize, resource: &'static str) -> Result<()> {
        let mut used = self.used.load(Ordering::Acquire);
        loop {
            let next = used.checked_add(bytes).filter(|&n| n <= self.limit);
            let Some(next) = next else {
                return Err(EngineError::OutOfDeviceMemory {
                    resource,
                    requested: bytes,
                    available: self.limit.saturating_sub(used),
                });
            };
            match self
                .used
                .compare_exchange_weak(used, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(actual) => used = actual,
            }
        }
    }

    fn release(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::AcqRel);
    }
}

/// The accelerator: an executor for kernels plus its memory arena.
pub struct DeviceContext {
    pool: ThreadPool,
    ledger: Arc<MemoryLedger>,
}

impl DeviceContext {
    pub fn new(config: DeviceConfig) -> Result<Self> {
        let mut builder = ThreadPoolBuilder::new().thread_name(|i| format!("gplda-device-{i}"));
        if let Some(threads) = config.threads {
            builder = builder.num_threads(threads);
        }
        let pool = builder
            .build()
            .map_err(|e| EngineError::Executor(e.to_string()))?;

        let limit = config.memory_limit.unwrap_or(usize::MAX);
        info!(
            "Device ready: threads={}, memory_limit={}",
            pool.current_num_threads(),
            config
                .memory_limit
                .map_or_else(|| "unbounded".to_string(), |b| format!("{b}B"))
        );

        Ok(Self {
            pool,
            ledger: Arc::new(MemoryLedger {
                limit,
                used: AtomicUsize::new(0),
            }),
        })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Bytes currently allocated on the device.
    pub fn memory_in_use(&self) -> usize {
        self.ledger.used.load(Ordering::Acquire)
    }

    pub fn memory_available(&self) -> usize {
        self.ledger.available()
    }

    /// Allocate a zeroed `rows × cols` block. An element count that does not
    /// fit in `usize` is reported as out of memory.
    pub fn alloc_matrix<T: DeviceRepr>(
        &self,
        rows: usize,
        cols: usize,
        resource: &'static str,
    ) -> Result<DeviceSlice<T>> {
        let len = rows
            .checked_mul(cols)
            .ok_or(EngineError::OutOfDeviceMemory {
                resource,
                requested: usize::MAX,
                available: self.ledger.available(),
            })?;
        self.alloc_zeros(len, resource)
    }

    /// Allocate `len` zeroed elements on the device.
    pub fn alloc_zeros<T: DeviceRepr>(
        &self,
        len: usize,
        resource: &'static str,
    ) -> Result<DeviceSlice<T>> {
        let bytes = len
            .checked_mul(std::mem::size_of::<T>())
            .ok_or(EngineError::OutOfDeviceMemory {
                resource,
                requested: usize::MAX,
                available: self.ledger.available(),
            })?;
        self.ledger.reserve(bytes, resource)?;

        let mut data = Vec::new();
        if data.try_reserve_exact(len).is_err() {
            self.ledger.release(bytes);
            return Err(EngineError::OutOfDeviceMemory {
                resource,
                requested: bytes,
                available: self.ledger.available(),
            });
        }
        data.extend((0..len).map(|_| T::zeroed()));
        debug!("Device alloc: resource={resource}, bytes={bytes}");

        Ok(DeviceSlice {
            data,
            bytes,
            ledger: Arc::clone(&self.ledger),
        })
    }

    /// Allocate and fill from host data.
    pub fn clone_htod<T: DeviceRepr + Copy>(
        &self,
        host: &[T],
        resource: &'static str,
    ) -> Result<DeviceSlice<T>> {
        let mut slice = self.alloc_zeros(host.len(), resource)?;
        slice.copy_from_host(host, resource)?;
        Ok(slice)
    }

    /// Run a kernel on the device and wait for it.
    ///
    /// A panic anywhere inside the kernel (including rayon workers it fans out
    /// to) is trapped and reported as a device fault.
    pub fn launch<R, F>(&self, kernel: &'static str, f: F) -> Result<R>
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        panic::catch_unwind(AssertUnwindSafe(|| self.pool.install(f))).map_err(|payload| {
            EngineError::DeviceFault {
                kernel,
                message: panic_message(payload.as_ref()),
            }
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A device-resident allocation. Frees its ledger bytes on drop.
pub struct DeviceSlice<T> {
    data: Vec<T>,
    bytes: usize,
    ledger: Arc<MemoryLedger>,
}

impl<T> DeviceSlice<T> {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Kernel-side read access.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Kernel-side write access.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Immutable sub-range `[offset, offset + len)`.
    pub fn view(&self, offset: usize, len: usize) -> &[T] {
        assert!(
            offset + len <= self.data.len(),
            "view out of bounds: {}+{} > {}",
            offset,
            len,
            self.data.len()
        );
        &self.data[offset..offset + len]
    }
}

impl<T: Copy> DeviceSlice<T> {
    /// Host-to-device copy into the front of this slice.
    pub fn copy_from_host(&mut self, host: &[T], resource: &'static str) -> Result<()> {
        if host.len() > self.data.len() {
            return Err(EngineError::TransferOutOfBounds {
                resource,
                len: host.len(),
                capacity: self.data.len(),
            });
        }
        self.data[..host.len()].copy_from_slice(host);
        Ok(())
    }

    /// Device-to-host copy of the first `host.len()` elements.
    pub fn copy_to_host(&self, host: &mut [T], resource: &'static str) -> Result<()> {
        if host.len() > self.data.len() {
            return Err(EngineError::TransferOutOfBounds {
                resource,
                len: host.len(),
                capacity: self.data.len(),
            });
        }
        host.copy_from_slice(&self.data[..host.len()]);
        Ok(())
    }

    pub fn to_host_vec(&self) -> Vec<T> {
        self.data.clone()
    }
}

impl<T> Drop for DeviceSlice<T> {
    fn drop(&mut self) {
        self.ledger.release(self.bytes);
    }
}
