//! In-process emulated compute device
//!
//! `HostDevice` behaves like a driver for an integrated GPU: buffers may live
//! in caller memory, in driver-allocated host-visible memory, or in
//! "device-local" memory reached only through transfers and staging maps.
//! Kernels are Rust closures executed by a queue worker thread, so enqueue is
//! asynchronous and completion must be awaited exactly as with real hardware.
//!
//! The driver's zero-copy decisions are configurable through
//! [`HostDeviceOptions`], which lets tests exercise the fallback paths a real
//! driver takes silently (private copies, staging maps).

mod buffer;
pub mod kernels;
mod queue;

use std::collections::HashMap;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use buffer::{HostBuffer, HostKernel, HostKernelFn, StorageKind};

use buffer::Storage;
use queue::HostQueue;

use crate::backend::device::{
    check_transfer_range, BufferRequest, ComputeDevice, DeviceCaps, LaunchConfig, MapAccess,
    Placement, QueueTicket,
};
use crate::error::{ForgeError, ForgeResult};
use crate::memory::aligned::MIN_ALIGNMENT;
use crate::memory::{is_zero_copy_eligible, AlignedRegion};

/// Default base alignment reported by the host device
pub const DEFAULT_BASE_ALIGNMENT: usize = 4096;

/// Default transfer granularity reported by the host device
pub const DEFAULT_TRANSFER_GRANULARITY: usize = 64;

/// Behaviour of the emulated driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDeviceOptions {
    /// Capabilities the device reports
    pub caps: DeviceCaps,
    /// Use eligible caller pointers in place (otherwise always copy privately)
    pub honor_host_ptr: bool,
    /// Every map returns a staging copy instead of the buffer's storage
    pub staging_maps: bool,
    /// Simulated execution time added to every kernel
    pub kernel_latency: Option<Duration>,
}

impl Default for HostDeviceOptions {
    fn default() -> Self {
        Self {
            caps: DeviceCaps {
                name: "hostforge emulated device".to_string(),
                base_alignment: DEFAULT_BASE_ALIGNMENT,
                transfer_granularity: DEFAULT_TRANSFER_GRANULARITY,
                host_unified_memory: true,
            },
            honor_host_ptr: true,
            staging_maps: false,
            kernel_latency: None,
        }
    }
}

impl HostDeviceOptions {
    pub fn with_caps(mut self, base_alignment: usize, transfer_granularity: usize) -> Self {
        self.caps.base_alignment = base_alignment;
        self.caps.transfer_granularity = transfer_granularity;
        self
    }

    pub fn with_honor_host_ptr(mut self, honor: bool) -> Self {
        self.honor_host_ptr = honor;
        self
    }

    pub fn with_staging_maps(mut self, staging: bool) -> Self {
        self.staging_maps = staging;
        self
    }

    pub fn with_kernel_latency(mut self, latency: Duration) -> Self {
        self.kernel_latency = Some(latency);
        self
    }
}

/// Live host mapping of a buffer
struct ActiveMapping {
    buffer_id: u64,
    access: MapAccess,
    /// Staging copy handed to the host, written back on unmap for writes
    staging: Option<AlignedRegion>,
}

/// Emulated device with one in-order queue
pub struct HostDevice {
    options: HostDeviceOptions,
    queue: HostQueue,
    next_buffer_id: AtomicU64,
    /// Keyed by mapped address
    mappings: Mutex<HashMap<usize, ActiveMapping>>,
}

impl std::fmt::Debug for HostDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostDevice")
            .field("caps", &self.options.caps)
            .field("honor_host_ptr", &self.options.honor_host_ptr)
            .field("staging_maps", &self.options.staging_maps)
            .finish()
    }
}

impl HostDevice {
    /// Device with default options (4096-byte alignment, 64-byte granularity)
    pub fn new() -> ForgeResult<Self> {
        Self::with_options(HostDeviceOptions::default())
    }

    pub fn with_options(options: HostDeviceOptions) -> ForgeResult<Self> {
        options.caps.validate()?;
        let queue = HostQueue::new("hostforge")?;
        tracing::debug!(
            "HostDevice::new: '{}' alignment={} granularity={} honor_host_ptr={} staging_maps={}",
            options.caps.name,
            options.caps.base_alignment,
            options.caps.transfer_granularity,
            options.honor_host_ptr,
            options.staging_maps
        );
        Ok(Self {
            options,
            queue,
            next_buffer_id: AtomicU64::new(1),
            mappings: Mutex::new(HashMap::new()),
        })
    }

    pub fn options(&self) -> &HostDeviceOptions {
        &self.options
    }

    /// Number of mappings currently open
    pub fn open_mappings(&self) -> usize {
        self.mappings.lock().map(|m| m.len()).unwrap_or(0)
    }

    fn driver_region(&self, size: usize) -> ForgeResult<AlignedRegion> {
        let alignment = self.options.caps.base_alignment.max(MIN_ALIGNMENT);
        AlignedRegion::allocate(size, alignment)
    }

    fn needs_staging(&self, storage: &Storage) -> bool {
        self.options.staging_maps
            || matches!(storage.kind(), StorageKind::DeviceLocal | StorageKind::PrivateCopy)
    }
}

impl ComputeDevice for HostDevice {
    type Buffer = HostBuffer;
    type Kernel = HostKernel;

    fn caps(&self) -> &DeviceCaps {
        &self.options.caps
    }

    unsafe fn create_buffer(&self, request: &BufferRequest) -> ForgeResult<HostBuffer> {
        if request.size == 0 {
            return Err(ForgeError::InvalidSize(
                "device buffer size cannot be zero".to_string(),
            ));
        }

        let storage = match request.placement {
            Placement::UseHostPtr(ptr) => {
                let eligible = is_zero_copy_eligible(ptr.as_ptr() as usize, request.size, &self.options.caps);
                if eligible && self.options.honor_host_ptr {
                    Storage::caller_memory(ptr, request.size)
                } else {
                    tracing::debug!(
                        "HostDevice::create_buffer: copying host memory at {:#x} ({} bytes, eligible={})",
                        ptr.as_ptr() as usize,
                        request.size,
                        eligible
                    );
                    let region = self.driver_region(request.size)?;
                    ptr::copy_nonoverlapping(ptr.as_ptr(), region.base_ptr().as_ptr(), request.size);
                    Storage::owned(region, StorageKind::PrivateCopy)
                }
            }
            Placement::AllocHostPtr => {
                Storage::owned(self.driver_region(request.size)?, StorageKind::HostVisible)
            }
            Placement::DeviceLocal => {
                Storage::owned(self.driver_region(request.size)?, StorageKind::DeviceLocal)
            }
        };

        let id = self.next_buffer_id.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            "HostDevice::create_buffer: id={} size={} kind={:?} access={}",
            id,
            request.size,
            storage.kind(),
            request.access
        );
        Ok(HostBuffer {
            id,
            storage: Arc::new(storage),
            access: request.access,
        })
    }

    fn buffer_size(&self, buffer: &HostBuffer) -> usize {
        buffer.size()
    }

    fn backing_address(&self, buffer: &HostBuffer) -> Option<usize> {
        match buffer.storage.kind() {
            StorageKind::DeviceLocal => None,
            _ => Some(buffer.storage.ptr().as_ptr() as usize),
        }
    }

    fn enqueue_kernel(
        &self,
        kernel: &HostKernel,
        launch: &LaunchConfig,
        args: &[&HostBuffer],
    ) -> ForgeResult<QueueTicket> {
        for (i, a) in args.iter().enumerate() {
            if args[..i].iter().any(|b| b.id == a.id) {
                return Err(ForgeError::AccessViolation(format!(
                    "buffer {} passed to kernel '{}' more than once",
                    a.id,
                    kernel.name()
                )));
            }
        }

        let storages: Vec<Arc<Storage>> = args.iter().map(|b| Arc::clone(&b.storage)).collect();
        let func = kernel.func();
        let launch = *launch;
        let latency = self.options.kernel_latency;
        let name = kernel.name().to_string();

        let ticket = self.queue.submit(Box::new(move || {
            if let Some(latency) = latency {
                std::thread::sleep(latency);
            }
            // SAFETY: storages are distinct (checked above) and the queue runs
            // one command at a time; host access is excluded by the mapping
            // discipline while this command is pending.
            let mut slices: Vec<&mut [u8]> = storages.iter().map(|s| unsafe { s.bytes_mut() }).collect();
            func(&launch, &mut slices).map_err(|e| {
                ForgeError::DeviceResourceError(format!("kernel '{}' failed: {}", name, e))
            })
        }))?;

        tracing::trace!(
            "HostDevice::enqueue_kernel: '{}' over {} items as {}",
            kernel.name(),
            launch.work_items(),
            ticket
        );
        Ok(ticket)
    }

    fn wait(&self, ticket: QueueTicket, timeout: Option<Duration>) -> ForgeResult<()> {
        self.queue.wait(ticket, timeout)
    }

    fn finish(&self, timeout: Option<Duration>) -> ForgeResult<()> {
        self.queue.finish(timeout)
    }

    fn is_complete(&self, ticket: QueueTicket) -> bool {
        self.queue.is_complete(ticket)
    }

    fn map_buffer(
        &self,
        buffer: &HostBuffer,
        access: MapAccess,
        timeout: Option<Duration>,
    ) -> ForgeResult<NonNull<u8>> {
        // Blocking map: everything queued before it completes first
        self.queue.drain(timeout)?;

        let storage = &buffer.storage;
        let (ptr, staging) = if self.needs_staging(storage) {
            let region = self.driver_region(storage.len())?;
            // SAFETY: the queue is drained, so nothing writes the storage
            unsafe {
                ptr::copy_nonoverlapping(storage.ptr().as_ptr(), region.base_ptr().as_ptr(), storage.len())
            };
            (region.base_ptr(), Some(region))
        } else {
            (storage.ptr(), None)
        };

        let mut mappings = self.mappings.lock()?;
        let key = ptr.as_ptr() as usize;
        if mappings.contains_key(&key) {
            return Err(ForgeError::DeviceResourceError(format!(
                "buffer {} is already mapped at {:#x}",
                buffer.id, key
            )));
        }
        mappings.insert(
            key,
            ActiveMapping {
                buffer_id: buffer.id,
                access,
                staging,
            },
        );

        tracing::trace!(
            "HostDevice::map_buffer: buffer {} for {} at {:#x}",
            buffer.id,
            access,
            ptr.as_ptr() as usize
        );
        Ok(ptr)
    }

    unsafe fn unmap_buffer(&self, buffer: &HostBuffer, ptr: NonNull<u8>) -> ForgeResult<()> {
        let mut mappings = self.mappings.lock()?;
        let key = ptr.as_ptr() as usize;
        let mapping = match mappings.remove(&key) {
            Some(mapping) if mapping.buffer_id == buffer.id => mapping,
            other => {
                if let Some(mapping) = other {
                    mappings.insert(key, mapping);
                }
                return Err(ForgeError::DeviceResourceError(format!(
                    "{:#x} is not a mapping of buffer {}",
                    key, buffer.id
                )));
            }
        };
        drop(mappings);

        if let (Some(staging), MapAccess::Write) = (&mapping.staging, mapping.access) {
            ptr::copy_nonoverlapping(
                staging.base_ptr().as_ptr(),
                buffer.storage.ptr().as_ptr(),
                buffer.storage.len(),
            );
        }
        tracing::trace!("HostDevice::unmap_buffer: buffer {} at {:#x}", buffer.id, key);
        Ok(())
    }

    fn write_buffer(
        &self,
        buffer: &HostBuffer,
        offset: usize,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> ForgeResult<()> {
        check_transfer_range(buffer.size(), offset, data.len())?;
        self.queue.drain(timeout)?;
        // SAFETY: range checked; queue drained so no command touches the storage
        unsafe {
            ptr::copy_nonoverlapping(
                data.as_ptr(),
                buffer.storage.ptr().as_ptr().add(offset),
                data.len(),
            )
        };
        Ok(())
    }

    fn read_buffer(
        &self,
        buffer: &HostBuffer,
        offset: usize,
        out: &mut [u8],
        timeout: Option<Duration>,
    ) -> ForgeResult<()> {
        check_transfer_range(buffer.size(), offset, out.len())?;
        self.queue.drain(timeout)?;
        // SAFETY: as in write_buffer
        unsafe {
            ptr::copy_nonoverlapping(
                buffer.storage.ptr().as_ptr().add(offset),
                out.as_mut_ptr(),
                out.len(),
            )
        };
        Ok(())
    }
}
