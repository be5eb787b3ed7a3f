//! Device interface consumed by the buffer manager
//!
//! A [`ComputeDevice`] is one device plus one in-order queue. The manager only
//! needs a handful of driver entry points: capability query, buffer creation
//! with a placement hint, kernel enqueue, blocking map/unmap, and completion
//! waits. Backends implement them; the manager owns all policy.

use std::fmt;
use std::ptr::NonNull;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ForgeError, ForgeResult};

/// Device-reported rules for sharing host memory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCaps {
    /// Human-readable device name
    pub name: String,
    /// Base address alignment (bytes) for use-host-pointer import
    pub base_alignment: usize,
    /// Size granularity (bytes) for use-host-pointer import
    pub transfer_granularity: usize,
    /// Device and host share physical memory
    pub host_unified_memory: bool,
}

impl DeviceCaps {
    /// Reject caps the manager cannot reason about
    pub fn validate(&self) -> ForgeResult<()> {
        if !self.base_alignment.is_power_of_two() {
            return Err(ForgeError::InvalidAlignment(format!(
                "device '{}' reported base alignment {}, which is not a power of two",
                self.name, self.base_alignment
            )));
        }
        if self.transfer_granularity == 0 {
            return Err(ForgeError::InvalidSize(format!(
                "device '{}' reported a zero transfer granularity",
                self.name
            )));
        }
        Ok(())
    }
}

/// How device kernels may access a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn device_reads(self) -> bool {
        matches!(self, AccessMode::ReadOnly | AccessMode::ReadWrite)
    }

    pub fn device_writes(self) -> bool {
        matches!(self, AccessMode::WriteOnly | AccessMode::ReadWrite)
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::ReadOnly => write!(f, "read-only"),
            AccessMode::WriteOnly => write!(f, "write-only"),
            AccessMode::ReadWrite => write!(f, "read-write"),
        }
    }
}

/// Direction of a host mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapAccess {
    Read,
    Write,
}

impl fmt::Display for MapAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapAccess::Read => write!(f, "read"),
            MapAccess::Write => write!(f, "write"),
        }
    }
}

/// Where a new device buffer's storage lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Device-local memory; host access goes through transfers or staging maps
    DeviceLocal,
    /// Device allocates host-visible memory
    AllocHostPtr,
    /// Device uses the caller's host memory in place (if it can)
    UseHostPtr(NonNull<u8>),
}

/// Parameters for [`ComputeDevice::create_buffer`]
#[derive(Debug, Clone, Copy)]
pub struct BufferRequest {
    pub size: usize,
    pub access: AccessMode,
    pub placement: Placement,
}

/// Work dimensions for a kernel launch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub global: [usize; 3],
    pub local: Option<[usize; 3]>,
}

impl LaunchConfig {
    /// One-dimensional launch over `n` work items
    pub fn linear(n: usize) -> Self {
        Self {
            global: [n, 1, 1],
            local: None,
        }
    }

    /// Two-dimensional launch
    pub fn grid_2d(width: usize, height: usize) -> Self {
        Self {
            global: [width, height, 1],
            local: None,
        }
    }

    pub fn with_local(mut self, local: [usize; 3]) -> Self {
        self.local = Some(local);
        self
    }

    /// Total work items across all dimensions
    pub fn work_items(&self) -> usize {
        self.global.iter().product()
    }
}

/// Completion handle for one enqueued command
///
/// Tickets on one queue are strictly increasing; a ticket is complete once
/// every command up to and including it has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueTicket(pub u64);

impl fmt::Display for QueueTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One compute device with one in-order queue
///
/// Implementations translate these calls into driver calls. All blocking
/// calls take an optional timeout and return `DeviceTimeout` when it
/// elapses.
pub trait ComputeDevice: fmt::Debug + Send + Sync {
    /// Opaque device buffer handle
    type Buffer: fmt::Debug;
    /// Compiled kernel accepted by [`ComputeDevice::enqueue_kernel`]
    type Kernel: ?Sized;

    fn caps(&self) -> &DeviceCaps;

    /// Create a buffer
    ///
    /// # Safety
    /// For [`Placement::UseHostPtr`] the pointer must be valid for reads and
    /// writes of `request.size` bytes until the returned buffer is dropped
    /// and every command that used it has completed.
    unsafe fn create_buffer(&self, request: &BufferRequest) -> ForgeResult<Self::Buffer>;

    /// Size of a buffer in bytes
    fn buffer_size(&self, buffer: &Self::Buffer) -> usize;

    /// Host address the device uses as the buffer's storage, if host visible
    fn backing_address(&self, buffer: &Self::Buffer) -> Option<usize>;

    /// Enqueue a kernel; buffers are bound in argument order
    fn enqueue_kernel(
        &self,
        kernel: &Self::Kernel,
        launch: &LaunchConfig,
        args: &[&Self::Buffer],
    ) -> ForgeResult<QueueTicket>;

    /// Block until `ticket` has completed
    fn wait(&self, ticket: QueueTicket, timeout: Option<Duration>) -> ForgeResult<()>;

    /// Block until everything enqueued so far has completed
    fn finish(&self, timeout: Option<Duration>) -> ForgeResult<()>;

    /// Non-blocking completion check
    fn is_complete(&self, ticket: QueueTicket) -> bool;

    /// Blocking map of the whole buffer for host access
    fn map_buffer(
        &self,
        buffer: &Self::Buffer,
        access: MapAccess,
        timeout: Option<Duration>,
    ) -> ForgeResult<NonNull<u8>>;

    /// Release a mapping
    ///
    /// # Safety
    /// `ptr` must come from [`ComputeDevice::map_buffer`] on the same buffer,
    /// must not have been unmapped already, and no host references into the
    /// mapping may outlive this call.
    unsafe fn unmap_buffer(&self, buffer: &Self::Buffer, ptr: NonNull<u8>) -> ForgeResult<()>;

    /// Blocking host-to-device copy
    fn write_buffer(
        &self,
        buffer: &Self::Buffer,
        offset: usize,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> ForgeResult<()>;

    /// Blocking device-to-host copy
    fn read_buffer(
        &self,
        buffer: &Self::Buffer,
        offset: usize,
        out: &mut [u8],
        timeout: Option<Duration>,
    ) -> ForgeResult<()>;
}

/// Check that `offset..offset+len` fits inside a buffer of `size` bytes
pub(crate) fn check_transfer_range(size: usize, offset: usize, len: usize) -> ForgeResult<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(ForgeError::InvalidSize(format!(
            "transfer of {} bytes at offset {} exceeds buffer of {} bytes",
            len, offset, size
        ))),
    }
}
