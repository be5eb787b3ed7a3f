//! Buffers and kernels of the host device

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::backend::device::{AccessMode, LaunchConfig};
use crate::error::ForgeResult;
use crate::memory::AlignedRegion;

/// Where a host buffer's bytes live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    /// The caller's memory, used in place
    CallerMemory,
    /// Driver-owned copy of caller memory the driver refused to use in place
    PrivateCopy,
    /// Driver-allocated, host visible
    HostVisible,
    /// Driver-allocated, only reachable through transfers or staging maps
    DeviceLocal,
}

/// Backing bytes shared between a buffer handle and queued commands
pub(crate) struct Storage {
    ptr: NonNull<u8>,
    len: usize,
    kind: StorageKind,
    /// Keeps driver-owned memory alive; `None` for caller memory
    _owned: Option<AlignedRegion>,
}

// SAFETY: Storage is a pointer plus a length. Access to the bytes is
// serialized by the queue (one command at a time) and by the mapping
// discipline enforced above the device.
unsafe impl Send for Storage {}
unsafe impl Sync for Storage {}

impl Storage {
    /// # Safety
    /// `ptr..ptr+len` must stay valid until every clone of the returned Arc
    /// is dropped.
    pub(crate) unsafe fn caller_memory(ptr: NonNull<u8>, len: usize) -> Self {
        Self {
            ptr,
            len,
            kind: StorageKind::CallerMemory,
            _owned: None,
        }
    }

    pub(crate) fn owned(region: AlignedRegion, kind: StorageKind) -> Self {
        let ptr = region.base_ptr();
        let len = region.len();
        Self {
            ptr,
            len,
            kind,
            _owned: Some(region),
        }
    }

    pub(crate) fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn kind(&self) -> StorageKind {
        self.kind
    }

    /// # Safety
    /// No other reference into this storage may be live for `'a`.
    pub(crate) unsafe fn bytes_mut<'a>(&self) -> &'a mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)
    }
}

/// Buffer handle of [`super::HostDevice`]
pub struct HostBuffer {
    pub(crate) id: u64,
    pub(crate) storage: Arc<Storage>,
    pub(crate) access: AccessMode,
}

impl HostBuffer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> usize {
        self.storage.len()
    }

    pub fn access(&self) -> AccessMode {
        self.access
    }

    pub fn storage_kind(&self) -> StorageKind {
        self.storage.kind()
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("id", &self.id)
            .field("size", &self.storage.len())
            .field("kind", &self.storage.kind())
            .field("access", &self.access)
            .finish()
    }
}

/// Kernel body: receives the launch and one byte slice per buffer argument
pub type HostKernelFn = dyn Fn(&LaunchConfig, &mut [&mut [u8]]) -> ForgeResult<()> + Send + Sync;

/// Kernel executed on the host device's queue worker
#[derive(Clone)]
pub struct HostKernel {
    name: String,
    func: Arc<HostKernelFn>,
}

impl HostKernel {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&LaunchConfig, &mut [&mut [u8]]) -> ForgeResult<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn func(&self) -> Arc<HostKernelFn> {
        Arc::clone(&self.func)
    }
}

impl fmt::Debug for HostKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostKernel").field("name", &self.name).finish()
    }
}
