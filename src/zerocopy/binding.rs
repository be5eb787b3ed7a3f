//! Device buffers bound to host memory

use std::cell::Cell;
use std::fmt;
use std::mem::ManuallyDrop;
use std::sync::Arc;

use crate::backend::device::{AccessMode, ComputeDevice, QueueTicket};
use crate::config::ZeroCopyConfig;
use crate::error::{ForgeError, ForgeResult};
use crate::memory::AlignedRegion;
use crate::zerocopy::mapping::MapState;
use crate::zerocopy::BufferStrategy;

/// A device buffer plus the host memory (if any) it was created over
///
/// For host-allocated zero copy the binding owns the [`AlignedRegion`] and the
/// device buffer uses it in place; the region is released only after the
/// buffer is gone and no queued work references it. A binding is confined to
/// the thread that created it (its mapping state is a `Cell`).
pub struct DeviceBufferBinding<D: ComputeDevice> {
    pub(crate) device: Arc<D>,
    pub(crate) config: Arc<ZeroCopyConfig>,
    buffer: ManuallyDrop<D::Buffer>,
    region: Option<AlignedRegion>,
    size: usize,
    access: AccessMode,
    strategy: BufferStrategy,
    /// Cleared when a map reveals the device is not using `host_address`
    zero_copy: Cell<bool>,
    /// Address host and device are expected to share
    host_address: Option<usize>,
    pub(crate) map_state: Cell<MapState>,
    /// Last enqueued command reading or writing this buffer
    pub(crate) last_use: Cell<Option<QueueTicket>>,
    /// Last enqueued command writing this buffer
    pub(crate) last_write: Cell<Option<QueueTicket>>,
    /// Failed write whose output the host must not read
    pub(crate) failed_write: Cell<Option<QueueTicket>>,
}

pub(crate) struct BindingParts<D: ComputeDevice> {
    pub device: Arc<D>,
    pub config: Arc<ZeroCopyConfig>,
    pub buffer: D::Buffer,
    pub region: Option<AlignedRegion>,
    pub access: AccessMode,
    pub strategy: BufferStrategy,
    pub host_address: Option<usize>,
}

impl<D: ComputeDevice> DeviceBufferBinding<D> {
    pub(crate) fn new(parts: BindingParts<D>) -> Self {
        let size = parts.device.buffer_size(&parts.buffer);
        Self {
            device: parts.device,
            config: parts.config,
            buffer: ManuallyDrop::new(parts.buffer),
            region: parts.region,
            size,
            access: parts.access,
            strategy: parts.strategy,
            zero_copy: Cell::new(parts.host_address.is_some()),
            host_address: parts.host_address,
            map_state: Cell::new(MapState::Unmapped),
            last_use: Cell::new(None),
            last_write: Cell::new(None),
            failed_write: Cell::new(None),
        }
    }

    pub(crate) fn buffer(&self) -> &D::Buffer {
        &self.buffer
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn access(&self) -> AccessMode {
        self.access
    }

    /// Strategy the buffer was actually created with (after any fallback)
    pub fn strategy(&self) -> BufferStrategy {
        self.strategy
    }

    /// Host and device share memory, as far as has been observed
    pub fn is_zero_copy(&self) -> bool {
        self.zero_copy.get()
    }

    pub(crate) fn mark_not_zero_copy(&self) {
        self.zero_copy.set(false);
    }

    /// Address of the shared memory for zero-copy bindings
    pub fn host_address(&self) -> Option<usize> {
        self.host_address
    }

    pub fn map_state(&self) -> MapState {
        self.map_state.get()
    }

    /// Whether this binding owns a host region
    pub fn owns_region(&self) -> bool {
        self.region.is_some()
    }

    /// Last enqueued command touching this binding that has not completed
    pub fn pending_ticket(&self) -> Option<QueueTicket> {
        self.last_use
            .get()
            .filter(|ticket| !self.device.is_complete(*ticket))
    }

    pub(crate) fn belongs_to(&self, device: &Arc<D>) -> bool {
        Arc::ptr_eq(&self.device, device)
    }

    /// Block until `ticket` (if any) completes, bounded by the configured timeout
    ///
    /// Reports the command's own failure. A failed last write is remembered
    /// until the host or a later command rewrites the buffer.
    fn wait_for(&self, ticket: Option<QueueTicket>) -> ForgeResult<()> {
        let Some(ticket) = ticket else { return Ok(()) };
        match self.device.wait(ticket, self.config.wait_timeout) {
            Err(e) if !matches!(e, ForgeError::DeviceTimeout { .. }) => {
                if self.last_write.get() == Some(ticket) {
                    self.failed_write.set(Some(ticket));
                }
                Err(e)
            }
            other => other,
        }
    }

    /// Wait for the last device write; fails if that write failed
    pub(crate) fn wait_until_readable(&self) -> ForgeResult<()> {
        self.wait_for(self.last_write.get())?;
        match self.failed_write.get() {
            Some(ticket) => Err(crate::device_error!(
                "command {} writing this buffer failed; its contents are undefined",
                ticket
            )),
            None => Ok(()),
        }
    }

    /// Wait until no device command uses the buffer
    ///
    /// A failed command still counts as finished here: the host is about to
    /// replace or release the contents.
    pub(crate) fn wait_until_idle(&self) -> ForgeResult<()> {
        let Some(ticket) = self.last_use.get() else { return Ok(()) };
        match self.wait_for(Some(ticket)) {
            Err(e) if self.device.is_complete(ticket) => {
                tracing::debug!("DeviceBufferBinding: ignoring failed command {}: {}", ticket, e);
                Ok(())
            }
            other => other,
        }
    }

    fn require_unmapped(&self, operation: &str) -> ForgeResult<()> {
        match self.map_state.get() {
            MapState::Unmapped => Ok(()),
            state => Err(crate::map_state_error!(
                "cannot {} while the binding is {}",
                operation,
                state
            )),
        }
    }

    /// Copy `data` into the start of the device buffer
    ///
    /// Waits for every pending command using the buffer first. Legal only
    /// while unmapped.
    pub fn write_from(&self, data: &[u8]) -> ForgeResult<()> {
        self.require_unmapped("write to the device buffer")?;
        self.wait_until_idle()?;
        self.device
            .write_buffer(&self.buffer, 0, data, self.config.wait_timeout)?;
        self.failed_write.set(None);
        Ok(())
    }

    /// Copy the start of the device buffer into `out`
    ///
    /// Waits for pending writers first and fails if the last one failed.
    /// Legal only while unmapped.
    pub fn read_into(&self, out: &mut [u8]) -> ForgeResult<()> {
        self.require_unmapped("read from the device buffer")?;
        self.wait_until_readable()?;
        self.device
            .read_buffer(&self.buffer, 0, out, self.config.wait_timeout)
    }

    /// Wait for pending work, release the device buffer, and hand back the
    /// host region (if this binding owned one)
    pub fn unbind(mut self) -> ForgeResult<Option<AlignedRegion>> {
        self.require_unmapped("unbind")?;
        self.wait_until_idle()?;
        Ok(self.region.take())
    }
}

impl<D: ComputeDevice> Drop for DeviceBufferBinding<D> {
    fn drop(&mut self) {
        if let Some(ticket) = self.pending_ticket() {
            if let Err(e) = self.device.wait(ticket, self.config.wait_timeout) {
                if self.device.is_complete(ticket) {
                    tracing::debug!("DeviceBufferBinding::drop: command {} failed: {}", ticket, e);
                } else {
                    // The device may still touch the memory: leak it rather
                    // than free it under in-flight work.
                    tracing::error!(
                        "DeviceBufferBinding::drop: command {} still pending ({}); leaking {} bytes",
                        ticket,
                        e,
                        self.size
                    );
                    if let Some(region) = self.region.take() {
                        std::mem::forget(region);
                    }
                    return;
                }
            }
        }

        // SAFETY: the buffer is dropped exactly once, here, and before the
        // region it may point into.
        unsafe { ManuallyDrop::drop(&mut self.buffer) };
        if let Some(region) = self.region.take() {
            if let Err(e) = region.free() {
                tracing::error!("DeviceBufferBinding::drop: {}", e);
            }
        }
    }
}

impl<D: ComputeDevice> fmt::Debug for DeviceBufferBinding<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBufferBinding")
            .field("buffer", &*self.buffer)
            .field("size", &self.size)
            .field("access", &self.access)
            .field("strategy", &self.strategy)
            .field("zero_copy", &self.zero_copy.get())
            .field("map_state", &self.map_state.get())
            .finish()
    }
}

/// A region that could not be imported, handed back with the reason
///
/// `NotZeroCopy` is the one recoverable case: the caller still owns the
/// region and can fall back to a copy-based buffer.
#[derive(Debug)]
pub struct ImportError {
    error: ForgeError,
    region: AlignedRegion,
}

impl ImportError {
    pub(crate) fn new(error: ForgeError, region: AlignedRegion) -> Self {
        Self { error, region }
    }

    pub fn error(&self) -> &ForgeError {
        &self.error
    }

    pub fn is_not_zero_copy(&self) -> bool {
        matches!(self.error, ForgeError::NotZeroCopy { .. })
    }

    pub fn into_region(self) -> AlignedRegion {
        self.region
    }

    pub fn into_parts(self) -> (ForgeError, AlignedRegion) {
        (self.error, self.region)
    }
}

impl fmt::Display for ImportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "import of region at {:#x} failed: {}", self.region.addr(), self.error)
    }
}

impl std::error::Error for ImportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// The region is released; only the reason survives
impl From<ImportError> for ForgeError {
    fn from(err: ImportError) -> Self {
        err.error
    }
}

/// A binding passed to a kernel, tagged with how the kernel uses it
pub enum KernelArg<'a, D: ComputeDevice> {
    Read(&'a DeviceBufferBinding<D>),
    Write(&'a DeviceBufferBinding<D>),
    ReadWrite(&'a DeviceBufferBinding<D>),
}

impl<'a, D: ComputeDevice> KernelArg<'a, D> {
    pub fn binding(&self) -> &'a DeviceBufferBinding<D> {
        match *self {
            KernelArg::Read(b) | KernelArg::Write(b) | KernelArg::ReadWrite(b) => b,
        }
    }

    pub fn reads(&self) -> bool {
        matches!(self, KernelArg::Read(_) | KernelArg::ReadWrite(_))
    }

    pub fn writes(&self) -> bool {
        matches!(self, KernelArg::Write(_) | KernelArg::ReadWrite(_))
    }
}
