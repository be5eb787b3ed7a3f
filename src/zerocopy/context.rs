//! Explicit session object tying a device to buffer-manager policy

use std::sync::Arc;

use crate::backend::device::{
    AccessMode, BufferRequest, ComputeDevice, DeviceCaps, LaunchConfig, Placement, QueueTicket,
};
use crate::config::ZeroCopyConfig;
use crate::error::{ForgeError, ForgeResult};
use crate::memory::{self, AlignedRegion};
use crate::zerocopy::binding::{BindingParts, DeviceBufferBinding, ImportError, KernelArg};
use crate::zerocopy::mapping::{MapState, MappingSession};
use crate::zerocopy::BufferStrategy;

/// Device handle plus configuration, passed to every buffer operation
///
/// Cloning is cheap and clones share the device. Bindings remember the device
/// they were created on and are rejected by contexts over other devices.
pub struct ZeroCopyContext<D: ComputeDevice> {
    device: Arc<D>,
    config: Arc<ZeroCopyConfig>,
}

impl<D: ComputeDevice> Clone for ZeroCopyContext<D> {
    fn clone(&self) -> Self {
        Self {
            device: Arc::clone(&self.device),
            config: Arc::clone(&self.config),
        }
    }
}

impl<D: ComputeDevice> std::fmt::Debug for ZeroCopyContext<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZeroCopyContext")
            .field("device", &self.device)
            .field("config", &self.config)
            .finish()
    }
}

impl<D: ComputeDevice> ZeroCopyContext<D> {
    pub fn new(device: D, config: ZeroCopyConfig) -> ForgeResult<Self> {
        Self::with_shared_device(Arc::new(device), config)
    }

    pub fn with_shared_device(device: Arc<D>, config: ZeroCopyConfig) -> ForgeResult<Self> {
        config.validate()?;
        device.caps().validate()?;
        tracing::debug!(
            "ZeroCopyContext::new: device '{}', strategy {}, timeout {:?}",
            device.caps().name,
            config.strategy,
            config.wait_timeout
        );
        Ok(Self {
            device,
            config: Arc::new(config),
        })
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn config(&self) -> &ZeroCopyConfig {
        &self.config
    }

    pub fn caps(&self) -> &DeviceCaps {
        self.device.caps()
    }

    // ========== Alignment Queries ==========

    pub fn required_alignment(&self) -> ForgeResult<usize> {
        memory::required_alignment(self.device.as_ref())
    }

    pub fn required_size_granularity(&self, size: usize) -> ForgeResult<usize> {
        memory::required_size_granularity(size, self.device.as_ref())
    }

    // ========== Host Regions ==========

    /// Allocate a region that satisfies this device's zero-copy rules
    pub fn allocate(&self, size: usize) -> ForgeResult<AlignedRegion> {
        let alignment = self.required_alignment()?;
        AlignedRegion::allocate_granular(size, alignment, self.caps().transfer_granularity)
    }

    pub fn free(&self, region: AlignedRegion) -> ForgeResult<()> {
        region.free()
    }

    fn check_importable(&self, region: &AlignedRegion) -> ForgeResult<()> {
        let alignment = self.required_alignment()?;
        if region.alignment() < alignment || !region.is_aligned_to(alignment) {
            return Err(crate::alignment_error!(
                "region at {:#x} was allocated with alignment {} but device '{}' requires {}",
                region.addr(),
                region.alignment(),
                self.caps().name,
                alignment
            ));
        }
        let granular = self.required_size_granularity(region.len())?;
        if granular != region.len() {
            return Err(ForgeError::InvalidSize(format!(
                "region of {} bytes is not a multiple of device '{}' granularity {}",
                region.len(),
                self.caps().name,
                self.caps().transfer_granularity
            )));
        }
        Ok(())
    }

    // ========== Buffer Creation ==========

    /// Import `region` so the device uses it in place
    ///
    /// On success the binding owns the region and the device's backing address
    /// equals the region base. On failure the region comes back inside the
    /// error; `NotZeroCopy` means the import worked but the device made a
    /// private copy.
    pub fn create_zero_copy_buffer(
        &self,
        region: AlignedRegion,
        access: AccessMode,
    ) -> Result<DeviceBufferBinding<D>, ImportError> {
        if let Err(error) = self.check_importable(&region) {
            return Err(ImportError::new(error, region));
        }

        let request = BufferRequest {
            size: region.len(),
            access,
            placement: Placement::UseHostPtr(region.base_ptr()),
        };
        // SAFETY: the region moves into the binding, which drops the buffer
        // and waits for queued work before releasing it. On the error paths
        // the buffer is dropped before the region is handed back.
        let buffer = match unsafe { self.device.create_buffer(&request) } {
            Ok(buffer) => buffer,
            Err(error) => return Err(ImportError::new(error, region)),
        };

        let expected = region.addr();
        let actual = self.device.backing_address(&buffer);
        if actual != Some(expected) {
            drop(buffer);
            tracing::warn!(
                "ZeroCopyContext::create_zero_copy_buffer: device did not use host memory at {:#x} ({} bytes)",
                expected,
                region.len()
            );
            return Err(ImportError::new(ForgeError::NotZeroCopy { expected, actual }, region));
        }

        tracing::debug!(
            "ZeroCopyContext::create_zero_copy_buffer: {} bytes at {:#x}, {}",
            region.len(),
            expected,
            access
        );
        Ok(self.bind(buffer, Some(region), access, BufferStrategy::HostAllocatedZeroCopy, Some(expected)))
    }

    /// Create a buffer with the configured strategy
    pub fn create_configured_buffer(&self, size: usize, access: AccessMode) -> ForgeResult<DeviceBufferBinding<D>> {
        self.create_buffer(self.config.strategy, size, access)
    }

    /// Create a zero-initialised buffer of at least `size` bytes
    ///
    /// Zero-copy strategies round `size` up to the device granularity. With
    /// `fallback_to_copy` a zero-copy attempt the device refuses becomes a
    /// copy-based buffer.
    pub fn create_buffer(
        &self,
        strategy: BufferStrategy,
        size: usize,
        access: AccessMode,
    ) -> ForgeResult<DeviceBufferBinding<D>> {
        if size == 0 {
            return Err(ForgeError::InvalidSize("buffer size cannot be zero".to_string()));
        }
        match strategy {
            BufferStrategy::HostAllocatedZeroCopy => {
                let region = self.allocate(size)?;
                self.create_buffer_from_region(strategy, region, access)
            }
            BufferStrategy::DeviceAllocatedZeroCopy => self.create_device_allocated(size, access),
            BufferStrategy::CopyBased => self.create_device_local(size, access),
        }
    }

    /// Create a buffer initialised with the contents of `region`
    ///
    /// The region is consumed: bound in place for `HostAllocatedZeroCopy`,
    /// otherwise copied into the new buffer and freed.
    pub fn create_buffer_from_region(
        &self,
        strategy: BufferStrategy,
        region: AlignedRegion,
        access: AccessMode,
    ) -> ForgeResult<DeviceBufferBinding<D>> {
        match strategy {
            BufferStrategy::HostAllocatedZeroCopy => match self.create_zero_copy_buffer(region, access) {
                Ok(binding) => Ok(binding),
                Err(err) if err.is_not_zero_copy() && self.config.fallback_to_copy => {
                    tracing::warn!("Falling back to a copy-based buffer: {}", err.error());
                    self.upload(BufferStrategy::CopyBased, err.into_region(), access)
                }
                Err(err) => Err(err.into()),
            },
            other => self.upload(other, region, access),
        }
    }

    fn upload(
        &self,
        strategy: BufferStrategy,
        region: AlignedRegion,
        access: AccessMode,
    ) -> ForgeResult<DeviceBufferBinding<D>> {
        let binding = self.create_buffer(strategy, region.len(), access)?;
        binding.write_from(region.as_slice())?;
        region.free()?;
        Ok(binding)
    }

    fn create_device_allocated(&self, size: usize, access: AccessMode) -> ForgeResult<DeviceBufferBinding<D>> {
        let size = self.required_size_granularity(size)?;
        let request = BufferRequest {
            size,
            access,
            placement: Placement::AllocHostPtr,
        };
        // SAFETY: no caller memory is involved
        let buffer = unsafe { self.device.create_buffer(&request)? };

        match self.device.backing_address(&buffer) {
            Some(addr) => {
                tracing::debug!(
                    "ZeroCopyContext::create_buffer: device-allocated {} bytes at {:#x}",
                    size,
                    addr
                );
                Ok(self.bind(buffer, None, access, BufferStrategy::DeviceAllocatedZeroCopy, Some(addr)))
            }
            None if self.config.fallback_to_copy => {
                tracing::warn!(
                    "Device '{}' has no host-visible allocation; falling back to a copy-based buffer",
                    self.caps().name
                );
                Ok(self.bind(buffer, None, access, BufferStrategy::CopyBased, None))
            }
            None => Err(ForgeError::NotZeroCopy {
                expected: 0,
                actual: None,
            }),
        }
    }

    fn create_device_local(&self, size: usize, access: AccessMode) -> ForgeResult<DeviceBufferBinding<D>> {
        let request = BufferRequest {
            size,
            access,
            placement: Placement::DeviceLocal,
        };
        // SAFETY: no caller memory is involved
        let buffer = unsafe { self.device.create_buffer(&request)? };
        tracing::debug!("ZeroCopyContext::create_buffer: device-local {} bytes", size);
        Ok(self.bind(buffer, None, access, BufferStrategy::CopyBased, None))
    }

    fn bind(
        &self,
        buffer: D::Buffer,
        region: Option<AlignedRegion>,
        access: AccessMode,
        strategy: BufferStrategy,
        host_address: Option<usize>,
    ) -> DeviceBufferBinding<D> {
        DeviceBufferBinding::new(BindingParts {
            device: Arc::clone(&self.device),
            config: Arc::clone(&self.config),
            buffer,
            region,
            access,
            strategy,
            host_address,
        })
    }

    // ========== Queue ==========

    /// Enqueue a kernel over bindings
    ///
    /// # Errors
    /// - `MapStateViolation` if any binding is mapped
    /// - `AccessViolation` if an argument's use conflicts with the binding's
    ///   access mode, or a binding appears twice
    /// - `DeviceResourceError` if a binding belongs to another device
    pub fn enqueue(
        &self,
        kernel: &D::Kernel,
        launch: &LaunchConfig,
        args: &[KernelArg<'_, D>],
    ) -> ForgeResult<QueueTicket> {
        for (i, arg) in args.iter().enumerate() {
            let binding = arg.binding();
            if !binding.belongs_to(&self.device) {
                return Err(crate::device_error!(
                    "kernel argument {} was created on a different device",
                    i
                ));
            }
            if let Some(first) = args[..i].iter().position(|a| std::ptr::eq(a.binding(), binding)) {
                return Err(ForgeError::AccessViolation(format!(
                    "kernel arguments {} and {} are the same binding",
                    first, i
                )));
            }
            let state = binding.map_state();
            if state != MapState::Unmapped {
                return Err(crate::map_state_error!(
                    "kernel argument {} is {}; unmap it before enqueueing device work",
                    i,
                    state
                ));
            }
            if arg.writes() && !binding.access().device_writes() {
                return Err(ForgeError::AccessViolation(format!(
                    "kernel argument {} writes a {} buffer",
                    i,
                    binding.access()
                )));
            }
            if arg.reads() && !binding.access().device_reads() {
                return Err(ForgeError::AccessViolation(format!(
                    "kernel argument {} reads a {} buffer",
                    i,
                    binding.access()
                )));
            }
        }

        let buffers: Vec<&D::Buffer> = args.iter().map(|arg| arg.binding().buffer()).collect();
        let ticket = self.device.enqueue_kernel(kernel, launch, &buffers)?;

        for arg in args {
            let binding = arg.binding();
            binding.last_use.set(Some(ticket));
            if arg.writes() {
                binding.last_write.set(Some(ticket));
                binding.failed_write.set(None);
            }
        }
        Ok(ticket)
    }

    /// Block until `ticket` completes, bounded by the configured timeout
    pub fn wait(&self, ticket: QueueTicket) -> ForgeResult<()> {
        self.device.wait(ticket, self.config.wait_timeout)
    }

    /// Block until all enqueued work completes
    pub fn finish(&self) -> ForgeResult<()> {
        self.device.finish(self.config.wait_timeout)
    }

    // ========== Mapping ==========

    pub fn map_for_read<'a>(&self, binding: &'a DeviceBufferBinding<D>) -> ForgeResult<MappingSession<'a, D>> {
        self.check_owned(binding)?;
        binding.map_for_read()
    }

    pub fn map_for_write<'a>(&self, binding: &'a DeviceBufferBinding<D>) -> ForgeResult<MappingSession<'a, D>> {
        self.check_owned(binding)?;
        binding.map_for_write()
    }

    pub fn unmap(&self, session: MappingSession<'_, D>) -> ForgeResult<()> {
        session.unmap()
    }

    fn check_owned(&self, binding: &DeviceBufferBinding<D>) -> ForgeResult<()> {
        if binding.belongs_to(&self.device) {
            Ok(())
        } else {
            Err(crate::device_error!("binding was created on a different device"))
        }
    }
}
