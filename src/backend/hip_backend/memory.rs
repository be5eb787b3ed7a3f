//! HIP buffers in the three placements

use std::ffi::c_void;
use std::ptr;

use crate::backend::device::AccessMode;
use crate::backend::hip_backend::ffi;
use crate::error::{ForgeError, ForgeResult};

/// Where a HIP buffer's memory came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HipBufferKind {
    /// Caller memory pinned with hipHostRegister
    Registered,
    /// hipHostMalloc(mapped) memory owned by the buffer
    HostMapped,
    /// hipMalloc memory
    DeviceLocal,
}

// SAFETY: HipBuffer only holds addresses; access to the memory is ordered by
// the stream and the mapping discipline above the device.
unsafe impl Send for HipBuffer {}
unsafe impl Sync for HipBuffer {}

/// Device buffer handle; releases its memory (or registration) on drop
#[derive(Debug)]
pub struct HipBuffer {
    kind: HipBufferKind,
    /// Host address for Registered and HostMapped buffers
    host_ptr: *mut c_void,
    /// Address kernels use
    device_ptr: *mut c_void,
    size: usize,
    access: AccessMode,
}

impl HipBuffer {
    /// Pin caller memory and obtain its device address
    ///
    /// # Safety
    /// `host_ptr..host_ptr+size` must stay valid until the buffer is dropped.
    pub unsafe fn register(host_ptr: *mut c_void, size: usize, access: AccessMode) -> ForgeResult<Self> {
        tracing::trace!("HipBuffer::register: {} bytes at {:?}", size, host_ptr);
        ffi::check(
            ffi::hipHostRegister(host_ptr, size, ffi::HIP_HOST_REGISTER_MAPPED),
            "hipHostRegister",
        )?;

        let mut device_ptr: *mut c_void = ptr::null_mut();
        if let Err(e) = ffi::check(
            ffi::hipHostGetDevicePointer(&mut device_ptr, host_ptr, 0),
            "hipHostGetDevicePointer",
        ) {
            ffi::hipHostUnregister(host_ptr);
            return Err(e);
        }

        Ok(HipBuffer {
            kind: HipBufferKind::Registered,
            host_ptr,
            device_ptr,
            size,
            access,
        })
    }

    /// Allocate mapped, host-visible memory
    pub fn host_mapped(size: usize, access: AccessMode) -> ForgeResult<Self> {
        let mut host_ptr: *mut c_void = ptr::null_mut();
        ffi::check(
            unsafe { ffi::hipHostMalloc(&mut host_ptr, size, ffi::HIP_HOST_MALLOC_MAPPED) },
            "hipHostMalloc",
        )?;
        if host_ptr.is_null() {
            return Err(ForgeError::DeviceResourceError(format!(
                "hipHostMalloc returned null pointer for {} bytes",
                size
            )));
        }

        let mut device_ptr: *mut c_void = ptr::null_mut();
        if let Err(e) = ffi::check(
            unsafe { ffi::hipHostGetDevicePointer(&mut device_ptr, host_ptr, 0) },
            "hipHostGetDevicePointer",
        ) {
            unsafe { ffi::hipHostFree(host_ptr) };
            return Err(e);
        }

        tracing::debug!("HipBuffer::host_mapped: {} bytes at {:?}", size, host_ptr);
        Ok(HipBuffer {
            kind: HipBufferKind::HostMapped,
            host_ptr,
            device_ptr,
            size,
            access,
        })
    }

    /// Allocate device-local memory
    pub fn device_local(size: usize, access: AccessMode) -> ForgeResult<Self> {
        let mut device_ptr: *mut c_void = ptr::null_mut();
        let result = unsafe { ffi::hipMalloc(&mut device_ptr, size) };
        if result != ffi::HIP_SUCCESS || device_ptr.is_null() {
            tracing::error!("HipBuffer::device_local: hipMalloc failed with code {} for {} bytes", result, size);
            return Err(ForgeError::DeviceResourceError(format!(
                "hipMalloc failed for {} bytes: {}",
                size,
                ffi::error_string(result)
            )));
        }
        tracing::debug!("HipBuffer::device_local: {} bytes at {:?}", size, device_ptr);
        Ok(HipBuffer {
            kind: HipBufferKind::DeviceLocal,
            host_ptr: ptr::null_mut(),
            device_ptr,
            size,
            access,
        })
    }

    pub fn kind(&self) -> HipBufferKind {
        self.kind
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn access(&self) -> AccessMode {
        self.access
    }

    /// Host address, if the buffer is host visible
    pub fn host_ptr(&self) -> Option<*mut c_void> {
        (!self.host_ptr.is_null()).then_some(self.host_ptr)
    }

    pub fn device_ptr(&self) -> *mut c_void {
        self.device_ptr
    }

    /// Blocking copy into the buffer at `offset`
    pub fn copy_from_host(&self, offset: usize, data: &[u8]) -> ForgeResult<()> {
        // SAFETY: callers check offset + data.len() <= size
        let dst = unsafe { (self.device_ptr as *mut u8).add(offset) } as *mut c_void;
        ffi::check(
            unsafe {
                ffi::hipMemcpy(dst, data.as_ptr() as *const c_void, data.len(), ffi::HIP_MEMCPY_HOST_TO_DEVICE)
            },
            "hipMemcpy(HtoD)",
        )
    }

    /// Blocking copy out of the buffer at `offset`
    pub fn copy_to_host(&self, offset: usize, out: &mut [u8]) -> ForgeResult<()> {
        let src = unsafe { (self.device_ptr as *const u8).add(offset) } as *const c_void;
        ffi::check(
            unsafe {
                ffi::hipMemcpy(out.as_mut_ptr() as *mut c_void, src, out.len(), ffi::HIP_MEMCPY_DEVICE_TO_HOST)
            },
            "hipMemcpy(DtoH)",
        )
    }
}

impl Drop for HipBuffer {
    fn drop(&mut self) {
        let result = unsafe {
            match self.kind {
                HipBufferKind::Registered => ffi::hipHostUnregister(self.host_ptr),
                HipBufferKind::HostMapped => ffi::hipHostFree(self.host_ptr),
                HipBufferKind::DeviceLocal => ffi::hipFree(self.device_ptr),
            }
        };
        if result != ffi::HIP_SUCCESS {
            tracing::error!(
                "HipBuffer::drop: releasing {:?} buffer failed: {}",
                self.kind,
                ffi::error_string(result)
            );
        }
    }
}
