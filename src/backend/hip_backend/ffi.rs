//! HIP runtime bindings used by the HIP device
//!
//! Only the entry points the buffer manager needs: host registration and
//! mapped host allocation for zero copy, plain device memory for the copy
//! path, one stream with events for completion, and module loading for
//! kernels.

use std::ffi::{c_char, c_void, CStr};

use crate::error::{ForgeError, ForgeResult};

#[link(name = "amdhip64")]
extern "C" {
    pub fn hipInit(flags: u32) -> i32;
    pub fn hipGetDeviceCount(count: *mut i32) -> i32;
    pub fn hipSetDevice(device_id: i32) -> i32;

    pub fn hipMalloc(ptr: *mut *mut c_void, size: usize) -> i32;
    pub fn hipFree(ptr: *mut c_void) -> i32;
    pub fn hipHostMalloc(ptr: *mut *mut c_void, size: usize, flags: u32) -> i32;
    pub fn hipHostFree(ptr: *mut c_void) -> i32;
    pub fn hipHostRegister(host_ptr: *mut c_void, size: usize, flags: u32) -> i32;
    pub fn hipHostUnregister(host_ptr: *mut c_void) -> i32;
    pub fn hipHostGetDevicePointer(dev_ptr: *mut *mut c_void, host_ptr: *mut c_void, flags: u32) -> i32;
    pub fn hipMemcpy(dst: *mut c_void, src: *const c_void, count: usize, kind: i32) -> i32;

    pub fn hipStreamCreate(stream: *mut *mut c_void) -> i32;
    pub fn hipStreamDestroy(stream: *mut c_void) -> i32;
    pub fn hipStreamSynchronize(stream: *mut c_void) -> i32;
    pub fn hipStreamQuery(stream: *mut c_void) -> i32;

    pub fn hipEventCreateWithFlags(event: *mut *mut c_void, flags: u32) -> i32;
    pub fn hipEventDestroy(event: *mut c_void) -> i32;
    pub fn hipEventRecord(event: *mut c_void, stream: *mut c_void) -> i32;
    pub fn hipEventSynchronize(event: *mut c_void) -> i32;
    pub fn hipEventQuery(event: *mut c_void) -> i32;

    pub fn hipModuleLoad(module: *mut *mut c_void, path: *const c_char) -> i32;
    pub fn hipModuleLoadData(module: *mut *mut c_void, image: *const c_void) -> i32;
    pub fn hipModuleUnload(module: *mut c_void) -> i32;
    pub fn hipModuleGetFunction(func: *mut *mut c_void, module: *mut c_void, name: *const c_char) -> i32;
    pub fn hipModuleLaunchKernel(
        func: *mut c_void,
        grid_dim_x: u32,
        grid_dim_y: u32,
        grid_dim_z: u32,
        block_dim_x: u32,
        block_dim_y: u32,
        block_dim_z: u32,
        shared_mem_bytes: u32,
        stream: *mut c_void,
        kernel_params: *mut *mut c_void,
        extra: *mut *mut c_void,
    ) -> i32;

    pub fn hipGetErrorString(error: i32) -> *const c_char;
}

pub const HIP_SUCCESS: i32 = 0;
/// hipErrorNotReady: queried work has not completed yet
pub const HIP_ERROR_NOT_READY: i32 = 600;

pub const HIP_MEMCPY_HOST_TO_DEVICE: i32 = 1;
pub const HIP_MEMCPY_DEVICE_TO_HOST: i32 = 2;

/// hipHostRegisterMapped
pub const HIP_HOST_REGISTER_MAPPED: u32 = 0x2;
/// hipHostMallocMapped
pub const HIP_HOST_MALLOC_MAPPED: u32 = 0x2;
/// hipEventDisableTiming
pub const HIP_EVENT_DISABLE_TIMING: u32 = 0x2;

pub fn error_string(code: i32) -> String {
    // SAFETY: hipGetErrorString returns a static NUL-terminated string or null
    let ptr = unsafe { hipGetErrorString(code) };
    if ptr.is_null() {
        return format!("HIP error {}", code);
    }
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

/// Map a HIP status code to a device error naming the failed call
pub fn check(code: i32, call: &str) -> ForgeResult<()> {
    if code == HIP_SUCCESS {
        Ok(())
    } else {
        Err(ForgeError::DeviceResourceError(format!(
            "{} failed: {} ({})",
            call,
            error_string(code),
            code
        )))
    }
}
