//! HIP stream wrapper

use std::ptr;

use crate::backend::hip_backend::ffi;
use crate::error::{ForgeError, ForgeResult};

// SAFETY: HipStream only holds the driver handle; HIP stream calls are
// thread-safe. Not Clone: two owners would destroy the stream twice.
unsafe impl Send for HipStream {}
unsafe impl Sync for HipStream {}

/// The device's in-order queue
#[derive(Debug)]
pub struct HipStream {
    stream: *mut std::ffi::c_void,
}

impl HipStream {
    pub fn new() -> ForgeResult<Self> {
        let mut stream: *mut std::ffi::c_void = ptr::null_mut();
        ffi::check(unsafe { ffi::hipStreamCreate(&mut stream) }, "hipStreamCreate")?;
        if stream.is_null() {
            return Err(ForgeError::DeviceResourceError(
                "hipStreamCreate returned null pointer".to_string(),
            ));
        }
        tracing::debug!("HipStream::new: created stream {:?}", stream);
        Ok(HipStream { stream })
    }

    pub fn synchronize(&self) -> ForgeResult<()> {
        ffi::check(unsafe { ffi::hipStreamSynchronize(self.stream) }, "hipStreamSynchronize")
    }

    /// `Ok(true)` once all work submitted to the stream has completed
    pub fn query(&self) -> ForgeResult<bool> {
        match unsafe { ffi::hipStreamQuery(self.stream) } {
            ffi::HIP_SUCCESS => Ok(true),
            ffi::HIP_ERROR_NOT_READY => Ok(false),
            code => ffi::check(code, "hipStreamQuery").map(|_| false),
        }
    }

    pub fn as_ptr(&self) -> *mut std::ffi::c_void {
        self.stream
    }
}

impl Drop for HipStream {
    fn drop(&mut self) {
        if !self.stream.is_null() {
            unsafe {
                ffi::hipStreamDestroy(self.stream);
            }
        }
    }
}
