//! HIP event wrapper marking the completion of one queued command

use std::ptr;

use crate::backend::hip_backend::ffi;
use crate::backend::hip_backend::stream::HipStream;
use crate::error::{ForgeError, ForgeResult};

// SAFETY: HipEvent only holds the driver handle; HIP event calls are
// thread-safe. Not Clone: two owners would destroy the event twice.
unsafe impl Send for HipEvent {}
unsafe impl Sync for HipEvent {}

#[derive(Debug)]
pub struct HipEvent {
    event: *mut std::ffi::c_void,
}

impl HipEvent {
    /// Synchronization-only event (no timing data)
    pub fn new() -> ForgeResult<Self> {
        let mut event: *mut std::ffi::c_void = ptr::null_mut();
        ffi::check(
            unsafe { ffi::hipEventCreateWithFlags(&mut event, ffi::HIP_EVENT_DISABLE_TIMING) },
            "hipEventCreateWithFlags",
        )?;
        if event.is_null() {
            return Err(ForgeError::DeviceResourceError(
                "hipEventCreateWithFlags returned null pointer".to_string(),
            ));
        }
        Ok(HipEvent { event })
    }

    /// Capture everything submitted to `stream` so far
    pub fn record(&self, stream: &HipStream) -> ForgeResult<()> {
        ffi::check(
            unsafe { ffi::hipEventRecord(self.event, stream.as_ptr()) },
            "hipEventRecord",
        )
    }

    pub fn synchronize(&self) -> ForgeResult<()> {
        ffi::check(unsafe { ffi::hipEventSynchronize(self.event) }, "hipEventSynchronize")
    }

    /// `Ok(true)` once the captured work has completed
    pub fn query(&self) -> ForgeResult<bool> {
        match unsafe { ffi::hipEventQuery(self.event) } {
            ffi::HIP_SUCCESS => Ok(true),
            ffi::HIP_ERROR_NOT_READY => Ok(false),
            code => ffi::check(code, "hipEventQuery").map(|_| false),
        }
    }
}

impl Drop for HipEvent {
    fn drop(&mut self) {
        if !self.event.is_null() {
            unsafe {
                ffi::hipEventDestroy(self.event);
            }
        }
    }
}
