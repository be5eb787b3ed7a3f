//! HIP code objects and kernel handles

use std::ffi::CString;
use std::ptr;
use std::sync::Arc;

use crate::backend::hip_backend::ffi;
use crate::error::{ForgeError, ForgeResult};

// SAFETY: HipModule only holds the driver handle; unloading happens once on drop
unsafe impl Send for HipModule {}
unsafe impl Sync for HipModule {}

/// Loaded code object
#[derive(Debug)]
pub struct HipModule {
    module: *mut std::ffi::c_void,
}

impl HipModule {
    /// Load a code object (`.hsaco`) from disk
    pub fn load_from_path(path: &str) -> ForgeResult<Arc<Self>> {
        let path_cstr = CString::new(path)
            .map_err(|e| ForgeError::InvalidConfiguration(format!("invalid module path: {}", e)))?;
        let mut module: *mut std::ffi::c_void = ptr::null_mut();
        ffi::check(
            unsafe { ffi::hipModuleLoad(&mut module, path_cstr.as_ptr()) },
            &format!("hipModuleLoad({})", path),
        )?;
        tracing::debug!("HipModule::load_from_path: loaded '{}'", path);
        Ok(Arc::new(HipModule { module }))
    }

    /// Load a code object from memory
    pub fn load_from_data(image: &[u8]) -> ForgeResult<Arc<Self>> {
        let mut module: *mut std::ffi::c_void = ptr::null_mut();
        ffi::check(
            unsafe { ffi::hipModuleLoadData(&mut module, image.as_ptr() as *const std::ffi::c_void) },
            "hipModuleLoadData",
        )?;
        Ok(Arc::new(HipModule { module }))
    }

    pub fn as_ptr(&self) -> *mut std::ffi::c_void {
        self.module
    }
}

impl Drop for HipModule {
    fn drop(&mut self) {
        if !self.module.is_null() {
            unsafe {
                ffi::hipModuleUnload(self.module);
            }
        }
    }
}

// SAFETY: the function handle stays valid while `_module` keeps the code
// object loaded
unsafe impl Send for HipKernel {}
unsafe impl Sync for HipKernel {}

/// Kernel function whose parameters are device pointers, one per buffer
#[derive(Debug)]
pub struct HipKernel {
    name: String,
    func: *mut std::ffi::c_void,
    _module: Arc<HipModule>,
    /// Threads per block when the launch does not specify a local size
    default_block: u32,
}

impl HipKernel {
    pub fn from_module(module: &Arc<HipModule>, name: &str) -> ForgeResult<Self> {
        let name_cstr = CString::new(name)
            .map_err(|e| ForgeError::InvalidConfiguration(format!("invalid kernel name: {}", e)))?;
        let mut func: *mut std::ffi::c_void = ptr::null_mut();
        ffi::check(
            unsafe { ffi::hipModuleGetFunction(&mut func, module.as_ptr(), name_cstr.as_ptr()) },
            &format!("hipModuleGetFunction({})", name),
        )?;
        Ok(HipKernel {
            name: name.to_string(),
            func,
            _module: Arc::clone(module),
            default_block: 256,
        })
    }

    pub fn with_default_block(mut self, threads: u32) -> Self {
        self.default_block = threads.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn as_ptr(&self) -> *mut std::ffi::c_void {
        self.func
    }

    pub fn default_block(&self) -> u32 {
        self.default_block
    }
}
