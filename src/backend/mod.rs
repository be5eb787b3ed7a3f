//! Compute devices
//!
//! `device` defines the interface the buffer manager consumes. `host` is an
//! in-process implementation used by tests and the probe binary; `hip_backend`
//! drives AMD GPUs when built with `--features rocm`.

pub mod device;
pub mod host;
#[cfg(feature = "rocm")]
pub mod hip_backend;

pub use device::{ComputeDevice, DeviceCaps};
pub use host::HostDevice;
#[cfg(feature = "rocm")]
pub use hip_backend::HipDevice;
