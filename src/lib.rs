//! hostforge - aligned zero-copy buffer manager
//!
//! Host memory that a compute device can use in place, without copies.
//! The crate allocates regions that satisfy the device's import rules, binds
//! them to device buffers, and governs when the host may touch memory that
//! queued device work may also be using.
//!
//! Devices implement [`ComputeDevice`]. [`HostDevice`] is an in-process
//! emulation with an asynchronous queue; the HIP backend (feature `rocm`)
//! drives AMD GPUs.

#![allow(clippy::missing_safety_doc)] // FFI bindings documented at module level
#![allow(clippy::should_implement_trait)] // from_str helpers return Option

pub mod backend;
pub mod config;
pub mod error;
pub mod logging;
pub mod memory;
pub mod zerocopy;

pub use backend::device::{
    AccessMode, BufferRequest, ComputeDevice, DeviceCaps, LaunchConfig, MapAccess, Placement,
    QueueTicket,
};
pub use backend::host::{HostDevice, HostDeviceOptions, HostKernel};
pub use config::ZeroCopyConfig;
pub use error::{ErrorCategory, ForgeError, ForgeResult};
pub use memory::{allocate, free, AlignedRegion, RowPitch};
pub use zerocopy::{
    BufferStrategy, DeviceBufferBinding, ImportError, KernelArg, MapState, MappingSession,
    ZeroCopyContext,
};
