//! HIP backend (feature `rocm`)
//!
//! Zero copy on AMD GPUs: caller regions are pinned with `hipHostRegister`,
//! device-allocated zero copy uses mapped `hipHostMalloc` memory, and the
//! copy path uses `hipMalloc` with staging maps.

mod device;
mod event;
pub mod ffi;
mod memory;
mod module;
mod stream;

pub use device::HipDevice;
pub use event::HipEvent;
pub use memory::{HipBuffer, HipBufferKind};
pub use module::{HipKernel, HipModule};
pub use stream::HipStream;
