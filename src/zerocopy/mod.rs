//! Zero-copy buffer management
//!
//! [`ZeroCopyContext`] is the entry point: it queries the device's rules,
//! allocates conforming host regions, binds them to device buffers using one
//! of the [`BufferStrategy`] variants, and enforces the mapping discipline
//! that keeps host access and device work apart.

pub mod binding;
pub mod context;
pub mod mapping;
pub mod strategy;

pub use binding::{DeviceBufferBinding, ImportError, KernelArg};
pub use context::ZeroCopyContext;
pub use mapping::{MapState, MappingSession};
pub use strategy::BufferStrategy;
