//! Host memory for device-shared buffers
//!
//! Devices that can read host memory in place (zero copy) only do so when the
//! region's base address and size follow the device's rules. This module
//! produces such regions and holds the arithmetic behind those rules:
//! 1. Query the device for its alignment and granularity
//! 2. Allocate an [`AlignedRegion`] that satisfies them
//! 3. Hand the region to `ZeroCopyContext::create_zero_copy_buffer`

pub mod aligned;
pub mod layout;

pub use aligned::{allocate, free, AlignedRegion};
pub use layout::{
    is_zero_copy_eligible, required_alignment, required_size_granularity, round_up_to_multiple,
    RowPitch,
};
