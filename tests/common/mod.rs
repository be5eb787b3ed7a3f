//! Common test utilities
//!
//! Host-device tests build a fresh context per test so each one controls the
//! emulated driver (alignment rules, host-pointer behaviour, staging maps,
//! kernel latency). HIP tests share one device through `HIP_FIXTURE`, which is
//! `None` when no GPU is present so those tests skip instead of failing.
//!
//! # Usage
//!
//! ```ignore
//! mod common;
//! use common::{context, TIMEOUT};
//!
//! #[test]
//! fn my_test() {
//!     let ctx = context(HostDeviceOptions::default(), ZeroCopyConfig::default());
//!     // ... test code ...
//! }
//! ```

#![allow(dead_code)]

use std::time::Duration;

use hostforge::{HostDevice, HostDeviceOptions, ZeroCopyConfig, ZeroCopyContext};
pub use serial_test::serial;

/// Wait bound for tests that do not exercise timeouts
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Buffer size of the reference scenario (1 MiB)
pub const SCENARIO_SIZE: usize = 1 << 20;

pub fn context(options: HostDeviceOptions, config: ZeroCopyConfig) -> ZeroCopyContext<HostDevice> {
    let device = HostDevice::with_options(options).expect("Failed to create host device");
    ZeroCopyContext::new(device, config.with_wait_timeout(Some(TIMEOUT)))
        .expect("Failed to create context")
}

/// Context over the reference device: 4096-byte alignment, 64-byte granularity
pub fn default_context() -> ZeroCopyContext<HostDevice> {
    context(HostDeviceOptions::default(), ZeroCopyConfig::default())
}

/// Context whose driver ignores host pointers and copies instead
pub fn copying_driver_context(fallback_to_copy: bool) -> ZeroCopyContext<HostDevice> {
    context(
        HostDeviceOptions::default().with_honor_host_ptr(false),
        ZeroCopyConfig::default().with_fallback_to_copy(fallback_to_copy),
    )
}

/// Global HIP test fixture
///
/// Initialized once and shared by every HIP test. Returns `None` when the
/// runtime or a device is unavailable.
#[cfg(feature = "rocm")]
pub static HIP_FIXTURE: once_cell::sync::Lazy<Option<std::sync::Arc<hostforge::backend::HipDevice>>> =
    once_cell::sync::Lazy::new(|| match hostforge::backend::HipDevice::new(0) {
        Ok(device) => Some(std::sync::Arc::new(device)),
        Err(e) => {
            eprintln!("WARNING: HIP device not available - skipping HIP tests ({})", e);
            None
        }
    });
