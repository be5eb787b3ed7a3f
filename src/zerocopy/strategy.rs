//! How a buffer shares memory between host and device

use std::fmt;

use serde::{Deserialize, Serialize};


/// Buffer creation strategy, picked per buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BufferStrategy {
    /// Device-local storage; the host transfers data explicitly
    CopyBased,
    /// The device allocates host-visible memory and the host maps it
    DeviceAllocatedZeroCopy,
    /// The host allocates an aligned region and the device uses it in place
    #[default]
    HostAllocatedZeroCopy,
}

impl BufferStrategy {
    pub const ALL: [BufferStrategy; 3] = [
        BufferStrategy::CopyBased,
        BufferStrategy::DeviceAllocatedZeroCopy,
        BufferStrategy::HostAllocatedZeroCopy,
    ];

    /// Parse the short names used on the command line and in the environment
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "copy" | "copy-based" | "not-zero-copy" => Some(BufferStrategy::CopyBased),
            "alloc-host" | "alloc-host-ptr" | "device-allocated" => {
                Some(BufferStrategy::DeviceAllocatedZeroCopy)
            }
            "use-host" | "use-host-ptr" | "host-allocated" => {
                Some(BufferStrategy::HostAllocatedZeroCopy)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BufferStrategy::CopyBased => "copy",
            BufferStrategy::DeviceAllocatedZeroCopy => "alloc-host",
            BufferStrategy::HostAllocatedZeroCopy => "use-host",
        }
    }

    pub fn is_zero_copy(&self) -> bool {
        !matches!(self, BufferStrategy::CopyBased)
    }
}

impl fmt::Display for BufferStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_str() {
        assert_eq!(BufferStrategy::from_str("copy"), Some(BufferStrategy::CopyBased));
        assert_eq!(
            BufferStrategy::from_str("ALLOC-HOST-PTR"),
            Some(BufferStrategy::DeviceAllocatedZeroCopy)
        );
        assert_eq!(
            BufferStrategy::from_str("use-host"),
            Some(BufferStrategy::HostAllocatedZeroCopy)
        );
        assert_eq!(BufferStrategy::from_str("mmap"), None);
    }

    #[test]
    fn test_display_parses_back() {
        for strategy in BufferStrategy::ALL {
            assert_eq!(BufferStrategy::from_str(&strategy.to_string()), Some(strategy));
        }
    }

    #[test]
    fn test_zero_copy_flag() {
        assert!(!BufferStrategy::CopyBased.is_zero_copy());
        assert!(BufferStrategy::DeviceAllocatedZeroCopy.is_zero_copy());
        assert!(BufferStrategy::HostAllocatedZeroCopy.is_zero_copy());
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&BufferStrategy::DeviceAllocatedZeroCopy).unwrap();
        assert_eq!(json, "\"device-allocated-zero-copy\"");
    }
}
