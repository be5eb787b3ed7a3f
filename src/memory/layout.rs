//! Size and stride arithmetic for device-conformant host buffers
//!
//! Everything here is a pure function of the numbers it is given. Device
//! rules (base alignment, transfer granularity) arrive through
//! [`DeviceCaps`]; nothing in this module hard-codes a device's zero-copy rule.

use crate::backend::device::{ComputeDevice, DeviceCaps};
use crate::error::{ForgeError, ForgeResult};
use crate::memory::aligned::{validate_alignment, MIN_ALIGNMENT};

/// Round `offset` up to the next multiple of a power-of-two `alignment`
///
/// `alignment` must already be validated. Use [`round_up_to_multiple`] for
/// untrusted sizes, it checks for overflow.
#[inline]
pub fn align_up(offset: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (offset + alignment - 1) & !(alignment - 1)
}

/// Round `size` up to a multiple of `granularity`
///
/// Granularities are not required to be powers of two. The result is
/// idempotent and never smaller than `size`.
pub fn round_up_to_multiple(size: usize, granularity: usize) -> ForgeResult<usize> {
    if granularity == 0 {
        return Err(ForgeError::InvalidSize(
            "size granularity cannot be zero".to_string(),
        ));
    }
    let remainder = size % granularity;
    if remainder == 0 {
        return Ok(size);
    }
    size.checked_add(granularity - remainder).ok_or_else(|| {
        ForgeError::InvalidSize(format!(
            "{} bytes rounded to granularity {} overflows",
            size, granularity
        ))
    })
}

/// Alignment a host region must have to be imported by `device`
///
/// Never below the platform pointer size, since the allocation stash lives
/// in front of the aligned base.
pub fn required_alignment<D: ComputeDevice + ?Sized>(device: &D) -> ForgeResult<usize> {
    let caps = device.caps();
    caps.validate()?;
    Ok(caps.base_alignment.max(MIN_ALIGNMENT))
}

/// `size` rounded up to `device`'s transfer granularity
pub fn required_size_granularity<D: ComputeDevice + ?Sized>(
    size: usize,
    device: &D,
) -> ForgeResult<usize> {
    let caps = device.caps();
    caps.validate()?;
    round_up_to_multiple(size, caps.transfer_granularity)
}

/// Whether an address/size pair satisfies the device's zero-copy rule
///
/// The address must be a multiple of the base alignment and the size a
/// non-zero multiple of the transfer granularity. Caps that fail validation
/// never admit zero copy.
pub fn is_zero_copy_eligible(addr: usize, size: usize, caps: &DeviceCaps) -> bool {
    if caps.validate().is_err() || size == 0 {
        return false;
    }
    addr % caps.base_alignment == 0 && size % caps.transfer_granularity == 0
}

/// Aligned row stride for a row-major 2-D operand
///
/// Each row of `row_bytes` starts on an `alignment` boundary, so the stride
/// is `row_bytes` rounded up to `alignment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowPitch {
    rows: usize,
    row_bytes: usize,
    pitch: usize,
}

impl RowPitch {
    /// Compute the pitch for `rows` rows of `row_bytes` bytes each
    ///
    /// `alignment` must be a power of two no smaller than the pointer size.
    pub fn new(rows: usize, row_bytes: usize, alignment: usize) -> ForgeResult<Self> {
        validate_alignment(alignment)?;
        if rows == 0 || row_bytes == 0 {
            return Err(ForgeError::InvalidSize(format!(
                "row layout needs non-zero dimensions, got {} rows of {} bytes",
                rows, row_bytes
            )));
        }
        let pitch = row_bytes
            .checked_add(alignment - 1)
            .map(|padded| padded & !(alignment - 1))
            .ok_or_else(|| {
                ForgeError::InvalidSize(format!("row of {} bytes overflows when aligned", row_bytes))
            })?;
        pitch.checked_mul(rows).ok_or_else(|| {
            ForgeError::InvalidSize(format!("{} rows of pitch {} overflow", rows, pitch))
        })?;

        Ok(Self {
            rows,
            row_bytes,
            pitch,
        })
    }

    /// Pitch for `rows` rows of `cols` elements of `T`
    pub fn for_elements<T>(rows: usize, cols: usize, alignment: usize) -> ForgeResult<Self> {
        let row_bytes = cols.checked_mul(std::mem::size_of::<T>()).ok_or_else(|| {
            ForgeError::InvalidSize(format!("{} columns overflow a row", cols))
        })?;
        if alignment < std::mem::size_of::<T>() {
            return Err(ForgeError::InvalidAlignment(format!(
                "row alignment {} is smaller than the element size {}",
                alignment,
                std::mem::size_of::<T>()
            )));
        }
        Self::new(rows, row_bytes, alignment)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn row_bytes(&self) -> usize {
        self.row_bytes
    }

    /// Bytes between the starts of consecutive rows
    pub fn pitch(&self) -> usize {
        self.pitch
    }

    /// Total bytes covering all rows, padding included
    pub fn total_bytes(&self) -> usize {
        self.pitch * self.rows
    }

    /// Byte offset of the first byte of `row`
    pub fn row_offset(&self, row: usize) -> Option<usize> {
        (row < self.rows).then(|| row * self.pitch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(alignment: usize, granularity: usize) -> DeviceCaps {
        DeviceCaps {
            name: "test".to_string(),
            base_alignment: alignment,
            transfer_granularity: granularity,
            host_unified_memory: true,
        }
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
    }

    #[test]
    fn test_round_up_to_multiple() {
        assert_eq!(round_up_to_multiple(100, 64).unwrap(), 128);
        assert_eq!(round_up_to_multiple(128, 64).unwrap(), 128);
        assert_eq!(round_up_to_multiple(0, 64).unwrap(), 0);
        // Non power-of-two granularity
        assert_eq!(round_up_to_multiple(10, 3).unwrap(), 12);
    }

    #[test]
    fn test_round_up_rejects_zero_granularity() {
        assert!(round_up_to_multiple(10, 0).is_err());
    }

    #[test]
    fn test_round_up_overflow() {
        let err = round_up_to_multiple(usize::MAX, 64).unwrap_err();
        assert!(matches!(err, ForgeError::InvalidSize(_)));
    }

    #[test]
    fn test_zero_copy_eligibility() {
        let caps = caps(4096, 64);
        assert!(is_zero_copy_eligible(0x10000, 128, &caps));
        assert!(!is_zero_copy_eligible(0x10040, 128, &caps));
        assert!(!is_zero_copy_eligible(0x10000, 100, &caps));
        assert!(!is_zero_copy_eligible(0x10000, 0, &caps));
    }

    #[test]
    fn test_eligibility_with_invalid_caps() {
        assert!(!is_zero_copy_eligible(0x10000, 128, &caps(3000, 64)));
        assert!(!is_zero_copy_eligible(0x10000, 128, &caps(4096, 0)));
    }

    #[test]
    fn test_row_pitch() {
        // 3 f32 columns padded to 16 bytes
        let pitch = RowPitch::for_elements::<f32>(4, 3, 16).unwrap();
        assert_eq!(pitch.row_bytes(), 12);
        assert_eq!(pitch.pitch(), 16);
        assert_eq!(pitch.total_bytes(), 64);
        assert_eq!(pitch.row_offset(3), Some(48));
        assert_eq!(pitch.row_offset(4), None);
    }

    #[test]
    fn test_row_pitch_exact_fit() {
        let pitch = RowPitch::new(2, 256, 64).unwrap();
        assert_eq!(pitch.pitch(), 256);
        assert_eq!(pitch.total_bytes(), 512);
    }

    #[test]
    fn test_row_pitch_rejects_bad_alignment() {
        assert!(matches!(
            RowPitch::new(2, 10, 12),
            Err(ForgeError::InvalidAlignment(_))
        ));
    }

    #[test]
    fn test_row_pitch_rejects_alignment_below_element() {
        assert!(matches!(
            RowPitch::for_elements::<[u64; 4]>(2, 2, 16),
            Err(ForgeError::InvalidAlignment(_))
        ));
    }

    #[test]
    fn test_row_pitch_overflow() {
        assert!(RowPitch::new(usize::MAX / 2, 4096, 4096).is_err());
    }
}
