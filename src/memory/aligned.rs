//! Aligned host allocations for zero-copy import
//!
//! A region is carved out of a larger block from the global allocator. The
//! block is over-allocated by `alignment - 1 + size_of::<usize>()` bytes so an
//! aligned base address always fits with room for a pointer-sized stash in
//! front of it. The stash holds the address of the original block; `free`
//! reads it back and checks it against the owned back-pointer before
//! releasing the block.
//!
//! ```text
//!  raw                stash      base (multiple of alignment)
//!   |<-- padding -->|<-usize->|<------------- len ------------->|
//! ```

use std::alloc::{self, Layout};
use std::fmt;
use std::mem::{self, ManuallyDrop};
use std::ptr::NonNull;

use crate::error::{ForgeError, ForgeResult};

/// Bytes reserved in front of the aligned base for the original address
pub const STASH_SIZE: usize = mem::size_of::<usize>();

/// Smallest alignment `allocate` accepts (the stash must be addressable)
pub const MIN_ALIGNMENT: usize = mem::size_of::<usize>();

/// Owned, aligned block of host memory
///
/// The only way to obtain one is [`AlignedRegion::allocate`] (or the free
/// function [`allocate`]), and it is released exactly once, either by
/// [`AlignedRegion::free`] or on drop. Freeing memory that did not come from
/// `allocate` is a precondition violation the type system rules out.
pub struct AlignedRegion {
    /// Aligned base handed to callers and devices
    base: NonNull<u8>,
    /// Usable bytes starting at `base`
    len: usize,
    /// Bytes the caller asked for (`<= len`)
    requested: usize,
    /// Alignment `base` satisfies
    alignment: usize,
    /// Original block from the global allocator
    raw: NonNull<u8>,
    raw_layout: Layout,
}

// SAFETY: AlignedRegion uniquely owns its block; shared references only hand
// out `&[u8]`, mutation requires `&mut self`.
unsafe impl Send for AlignedRegion {}
unsafe impl Sync for AlignedRegion {}

impl AlignedRegion {
    /// Allocate `size` zeroed bytes whose base is a multiple of `alignment`
    ///
    /// # Errors
    /// - `InvalidAlignment` if `alignment` is not a power of two or is smaller
    ///   than the platform pointer size
    /// - `InvalidSize` if `size` is zero or the padded size overflows
    /// - `OutOfMemory` if the global allocator fails
    pub fn allocate(size: usize, alignment: usize) -> ForgeResult<Self> {
        Self::allocate_padded(size, size, alignment)
    }

    /// Allocate with a usable length rounded up to a multiple of `granularity`
    ///
    /// The region reports `requested_len() == size` and
    /// `len() == size` rounded up to the granularity.
    pub fn allocate_granular(size: usize, alignment: usize, granularity: usize) -> ForgeResult<Self> {
        let usable = crate::memory::layout::round_up_to_multiple(size, granularity)?;
        Self::allocate_padded(size, usable, alignment)
    }

    fn allocate_padded(requested: usize, usable: usize, alignment: usize) -> ForgeResult<Self> {
        validate_alignment(alignment)?;

        if requested == 0 {
            return Err(ForgeError::InvalidSize(
                "Allocation size cannot be zero".to_string(),
            ));
        }
        debug_assert!(usable >= requested);

        let padding = alignment - 1 + STASH_SIZE;
        let total = usable.checked_add(padding).ok_or_else(|| {
            ForgeError::InvalidSize(format!(
                "Allocation of {} bytes with alignment {} overflows",
                usable, alignment
            ))
        })?;
        let raw_layout = Layout::from_size_align(total, mem::align_of::<usize>()).map_err(|e| {
            ForgeError::InvalidSize(format!("Allocation of {} bytes rejected: {}", total, e))
        })?;

        // SAFETY: raw_layout has non-zero size
        let raw = unsafe { alloc::alloc_zeroed(raw_layout) };
        let raw = NonNull::new(raw).ok_or_else(|| {
            tracing::error!("Host allocator failed for {} bytes", total);
            ForgeError::OutOfMemory { requested: total }
        })?;

        let raw_addr = raw.as_ptr() as usize;
        let base_addr = (raw_addr + padding) & !(alignment - 1);
        let shift = base_addr - raw_addr;

        // base_addr >= raw_addr + STASH_SIZE, and base + usable stays inside
        // the block because shift <= padding.
        debug_assert!(shift >= STASH_SIZE && shift <= padding);

        // SAFETY: shift + usable <= total, so both pointers are in bounds of
        // the block; the stash slot lies entirely before `base`.
        let base = unsafe {
            let base = raw.as_ptr().add(shift);
            base.sub(STASH_SIZE).cast::<usize>().write_unaligned(raw_addr);
            NonNull::new_unchecked(base)
        };

        tracing::trace!(
            "AlignedRegion::allocate: {} bytes (usable {}) at {:#x}, alignment {}, block {:#x}+{}",
            requested,
            usable,
            base_addr,
            alignment,
            raw_addr,
            total
        );

        Ok(Self {
            base,
            len: usable,
            requested,
            alignment,
            raw,
            raw_layout,
        })
    }

    /// Release the region, verifying the stashed original address first
    ///
    /// The block is released even when the stash was overwritten (the owned
    /// back-pointer is authoritative), but the corruption is reported as
    /// `InvalidAlignment` since something wrote in front of the region.
    pub fn free(self) -> ForgeResult<()> {
        let this = ManuallyDrop::new(self);
        let recovered = this.stashed_address();
        // SAFETY: `this` is never used again and Drop will not run
        unsafe { this.release() };

        if recovered != this.raw.as_ptr() as usize {
            return Err(ForgeError::InvalidAlignment(format!(
                "allocation stash in front of {:#x} was overwritten (found {:#x}, expected {:#x})",
                this.base.as_ptr() as usize,
                recovered,
                this.raw.as_ptr() as usize
            )));
        }
        Ok(())
    }

    fn stashed_address(&self) -> usize {
        // SAFETY: the stash slot was written in allocate and lies inside the block
        unsafe { self.base.as_ptr().sub(STASH_SIZE).cast::<usize>().read_unaligned() }
    }

    /// # Safety
    /// Must be called at most once, and the region must not be used afterwards.
    unsafe fn release(&self) {
        tracing::trace!(
            "AlignedRegion::free: {:#x} ({} bytes)",
            self.base.as_ptr() as usize,
            self.len
        );
        alloc::dealloc(self.raw.as_ptr(), self.raw_layout);
    }

    /// Aligned base address as an integer
    pub fn addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Aligned base pointer (for device import)
    pub fn base_ptr(&self) -> NonNull<u8> {
        self.base
    }

    /// Read-only raw pointer to the first usable byte
    pub fn as_ptr(&self) -> *const u8 {
        self.base.as_ptr()
    }

    /// Mutable raw pointer to the first usable byte
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Usable size in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Regions are never empty; present for API symmetry with slices
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size originally requested by the caller
    pub fn requested_len(&self) -> usize {
        self.requested
    }

    /// Alignment the base satisfies
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// View the usable bytes
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: base..base+len is inside the owned, zero-initialised block
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.len) }
    }

    /// Mutably view the usable bytes
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusivity
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr(), self.len) }
    }

    /// View the usable bytes as plain-old-data elements
    pub fn as_slice_of<T: bytemuck::Pod>(&self) -> ForgeResult<&[T]> {
        bytemuck::try_cast_slice(self.as_slice())
            .map_err(|e| ForgeError::InvalidSize(format!("cannot view region as elements: {}", e)))
    }

    /// Mutably view the usable bytes as plain-old-data elements
    pub fn as_mut_slice_of<T: bytemuck::Pod>(&mut self) -> ForgeResult<&mut [T]> {
        bytemuck::try_cast_slice_mut(self.as_mut_slice())
            .map_err(|e| ForgeError::InvalidSize(format!("cannot view region as elements: {}", e)))
    }

    /// Whether `addr` satisfies this region's alignment
    pub fn is_aligned_to(&self, alignment: usize) -> bool {
        alignment != 0 && self.addr() % alignment == 0
    }
}

impl Drop for AlignedRegion {
    fn drop(&mut self) {
        if self.stashed_address() != self.raw.as_ptr() as usize {
            tracing::error!(
                "AlignedRegion::drop: allocation stash in front of {:#x} was overwritten",
                self.addr()
            );
        }
        // SAFETY: drop runs once and the region is gone afterwards
        unsafe { self.release() };
    }
}

impl fmt::Debug for AlignedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedRegion")
            .field("base", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len)
            .field("requested", &self.requested)
            .field("alignment", &self.alignment)
            .finish()
    }
}

/// Check the `allocate` alignment precondition
pub fn validate_alignment(alignment: usize) -> ForgeResult<()> {
    if !alignment.is_power_of_two() {
        return Err(ForgeError::InvalidAlignment(format!(
            "alignment must be a power of two, got {}",
            alignment
        )));
    }
    if alignment < MIN_ALIGNMENT {
        return Err(ForgeError::InvalidAlignment(format!(
            "alignment must be at least the pointer size ({}), got {}",
            MIN_ALIGNMENT, alignment
        )));
    }
    Ok(())
}

/// Allocate an aligned region (see [`AlignedRegion::allocate`])
pub fn allocate(size: usize, alignment: usize) -> ForgeResult<AlignedRegion> {
    AlignedRegion::allocate(size, alignment)
}

/// Release a region produced by [`allocate`] (see [`AlignedRegion::free`])
pub fn free(region: AlignedRegion) -> ForgeResult<()> {
    region.free()
}
