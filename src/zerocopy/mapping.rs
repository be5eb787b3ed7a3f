//! Host mapping discipline
//!
//! A binding is either unmapped (device work may be enqueued on it) or mapped
//! by exactly one [`MappingSession`] (the host may touch its memory, the
//! device may not be handed it). Sessions unmap on drop, so every open is
//! paired with a close even on early return.
//!
//! ```text
//! Unmapped --map_for_read--> MappedRead  --unmap--> Unmapped
//! Unmapped --map_for_write-> MappedWrite --unmap--> Unmapped
//! ```
//!
//! A failed unmap leaves the binding in its mapped state: the device may
//! still hold the mapping, so the buffer is never handed to a kernel again.

use std::fmt;
use std::ptr::NonNull;

use crate::backend::device::{AccessMode, ComputeDevice, MapAccess};
use crate::error::{ForgeError, ForgeResult};
use crate::zerocopy::binding::DeviceBufferBinding;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapState {
    Unmapped,
    MappedRead,
    MappedWrite,
}

impl fmt::Display for MapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapState::Unmapped => write!(f, "unmapped"),
            MapState::MappedRead => write!(f, "mapped for read"),
            MapState::MappedWrite => write!(f, "mapped for write"),
        }
    }
}

/// Scoped host access to a binding's memory
///
/// Borrowing the binding keeps it alive for the session. The session is not
/// `Send`: it must be closed on the thread that opened it.
pub struct MappingSession<'a, D: ComputeDevice> {
    binding: &'a DeviceBufferBinding<D>,
    ptr: NonNull<u8>,
    len: usize,
    access: MapAccess,
    open: bool,
}

impl<'a, D: ComputeDevice> MappingSession<'a, D> {
    pub fn access(&self) -> MapAccess {
        self.access
    }

    /// Host address of the mapping
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the device guarantees ptr..ptr+len is mapped until unmap,
        // and no device work touches it while the session is open.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Mutable bytes; only for sessions opened with `map_for_write`
    pub fn as_mut_slice(&mut self) -> ForgeResult<&mut [u8]> {
        if self.access != MapAccess::Write {
            return Err(ForgeError::AccessViolation(
                "mapping was opened for read; writes need map_for_write".to_string(),
            ));
        }
        // SAFETY: as in as_slice, and `&mut self` makes the view unique
        Ok(unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) })
    }

    /// The mapping viewed as plain-old-data elements
    pub fn as_slice_of<T: bytemuck::Pod>(&self) -> ForgeResult<&[T]> {
        bytemuck::try_cast_slice(self.as_slice())
            .map_err(|e| ForgeError::InvalidSize(format!("cannot view mapping as elements: {}", e)))
    }

    pub fn as_mut_slice_of<T: bytemuck::Pod>(&mut self) -> ForgeResult<&mut [T]> {
        bytemuck::try_cast_slice_mut(self.as_mut_slice()?)
            .map_err(|e| ForgeError::InvalidSize(format!("cannot view mapping as elements: {}", e)))
    }

    /// Close the session, reporting device errors
    pub fn unmap(mut self) -> ForgeResult<()> {
        self.close()
    }

    fn close(&mut self) -> ForgeResult<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        // SAFETY: ptr came from map_buffer on this buffer and is unmapped once;
        // the borrow of `self` ends every slice handed out.
        unsafe { self.binding.device.unmap_buffer(self.binding.buffer(), self.ptr) }.map_err(|e| {
            tracing::error!(
                "MappingSession: unmap of {:#x} failed, binding stays {}: {}",
                self.addr(),
                self.binding.map_state.get(),
                e
            );
            e
        })?;
        self.binding.map_state.set(MapState::Unmapped);
        tracing::trace!("MappingSession: unmapped {:#x}", self.addr());
        Ok(())
    }
}

impl<D: ComputeDevice> Drop for MappingSession<'_, D> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!("MappingSession::drop: unmap failed: {}", e);
        }
    }
}

impl<D: ComputeDevice> fmt::Debug for MappingSession<'_, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingSession")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len)
            .field("access", &self.access)
            .finish()
    }
}

impl<D: ComputeDevice> DeviceBufferBinding<D> {
    /// Open a read mapping once every pending writer has completed
    ///
    /// # Errors
    /// - `MapStateViolation` if a session is already open
    /// - `DeviceTimeout` if pending writes do not finish in time
    /// - `DeviceResourceError` if the last device write failed
    /// - `NotZeroCopy` if a zero-copy binding maps somewhere other than its
    ///   shared address (the binding is marked as not zero copy)
    pub fn map_for_read(&self) -> ForgeResult<MappingSession<'_, D>> {
        self.map(MapAccess::Read)
    }

    /// Open a write mapping once every pending use has completed
    ///
    /// # Errors
    /// - `AccessViolation` on a `ReadOnly` binding
    /// - otherwise as [`map_for_read`](Self::map_for_read), except that a
    ///   failed device write is not an error: the host replaces the contents
    pub fn map_for_write(&self) -> ForgeResult<MappingSession<'_, D>> {
        self.map(MapAccess::Write)
    }

    fn map(&self, access: MapAccess) -> ForgeResult<MappingSession<'_, D>> {
        let state = self.map_state.get();
        if state != MapState::Unmapped {
            return Err(crate::map_state_error!(
                "cannot map for {} while the binding is {}",
                access,
                state
            ));
        }

        if access == MapAccess::Write && self.access() == AccessMode::ReadOnly {
            return Err(ForgeError::AccessViolation(
                "cannot map a read-only binding for write".to_string(),
            ));
        }

        // Host reads must see completed device writes; host writes must not
        // race device reads either.
        match access {
            MapAccess::Read => self.wait_until_readable()?,
            MapAccess::Write => self.wait_until_idle()?,
        }

        let ptr = self
            .device
            .map_buffer(self.buffer(), access, self.config.wait_timeout)?;
        let addr = ptr.as_ptr() as usize;

        if self.is_zero_copy() && self.config.verify_mapped_pointer {
            if let Some(expected) = self.host_address() {
                if addr != expected {
                    // SAFETY: ptr was just returned by map_buffer and no slice exists
                    if let Err(e) = unsafe { self.device.unmap_buffer(self.buffer(), ptr) } {
                        tracing::error!("DeviceBufferBinding::map: unmap after mismatch failed: {}", e);
                    }
                    self.mark_not_zero_copy();
                    tracing::warn!(
                        "Zero copy lost: mapping returned {:#x}, expected {:#x}",
                        addr,
                        expected
                    );
                    return Err(ForgeError::NotZeroCopy {
                        expected,
                        actual: Some(addr),
                    });
                }
            }
        }

        self.map_state.set(match access {
            MapAccess::Read => MapState::MappedRead,
            MapAccess::Write => MapState::MappedWrite,
        });
        if access == MapAccess::Write {
            self.failed_write.set(None);
        }
        tracing::trace!("DeviceBufferBinding::map: {} at {:#x}", access, addr);

        Ok(MappingSession {
            binding: self,
            ptr,
            len: self.size(),
            access,
            open: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::HostDevice;
    use crate::config::ZeroCopyConfig;
    use crate::zerocopy::{BufferStrategy, ZeroCopyContext};

    fn context() -> ZeroCopyContext<HostDevice> {
        ZeroCopyContext::new(HostDevice::new().unwrap(), ZeroCopyConfig::default()).unwrap()
    }

    #[test]
    fn test_failed_unmap_keeps_binding_mapped() {
        let ctx = context();
        let binding = ctx
            .create_buffer(BufferStrategy::CopyBased, 64, AccessMode::ReadWrite)
            .unwrap();
        let session = binding.map_for_write().unwrap();

        // Release the mapping behind the session's back
        unsafe { binding.device.unmap_buffer(binding.buffer(), session.ptr) }.unwrap();

        assert!(matches!(session.unmap(), Err(ForgeError::DeviceResourceError(_))));
        assert_eq!(binding.map_state(), MapState::MappedWrite);
        assert!(matches!(
            binding.map_for_read(),
            Err(ForgeError::MapStateViolation(_))
        ));
    }

    #[test]
    fn test_successful_unmap_resets_state() {
        let ctx = context();
        let binding = ctx
            .create_buffer(BufferStrategy::HostAllocatedZeroCopy, 64, AccessMode::ReadWrite)
            .unwrap();
        let session = binding.map_for_read().unwrap();
        assert_eq!(binding.map_state(), MapState::MappedRead);
        session.unmap().unwrap();
        assert_eq!(binding.map_state(), MapState::Unmapped);
    }

    #[test]
    fn test_read_only_binding_rejects_write_map() {
        let ctx = context();
        let binding = ctx
            .create_buffer(BufferStrategy::HostAllocatedZeroCopy, 64, AccessMode::ReadOnly)
            .unwrap();
        assert!(matches!(
            binding.map_for_write(),
            Err(ForgeError::AccessViolation(_))
        ));
        assert_eq!(binding.map_state(), MapState::Unmapped);
        assert_eq!(binding.map_for_read().unwrap().access(), MapAccess::Read);
    }
}
