//! `ComputeDevice` over the HIP runtime

use std::collections::{HashMap, VecDeque};
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;

use crate::backend::device::{
    check_transfer_range, AccessMode, BufferRequest, ComputeDevice, DeviceCaps, LaunchConfig,
    MapAccess, Placement, QueueTicket,
};
use crate::backend::hip_backend::event::HipEvent;
use crate::backend::hip_backend::ffi;
use crate::backend::hip_backend::memory::{HipBuffer, HipBufferKind};
use crate::backend::hip_backend::module::HipKernel;
use crate::backend::hip_backend::stream::HipStream;
use crate::error::{ForgeError, ForgeResult};
use crate::memory::AlignedRegion;

/// Result of the one `hipInit` call, reported to every device opened after it
static HIP_INIT: OnceCell<i32> = OnceCell::new();

/// Poll interval for timed waits
const POLL_INTERVAL: Duration = Duration::from_micros(50);

/// Staging copy backing a map of a device-local buffer
struct Staging {
    region: AlignedRegion,
    access: MapAccess,
    device_ptr: usize,
}

/// One HIP device with one stream
///
/// HIP does not expose an OpenCL-style base-address rule for registered host
/// memory, so the caps are supplied by the caller (page alignment is the safe
/// choice, see [`HipDevice::page_aligned_caps`]).
pub struct HipDevice {
    device_id: i32,
    caps: DeviceCaps,
    stream: HipStream,
    next_ticket: AtomicU64,
    /// Completion events of commands not yet known complete
    events: Mutex<VecDeque<(QueueTicket, HipEvent)>>,
    staging: Mutex<HashMap<usize, Staging>>,
}

impl std::fmt::Debug for HipDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HipDevice")
            .field("device_id", &self.device_id)
            .field("caps", &self.caps)
            .finish()
    }
}

impl HipDevice {
    /// Caps for page-granular host registration
    pub fn page_aligned_caps(device_id: i32) -> DeviceCaps {
        DeviceCaps {
            name: format!("HIP device {}", device_id),
            base_alignment: 4096,
            transfer_granularity: 4096,
            host_unified_memory: false,
        }
    }

    pub fn new(device_id: i32) -> ForgeResult<Self> {
        Self::with_caps(device_id, Self::page_aligned_caps(device_id))
    }

    pub fn with_caps(device_id: i32, caps: DeviceCaps) -> ForgeResult<Self> {
        caps.validate()?;

        let init_result = *HIP_INIT.get_or_init(|| unsafe { ffi::hipInit(0) });
        ffi::check(init_result, "hipInit")?;

        let mut count = 0i32;
        ffi::check(unsafe { ffi::hipGetDeviceCount(&mut count) }, "hipGetDeviceCount")?;
        if device_id < 0 || device_id >= count {
            return Err(ForgeError::DeviceNotFound(format!(
                "HIP device {} requested, {} available",
                device_id, count
            )));
        }
        ffi::check(unsafe { ffi::hipSetDevice(device_id) }, "hipSetDevice")?;

        let stream = HipStream::new()?;
        tracing::debug!("HipDevice::new: device {} ({} visible)", device_id, count);
        Ok(Self {
            device_id,
            caps,
            stream,
            next_ticket: AtomicU64::new(1),
            events: Mutex::new(VecDeque::new()),
            staging: Mutex::new(HashMap::new()),
        })
    }

    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    /// Drop events that have completed; returns the oldest pending ticket
    fn prune_events(&self) -> ForgeResult<Option<QueueTicket>> {
        let mut events = self.events.lock()?;
        while let Some((_, event)) = events.front() {
            if event.query()? {
                events.pop_front();
            } else {
                break;
            }
        }
        Ok(events.front().map(|(ticket, _)| *ticket))
    }

    fn wait_until(&self, ticket: QueueTicket, timeout: Option<Duration>, operation: &str) -> ForgeResult<()> {
        let Some(timeout) = timeout else {
            // Untimed: block on the stream
            self.stream.synchronize()?;
            self.events.lock()?.clear();
            return Ok(());
        };

        let deadline = Instant::now() + timeout;
        loop {
            match self.prune_events()? {
                Some(oldest) if oldest <= ticket => {}
                _ => return Ok(()),
            }
            if Instant::now() >= deadline {
                return Err(ForgeError::DeviceTimeout {
                    operation: operation.to_string(),
                    timeout,
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn last_ticket(&self) -> QueueTicket {
        QueueTicket(self.next_ticket.load(Ordering::SeqCst).saturating_sub(1))
    }
}

impl ComputeDevice for HipDevice {
    type Buffer = HipBuffer;
    type Kernel = HipKernel;

    fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    unsafe fn create_buffer(&self, request: &BufferRequest) -> ForgeResult<HipBuffer> {
        if request.size == 0 {
            return Err(ForgeError::InvalidSize(
                "device buffer size cannot be zero".to_string(),
            ));
        }
        match request.placement {
            Placement::UseHostPtr(ptr) => {
                HipBuffer::register(ptr.as_ptr() as *mut c_void, request.size, request.access)
            }
            Placement::AllocHostPtr => HipBuffer::host_mapped(request.size, request.access),
            Placement::DeviceLocal => HipBuffer::device_local(request.size, request.access),
        }
    }

    fn buffer_size(&self, buffer: &HipBuffer) -> usize {
        buffer.size()
    }

    fn backing_address(&self, buffer: &HipBuffer) -> Option<usize> {
        buffer.host_ptr().map(|p| p as usize)
    }

    fn enqueue_kernel(
        &self,
        kernel: &HipKernel,
        launch: &LaunchConfig,
        args: &[&HipBuffer],
    ) -> ForgeResult<QueueTicket> {
        let (grid, block) = launch_dims(launch, kernel.default_block())?;

        let mut device_ptrs: Vec<*mut c_void> = args.iter().map(|b| b.device_ptr()).collect();
        let mut params: Vec<*mut c_void> = device_ptrs
            .iter_mut()
            .map(|p| p as *mut *mut c_void as *mut c_void)
            .collect();

        ffi::check(
            unsafe {
                ffi::hipModuleLaunchKernel(
                    kernel.as_ptr(),
                    grid[0],
                    grid[1],
                    grid[2],
                    block[0],
                    block[1],
                    block[2],
                    0,
                    self.stream.as_ptr(),
                    params.as_mut_ptr(),
                    std::ptr::null_mut(),
                )
            },
            &format!("hipModuleLaunchKernel({})", kernel.name()),
        )?;

        let event = HipEvent::new()?;
        event.record(&self.stream)?;
        let ticket = QueueTicket(self.next_ticket.fetch_add(1, Ordering::SeqCst));
        self.events.lock()?.push_back((ticket, event));
        tracing::trace!("HipDevice::enqueue_kernel: '{}' as {}", kernel.name(), ticket);
        Ok(ticket)
    }

    fn wait(&self, ticket: QueueTicket, timeout: Option<Duration>) -> ForgeResult<()> {
        self.wait_until(ticket, timeout, &format!("wait for command {}", ticket))
    }

    fn finish(&self, timeout: Option<Duration>) -> ForgeResult<()> {
        self.wait_until(self.last_ticket(), timeout, "finish")
    }

    fn is_complete(&self, ticket: QueueTicket) -> bool {
        match self.prune_events() {
            Ok(Some(oldest)) => oldest > ticket,
            Ok(None) => true,
            Err(_) => false,
        }
    }

    fn map_buffer(
        &self,
        buffer: &HipBuffer,
        access: MapAccess,
        timeout: Option<Duration>,
    ) -> ForgeResult<NonNull<u8>> {
        self.finish(timeout)?;

        if let Some(host) = buffer.host_ptr().and_then(|p| NonNull::new(p as *mut u8)) {
            return Ok(host);
        }

        let mut region = AlignedRegion::allocate(buffer.size(), self.caps.base_alignment.max(8))?;
        buffer.copy_to_host(0, &mut region.as_mut_slice()[..buffer.size()])?;
        let ptr = region.base_ptr();
        self.staging.lock()?.insert(
            ptr.as_ptr() as usize,
            Staging {
                region,
                access,
                device_ptr: buffer.device_ptr() as usize,
            },
        );
        Ok(ptr)
    }

    unsafe fn unmap_buffer(&self, buffer: &HipBuffer, ptr: NonNull<u8>) -> ForgeResult<()> {
        if buffer.kind() != HipBufferKind::DeviceLocal {
            return Ok(());
        }
        let staging = self.staging.lock()?.remove(&(ptr.as_ptr() as usize));
        match staging {
            Some(staging) if staging.device_ptr == buffer.device_ptr() as usize => {
                if staging.access == MapAccess::Write {
                    buffer.copy_from_host(0, &staging.region.as_slice()[..buffer.size()])?;
                }
                Ok(())
            }
            _ => Err(ForgeError::DeviceResourceError(format!(
                "{:?} is not a mapping of this buffer",
                ptr
            ))),
        }
    }

    fn write_buffer(
        &self,
        buffer: &HipBuffer,
        offset: usize,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> ForgeResult<()> {
        check_transfer_range(buffer.size(), offset, data.len())?;
        self.finish(timeout)?;
        buffer.copy_from_host(offset, data)
    }

    fn read_buffer(
        &self,
        buffer: &HipBuffer,
        offset: usize,
        out: &mut [u8],
        timeout: Option<Duration>,
    ) -> ForgeResult<()> {
        check_transfer_range(buffer.size(), offset, out.len())?;
        self.finish(timeout)?;
        buffer.copy_to_host(offset, out)
    }
}

/// Grid (in blocks) and block (in threads) dimensions for a launch
fn launch_dims(launch: &LaunchConfig, default_block: u32) -> ForgeResult<([u32; 3], [u32; 3])> {
    let block = launch.local.unwrap_or([default_block as usize, 1, 1]);
    let mut grid = [0u32; 3];
    let mut block_dims = [0u32; 3];
    for axis in 0..3 {
        block_dims[axis] = u32::try_from(block[axis]).map_err(|_| {
            ForgeError::InvalidConfiguration(format!("block dimension {} too large: {}", axis, block[axis]))
        })?;
        let threads = block[axis].max(1);
        grid[axis] = u32::try_from(launch.global[axis].div_ceil(threads)).map_err(|_| {
            ForgeError::InvalidConfiguration(format!("grid dimension {} too large", axis))
        })?;
    }
    Ok((grid, block_dims))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_page_aligned_caps_are_valid() {
        let caps = HipDevice::page_aligned_caps(0);
        assert!(caps.validate().is_ok());
        assert_eq!(caps.base_alignment, 4096);
    }

    #[test]
    fn test_launch_dims_round_up_the_grid() {
        let (grid, block) = launch_dims(&LaunchConfig::linear(1000), 256).unwrap();
        assert_eq!(grid, [4, 1, 1]);
        assert_eq!(block, [256, 1, 1]);
    }

    #[test]
    fn test_oversized_block_rejected() {
        let launch = LaunchConfig {
            global: [64, 1, 1],
            local: Some([64, 1, u32::MAX as usize + 1]),
        };
        assert!(matches!(
            launch_dims(&launch, 256),
            Err(ForgeError::InvalidConfiguration(_))
        ));
    }

    #[test]
    #[serial]
    fn test_missing_device_reported() {
        match HipDevice::new(i32::MAX) {
            Err(ForgeError::DeviceNotFound(_)) | Err(ForgeError::DeviceResourceError(_)) => {}
            other => panic!("expected a device error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    #[serial]
    fn test_device_local_round_trip() {
        let Ok(device) = HipDevice::new(0) else {
            eprintln!("no HIP device; skipping");
            return;
        };
        let request = BufferRequest {
            size: 256,
            access: AccessMode::ReadWrite,
            placement: Placement::DeviceLocal,
        };
        let buffer = unsafe { device.create_buffer(&request) }.unwrap();
        let data: Vec<u8> = (0..=255).collect();
        device.write_buffer(&buffer, 0, &data, Some(Duration::from_secs(5))).unwrap();
        let mut out = vec![0u8; 256];
        device.read_buffer(&buffer, 0, &mut out, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(out, data);
    }
}
