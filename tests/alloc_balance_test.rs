//! Every aligned region is released exactly once
//!
//! A counting global allocator tracks allocations of one marker size that
//! only the regions in this test produce, so unrelated allocations from the
//! harness or the queue thread do not disturb the counts.

mod common;

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::{context, TIMEOUT};
use hostforge::backend::host::kernels;
use hostforge::{
    AccessMode, BufferStrategy, ComputeDevice, HostDeviceOptions, KernelArg, LaunchConfig,
    ZeroCopyConfig,
};

/// Multiple of the 64-byte granularity no other allocation in this test uses
const REGION_SIZE: usize = 64 * 12_345;
const ALIGNMENT: usize = 4096;
const MARKER: usize = REGION_SIZE + ALIGNMENT - 1 + std::mem::size_of::<usize>();

struct CountingAllocator;

static MARKED_ALLOCS: AtomicUsize = AtomicUsize::new(0);
static MARKED_FREES: AtomicUsize = AtomicUsize::new(0);

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.size() == MARKER {
            MARKED_ALLOCS.fetch_add(1, Ordering::SeqCst);
        }
        System.alloc(layout)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.size() == MARKER {
            MARKED_ALLOCS.fetch_add(1, Ordering::SeqCst);
        }
        System.alloc_zeroed(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.size() == MARKER {
            MARKED_FREES.fetch_add(1, Ordering::SeqCst);
        }
        System.dealloc(ptr, layout)
    }
}

#[global_allocator]
static GLOBAL: CountingAllocator = CountingAllocator;

fn counts() -> (usize, usize) {
    (
        MARKED_ALLOCS.load(Ordering::SeqCst),
        MARKED_FREES.load(Ordering::SeqCst),
    )
}

#[test]
fn regions_are_freed_exactly_once() {
    let ctx = context(HostDeviceOptions::default(), ZeroCopyConfig::default());
    let increment = kernels::increment_u32();

    // Plain allocate / free
    for _ in 0..8 {
        let region = ctx.allocate(REGION_SIZE).expect("allocate");
        ctx.free(region).expect("free");
    }

    // Dropped without being freed explicitly
    drop(ctx.allocate(REGION_SIZE).expect("allocate"));

    // Zero-copy bindings with device work, released by drop
    for strategy in BufferStrategy::ALL {
        let binding = ctx
            .create_buffer(strategy, REGION_SIZE, AccessMode::ReadWrite)
            .expect("create");
        let ticket = ctx
            .enqueue(
                &increment,
                &LaunchConfig::linear(REGION_SIZE / 4),
                &[KernelArg::ReadWrite(&binding)],
            )
            .expect("enqueue");
        ctx.wait(ticket).expect("wait");
        let session = ctx.map_for_read(&binding).expect("map");
        assert_eq!(session.as_slice_of::<u32>().expect("u32 view")[0], 1);
        ctx.unmap(session).expect("unmap");
    }

    // Region handed back by unbind and freed by the caller
    let region = ctx.allocate(REGION_SIZE).expect("allocate");
    let binding = ctx
        .create_zero_copy_buffer(region, AccessMode::ReadWrite)
        .expect("import");
    let region = binding.unbind().expect("unbind").expect("owned region");
    ctx.free(region).expect("free");

    // Region returned inside a failed import
    let copying = context(
        HostDeviceOptions::default().with_honor_host_ptr(false),
        ZeroCopyConfig::default().with_fallback_to_copy(false),
    );
    let region = copying.allocate(REGION_SIZE).expect("allocate");
    let err = copying
        .create_zero_copy_buffer(region, AccessMode::ReadWrite)
        .expect_err("driver copies");
    copying.free(err.into_region()).expect("free");

    // Fallback path: the copy-based buffer is filled from the region, which is
    // then freed
    let fallback = context(
        HostDeviceOptions::default().with_honor_host_ptr(false),
        ZeroCopyConfig::default(),
    );
    let binding = fallback
        .create_buffer(BufferStrategy::HostAllocatedZeroCopy, REGION_SIZE, AccessMode::ReadWrite)
        .expect("fallback");
    assert_eq!(binding.strategy(), BufferStrategy::CopyBased);
    drop(binding);

    let (allocs, frees) = counts();
    assert!(allocs > 0, "marker size never allocated");
    assert_eq!(allocs, frees, "aligned regions leaked or double freed");

    // A binding whose work outlives the wait bound is leaked, not freed
    let slow = context(
        HostDeviceOptions::default().with_kernel_latency(Duration::from_millis(400)),
        ZeroCopyConfig::default(),
    );
    let slow = hostforge::ZeroCopyContext::with_shared_device(
        slow.device().clone(),
        slow.config().clone().with_wait_timeout(Some(Duration::from_millis(20))),
    )
    .expect("context");
    let binding = slow
        .create_buffer(BufferStrategy::HostAllocatedZeroCopy, REGION_SIZE, AccessMode::ReadWrite)
        .expect("create");
    slow.enqueue(
        &increment,
        &LaunchConfig::linear(REGION_SIZE / 4),
        &[KernelArg::ReadWrite(&binding)],
    )
    .expect("enqueue");
    drop(binding);
    slow.device().finish(Some(TIMEOUT)).expect("finish");

    let (allocs, frees) = counts();
    assert_eq!(allocs, frees + 1, "pending region should have been leaked");
}
