//! Zero copy against a real HIP device (requires `--features rocm` and a GPU)

#![cfg(feature = "rocm")]

mod common;

use common::{serial, HIP_FIXTURE};
use hostforge::{AccessMode, BufferStrategy, ZeroCopyConfig, ZeroCopyContext};

fn hip_context() -> Option<ZeroCopyContext<hostforge::backend::HipDevice>> {
    let device = HIP_FIXTURE.as_ref()?;
    Some(
        ZeroCopyContext::with_shared_device(device.clone(), ZeroCopyConfig::default())
            .expect("Failed to create HIP context"),
    )
}

#[test]
#[serial]
fn registered_region_maps_in_place() {
    let Some(ctx) = hip_context() else { return };
    let mut region = ctx.allocate(1 << 20).unwrap();
    region.as_mut_slice().fill(0x11);
    let base = region.addr();

    let binding = ctx
        .create_zero_copy_buffer(region, AccessMode::ReadWrite)
        .expect("hipHostRegister of a page-aligned region");
    assert!(binding.is_zero_copy());

    let session = ctx.map_for_read(&binding).unwrap();
    assert_eq!(session.addr(), base);
    assert!(session.as_slice().iter().all(|&b| b == 0x11));
}

#[test]
#[serial]
fn every_strategy_round_trips() {
    let Some(ctx) = hip_context() else { return };
    for strategy in BufferStrategy::ALL {
        let binding = ctx.create_buffer(strategy, 8192, AccessMode::ReadWrite).unwrap();
        {
            let mut session = ctx.map_for_write(&binding).unwrap();
            session.as_mut_slice().unwrap().fill(strategy as u8 + 1);
        }
        let mut out = vec![0u8; 8192];
        binding.read_into(&mut out).unwrap();
        assert!(out.iter().all(|&b| b == strategy as u8 + 1), "strategy {}", strategy);
    }
}
