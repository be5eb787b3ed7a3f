//! Aligned region properties over arbitrary sizes and alignments

use hostforge::memory::round_up_to_multiple;
use hostforge::{allocate, free, AlignedRegion, ForgeError};
use proptest::prelude::*;

fn alignment_strategy() -> impl Strategy<Value = usize> {
    // 8 ..= 65536
    (3u32..=16).prop_map(|shift| 1usize << shift)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_base_is_aligned(size in 1usize..=1 << 20, alignment in alignment_strategy()) {
        let region = allocate(size, alignment).expect("allocate");
        prop_assert_eq!(region.addr() % alignment, 0);
        prop_assert_eq!(region.len(), size);
        prop_assert_eq!(region.alignment(), alignment);
        free(region).expect("free");
    }

    #[test]
    fn prop_first_and_last_byte_usable(size in 1usize..=1 << 16, alignment in alignment_strategy()) {
        let mut region = allocate(size, alignment).expect("allocate");
        {
            let bytes = region.as_mut_slice();
            bytes[0] = 0xA5;
            bytes[size - 1] = 0x5A;
        }
        prop_assert_eq!(region.as_slice()[0], if size == 1 { 0x5A } else { 0xA5 });
        prop_assert_eq!(region.as_slice()[size - 1], 0x5A);
        free(region).expect("free");
    }

    #[test]
    fn prop_memory_starts_zeroed(size in 1usize..=1 << 14, alignment in alignment_strategy()) {
        let region = allocate(size, alignment).expect("allocate");
        prop_assert!(region.as_slice().iter().all(|&b| b == 0));
        free(region).expect("free");
    }

    #[test]
    fn prop_round_up_is_idempotent(size in 1usize..=1 << 30, granularity in 1usize..=4096) {
        let once = round_up_to_multiple(size, granularity).expect("round");
        prop_assert!(once >= size);
        prop_assert!(once - size < granularity);
        prop_assert_eq!(once % granularity, 0);
        prop_assert_eq!(round_up_to_multiple(once, granularity).expect("round"), once);
    }

    #[test]
    fn prop_granular_region_covers_request(
        size in 1usize..=1 << 16,
        alignment in alignment_strategy(),
        granularity in prop::sample::select(vec![1usize, 16, 64, 128, 4096]),
    ) {
        let region = AlignedRegion::allocate_granular(size, alignment, granularity).expect("allocate");
        prop_assert_eq!(region.requested_len(), size);
        prop_assert_eq!(region.len() % granularity, 0);
        prop_assert!(region.len() >= size);
        prop_assert!(region.is_aligned_to(alignment));
        region.free().expect("free");
    }
}

#[test]
fn rejects_non_power_of_two_alignment() {
    for alignment in [0usize, 3, 12, 100, 4095] {
        match allocate(64, alignment) {
            Err(ForgeError::InvalidAlignment(_)) => {}
            other => panic!("alignment {} accepted: {:?}", alignment, other),
        }
    }
}

#[test]
fn rejects_zero_size() {
    assert!(matches!(allocate(0, 4096), Err(ForgeError::InvalidSize(_))));
}

#[test]
fn rejects_overflowing_request() {
    assert!(matches!(
        allocate(usize::MAX - 16, 4096),
        Err(ForgeError::InvalidSize(_))
    ));
}

#[test]
fn page_aligned_region_matches_reference_device() {
    let region = allocate(1 << 20, 4096).expect("allocate");
    assert_eq!(region.addr() % 4096, 0);
    assert_eq!(region.len(), 1 << 20);
    free(region).expect("free");
}
