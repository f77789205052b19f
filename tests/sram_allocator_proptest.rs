//! Property-based tests for the SRAM allocator.
//!
//! For arbitrary allocate/free sequences:
//! - live allocations never overlap and stay inside the capacity
//! - free capacity plus allocated bytes always equals the capacity
//! - freeing everything restores a single free span

use npupass::core::{AllocationPreference, SramAllocator};
use proptest::prelude::*;

const CAPACITY: u32 = 4096;

#[derive(Debug, Clone)]
enum Op {
    Allocate(u32, AllocationPreference),
    /// Free the n-th live allocation, modulo the live count.
    Free(usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..1500u32, prop_oneof![Just(AllocationPreference::Start), Just(AllocationPreference::End)])
            .prop_map(|(size, preference)| Op::Allocate(size, preference)),
        any::<usize>().prop_map(Op::Free),
    ]
}

proptest! {
    #[test]
    fn prop_allocations_never_overlap(ops in prop::collection::vec(arb_op(), 1..64)) {
        let mut sram = SramAllocator::new(CAPACITY);

        for op in ops {
            match op {
                Op::Allocate(size, preference) => {
                    let largest = sram.largest_free_span();
                    match sram.allocate(size, preference) {
                        Some(offset) => prop_assert!(sram.is_allocated(offset)),
                        None => prop_assert!(size.max(1) > largest),
                    }
                }
                Op::Free(n) => {
                    let live: Vec<u32> = sram.allocations().map(|span| span.offset).collect();
                    if !live.is_empty() {
                        prop_assert!(sram.free(live[n % live.len()]).is_ok());
                    }
                }
            }

            let spans: Vec<_> = sram.allocations().collect();
            for pair in spans.windows(2) {
                prop_assert!(pair[0].end() <= pair[1].offset);
            }
            if let Some(last) = spans.last() {
                prop_assert!(last.end() <= CAPACITY);
            }
            let used: u32 = spans.iter().map(|span| span.size).sum();
            prop_assert_eq!(used + sram.free_capacity(), CAPACITY);
        }

        let live: Vec<u32> = sram.allocations().map(|span| span.offset).collect();
        for offset in live {
            prop_assert!(sram.free(offset).is_ok());
        }
        prop_assert_eq!(sram, SramAllocator::new(CAPACITY));
    }

    #[test]
    fn prop_free_of_unknown_offset_is_rejected(offset in 0..CAPACITY) {
        let mut sram = SramAllocator::new(CAPACITY);
        let before = sram.clone();
        prop_assert!(sram.free(offset).is_err());
        prop_assert_eq!(sram, before);
    }
}
