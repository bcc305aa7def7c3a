#![cfg(not(target_arch = "wasm32"))]

use proptest::prelude::*;
use xvm::kernel::{Allocator, PAGE_SIZE};

const BASE: u32 = 0x0010_0000;
const SIZE: u32 = 0x0040_0000;

#[derive(Debug, Clone)]
enum Op {
    Alloc { size: u32, align_shift: u32 },
    Free { pick: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1u32..0x8_0000, 0u32..5).prop_map(|(size, align_shift)| Op::Alloc { size, align_shift }),
        2 => any::<usize>().prop_map(|pick| Op::Free { pick }),
    ]
}

fn check_block_list(alloc: &Allocator) -> Result<(), TestCaseError> {
    let blocks = alloc.blocks();
    prop_assert!(!blocks.is_empty());
    prop_assert_eq!(blocks[0].address, BASE);
    let mut expected = BASE as u64;
    for (i, b) in blocks.iter().enumerate() {
        // Consecutive, non-overlapping, inside the reserved range
        prop_assert_eq!(b.address as u64, expected);
        prop_assert!(b.size > 0);
        expected += b.size as u64;
        if i > 0 {
            // Coalescing leaves no two adjacent free blocks
            prop_assert!(b.allocated || blocks[i - 1].allocated);
        }
    }
    prop_assert_eq!(expected, BASE as u64 + SIZE as u64);
    Ok(())
}

proptest! {
    #[test]
    fn prop_allocations_never_overlap(ops in proptest::collection::vec(op(), 1..64)) {
        let mut alloc = Allocator::with_ranges(&[(BASE, SIZE, "Main Memory")]);
        let mut live: Vec<(u32, u32)> = Vec::new();

        for op in ops {
            match op {
                Op::Alloc { size, align_shift } => {
                    let alignment = PAGE_SIZE << align_shift;
                    if let Some(addr) = alloc.allocate(size, alignment, "test") {
                        prop_assert_eq!(addr % alignment, 0);
                        prop_assert!(addr >= BASE);
                        let granted = alloc.allocation_size(addr).unwrap();
                        prop_assert!(granted >= size);
                        prop_assert!(addr as u64 + granted as u64 <= BASE as u64 + SIZE as u64);
                        for &(a, s) in &live {
                            let disjoint = addr as u64 + granted as u64 <= a as u64
                                || a as u64 + s as u64 <= addr as u64;
                            prop_assert!(disjoint);
                        }
                        live.push((addr, granted));
                    }
                }
                Op::Free { pick } => {
                    if !live.is_empty() {
                        let (addr, _) = live.swap_remove(pick % live.len());
                        prop_assert!(alloc.deallocate(addr));
                        prop_assert!(!alloc.deallocate(addr));
                    }
                }
            }
            check_block_list(&alloc)?;
        }

        for (addr, _) in live.drain(..) {
            prop_assert!(alloc.deallocate(addr));
        }
        prop_assert_eq!(alloc.blocks().len(), 1);
        prop_assert_eq!(alloc.free_bytes(), SIZE as u64);
    }
}

#[test]
fn test_exhaustion_returns_none() {
    let mut alloc = Allocator::with_ranges(&[(BASE, 4 * PAGE_SIZE, "Small")]);
    assert!(alloc.allocate(4 * PAGE_SIZE, PAGE_SIZE, "all").is_some());
    assert_eq!(alloc.allocate(1, PAGE_SIZE, "more"), None);
    assert!(!alloc.deallocate(BASE + PAGE_SIZE));
}
