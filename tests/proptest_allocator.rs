use std::collections::BTreeSet;

use proptest::prelude::*;

use dhcpbind::FreeList;

#[derive(Debug, Clone)]
enum Op {
    Allocate,
    MarkUsed(u128),
    MarkFree(u128),
    TryMarkUsed(u128),
}

fn op(domain: u128) -> impl Strategy<Value = Op> {
    // Units slightly outside the domain exercise the ignore path.
    let unit = 0..domain + 4;
    prop_oneof![
        3 => Just(Op::Allocate),
        1 => unit.clone().prop_map(Op::MarkUsed),
        2 => unit.clone().prop_map(Op::MarkFree),
        1 => unit.prop_map(Op::TryMarkUsed),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(2000))]

    #[test]
    fn allocator_matches_set_model(
        segment_size in 1u64..20,
        ops in prop::collection::vec(op(64), 0..300)
    ) {
        let start = 2u128;
        let end = 65u128;
        let mut list = FreeList::with_segment_size(start, end, segment_size).unwrap();
        let mut used: BTreeSet<u128> = BTreeSet::new();
        let in_domain = |unit: u128| unit >= start && unit <= end;

        for op in ops {
            match op {
                Op::Allocate => match list.allocate_next() {
                    Some(unit) => {
                        prop_assert!(in_domain(unit));
                        prop_assert!(used.insert(unit), "unit {} handed out twice", unit);
                    }
                    None => prop_assert_eq!(used.len() as u128, end - start + 1),
                },
                Op::MarkUsed(unit) => {
                    list.mark_used(unit);
                    if in_domain(unit) {
                        used.insert(unit);
                    }
                }
                Op::MarkFree(unit) => {
                    list.mark_free(unit);
                    used.remove(&unit);
                }
                Op::TryMarkUsed(unit) => {
                    let expected = in_domain(unit) && !used.contains(&unit);
                    prop_assert_eq!(list.try_mark_used(unit), expected);
                    if expected {
                        used.insert(unit);
                    }
                }
            }
            prop_assert_eq!(list.used_count(), used.len() as u128);
        }

        for unit in start.saturating_sub(2)..end + 3 {
            prop_assert_eq!(list.is_used(unit), used.contains(&unit));
        }
    }

    #[test]
    fn fresh_allocator_hands_out_units_in_order(
        start in any::<u64>(),
        len in 1u64..200,
        segment_size in 1u64..64
    ) {
        let start = u128::from(start);
        let end = start + u128::from(len) - 1;
        let mut list = FreeList::with_segment_size(start, end, segment_size).unwrap();

        for expected in start..=end {
            prop_assert_eq!(list.allocate_next(), Some(expected));
        }
        prop_assert_eq!(list.allocate_next(), None);
        prop_assert_eq!(list.used_count(), list.capacity());
    }

    #[test]
    fn single_segment_reuses_lowest_free_unit(
        freed in prop::collection::btree_set(0u128..100, 1..20)
    ) {
        let mut list = FreeList::new(0, 99).unwrap();
        while list.allocate_next().is_some() {}

        for &unit in &freed {
            list.mark_free(unit);
        }
        for &unit in &freed {
            prop_assert_eq!(list.allocate_next(), Some(unit));
        }
        prop_assert_eq!(list.allocate_next(), None);
    }

    #[test]
    fn used_free_round_trip(unit in 1000u128..2000) {
        let mut list = FreeList::new(1000, 1999).unwrap();
        prop_assert!(!list.is_used(unit));
        list.mark_used(unit);
        prop_assert!(list.is_used(unit));
        prop_assert!(!list.try_mark_used(unit));
        list.mark_free(unit);
        prop_assert!(!list.is_used(unit));
        prop_assert_eq!(list.used_count(), 0);
    }
}
