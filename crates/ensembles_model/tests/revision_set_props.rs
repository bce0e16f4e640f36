//! Property tests for revision set algebra.

use ensembles_model::{Revision, RevisionSet};
use proptest::prelude::*;

fn revision_set_strategy() -> impl Strategy<Value = RevisionSet> {
    prop::collection::btree_map("[a-e]", 0i64..50, 0..5).prop_map(|entries| {
        entries
            .into_iter()
            .map(|(store, number)| Revision::new(store, number, number))
            .collect()
    })
}

proptest! {
    #[test]
    fn maximum_is_commutative(a in revision_set_strategy(), b in revision_set_strategy()) {
        prop_assert_eq!(a.store_wise_maximum(&b), b.store_wise_maximum(&a));
    }

    #[test]
    fn minimum_is_commutative(a in revision_set_strategy(), b in revision_set_strategy()) {
        prop_assert_eq!(a.store_wise_minimum(&b), b.store_wise_minimum(&a));
    }

    #[test]
    fn maximum_dominates_inputs(a in revision_set_strategy(), b in revision_set_strategy()) {
        let max = a.store_wise_maximum(&b);
        for revision in a.iter().chain(b.iter()) {
            prop_assert!(
                max.revision_number_for_store(&revision.store_id) >= revision.revision_number
            );
        }
        prop_assert!(a.is_covered_by(&max));
        prop_assert!(b.is_covered_by(&max));
    }

    #[test]
    fn maximum_is_idempotent(a in revision_set_strategy()) {
        prop_assert_eq!(a.store_wise_maximum(&a), a.clone());
    }

    #[test]
    fn common_minimum_is_covered_by_every_input(
        a in revision_set_strategy(),
        b in revision_set_strategy(),
        c in revision_set_strategy(),
    ) {
        let common = RevisionSet::common_minimum([&a, &b, &c]);
        prop_assert!(common.is_covered_by(&a));
        prop_assert!(common.is_covered_by(&b));
        prop_assert!(common.is_covered_by(&c));
    }
}
