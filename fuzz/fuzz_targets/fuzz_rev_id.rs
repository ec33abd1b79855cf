//! Fuzz target for revision ID parsing and collation.
//!
//! Collation must never panic on arbitrary input and must stay
//! antisymmetric, including for malformed IDs.

#![no_main]

use doc_replicator::revision::{compare_rev_ids, generation, parse_rev_id};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, &str)| {
    let (a, b) = data;

    let ab = compare_rev_ids(a, b);
    let ba = compare_rev_ids(b, a);
    assert_eq!(ab, ba.reverse());
    assert_eq!(compare_rev_ids(a, a), std::cmp::Ordering::Equal);

    if let Some((gen, suffix)) = parse_rev_id(a) {
        assert_eq!(generation(a), gen);
        assert!(a.ends_with(suffix));
    } else {
        assert_eq!(generation(a), 0);
    }
});
