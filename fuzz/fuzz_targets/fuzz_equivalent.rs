//! Fuzz target for configuration equivalence.
//!
//! Two arbitrary JSON documents are compared under every comparator.
//! Comparison must never panic and must be symmetric.

#![no_main]

use catalog_replication::{equivalent, Comparator};
use libfuzzer_sys::fuzz_target;
use serde_json::Value;

const COMPARATORS: [Comparator; 4] = [
    Comparator::Generic,
    Comparator::Acls,
    Comparator::CatalogAcls,
    Comparator::AclBindings,
];

fuzz_target!(|data: (&str, &str)| {
    let (Ok(a), Ok(b)) = (serde_json::from_str::<Value>(data.0), serde_json::from_str::<Value>(data.1)) else {
        return;
    };

    for cmp in COMPARATORS {
        assert_eq!(equivalent(&a, &b, cmp), equivalent(&b, &a, cmp), "{cmp:?} not symmetric");
        if a.is_object() {
            assert!(equivalent(&a, &a, cmp), "{cmp:?} not reflexive");
        }
    }
});
