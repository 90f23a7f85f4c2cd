//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

mod common;

use catalog_replication::config_sync::{equivalent, Comparator};
use catalog_replication::memory::ServiceCall;
use catalog_replication::model::RowId;
use catalog_replication::reconcile::reconcile;
use catalog_replication::{MemoryCatalog, PipelinedCopier, TableCopier};
use common::*;
use proptest::prelude::*;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

fn json_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i32>().prop_map(Value::from),
        "[a-z*]{0,6}".prop_map(Value::from),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z_]{1,8}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

fn comparator() -> impl Strategy<Value = Comparator> {
    prop_oneof![
        Just(Comparator::Generic),
        Just(Comparator::Acls),
        Just(Comparator::CatalogAcls),
        Just(Comparator::AclBindings),
    ]
}

// =============================================================================
// Resumability Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Interrupting a copy after any number of uploads and rerunning
    /// yields exactly the source rows, each uploaded once.
    #[test]
    fn copy_resumes_from_any_interruption(
        total in 0usize..25,
        page_size in 1usize..6,
        fail_after in 0usize..8,
    ) {
        block_on(async {
            let src = Arc::new(MemoryCatalog::with_model("src", parent_child_model()));
            src.seed_rows(&parent(), numbered_rows(1..=total));
            let store = Arc::new(MemoryCatalog::with_model("dst", parent_child_model()));
            let dst = Arc::new(FaultyCatalog::new(Arc::clone(&store)).fail_inserts_after(fail_after));

            let copier = TableCopier::new(Arc::clone(&src), Arc::clone(&dst), page_size);
            let interrupted = copier.copy_table(&parent()).await;
            let pages = total.div_ceil(page_size);
            prop_assert_eq!(interrupted.is_err(), fail_after < pages);

            dst.heal();
            copier.copy_table(&parent()).await.unwrap();

            prop_assert_eq!(rids(&store.rows(&parent())), rids(&src.rows(&parent())));
            let uploaded: usize = store
                .calls()
                .iter()
                .map(|c| match c {
                    ServiceCall::InsertRows { rows, .. } => *rows,
                    _ => 0,
                })
                .sum();
            prop_assert_eq!(uploaded, total);
            Ok(())
        })?;
    }
}

// =============================================================================
// Pipeline Ordering Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Pipelined fetches walk the identifier space in order with no gaps:
    /// each page starts right after the previous page's last RID.
    #[test]
    fn pipeline_pages_are_gapless_and_ordered(
        total in 1usize..30,
        page_size in 1usize..6,
        depth in 1usize..4,
    ) {
        block_on(async {
            let src = Arc::new(MemoryCatalog::with_model("src", parent_child_model()));
            src.seed_rows(&parent(), numbered_rows(1..=total));
            let dst = Arc::new(MemoryCatalog::with_model("dst", parent_child_model()));

            let copier = TableCopier::new(Arc::clone(&src), Arc::clone(&dst), page_size);
            let copy = PipelinedCopier::new(copier, depth, 1).copy_table(&parent()).await.unwrap();
            prop_assert_eq!(copy.rows, total);

            let afters: Vec<Option<RowId>> = src
                .calls()
                .into_iter()
                .filter_map(|c| match c {
                    ServiceCall::FetchPage { after, .. } => Some(after),
                    _ => None,
                })
                .collect();
            let expected: Vec<Option<RowId>> = std::iter::once(None)
                .chain((1..).map(|i| i * page_size).take_while(|n| *n < total).map(|n| Some(RowId::new(rid(n)))))
                .chain(std::iter::once(Some(RowId::new(rid(total)))))
                .collect();
            prop_assert_eq!(afters, expected);

            let uploads: Vec<usize> = dst
                .calls()
                .into_iter()
                .filter_map(|c| match c {
                    ServiceCall::InsertRows { rows, .. } => Some(rows),
                    _ => None,
                })
                .collect();
            prop_assert!(uploads.iter().all(|n| *n <= page_size));
            prop_assert_eq!(uploads.iter().sum::<usize>(), total);
            Ok(())
        })?;
    }
}

// =============================================================================
// Reconciliation Properties
// =============================================================================

proptest! {
    /// Destination-only identities are retained, never created or updated.
    #[test]
    fn reconcile_never_touches_destination_only_rows(
        want in prop::collection::btree_set("[a-f]{1,2}", 0..12),
        have in prop::collection::btree_set("[a-f]{1,2}", 0..12),
    ) {
        let to_rows = |ids: &BTreeSet<String>, prefix: &str| -> Vec<_> {
            ids.iter()
                .map(|id| row(&format!("{prefix}{id}"), &[("ID", json!(id))]))
                .collect()
        };
        let plan = reconcile(to_rows(&want, "S"), to_rows(&have, "D"), "ID");

        let ids = |rows: &[catalog_replication::Row]| -> BTreeSet<String> {
            rows.iter().filter_map(|r| r["ID"].as_str().map(String::from)).collect()
        };
        let created = ids(&plan.create);
        let updated = ids(&plan.update);

        let only_source: BTreeSet<String> = want.difference(&have).cloned().collect();
        let both: BTreeSet<String> = want.intersection(&have).cloned().collect();
        prop_assert_eq!(&created, &only_source);
        prop_assert_eq!(&updated, &both);
        prop_assert_eq!(plan.retained, have.difference(&want).count());
        prop_assert!(created.is_disjoint(&have));
    }
}

// =============================================================================
// Equivalence Properties
// =============================================================================

proptest! {
    /// Equivalence is symmetric under every comparator.
    #[test]
    fn equivalence_is_symmetric(a in json_value(), b in json_value(), cmp in comparator()) {
        prop_assert_eq!(equivalent(&a, &b, cmp), equivalent(&b, &a, cmp));
    }

    /// Every object is equivalent to itself.
    #[test]
    fn equivalence_is_reflexive_on_objects(
        m in prop::collection::btree_map("[a-z_]{1,8}", json_value(), 0..5),
        cmp in comparator(),
    ) {
        let v = Value::Object(m.into_iter().collect());
        prop_assert!(equivalent(&v, &v, cmp));
    }

    /// Member order inside ACL lists never matters.
    #[test]
    fn acl_member_order_is_ignored(members in prop::collection::vec("[a-z]{1,4}", 0..6)) {
        let mut reversed = members.clone();
        reversed.reverse();
        let a = json!({"select": members});
        let b = json!({"select": reversed});
        prop_assert!(equivalent(&a, &b, Comparator::Acls));
        prop_assert!(equivalent(&a, &b, Comparator::CatalogAcls));
    }
}
