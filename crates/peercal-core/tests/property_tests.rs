//! Property-based tests for log merging and view replay
//!
//! Uses proptest to verify that replicas converge no matter how entries
//! arrive, and that the invite codec is lossless.

use std::collections::BTreeMap;

use proptest::prelude::*;

use peercal_core::identity::AuthorKeypair;
use peercal_core::invite::{Invite, NodeAddrBytes};
use peercal_core::oplog::{OpHash, OpLog, Operation, SignedEntry};
use peercal_core::view;

// ============================================================================
// Strategy Generators
// ============================================================================

/// Generate a schedule write: key plus arbitrary JSON-ish value
fn op_strategy() -> impl Strategy<Value = (String, serde_json::Value)> {
    (
        "[a-z]{1,6}",
        prop_oneof![
            "[a-z0-9 ]{0,12}".prop_map(serde_json::Value::from),
            any::<i32>().prop_map(serde_json::Value::from),
            any::<bool>().prop_map(serde_json::Value::from),
        ],
    )
}

fn ops_strategy(max: usize) -> impl Strategy<Value = Vec<(String, serde_json::Value)>> {
    prop::collection::vec(op_strategy(), 0..max)
}

/// Two authors' worth of writes plus a delivery permutation over the
/// resulting entries (2 admission entries + every write)
fn history_strategy() -> impl Strategy<
    Value = (
        Vec<(String, serde_json::Value)>,
        Vec<(String, serde_json::Value)>,
        Vec<usize>,
    ),
> {
    (ops_strategy(6), ops_strategy(6)).prop_flat_map(|(a_ops, b_ops)| {
        let total = 2 + a_ops.len() + b_ops.len();
        let order: Vec<usize> = (0..total).collect();
        (Just(a_ops), Just(b_ops), Just(order).prop_shuffle())
    })
}

// ============================================================================
// History Construction
// ============================================================================

/// Build a two-author history: A admits itself and B, both write, B's
/// log holds the merged result. Returns the entries, the reference
/// view, and the reference causal order.
fn build_history(
    a_ops: &[(String, serde_json::Value)],
    b_ops: &[(String, serde_json::Value)],
) -> (Vec<SignedEntry>, BTreeMap<String, serde_json::Value>, Vec<OpHash>) {
    let author_a = AuthorKeypair::from_seed(&[1u8; 32]);
    let author_b = AuthorKeypair::from_seed(&[2u8; 32]);
    let key_a = author_a.writer_key();
    let key_b = author_b.writer_key();

    let mut log_a = OpLog::new(author_a);
    log_a.add_writer_key(key_a);
    log_a.append(&Operation::AddWriter { key: key_a }).unwrap();
    log_a.append(&Operation::AddWriter { key: key_b }).unwrap();
    for (key, value) in a_ops {
        log_a
            .append(&Operation::UpdateSchedule {
                key: key.clone(),
                value: value.clone(),
            })
            .unwrap();
    }

    let mut log_b = OpLog::new(author_b);
    log_b.add_writer_key(key_a);
    log_b.add_writer_key(key_b);
    log_b.integrate_batch(log_a.ordered().into_iter().map(|(_, e)| e).collect());
    for (key, value) in b_ops {
        log_b
            .append(&Operation::UpdateSchedule {
                key: key.clone(),
                value: value.clone(),
            })
            .unwrap();
    }

    let entries: Vec<SignedEntry> = log_b.ordered().into_iter().map(|(_, e)| e).collect();
    let reference_order: Vec<OpHash> = log_b.ordered().into_iter().map(|(h, _)| h).collect();
    let reference_view = view::replay(&mut log_b).unwrap().snapshot().entries;
    (entries, reference_view, reference_order)
}

/// A replica that starts from nothing but the genesis author's key, the
/// way a candidate learns a room from an invite
fn fresh_replica() -> OpLog {
    let reader = AuthorKeypair::from_seed(&[9u8; 32]);
    let key_a = AuthorKeypair::from_seed(&[1u8; 32]).writer_key();
    let mut log = OpLog::new(reader);
    log.add_writer_key(key_a);
    log
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    /// A replica fed the entries in any order converges to the same
    /// view and the same causal order as the origin.
    #[test]
    fn shuffled_delivery_converges((a_ops, b_ops, order) in history_strategy()) {
        let (entries, reference_view, reference_order) = build_history(&a_ops, &b_ops);
        let shuffled: Vec<SignedEntry> =
            order.iter().map(|&i| entries[i].clone()).collect();

        let mut log = fresh_replica();
        log.integrate_batch(shuffled);
        let replica_view = view::replay(&mut log).unwrap().snapshot().entries;

        prop_assert_eq!(log.len(), entries.len());
        prop_assert_eq!(log.pending_len(), 0);
        let replica_order: Vec<OpHash> =
            log.ordered().into_iter().map(|(h, _)| h).collect();
        prop_assert_eq!(replica_order, reference_order);
        prop_assert_eq!(replica_view, reference_view);
    }

    /// Integrating one entry at a time ends in the same state as one
    /// big batch, entries parked and drained as needed.
    #[test]
    fn trickled_delivery_equals_batch((a_ops, b_ops, order) in history_strategy()) {
        let (entries, reference_view, _) = build_history(&a_ops, &b_ops);

        let mut batch_log = fresh_replica();
        batch_log.integrate_batch(order.iter().map(|&i| entries[i].clone()).collect());

        let mut trickle_log = fresh_replica();
        for &i in &order {
            trickle_log.integrate_batch(vec![entries[i].clone()]);
        }

        prop_assert_eq!(batch_log.len(), trickle_log.len());
        prop_assert_eq!(batch_log.heads(), trickle_log.heads());
        let trickle_view = view::replay(&mut trickle_log).unwrap().snapshot().entries;
        prop_assert_eq!(trickle_view, reference_view);
    }

    /// The folded view always equals the last write per key in causal
    /// order.
    #[test]
    fn view_is_last_write_per_key((a_ops, b_ops, order) in history_strategy()) {
        let (entries, _, _) = build_history(&a_ops, &b_ops);
        let mut log = fresh_replica();
        log.integrate_batch(order.iter().map(|&i| entries[i].clone()).collect());
        let replica_view = view::replay(&mut log).unwrap().snapshot().entries;

        let mut expected: BTreeMap<String, serde_json::Value> = BTreeMap::new();
        for (_, entry) in log.ordered() {
            if let Operation::UpdateSchedule { key, value } = entry.operation().unwrap() {
                expected.insert(key, value);
            }
        }
        prop_assert_eq!(replica_view, expected);
    }

    /// Re-admitting a writer is a no-op however often it happens.
    #[test]
    fn writer_admission_idempotent(repeats in 1usize..8) {
        let author = AuthorKeypair::from_seed(&[4u8; 32]);
        let key = author.writer_key();
        let mut log = OpLog::new(author);

        prop_assert!(log.add_writer_key(key));
        for _ in 0..repeats {
            prop_assert!(!log.add_writer_key(key));
        }
        prop_assert_eq!(log.writers().len(), 1);
        prop_assert!(log.is_writable());
    }

    /// Invite tokens are lossless for any name, expiry, and address mix.
    #[test]
    fn invite_token_roundtrip(
        name in proptest::option::of("[A-Za-z0-9 ]{1,24}"),
        relay in proptest::option::of("[a-z]{1,10}"),
        addrs in prop::collection::vec("[0-9]{1,3}\\.[0-9]{1,3}\\.[0-9]{1,3}\\.[0-9]{1,3}:[0-9]{1,5}", 0..3),
        expiry in proptest::option::of(0i64..=4_102_444_800),
    ) {
        let host = AuthorKeypair::from_seed(&[3u8; 32]);
        let addr = NodeAddrBytes {
            endpoint_id: [5u8; 32],
            relay_url: relay.map(|r| format!("https://{}.example", r)),
            direct_addresses: addrs,
        };
        let mut invite = Invite::new(host.writer_key(), addr);
        if let Some(name) = name {
            invite = invite.with_name(name);
        }
        if let Some(expiry) = expiry {
            invite = invite.with_expiry(expiry);
        }

        let token = invite.encode().unwrap();
        let decoded = Invite::decode(&token).unwrap();
        prop_assert_eq!(decoded, invite);
    }
}
