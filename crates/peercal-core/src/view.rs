//! Derived schedule view
//!
//! The view is a pure fold over the log's replay order: `updateSchedule`
//! sets a key, `addWriter` grows the writer set, anything unrecognized is
//! skipped. No I/O happens here; persistence of snapshots is the storage
//! layer's job and replicas rebuild the same view from the same entries.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RoomResult;
use crate::oplog::{OpHash, OpLog, Operation, SignedEntry};

/// Key-value state derived from a room's log
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleView {
    entries: BTreeMap<String, serde_json::Value>,
    /// Number of log operations folded in so far
    cursor: usize,
}

impl ScheduleView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a key
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.entries.get(key)
    }

    /// Iterate keys and values in key order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of operations folded into this view
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Serializable snapshot for persistence
    pub fn snapshot(&self) -> ViewSnapshot {
        ViewSnapshot {
            entries: self.entries.clone(),
            cursor: self.cursor,
        }
    }

    /// Restore from a persisted snapshot
    pub fn from_snapshot(snapshot: ViewSnapshot) -> Self {
        Self {
            entries: snapshot.entries,
            cursor: snapshot.cursor,
        }
    }
}

/// Persisted form of a [`ScheduleView`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewSnapshot {
    pub entries: BTreeMap<String, serde_json::Value>,
    pub cursor: usize,
}

/// Fold a batch of ordered entries into the view
///
/// `addWriter` operations go to the log's writer set (idempotently);
/// `updateSchedule` is last-writer-wins on the view, where "last" means
/// last in the deterministic replay order. Unknown kinds are skipped with
/// a debug log. A malformed payload under a known kind aborts the fold
/// with [`crate::error::RoomError::Replay`].
pub fn apply(
    batch: &[(OpHash, SignedEntry)],
    view: &mut ScheduleView,
    log: &mut OpLog,
) -> RoomResult<()> {
    for (hash, entry) in batch {
        match entry.operation()? {
            Operation::AddWriter { key } => {
                log.add_writer_key(key);
            }
            Operation::UpdateSchedule { key, value } => {
                view.entries.insert(key, value);
            }
            Operation::Unknown { kind, .. } => {
                debug!(%hash, kind = %kind, "Skipping unrecognized operation");
            }
        }
        view.cursor += 1;
    }
    Ok(())
}

/// Rebuild a view from scratch out of the log's full replay order
pub fn replay(log: &mut OpLog) -> RoomResult<ScheduleView> {
    // Applying addWriter ops can admit writers, which can pull parked
    // entries into the log and change the replay order; loop until the
    // entry set is stable.
    loop {
        let before = log.len();
        let batch = log.ordered();
        let mut view = ScheduleView::new();
        apply(&batch, &mut view, log)?;
        if log.len() == before {
            return Ok(view);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RoomError;
    use crate::identity::AuthorKeypair;

    fn writable_log() -> OpLog {
        let author = AuthorKeypair::generate();
        let mut log = OpLog::new(author);
        let key = log.author_key();
        log.add_writer_key(key);
        log
    }

    fn set(log: &mut OpLog, key: &str, value: &str) {
        log.append(&Operation::UpdateSchedule {
            key: key.to_string(),
            value: serde_json::json!(value),
        })
        .unwrap();
    }

    #[test]
    fn test_last_writer_wins() {
        let mut log = writable_log();
        set(&mut log, "schedule", "first");
        set(&mut log, "schedule", "second");
        set(&mut log, "other", "kept");

        let view = replay(&mut log).unwrap();
        assert_eq!(view.get("schedule"), Some(&serde_json::json!("second")));
        assert_eq!(view.get("other"), Some(&serde_json::json!("kept")));
        assert_eq!(view.len(), 2);
        assert_eq!(view.cursor(), 3);
    }

    #[test]
    fn test_add_writer_folds_into_writer_set() {
        let mut log = writable_log();
        let guest = AuthorKeypair::generate().writer_key();
        log.append(&Operation::AddWriter { key: guest }).unwrap();
        // Duplicate admission is a no-op on replay.
        log.append(&Operation::AddWriter { key: guest }).unwrap();

        let view = replay(&mut log).unwrap();
        assert!(log.writers().contains(&guest));
        assert_eq!(log.writers().len(), 2);
        assert!(view.is_empty());
        assert_eq!(view.cursor(), 2);
    }

    #[test]
    fn test_unknown_operations_are_skipped() {
        let mut log = writable_log();
        log.append(&Operation::Unknown {
            kind: "renameRoom".to_string(),
            body: b"Family".to_vec(),
        })
        .unwrap();
        set(&mut log, "schedule", "kept");

        let view = replay(&mut log).unwrap();
        assert_eq!(view.get("schedule"), Some(&serde_json::json!("kept")));
        assert_eq!(view.cursor(), 2);
    }

    #[test]
    fn test_malformed_known_kind_aborts_replay() {
        let mut log = writable_log();
        // A validly signed updateSchedule entry whose payload is garbage:
        // the Unknown variant lets us push arbitrary bytes under the kind.
        let author = AuthorKeypair::generate();
        let entry = SignedEntry::sign(
            &author,
            0,
            vec![],
            &Operation::Unknown {
                kind: crate::oplog::KIND_UPDATE_SCHEDULE.to_string(),
                body: b"not json".to_vec(),
            },
        )
        .unwrap();
        log.add_writer_key(author.writer_key());
        assert_eq!(log.integrate_batch(vec![entry]).len(), 1);

        let result = replay(&mut log);
        assert!(matches!(result, Err(RoomError::Replay(_))));
    }

    #[test]
    fn test_incremental_apply_matches_full_replay() {
        let mut log = writable_log();
        set(&mut log, "schedule", "a");
        set(&mut log, "schedule", "b");
        set(&mut log, "notes", "c");

        let batch = log.ordered();
        let mut incremental = ScheduleView::new();
        apply(&batch[..1], &mut incremental, &mut log).unwrap();
        apply(&batch[1..], &mut incremental, &mut log).unwrap();

        let full = replay(&mut log).unwrap();
        assert_eq!(incremental, full);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut log = writable_log();
        set(&mut log, "schedule", "a");
        let view = replay(&mut log).unwrap();

        let snapshot = view.snapshot();
        let json = serde_json::to_vec(&snapshot).unwrap();
        let restored: ViewSnapshot = serde_json::from_slice(&json).unwrap();
        assert_eq!(ScheduleView::from_snapshot(restored), view);
    }

    #[test]
    fn test_replay_is_deterministic_across_replicas() {
        let alice = AuthorKeypair::generate();
        let bob = AuthorKeypair::generate();

        let mut log_a = OpLog::new(alice.clone());
        log_a.add_writer_key(alice.writer_key());
        log_a.add_writer_key(bob.writer_key());
        let mut log_b = OpLog::new(bob.clone());
        log_b.add_writer_key(alice.writer_key());
        log_b.add_writer_key(bob.writer_key());

        // Concurrent writes to the same key from both sides.
        set(&mut log_a, "schedule", "alice says brunch");
        set(&mut log_b, "schedule", "bob says hike");

        let from_a = log_a.entries_since(&[]);
        let from_b = log_b.entries_since(&[]);
        log_a.integrate_batch(from_b);
        log_b.integrate_batch(from_a);

        let view_a = replay(&mut log_a).unwrap();
        let view_b = replay(&mut log_b).unwrap();
        assert_eq!(view_a, view_b);
    }
}
