//! Multi-writer merged log
//!
//! Each admitted writer appends to its own append-only sub-log; entries
//! reference the merged-log heads seen at append time, forming a DAG.
//! [`OpLog`] integrates entries from any writer and linearizes the DAG
//! into one deterministic order every replica agrees on.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashSet};

use tracing::{debug, warn};

use crate::error::{RoomError, RoomResult};
use crate::identity::{AuthorKeypair, WriterKey};
use crate::oplog::entry::{OpHash, Operation, SignedEntry};

/// Upper bound on parked entries waiting for parents or admission
const MAX_PENDING_ENTRIES: usize = 4096;

enum Outcome {
    Integrated(OpHash),
    Duplicate,
    Rejected,
    Deferred(SignedEntry),
}

/// In-memory merged log for one room
pub struct OpLog {
    author: AuthorKeypair,
    /// Admitted writer keys; grows monotonically
    writers: BTreeSet<WriterKey>,
    /// Integrated entries keyed by content hash
    entries: BTreeMap<OpHash, SignedEntry>,
    /// Entries no integrated entry points back to
    heads: BTreeSet<OpHash>,
    /// Next expected sequence number per writer
    next_seq: BTreeMap<WriterKey, u64>,
    /// Entries parked until their author is admitted and parents arrive
    pending: Vec<SignedEntry>,
}

impl OpLog {
    /// Create an empty log for the given local author
    ///
    /// The author is NOT admitted automatically; appends fail with
    /// [`RoomError::NotWritable`] until [`OpLog::add_writer_key`] admits it.
    pub fn new(author: AuthorKeypair) -> Self {
        Self {
            author,
            writers: BTreeSet::new(),
            entries: BTreeMap::new(),
            heads: BTreeSet::new(),
            next_seq: BTreeMap::new(),
            pending: Vec::new(),
        }
    }

    /// The local author's writer key
    pub fn author_key(&self) -> WriterKey {
        self.author.writer_key()
    }

    /// Admitted writers
    pub fn writers(&self) -> &BTreeSet<WriterKey> {
        &self.writers
    }

    /// Whether local appends are currently accepted
    pub fn is_writable(&self) -> bool {
        self.writers.contains(&self.author.writer_key())
    }

    /// Admit a writer key
    ///
    /// Idempotent: returns true only when the key was newly admitted.
    /// Admission can make parked entries integrable, so the pending pool is
    /// drained afterwards.
    pub fn add_writer_key(&mut self, key: WriterKey) -> bool {
        if !self.writers.insert(key) {
            return false;
        }
        debug!(writer = %key, "Writer admitted");
        self.drain_pending();
        true
    }

    /// Append an operation under the local author
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::NotWritable`] while the local author is not in
    /// the writer set.
    pub fn append(&mut self, op: &Operation) -> RoomResult<SignedEntry> {
        let local = self.author.writer_key();
        if !self.writers.contains(&local) {
            return Err(RoomError::NotWritable(format!(
                "{} is not in the writer set",
                local
            )));
        }

        let seq = self.next_seq.get(&local).copied().unwrap_or(0);
        let parents: Vec<OpHash> = self.heads.iter().copied().collect();
        let entry = SignedEntry::sign(&self.author, seq, parents, op)?;
        let hash = entry.hash()?;
        self.insert_entry(hash, entry.clone());
        debug!(%hash, seq, kind = %entry.kind, "Appended local entry");
        Ok(entry)
    }

    /// Integrate entries received from peers or loaded from storage
    ///
    /// Entries may arrive in any order and from writers not yet admitted;
    /// anything not integrable right now is parked and retried whenever
    /// integration or admission makes progress. Returns the hashes of
    /// entries that became integrated, in integration order.
    pub fn integrate_batch(&mut self, entries: Vec<SignedEntry>) -> Vec<OpHash> {
        if self.pending.len() + entries.len() > MAX_PENDING_ENTRIES {
            warn!(
                pending = self.pending.len(),
                incoming = entries.len(),
                "Pending entry pool overflow, dropping oldest"
            );
            let overflow = (self.pending.len() + entries.len()) - MAX_PENDING_ENTRIES;
            self.pending.drain(..overflow.min(self.pending.len()));
        }
        self.pending.extend(entries);
        self.drain_pending()
    }

    /// Retry parked entries until no more progress is made
    fn drain_pending(&mut self) -> Vec<OpHash> {
        let mut integrated = Vec::new();
        loop {
            let mut progressed = false;
            let mut parked = Vec::new();
            for entry in std::mem::take(&mut self.pending) {
                match self.try_integrate(entry) {
                    Outcome::Integrated(hash) => {
                        integrated.push(hash);
                        progressed = true;
                    }
                    Outcome::Duplicate | Outcome::Rejected => {}
                    Outcome::Deferred(entry) => parked.push(entry),
                }
            }
            self.pending = parked;
            if !progressed {
                break;
            }
        }
        integrated
    }

    fn try_integrate(&mut self, entry: SignedEntry) -> Outcome {
        let hash = match entry.hash() {
            Ok(hash) => hash,
            Err(e) => {
                warn!(error = %e, "Dropping unhashable entry");
                return Outcome::Rejected;
            }
        };

        if self.entries.contains_key(&hash) {
            return Outcome::Duplicate;
        }
        if !self.writers.contains(&entry.author) {
            return Outcome::Deferred(entry);
        }

        let expected = self.next_seq.get(&entry.author).copied().unwrap_or(0);
        if entry.seq > expected {
            return Outcome::Deferred(entry);
        }
        if entry.seq < expected {
            // Same author and position as an integrated entry but different
            // content. First integrated wins; the fork is dropped.
            warn!(author = %entry.author, seq = entry.seq, "Dropping conflicting entry");
            return Outcome::Rejected;
        }

        if !entry.parents.iter().all(|p| self.entries.contains_key(p)) {
            return Outcome::Deferred(entry);
        }

        if let Err(e) = entry.verify() {
            warn!(author = %entry.author, seq = entry.seq, error = %e, "Dropping entry with bad signature");
            return Outcome::Rejected;
        }

        self.insert_entry(hash, entry);
        Outcome::Integrated(hash)
    }

    fn insert_entry(&mut self, hash: OpHash, entry: SignedEntry) {
        for parent in &entry.parents {
            self.heads.remove(parent);
        }
        self.heads.insert(hash);
        self.next_seq.insert(entry.author, entry.seq + 1);
        self.entries.insert(hash, entry);
    }

    /// Current heads of the merge DAG, sorted
    pub fn heads(&self) -> Vec<OpHash> {
        self.heads.iter().copied().collect()
    }

    /// Whether an entry is integrated
    pub fn contains(&self, hash: &OpHash) -> bool {
        self.entries.contains_key(hash)
    }

    /// Whether every given hash is integrated
    pub fn has_all(&self, hashes: &[OpHash]) -> bool {
        hashes.iter().all(|h| self.entries.contains_key(h))
    }

    /// Look up an integrated entry
    pub fn entry(&self, hash: &OpHash) -> Option<&SignedEntry> {
        self.entries.get(hash)
    }

    /// Number of integrated entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of parked entries
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Linearize the DAG into the replay order
    ///
    /// Topological sort over parent edges; whenever several entries are
    /// ready at once their content hashes break the tie, so replicas
    /// holding the same entries produce the same sequence with no
    /// coordination.
    pub fn ordered(&self) -> Vec<(OpHash, SignedEntry)> {
        let mut indegree: BTreeMap<OpHash, usize> = BTreeMap::new();
        let mut children: BTreeMap<OpHash, Vec<OpHash>> = BTreeMap::new();

        for (hash, entry) in &self.entries {
            indegree.insert(*hash, entry.parents.len());
            for parent in &entry.parents {
                children.entry(*parent).or_default().push(*hash);
            }
        }

        let mut ready: BinaryHeap<Reverse<OpHash>> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(h, _)| Reverse(*h))
            .collect();

        let mut out = Vec::with_capacity(self.entries.len());
        while let Some(Reverse(hash)) = ready.pop() {
            if let Some(entry) = self.entries.get(&hash) {
                out.push((hash, entry.clone()));
            }
            for child in children.get(&hash).map(|c| c.as_slice()).unwrap_or(&[]) {
                if let Some(d) = indegree.get_mut(child) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(Reverse(*child));
                    }
                }
            }
        }
        out
    }

    /// Integrated entries outside the ancestor closure of `have`
    ///
    /// This is what a peer announcing `have` as its heads still needs from
    /// us. Hashes we do not hold are ignored; the peer is ahead of us there.
    pub fn entries_since(&self, have: &[OpHash]) -> Vec<SignedEntry> {
        let mut known: HashSet<OpHash> = HashSet::new();
        let mut stack: Vec<OpHash> = have
            .iter()
            .filter(|h| self.entries.contains_key(h))
            .copied()
            .collect();
        while let Some(hash) = stack.pop() {
            if !known.insert(hash) {
                continue;
            }
            if let Some(entry) = self.entries.get(&hash) {
                stack.extend(entry.parents.iter().copied());
            }
        }
        self.ordered()
            .into_iter()
            .filter(|(hash, _)| !known.contains(hash))
            .map(|(_, entry)| entry)
            .collect()
    }
}
