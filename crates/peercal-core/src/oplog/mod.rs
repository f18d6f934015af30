//! Append-only multi-writer operation log
//!
//! ```text
//!   writer A:  a0 ── a1 ──── a2        each writer owns an append-only
//!   writer B:      b0 ─── b1           sub-log; entries point at the
//!                                      merged heads seen at append time
//!   merged DAG:
//!        a0 ◄── a1 ◄──┬─ a2
//!         ▲           │
//!         └── b0 ◄── b1
//! ```
//!
//! Replay linearizes the DAG with a topological sort, breaking ties
//! between concurrent entries by content hash, so every replica that holds
//! the same entries derives the same order and therefore the same view.

mod entry;
mod log;

pub use entry::{OpHash, Operation, SignedEntry, KIND_ADD_WRITER, KIND_UPDATE_SCHEDULE};
pub use log::OpLog;
