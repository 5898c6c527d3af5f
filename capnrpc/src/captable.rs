//! The per-peer capability table: imports, promise-exports, and
//! receiver-answers, plus the export-id allocator.
//!
//! The three sub-maps share one id namespace. An id is in at most one of
//! them at a time, and the allocator never hands out an id that any of
//! them holds.

use std::collections::{HashMap, HashSet};

use capnrpc_wire::rpc::{PromisedAnswer, PromisedAnswerOp};
use tracing::warn;

/// Default bound on the combined size of the capability sub-maps.
pub const DEFAULT_MAX_TABLE_SIZE: usize = 10_000;

/// Errors surfaced by capability-table operations.
#[derive(Debug, thiserror::Error)]
pub enum CapTableError {
    /// The table is at capacity, or every candidate id is taken.
    #[error("capability table is full")]
    CapTableFull,

    /// A reference count update would not fit.
    #[error("reference count overflow")]
    RefCountOverflow,

    /// A receiver-answer id that is not in the table.
    #[error("unknown receiver answer capability")]
    UnknownReceiverAnswerCap,
}

impl CapTableError {
    /// Stable name used as the exception reason on the wire.
    pub fn error_name(&self) -> &'static str {
        match self {
            Self::CapTableFull => "CapTableFull",
            Self::RefCountOverflow => "RefCountOverflow",
            Self::UnknownReceiverAnswerCap => "UnknownReceiverAnswerCap",
        }
    }
}

/// A refcounted import entry.
#[derive(Debug, Clone, Copy)]
pub struct Import {
    /// Outstanding references the peer has sent us for this id.
    pub ref_count: u32,
}

/// A receiver-answer entry: a pipelined path through one of our answers.
#[derive(Debug, Clone)]
pub struct ReceiverAnswer {
    /// The answer being pipelined on.
    pub question_id: u32,
    /// Owned copy of the transform.
    pub ops: Vec<PromisedAnswerOp>,
}

/// The capability table.
#[derive(Debug)]
pub struct CapTable {
    imports: HashMap<u32, Import>,
    promised_exports: HashSet<u32>,
    receiver_answers: HashMap<u32, ReceiverAnswer>,
    next_export_id: u32,
    max_table_size: usize,
}

impl Default for CapTable {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TABLE_SIZE)
    }
}

impl CapTable {
    /// Creates a table bounded at `max_table_size` combined entries.
    pub fn new(max_table_size: usize) -> Self {
        Self {
            imports: HashMap::new(),
            promised_exports: HashSet::new(),
            receiver_answers: HashMap::new(),
            next_export_id: 0,
            max_table_size,
        }
    }

    /// Combined entry count across the three sub-maps.
    pub fn total_entries(&self) -> usize {
        self.imports.len() + self.promised_exports.len() + self.receiver_answers.len()
    }

    /// Whether `id` is present in any sub-map.
    pub fn contains(&self, id: u32) -> bool {
        self.imports.contains_key(&id)
            || self.promised_exports.contains(&id)
            || self.receiver_answers.contains_key(&id)
    }

    fn check_capacity(&self) -> Result<(), CapTableError> {
        let total = self.total_entries();
        if total >= self.max_table_size {
            return Err(CapTableError::CapTableFull);
        }
        if total * 10 >= self.max_table_size * 9 {
            warn!(
                total,
                max = self.max_table_size,
                "capability table above 90% occupancy"
            );
        }
        Ok(())
    }

    /// Allocates a fresh id, probing linearly from the last allocation
    /// and wrapping.
    ///
    /// Exhaustion is detected by the collision scan, never by overflow:
    /// the counter wraps freely and the scan gives up after the table
    /// bound.
    pub fn alloc_export_id(&mut self) -> Result<u32, CapTableError> {
        self.check_capacity()?;
        for _ in 0..=self.max_table_size {
            let id = self.next_export_id;
            self.next_export_id = self.next_export_id.wrapping_add(1);
            if !self.contains(id) {
                return Ok(id);
            }
        }
        Err(CapTableError::CapTableFull)
    }

    /// Marks `id` as a promise-export.
    pub fn mark_export_promise(&mut self, id: u32) {
        self.promised_exports.insert(id);
    }

    /// Clears the promise-export mark on `id`.
    pub fn clear_export_promise(&mut self, id: u32) {
        self.promised_exports.remove(&id);
    }

    /// Whether `id` is marked as a promise-export.
    pub fn is_export_promise(&self, id: u32) -> bool {
        self.promised_exports.contains(&id)
    }

    /// Records a receiver-answer under a fresh local id, deep-copying the
    /// transform.
    pub fn note_receiver_answer(&mut self, promised: &PromisedAnswer) -> Result<u32, CapTableError> {
        self.note_receiver_answer_ops(promised.question_id, &promised.ops)
    }

    /// Records a receiver-answer from its parts under a fresh local id.
    pub fn note_receiver_answer_ops(
        &mut self,
        question_id: u32,
        ops: &[PromisedAnswerOp],
    ) -> Result<u32, CapTableError> {
        let id = self.alloc_export_id()?;
        self.receiver_answers.insert(
            id,
            ReceiverAnswer {
                question_id,
                ops: ops.to_vec(),
            },
        );
        Ok(id)
    }

    /// Borrows the receiver-answer stored under `id`.
    pub fn get_receiver_answer(&self, id: u32) -> Option<&ReceiverAnswer> {
        self.receiver_answers.get(&id)
    }

    /// Removes and returns the receiver-answer under `id`. Entries are
    /// single-use: serializing one consumes it.
    pub fn take_receiver_answer(&mut self, id: u32) -> Option<ReceiverAnswer> {
        self.receiver_answers.remove(&id)
    }

    /// Records one more reference to the remote capability `remote_id`.
    ///
    /// The count wraps rather than erroring so that a malformed peer
    /// cannot wedge the table, but it never silently underflows on
    /// release.
    pub fn note_import(&mut self, remote_id: u32) {
        let entry = self
            .imports
            .entry(remote_id)
            .or_insert(Import { ref_count: 0 });
        entry.ref_count = entry.ref_count.wrapping_add(1);
    }

    /// Whether `remote_id` is currently imported.
    pub fn has_import(&self, remote_id: u32) -> bool {
        self.imports.contains_key(&remote_id)
    }

    /// Current reference count of an import, zero when absent.
    pub fn import_ref_count(&self, remote_id: u32) -> u32 {
        self.imports.get(&remote_id).map_or(0, |i| i.ref_count)
    }

    /// Drops one reference to `remote_id`; true when the entry was
    /// removed because its count reached zero.
    pub fn release_import(&mut self, remote_id: u32) -> bool {
        self.release_import_count(remote_id, 1)
    }

    /// Drops `count` references to `remote_id`; true when the entry was
    /// removed.
    pub fn release_import_count(&mut self, remote_id: u32, count: u32) -> bool {
        match self.imports.get_mut(&remote_id) {
            None => false,
            Some(import) => {
                import.ref_count = import.ref_count.saturating_sub(count);
                if import.ref_count == 0 {
                    self.imports.remove(&remote_id);
                    true
                } else {
                    false
                }
            }
        }
    }
}
