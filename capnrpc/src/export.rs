//! The export table and the resolved-capability type shared by the
//! walkers, the pipeline, and the peer.

use std::collections::HashMap;

use capnrpc_wire::rpc::PromisedAnswer;

/// A capability reference resolved against one side's tables.
///
/// The variant names follow the descriptor that produced the reference,
/// so the meaning of `Exported`/`Imported` depends on which side encoded
/// the descriptor: walking a payload we *sent* (the pipeline), `Exported`
/// is our own export and dispatches locally; walking a payload we
/// *received*, `Exported` names the peer's export, which we reach through
/// our import table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedCap {
    /// No capability (a null or broken slot).
    None,
    /// A capability in the descriptor sender's export table.
    Exported {
        /// Export id in the sender's table.
        id: u32,
    },
    /// A capability in the descriptor receiver's table.
    Imported {
        /// Id in the receiver's table.
        id: u32,
    },
    /// A capability reachable by pipelining on an answer.
    Promised(PromisedAnswer),
}

/// A single export entry.
#[derive(Debug, Clone)]
pub struct Export {
    /// References the peer holds on this export.
    pub ref_count: u32,
    /// Whether this export is an unresolved (or resolved) promise.
    pub is_promise: bool,
    /// Resolution, once a promise-export settles.
    pub resolved: Option<ResolvedCap>,
}

/// Outcome of a release against the export table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// No such export.
    NotFound,
    /// References remain (or the export is pinned).
    Remaining(u32),
    /// The entry dropped to zero and was removed.
    Removed,
}

/// The peer's export table.
///
/// The statically-configured bootstrap export is pinned: its count floors
/// at zero and the entry is never removed.
#[derive(Debug)]
pub struct Exports {
    map: HashMap<u32, Export>,
    bootstrap_id: Option<u32>,
}

impl Exports {
    /// Creates the table, pinning `bootstrap_id` when configured.
    pub fn new(bootstrap_id: Option<u32>) -> Self {
        let mut map = HashMap::new();
        if let Some(id) = bootstrap_id {
            map.insert(
                id,
                Export {
                    ref_count: 0,
                    is_promise: false,
                    resolved: None,
                },
            );
        }
        Self { map, bootstrap_id }
    }

    /// The pinned bootstrap export, if configured.
    pub fn bootstrap_id(&self) -> Option<u32> {
        self.bootstrap_id
    }

    /// Entry count.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Whether `id` is exported.
    pub fn contains(&self, id: u32) -> bool {
        self.map.contains_key(&id)
    }

    /// Borrows the entry for `id`.
    pub fn get(&self, id: u32) -> Option<&Export> {
        self.map.get(&id)
    }

    /// Mutably borrows the entry for `id`.
    pub fn get_mut(&mut self, id: u32) -> Option<&mut Export> {
        self.map.get_mut(&id)
    }

    /// Creates the entry for `id` if absent, without adding a reference.
    pub fn ensure(&mut self, id: u32, is_promise: bool) -> &mut Export {
        self.map.entry(id).or_insert(Export {
            ref_count: 0,
            is_promise,
            resolved: None,
        })
    }

    /// Adds one reference to `id`, creating the entry if needed, and
    /// returns the new count. Wrapping addition mirrors the import side.
    pub fn add_ref(&mut self, id: u32) -> u32 {
        let entry = self.ensure(id, false);
        entry.ref_count = entry.ref_count.wrapping_add(1);
        entry.ref_count
    }

    /// Drops `count` references from `id`.
    ///
    /// The count decreases by exactly `min(count, current)`; the entry is
    /// removed at zero unless it is the pinned bootstrap export.
    pub fn release(&mut self, id: u32, count: u32) -> ReleaseOutcome {
        let pinned = self.bootstrap_id == Some(id);
        let remaining = match self.map.get_mut(&id) {
            None => return ReleaseOutcome::NotFound,
            Some(export) => {
                export.ref_count = export.ref_count.saturating_sub(count);
                export.ref_count
            }
        };
        if remaining == 0 && !pinned {
            self.map.remove(&id);
            ReleaseOutcome::Removed
        } else {
            ReleaseOutcome::Remaining(remaining)
        }
    }

    /// Records the resolution of a promise-export.
    pub fn set_resolved(&mut self, id: u32, cap: ResolvedCap) {
        let entry = self.ensure(id, true);
        entry.is_promise = true;
        entry.resolved = Some(cap);
    }
}
