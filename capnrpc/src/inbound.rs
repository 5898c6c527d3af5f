//! Inbound capability resolution.
//!
//! Every descriptor in an inbound payload's cap table resolves to a
//! [`ResolvedCap`] in the sender's terms: `Exported` entries name the
//! peer's exports (which land in our import table), `Imported` entries
//! reach back into our own tables. Entries the application does not
//! retain are handed back to the peer as aggregated Release messages.

use std::collections::HashMap;

use bytes::Bytes;
use capnrpc_wire::rpc::{self, CapDescriptor};

use crate::captable::CapTable;
use crate::export::ResolvedCap;

/// One resolved inbound cap-table slot.
#[derive(Debug, Clone)]
struct InboundEntry {
    cap: ResolvedCap,
    /// Import id this entry added a reference to, if any.
    noted_import: Option<u32>,
    retained: bool,
}

/// The resolved cap table of one inbound payload.
///
/// Dropping the table without retaining an entry gives the reference
/// back: [`InboundCaps::release_unretained`] emits one Release per
/// distinct import id with the accumulated count.
#[derive(Debug, Clone, Default)]
pub struct InboundCaps {
    entries: Vec<InboundEntry>,
}

/// Aggregated result of releasing unretained entries.
#[derive(Debug, Default)]
pub struct ReleasePlan {
    /// Release frames to put on the wire, one per distinct import id.
    pub frames: Vec<Bytes>,
    /// Imports whose reference count dropped to zero.
    pub removed_imports: Vec<u32>,
}

/// Resolves an inbound cap table, noting imports as a side effect.
pub fn resolve_descriptors(table: &mut CapTable, descriptors: &[CapDescriptor]) -> InboundCaps {
    let mut entries = Vec::with_capacity(descriptors.len());
    for desc in descriptors {
        let (cap, noted_import) = match desc {
            CapDescriptor::None => (ResolvedCap::None, None),
            CapDescriptor::SenderHosted { id } | CapDescriptor::SenderPromise { id } => {
                table.note_import(*id);
                (ResolvedCap::Exported { id: *id }, Some(*id))
            }
            CapDescriptor::ReceiverHosted { id } => (ResolvedCap::Imported { id: *id }, None),
            CapDescriptor::ReceiverAnswer(pa) => (ResolvedCap::Promised(pa.clone()), None),
            CapDescriptor::ThirdPartyHosted { vine_id } => {
                table.note_import(*vine_id);
                (ResolvedCap::Imported { id: *vine_id }, Some(*vine_id))
            }
        };
        entries.push(InboundEntry {
            cap,
            noted_import,
            retained: false,
        });
    }
    InboundCaps { entries }
}

impl InboundCaps {
    /// Number of cap-table slots.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The resolved capability at `index`.
    pub fn get(&self, index: usize) -> Option<&ResolvedCap> {
        self.entries.get(index).map(|e| &e.cap)
    }

    /// Marks `index` as retained: its reference stays with the
    /// application instead of being released.
    pub fn retain(&mut self, index: usize) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.retained = true;
        }
    }

    /// Marks every entry as retained.
    pub fn retain_all(&mut self) {
        for entry in &mut self.entries {
            entry.retained = true;
        }
    }

    /// Clones the resolved caps in slot order.
    pub fn resolved(&self) -> Vec<ResolvedCap> {
        self.entries.iter().map(|e| e.cap.clone()).collect()
    }

    /// Aggregated `(import id, count)` pairs this table noted, in first
    /// occurrence order. For callers that keep the references alive past
    /// the table itself and release them later.
    pub fn noted_counts(&self) -> Vec<(u32, u32)> {
        let mut counts: HashMap<u32, u32> = HashMap::new();
        let mut order = Vec::new();
        for entry in &self.entries {
            if let Some(id) = entry.noted_import {
                let count = counts.entry(id).or_insert(0);
                if *count == 0 {
                    order.push(id);
                }
                *count += 1;
            }
        }
        order.into_iter().map(|id| (id, counts[&id])).collect()
    }

    /// Releases every unretained entry, aggregating counts per import
    /// id.
    pub fn release_unretained(self, table: &mut CapTable) -> ReleasePlan {
        let mut counts: HashMap<u32, u32> = HashMap::new();
        let mut order = Vec::new();
        for entry in &self.entries {
            if entry.retained {
                continue;
            }
            if let Some(id) = entry.noted_import {
                let count = counts.entry(id).or_insert(0);
                if *count == 0 {
                    order.push(id);
                }
                *count += 1;
            }
        }

        let mut plan = ReleasePlan::default();
        for id in order {
            let count = counts[&id];
            if table.release_import_count(id, count) {
                plan.removed_imports.push(id);
            }
            plan.frames.push(rpc::release(id, count));
        }
        plan
    }
}
