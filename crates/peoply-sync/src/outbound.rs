//! The ordered, at-most-once-per-id buffer the scheduler drains for the
//! presentation collaborator.

use std::collections::HashMap;

use crate::model::{ChangeKind, EventRecord};

/// Re-appending a still-queued id replaces its entry but keeps its original
/// position, so drain order matches append order within a tick.
#[derive(Debug, Default)]
pub(crate) struct OutboundQueue {
    order: Vec<String>,
    entries: HashMap<String, (EventRecord, ChangeKind)>,
}

impl OutboundQueue {
    pub(crate) fn push(&mut self, id: String, record: EventRecord, change: ChangeKind) {
        if !self.entries.contains_key(&id) {
            self.order.push(id.clone());
        }
        self.entries.insert(id, (record, change));
    }

    /// Atomically removes and returns the queue contents, in append order.
    pub(crate) fn drain(&mut self) -> Vec<(EventRecord, ChangeKind)> {
        let order = std::mem::take(&mut self.order);
        let mut entries = std::mem::take(&mut self.entries);
        order
            .into_iter()
            .filter_map(|id| entries.remove(&id))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }
}
