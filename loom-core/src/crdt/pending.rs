use std::collections::{HashMap, HashSet};

use super::op::Op;
use crate::id::OpId;

/// Ops parked until a missing dependency is integrated.
///
/// Each op waits on exactly one missing id at a time; once that id lands
/// it is re-checked and either integrated or parked on the next gap.
#[derive(Debug, Default, Clone)]
pub struct PendingQueue {
    waiting: HashMap<OpId, Vec<Op>>,
    ids: HashSet<OpId>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn park(&mut self, missing: OpId, op: Op) {
        if self.ids.insert(op.id) {
            log::trace!("op {} waits for {missing}", op.id);
            self.waiting.entry(missing).or_default().push(op);
        }
    }

    /// Remove and return every op that was waiting on `id`.
    pub fn release(&mut self, id: OpId) -> Vec<Op> {
        let ops = self.waiting.remove(&id).unwrap_or_default();
        for op in &ops {
            self.ids.remove(&op.id);
        }
        ops
    }

    pub fn contains(&self, id: OpId) -> bool {
        self.ids.contains(&id)
    }

    pub fn find(&self, id: OpId) -> Option<&Op> {
        if !self.ids.contains(&id) {
            return None;
        }
        self.waiting.values().flatten().find(|op| op.id == id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Ids the queue is blocked on.
    pub fn missing(&self) -> impl Iterator<Item = OpId> + '_ {
        self.waiting.keys().copied()
    }
}
