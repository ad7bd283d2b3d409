//! Replicated character sequence.
//!
//! Items live in an arena indexed by `OpId` and are linked in document
//! order. Origins are `OpId` references resolved through that index, never
//! pointers, so the structure can be cloned freely and placing an item only
//! walks the gap between its origins.
//!
//! Concurrent inserts into the same gap are ordered with the YATA rule:
//! scanning the items between the new item's origins, an item with the
//! same left origin and a lower `OpId` stays to the left; items whose left
//! origin lies inside the scanned run are skipped together with their
//! conflict set. Every replica therefore computes the same position no
//! matter in which order the ops arrived.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use super::op::{Op, OpKind};
use super::pending::PendingQueue;
use crate::error::{DecodeError, DocumentError};
use crate::id::{ClientId, OpId};
use crate::state_vector::StateVector;

/// A character in the sequence, visible or tombstoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub id: OpId,
    pub value: char,
    pub left: Option<OpId>,
    pub right: Option<OpId>,
    pub deleted: bool,
}

#[derive(Debug, Clone)]
struct Node {
    item: Item,
    next: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MetaEntry {
    id: OpId,
    value: String,
}

/// What a call to [`Sequence::apply`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Ops integrated by this call, including previously parked ones.
    pub integrated: usize,
    /// Ops still waiting for a dependency after this call.
    pub pending: usize,
    /// Whether the visible text changed.
    pub text_changed: bool,
    /// Metadata keys whose visible value changed, with the new value.
    pub meta_changed: Vec<(String, String)>,
}

impl ApplyOutcome {
    pub fn is_noop(&self) -> bool {
        self.integrated == 0
    }
}

enum Effect {
    None,
    Text,
    Meta(String, String),
}

#[derive(Debug, Clone, Default)]
pub struct Sequence {
    /// Items in integration order; document order follows `next` from `head`.
    nodes: Vec<Node>,
    index: HashMap<OpId, usize>,
    head: Option<usize>,
    visible: usize,
    /// Integrated ops per client; the op with clock `c` sits at index `c - 1`.
    log: BTreeMap<ClientId, Vec<Op>>,
    state: StateVector,
    pending: PendingQueue,
    meta: BTreeMap<String, MetaEntry>,
}

impl Sequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state_vector(&self) -> &StateVector {
        &self.state
    }

    /// Integrated op with the given id.
    pub fn op(&self, id: OpId) -> Option<&Op> {
        let index = usize::try_from(id.clock.checked_sub(1)?).ok()?;
        self.log.get(&id.client)?.get(index)
    }

    pub fn item(&self, id: OpId) -> Option<&Item> {
        self.index.get(&id).map(|&slot| &self.nodes[slot].item)
    }

    /// All items in document order, tombstones included.
    pub fn items(&self) -> impl Iterator<Item = &Item> + '_ {
        std::iter::successors(self.head, |&slot| self.nodes[slot].next)
            .map(|slot| &self.nodes[slot].item)
    }

    /// Number of items, tombstones included.
    pub fn item_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of visible characters.
    pub fn len(&self) -> usize {
        self.visible
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Id of the `pos`-th visible character.
    pub fn visible_id(&self, pos: usize) -> Option<OpId> {
        self.items()
            .filter(|i| !i.deleted)
            .nth(pos)
            .map(|i| i.id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Ids the dependency buffer is blocked on.
    pub fn missing(&self) -> Vec<OpId> {
        self.pending.missing().collect()
    }

    /// Insert `value` right after item `after` (`None` = document start).
    pub fn insert(
        &mut self,
        after: Option<OpId>,
        value: char,
        client: ClientId,
    ) -> Result<OpId, DocumentError> {
        let next = match after {
            None => self.head,
            Some(id) => {
                let slot = self.index.get(&id).ok_or(DocumentError::UnknownItem(id))?;
                self.nodes[*slot].next
            }
        };
        let right = next.map(|slot| self.nodes[slot].item.id);
        let id = OpId::new(client, self.state.next_clock(client));
        self.offer(Op::insert(id, after, right, value), &mut ApplyOutcome::default());
        Ok(id)
    }

    /// Tombstone item `target`. Returns `None` if it already was.
    pub fn delete(
        &mut self,
        target: OpId,
        client: ClientId,
    ) -> Result<Option<OpId>, DocumentError> {
        let item = self.item(target).ok_or(DocumentError::UnknownItem(target))?;
        if item.deleted {
            return Ok(None);
        }
        let id = OpId::new(client, self.state.next_clock(client));
        self.offer(Op::delete(id, target), &mut ApplyOutcome::default());
        Ok(Some(id))
    }

    pub fn set_meta(&mut self, key: &str, value: &str, client: ClientId) -> OpId {
        let id = OpId::new(client, self.state.next_clock(client));
        self.offer(Op::set_meta(id, key, value), &mut ApplyOutcome::default());
        id
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(|e| e.value.as_str())
    }

    pub fn meta_entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.meta.iter().map(|(k, e)| (k.as_str(), e.value.as_str()))
    }

    /// Integrate remote ops.
    ///
    /// Ops already covered by the state vector (or already parked) are
    /// skipped, so applying the same batch twice is a no-op. The whole
    /// batch is validated before anything is integrated; ops whose
    /// dependencies are unknown are parked rather than rejected.
    pub fn apply(&mut self, ops: Vec<Op>) -> Result<ApplyOutcome, DecodeError> {
        let mut fresh = Vec::with_capacity(ops.len());
        let mut batch: HashMap<OpId, bool> = HashMap::new();
        for op in ops {
            if self.state.contains(op.id)
                || self.pending.contains(op.id)
                || batch.contains_key(&op.id)
            {
                continue;
            }
            batch.insert(op.id, op.is_insert());
            fresh.push(op);
        }

        for op in &fresh {
            self.validate(op, &batch)?;
        }

        let mut outcome = ApplyOutcome::default();
        for op in fresh {
            self.offer(op, &mut outcome);
        }
        outcome.pending = self.pending.len();
        if outcome.pending > 0 {
            log::debug!("{} ops waiting for dependencies", outcome.pending);
        }
        Ok(outcome)
    }

    /// Visible text: every non-tombstoned item in order.
    pub fn materialize(&self) -> String {
        self.items()
            .filter(|i| !i.deleted)
            .map(|i| i.value)
            .collect()
    }

    /// Per client, the integrated ops the peer at `peer` has not seen,
    /// in increasing clock order.
    pub fn ops_since<'a>(
        &'a self,
        peer: &'a StateVector,
    ) -> impl Iterator<Item = (ClientId, &'a [Op])> + 'a {
        self.log.iter().filter_map(move |(client, ops)| {
            let seen = usize::try_from(peer.get(*client))
                .unwrap_or(usize::MAX)
                .min(ops.len());
            (seen < ops.len()).then(|| (*client, &ops[seen..]))
        })
    }

    /// Whether every item `op` references is an insert. Only meaningful
    /// once the references are integrated.
    fn references_items(&self, op: &Op) -> bool {
        op.references()
            .all(|target| self.op(target).is_some_and(Op::is_insert))
    }

    fn validate(&self, op: &Op, batch: &HashMap<OpId, bool>) -> Result<(), DecodeError> {
        for target in op.references() {
            let invalid = DecodeError::InvalidReference { op: op.id, target };
            // A reference to the author's own future would never resolve.
            if target.clock == 0 || (target.client == op.id.client && target.clock >= op.id.clock)
            {
                return Err(invalid);
            }
            let is_insert = match self.op(target) {
                Some(known) => Some(known.is_insert()),
                None => batch
                    .get(&target)
                    .copied()
                    .or_else(|| self.pending.find(target).map(Op::is_insert)),
            };
            if is_insert == Some(false) {
                return Err(invalid);
            }
        }
        Ok(())
    }

    /// Integrate `op` if its dependencies are present, otherwise park it.
    /// Parked ops unblocked by each integration are retried in turn.
    fn offer(&mut self, op: Op, outcome: &mut ApplyOutcome) {
        let mut ready = VecDeque::from([op]);
        while let Some(op) = ready.pop_front() {
            if self.state.contains(op.id) {
                continue;
            }
            if let Some(missing) = op.dependencies().find(|d| !self.state.contains(*d)) {
                self.pending.park(missing, op);
                continue;
            }
            // A parked op may point at what turned out to be a delete or
            // metadata op; a replica that saw that op first rejects it too.
            if !self.references_items(&op) {
                log::warn!("dropping op {:?} with a reference to a non-item", op.id);
                continue;
            }
            let id = op.id;
            match self.integrate(op) {
                Effect::Text => outcome.text_changed = true,
                Effect::Meta(key, value) => outcome.meta_changed.push((key, value)),
                Effect::None => {}
            }
            outcome.integrated += 1;
            ready.extend(self.pending.release(id));
        }
    }

    fn integrate(&mut self, op: Op) -> Effect {
        let effect = match &op.kind {
            OpKind::Insert { left, right, value } => {
                self.place(op.id, *left, *right, *value);
                Effect::Text
            }
            OpKind::Delete { target } => match self.index.get(target) {
                Some(&slot) if !self.nodes[slot].item.deleted => {
                    self.nodes[slot].item.deleted = true;
                    self.visible -= 1;
                    Effect::Text
                }
                _ => Effect::None,
            },
            OpKind::SetMeta { key, value } => self.assign_meta(op.id, key, value),
        };
        self.state.observe(op.id.client, op.id.clock);
        self.log.entry(op.id.client).or_default().push(op);
        effect
    }

    fn assign_meta(&mut self, id: OpId, key: &str, value: &str) -> Effect {
        let (wins, changed) = match self.meta.get(key) {
            None => (true, true),
            Some(current) => (id > current.id, current.value != value),
        };
        if !wins {
            return Effect::None;
        }
        self.meta.insert(
            key.to_string(),
            MetaEntry {
                id,
                value: value.to_string(),
            },
        );
        if changed {
            Effect::Meta(key.to_string(), value.to_string())
        } else {
            Effect::None
        }
    }

    fn place(&mut self, id: OpId, left: Option<OpId>, right: Option<OpId>, value: char) {
        let left_slot = left.and_then(|l| self.index.get(&l).copied());
        let end = right.and_then(|r| self.index.get(&r).copied());

        // `dest` is the slot the new item is linked after; `None` is the head.
        let mut dest = left_slot;
        let mut cursor = match left_slot {
            Some(slot) => self.nodes[slot].next,
            None => self.head,
        };
        let mut scanned: HashSet<OpId> = HashSet::new();
        let mut conflicting: HashSet<OpId> = HashSet::new();
        while let Some(slot) = cursor {
            if Some(slot) == end {
                break;
            }
            let other = &self.nodes[slot].item;
            scanned.insert(other.id);
            conflicting.insert(other.id);
            if other.left == left {
                if other.id < id {
                    dest = Some(slot);
                    conflicting.clear();
                } else if other.right == right {
                    break;
                }
            } else if let Some(origin) = other.left.filter(|o| scanned.contains(o)) {
                if !conflicting.contains(&origin) {
                    dest = Some(slot);
                    conflicting.clear();
                }
            } else {
                break;
            }
            cursor = self.nodes[slot].next;
        }

        self.link_after(
            dest,
            Item {
                id,
                value,
                left,
                right,
                deleted: false,
            },
        );
    }

    fn link_after(&mut self, after: Option<usize>, item: Item) {
        let slot = self.nodes.len();
        let next = match after {
            Some(prev) => self.nodes[prev].next.replace(slot),
            None => self.head.replace(slot),
        };
        self.index.insert(item.id, slot);
        if !item.deleted {
            self.visible += 1;
        }
        self.nodes.push(Node { item, next });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn type_text(seq: &mut Sequence, client: ClientId, after: Option<OpId>, text: &str) -> Vec<OpId> {
        let mut prev = after;
        text.chars()
            .map(|c| {
                let id = seq.insert(prev, c, client).unwrap();
                prev = Some(id);
                id
            })
            .collect()
    }

    fn all_ops(seq: &Sequence) -> Vec<Op> {
        let empty = StateVector::new();
        seq.ops_since(&empty)
            .flat_map(|(_, ops)| ops.iter().cloned())
            .collect()
    }

    #[test]
    fn test_local_insert_and_materialize() {
        let mut seq = Sequence::new();
        type_text(&mut seq, 1, None, "cat");
        assert_eq!(seq.materialize(), "cat");
        assert_eq!(seq.len(), 3);
        assert_eq!(seq.state_vector().get(1), 3);
    }

    #[test]
    fn test_insert_after_unknown_item() {
        let mut seq = Sequence::new();
        let missing = OpId::new(5, 5);
        assert_eq!(
            seq.insert(Some(missing), 'x', 1),
            Err(DocumentError::UnknownItem(missing))
        );
        assert_eq!(seq.state_vector().get(1), 0);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let mut seq = Sequence::new();
        let ids = type_text(&mut seq, 1, None, "cat");
        assert!(seq.delete(ids[1], 1).unwrap().is_some());
        assert_eq!(seq.materialize(), "ct");
        assert_eq!(seq.delete(ids[1], 1).unwrap(), None);
        assert_eq!(seq.state_vector().get(1), 4);
        // Tombstone keeps its identity.
        assert!(seq.item(ids[1]).unwrap().deleted);
        assert_eq!(seq.item_count(), 3);
    }

    #[test]
    fn test_concurrent_inserts_same_gap_converge() {
        let mut base = Sequence::new();
        let ids = type_text(&mut base, 1, None, "ac");

        let mut a = base.clone();
        let mut b = base.clone();
        type_text(&mut a, 2, Some(ids[0]), "XX");
        type_text(&mut b, 3, Some(ids[0]), "YY");

        let from_a = all_ops(&a);
        let from_b = all_ops(&b);
        a.apply(from_b).unwrap();
        b.apply(from_a).unwrap();

        assert_eq!(a.materialize(), b.materialize());
        // Client 2's first op sorts lower (same clock, lower client) and stays left.
        assert_eq!(a.materialize(), "aXXYYc");
    }

    #[test]
    fn test_concurrent_at_head_converge() {
        let mut a = Sequence::new();
        let mut b = Sequence::new();
        let mut c = Sequence::new();
        type_text(&mut a, 10, None, "one");
        type_text(&mut b, 20, None, "two");
        type_text(&mut c, 5, None, "3");

        let ops: Vec<Vec<Op>> = vec![all_ops(&a), all_ops(&b), all_ops(&c)];
        let orders = [[0, 1, 2], [2, 1, 0], [1, 2, 0]];
        let mut results = Vec::new();
        for order in orders {
            let mut replica = Sequence::new();
            for i in order {
                replica.apply(ops[i].clone()).unwrap();
            }
            results.push(replica.materialize());
        }
        assert!(results.windows(2).all(|w| w[0] == w[1]), "{results:?}");
        assert_eq!(results[0].len(), 7);
    }

    #[test]
    fn test_out_of_order_ops_are_buffered() {
        let mut src = Sequence::new();
        type_text(&mut src, 1, None, "hey");
        let mut ops = all_ops(&src);
        ops.reverse();

        let mut dst = Sequence::new();
        let first = dst.apply(vec![ops[0].clone()]).unwrap();
        assert_eq!(first.integrated, 0);
        assert_eq!(first.pending, 1);
        assert_eq!(dst.materialize(), "");

        let rest = dst.apply(ops[1..].to_vec()).unwrap();
        assert_eq!(rest.integrated, 3);
        assert_eq!(rest.pending, 0);
        assert_eq!(dst.materialize(), "hey");
    }

    #[test]
    fn test_apply_twice_is_noop() {
        let mut src = Sequence::new();
        type_text(&mut src, 1, None, "hi");
        let ops = all_ops(&src);

        let mut dst = Sequence::new();
        assert_eq!(dst.apply(ops.clone()).unwrap().integrated, 2);
        let again = dst.apply(ops).unwrap();
        assert!(again.is_noop());
        assert!(!again.text_changed);
        assert_eq!(dst.materialize(), "hi");
        assert_eq!(dst.state_vector().get(1), 2);
    }

    #[test]
    fn test_delete_of_non_item_rejected_atomically() {
        let mut src = Sequence::new();
        let ids = type_text(&mut src, 1, None, "ab");
        src.delete(ids[0], 1).unwrap();

        let mut dst = Sequence::new();
        dst.apply(all_ops(&src)).unwrap();
        let before = dst.materialize();

        // Valid insert followed by a delete that targets a delete op.
        let batch = vec![
            Op::insert(OpId::new(2, 1), Some(ids[1]), None, 'z'),
            Op::delete(OpId::new(2, 2), OpId::new(1, 3)),
        ];
        let err = dst.apply(batch).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidReference { .. }));
        assert_eq!(dst.materialize(), before);
        assert_eq!(dst.state_vector().get(2), 0);
    }

    #[test]
    fn test_parked_op_on_non_item_dropped_in_every_order() {
        let insert = Op::insert(OpId::new(1, 1), None, None, 'z');
        let delete = Op::delete(OpId::new(2, 1), OpId::new(1, 1));
        let dangling = Op::insert(OpId::new(3, 1), Some(OpId::new(2, 1)), None, 'z');

        // The delete is known, so the insert pointing at it is rejected.
        let mut seen_delete = Sequence::new();
        seen_delete.apply(vec![insert.clone(), delete.clone()]).unwrap();
        assert!(seen_delete.apply(vec![dangling.clone()]).is_err());

        // The insert arrives first, is parked, then released and dropped.
        let mut seen_insert = Sequence::new();
        assert_eq!(seen_insert.apply(vec![dangling]).unwrap().pending, 1);
        let outcome = seen_insert.apply(vec![insert, delete]).unwrap();
        assert_eq!(outcome.integrated, 2);
        assert_eq!(outcome.pending, 0);

        assert_eq!(seen_delete.materialize(), "");
        assert_eq!(seen_insert.materialize(), "");
        assert_eq!(seen_insert.state_vector(), seen_delete.state_vector());
        assert_eq!(seen_insert.state_vector().get(3), 0);
        assert_eq!(seen_insert.item_count(), 1);
    }

    #[test]
    fn test_large_document_replicates() {
        let text: String = "fn main() { println!(\"loom\"); }\n".repeat(700);
        let mut src = Sequence::new();
        type_text(&mut src, 1, None, &text);
        let middle = src.visible_id(text.chars().count() / 2);
        type_text(&mut src, 2, middle, "// edit\n");

        let mut dst = Sequence::new();
        let outcome = dst.apply(all_ops(&src)).unwrap();
        assert_eq!(outcome.pending, 0);
        assert_eq!(dst.materialize(), src.materialize());
        assert_eq!(dst.len(), src.len());
        assert_eq!(dst.items().count(), dst.item_count());
    }

    #[test]
    fn test_self_future_reference_rejected() {
        let mut seq = Sequence::new();
        let op = Op::insert(OpId::new(1, 1), Some(OpId::new(1, 2)), None, 'x');
        assert!(seq.apply(vec![op]).is_err());
        assert_eq!(seq.pending_len(), 0);
    }

    #[test]
    fn test_meta_last_writer_wins() {
        let mut a = Sequence::new();
        let mut b = Sequence::new();
        a.set_meta("language", "python", 1);
        b.set_meta("language", "rust", 2);

        let from_a = all_ops(&a);
        let from_b = all_ops(&b);
        let out_a = a.apply(from_b).unwrap();
        b.apply(from_a).unwrap();

        // Same clock: client 2 wins the tie-break.
        assert_eq!(a.meta("language"), Some("rust"));
        assert_eq!(b.meta("language"), Some("rust"));
        assert_eq!(
            out_a.meta_changed,
            vec![("language".to_string(), "rust".to_string())]
        );
    }

    #[test]
    fn test_ops_since_respects_peer_vector() {
        let mut seq = Sequence::new();
        type_text(&mut seq, 1, None, "abc");
        type_text(&mut seq, 2, None, "d");

        let peer: StateVector = [(1, 2)].into_iter().collect();
        let groups: Vec<_> = seq
            .ops_since(&peer)
            .map(|(c, ops)| (c, ops.iter().map(|o| o.id.clock).collect::<Vec<_>>()))
            .collect();
        assert_eq!(groups, vec![(1, vec![3]), (2, vec![1])]);
    }
}
