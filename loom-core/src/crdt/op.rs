use crate::id::OpId;

/// What an operation does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpKind {
    /// Place `value` between the items `left` and `right` as they stood
    /// when the op was created (`None` = document start / end).
    Insert {
        left: Option<OpId>,
        right: Option<OpId>,
        value: char,
    },
    /// Tombstone the item created by `target`.
    Delete { target: OpId },
    /// Last-writer-wins assignment in the document metadata map.
    SetMeta { key: String, value: String },
}

/// One replicated operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Op {
    pub id: OpId,
    pub kind: OpKind,
}

impl Op {
    pub fn insert(id: OpId, left: Option<OpId>, right: Option<OpId>, value: char) -> Self {
        Self {
            id,
            kind: OpKind::Insert { left, right, value },
        }
    }

    pub fn delete(id: OpId, target: OpId) -> Self {
        Self {
            id,
            kind: OpKind::Delete { target },
        }
    }

    pub fn set_meta(id: OpId, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id,
            kind: OpKind::SetMeta {
                key: key.into(),
                value: value.into(),
            },
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self.kind, OpKind::Insert { .. })
    }

    /// Ids of items this op points at (origins or delete target).
    pub fn references(&self) -> impl Iterator<Item = OpId> {
        let (a, b) = match &self.kind {
            OpKind::Insert { left, right, .. } => (*left, *right),
            OpKind::Delete { target } => (Some(*target), None),
            OpKind::SetMeta { .. } => (None, None),
        };
        a.into_iter().chain(b)
    }

    /// Everything that must be integrated before this op: its own
    /// predecessor from the same client plus every referenced item.
    pub fn dependencies(&self) -> impl Iterator<Item = OpId> {
        self.id.predecessor().into_iter().chain(self.references())
    }
}
