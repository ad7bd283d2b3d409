//! Replica and operation identifiers.

use std::cmp::Ordering;
use std::fmt;

/// Opaque identifier of one replica (one editor instance).
pub type ClientId = u64;

/// Globally unique identifier of a single operation.
///
/// Clocks start at 1 for every client; clock 0 is never allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpId {
    pub client: ClientId,
    pub clock: u64,
}

impl OpId {
    pub const fn new(client: ClientId, clock: u64) -> Self {
        Self { client, clock }
    }

    /// The op issued by the same client immediately before this one.
    pub fn predecessor(&self) -> Option<OpId> {
        (self.clock > 1).then(|| OpId::new(self.client, self.clock - 1))
    }
}

/// Total order: clock first, client id as tie-break.
impl Ord for OpId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.clock
            .cmp(&other.clock)
            .then_with(|| self.client.cmp(&other.client))
    }
}

impl PartialOrd for OpId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.client, self.clock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_by_clock_then_client() {
        let a = OpId::new(9, 1);
        let b = OpId::new(1, 2);
        let c = OpId::new(2, 2);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(OpId::new(3, 3).cmp(&OpId::new(3, 3)), Ordering::Equal);
    }

    #[test]
    fn test_predecessor() {
        assert_eq!(OpId::new(7, 1).predecessor(), None);
        assert_eq!(OpId::new(7, 5).predecessor(), Some(OpId::new(7, 4)));
    }

    #[test]
    fn test_display() {
        assert_eq!(OpId::new(42, 3).to_string(), "42@3");
    }
}
