//! Per-client high-water marks.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::id::{ClientId, OpId};

/// Highest integrated clock per client.
///
/// Entries only ever grow. Because ops of one client are integrated in
/// clock order, `contains(id)` is equivalent to "op `id` is integrated".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateVector {
    clocks: BTreeMap<ClientId, u64>,
}

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest clock seen for `client` (0 if none).
    pub fn get(&self, client: ClientId) -> u64 {
        self.clocks.get(&client).copied().unwrap_or(0)
    }

    /// Raise the entry for `client` to `clock`; lower values are ignored.
    pub fn observe(&mut self, client: ClientId, clock: u64) {
        let entry = self.clocks.entry(client).or_insert(0);
        if clock > *entry {
            *entry = clock;
        }
    }

    pub fn contains(&self, id: OpId) -> bool {
        id.clock != 0 && id.clock <= self.get(id.client)
    }

    /// Next clock to allocate for a local op by `client`.
    pub fn next_clock(&self, client: ClientId) -> u64 {
        self.get(client) + 1
    }

    /// Clients in ascending id order with their clocks.
    pub fn iter(&self) -> impl Iterator<Item = (ClientId, u64)> + '_ {
        self.clocks.iter().map(|(c, k)| (*c, *k))
    }

    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }

    /// Total number of ops covered.
    pub fn total(&self) -> u64 {
        self.clocks.values().sum()
    }
}

impl FromIterator<(ClientId, u64)> for StateVector {
    fn from_iter<I: IntoIterator<Item = (ClientId, u64)>>(iter: I) -> Self {
        let mut sv = StateVector::new();
        for (client, clock) in iter {
            sv.observe(client, clock);
        }
        sv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic() {
        let mut sv = StateVector::new();
        sv.observe(1, 5);
        sv.observe(1, 3);
        assert_eq!(sv.get(1), 5);
        assert_eq!(sv.get(2), 0);
        assert_eq!(sv.next_clock(1), 6);
    }

    #[test]
    fn test_contains() {
        let sv: StateVector = [(1, 3)].into_iter().collect();
        assert!(sv.contains(OpId::new(1, 1)));
        assert!(sv.contains(OpId::new(1, 3)));
        assert!(!sv.contains(OpId::new(1, 4)));
        assert!(!sv.contains(OpId::new(1, 0)));
        assert!(!sv.contains(OpId::new(2, 1)));
    }

    #[test]
    fn test_iter_sorted() {
        let sv: StateVector = [(9, 1), (2, 4), (5, 2)].into_iter().collect();
        let clients: Vec<_> = sv.iter().map(|(c, _)| c).collect();
        assert_eq!(clients, vec![2, 5, 9]);
        assert_eq!(sv.total(), 7);
    }

    #[test]
    fn test_json_form() {
        let sv: StateVector = [(1, 4), (7, 2)].into_iter().collect();
        let json = serde_json::to_string(&sv).unwrap();
        assert_eq!(json, r#"{"1":4,"7":2}"#);
        assert_eq!(serde_json::from_str::<StateVector>(&json).unwrap(), sv);
    }
}
