//! Ephemeral presence (cursor, selection, user profile) for one room.
//!
//! Records are never merged: the entry with the highest clock per client
//! wins and stale entries are ignored. A record disappears either
//! explicitly (`remove`) or when its client stays silent past the
//! timeout (`sweep_expired`); both produce the same [`RemovalNotice`].
//!
//! Wire format of an awareness update:
//! ```text
//! n │ (client, clock, state-json) × n        state "null" = removal
//! ```

use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::encoding::{Decoder, Encoder};
use crate::error::DecodeError;
use crate::id::ClientId;

/// Highest clock a state may carry; its removal needs the next one.
pub const MAX_STATE_CLOCK: u64 = u64::MAX - 1;

/// Presence of one client as stored by the relay or a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessRecord {
    pub client: ClientId,
    pub clock: u64,
    /// Opaque key-value payload (user name, color, cursor...).
    pub state: Value,
    pub last_seen: Instant,
}

/// One entry of an awareness update as carried on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessEntry {
    pub client: ClientId,
    pub clock: u64,
    /// `None` marks a departed client.
    pub state: Option<Value>,
}

/// A client left, explicitly or by timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemovalNotice {
    pub client: ClientId,
    /// Clock of the removal; one past the last state the client published.
    pub clock: u64,
}

impl RemovalNotice {
    pub fn entry(&self) -> AwarenessEntry {
        AwarenessEntry {
            client: self.client,
            clock: self.clock,
            state: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Added,
    Updated,
    /// Clock not newer than what is stored, or past [`MAX_STATE_CLOCK`];
    /// nothing changed.
    Stale,
}

/// Effect of applying an awareness update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChanges {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<RemovalNotice>,
}

impl AwarenessChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Default, Clone)]
pub struct AwarenessStore {
    records: HashMap<ClientId, AwarenessRecord>,
    /// Last clock seen per client, kept after removal so that a delayed
    /// update cannot resurrect a departed client.
    clocks: HashMap<ClientId, u64>,
}

impl AwarenessStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_stale(&self, client: ClientId, clock: u64) -> bool {
        self.clocks.get(&client).is_some_and(|seen| clock <= *seen)
    }

    /// Store `state` for `client` unless `clock` is not newer than the
    /// stored one.
    pub fn set_local(
        &mut self,
        client: ClientId,
        clock: u64,
        state: Value,
        now: Instant,
    ) -> SetOutcome {
        if clock > MAX_STATE_CLOCK || self.is_stale(client, clock) {
            return SetOutcome::Stale;
        }
        self.clocks.insert(client, clock);
        let record = AwarenessRecord {
            client,
            clock,
            state,
            last_seen: now,
        };
        match self.records.insert(client, record) {
            None => SetOutcome::Added,
            Some(_) => SetOutcome::Updated,
        }
    }

    /// Drop the record of `client`, returning the notice to broadcast.
    pub fn remove(&mut self, client: ClientId) -> Option<RemovalNotice> {
        let record = self.records.remove(&client)?;
        let clock = record.clock.saturating_add(1);
        self.clocks.insert(client, clock);
        Some(RemovalNotice { client, clock })
    }

    /// Remove every record not refreshed within `timeout` of `now`.
    pub fn sweep_expired(&mut self, now: Instant, timeout: Duration) -> Vec<RemovalNotice> {
        let mut expired: Vec<ClientId> = self
            .records
            .values()
            .filter(|r| now.saturating_duration_since(r.last_seen) > timeout)
            .map(|r| r.client)
            .collect();
        expired.sort_unstable();
        expired
            .into_iter()
            .filter_map(|client| self.remove(client))
            .collect()
    }

    pub fn apply_entry(&mut self, entry: AwarenessEntry, now: Instant, changes: &mut AwarenessChanges) {
        match entry.state {
            Some(state) => match self.set_local(entry.client, entry.clock, state, now) {
                SetOutcome::Added => changes.added.push(entry.client),
                SetOutcome::Updated => changes.updated.push(entry.client),
                SetOutcome::Stale => {}
            },
            None => {
                if self.is_stale(entry.client, entry.clock) {
                    return;
                }
                self.clocks.insert(entry.client, entry.clock);
                if self.records.remove(&entry.client).is_some() {
                    changes.removed.push(RemovalNotice {
                        client: entry.client,
                        clock: entry.clock,
                    });
                }
            }
        }
    }

    /// Decode an encoded update in full, then apply its entries.
    pub fn apply_update(&mut self, bytes: &[u8], now: Instant) -> Result<AwarenessChanges, DecodeError> {
        let entries = decode_update(bytes)?;
        let mut changes = AwarenessChanges::default();
        for entry in entries {
            self.apply_entry(entry, now, &mut changes);
        }
        Ok(changes)
    }

    /// Every current record, for bootstrapping a newly joined peer.
    pub fn encode_full(&self) -> Vec<u8> {
        let mut records: Vec<&AwarenessRecord> = self.records.values().collect();
        records.sort_unstable_by_key(|r| r.client);
        let entries: Vec<AwarenessEntry> = records
            .into_iter()
            .map(|r| AwarenessEntry {
                client: r.client,
                clock: r.clock,
                state: Some(r.state.clone()),
            })
            .collect();
        encode_update(&entries)
    }

    pub fn get(&self, client: ClientId) -> Option<&AwarenessRecord> {
        self.records.get(&client)
    }

    /// Last clock seen for `client`, including removals.
    pub fn clock(&self, client: ClientId) -> Option<u64> {
        self.clocks.get(&client).copied()
    }

    pub fn clients(&self) -> Vec<ClientId> {
        let mut clients: Vec<ClientId> = self.records.keys().copied().collect();
        clients.sort_unstable();
        clients
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

pub fn encode_update(entries: &[AwarenessEntry]) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.write_var_u64(entries.len() as u64);
    for entry in entries {
        enc.write_var_u64(entry.client);
        enc.write_var_u64(entry.clock);
        match &entry.state {
            Some(state) => enc.write_var_string(&state.to_string()),
            None => enc.write_var_string("null"),
        }
    }
    enc.into_bytes()
}

pub fn encode_removals(notices: &[RemovalNotice]) -> Vec<u8> {
    let entries: Vec<AwarenessEntry> = notices.iter().map(RemovalNotice::entry).collect();
    encode_update(&entries)
}

pub fn decode_update(bytes: &[u8]) -> Result<Vec<AwarenessEntry>, DecodeError> {
    let mut dec = Decoder::new(bytes);
    let n = dec.read_var_len()?;
    let mut entries = Vec::new();
    for _ in 0..n {
        let client = dec.read_var_u64()?;
        let clock = dec.read_var_u64()?;
        let json = dec.read_var_string()?;
        let state: Value = serde_json::from_str(json).map_err(|e| DecodeError::InvalidJson {
            client,
            reason: e.to_string(),
        })?;
        if clock > MAX_STATE_CLOCK && !state.is_null() {
            return Err(DecodeError::ClockExhausted(client));
        }
        entries.push(AwarenessEntry {
            client,
            clock,
            state: (!state.is_null()).then_some(state),
        });
    }
    dec.finish()?;
    Ok(entries)
}
