//! Binary encoding of state vectors and diffs.
//!
//! Wire format:
//! ```text
//! state vector : n │ (client, clock) × n            sorted by client
//! diff         : groups │ group × groups
//! group        : client │ count │ record × count    increasing clock
//! record       : tag │ len │ body                   len-prefixed body
//!
//! body (tag 0, insert)   : clock │ origin │ origin │ string(1 char)
//! body (tag 1, delete)   : clock │ target client │ target clock
//! body (tag 2, set meta) : clock │ string key │ string value
//! origin                 : 0 (none) │ 1, client, clock
//! ```
//! All integers are varints. Records with an unknown tag are skipped
//! whole thanks to the length prefix.

use std::collections::HashSet;

use crate::crdt::{Op, OpKind};
use crate::encoding::{Decoder, Encoder};
use crate::error::DecodeError;
use crate::id::{ClientId, OpId};
use crate::state_vector::StateVector;

pub const TAG_INSERT: u64 = 0;
pub const TAG_DELETE: u64 = 1;
pub const TAG_SET_META: u64 = 2;

pub fn encode_state_vector(sv: &StateVector) -> Vec<u8> {
    let mut enc = Encoder::with_capacity(1 + sv.len() * 4);
    enc.write_var_u64(sv.len() as u64);
    for (client, clock) in sv.iter() {
        enc.write_var_u64(client);
        enc.write_var_u64(clock);
    }
    enc.into_bytes()
}

pub fn decode_state_vector(bytes: &[u8]) -> Result<StateVector, DecodeError> {
    let mut dec = Decoder::new(bytes);
    let n = dec.read_var_len()?;
    let mut sv = StateVector::new();
    let mut seen = HashSet::new();
    for _ in 0..n {
        let client = dec.read_var_u64()?;
        let clock = dec.read_var_u64()?;
        if !seen.insert(client) {
            return Err(DecodeError::DuplicateClient(client));
        }
        sv.observe(client, clock);
    }
    dec.finish()?;
    Ok(sv)
}

/// Encode ops grouped per client. Each group must be in increasing
/// clock order, as produced by [`Sequence::ops_since`](crate::crdt::Sequence::ops_since).
pub fn encode_diff<'a, I>(groups: I) -> Vec<u8>
where
    I: IntoIterator<Item = (ClientId, &'a [Op])>,
{
    let groups: Vec<(ClientId, &[Op])> = groups.into_iter().collect();
    let mut enc = Encoder::new();
    enc.write_var_u64(groups.len() as u64);
    for (client, ops) in groups {
        enc.write_var_u64(client);
        enc.write_var_u64(ops.len() as u64);
        for op in ops {
            let mut body = Encoder::with_capacity(16);
            let tag = encode_body(&mut body, op);
            enc.write_var_u64(tag);
            enc.write_var_bytes(&body.into_bytes());
        }
    }
    enc.into_bytes()
}

fn encode_body(enc: &mut Encoder, op: &Op) -> u64 {
    enc.write_var_u64(op.id.clock);
    match &op.kind {
        OpKind::Insert { left, right, value } => {
            write_origin(enc, *left);
            write_origin(enc, *right);
            let mut buf = [0u8; 4];
            enc.write_var_string(value.encode_utf8(&mut buf));
            TAG_INSERT
        }
        OpKind::Delete { target } => {
            enc.write_var_u64(target.client);
            enc.write_var_u64(target.clock);
            TAG_DELETE
        }
        OpKind::SetMeta { key, value } => {
            enc.write_var_string(key);
            enc.write_var_string(value);
            TAG_SET_META
        }
    }
}

fn write_origin(enc: &mut Encoder, origin: Option<OpId>) {
    match origin {
        None => enc.write_var_u64(0),
        Some(id) => {
            enc.write_var_u64(1);
            enc.write_var_u64(id.client);
            enc.write_var_u64(id.clock);
        }
    }
}

/// Decode a diff into ops, grouped by client in increasing clock order.
///
/// An empty diff decodes to an empty vector; any malformed input is an
/// error.
pub fn decode_diff(bytes: &[u8]) -> Result<Vec<Op>, DecodeError> {
    let mut dec = Decoder::new(bytes);
    let groups = dec.read_var_len()?;
    let mut seen = HashSet::new();
    let mut ops = Vec::new();
    for _ in 0..groups {
        let client = dec.read_var_u64()?;
        if !seen.insert(client) {
            return Err(DecodeError::DuplicateClient(client));
        }
        let count = dec.read_var_len()?;
        let mut last_clock = 0;
        for _ in 0..count {
            let tag = dec.read_var_u64()?;
            let body = dec.read_var_bytes()?;
            let Some(op) = decode_record(client, tag, body)? else {
                log::debug!("skipping record with unknown tag {tag} from client {client}");
                continue;
            };
            if op.id.clock == 0 {
                return Err(DecodeError::ZeroClock(client));
            }
            if op.id.clock <= last_clock {
                return Err(DecodeError::OutOfOrder {
                    client,
                    clock: op.id.clock,
                });
            }
            last_clock = op.id.clock;
            ops.push(op);
        }
    }
    dec.finish()?;
    Ok(ops)
}

fn decode_record(client: ClientId, tag: u64, body: &[u8]) -> Result<Option<Op>, DecodeError> {
    let mut dec = Decoder::new(body);
    let op = match tag {
        TAG_INSERT => {
            let id = OpId::new(client, dec.read_var_u64()?);
            let left = read_origin(&mut dec)?;
            let right = read_origin(&mut dec)?;
            let content = dec.read_var_string()?;
            let mut chars = content.chars();
            let value = match (chars.next(), chars.next()) {
                (Some(c), None) => c,
                _ => return Err(DecodeError::InvalidContent(id)),
            };
            Op::insert(id, left, right, value)
        }
        TAG_DELETE => {
            let id = OpId::new(client, dec.read_var_u64()?);
            let target = OpId::new(dec.read_var_u64()?, dec.read_var_u64()?);
            Op::delete(id, target)
        }
        TAG_SET_META => {
            let id = OpId::new(client, dec.read_var_u64()?);
            let key = dec.read_var_string()?;
            let value = dec.read_var_string()?;
            Op::set_meta(id, key, value)
        }
        _ => return Ok(None),
    };
    dec.finish()?;
    Ok(Some(op))
}

fn read_origin(dec: &mut Decoder<'_>) -> Result<Option<OpId>, DecodeError> {
    match dec.read_var_u64()? {
        0 => Ok(None),
        1 => Ok(Some(OpId::new(dec.read_var_u64()?, dec.read_var_u64()?))),
        other => Err(DecodeError::InvalidOriginTag(other)),
    }
}
