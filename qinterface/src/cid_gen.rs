use std::hash::{DefaultHasher, Hasher};

use qbase::cid::{ConnectionId, MAX_CID_SIZE};
use rand::Rng;

use crate::{WorkerId, router::RouteError};

/// Shortest id able to carry a worker tag: one random byte, the two bytes
/// of the worker id and the check byte.
pub const MIN_TAGGED_CID_SIZE: usize = 4;

/// Generates server connection ids that name the worker owning them, so
/// that a dispatcher can shard datagrams without looking up the routing
/// table.
///
/// # Format
///
/// - Byte 0: random
/// - Bytes 1-2: worker id (u16 big-endian)
/// - Bytes 3..len-1: random
/// - Last byte: check byte, the low byte of a SipHash over the others
///
/// The check byte tells our ids apart from the ids chosen by clients in
/// their first flight, which are random.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidGenerator {
    worker: WorkerId,
    len: usize,
}

impl CidGenerator {
    pub fn new(worker: WorkerId, len: usize) -> Result<Self, RouteError> {
        if !(MIN_TAGGED_CID_SIZE..=MAX_CID_SIZE).contains(&len) {
            return Err(RouteError::InvalidCidLength(len));
        }
        Ok(Self { worker, len })
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn cid_len(&self) -> usize {
        self.len
    }

    /// A fresh id. It may collide with one already in use, the router
    /// checks that when the id becomes available.
    pub fn generate(&self) -> ConnectionId {
        let mut bytes = [0u8; MAX_CID_SIZE];
        let bytes = &mut bytes[..self.len];
        rand::rng().fill(&mut bytes[..]);
        bytes[1..3].copy_from_slice(&self.worker.0.to_be_bytes());
        let last = self.len - 1;
        bytes[last] = check_byte(&bytes[..last]);
        ConnectionId::from_slice(bytes)
    }
}

fn check_byte(bytes: &[u8]) -> u8 {
    let mut hasher = DefaultHasher::new();
    hasher.write(bytes);
    hasher.finish() as u8
}

/// The worker named by `cid`, if it is a tagged id of length `cid_len`.
///
/// A random id passes the check byte with a chance of 1/256; the router
/// still has the final word on who owns it.
pub fn worker_of(cid: &ConnectionId, cid_len: usize) -> Option<WorkerId> {
    if cid.len() != cid_len || cid_len < MIN_TAGGED_CID_SIZE {
        return None;
    }
    let (body, check) = cid.split_at(cid_len - 1);
    if check_byte(body) != check[0] {
        return None;
    }
    Some(WorkerId(u16::from_be_bytes([body[1], body[2]])))
}
