use std::{fmt, ops};

use thiserror::Error;

use crate::varint::VarInt;

/// Roles in the QUIC protocol.
///
/// The least significant bit (0x01) of the [`StreamId`] identifies the
/// initiator of the stream: client-initiated streams are even-numbered,
/// server-initiated streams are odd-numbered.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Role {
    /// The initiator of a connection
    Client = 0,
    /// The acceptor of a connection
    Server = 1,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Self::Client => "client",
            Self::Server => "server",
        })
    }
}

impl ops::Not for Role {
    type Output = Self;

    fn not(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

/// Stream directions, the second least significant bit (0x02) of a [`StreamId`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Dir {
    /// Data flows in both directions
    Bi = 0,
    /// Data flows only from the stream's initiator
    Uni = 1,
}

impl fmt::Display for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Self::Bi => "bidirectional",
            Self::Uni => "unidirectional",
        })
    }
}

/// A 62-bit stream identifier, unique within one connection.
///
/// See [Stream ID Types](https://www.rfc-editor.org/rfc/rfc9000.html#name-stream-id-types)
/// of [QUIC](https://www.rfc-editor.org/rfc/rfc9000.html) for more details.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(u64);

/// Maximum ID for each type of stream, after removing the 2 type bits.
pub const MAX_STREAMS_LIMIT: u64 = (1 << 60) - 1;

impl StreamId {
    pub fn new(role: Role, dir: Dir, id: u64) -> Self {
        assert!(id <= MAX_STREAMS_LIMIT);
        Self((((id << 1) | (dir as u64)) << 1) | (role as u64))
    }

    pub fn role(&self) -> Role {
        if self.0 & 0x1 == 0 {
            Role::Client
        } else {
            Role::Server
        }
    }

    pub fn dir(&self) -> Dir {
        if self.0 & 2 == 0 { Dir::Bi } else { Dir::Uni }
    }

    /// The sequence of this stream among the streams of the same type.
    pub fn id(&self) -> u64 {
        self.0 >> 2
    }

    pub fn encoding_size(&self) -> usize {
        crate::varint::encoding_size(self.0)
    }

    fn next(&self) -> Self {
        Self(self.0 + 4)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} side {} stream {}", self.role(), self.dir(), self.id())
    }
}

impl From<VarInt> for StreamId {
    fn from(v: VarInt) -> Self {
        Self(v.into_inner())
    }
}

impl From<StreamId> for u64 {
    fn from(s: StreamId) -> Self {
        s.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StreamIdError {
    #[error("no more {0} streams can be opened, limit {1}")]
    ExceedLocalLimit(Dir, u64),
    #[error("{0} exceeds the advertised limit {1}")]
    ExceedRemoteLimit(StreamId, u64),
    #[error("{0} is initiated by the local endpoint and was never opened")]
    NotOpened(StreamId),
}

/// The result of accepting a stream id received from the peer.
#[derive(Debug, PartialEq)]
pub enum AcceptSid {
    /// The stream has already been created, or has already been closed.
    Old,
    /// The stream is new, together with every lower stream of the same type
    /// that was implicitly opened.
    New(NeedCreate),
}

/// The streams implicitly opened by receiving a higher stream id.
#[derive(Debug, PartialEq)]
pub struct NeedCreate {
    start: StreamId,
    end: StreamId,
}

impl Iterator for NeedCreate {
    type Item = StreamId;

    fn next(&mut self) -> Option<Self::Item> {
        if self.start > self.end {
            None
        } else {
            let id = self.start;
            self.start = self.start.next();
            Some(id)
        }
    }
}

/// Allocates the stream ids of one connection, monotonically per direction
/// and per initiator.
#[derive(Debug)]
pub struct StreamIds {
    role: Role,
    // indexed by Dir
    local_next: [u64; 2],
    local_max: [u64; 2],
    remote_next: [u64; 2],
    remote_max: [u64; 2],
}

impl StreamIds {
    /// `local_max` is the number of streams the peer allows us to open,
    /// `remote_max` the number we allow the peer to open, both `[bi, uni]`.
    pub fn new(role: Role, local_max: [u64; 2], remote_max: [u64; 2]) -> Self {
        Self {
            role,
            local_next: [0, 0],
            local_max,
            remote_next: [0, 0],
            remote_max,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Allocate the next locally initiated stream id in direction `dir`.
    pub fn open(&mut self, dir: Dir) -> Result<StreamId, StreamIdError> {
        let idx = dir as usize;
        if self.local_next[idx] >= self.local_max[idx] {
            return Err(StreamIdError::ExceedLocalLimit(dir, self.local_max[idx]));
        }
        let sid = StreamId::new(self.role, dir, self.local_next[idx]);
        self.local_next[idx] += 1;
        Ok(sid)
    }

    /// How many more streams of `dir` can be opened locally.
    pub fn available(&self, dir: Dir) -> u64 {
        let idx = dir as usize;
        self.local_max[idx].saturating_sub(self.local_next[idx])
    }

    /// Raise the local limit, as a MAX_STREAMS frame from the peer does.
    /// Returns true if the limit increased; lower limits are ignored.
    pub fn increase_local_limit(&mut self, dir: Dir, max: u64) -> bool {
        let slot = &mut self.local_max[dir as usize];
        if max > *slot {
            *slot = max.min(MAX_STREAMS_LIMIT);
            true
        } else {
            false
        }
    }

    /// Check a stream id carried in a frame from the peer.
    ///
    /// For locally initiated streams this only validates that the stream was
    /// opened; for peer initiated streams this creates it (and any lower
    /// stream of the same type) if it is new.
    pub fn accept(&mut self, sid: StreamId) -> Result<AcceptSid, StreamIdError> {
        let idx = sid.dir() as usize;
        if sid.role() == self.role {
            return if sid.id() < self.local_next[idx] {
                Ok(AcceptSid::Old)
            } else {
                Err(StreamIdError::NotOpened(sid))
            };
        }
        if sid.id() >= self.remote_max[idx] {
            return Err(StreamIdError::ExceedRemoteLimit(sid, self.remote_max[idx]));
        }
        if sid.id() < self.remote_next[idx] {
            return Ok(AcceptSid::Old);
        }
        let start = StreamId::new(sid.role(), sid.dir(), self.remote_next[idx]);
        self.remote_next[idx] = sid.id() + 1;
        Ok(AcceptSid::New(NeedCreate { start, end: sid }))
    }
}
