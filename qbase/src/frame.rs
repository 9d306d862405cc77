//! The frames a packet can carry, described by type and encoded size.
//!
//! Serializing frames to bytes is the business of the wire codec (see
//! [`crate::codec`]); everything above it only needs to know what a frame is
//! and how many bytes it will occupy.

use bitflags::bitflags;
use bytes::Bytes;
use enum_dispatch::enum_dispatch;

use crate::{
    cid::{ConnectionId, ResetToken},
    error::{ApplicationError, ErrorKind, QuicError, TransportError},
    sid::{Dir, StreamId},
    varint::{VarInt, encoding_size},
};

bitflags! {
    /// The special rules governing a frame type.
    ///
    /// See [table-3](https://www.rfc-editor.org/rfc/rfc9000.html#table-3)
    /// of [QUIC](https://www.rfc-editor.org/rfc/rfc9000.html) for more details.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameSpecs: u8 {
        /// Packets containing only frames with this marking are not ack-eliciting.
        const NON_ACK_ELICITING = 1;
        /// Packets containing only frames with this marking do not count toward
        /// bytes in flight for congestion control purposes.
        const CONGESTION_CONTROL_FREE = 2;
        /// Packets containing only frames with this marking can be used to probe
        /// new network paths during connection migration.
        const PROBE_NEW_PATH = 4;
        /// The contents of frames with this marking are flow controlled.
        const FLOW_CONTROLLED = 8;
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum FrameType {
    Padding,
    Ping,
    Ack,
    ResetStream,
    StopSending,
    Crypto,
    NewToken,
    Stream,
    MaxData,
    MaxStreamData,
    MaxStreams(Dir),
    DataBlocked,
    StreamDataBlocked,
    StreamsBlocked(Dir),
    NewConnectionId,
    RetireConnectionId,
    PathChallenge,
    PathResponse,
    ConnectionClose,
    ConnectionCloseApp,
    HandshakeDone,
    // partial reliability extension
    ExpiredStreamData,
    MinStreamData,
}

impl FrameType {
    pub fn specs(&self) -> FrameSpecs {
        match self {
            FrameType::Padding => FrameSpecs::NON_ACK_ELICITING | FrameSpecs::PROBE_NEW_PATH,
            FrameType::Ack | FrameType::ConnectionClose | FrameType::ConnectionCloseApp => {
                FrameSpecs::NON_ACK_ELICITING | FrameSpecs::CONGESTION_CONTROL_FREE
            }
            FrameType::NewConnectionId | FrameType::PathChallenge | FrameType::PathResponse => {
                FrameSpecs::PROBE_NEW_PATH
            }
            FrameType::Stream => FrameSpecs::FLOW_CONTROLLED,
            _ => FrameSpecs::empty(),
        }
    }
}

/// Define the basic behaviors for all kinds of frames
#[enum_dispatch]
pub trait BeFrame {
    fn frame_type(&self) -> FrameType;

    /// The exact number of bytes this frame occupies once encoded.
    fn encoding_size(&self) -> usize;

    fn specs(&self) -> FrameSpecs {
        self.frame_type().specs()
    }
}

/// A run of `n` PADDING bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaddingFrame(pub usize);

impl BeFrame for PaddingFrame {
    fn frame_type(&self) -> FrameType {
        FrameType::Padding
    }

    fn encoding_size(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingFrame;

impl BeFrame for PingFrame {
    fn frame_type(&self) -> FrameType {
        FrameType::Ping
    }

    fn encoding_size(&self) -> usize {
        1
    }
}

/// ACK frame. `ranges` holds the `(gap, ack_range_length)` pairs that follow
/// the first range, in descending packet number order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    pub largest: u64,
    pub delay: u64,
    pub first_range: u64,
    pub ranges: Vec<(u64, u64)>,
}

impl AckFrame {
    /// The acknowledged packet numbers as inclusive ranges, largest first.
    pub fn iter_ranges(&self) -> impl Iterator<Item = std::ops::RangeInclusive<u64>> + '_ {
        let first = self.largest.saturating_sub(self.first_range)..=self.largest;
        let mut smallest = *first.start();
        std::iter::once(first).chain(self.ranges.iter().map_while(move |&(gap, ack)| {
            let largest = smallest.checked_sub(gap + 2)?;
            smallest = largest.checked_sub(ack)?;
            Some(smallest..=largest)
        }))
    }
}

impl BeFrame for AckFrame {
    fn frame_type(&self) -> FrameType {
        FrameType::Ack
    }

    fn encoding_size(&self) -> usize {
        1 + encoding_size(self.largest)
            + encoding_size(self.delay)
            + encoding_size(self.ranges.len() as u64)
            + encoding_size(self.first_range)
            + self
                .ranges
                .iter()
                .map(|&(gap, ack)| encoding_size(gap) + encoding_size(ack))
                .sum::<usize>()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetStreamFrame {
    pub stream_id: StreamId,
    pub app_error_code: VarInt,
    pub final_size: u64,
}

impl BeFrame for ResetStreamFrame {
    fn frame_type(&self) -> FrameType {
        FrameType::ResetStream
    }

    fn encoding_size(&self) -> usize {
        1 + self.stream_id.encoding_size()
            + self.app_error_code.encoding_size()
            + encoding_size(self.final_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopSendingFrame {
    pub stream_id: StreamId,
    pub app_error_code: VarInt,
}

impl BeFrame for StopSendingFrame {
    fn frame_type(&self) -> FrameType {
        FrameType::StopSending
    }

    fn encoding_size(&self) -> usize {
        1 + self.stream_id.encoding_size() + self.app_error_code.encoding_size()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoFrame {
    pub offset: u64,
    pub data: Bytes,
}

impl CryptoFrame {
    /// How many bytes of crypto data starting at `offset` fit in `capacity`.
    pub fn max_data_len(offset: u64, capacity: usize) -> usize {
        data_len_within(capacity.saturating_sub(1 + encoding_size(offset)))
    }
}

impl BeFrame for CryptoFrame {
    fn frame_type(&self) -> FrameType {
        FrameType::Crypto
    }

    fn encoding_size(&self) -> usize {
        let len = self.data.len() as u64;
        1 + encoding_size(self.offset) + encoding_size(len) + self.data.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub stream_id: StreamId,
    pub offset: u64,
    pub data: Bytes,
    pub fin: bool,
}

impl StreamFrame {
    /// Size of the frame header for a frame carrying `len` bytes. The offset
    /// field is omitted for offset 0, the length field is always present.
    pub fn header_size(stream_id: StreamId, offset: u64, len: usize) -> usize {
        let offset_size = if offset == 0 { 0 } else { encoding_size(offset) };
        1 + stream_id.encoding_size() + offset_size + encoding_size(len as u64)
    }

    /// How many bytes of stream data starting at `offset` fit in `capacity`.
    /// Returns 0 if not even the header fits.
    pub fn max_data_len(stream_id: StreamId, offset: u64, capacity: usize) -> usize {
        let offset_size = if offset == 0 { 0 } else { encoding_size(offset) };
        let fixed = 1 + stream_id.encoding_size() + offset_size;
        data_len_within(capacity.saturating_sub(fixed))
    }

    /// The range of stream offsets this frame carries.
    pub fn range(&self) -> std::ops::Range<u64> {
        self.offset..self.offset + self.data.len() as u64
    }
}

impl BeFrame for StreamFrame {
    fn frame_type(&self) -> FrameType {
        FrameType::Stream
    }

    fn encoding_size(&self) -> usize {
        Self::header_size(self.stream_id, self.offset, self.data.len()) + self.data.len()
    }
}

// The largest n such that a varint length of n plus n bytes fits in `room`.
fn data_len_within(room: usize) -> usize {
    let mut len = room.saturating_sub(1);
    while len > 0 && encoding_size(len as u64) + len > room {
        len -= 1;
    }
    len
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxDataFrame {
    pub max_data: VarInt,
}

impl BeFrame for MaxDataFrame {
    fn frame_type(&self) -> FrameType {
        FrameType::MaxData
    }

    fn encoding_size(&self) -> usize {
        1 + self.max_data.encoding_size()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxStreamDataFrame {
    pub stream_id: StreamId,
    pub max_stream_data: VarInt,
}

impl BeFrame for MaxStreamDataFrame {
    fn frame_type(&self) -> FrameType {
        FrameType::MaxStreamData
    }

    fn encoding_size(&self) -> usize {
        1 + self.stream_id.encoding_size() + self.max_stream_data.encoding_size()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxStreamsFrame {
    pub dir: Dir,
    pub max_streams: VarInt,
}

impl BeFrame for MaxStreamsFrame {
    fn frame_type(&self) -> FrameType {
        FrameType::MaxStreams(self.dir)
    }

    fn encoding_size(&self) -> usize {
        1 + self.max_streams.encoding_size()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataBlockedFrame {
    pub limit: VarInt,
}

impl BeFrame for DataBlockedFrame {
    fn frame_type(&self) -> FrameType {
        FrameType::DataBlocked
    }

    fn encoding_size(&self) -> usize {
        1 + self.limit.encoding_size()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDataBlockedFrame {
    pub stream_id: StreamId,
    pub limit: VarInt,
}

impl BeFrame for StreamDataBlockedFrame {
    fn frame_type(&self) -> FrameType {
        FrameType::StreamDataBlocked
    }

    fn encoding_size(&self) -> usize {
        1 + self.stream_id.encoding_size() + self.limit.encoding_size()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewConnectionIdFrame {
    pub sequence: VarInt,
    pub retire_prior_to: VarInt,
    pub id: ConnectionId,
    pub reset_token: ResetToken,
}

impl BeFrame for NewConnectionIdFrame {
    fn frame_type(&self) -> FrameType {
        FrameType::NewConnectionId
    }

    fn encoding_size(&self) -> usize {
        1 + self.sequence.encoding_size()
            + self.retire_prior_to.encoding_size()
            + self.id.encoding_size()
            + self.reset_token.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetireConnectionIdFrame {
    pub sequence: VarInt,
}

impl BeFrame for RetireConnectionIdFrame {
    fn frame_type(&self) -> FrameType {
        FrameType::RetireConnectionId
    }

    fn encoding_size(&self) -> usize {
        1 + self.sequence.encoding_size()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathChallengeFrame {
    pub data: [u8; 8],
}

impl BeFrame for PathChallengeFrame {
    fn frame_type(&self) -> FrameType {
        FrameType::PathChallenge
    }

    fn encoding_size(&self) -> usize {
        1 + self.data.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathResponseFrame {
    pub data: [u8; 8],
}

impl BeFrame for PathResponseFrame {
    fn frame_type(&self) -> FrameType {
        FrameType::PathResponse
    }

    fn encoding_size(&self) -> usize {
        1 + self.data.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCloseFrame {
    pub error_code: VarInt,
    /// Absent in the application variant.
    pub frame_type: Option<FrameType>,
    pub reason: String,
    pub is_application: bool,
}

impl From<&QuicError> for ConnectionCloseFrame {
    fn from(error: &QuicError) -> Self {
        match error {
            QuicError::Transport(e) => Self {
                error_code: e.kind().into(),
                frame_type: Some(e.frame_type().unwrap_or(FrameType::Padding)),
                reason: e.reason().to_owned(),
                is_application: false,
            },
            QuicError::Application(e) => Self {
                error_code: e.code(),
                frame_type: None,
                reason: e.reason().to_owned(),
                is_application: true,
            },
        }
    }
}

impl From<&ConnectionCloseFrame> for QuicError {
    /// The error a peer closed the connection with. Unknown transport codes
    /// are read as protocol violations.
    fn from(frame: &ConnectionCloseFrame) -> Self {
        if frame.is_application {
            ApplicationError::new(frame.error_code, frame.reason.clone()).into()
        } else {
            let kind = ErrorKind::from_code(frame.error_code).unwrap_or(ErrorKind::ProtocolViolation);
            TransportError::new(kind, frame.frame_type, frame.reason.clone()).into()
        }
    }
}

impl BeFrame for ConnectionCloseFrame {
    fn frame_type(&self) -> FrameType {
        if self.is_application {
            FrameType::ConnectionCloseApp
        } else {
            FrameType::ConnectionClose
        }
    }

    fn encoding_size(&self) -> usize {
        let frame_type_size = if self.is_application { 0 } else { 1 };
        1 + self.error_code.encoding_size()
            + frame_type_size
            + encoding_size(self.reason.len() as u64)
            + self.reason.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeDoneFrame;

impl BeFrame for HandshakeDoneFrame {
    fn frame_type(&self) -> FrameType {
        FrameType::HandshakeDone
    }

    fn encoding_size(&self) -> usize {
        1
    }
}

/// Sent by the data sender: bytes below `minimum_stream_offset` will never be
/// (re)transmitted and the receiver should skip them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiredStreamDataFrame {
    pub stream_id: StreamId,
    pub minimum_stream_offset: u64,
}

impl BeFrame for ExpiredStreamDataFrame {
    fn frame_type(&self) -> FrameType {
        FrameType::ExpiredStreamData
    }

    fn encoding_size(&self) -> usize {
        // two-byte extension frame type
        2 + self.stream_id.encoding_size() + encoding_size(self.minimum_stream_offset)
    }
}

/// Sent by the data receiver: it no longer wants bytes below
/// `minimum_stream_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinStreamDataFrame {
    pub stream_id: StreamId,
    pub maximum_data: VarInt,
    pub minimum_stream_offset: u64,
}

impl BeFrame for MinStreamDataFrame {
    fn frame_type(&self) -> FrameType {
        FrameType::MinStreamData
    }

    fn encoding_size(&self) -> usize {
        2 + self.stream_id.encoding_size()
            + self.maximum_data.encoding_size()
            + encoding_size(self.minimum_stream_offset)
    }
}

/// The sum type of every frame this transport writes or reacts to.
#[enum_dispatch(BeFrame)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Padding(PaddingFrame),
    Ping(PingFrame),
    Ack(AckFrame),
    ResetStream(ResetStreamFrame),
    StopSending(StopSendingFrame),
    Crypto(CryptoFrame),
    Stream(StreamFrame),
    MaxData(MaxDataFrame),
    MaxStreamData(MaxStreamDataFrame),
    MaxStreams(MaxStreamsFrame),
    DataBlocked(DataBlockedFrame),
    StreamDataBlocked(StreamDataBlockedFrame),
    NewConnectionId(NewConnectionIdFrame),
    RetireConnectionId(RetireConnectionIdFrame),
    PathChallenge(PathChallengeFrame),
    PathResponse(PathResponseFrame),
    ConnectionClose(ConnectionCloseFrame),
    HandshakeDone(HandshakeDoneFrame),
    ExpiredStreamData(ExpiredStreamDataFrame),
    MinStreamData(MinStreamDataFrame),
}
