use std::ops::Range;

use bytes::{Buf, Bytes, BytesMut};
use qbase::{error::LocalError, frame::StreamFrame, sid::StreamId, varint::VarInt};

use crate::ranges::RangeSet;

/// The sending part of a stream.
///
/// Application data is appended at the tail and stays buffered until it is
/// acknowledged (or expired). Fresh data leaves in offset order, so the
/// transmitted prefix is always contiguous; lost ranges are queued for
/// retransmission separately and take precedence over fresh data.
#[derive(Debug)]
pub struct SendBuffer {
    sid: StreamId,
    // bytes from `base` up to `written`
    data: BytesMut,
    base: u64,
    written: u64,
    // next fresh offset, everything below has been transmitted at least once
    sent: u64,
    acked: RangeSet,
    lost: RangeSet,
    fin: FinState,
    max_stream_data: u64,
    expired: u64,
    reset: Option<VarInt>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum FinState {
    #[default]
    Open,
    Written,
    Sent,
    Lost,
    Acked,
}

impl SendBuffer {
    /// `max_stream_data` is the initial credit the peer grants this stream.
    pub fn new(sid: StreamId, max_stream_data: u64) -> Self {
        Self {
            sid,
            data: BytesMut::new(),
            base: 0,
            written: 0,
            sent: 0,
            acked: RangeSet::new(),
            lost: RangeSet::new(),
            fin: FinState::Open,
            max_stream_data,
            expired: 0,
            reset: None,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.sid
    }

    /// Append application data, optionally closing the stream.
    /// Returns the stream offset after the appended data.
    pub fn write(&mut self, data: &[u8], fin: bool) -> Result<u64, LocalError> {
        if self.reset.is_some() || self.fin != FinState::Open {
            return Err(LocalError::StreamClosed(self.sid));
        }
        self.data.extend_from_slice(data);
        self.written += data.len() as u64;
        if fin {
            self.fin = FinState::Written;
        }
        Ok(self.written)
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// The highest offset transmitted so far plus one.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn is_writable(&self) -> bool {
        self.reset.is_none() && self.fin == FinState::Open
    }

    pub fn is_reset(&self) -> bool {
        self.reset.is_some()
    }

    /// Bytes the application may still buffer before outrunning peer credit.
    pub fn write_window(&self) -> u64 {
        self.max_stream_data.saturating_sub(self.written)
    }

    pub fn max_stream_data(&self) -> u64 {
        self.max_stream_data
    }

    /// Apply a MAX_STREAM_DATA from the peer; returns true if credit grew.
    pub fn increase_max_data(&mut self, max: u64) -> bool {
        if max > self.max_stream_data {
            self.max_stream_data = max;
            true
        } else {
            false
        }
    }

    pub fn has_lost(&self) -> bool {
        self.reset.is_none() && (!self.lost.is_empty() || self.fin == FinState::Lost)
    }

    /// Fresh data (or a bare FIN) waiting for its first transmission, whether
    /// or not flow control currently allows it.
    pub fn has_pending(&self) -> bool {
        self.reset.is_none() && (self.sent < self.written || self.fin == FinState::Written)
    }

    /// Fresh data is waiting but the peer's stream credit is used up.
    pub fn is_flow_blocked(&self) -> bool {
        self.reset.is_none() && self.sent < self.written && self.sent >= self.max_stream_data
    }

    /// Take the first lost range that fits in `capacity` bytes of frame.
    /// Retransmissions are not subject to flow control.
    pub fn pick_lost(&mut self, capacity: usize) -> Option<StreamFrame> {
        if self.reset.is_some() {
            return None;
        }
        let Some(range) = self.lost.iter().next() else {
            if self.fin == FinState::Lost {
                return self.pick_bare_fin(capacity);
            }
            return None;
        };
        let max = StreamFrame::max_data_len(self.sid, range.start, capacity) as u64;
        if max == 0 {
            return None;
        }
        let end = range.end.min(range.start + max);
        let fin = end == self.written && self.fin == FinState::Lost;
        self.lost.remove_range(range.start..end);
        if fin {
            self.fin = FinState::Sent;
        }
        Some(self.frame(range.start..end, fin))
    }

    /// Take fresh data for one frame of at most `capacity` bytes, limited by
    /// the stream credit and the connection `credit`. Returns the frame and
    /// the connection credit it consumed.
    pub fn pick_fresh(&mut self, capacity: usize, credit: u64) -> Option<(StreamFrame, u64)> {
        if self.reset.is_some() {
            return None;
        }
        let limit = self.written.min(self.max_stream_data).min(self.sent.saturating_add(credit));
        if self.sent >= limit {
            // nothing more may be sent but a FIN at the very end
            return match self.fin {
                FinState::Written if self.sent == self.written => {
                    self.pick_bare_fin(capacity).map(|frame| (frame, 0))
                }
                _ => None,
            };
        }
        let max = StreamFrame::max_data_len(self.sid, self.sent, capacity) as u64;
        if max == 0 {
            return None;
        }
        let start = self.sent;
        let end = limit.min(start + max);
        let fin = end == self.written && self.fin == FinState::Written;
        self.sent = end;
        if fin {
            self.fin = FinState::Sent;
        }
        Some((self.frame(start..end, fin), end - start))
    }

    fn pick_bare_fin(&mut self, capacity: usize) -> Option<StreamFrame> {
        let frame = StreamFrame {
            stream_id: self.sid,
            offset: self.written,
            data: Bytes::new(),
            fin: true,
        };
        if StreamFrame::header_size(self.sid, self.written, 0) > capacity {
            return None;
        }
        self.fin = FinState::Sent;
        Some(frame)
    }

    fn frame(&self, range: Range<u64>, fin: bool) -> StreamFrame {
        let start = (range.start - self.base) as usize;
        let end = (range.end - self.base) as usize;
        StreamFrame {
            stream_id: self.sid,
            offset: range.start,
            data: Bytes::copy_from_slice(&self.data[start..end]),
            fin,
        }
    }

    /// The packet carrying `range` (and the FIN if `fin`) was acknowledged.
    pub fn on_acked(&mut self, range: Range<u64>, fin: bool) {
        self.acked.insert(range.clone());
        self.lost.remove_range(range);
        if fin {
            self.fin = FinState::Acked;
        }
        self.release_acked_prefix();
    }

    /// The packet carrying `range` was declared lost: queue whatever of it is
    /// still unacknowledged and not expired.
    pub fn on_lost(&mut self, range: Range<u64>, fin: bool) {
        if self.reset.is_some() {
            return;
        }
        let range = range.start.max(self.expired)..range.end;
        if range.is_empty() && !fin {
            return;
        }
        for gap in self.acked.gaps_in(range) {
            self.lost.insert(gap);
        }
        if fin && self.fin == FinState::Sent {
            self.fin = FinState::Lost;
        }
    }

    fn release_acked_prefix(&mut self) {
        let acked_end = self.acked.contiguous_end(0).min(self.written);
        if acked_end > self.base {
            self.data.advance((acked_end - self.base) as usize);
            self.base = acked_end;
        }
    }

    /// The highest offset of the contiguously transmitted prefix.
    pub fn tx_frontier(&self) -> Option<u64> {
        self.sent.checked_sub(1)
    }

    /// The highest offset of the contiguously acknowledged prefix.
    pub fn ack_frontier(&self) -> Option<u64> {
        self.acked.contiguous_end(0).checked_sub(1)
    }

    /// All data and the FIN have been acknowledged.
    pub fn is_fully_acked(&self) -> bool {
        self.fin == FinState::Acked && self.acked.contiguous_end(0) >= self.written
    }

    /// Give up on delivering anything below `offset`. Returns the new
    /// minimum offset if it advanced, which then has to be announced to the
    /// peer; data below it is neither retransmitted nor sent for the first time.
    pub fn expire(&mut self, offset: u64) -> Option<u64> {
        let offset = offset.min(self.written);
        if offset <= self.expired || self.reset.is_some() {
            return None;
        }
        self.expired = offset;
        self.lost.remove_below(offset);
        self.sent = self.sent.max(offset);
        self.acked.insert(0..offset);
        self.release_acked_prefix();
        Some(offset)
    }

    /// The peer does not want anything below `offset` any more.
    pub fn on_rejected(&mut self, offset: u64) -> Option<u64> {
        self.expire(offset)
    }

    pub fn expired_offset(&self) -> u64 {
        self.expired
    }

    /// Abandon the stream, returning the final size to put in RESET_STREAM.
    pub fn reset(&mut self, error_code: VarInt) -> Result<u64, LocalError> {
        if self.reset.is_some() || self.is_fully_acked() {
            return Err(LocalError::StreamClosed(self.sid));
        }
        self.reset = Some(error_code);
        self.lost = RangeSet::new();
        Ok(self.sent)
    }

    pub fn reset_code(&self) -> Option<VarInt> {
        self.reset
    }
}
