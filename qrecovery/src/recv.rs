use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use qbase::{
    error::{ErrorKind, TransportError},
    frame::{FrameType, StreamFrame},
    sid::StreamId,
    varint::VarInt,
};

use crate::ranges::RangeSet;

/// The receiving part of a stream: reassembles out of order STREAM frames
/// and hands contiguous bytes to the application.
#[derive(Debug)]
pub struct RecvBuffer {
    sid: StreamId,
    // non-overlapping segments not yet consumed, keyed by offset
    segments: BTreeMap<u64, Bytes>,
    rcvd: RangeSet,
    read: u64,
    final_size: Option<u64>,
    max_stream_data: u64,
    window: u64,
    reset: Option<VarInt>,
    stop_sending: Option<VarInt>,
    end_delivered: bool,
}

impl RecvBuffer {
    /// `window` is the flow control credit granted to the peer, kept ahead
    /// of the read offset as the application consumes data.
    pub fn new(sid: StreamId, window: u64) -> Self {
        Self {
            sid,
            segments: BTreeMap::new(),
            rcvd: RangeSet::new(),
            read: 0,
            final_size: None,
            max_stream_data: window,
            window,
            reset: None,
            stop_sending: None,
            end_delivered: false,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.sid
    }

    /// Buffer a STREAM frame, returning how many bytes past the previous
    /// largest received offset it carried, which is what it costs in
    /// connection level flow control.
    pub fn recv(&mut self, frame: &StreamFrame) -> Result<u64, TransportError> {
        let range = frame.range();
        if range.end > self.max_stream_data {
            return Err(TransportError::new(
                ErrorKind::FlowControl,
                Some(FrameType::Stream),
                format!("{} exceeds stream credit {}", self.sid, self.max_stream_data),
            ));
        }
        self.check_final_size(range.end, frame.fin)?;
        let largest_before = self.largest();
        if frame.fin {
            self.final_size = Some(range.end);
        }
        if self.reset.is_some() || self.stop_sending.is_some() {
            return Ok(range.end.saturating_sub(largest_before));
        }

        let start = range.start.max(self.read);
        for gap in self.rcvd.gaps_in(start..range.end) {
            let from = (gap.start - range.start) as usize;
            let to = (gap.end - range.start) as usize;
            self.segments.insert(gap.start, frame.data.slice(from..to));
        }
        self.rcvd.insert(range.clone());
        Ok(range.end.saturating_sub(largest_before))
    }

    fn check_final_size(&self, end: u64, fin: bool) -> Result<(), TransportError> {
        let error = |reason: String| {
            Err(TransportError::new(
                ErrorKind::FinalSize,
                Some(FrameType::Stream),
                reason,
            ))
        };
        match self.final_size {
            Some(size) if end > size || (fin && end != size) => {
                error(format!("{} final size {size} changed to {end}", self.sid))
            }
            None if fin && end < self.largest() => {
                error(format!("{} final size {end} below received data", self.sid))
            }
            _ => Ok(()),
        }
    }

    fn largest(&self) -> u64 {
        self.rcvd.max().map_or(0, |max| max + 1).max(self.read)
    }

    /// Bytes readable right now without a gap.
    pub fn readable(&self) -> u64 {
        self.rcvd.contiguous_end(self.read) - self.read
    }

    /// Data is readable, or the end of the stream (or its reset) has not
    /// been reported to the application yet.
    pub fn is_readable(&self) -> bool {
        !self.end_delivered
            && (self.readable() > 0
                || self.reset.is_some()
                || self.final_size == Some(self.read))
    }

    /// Consume up to `max` contiguous bytes. The flag tells whether the end
    /// of the stream has been reached.
    pub fn read(&mut self, max: usize) -> (Bytes, bool) {
        let mut out = BytesMut::new();
        while out.len() < max {
            let Some(mut entry) = self.segments.first_entry() else {
                break;
            };
            if *entry.key() != self.read {
                break;
            }
            let room = max - out.len();
            let segment = entry.get_mut();
            if segment.len() <= room {
                out.extend_from_slice(segment);
                self.read += segment.len() as u64;
                entry.remove();
            } else {
                let head = segment.split_to(room);
                out.extend_from_slice(&head);
                self.read += room as u64;
                let rest = entry.remove();
                self.segments.insert(self.read, rest);
            }
        }
        self.rcvd.remove_below(self.read);
        let fin = self.final_size == Some(self.read);
        self.end_delivered |= fin;
        (out.freeze(), fin)
    }

    /// The buffered segments in offset order, without consuming them.
    pub fn peek(&self) -> impl Iterator<Item = (u64, &Bytes)> {
        self.segments.iter().map(|(&offset, data)| (offset, data))
    }

    pub fn read_offset(&self) -> u64 {
        self.read
    }

    pub fn final_size(&self) -> Option<u64> {
        self.final_size
    }

    /// Everything up to the final size has been read.
    pub fn is_finished(&self) -> bool {
        self.final_size == Some(self.read) || self.reset.is_some()
    }

    /// A new MAX_STREAM_DATA worth announcing, once the application has
    /// consumed half of the window.
    pub fn window_update(&mut self) -> Option<u64> {
        if self.final_size.is_some() || self.reset.is_some() || self.stop_sending.is_some() {
            return None;
        }
        let target = self.read + self.window;
        if target - self.max_stream_data >= self.window / 2 {
            self.max_stream_data = target;
            Some(target)
        } else {
            None
        }
    }

    pub fn max_stream_data(&self) -> u64 {
        self.max_stream_data
    }

    /// The peer skipped everything below `offset`. Returns true if the read
    /// offset moved.
    pub fn on_data_expired(&mut self, offset: u64) -> bool {
        if offset <= self.read {
            return false;
        }
        self.skip_to(offset);
        true
    }

    /// Locally give up on everything below `offset`.
    pub fn reject(&mut self, offset: u64) -> Option<u64> {
        if offset <= self.read || self.final_size.is_some_and(|size| offset > size) {
            return None;
        }
        self.skip_to(offset);
        Some(offset)
    }

    fn skip_to(&mut self, offset: u64) {
        let kept = self.segments.split_off(&offset);
        // keep the tail of a segment straddling the new read offset
        if let Some((&start, data)) = self.segments.last_key_value() {
            let end = start + data.len() as u64;
            if end > offset {
                let tail = data.slice((offset - start) as usize..);
                self.segments = kept;
                self.segments.insert(offset, tail);
            } else {
                self.segments = kept;
            }
        } else {
            self.segments = kept;
        }
        self.read = offset;
        self.rcvd.remove_below(offset);
    }

    /// RESET_STREAM from the peer.
    pub fn on_reset(&mut self, error_code: VarInt, final_size: u64) -> Result<(), TransportError> {
        match self.final_size {
            Some(size) if size != final_size => {
                return Err(TransportError::new(
                    ErrorKind::FinalSize,
                    Some(FrameType::ResetStream),
                    format!("{} final size {size} changed to {final_size}", self.sid),
                ));
            }
            _ if final_size < self.largest() => {
                return Err(TransportError::new(
                    ErrorKind::FinalSize,
                    Some(FrameType::ResetStream),
                    format!("{} final size {final_size} below received data", self.sid),
                ));
            }
            _ => {}
        }
        self.final_size = Some(final_size);
        self.reset = Some(error_code);
        self.segments.clear();
        Ok(())
    }

    pub fn reset_code(&self) -> Option<VarInt> {
        self.reset
    }

    /// The application no longer reads; buffered data is dropped and later
    /// data discarded. Returns false if already stopped.
    pub fn stop(&mut self, error_code: VarInt) -> bool {
        if self.stop_sending.is_some() {
            return false;
        }
        self.stop_sending = Some(error_code);
        self.segments.clear();
        true
    }
}
