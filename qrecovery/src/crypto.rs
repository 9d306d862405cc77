use std::ops::Range;

use bytes::{Buf, Bytes, BytesMut};
use qbase::frame::CryptoFrame;

use crate::ranges::RangeSet;

/// The outgoing crypto stream of one epoch.
///
/// Handshake messages are not flow controlled and never reset, so this is
/// the send buffer of a stream stripped down to transmission, loss and
/// acknowledgment. Lost ranges are resent before fresh data.
#[derive(Debug, Default)]
pub struct CryptoStream {
    data: BytesMut,
    base: u64,
    written: u64,
    sent: u64,
    acked: RangeSet,
    lost: RangeSet,
}

impl CryptoStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append handshake bytes produced by the TLS collaborator.
    pub fn write(&mut self, data: &[u8]) -> u64 {
        self.data.extend_from_slice(data);
        self.written += data.len() as u64;
        self.written
    }

    pub fn has_pending(&self) -> bool {
        !self.lost.is_empty() || self.sent < self.written
    }

    pub fn has_lost(&self) -> bool {
        !self.lost.is_empty()
    }

    /// Take a frame of at most `capacity` bytes, retransmissions first.
    pub fn pick(&mut self, capacity: usize) -> Option<CryptoFrame> {
        self.pick_lost(capacity).or_else(|| self.pick_fresh(capacity))
    }

    pub fn pick_lost(&mut self, capacity: usize) -> Option<CryptoFrame> {
        let range = self.lost.iter().next()?;
        let max = CryptoFrame::max_data_len(range.start, capacity) as u64;
        if max == 0 {
            return None;
        }
        let range = range.start..range.end.min(range.start + max);
        self.lost.remove_range(range.clone());
        Some(self.frame(range))
    }

    pub fn pick_fresh(&mut self, capacity: usize) -> Option<CryptoFrame> {
        if self.sent >= self.written {
            return None;
        }
        let max = CryptoFrame::max_data_len(self.sent, capacity) as u64;
        if max == 0 {
            return None;
        }
        let range = self.sent..self.written.min(self.sent + max);
        self.sent = range.end;
        Some(self.frame(range))
    }

    fn frame(&self, range: Range<u64>) -> CryptoFrame {
        let start = (range.start - self.base) as usize;
        let end = (range.end - self.base) as usize;
        CryptoFrame {
            offset: range.start,
            data: Bytes::copy_from_slice(&self.data[start..end]),
        }
    }

    pub fn on_acked(&mut self, range: Range<u64>) {
        self.acked.insert(range.clone());
        self.lost.remove_range(range);
        let acked_end = self.acked.contiguous_end(0);
        if acked_end > self.base {
            self.data.advance((acked_end - self.base) as usize);
            self.base = acked_end;
        }
    }

    pub fn on_lost(&mut self, range: Range<u64>) {
        for gap in self.acked.gaps_in(range) {
            self.lost.insert(gap);
        }
    }

    /// Everything written has been acknowledged.
    pub fn is_idle(&self) -> bool {
        self.acked.contiguous_end(0) >= self.written
    }
}

#[cfg(test)]
mod tests {
    use qbase::frame::BeFrame;

    use super::*;

    #[test]
    fn test_retransmit_before_fresh() {
        let mut crypto = CryptoStream::new();
        crypto.write(&[1; 300]);
        let first = crypto.pick(100).unwrap();
        assert!(first.encoding_size() <= 100);
        let first_range = first.offset..first.offset + first.data.len() as u64;
        let second = crypto.pick(100).unwrap();
        assert_eq!(second.offset, first_range.end);

        crypto.on_lost(first_range.clone());
        let again = crypto.pick(1000).unwrap();
        assert_eq!(again.offset, 0);
        assert_eq!(again.data.len() as u64, first_range.end);

        let rest = crypto.pick(1000).unwrap();
        assert_eq!(rest.offset + rest.data.len() as u64, 300);
        assert!(!crypto.has_pending());

        crypto.on_acked(0..300);
        assert!(crypto.is_idle());
        // a late loss of acknowledged data is ignored
        crypto.on_lost(0..100);
        assert!(!crypto.has_lost());
    }
}
