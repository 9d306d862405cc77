//! Records of sent and received packets of one packet number space.

use std::{collections::BTreeMap, ops::Range, time::Instant};

use qbase::{
    Epoch,
    frame::{AckFrame, BeFrame, Frame, FrameSpecs},
    sid::StreamId,
};
use thiserror::Error;

use crate::ranges::RangeSet;

/// What a sent packet carried that matters once it is acknowledged or lost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentRecord {
    Stream {
        stream_id: StreamId,
        range: Range<u64>,
        fin: bool,
    },
    /// Control and crypto frames are retransmitted as they were.
    Control(Frame),
    /// An ACK frame acknowledging up to `largest`.
    Ack { largest: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentPacket {
    pub pn: u64,
    pub epoch: Epoch,
    pub time_sent: Instant,
    pub size: usize,
    pub ack_eliciting: bool,
    pub in_flight: bool,
    pub records: Vec<SentRecord>,
}

impl SentPacket {
    /// Build the record of a finalized packet. Padding and PING frames are
    /// not worth remembering; everything reliable is.
    pub fn from_frames<'f>(
        pn: u64,
        epoch: Epoch,
        time_sent: Instant,
        size: usize,
        frames: impl IntoIterator<Item = &'f Frame>,
    ) -> Self {
        let mut ack_eliciting = false;
        let mut in_flight = false;
        let mut records = Vec::new();
        for frame in frames {
            let specs = frame.specs();
            if !matches!(frame, Frame::Padding(..)) {
                ack_eliciting |= !specs.contains(FrameSpecs::NON_ACK_ELICITING);
                in_flight |= !specs.contains(FrameSpecs::CONGESTION_CONTROL_FREE);
            }
            match frame {
                Frame::Padding(..) | Frame::Ping(..) | Frame::ConnectionClose(..) => {}
                Frame::PathChallenge(..) | Frame::PathResponse(..) => {}
                Frame::Ack(ack) => records.push(SentRecord::Ack {
                    largest: ack.largest,
                }),
                Frame::Stream(stream) => records.push(SentRecord::Stream {
                    stream_id: stream.stream_id,
                    range: stream.range(),
                    fin: stream.fin,
                }),
                other => records.push(SentRecord::Control(other.clone())),
            }
        }
        Self {
            pn,
            epoch,
            time_sent,
            size,
            ack_eliciting,
            in_flight,
            records,
        }
    }
}

/// Packets sent in one space and not yet acknowledged or declared lost.
#[derive(Debug)]
pub struct SentJournal {
    epoch: Epoch,
    next_pn: u64,
    packets: BTreeMap<u64, SentPacket>,
    largest_acked: Option<u64>,
    bytes_in_flight: usize,
}

impl SentJournal {
    pub fn new(epoch: Epoch) -> Self {
        Self {
            epoch,
            next_pn: 0,
            packets: BTreeMap::new(),
            largest_acked: None,
            bytes_in_flight: 0,
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// The packet number the next packet of this space will carry.
    pub fn next_pn(&self) -> u64 {
        self.next_pn
    }

    pub fn largest_acked(&self) -> Option<u64> {
        self.largest_acked
    }

    pub fn bytes_in_flight(&self) -> usize {
        self.bytes_in_flight
    }

    pub fn has_ack_eliciting_in_flight(&self) -> bool {
        self.packets.values().any(|p| p.ack_eliciting)
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Remember a packet handed to the socket. Packet numbers must be used
    /// in sequence.
    pub fn on_packet_sent(&mut self, packet: SentPacket) {
        debug_assert_eq!(packet.pn, self.next_pn);
        self.next_pn = packet.pn + 1;
        if packet.in_flight {
            self.bytes_in_flight += packet.size;
        }
        self.packets.insert(packet.pn, packet);
    }

    /// Take the packets newly acknowledged by `ack`, in ascending order.
    pub fn on_ack_frame(&mut self, ack: &AckFrame) -> Result<Vec<SentPacket>, AckError> {
        if ack.largest >= self.next_pn {
            return Err(AckError::UnsentPacket(ack.largest));
        }
        if self.largest_acked.is_none_or(|largest| ack.largest > largest) {
            self.largest_acked = Some(ack.largest);
        }
        let mut acked = Vec::new();
        for range in ack.iter_ranges() {
            let pns: Vec<u64> = self.packets.range(range).map(|(&pn, _)| pn).collect();
            for pn in pns {
                if let Some(packet) = self.remove(pn) {
                    acked.push(packet);
                }
            }
        }
        acked.sort_by_key(|p| p.pn);
        Ok(acked)
    }

    fn remove(&mut self, pn: u64) -> Option<SentPacket> {
        let packet = self.packets.remove(&pn)?;
        if packet.in_flight {
            self.bytes_in_flight -= packet.size;
        }
        Some(packet)
    }

    pub(crate) fn remove_packets(&mut self, pns: &[u64]) -> Vec<SentPacket> {
        pns.iter().filter_map(|&pn| self.remove(pn)).collect()
    }

    /// Unacknowledged packets with numbers at or below `largest`.
    pub fn iter_up_to(&self, largest: u64) -> impl Iterator<Item = &SentPacket> {
        self.packets.range(..=largest).map(|(_, p)| p)
    }

    /// Discard the whole space, as when its keys are dropped. The packets
    /// are returned so that their in flight bytes can be released.
    pub fn discard(&mut self) -> Vec<SentPacket> {
        self.bytes_in_flight = 0;
        std::mem::take(&mut self.packets).into_values().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AckError {
    #[error("acknowledged packet {0} was never sent")]
    UnsentPacket(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidPacketNumber {
    #[error("packet number too old")]
    TooOld,
    #[error("packet with this number has been received")]
    HasRcvd,
}

/// Packets received in one space, from which ACK frames are generated.
#[derive(Debug)]
pub struct RcvdJournal {
    rcvd: RangeSet,
    // packet numbers below are no longer reported nor accepted
    floor: u64,
    largest: Option<(u64, Instant)>,
    ack_eliciting_pending: usize,
}

impl Default for RcvdJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl RcvdJournal {
    pub fn new() -> Self {
        Self {
            rcvd: RangeSet::new(),
            floor: 0,
            largest: None,
            ack_eliciting_pending: 0,
        }
    }

    /// Record a successfully decrypted packet. Duplicates are rejected.
    pub fn on_packet_rcvd(
        &mut self,
        pn: u64,
        ack_eliciting: bool,
        now: Instant,
    ) -> Result<(), InvalidPacketNumber> {
        if pn < self.floor {
            return Err(InvalidPacketNumber::TooOld);
        }
        if self.rcvd.contains(pn) {
            return Err(InvalidPacketNumber::HasRcvd);
        }
        self.rcvd.insert(pn..pn + 1);
        if self.largest.is_none_or(|(largest, _)| pn > largest) {
            self.largest = Some((pn, now));
        }
        if ack_eliciting {
            self.ack_eliciting_pending += 1;
        }
        Ok(())
    }

    pub fn largest(&self) -> Option<u64> {
        self.largest.map(|(pn, _)| pn)
    }

    /// An ack-eliciting packet arrived since the last ACK frame was sent.
    pub fn need_ack(&self) -> bool {
        self.ack_eliciting_pending > 0
    }

    pub fn has_rcvd(&self) -> bool {
        !self.rcvd.is_empty()
    }

    /// An ACK frame fitting in `capacity` bytes, with as many ranges as fit,
    /// largest first. The delay is in microseconds.
    pub fn ack_frame(&self, now: Instant, capacity: usize) -> Option<AckFrame> {
        let (largest, rcvd_time) = self.largest?;
        let mut ranges = self.rcvd.iter().rev();
        let first = ranges.next()?;
        let mut frame = AckFrame {
            largest,
            delay: now.saturating_duration_since(rcvd_time).as_micros() as u64,
            first_range: largest - first.start,
            ranges: Vec::new(),
        };
        if frame.encoding_size() > capacity {
            return None;
        }
        let mut smallest = first.start;
        for range in ranges {
            let gap = smallest - range.end - 1;
            let ack = range.end - 1 - range.start;
            frame.ranges.push((gap, ack));
            if frame.encoding_size() > capacity {
                frame.ranges.pop();
                break;
            }
            smallest = range.start;
        }
        Some(frame)
    }

    /// An ACK frame was put in a packet.
    pub fn on_ack_sent(&mut self) {
        self.ack_eliciting_pending = 0;
    }

    /// The peer acknowledged a packet carrying our ACK up to `largest`; the
    /// ranges below it need not be reported again.
    pub fn on_ack_acked(&mut self, largest: u64) {
        if largest + 1 > self.floor {
            self.floor = largest + 1;
            // keep the largest range so that the next ACK still has a base
            let keep_from = self.rcvd.iter().next_back().map_or(self.floor, |r| r.start);
            self.rcvd.remove_below(self.floor.min(keep_from));
        }
    }
}
