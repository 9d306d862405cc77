use getset::{CopyGetters, Getters};

use crate::{
    Epoch,
    cid::ConnectionId,
    error::LocalError,
    frame::{BeFrame, Frame, FrameSpecs, PaddingFrame, StreamFrame},
};

/// Header protection samples 16 bytes starting 4 bytes after the packet
/// number, so packet number + payload + tag must cover at least this many.
/// See [section-5.4.2](https://www.rfc-editor.org/rfc/rfc9001#section-5.4.2)
/// of [QUIC-TLS](https://www.rfc-editor.org/rfc/rfc9001).
pub const MIN_SAMPLE_COVERAGE: usize = 20;

/// A client MUST expand the payload of all UDP datagrams carrying Initial
/// packets to at least the smallest allowed maximum datagram size of 1200 bytes.
pub const MIN_INITIAL_DATAGRAM_SIZE: usize = 1200;

/// The number of bytes needed to encode `pn` so that the peer, having seen
/// `largest_acked`, can recover it.
///
/// See [appendix-A.2](https://www.rfc-editor.org/rfc/rfc9000.html#appendix-A.2)
/// of [QUIC](https://www.rfc-editor.org/rfc/rfc9000.html).
pub fn packet_number_len(pn: u64, largest_acked: Option<u64>) -> usize {
    let num_unacked = match largest_acked {
        Some(largest) => pn.saturating_sub(largest),
        None => pn + 1,
    };
    let min_bits = 64 - num_unacked.leading_zeros() as usize + 1;
    min_bits.div_ceil(8).clamp(1, 4)
}

/// What the packet builder needs to know about the header it writes after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct PacketHeader {
    epoch: Epoch,
    pn: u64,
    pn_len: usize,
    dcid: ConnectionId,
    scid: Option<ConnectionId>,
}

impl PacketHeader {
    /// Long headers are used before 1-RTT keys are available.
    pub fn long(
        epoch: Epoch,
        pn: u64,
        largest_acked: Option<u64>,
        dcid: ConnectionId,
        scid: ConnectionId,
    ) -> Self {
        Self {
            epoch,
            pn,
            pn_len: packet_number_len(pn, largest_acked),
            dcid,
            scid: Some(scid),
        }
    }

    pub fn short(pn: u64, largest_acked: Option<u64>, dcid: ConnectionId) -> Self {
        Self {
            epoch: Epoch::Data,
            pn,
            pn_len: packet_number_len(pn, largest_acked),
            dcid,
            scid: None,
        }
    }

    pub fn is_long(&self) -> bool {
        self.scid.is_some()
    }

    /// Header bytes including the packet number.
    pub fn encoding_size(&self) -> usize {
        match self.scid {
            // first byte + version + dcid + scid + token length(0) for initial
            // + 2 bytes payload length + pn
            Some(scid) => {
                let token_len = if self.epoch == Epoch::Initial { 1 } else { 0 };
                1 + 4 + self.dcid.encoding_size() + scid.encoding_size() + token_len + 2 + self.pn_len
            }
            None => 1 + self.dcid.len() + self.pn_len,
        }
    }
}

/// Assembles the payload of one outgoing packet.
///
/// Capacity is fixed at construction and never exceeded: a frame that does
/// not fit is rejected and leaves the builder untouched. Once
/// [`PacketBuilder::finalize`] has produced the [`Packet`], every further
/// write or finalize fails with [`LocalError::AlreadyFinalized`].
#[derive(Debug)]
pub struct PacketBuilder {
    header: PacketHeader,
    capacity: usize,
    tag_len: usize,
    min_packet_size: usize,
    cursor: usize,
    frames: Vec<Frame>,
    specs: Option<FrameSpecs>,
    finalized: bool,
}

impl PacketBuilder {
    /// `capacity` is the space of the whole packet, typically the path MTU
    /// minus what previous packets in the same datagram used; `tag_len` is
    /// the AEAD expansion reserved at the end.
    pub fn new(header: PacketHeader, capacity: usize, tag_len: usize) -> Result<Self, LocalError> {
        let cursor = header.encoding_size();
        let needed = (cursor + tag_len).max(cursor - header.pn_len() + MIN_SAMPLE_COVERAGE);
        if capacity < needed {
            return Err(LocalError::Rejected {
                needed,
                remaining: capacity,
            });
        }
        Ok(Self {
            header,
            capacity,
            tag_len,
            min_packet_size: 0,
            cursor,
            frames: Vec::with_capacity(4),
            specs: None,
            finalized: false,
        })
    }

    /// Pad the packet up to `size` bytes (bounded by capacity) on finalize,
    /// as Initial packets and path probes require.
    pub fn with_min_packet_size(mut self, size: usize) -> Self {
        self.min_packet_size = size.min(self.capacity);
        self
    }

    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    /// The bytes still available for frames.
    pub fn remaining_bytes(&self) -> usize {
        if self.finalized {
            return 0;
        }
        self.capacity - self.tag_len - self.cursor
    }

    /// Bytes the packet occupies so far, header and tag included.
    pub fn size(&self) -> usize {
        self.cursor + self.tag_len
    }

    /// Bytes of frames written so far.
    pub fn payload_len(&self) -> usize {
        self.cursor - self.header.encoding_size()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Append a frame, returning the number of bytes it occupies.
    pub fn write(&mut self, frame: impl Into<Frame>) -> Result<usize, LocalError> {
        if self.finalized {
            return Err(LocalError::AlreadyFinalized);
        }
        let frame = frame.into();
        let size = frame.encoding_size();
        let remaining = self.remaining_bytes();
        if size > remaining {
            return Err(LocalError::Rejected {
                needed: size,
                remaining,
            });
        }
        self.cursor += size;
        let specs = frame.specs();
        self.specs = Some(match self.specs {
            Some(acc) => acc & specs,
            None => specs,
        });
        self.frames.push(frame);
        Ok(size)
    }

    /// Seal the packet: pad as the protocol requires and hand out the
    /// immutable result. The builder is spent afterwards.
    pub fn finalize(&mut self) -> Result<Packet, LocalError> {
        if self.finalized {
            return Err(LocalError::AlreadyFinalized);
        }
        let hdr_len = self.header.encoding_size();
        let sample_floor = hdr_len - self.header.pn_len() + MIN_SAMPLE_COVERAGE;
        let target = (self.min_packet_size).max(sample_floor);
        let padding = target.saturating_sub(self.cursor + self.tag_len);
        if padding > 0 {
            // new() guarantees the sample floor fits, min_packet_size is clamped to capacity
            debug_assert!(self.cursor + self.tag_len + padding <= self.capacity);
            self.frames.push(PaddingFrame(padding).into());
            self.cursor += padding;
        }
        self.finalized = true;

        // Padding alone does not make a packet ack-eliciting or in flight.
        let specs = self.specs.unwrap_or(FrameSpecs::all());
        Ok(Packet {
            header: self.header,
            frames: std::mem::take(&mut self.frames),
            size: self.cursor + self.tag_len,
            payload_len: self.cursor - hdr_len,
            padding,
            ack_eliciting: !specs.contains(FrameSpecs::NON_ACK_ELICITING),
            in_flight: !specs.contains(FrameSpecs::CONGESTION_CONTROL_FREE),
            probe_new_path: specs.contains(FrameSpecs::PROBE_NEW_PATH),
        })
    }
}

/// A finalized packet, immutable, ready for encryption and transmission.
#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct Packet {
    #[getset(get = "pub")]
    header: PacketHeader,
    #[getset(get = "pub")]
    frames: Vec<Frame>,
    /// Total size on the wire, including header and AEAD tag.
    #[getset(get_copy = "pub")]
    size: usize,
    #[getset(get_copy = "pub")]
    payload_len: usize,
    #[getset(get_copy = "pub")]
    padding: usize,
    #[getset(get_copy = "pub")]
    ack_eliciting: bool,
    #[getset(get_copy = "pub")]
    in_flight: bool,
    #[getset(get_copy = "pub")]
    probe_new_path: bool,
}

impl Packet {
    pub fn pn(&self) -> u64 {
        self.header.pn()
    }

    pub fn epoch(&self) -> Epoch {
        self.header.epoch()
    }

    pub fn stream_frames(&self) -> impl Iterator<Item = &StreamFrame> {
        self.frames.iter().filter_map(|frame| match frame {
            Frame::Stream(f) => Some(f),
            _ => None,
        })
    }

    /// Contains nothing but ACK (and padding) frames.
    pub fn is_ack_only(&self) -> bool {
        let mut has_ack = false;
        for frame in &self.frames {
            match frame {
                Frame::Ack(..) => has_ack = true,
                Frame::Padding(..) => {}
                _ => return false,
            }
        }
        has_ack
    }
}
