//! Fills one packet at a time from the pending work of a connection.
//!
//! Each kind of work is a sub-scheduler; the top level asks them in the
//! order of the [`SchedulingPolicy`] and lets each write as much as the
//! packet and the byte budget allow. Scheduling is a pure function of the
//! state handed in: no randomness and no clock.

use std::{
    collections::{BTreeMap, VecDeque},
    ops::Bound,
    time::Instant,
};

use enum_dispatch::enum_dispatch;
use qbase::{
    Epoch,
    error::ErrorKind,
    frame::{BeFrame, ConnectionCloseFrame, Frame, FrameType, PaddingFrame, PingFrame},
    packet::PacketBuilder,
    sid::StreamId,
};
use qrecovery::{crypto::CryptoStream, journal::RcvdJournal, send::SendBuffer};

use crate::loop_detector::WriteDataReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum FrameCategory {
    #[display("close")]
    Close,
    #[display("ack")]
    Ack,
    /// Lost stream data, crypto data and control frames.
    #[display("retransmission")]
    Retransmission,
    #[display("crypto")]
    Crypto,
    /// Control frames and probes.
    #[display("control")]
    Control,
    #[display("stream")]
    Stream,
    /// Padding up to the minimum datagram size.
    #[display("padding")]
    Padding,
}

impl FrameCategory {
    pub const DEFAULT_ORDER: [FrameCategory; 7] = [
        FrameCategory::Close,
        FrameCategory::Ack,
        FrameCategory::Retransmission,
        FrameCategory::Crypto,
        FrameCategory::Control,
        FrameCategory::Stream,
        FrameCategory::Padding,
    ];

    /// Whether frames of this category wait for congestion window.
    pub fn is_congestion_controlled(self) -> bool {
        !matches!(self, FrameCategory::Close | FrameCategory::Ack)
    }

    pub fn write_reason(self) -> WriteDataReason {
        match self {
            FrameCategory::Close => WriteDataReason::Close,
            FrameCategory::Ack => WriteDataReason::Ack,
            FrameCategory::Retransmission => WriteDataReason::Retransmission,
            FrameCategory::Crypto => WriteDataReason::Crypto,
            FrameCategory::Control => WriteDataReason::Control,
            FrameCategory::Stream => WriteDataReason::Stream,
            FrameCategory::Padding => WriteDataReason::Padding,
        }
    }
}

/// What to do with a packet that ends up carrying nothing but ACKs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckOnlyPolicy {
    #[default]
    Send,
    /// Report it as not worth sending, the ACKs go out with the next
    /// ack-eliciting packet.
    Suppress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulingPolicy {
    order: Vec<FrameCategory>,
    ack_only: AckOnlyPolicy,
}

impl Default for SchedulingPolicy {
    fn default() -> Self {
        Self::new(FrameCategory::DEFAULT_ORDER, AckOnlyPolicy::Send)
    }
}

impl SchedulingPolicy {
    /// Close always comes first whatever `order` says, and duplicates are
    /// ignored. Categories left out of `order` are never scheduled.
    pub fn new(order: impl IntoIterator<Item = FrameCategory>, ack_only: AckOnlyPolicy) -> Self {
        let mut categories = vec![FrameCategory::Close];
        for category in order {
            if !categories.contains(&category) {
                categories.push(category);
            }
        }
        Self {
            order: categories,
            ack_only,
        }
    }

    pub fn order(&self) -> &[FrameCategory] {
        &self.order
    }

    pub fn ack_only(&self) -> AckOnlyPolicy {
        self.ack_only
    }
}

/// The pending work of a connection, borrowed by the scheduler while one
/// packet is filled.
#[derive(Debug)]
pub struct TransmitState {
    /// Only used to compute the ACK delay.
    pub now: Instant,
    pub close: Option<ConnectionCloseFrame>,
    pub rcvd: [RcvdJournal; 3],
    pub crypto: [CryptoStream; 3],
    /// Lost frames to send again as they were.
    pub lost_frames: [VecDeque<Frame>; 3],
    /// A PING is owed in the epoch, as a loss probe.
    pub ping: [bool; 3],
    /// Control frames of the data epoch.
    pub control: VecDeque<Frame>,
    pub streams: BTreeMap<StreamId, SendBuffer>,
    /// Connection level flow control credit left.
    pub conn_credit: u64,
    /// Pad packets up to this size once they carry something.
    pub pad_to: Option<usize>,
    /// Only congestion free frames may be written.
    pub congestion_limited: bool,
}

impl TransmitState {
    pub fn new(conn_credit: u64, now: Instant) -> Self {
        Self {
            now,
            close: None,
            rcvd: Default::default(),
            crypto: Default::default(),
            lost_frames: Default::default(),
            ping: [false; 3],
            control: VecDeque::new(),
            streams: BTreeMap::new(),
            conn_credit,
            pad_to: None,
            congestion_limited: false,
        }
    }

    /// Fresh stream data waits for credit, of its stream or of the
    /// connection.
    pub fn is_flow_blocked(&self) -> bool {
        self.streams.values().any(|stream| {
            stream.is_flow_blocked()
                || (self.conn_credit == 0 && stream.has_pending() && stream.sent() < stream.written())
        })
    }
}

/// The part of `writable_bytes` not used yet.
#[derive(Debug)]
pub struct Budget {
    left: usize,
    frames: usize,
    stream_bytes: u64,
}

impl Budget {
    fn new(writable_bytes: usize) -> Self {
        Self {
            left: writable_bytes,
            frames: 0,
            stream_bytes: 0,
        }
    }

    pub fn left(&self) -> usize {
        self.left
    }

    /// Room for the next frame.
    pub fn room(&self, builder: &PacketBuilder) -> usize {
        self.left.min(builder.remaining_bytes())
    }

    pub fn fits(&self, builder: &PacketBuilder, frame: &Frame) -> bool {
        frame.encoding_size() <= self.room(builder)
    }

    /// Write `frame` if it fits in both the budget and the packet.
    pub fn write(&mut self, builder: &mut PacketBuilder, frame: impl Into<Frame>) -> bool {
        let frame = frame.into();
        if frame.encoding_size() > self.left {
            return false;
        }
        match builder.write(frame) {
            Ok(size) => {
                self.left -= size;
                self.frames += 1;
                true
            }
            Err(_) => false,
        }
    }
}

#[enum_dispatch]
pub trait Schedule {
    fn category(&self) -> FrameCategory;

    fn has_data(&self, state: &TransmitState, epoch: Epoch) -> bool;

    fn schedule(
        &mut self,
        state: &mut TransmitState,
        epoch: Epoch,
        builder: &mut PacketBuilder,
        budget: &mut Budget,
    );
}

#[derive(Debug, Default)]
pub struct CloseScheduler;

impl Schedule for CloseScheduler {
    fn category(&self) -> FrameCategory {
        FrameCategory::Close
    }

    fn has_data(&self, state: &TransmitState, _epoch: Epoch) -> bool {
        state.close.is_some()
    }

    fn schedule(
        &mut self,
        state: &mut TransmitState,
        epoch: Epoch,
        builder: &mut PacketBuilder,
        budget: &mut Budget,
    ) {
        let Some(close) = state.close.as_ref() else {
            return;
        };
        // An application close must not reveal anything before 1-RTT,
        // see section-10.2.3 of RFC 9000.
        let frame = if close.is_application && epoch != Epoch::Data {
            ConnectionCloseFrame {
                error_code: ErrorKind::Application.into(),
                frame_type: Some(FrameType::Padding),
                reason: String::new(),
                is_application: false,
            }
        } else {
            close.clone()
        };
        budget.write(builder, frame);
    }
}

#[derive(Debug, Default)]
pub struct AckScheduler;

impl Schedule for AckScheduler {
    fn category(&self) -> FrameCategory {
        FrameCategory::Ack
    }

    fn has_data(&self, state: &TransmitState, epoch: Epoch) -> bool {
        state.rcvd[epoch].need_ack()
    }

    fn schedule(
        &mut self,
        state: &mut TransmitState,
        epoch: Epoch,
        builder: &mut PacketBuilder,
        budget: &mut Budget,
    ) {
        if let Some(ack) = state.rcvd[epoch].ack_frame(state.now, budget.room(builder)) {
            budget.write(builder, ack);
        }
    }
}

#[derive(Debug, Default)]
pub struct RetransmissionScheduler;

impl Schedule for RetransmissionScheduler {
    fn category(&self) -> FrameCategory {
        FrameCategory::Retransmission
    }

    fn has_data(&self, state: &TransmitState, epoch: Epoch) -> bool {
        !state.lost_frames[epoch].is_empty()
            || state.crypto[epoch].has_lost()
            || (epoch == Epoch::Data && state.streams.values().any(SendBuffer::has_lost))
    }

    fn schedule(
        &mut self,
        state: &mut TransmitState,
        epoch: Epoch,
        builder: &mut PacketBuilder,
        budget: &mut Budget,
    ) {
        while let Some(frame) = state.crypto[epoch].pick_lost(budget.room(builder)) {
            budget.write(builder, frame);
        }
        let lost_frames = &mut state.lost_frames[epoch];
        while lost_frames
            .front()
            .is_some_and(|frame| budget.fits(builder, frame))
        {
            if let Some(frame) = lost_frames.pop_front() {
                budget.write(builder, frame);
            }
        }
        if epoch != Epoch::Data {
            return;
        }
        for stream in state.streams.values_mut() {
            while let Some(frame) = stream.pick_lost(budget.room(builder)) {
                budget.write(builder, frame);
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct CryptoScheduler;

impl Schedule for CryptoScheduler {
    fn category(&self) -> FrameCategory {
        FrameCategory::Crypto
    }

    fn has_data(&self, state: &TransmitState, epoch: Epoch) -> bool {
        state.crypto[epoch].has_pending()
    }

    fn schedule(
        &mut self,
        state: &mut TransmitState,
        epoch: Epoch,
        builder: &mut PacketBuilder,
        budget: &mut Budget,
    ) {
        while let Some(frame) = state.crypto[epoch].pick(budget.room(builder)) {
            budget.write(builder, frame);
        }
    }
}

#[derive(Debug, Default)]
pub struct ControlScheduler;

impl Schedule for ControlScheduler {
    fn category(&self) -> FrameCategory {
        FrameCategory::Control
    }

    fn has_data(&self, state: &TransmitState, epoch: Epoch) -> bool {
        state.ping[epoch] || (epoch == Epoch::Data && !state.control.is_empty())
    }

    fn schedule(
        &mut self,
        state: &mut TransmitState,
        epoch: Epoch,
        builder: &mut PacketBuilder,
        budget: &mut Budget,
    ) {
        if epoch == Epoch::Data {
            while state
                .control
                .front()
                .is_some_and(|frame| budget.fits(builder, frame))
            {
                if let Some(frame) = state.control.pop_front() {
                    budget.write(builder, frame);
                }
            }
        }
        if state.ping[epoch] && budget.write(builder, PingFrame) {
            state.ping[epoch] = false;
        }
    }
}

/// New stream data, served round-robin: each packet starts with the
/// stream after the last one served, in ascending stream id order.
#[derive(Debug, Default)]
pub struct StreamScheduler {
    last_served: Option<StreamId>,
}

fn is_sendable(stream: &SendBuffer, conn_credit: u64) -> bool {
    stream.has_pending()
        && !stream.is_flow_blocked()
        && (conn_credit > 0 || stream.sent() == stream.written())
}

impl StreamScheduler {
    fn round_robin(&self, streams: &BTreeMap<StreamId, SendBuffer>) -> Vec<StreamId> {
        let Some(last) = self.last_served else {
            return streams.keys().copied().collect();
        };
        streams
            .range((Bound::Excluded(last), Bound::Unbounded))
            .chain(streams.range(..=last))
            .map(|(&sid, _)| sid)
            .collect()
    }
}

impl Schedule for StreamScheduler {
    fn category(&self) -> FrameCategory {
        FrameCategory::Stream
    }

    fn has_data(&self, state: &TransmitState, epoch: Epoch) -> bool {
        epoch == Epoch::Data
            && state
                .streams
                .values()
                .any(|stream| is_sendable(stream, state.conn_credit))
    }

    fn schedule(
        &mut self,
        state: &mut TransmitState,
        _epoch: Epoch,
        builder: &mut PacketBuilder,
        budget: &mut Budget,
    ) {
        for sid in self.round_robin(&state.streams) {
            let Some(stream) = state.streams.get_mut(&sid) else {
                continue;
            };
            while is_sendable(stream, state.conn_credit) {
                let room = budget.room(builder);
                let Some((frame, credit_used)) = stream.pick_fresh(room, state.conn_credit) else {
                    break;
                };
                state.conn_credit -= credit_used;
                budget.stream_bytes += credit_used;
                budget.write(builder, frame);
                self.last_served = Some(sid);
            }
            if budget.room(builder) == 0 {
                break;
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct PaddingScheduler;

impl Schedule for PaddingScheduler {
    fn category(&self) -> FrameCategory {
        FrameCategory::Padding
    }

    fn has_data(&self, state: &TransmitState, _epoch: Epoch) -> bool {
        state.pad_to.is_some()
    }

    fn schedule(
        &mut self,
        state: &mut TransmitState,
        _epoch: Epoch,
        builder: &mut PacketBuilder,
        budget: &mut Budget,
    ) {
        let Some(pad_to) = state.pad_to else {
            return;
        };
        // padding alone is not worth a packet
        if builder.is_empty() {
            return;
        }
        let len = pad_to
            .saturating_sub(builder.size())
            .min(budget.room(builder));
        if len > 0 {
            budget.write(builder, PaddingFrame(len));
        }
    }
}

#[enum_dispatch(Schedule)]
#[derive(Debug)]
pub enum SubScheduler {
    Close(CloseScheduler),
    Ack(AckScheduler),
    Retransmission(RetransmissionScheduler),
    Crypto(CryptoScheduler),
    Control(ControlScheduler),
    Stream(StreamScheduler),
    Padding(PaddingScheduler),
}

impl From<FrameCategory> for SubScheduler {
    fn from(category: FrameCategory) -> Self {
        match category {
            FrameCategory::Close => CloseScheduler.into(),
            FrameCategory::Ack => AckScheduler.into(),
            FrameCategory::Retransmission => RetransmissionScheduler.into(),
            FrameCategory::Crypto => CryptoScheduler.into(),
            FrameCategory::Control => ControlScheduler.into(),
            FrameCategory::Stream => StreamScheduler::default().into(),
            FrameCategory::Padding => PaddingScheduler.into(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SchedulingResult {
    pub bytes_written: usize,
    pub frames_written: usize,
    /// Connection flow control credit consumed by new stream data.
    pub stream_bytes: u64,
    /// The packet carries nothing but ACK frames, and maybe padding.
    pub ack_only: bool,
    pub should_send: bool,
}

/// The per connection scheduler.
#[derive(Debug)]
pub struct FrameScheduler {
    policy: SchedulingPolicy,
    schedulers: Vec<SubScheduler>,
}

impl Default for FrameScheduler {
    fn default() -> Self {
        Self::new(SchedulingPolicy::default())
    }
}

impl FrameScheduler {
    pub fn new(policy: SchedulingPolicy) -> Self {
        let schedulers = policy.order().iter().map(|&c| c.into()).collect();
        Self { policy, schedulers }
    }

    pub fn policy(&self) -> &SchedulingPolicy {
        &self.policy
    }

    fn is_allowed(state: &TransmitState, scheduler: &SubScheduler) -> bool {
        !state.congestion_limited || !scheduler.category().is_congestion_controlled()
    }

    /// Whether any sub-scheduler allowed to write has something for `epoch`.
    pub fn has_data(&self, state: &TransmitState, epoch: Epoch) -> bool {
        self.next_category(state, epoch).is_some()
    }

    /// The first category, in policy order, with something to write.
    /// Padding alone never makes a packet.
    pub fn next_category(&self, state: &TransmitState, epoch: Epoch) -> Option<FrameCategory> {
        self.schedulers
            .iter()
            .filter(|s| s.category() != FrameCategory::Padding)
            .find(|s| Self::is_allowed(state, s) && s.has_data(state, epoch))
            .map(Schedule::category)
    }

    /// Write frames into `builder`, in policy order, using at most
    /// `writable_bytes` bytes. A close frame is sent alone.
    pub fn schedule_frames_for_packet(
        &mut self,
        state: &mut TransmitState,
        builder: &mut PacketBuilder,
        writable_bytes: usize,
    ) -> SchedulingResult {
        let epoch = builder.header().epoch();
        if writable_bytes == 0 {
            return SchedulingResult::default();
        }
        let mut budget = Budget::new(writable_bytes);
        for scheduler in &mut self.schedulers {
            if budget.room(builder) == 0 {
                break;
            }
            if !Self::is_allowed(state, scheduler) || !scheduler.has_data(state, epoch) {
                continue;
            }
            let written = budget.frames;
            scheduler.schedule(state, epoch, builder, &mut budget);
            if scheduler.category() == FrameCategory::Close && budget.frames > written {
                break;
            }
        }

        let frames = builder.frames();
        let ack_only = budget.frames > 0
            && frames.iter().any(|f| matches!(f, Frame::Ack(..)))
            && frames
                .iter()
                .all(|f| matches!(f, Frame::Ack(..) | Frame::Padding(..)));
        let should_send =
            budget.frames > 0 && !(ack_only && self.policy.ack_only == AckOnlyPolicy::Suppress);
        let result = SchedulingResult {
            bytes_written: writable_bytes - budget.left,
            frames_written: budget.frames,
            stream_bytes: budget.stream_bytes,
            ack_only,
            should_send,
        };
        tracing::trace!(
            target: "quic",
            ?epoch,
            bytes = result.bytes_written,
            frames = result.frames_written,
            ack_only,
            should_send,
            "frames scheduled"
        );
        result
    }
}
