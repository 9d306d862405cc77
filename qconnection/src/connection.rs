//! One connection: the state the scheduler, the journals and the
//! application callbacks hang off, and the operations the worker driving it
//! calls.
//!
//! A connection is owned by exactly one worker and never shared, so every
//! operation takes `&mut self`; what leaves the connection (callbacks,
//! observers, routing notifications) goes through weak references.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use qbase::{
    Epoch,
    cid::{ConnectionId, ConnectionIdData},
    codec::HandshakeKeys,
    error::LocalError,
    frame::Frame,
    packet::{Packet, PacketBuilder, PacketHeader},
    sid::{Role, StreamId, StreamIds},
};
use qevent::ArcObservers;
use qinterface::{CidGenerator, ConnKey, RoutingCallback, SourceIdentity, WorkerId};
use qrecovery::{
    byte_event::ByteEventTracker,
    journal::{SentJournal, SentPacket},
    recv::RecvBuffer,
    rtt::Rtt,
    send::SendBuffer,
};

use crate::{
    callback::{
        ConnectionCallback, DataExpiredCallback, DataRejectedCallback, LoopDetectorCallback,
        PeekCallback, ReadCallback, WriteCallback,
    },
    loop_detector::{LoopDetector, NoWriteReason, WriteDataReason},
    scheduler::{FrameCategory, FrameScheduler, TransmitState},
    settings::TransportSettings,
    transport::CongestionController,
};

mod closing;
mod conn_id;
mod recv;
mod streams;
#[cfg(test)]
mod tests;

use closing::Closing;
use conn_id::{LocalCids, PeerCids};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum ConnectionState {
    #[display("handshaking")]
    Handshaking,
    #[display("established")]
    Established,
    /// A CONNECTION_CLOSE was sent, packets from the peer are answered
    /// with it again.
    #[display("closing")]
    Closing,
    /// The peer closed, nothing is sent any more.
    #[display("draining")]
    Draining,
    #[display("closed")]
    Closed,
}

/// Where a connection sits in the process and on the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionEndpoints {
    pub key: ConnKey,
    pub worker: WorkerId,
    /// The first id this endpoint chose for itself, sequence number 0.
    pub local_cid: ConnectionId,
    /// The id the peer chose, or the random one a client starts with.
    pub peer_cid: ConnectionId,
    /// The addresses of the first datagram, known on the server side.
    pub source: Option<SourceIdentity>,
}

fn upgrade<T: ?Sized>(weak: &Option<Weak<T>>) -> Option<Arc<T>> {
    weak.as_ref().and_then(Weak::upgrade)
}

#[derive(Default)]
struct Callbacks {
    conn: Option<Weak<dyn ConnectionCallback>>,
    read: HashMap<StreamId, Weak<dyn ReadCallback>>,
    peek: HashMap<StreamId, Weak<dyn PeekCallback>>,
    // waiting for stream credit
    stream_write: HashMap<StreamId, Weak<dyn WriteCallback>>,
    // waiting for connection credit
    conn_write: Option<Weak<dyn WriteCallback>>,
    data_expired: Option<Weak<dyn DataExpiredCallback>>,
    data_rejected: Option<Weak<dyn DataRejectedCallback>>,
}

impl Callbacks {
    fn conn(&self) -> Option<Arc<dyn ConnectionCallback>> {
        upgrade(&self.conn)
    }
}

enum Attempt {
    Built(Packet, WriteDataReason),
    Nothing(WriteDataReason, NoWriteReason),
}

pub struct Connection {
    key: ConnKey,
    worker: WorkerId,
    role: Role,
    source: Option<SourceIdentity>,
    settings: TransportSettings,
    state: ConnectionState,
    keys: Box<dyn HandshakeKeys + Send>,
    cc: Box<dyn CongestionController>,

    tx: TransmitState,
    scheduler: FrameScheduler,
    sent: [SentJournal; 3],
    rtt: Rtt,
    pto_count: u32,
    loss_time: [Option<Instant>; 3],
    last_ack_eliciting_sent: [Option<Instant>; 3],
    discarded: [bool; 3],
    // the largest MAX_DATA granted by the peer
    conn_send_max: u64,
    app_limited: bool,

    recv: BTreeMap<StreamId, RecvBuffer>,
    stream_ids: StreamIds,
    conn_recv_max: u64,
    conn_rcvd: u64,
    conn_read: u64,
    first_packet_processed: bool,
    replay_safe: bool,

    local_cids: LocalCids,
    peer_cids: PeerCids,
    routing: Option<Weak<dyn RoutingCallback>>,
    cid_gen: Option<CidGenerator>,
    bound: bool,

    tracker: ByteEventTracker,
    loop_detector: LoopDetector,
    observers: ArcObservers,
    callbacks: Callbacks,
    closing: Closing,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("worker", &self.worker)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("streams", &self.tx.streams.len())
            .field("bytes_in_flight", &self.bytes_in_flight())
            .finish_non_exhaustive()
    }
}

/// A connection dropped without draining still gives up its routes and
/// tells its observers.
impl Drop for Connection {
    fn drop(&mut self) {
        if !self.closing.is_destroyed() {
            tracing::debug!(target: "quic", key = %self.key, state = %self.state, "connection dropped before draining");
        }
        self.destroy();
    }
}

impl Connection {
    /// A server connection, created for the first datagram of a client.
    pub fn accept(
        endpoints: ConnectionEndpoints,
        settings: TransportSettings,
        keys: Box<dyn HandshakeKeys + Send>,
        cc: Box<dyn CongestionController>,
    ) -> Self {
        Self::new(Role::Server, endpoints, settings, keys, cc)
    }

    pub fn connect(
        endpoints: ConnectionEndpoints,
        settings: TransportSettings,
        keys: Box<dyn HandshakeKeys + Send>,
        cc: Box<dyn CongestionController>,
    ) -> Self {
        Self::new(Role::Client, endpoints, settings, keys, cc)
    }

    fn new(
        role: Role,
        endpoints: ConnectionEndpoints,
        settings: TransportSettings,
        keys: Box<dyn HandshakeKeys + Send>,
        cc: Box<dyn CongestionController>,
    ) -> Self {
        let streams = [
            settings.initial_max_streams_bidi(),
            settings.initial_max_streams_uni(),
        ];
        tracing::debug!(target: "quic", key = %endpoints.key, worker = %endpoints.worker, %role, "connection created");
        Self {
            key: endpoints.key,
            worker: endpoints.worker,
            role,
            source: endpoints.source,
            state: ConnectionState::Handshaking,
            keys,
            cc,
            tx: TransmitState::new(settings.initial_max_data(), Instant::now()),
            scheduler: FrameScheduler::new(settings.scheduling_policy()),
            sent: Epoch::EPOCHS.map(SentJournal::new),
            rtt: Rtt::new(settings.max_ack_delay()),
            pto_count: 0,
            loss_time: [None; 3],
            last_ack_eliciting_sent: [None; 3],
            discarded: [false; 3],
            conn_send_max: settings.initial_max_data(),
            app_limited: false,
            recv: BTreeMap::new(),
            stream_ids: StreamIds::new(role, streams, streams),
            conn_recv_max: settings.initial_max_data(),
            conn_rcvd: 0,
            conn_read: 0,
            first_packet_processed: false,
            replay_safe: false,
            local_cids: LocalCids::new(endpoints.local_cid),
            peer_cids: PeerCids::new(endpoints.peer_cid),
            routing: None,
            cid_gen: None,
            bound: false,
            tracker: ByteEventTracker::new(),
            loop_detector: LoopDetector::new(settings.loop_detector_threshold()),
            observers: ArcObservers::new(),
            callbacks: Callbacks::default(),
            closing: Closing::default(),
            settings,
        }
    }

    pub fn key(&self) -> ConnKey {
        self.key
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    pub fn source(&self) -> Option<SourceIdentity> {
        self.source
    }

    pub fn rtt(&self) -> &Rtt {
        &self.rtt
    }

    /// The registry observers of this connection are attached to.
    pub fn observers(&self) -> &ArcObservers {
        &self.observers
    }

    /// The ids issued by this endpoint and not retired, by sequence number.
    pub fn local_connection_ids(&self) -> Vec<ConnectionIdData> {
        self.local_cids.ids()
    }

    /// The id packets to the peer are addressed with.
    pub fn peer_cid(&self) -> ConnectionId {
        self.peer_cids.current()
    }

    pub fn bytes_in_flight(&self) -> usize {
        self.sent.iter().map(SentJournal::bytes_in_flight).sum()
    }

    pub fn is_destroyed(&self) -> bool {
        self.closing.is_destroyed()
    }

    fn is_active(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Handshaking | ConnectionState::Established
        )
    }

    pub fn set_connection_callback(&mut self, callback: Option<Weak<dyn ConnectionCallback>>) {
        self.callbacks.conn = callback;
    }

    pub fn set_loop_detector_callback(&mut self, callback: Option<Weak<dyn LoopDetectorCallback>>) {
        self.loop_detector.set_callback(callback);
    }

    pub fn set_data_expired_callback(&mut self, callback: Option<Weak<dyn DataExpiredCallback>>) {
        self.callbacks.data_expired = callback;
    }

    pub fn set_data_rejected_callback(&mut self, callback: Option<Weak<dyn DataRejectedCallback>>) {
        self.callbacks.data_rejected = callback;
    }

    /// Queue handshake bytes produced by the TLS stack for `epoch`.
    pub fn write_crypto(&mut self, epoch: Epoch, data: &[u8]) -> Result<u64, LocalError> {
        if !self.is_active() {
            return Err(LocalError::ConnectionClosed);
        }
        Ok(self.tx.crypto[epoch].write(data))
    }

    /// The handshake collaborator made progress outside of a received
    /// packet, new keys for instance.
    pub fn on_keys_changed(&mut self) {
        self.on_handshake_progress();
    }

    fn header(&self, epoch: Epoch) -> PacketHeader {
        let journal = &self.sent[epoch];
        let dcid = self.peer_cids.current();
        match epoch {
            Epoch::Data => PacketHeader::short(journal.next_pn(), journal.largest_acked(), dcid),
            _ => PacketHeader::long(
                epoch,
                journal.next_pn(),
                journal.largest_acked(),
                dcid,
                self.local_cids.initial(),
            ),
        }
    }

    /// The highest space a CONNECTION_CLOSE can be sent in.
    fn close_epoch(&self) -> Option<Epoch> {
        Epoch::EPOCHS
            .into_iter()
            .rev()
            .find(|&epoch| self.keys.has_keys(epoch) && !self.discarded[epoch])
    }

    fn try_build_packet(
        &mut self,
        epoch: Epoch,
        capacity: usize,
        writable_bytes: usize,
        now: Instant,
    ) -> Result<Attempt, LocalError> {
        let nothing = Attempt::Nothing(WriteDataReason::NoWrite, NoWriteReason::EmptyScheduler);
        match self.state {
            ConnectionState::Draining => return Err(LocalError::ConnectionClosed),
            ConnectionState::Closing | ConnectionState::Closed
                if self.tx.close.is_none() || self.close_epoch() != Some(epoch) =>
            {
                return Ok(nothing);
            }
            _ => {}
        }
        if !self.keys.has_keys(epoch) || self.discarded[epoch] {
            return Ok(nothing);
        }

        let quota = self.cc.send_quota(self.bytes_in_flight());
        self.tx.now = now;
        self.tx.pad_to = (epoch == Epoch::Initial)
            .then(|| self.settings.min_initial_datagram_size());
        self.tx.congestion_limited = false;
        let wanted = self.scheduler.next_category(&self.tx, epoch);
        self.tx.congestion_limited = quota == 0;
        let Some(category) = self.scheduler.next_category(&self.tx, epoch) else {
            return Ok(match wanted {
                Some(category) => {
                    Attempt::Nothing(category.write_reason(), NoWriteReason::CongestionLimited)
                }
                None => self.idle_attempt(epoch, quota),
            });
        };
        let writable = if self.tx.congestion_limited {
            writable_bytes
        } else {
            writable_bytes.min(quota)
        };
        let write_reason = if category == FrameCategory::Control
            && self.tx.ping[epoch]
            && (epoch != Epoch::Data || self.tx.control.is_empty())
        {
            WriteDataReason::Probes
        } else {
            category.write_reason()
        };

        let mut builder = PacketBuilder::new(self.header(epoch), capacity, self.settings.tag_len())?;
        let result = self
            .scheduler
            .schedule_frames_for_packet(&mut self.tx, &mut builder, writable);
        if !result.should_send {
            let reason = if result.frames_written == 0 {
                NoWriteReason::NoFrame
            } else {
                NoWriteReason::NoBody
            };
            return Ok(Attempt::Nothing(write_reason, reason));
        }
        let carries_path_validation = builder
            .frames()
            .iter()
            .any(|frame| matches!(frame, Frame::PathChallenge(..) | Frame::PathResponse(..)));
        if carries_path_validation {
            builder = builder.with_min_packet_size(self.settings.min_initial_datagram_size());
        }
        let packet = builder.finalize()?;
        self.on_packet_sent(&packet, now);
        Ok(Attempt::Built(packet, write_reason))
    }

    /// Why an epoch with keys had nothing to schedule.
    fn idle_attempt(&self, epoch: Epoch, quota: usize) -> Attempt {
        if epoch != Epoch::Data {
            return Attempt::Nothing(WriteDataReason::NoWrite, NoWriteReason::EmptyScheduler);
        }
        if self.tx.is_flow_blocked() {
            return Attempt::Nothing(WriteDataReason::Stream, NoWriteReason::FlowControlBlocked);
        }
        let has_open_stream = self.tx.streams.values().any(SendBuffer::is_writable);
        if quota > 0 && self.state == ConnectionState::Established && has_open_stream {
            return Attempt::Nothing(WriteDataReason::NoWrite, NoWriteReason::AppLimited);
        }
        Attempt::Nothing(WriteDataReason::NoWrite, NoWriteReason::EmptyScheduler)
    }

    fn on_packet_sent(&mut self, packet: &Packet, now: Instant) {
        let epoch = packet.epoch();
        let record = SentPacket::from_frames(packet.pn(), epoch, now, packet.size(), packet.frames());
        self.cc
            .on_packet_sent(epoch, packet.pn(), packet.size(), record.in_flight, now);
        if record.ack_eliciting {
            self.last_ack_eliciting_sent[epoch] = Some(now);
        }
        self.sent[epoch].on_packet_sent(record);

        let mut streams = Vec::new();
        for frame in packet.frames() {
            match frame {
                Frame::Ack(..) => self.tx.rcvd[epoch].on_ack_sent(),
                Frame::ConnectionClose(..) => {
                    self.tx.close = None;
                    self.closing.on_close_sent(now);
                }
                Frame::Stream(stream) => streams.push(stream.stream_id),
                _ => {}
            }
        }
        streams.dedup();
        for sid in streams {
            if let Some(frontier) = self.tx.streams.get(&sid).and_then(SendBuffer::tx_frontier) {
                self.tracker.on_bytes_sent(sid, frontier);
            }
        }
        tracing::trace!(
            target: "quic",
            key = %self.key,
            ?epoch,
            pn = packet.pn(),
            size = packet.size(),
            frames = packet.frames().len(),
            "packet sent"
        );
    }

    fn record_write_attempt(&mut self, attempt: Attempt, context: &str) -> Option<Packet> {
        match attempt {
            Attempt::Built(packet, reason) => {
                self.loop_detector
                    .on_write_attempt(reason, NoWriteReason::WriteOk, context);
                Some(packet)
            }
            Attempt::Nothing(reason, no_write) => {
                self.loop_detector.on_write_attempt(reason, no_write, context);
                None
            }
        }
    }

    /// Build one packet of `epoch` in `capacity` bytes, using at most
    /// `writable_bytes` of them for frames. `None` when nothing was worth
    /// sending.
    pub fn build_packet(
        &mut self,
        epoch: Epoch,
        capacity: usize,
        writable_bytes: usize,
        now: Instant,
    ) -> Result<Option<Packet>, LocalError> {
        let attempt = self.try_build_packet(epoch, capacity, writable_bytes, now)?;
        Ok(self.record_write_attempt(attempt, "build_packet"))
    }

    /// The driver failed to hand a datagram of this connection to the
    /// socket.
    pub fn on_write_failure(&mut self) {
        self.loop_detector.on_write_attempt(
            WriteDataReason::NoWrite,
            NoWriteReason::SocketFailure,
            "socket_write",
        );
    }

    /// The packet carrying the pending CONNECTION_CLOSE, if there is one.
    pub fn build_close_packet(
        &mut self,
        capacity: usize,
        now: Instant,
    ) -> Result<Option<Packet>, LocalError> {
        if self.tx.close.is_none() {
            return Ok(None);
        }
        let Some(epoch) = self.close_epoch() else {
            return Ok(None);
        };
        self.build_packet(epoch, capacity, capacity, now)
    }

    /// Everything there is to send now, as datagrams of coalesced packets.
    /// At most `max_packets_per_write` packets are produced per call.
    pub fn write_datagrams(&mut self, now: Instant) -> Result<Vec<Vec<Packet>>, LocalError> {
        let max_size = self.settings.max_packet_size();
        let mut packets_left = self.settings.max_packets_per_write();
        let mut datagrams = Vec::new();
        let mut last_written = None;
        let mut idle_reason = (WriteDataReason::NoWrite, NoWriteReason::EmptyScheduler);

        while packets_left > 0 {
            let mut datagram = Vec::new();
            let mut remaining = max_size;
            for &epoch in Epoch::iter() {
                if packets_left == 0 {
                    break;
                }
                match self.try_build_packet(epoch, remaining, remaining, now) {
                    Ok(Attempt::Built(packet, reason)) => {
                        remaining -= packet.size();
                        packets_left -= 1;
                        last_written = Some(reason);
                        datagram.push(packet);
                    }
                    Ok(Attempt::Nothing(data, no_write)) => {
                        if idle_reason.1 == NoWriteReason::EmptyScheduler {
                            idle_reason = (data, no_write);
                        }
                    }
                    Err(LocalError::Rejected { .. }) => break,
                    Err(error) => return Err(error),
                }
            }
            if datagram.is_empty() {
                break;
            }
            datagrams.push(datagram);
        }

        match last_written {
            Some(reason) => {
                self.loop_detector
                    .on_write_attempt(reason, NoWriteReason::WriteOk, "write_datagrams");
            }
            None => {
                self.loop_detector
                    .on_write_attempt(idle_reason.0, idle_reason.1, "write_datagrams");
            }
        }
        self.check_app_limited(!datagrams.is_empty());
        Ok(datagrams)
    }

    fn check_app_limited(&mut self, wrote: bool) {
        let has_more = Epoch::EPOCHS
            .into_iter()
            .any(|epoch| self.keys.has_keys(epoch) && self.scheduler.has_data(&self.tx, epoch));
        let limited = self.is_active()
            && !has_more
            && self.cc.send_quota(self.bytes_in_flight()) > 0;
        if wrote && limited && !self.app_limited {
            tracing::trace!(target: "quic", key = %self.key, "app rate limited");
            self.observers.on_app_rate_limited();
            if let Some(cb) = self.callbacks.conn() {
                cb.on_app_rate_limited();
            }
        }
        self.app_limited = limited;
    }

    fn pto_deadline(&self, epoch: Epoch) -> Option<Instant> {
        if !self.sent[epoch].has_ack_eliciting_in_flight() {
            return None;
        }
        let sent = self.last_ack_eliciting_sent[epoch]?;
        let mut duration = self.rtt.pto_base_duration(self.pto_count);
        if epoch == Epoch::Data {
            duration += self.settings.max_ack_delay();
        }
        Some(sent + duration)
    }

    /// When [`Connection::on_loss_timeout`] is to be called next.
    pub fn loss_timeout(&self) -> Option<Instant> {
        if !matches!(
            self.state,
            ConnectionState::Handshaking | ConnectionState::Established | ConnectionState::Closing
        ) {
            return None;
        }
        if let Some(loss_time) = self.loss_time.iter().flatten().min() {
            return Some(*loss_time);
        }
        Epoch::EPOCHS
            .into_iter()
            .filter_map(|epoch| self.pto_deadline(epoch))
            .min()
    }

    /// Either declare packets lost by time, or fire a probe timeout, which
    /// queues a PING in the space that timed out.
    pub fn on_loss_timeout(&mut self, now: Instant) {
        let expired = Epoch::EPOCHS
            .into_iter()
            .find(|&epoch| self.loss_time[epoch].is_some_and(|time| time <= now));
        if let Some(epoch) = expired {
            self.detect_loss(epoch, now);
            return;
        }
        let probe = Epoch::EPOCHS
            .into_iter()
            .filter_map(|epoch| Some((epoch, self.pto_deadline(epoch)?)))
            .filter(|&(_, deadline)| deadline <= now)
            .min_by_key(|&(_, deadline)| deadline);
        if let Some((epoch, _)) = probe {
            self.pto_count += 1;
            self.tx.ping[epoch] = true;
            tracing::debug!(target: "quic", key = %self.key, ?epoch, pto_count = self.pto_count, "probe timeout");
        }
    }

    /// How long the connection stays in the closing or draining state
    /// before it can be destroyed.
    pub fn drain_timeout(&self) -> Duration {
        self.rtt.pto_base_duration(0) * self.settings.drain_pto_multiplier()
    }

    /// The draining period is over.
    pub fn on_drain_timeout(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Closing | ConnectionState::Draining
        ) {
            self.state = ConnectionState::Closed;
            self.tx.close = None;
            self.destroy();
        }
    }

    /// Keys of `epoch` were dropped: nothing is sent or received in that
    /// space any more.
    pub fn discard_keys(&mut self, epoch: Epoch) {
        if self.discarded[epoch] {
            return;
        }
        self.discarded[epoch] = true;
        let dropped = self.sent[epoch].discard();
        self.loss_time[epoch] = None;
        self.last_ack_eliciting_sent[epoch] = None;
        self.tx.lost_frames[epoch].clear();
        self.tx.ping[epoch] = false;
        self.pto_count = 0;
        tracing::debug!(target: "quic", key = %self.key, ?epoch, dropped = dropped.len(), "space discarded");
    }
}
