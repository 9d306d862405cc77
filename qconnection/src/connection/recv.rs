use std::time::{Duration, Instant};

use qbase::{
    Epoch,
    cid::ConnectionId,
    codec::DecodedPacket,
    error::{ErrorKind, QuicError, TransportError},
    frame::{AckFrame, BeFrame, Frame, FrameSpecs, FrameType, PathResponseFrame},
    sid::Role,
};
use qevent::{LossEvent, RttSample};
use qrecovery::{journal::SentRecord, loss::detect_lost};

use super::{Connection, ConnectionState};
use crate::loop_detector::NoReadReason;

fn space_name(epoch: Epoch) -> &'static str {
    match epoch {
        Epoch::Initial => "initial",
        Epoch::Handshake => "handshake",
        Epoch::Data => "application",
    }
}

impl Connection {
    /// Process the packets of one datagram, already split and unprotected.
    ///
    /// A protocol error closes the connection and is returned; packets that
    /// cannot be processed, duplicates for instance, are silently dropped.
    pub fn recv_datagram(&mut self, packets: Vec<DecodedPacket>, now: Instant) -> Result<(), QuicError> {
        if packets.is_empty() {
            self.loop_detector.on_read_attempt(NoReadReason::EmptyData);
            return Ok(());
        }
        let mut processed = false;
        for packet in packets {
            processed |= self.process_packet(packet, now)?;
        }
        let reason = if processed {
            NoReadReason::ReadOk
        } else {
            NoReadReason::StaleData
        };
        self.loop_detector.on_read_attempt(reason);
        Ok(())
    }

    /// The driver failed to get a datagram out of the socket or the codec.
    pub fn on_read_failure(&mut self, reason: NoReadReason) {
        self.loop_detector.on_read_attempt(reason);
    }

    /// The codec found a datagram of this connection malformed.
    pub fn on_decode_error(&mut self, error: TransportError) {
        self.loop_detector
            .on_read_attempt(NoReadReason::NonRetriableError);
        self.close(Some(error.into()));
    }

    fn process_packet(&mut self, packet: DecodedPacket, now: Instant) -> Result<bool, QuicError> {
        match self.state {
            ConnectionState::Draining | ConnectionState::Closed => return Ok(false),
            ConnectionState::Closing => {
                self.on_packet_while_closing(&packet, now);
                return Ok(true);
            }
            ConnectionState::Handshaking | ConnectionState::Established => {}
        }
        let epoch = packet.epoch;
        if !self.keys.has_keys(epoch) || self.discarded[epoch] {
            tracing::trace!(target: "quic", key = %self.key, ?epoch, pn = packet.pn, "no keys, packet dropped");
            return Ok(false);
        }
        let ack_eliciting = packet
            .frames
            .iter()
            .any(|frame| !frame.specs().contains(FrameSpecs::NON_ACK_ELICITING));
        if let Err(error) = self.tx.rcvd[epoch].on_packet_rcvd(packet.pn, ack_eliciting, now) {
            tracing::trace!(target: "quic", key = %self.key, ?epoch, pn = packet.pn, %error, "packet ignored");
            return Ok(false);
        }
        self.on_dcid(&packet.dcid);
        if let Some(scid) = packet.scid {
            self.on_peer_scid(scid);
        }
        if !self.first_packet_processed {
            self.first_packet_processed = true;
            if let Some(cb) = self.callbacks.conn() {
                cb.on_first_peer_packet_processed();
            }
        }

        for frame in packet.frames {
            if !self.is_active() {
                break;
            }
            if let Err(error) = self.on_frame(epoch, frame, &packet.dcid, now) {
                tracing::warn!(target: "quic", key = %self.key, ?epoch, pn = packet.pn, %error, "frame rejected");
                self.close(Some(error.clone()));
                return Err(error);
            }
        }
        self.on_handshake_progress();
        Ok(true)
    }

    fn on_frame(
        &mut self,
        epoch: Epoch,
        frame: Frame,
        dcid: &ConnectionId,
        now: Instant,
    ) -> Result<(), QuicError> {
        if epoch != Epoch::Data
            && !matches!(
                frame,
                Frame::Padding(..)
                    | Frame::Ping(..)
                    | Frame::Ack(..)
                    | Frame::Crypto(..)
                    | Frame::ConnectionClose(..)
            )
        {
            let frame_type = frame.frame_type();
            return Err(TransportError::new(
                ErrorKind::ProtocolViolation,
                Some(frame_type),
                format!("{frame_type:?} frame in the {} space", space_name(epoch)),
            )
            .into());
        }
        match frame {
            Frame::Padding(..) | Frame::Ping(..) => {}
            Frame::Ack(ack) => self.on_ack_frame(epoch, &ack, now)?,
            Frame::Crypto(crypto) => self.keys.on_crypto_frame(epoch, &crypto),
            Frame::Stream(stream) => self.on_stream_frame(stream)?,
            Frame::ResetStream(reset) => self.on_reset_stream(reset)?,
            Frame::StopSending(stop) => self.on_stop_sending(stop)?,
            Frame::MaxData(max_data) => self.on_max_data(max_data.max_data.into_inner()),
            Frame::MaxStreamData(max) => self.on_max_stream_data(max)?,
            Frame::MaxStreams(max) => self.on_max_streams(max),
            Frame::DataBlocked(..) | Frame::StreamDataBlocked(..) => {
                tracing::trace!(target: "quic", key = %self.key, "peer is blocked by flow control");
            }
            Frame::NewConnectionId(new) => self.on_new_connection_id(&new)?,
            Frame::RetireConnectionId(retire) => {
                self.on_retire_connection_id(retire.sequence.into_inner(), dcid)?
            }
            Frame::PathChallenge(challenge) => self
                .tx
                .control
                .push_back(PathResponseFrame { data: challenge.data }.into()),
            Frame::PathResponse(..) => {}
            Frame::ConnectionClose(close) => self.on_peer_close(&close),
            Frame::HandshakeDone(..) => {
                if self.role == Role::Server {
                    return Err(TransportError::new(
                        ErrorKind::ProtocolViolation,
                        Some(FrameType::HandshakeDone),
                        "HANDSHAKE_DONE sent by a client",
                    )
                    .into());
                }
            }
            Frame::ExpiredStreamData(expired) => self.on_expired_stream_data(expired)?,
            Frame::MinStreamData(min) => self.on_min_stream_data(min)?,
        }
        Ok(())
    }

    pub(super) fn on_handshake_progress(&mut self) {
        if self.state == ConnectionState::Handshaking && self.keys.has_keys(Epoch::Data) {
            self.state = ConnectionState::Established;
            tracing::info!(target: "quic", key = %self.key, role = %self.role, "transport ready");
            if let Some(cb) = self.callbacks.conn() {
                cb.on_transport_ready();
            }
            self.replenish_connection_ids();
        }
        if !self.replay_safe && self.keys.is_replay_safe() {
            self.replay_safe = true;
            if let Some(cb) = self.callbacks.conn() {
                cb.on_replay_safe();
            }
        }
    }

    fn on_ack_frame(&mut self, epoch: Epoch, ack: &AckFrame, now: Instant) -> Result<(), TransportError> {
        let acked = self.sent[epoch].on_ack_frame(ack).map_err(|error| {
            TransportError::new(ErrorKind::ProtocolViolation, Some(FrameType::Ack), error.to_string())
        })?;

        if let Some(largest) = acked
            .last()
            .filter(|packet| packet.pn == ack.largest && packet.ack_eliciting)
        {
            let latest_rtt = now.saturating_duration_since(largest.time_sent);
            let ack_delay = match epoch {
                Epoch::Data => Duration::from_micros(ack.delay),
                _ => Duration::ZERO,
            };
            self.rtt
                .update(latest_rtt, ack_delay, self.state == ConnectionState::Established);
            self.observers.on_rtt_sample_generated(&RttSample {
                packet_number: largest.pn,
                rtt: latest_rtt,
                ack_delay,
                smoothed_rtt: self.rtt.smoothed_rtt(),
                min_rtt: self.rtt.min_rtt(),
            });
        }
        if !acked.is_empty() {
            self.pto_count = 0;
        }

        let mut streams = Vec::new();
        for packet in acked {
            if packet.in_flight {
                self.cc
                    .on_packet_acked(epoch, packet.pn, packet.size, packet.time_sent, now);
            }
            for record in packet.records {
                match record {
                    SentRecord::Stream {
                        stream_id,
                        range,
                        fin,
                    } => {
                        if let Some(stream) = self.tx.streams.get_mut(&stream_id) {
                            stream.on_acked(range, fin);
                            streams.push(stream_id);
                        }
                    }
                    SentRecord::Control(Frame::Crypto(crypto)) => {
                        let start = crypto.offset;
                        self.tx.crypto[epoch].on_acked(start..start + crypto.data.len() as u64);
                    }
                    SentRecord::Control(..) => {}
                    SentRecord::Ack { largest } => self.tx.rcvd[epoch].on_ack_acked(largest),
                }
            }
        }
        streams.sort_unstable();
        streams.dedup();
        let srtt = self.rtt.smoothed_rtt();
        for sid in streams {
            self.on_stream_acked(sid, srtt);
        }

        self.detect_loss(epoch, now);
        self.maybe_finish_graceful_close();
        Ok(())
    }

    pub(super) fn detect_loss(&mut self, epoch: Epoch, now: Instant) {
        let detection = detect_lost(&mut self.sent[epoch], &self.rtt, now);
        self.loss_time[epoch] = detection.loss_time;
        if detection.lost.is_empty() {
            return;
        }

        let mut lost_packets = Vec::with_capacity(detection.lost.len());
        for lost in detection.lost {
            let packet = lost.packet;
            if packet.in_flight {
                self.cc
                    .on_packet_lost(epoch, packet.pn, packet.size, packet.time_sent, now);
            }
            lost_packets.push(qevent::LostPacket {
                packet_number: packet.pn,
                size: packet.size as u64,
                lost_by_reorder_threshold: lost.by_reorder_threshold,
                lost_by_timeout: lost.by_timeout,
            });
            for record in packet.records {
                match record {
                    SentRecord::Stream {
                        stream_id,
                        range,
                        fin,
                    } => {
                        if let Some(stream) = self.tx.streams.get_mut(&stream_id) {
                            stream.on_lost(range, fin);
                        }
                    }
                    SentRecord::Control(Frame::Crypto(crypto)) => {
                        let start = crypto.offset;
                        self.tx.crypto[epoch].on_lost(start..start + crypto.data.len() as u64);
                    }
                    SentRecord::Control(frame) => self.tx.lost_frames[epoch].push_back(frame),
                    SentRecord::Ack { .. } => {}
                }
            }
        }

        let event = LossEvent {
            space: space_name(epoch).to_owned(),
            largest_acked: self.sent[epoch].largest_acked(),
            lost_packets,
        };
        tracing::debug!(
            target: "quic",
            key = %self.key,
            space = %event.space,
            packets = event.lost_packets.len(),
            bytes = event.lost_bytes(),
            "packets lost"
        );
        self.observers.on_packet_loss_detected(&event);
    }
}
