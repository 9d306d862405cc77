use std::time::{Duration, Instant};

use qbase::{
    codec::DecodedPacket,
    error::{ApplicationError, ErrorKind, QuicError, TransportError},
    frame::{ConnectionCloseFrame, Frame},
    varint::VarInt,
};
use qrecovery::send::SendBuffer;

use super::{Connection, ConnectionState, upgrade};

/// Packets received while closing before the CONNECTION_CLOSE is sent again.
const RESEND_AFTER_PACKETS: usize = 5;
/// Time since the last CONNECTION_CLOSE after which any packet triggers a
/// new one.
const RESEND_AFTER: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
pub(super) struct Closing {
    error: Option<QuicError>,
    frame: Option<ConnectionCloseFrame>,
    // close once every stream has delivered its data
    graceful: bool,
    rcvd_packets: usize,
    last_sent: Option<Instant>,
    destroyed: bool,
}

impl Closing {
    pub(super) fn on_close_sent(&mut self, now: Instant) {
        self.last_sent = Some(now);
        self.rcvd_packets = 0;
    }

    pub(super) fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub(super) fn is_graceful(&self) -> bool {
        self.graceful
    }

    /// Count a packet received while closing; true if the close frame is
    /// due again.
    fn on_packet_rcvd(&mut self, now: Instant) -> bool {
        self.rcvd_packets += 1;
        self.rcvd_packets > RESEND_AFTER_PACKETS
            || self
                .last_sent
                .is_none_or(|sent| now.saturating_duration_since(sent) > RESEND_AFTER)
    }
}

/// Everything written to the stream reached the peer, or never will.
fn is_settled(stream: &SendBuffer) -> bool {
    let acked = stream.ack_frontier().map_or(0, |frontier| frontier + 1);
    stream.is_reset()
        || stream.is_fully_acked()
        || (stream.is_writable()
            && !stream.has_pending()
            && !stream.has_lost()
            && acked >= stream.written())
}

impl Connection {
    /// The error the connection ended with, if it did not end cleanly.
    pub fn error(&self) -> Option<&QuicError> {
        self.closing.error.as_ref()
    }

    /// Start closing the connection.
    ///
    /// Without an error the close is graceful: no new stream data is
    /// accepted, and the CONNECTION_CLOSE is sent once everything already
    /// written has been acknowledged. With an error the close is immediate.
    pub fn close(&mut self, error: Option<QuicError>) {
        if !self.is_active() {
            return;
        }
        if error.is_none() && !self.tx.streams.values().all(is_settled) {
            if !self.closing.graceful {
                self.closing.graceful = true;
                tracing::info!(target: "quic", key = %self.key, "closing once stream data is acknowledged");
            }
            return;
        }
        self.enter_closing(error);
    }

    /// Close and destroy right away. The CONNECTION_CLOSE stays queued, the
    /// driver may still send it once with [`Connection::build_close_packet`].
    pub fn close_now(&mut self, error: Option<QuicError>) {
        if self.is_active() {
            self.enter_closing(error);
        }
        self.state = ConnectionState::Closed;
        self.destroy();
    }

    pub(super) fn maybe_finish_graceful_close(&mut self) {
        if self.closing.graceful && self.is_active() && self.tx.streams.values().all(is_settled) {
            self.enter_closing(None);
        }
    }

    fn enter_closing(&mut self, error: Option<QuicError>) {
        let frame = match &error {
            Some(error) => ConnectionCloseFrame::from(error),
            None => ConnectionCloseFrame::from(&QuicError::from(
                TransportError::with_default_fty(ErrorKind::None, ""),
            )),
        };
        self.tx.close = Some(frame.clone());
        self.closing.frame = Some(frame);
        self.closing.error = error;
        self.state = ConnectionState::Closing;
        let error = self.closing.error.clone();
        self.teardown(error.as_ref());
    }

    pub(super) fn on_peer_close(&mut self, frame: &ConnectionCloseFrame) {
        let error = QuicError::from(frame);
        let error = (error.is_application() || error.code() != VarInt::from_u32(0)).then_some(error);
        match &error {
            Some(error) => tracing::info!(target: "quic", key = %self.key, %error, "peer closed the connection"),
            None => tracing::info!(target: "quic", key = %self.key, "peer closed the connection"),
        }
        self.closing.error = error.clone();
        self.state = ConnectionState::Draining;
        self.tx.close = None;
        self.teardown(error.as_ref());
    }

    /// A packet arrived while closing: only a CONNECTION_CLOSE from the
    /// peer matters, anything else may get our close frame sent again.
    pub(super) fn on_packet_while_closing(&mut self, packet: &DecodedPacket, now: Instant) {
        if packet
            .frames
            .iter()
            .any(|frame| matches!(frame, Frame::ConnectionClose(..)))
        {
            tracing::debug!(target: "quic", key = %self.key, "peer close received while closing");
            self.state = ConnectionState::Draining;
            self.tx.close = None;
            return;
        }
        if self.closing.on_packet_rcvd(now) && self.tx.close.is_none() {
            self.tx.close = self.closing.frame.clone();
            self.closing.rcvd_packets = 0;
        }
    }

    /// Tell everyone waiting on the connection that it is over.
    fn teardown(&mut self, error: Option<&QuicError>) {
        match error {
            Some(error) => tracing::info!(target: "quic", key = %self.key, %error, "connection closing"),
            None => tracing::info!(target: "quic", key = %self.key, "connection closing"),
        }
        self.observers.on_close(error);
        let canceled = self.tracker.cancel_all();
        tracing::debug!(target: "quic", key = %self.key, canceled, "byte events canceled");

        let stream_error = error.cloned().unwrap_or_else(|| {
            ApplicationError::new(VarInt::from_u32(0), "connection closed").into()
        });
        for (sid, cb) in self.callbacks.read.drain() {
            if let Some(cb) = cb.upgrade() {
                cb.read_error(sid, &stream_error);
            }
        }
        for (sid, cb) in self.callbacks.peek.drain() {
            if let Some(cb) = cb.upgrade() {
                cb.peek_error(sid, &stream_error);
            }
        }
        for (sid, cb) in self.callbacks.stream_write.drain() {
            if let Some(cb) = cb.upgrade() {
                cb.on_stream_write_error(sid, &stream_error);
            }
        }
        if let Some(cb) = self.callbacks.conn_write.take().and_then(|cb| cb.upgrade()) {
            cb.on_connection_write_error(&stream_error);
        }
        if let Some(cb) = self.callbacks.conn() {
            match error {
                Some(error) => cb.on_connection_error(error),
                None => cb.on_connection_end(),
            }
        }
    }

    /// Release the routes and the observers. Happens once, at the end of
    /// the draining period or on an immediate close.
    pub(super) fn destroy(&mut self) {
        if self.closing.destroyed {
            return;
        }
        self.closing.destroyed = true;
        if let Some(routing) = upgrade(&self.routing) {
            match self.source {
                Some(source) => {
                    let ids = self.local_cids.ids();
                    if let Err(error) = routing.on_connection_unbound(self.key, source, &ids) {
                        tracing::warn!(target: "quic", key = %self.key, %error, "failed to unbind connection");
                    }
                }
                None => {
                    tracing::warn!(target: "quic", key = %self.key, "routed connection without source address");
                }
            }
        }
        let observers = self.observers.destroy();
        tracing::debug!(target: "quic", key = %self.key, observers, "connection destroyed");
    }
}
