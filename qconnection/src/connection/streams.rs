use std::{sync::Weak, time::Duration};

use bytes::Bytes;
use qbase::{
    error::{ApplicationError, ErrorKind, LocalError, QuicError, TransportError},
    frame::{
        ExpiredStreamDataFrame, FrameType, MaxDataFrame, MaxStreamDataFrame, MaxStreamsFrame,
        MinStreamDataFrame, ResetStreamFrame, StopSendingFrame, StreamFrame,
    },
    sid::{AcceptSid, Dir, StreamId, StreamIdError},
    varint::VarInt,
};
use qrecovery::{
    byte_event::{ByteEventCallback, ByteEventKind, DeliveryCallback},
    recv::RecvBuffer,
    send::SendBuffer,
};

use super::{Connection, ConnectionState, upgrade};
use crate::callback::{PeekCallback, ReadCallback, WriteCallback};

impl Connection {
    fn check_writable(&self) -> Result<(), LocalError> {
        if self.is_active() && !self.closing.is_graceful() {
            Ok(())
        } else {
            Err(LocalError::ConnectionClosed)
        }
    }

    pub fn open_bidi_stream(&mut self) -> Result<StreamId, LocalError> {
        self.open_stream(Dir::Bi)
    }

    pub fn open_uni_stream(&mut self) -> Result<StreamId, LocalError> {
        self.open_stream(Dir::Uni)
    }

    fn open_stream(&mut self, dir: Dir) -> Result<StreamId, LocalError> {
        self.check_writable()?;
        let sid = self.stream_ids.open(dir)?;
        let window = self.settings.initial_max_stream_data();
        self.tx.streams.insert(sid, SendBuffer::new(sid, window));
        self.tracker.open_stream(sid);
        if dir == Dir::Bi {
            self.recv.insert(sid, RecvBuffer::new(sid, window));
        }
        tracing::debug!(target: "quic", key = %self.key, %sid, "stream opened");
        Ok(sid)
    }

    /// How many more streams of `dir` the peer currently lets us open.
    pub fn streams_available(&self, dir: Dir) -> u64 {
        self.stream_ids.available(dir)
    }

    /// Buffer `data` on the stream, closing it if `fin`. Returns the stream
    /// offset after the data.
    pub fn write_chain(&mut self, sid: StreamId, data: &[u8], fin: bool) -> Result<u64, LocalError> {
        self.check_writable()?;
        let stream = self
            .tx
            .streams
            .get_mut(&sid)
            .ok_or(LocalError::UnknownStream(sid))?;
        let offset = stream.write(data, fin)?;
        self.app_limited = false;
        Ok(offset)
    }

    /// Consume up to `max` contiguous bytes; the flag tells whether the end
    /// of the stream was reached. Reading opens flow control windows again.
    pub fn read(&mut self, sid: StreamId, max: usize) -> Result<(Bytes, bool), LocalError> {
        if self.state == ConnectionState::Closed {
            return Err(LocalError::ConnectionClosed);
        }
        let stream = self
            .recv
            .get_mut(&sid)
            .ok_or(LocalError::UnknownStream(sid))?;
        if stream.reset_code().is_some() {
            return Err(LocalError::StreamClosed(sid));
        }
        let (data, fin) = stream.read(max);
        if let Some(max_stream_data) = stream.window_update() {
            self.tx.control.push_back(
                MaxStreamDataFrame {
                    stream_id: sid,
                    max_stream_data: VarInt::saturating_from_u64(max_stream_data),
                }
                .into(),
            );
        }
        self.conn_read += data.len() as u64;
        self.update_conn_window();
        if fin {
            self.gc_stream(sid);
        }
        Ok((data, fin))
    }

    fn update_conn_window(&mut self) {
        let window = self.settings.initial_max_data();
        if self.conn_recv_max.saturating_sub(self.conn_read) < window / 2 {
            self.conn_recv_max = self.conn_read + window;
            self.tx.control.push_back(
                MaxDataFrame {
                    max_data: VarInt::saturating_from_u64(self.conn_recv_max),
                }
                .into(),
            );
        }
    }

    /// The buffered segments of the stream, without consuming them.
    pub fn peek(&self, sid: StreamId) -> Result<Vec<(u64, Bytes)>, LocalError> {
        let stream = self.recv.get(&sid).ok_or(LocalError::UnknownStream(sid))?;
        Ok(stream
            .peek()
            .map(|(offset, data)| (offset, data.clone()))
            .collect())
    }

    /// Abandon sending on the stream. Pending byte events are canceled.
    pub fn reset_stream(&mut self, sid: StreamId, error_code: VarInt) -> Result<(), LocalError> {
        let stream = self
            .tx
            .streams
            .get_mut(&sid)
            .ok_or(LocalError::UnknownStream(sid))?;
        let final_size = stream.reset(error_code)?;
        self.tx.control.push_back(
            ResetStreamFrame {
                stream_id: sid,
                app_error_code: error_code,
                final_size,
            }
            .into(),
        );
        let canceled = self.tracker.cancel_stream(sid);
        self.callbacks.stream_write.remove(&sid);
        tracing::debug!(target: "quic", key = %self.key, %sid, %error_code, final_size, canceled, "stream reset");
        self.gc_stream(sid);
        Ok(())
    }

    /// Ask the peer to stop sending on the stream.
    pub fn stop_sending(&mut self, sid: StreamId, error_code: VarInt) -> Result<(), LocalError> {
        let stream = self
            .recv
            .get_mut(&sid)
            .ok_or(LocalError::UnknownStream(sid))?;
        if stream.stop(error_code) {
            self.tx.control.push_back(
                StopSendingFrame {
                    stream_id: sid,
                    app_error_code: error_code,
                }
                .into(),
            );
        }
        self.callbacks.read.remove(&sid);
        self.callbacks.peek.remove(&sid);
        Ok(())
    }

    /// Be told whenever the stream has something to read. Fires right away
    /// if it already has.
    pub fn set_read_callback(
        &mut self,
        sid: StreamId,
        callback: Option<Weak<dyn ReadCallback>>,
    ) -> Result<(), LocalError> {
        let stream = self.recv.get(&sid).ok_or(LocalError::UnknownStream(sid))?;
        let readable = stream.is_readable();
        match callback {
            Some(callback) => {
                self.callbacks.read.insert(sid, callback);
                if readable {
                    self.notify_readable(sid);
                }
            }
            None => {
                self.callbacks.read.remove(&sid);
            }
        }
        Ok(())
    }

    pub fn set_peek_callback(
        &mut self,
        sid: StreamId,
        callback: Option<Weak<dyn PeekCallback>>,
    ) -> Result<(), LocalError> {
        let stream = self.recv.get(&sid).ok_or(LocalError::UnknownStream(sid))?;
        let has_data = stream.peek().next().is_some();
        match callback {
            Some(callback) => {
                self.callbacks.peek.insert(sid, callback);
                if has_data {
                    self.notify_readable(sid);
                }
            }
            None => {
                self.callbacks.peek.remove(&sid);
            }
        }
        Ok(())
    }

    /// Be told once the stream can take more data. Fires right away if it
    /// can, otherwise when the peer raises the stream credit.
    pub fn notify_pending_write_on_stream(
        &mut self,
        sid: StreamId,
        callback: Weak<dyn WriteCallback>,
    ) -> Result<(), LocalError> {
        self.check_writable()?;
        let stream = self
            .tx
            .streams
            .get(&sid)
            .ok_or(LocalError::UnknownStream(sid))?;
        if !stream.is_writable() {
            return Err(LocalError::StreamClosed(sid));
        }
        let window = stream.write_window();
        if window > 0 {
            if let Some(callback) = callback.upgrade() {
                callback.on_stream_write_ready(sid, window);
            }
        } else {
            self.callbacks.stream_write.insert(sid, callback);
        }
        Ok(())
    }

    /// Bytes the application may still buffer before outrunning the
    /// connection credit of the peer.
    pub fn connection_write_window(&self) -> u64 {
        let unsent: u64 = self
            .tx
            .streams
            .values()
            .map(|stream| stream.written().saturating_sub(stream.sent()))
            .sum();
        self.tx.conn_credit.saturating_sub(unsent)
    }

    pub fn notify_pending_write_on_connection(
        &mut self,
        callback: Weak<dyn WriteCallback>,
    ) -> Result<(), LocalError> {
        self.check_writable()?;
        let window = self.connection_write_window();
        if window > 0 {
            if let Some(callback) = callback.upgrade() {
                callback.on_connection_write_ready(window);
            }
        } else {
            self.callbacks.conn_write = Some(callback);
        }
        Ok(())
    }

    fn check_event_offset(&self, sid: StreamId, offset: u64) -> Result<(), LocalError> {
        let stream = self
            .tx
            .streams
            .get(&sid)
            .ok_or(LocalError::UnknownStream(sid))?;
        if stream.is_reset() {
            return Err(LocalError::StreamClosed(sid));
        }
        if !stream.is_writable() && offset >= stream.written() {
            return Err(LocalError::InvalidOperation("offset past the end of the stream"));
        }
        Ok(())
    }

    /// Be told once every byte up to `offset` was acknowledged.
    pub fn register_delivery_callback(
        &mut self,
        sid: StreamId,
        offset: u64,
        callback: Weak<dyn DeliveryCallback>,
    ) -> Result<(), LocalError> {
        self.check_event_offset(sid, offset)?;
        self.tracker.add_delivery_callback(sid, offset, callback)
    }

    /// Be told once every byte up to `offset` was transmitted.
    pub fn register_tx_callback(
        &mut self,
        sid: StreamId,
        offset: u64,
        callback: Weak<dyn ByteEventCallback>,
    ) -> Result<(), LocalError> {
        self.register_byte_event_callback(ByteEventKind::Tx, sid, offset, callback)
    }

    pub fn register_byte_event_callback(
        &mut self,
        kind: ByteEventKind,
        sid: StreamId,
        offset: u64,
        callback: Weak<dyn ByteEventCallback>,
    ) -> Result<(), LocalError> {
        self.check_event_offset(sid, offset)?;
        self.tracker.add_event(sid, offset, kind, callback)
    }

    /// Give up on delivering the bytes of the stream below `offset`. Returns
    /// the new minimum offset announced to the peer, if it advanced.
    pub fn send_data_expired(&mut self, sid: StreamId, offset: u64) -> Result<Option<u64>, LocalError> {
        let stream = self
            .tx
            .streams
            .get_mut(&sid)
            .ok_or(LocalError::UnknownStream(sid))?;
        let Some(offset) = stream.expire(offset) else {
            return Ok(None);
        };
        self.cancel_events_below(sid, offset);
        self.tx.control.push_back(
            ExpiredStreamDataFrame {
                stream_id: sid,
                minimum_stream_offset: offset,
            }
            .into(),
        );
        tracing::debug!(target: "quic", key = %self.key, %sid, offset, "stream data expired");
        Ok(Some(offset))
    }

    /// Tell the peer the bytes of the stream below `offset` are not wanted.
    pub fn send_data_rejected(&mut self, sid: StreamId, offset: u64) -> Result<Option<u64>, LocalError> {
        let stream = self
            .recv
            .get_mut(&sid)
            .ok_or(LocalError::UnknownStream(sid))?;
        let Some(offset) = stream.reject(offset) else {
            return Ok(None);
        };
        self.tx.control.push_back(
            MinStreamDataFrame {
                stream_id: sid,
                maximum_data: VarInt::saturating_from_u64(stream.max_stream_data()),
                minimum_stream_offset: offset,
            }
            .into(),
        );
        tracing::debug!(target: "quic", key = %self.key, %sid, offset, "stream data rejected");
        Ok(Some(offset))
    }

    fn cancel_events_below(&mut self, sid: StreamId, offset: u64) {
        self.tracker.cancel_below(sid, ByteEventKind::Tx, offset);
        self.tracker.cancel_below(sid, ByteEventKind::Ack, offset);
    }

    /// Forget the stream once both directions are done with.
    fn gc_stream(&mut self, sid: StreamId) {
        let send_done = self
            .tx
            .streams
            .get(&sid)
            .is_none_or(|stream| stream.is_fully_acked() || stream.is_reset());
        let recv_done = self.recv.get(&sid).is_none_or(RecvBuffer::is_finished);
        if !(send_done && recv_done) {
            return;
        }
        self.tx.streams.remove(&sid);
        self.recv.remove(&sid);
        self.callbacks.read.remove(&sid);
        self.callbacks.peek.remove(&sid);
        self.callbacks.stream_write.remove(&sid);
        self.tracker.release_stream(sid);
        tracing::debug!(target: "quic", key = %self.key, %sid, "stream closed");
    }

    pub(super) fn on_stream_acked(&mut self, sid: StreamId, srtt: Duration) {
        let Some(stream) = self.tx.streams.get(&sid) else {
            return;
        };
        let fully_acked = stream.is_fully_acked();
        if let Some(frontier) = stream.ack_frontier() {
            self.tracker.on_bytes_acked(sid, frontier, srtt);
        }
        if fully_acked {
            self.gc_stream(sid);
        }
    }

    fn notify_readable(&self, sid: StreamId) {
        if let Some(cb) = self.callbacks.read.get(&sid).and_then(Weak::upgrade) {
            cb.read_available(sid);
        }
        if let Some(cb) = self.callbacks.peek.get(&sid).and_then(Weak::upgrade) {
            if let Some(stream) = self.recv.get(&sid) {
                let segments: Vec<(u64, Bytes)> = stream
                    .peek()
                    .map(|(offset, data)| (offset, data.clone()))
                    .collect();
                cb.on_data_available(sid, &segments);
            }
        }
    }

    /// Validate a stream id from the peer, creating the streams it opens.
    fn accept_stream(&mut self, sid: StreamId, frame_type: FrameType) -> Result<(), TransportError> {
        match self.stream_ids.accept(sid) {
            Ok(AcceptSid::Old) => Ok(()),
            Ok(AcceptSid::New(need_create)) => {
                for sid in need_create {
                    self.create_remote_stream(sid);
                }
                Ok(())
            }
            Err(error @ StreamIdError::ExceedRemoteLimit(..)) => Err(TransportError::new(
                ErrorKind::StreamLimit,
                Some(frame_type),
                error.to_string(),
            )),
            Err(error) => Err(TransportError::new(
                ErrorKind::StreamState,
                Some(frame_type),
                error.to_string(),
            )),
        }
    }

    fn create_remote_stream(&mut self, sid: StreamId) {
        let window = self.settings.initial_max_stream_data();
        self.recv.insert(sid, RecvBuffer::new(sid, window));
        if sid.dir() == Dir::Bi {
            self.tx.streams.insert(sid, SendBuffer::new(sid, window));
            self.tracker.open_stream(sid);
        }
        tracing::debug!(target: "quic", key = %self.key, %sid, "stream opened by peer");
        if let Some(cb) = self.callbacks.conn() {
            match sid.dir() {
                Dir::Bi => cb.on_new_bidirectional_stream(sid),
                Dir::Uni => cb.on_new_unidirectional_stream(sid),
            }
        }
    }

    /// A frame about the receiving half of `sid` must not name a stream we
    /// only send on.
    fn check_recv_half(&self, sid: StreamId, frame_type: FrameType) -> Result<(), TransportError> {
        if sid.dir() == Dir::Uni && sid.role() == self.role {
            return Err(TransportError::new(
                ErrorKind::StreamState,
                Some(frame_type),
                format!("{sid} is send only"),
            ));
        }
        Ok(())
    }

    fn check_send_half(&self, sid: StreamId, frame_type: FrameType) -> Result<(), TransportError> {
        if sid.dir() == Dir::Uni && sid.role() != self.role {
            return Err(TransportError::new(
                ErrorKind::StreamState,
                Some(frame_type),
                format!("{sid} is receive only"),
            ));
        }
        Ok(())
    }

    pub(super) fn on_stream_frame(&mut self, frame: StreamFrame) -> Result<(), TransportError> {
        let sid = frame.stream_id;
        self.check_recv_half(sid, FrameType::Stream)?;
        self.accept_stream(sid, FrameType::Stream)?;
        let Some(stream) = self.recv.get_mut(&sid) else {
            return Ok(());
        };
        let new_bytes = stream.recv(&frame)?;
        let readable = stream.is_readable();
        self.conn_rcvd += new_bytes;
        if self.conn_rcvd > self.conn_recv_max {
            return Err(TransportError::new(
                ErrorKind::FlowControl,
                Some(FrameType::Stream),
                format!("{} bytes exceed connection credit {}", self.conn_rcvd, self.conn_recv_max),
            ));
        }
        if readable {
            self.notify_readable(sid);
        }
        Ok(())
    }

    pub(super) fn on_reset_stream(&mut self, frame: ResetStreamFrame) -> Result<(), TransportError> {
        let sid = frame.stream_id;
        self.check_recv_half(sid, FrameType::ResetStream)?;
        self.accept_stream(sid, FrameType::ResetStream)?;
        let Some(stream) = self.recv.get_mut(&sid) else {
            return Ok(());
        };
        stream.on_reset(frame.app_error_code, frame.final_size)?;
        tracing::debug!(target: "quic", key = %self.key, %sid, code = %frame.app_error_code, "stream reset by peer");
        let error = QuicError::from(ApplicationError::new(frame.app_error_code, "stream reset by peer"));
        if let Some(cb) = self.callbacks.read.remove(&sid).and_then(|cb| cb.upgrade()) {
            cb.read_error(sid, &error);
        }
        if let Some(cb) = self.callbacks.peek.remove(&sid).and_then(|cb| cb.upgrade()) {
            cb.peek_error(sid, &error);
        }
        self.gc_stream(sid);
        Ok(())
    }

    pub(super) fn on_stop_sending(&mut self, frame: StopSendingFrame) -> Result<(), TransportError> {
        let sid = frame.stream_id;
        self.check_send_half(sid, FrameType::StopSending)?;
        self.accept_stream(sid, FrameType::StopSending)?;
        if !self.tx.streams.contains_key(&sid) {
            return Ok(());
        }
        if let Some(cb) = self.callbacks.conn() {
            cb.on_stop_sending(sid, frame.app_error_code);
        }
        // answered with a RESET_STREAM, unless everything already arrived
        if let Err(error) = self.reset_stream(sid, frame.app_error_code) {
            tracing::trace!(target: "quic", key = %self.key, %sid, %error, "stop sending not answered");
        }
        Ok(())
    }

    pub(super) fn on_max_data(&mut self, max_data: u64) {
        if max_data <= self.conn_send_max {
            return;
        }
        self.tx.conn_credit += max_data - self.conn_send_max;
        self.conn_send_max = max_data;
        let window = self.connection_write_window();
        if window > 0 {
            if let Some(cb) = self.callbacks.conn_write.take().and_then(|cb| cb.upgrade()) {
                cb.on_connection_write_ready(window);
            }
        }
    }

    pub(super) fn on_max_stream_data(&mut self, frame: MaxStreamDataFrame) -> Result<(), TransportError> {
        let sid = frame.stream_id;
        self.check_send_half(sid, FrameType::MaxStreamData)?;
        self.accept_stream(sid, FrameType::MaxStreamData)?;
        let Some(stream) = self.tx.streams.get_mut(&sid) else {
            return Ok(());
        };
        if !stream.increase_max_data(frame.max_stream_data.into_inner()) {
            return Ok(());
        }
        let window = stream.write_window();
        if let Some(cb) = self.callbacks.conn() {
            cb.on_flow_control_update(sid);
        }
        if window > 0 {
            if let Some(cb) = self.callbacks.stream_write.remove(&sid).and_then(|cb| cb.upgrade()) {
                cb.on_stream_write_ready(sid, window);
            }
        }
        Ok(())
    }

    pub(super) fn on_max_streams(&mut self, frame: MaxStreamsFrame) {
        if !self
            .stream_ids
            .increase_local_limit(frame.dir, frame.max_streams.into_inner())
        {
            return;
        }
        let available = self.stream_ids.available(frame.dir);
        if let Some(cb) = self.callbacks.conn() {
            match frame.dir {
                Dir::Bi => cb.on_bidirectional_streams_available(available),
                Dir::Uni => cb.on_unidirectional_streams_available(available),
            }
        }
    }

    pub(super) fn on_expired_stream_data(&mut self, frame: ExpiredStreamDataFrame) -> Result<(), TransportError> {
        let sid = frame.stream_id;
        self.check_recv_half(sid, FrameType::ExpiredStreamData)?;
        self.accept_stream(sid, FrameType::ExpiredStreamData)?;
        let Some(stream) = self.recv.get_mut(&sid) else {
            return Ok(());
        };
        let offset = frame.minimum_stream_offset;
        if !stream.on_data_expired(offset) {
            return Ok(());
        }
        let readable = stream.is_readable();
        tracing::debug!(target: "quic", key = %self.key, %sid, offset, "peer expired stream data");
        if let Some(cb) = upgrade(&self.callbacks.data_expired) {
            cb.on_data_expired(sid, offset);
        }
        if readable {
            self.notify_readable(sid);
        }
        Ok(())
    }

    pub(super) fn on_min_stream_data(&mut self, frame: MinStreamDataFrame) -> Result<(), TransportError> {
        let sid = frame.stream_id;
        self.check_send_half(sid, FrameType::MinStreamData)?;
        self.accept_stream(sid, FrameType::MinStreamData)?;
        let Some(stream) = self.tx.streams.get_mut(&sid) else {
            return Ok(());
        };
        stream.increase_max_data(frame.maximum_data.into_inner());
        let Some(offset) = stream.on_rejected(frame.minimum_stream_offset) else {
            return Ok(());
        };
        self.cancel_events_below(sid, offset);
        tracing::debug!(target: "quic", key = %self.key, %sid, offset, "peer rejected stream data");
        if let Some(cb) = upgrade(&self.callbacks.data_rejected) {
            cb.on_data_rejected(sid, offset);
        }
        Ok(())
    }
}
