//! What the application hands the connection to be told about progress.
//!
//! Every callback is registered as a [`Weak`](std::sync::Weak) reference:
//! the connection never keeps the application alive, and a callback that
//! went away is simply skipped.

use bytes::Bytes;
use qbase::{error::QuicError, sid::StreamId, varint::VarInt};

use crate::loop_detector::{NoReadReason, NoWriteReason, WriteDataReason};

pub trait ReadCallback: Send + Sync {
    /// New contiguous bytes, or the end of the stream, can be read.
    fn read_available(&self, stream_id: StreamId);

    /// The stream cannot be read any more: reset by the peer or the
    /// connection failed.
    fn read_error(&self, stream_id: StreamId, error: &QuicError);
}

pub trait PeekCallback: Send + Sync {
    /// The buffered, not yet read, segments of the stream.
    fn on_data_available(&self, stream_id: StreamId, segments: &[(u64, Bytes)]);

    fn peek_error(&self, _stream_id: StreamId, _error: &QuicError) {}
}

pub trait WriteCallback: Send + Sync {
    /// `max_to_send` bytes can be buffered on the stream.
    fn on_stream_write_ready(&self, _stream_id: StreamId, _max_to_send: u64) {}

    /// `max_to_send` bytes can be sent on the connection.
    fn on_connection_write_ready(&self, _max_to_send: u64) {}

    fn on_stream_write_error(&self, _stream_id: StreamId, _error: &QuicError) {}

    fn on_connection_write_error(&self, _error: &QuicError) {}
}

/// Connection wide notifications. Only the interesting ones need an
/// implementation.
pub trait ConnectionCallback: Send + Sync {
    fn on_new_bidirectional_stream(&self, _stream_id: StreamId) {}

    fn on_new_unidirectional_stream(&self, _stream_id: StreamId) {}

    /// The peer asked to stop sending on the stream.
    fn on_stop_sending(&self, _stream_id: StreamId, _error_code: VarInt) {}

    /// The connection ended without error.
    fn on_connection_end(&self) {}

    fn on_connection_error(&self, _error: &QuicError) {}

    /// 1-RTT keys are available, streams can be used.
    fn on_transport_ready(&self) {}

    /// Data sent from now on cannot be replayed.
    fn on_replay_safe(&self) {}

    fn on_first_peer_packet_processed(&self) {}

    /// The peer raised the flow control limit of the stream.
    fn on_flow_control_update(&self, _stream_id: StreamId) {}

    fn on_bidirectional_streams_available(&self, _available: u64) {}

    fn on_unidirectional_streams_available(&self, _available: u64) {}

    /// The connection had room to send more than the application gave it.
    fn on_app_rate_limited(&self) {}
}

/// The peer expired data we had not read yet: bytes below `offset` will
/// never arrive.
pub trait DataExpiredCallback: Send + Sync {
    fn on_data_expired(&self, stream_id: StreamId, offset: u64);
}

/// The peer rejected data we sent: bytes below `offset` are not wanted.
pub trait DataRejectedCallback: Send + Sync {
    fn on_data_rejected(&self, stream_id: StreamId, offset: u64);
}

/// Alerts of a read or write loop that keeps spinning without progress.
pub trait LoopDetectorCallback: Send + Sync {
    fn on_suspicious_write_loops(
        &self,
        count: u64,
        data_reason: WriteDataReason,
        no_write_reason: NoWriteReason,
        context: &str,
    );

    fn on_suspicious_read_loops(&self, count: u64, no_read_reason: NoReadReason);
}
