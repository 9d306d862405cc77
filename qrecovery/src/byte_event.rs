//! Callbacks keyed to byte offsets of a stream's send progress.
//!
//! Two frontiers are followed per stream: the highest offset of the
//! contiguously transmitted prefix and the highest offset of the
//! contiguously acknowledged prefix. An event registered at `offset` fires
//! once the frontier of its kind reaches it, or is canceled if the stream
//! goes away first. Either way it is delivered exactly once and forgotten.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Weak,
    time::Duration,
};

use qbase::{error::LocalError, sid::StreamId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ByteEventKind {
    /// The byte left in a packet for the first time.
    Tx,
    /// The byte was acknowledged by the peer.
    Ack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteEvent {
    pub stream_id: StreamId,
    pub offset: u64,
    pub kind: ByteEventKind,
    /// The smoothed RTT at the time an ACK event fired.
    pub srtt: Option<Duration>,
}

pub trait ByteEventCallback: Send + Sync {
    fn on_byte_event(&self, event: ByteEvent);

    fn on_byte_event_canceled(&self, event: ByteEvent);
}

/// Notified once a byte has been delivered to the peer.
pub trait DeliveryCallback: Send + Sync {
    fn on_delivery_ack(&self, stream_id: StreamId, offset: u64, srtt: Duration);

    fn on_canceled(&self, stream_id: StreamId, offset: u64);
}

/// Who is waiting for an event. Held weakly: a dropped subscriber turns the
/// event into a no-op, it is never an error.
#[derive(Clone)]
pub enum Subscriber {
    ByteEvent(Weak<dyn ByteEventCallback>),
    Delivery(Weak<dyn DeliveryCallback>),
}

impl Subscriber {
    fn fire(&self, event: ByteEvent) {
        match self {
            Subscriber::ByteEvent(cb) => {
                if let Some(cb) = cb.upgrade() {
                    cb.on_byte_event(event);
                }
            }
            Subscriber::Delivery(cb) => {
                if let Some(cb) = cb.upgrade() {
                    cb.on_delivery_ack(event.stream_id, event.offset, event.srtt.unwrap_or_default());
                }
            }
        }
    }

    fn cancel(&self, event: ByteEvent) {
        match self {
            Subscriber::ByteEvent(cb) => {
                if let Some(cb) = cb.upgrade() {
                    cb.on_byte_event_canceled(event);
                }
            }
            Subscriber::Delivery(cb) => {
                if let Some(cb) = cb.upgrade() {
                    cb.on_canceled(event.stream_id, event.offset);
                }
            }
        }
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Subscriber::ByteEvent(..) => f.write_str("ByteEvent"),
            Subscriber::Delivery(..) => f.write_str("Delivery"),
        }
    }
}

#[derive(Debug, Default)]
struct StreamEvents {
    frontiers: [Option<u64>; 2],
    pending: [BTreeMap<u64, Subscriber>; 2],
}

impl StreamEvents {
    fn is_empty(&self) -> bool {
        self.pending.iter().all(BTreeMap::is_empty)
    }
}

/// Pending byte events of every stream of one connection.
#[derive(Debug, Default)]
pub struct ByteEventTracker {
    streams: HashMap<StreamId, StreamEvents>,
    srtt: Option<Duration>,
}

impl ByteEventTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start following the frontiers of `sid`. Progress of a stream that
    /// was never opened, or was canceled or released, is ignored.
    pub fn open_stream(&mut self, sid: StreamId) {
        self.streams.entry(sid).or_default();
    }

    /// Register `callback` for the moment `offset` of `sid` reaches the
    /// frontier of `kind`. Fires right away if it already has.
    pub fn add_event(
        &mut self,
        sid: StreamId,
        offset: u64,
        kind: ByteEventKind,
        callback: Weak<dyn ByteEventCallback>,
    ) -> Result<(), LocalError> {
        self.register(sid, offset, kind, Subscriber::ByteEvent(callback))
    }

    /// Register a delivery callback, an ACK event in another shape.
    pub fn add_delivery_callback(
        &mut self,
        sid: StreamId,
        offset: u64,
        callback: Weak<dyn DeliveryCallback>,
    ) -> Result<(), LocalError> {
        self.register(sid, offset, ByteEventKind::Ack, Subscriber::Delivery(callback))
    }

    pub fn register(
        &mut self,
        sid: StreamId,
        offset: u64,
        kind: ByteEventKind,
        subscriber: Subscriber,
    ) -> Result<(), LocalError> {
        let events = self.streams.entry(sid).or_default();
        let pending = &mut events.pending[kind as usize];
        if pending.contains_key(&offset) {
            return Err(LocalError::DuplicateEvent);
        }
        if events.frontiers[kind as usize].is_some_and(|frontier| frontier >= offset) {
            tracing::trace!(target: "quic", %sid, offset, ?kind, "byte event already reached");
            subscriber.fire(ByteEvent {
                stream_id: sid,
                offset,
                kind,
                srtt: self.srtt.filter(|_| kind == ByteEventKind::Ack),
            });
            return Ok(());
        }
        pending.insert(offset, subscriber);
        Ok(())
    }

    /// The contiguously transmitted prefix of `sid` now ends at `frontier`,
    /// inclusive.
    pub fn on_bytes_sent(&mut self, sid: StreamId, frontier: u64) -> usize {
        self.advance(sid, ByteEventKind::Tx, frontier, None)
    }

    /// The contiguously acknowledged prefix of `sid` now ends at `frontier`,
    /// inclusive.
    pub fn on_bytes_acked(&mut self, sid: StreamId, frontier: u64, srtt: Duration) -> usize {
        self.srtt = Some(srtt);
        self.advance(sid, ByteEventKind::Ack, frontier, Some(srtt))
    }

    fn advance(
        &mut self,
        sid: StreamId,
        kind: ByteEventKind,
        frontier: u64,
        srtt: Option<Duration>,
    ) -> usize {
        let Some(events) = self.streams.get_mut(&sid) else {
            return 0;
        };
        let current = &mut events.frontiers[kind as usize];
        if current.is_some_and(|current| current >= frontier) {
            return 0;
        }
        *current = Some(frontier);

        let pending = &mut events.pending[kind as usize];
        let rest = match frontier.checked_add(1) {
            Some(bound) => pending.split_off(&bound),
            None => BTreeMap::new(),
        };
        let due = std::mem::replace(pending, rest);
        let fired = due.len();
        for (offset, subscriber) in due {
            subscriber.fire(ByteEvent {
                stream_id: sid,
                offset,
                kind,
                srtt,
            });
        }
        if fired > 0 {
            tracing::trace!(target: "quic", %sid, frontier, ?kind, fired, "byte events fired");
        }
        fired
    }

    /// Cancel the events of `kind` below `offset`, which can no longer be
    /// reached in order, as happens when the data is expired.
    pub fn cancel_below(&mut self, sid: StreamId, kind: ByteEventKind, offset: u64) -> usize {
        let Some(events) = self.streams.get_mut(&sid) else {
            return 0;
        };
        let pending = &mut events.pending[kind as usize];
        let rest = pending.split_off(&offset);
        let canceled = std::mem::replace(pending, rest);
        let count = canceled.len();
        for (offset, subscriber) in canceled {
            subscriber.cancel(ByteEvent {
                stream_id: sid,
                offset,
                kind,
                srtt: None,
            });
        }
        count
    }

    /// Cancel every pending event of `sid` and forget the stream.
    pub fn cancel_stream(&mut self, sid: StreamId) -> usize {
        let Some(events) = self.streams.remove(&sid) else {
            return 0;
        };
        let mut count = 0;
        for (kind, pending) in [ByteEventKind::Tx, ByteEventKind::Ack]
            .into_iter()
            .zip(events.pending)
        {
            for (offset, subscriber) in pending {
                count += 1;
                subscriber.cancel(ByteEvent {
                    stream_id: sid,
                    offset,
                    kind,
                    srtt: None,
                });
            }
        }
        if count > 0 {
            tracing::debug!(target: "quic", %sid, count, "byte events canceled");
        }
        count
    }

    /// The stream has been fully acknowledged. Events registered beyond its
    /// end can never fire and are canceled.
    pub fn release_stream(&mut self, sid: StreamId) -> usize {
        self.cancel_stream(sid)
    }

    /// Cancel everything, as on connection close.
    pub fn cancel_all(&mut self) -> usize {
        let sids: Vec<StreamId> = self.streams.keys().copied().collect();
        sids.into_iter().map(|sid| self.cancel_stream(sid)).sum()
    }

    pub fn pending_events(&self, sid: StreamId) -> usize {
        self.streams
            .get(&sid)
            .map_or(0, |events| events.pending.iter().map(BTreeMap::len).sum())
    }

    pub fn has_pending(&self, sid: StreamId) -> bool {
        self.streams.get(&sid).is_some_and(|events| !events.is_empty())
    }

    /// Streams currently holding state.
    pub fn tracked_streams(&self) -> usize {
        self.streams.len()
    }
}
