use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, Weak},
    time::{Duration, Instant},
};

use qbase::{
    Epoch,
    cid::{ConnectionId, ResetToken},
    codec::{DecodedPacket, HandshakeKeys},
    error::{ApplicationError, ErrorKind, LocalError, QuicError},
    frame::{
        AckFrame, ConnectionCloseFrame, ExpiredStreamDataFrame, Frame, FrameType,
        MinStreamDataFrame, NewConnectionIdFrame, PathChallengeFrame, PingFrame,
        RetireConnectionIdFrame, StreamFrame,
    },
    sid::{Dir, Role, StreamId},
    varint::VarInt,
};
use qevent::{LossEvent, Observer, RttSample};
use qinterface::{
    CidGenerator, ConnKey, ConnectionRouter, DropReason, RouteDecision, RouteState, RouterConfig,
    RoutingCallback, SourceIdentity, WorkerId,
};
use qrecovery::byte_event::{ByteEvent, ByteEventCallback, DeliveryCallback};

use super::*;
use crate::{
    callback::{
        ConnectionCallback, DataExpiredCallback, DataRejectedCallback, LoopDetectorCallback,
        ReadCallback,
    },
    loop_detector::{NoReadReason, NoWriteReason, WriteDataReason},
    settings::TransportSettings,
    transport::CongestionController,
};

struct AllKeys;

impl HandshakeKeys for AllKeys {
    fn has_keys(&self, _: Epoch) -> bool {
        true
    }
}

/// Lets everything through, or nothing at all.
struct FixedWindow(usize);

impl CongestionController for FixedWindow {
    fn send_quota(&self, _: usize) -> usize {
        self.0
    }

    fn on_packet_sent(&mut self, _: Epoch, _: u64, _: usize, _: bool, _: Instant) {}

    fn on_packet_acked(&mut self, _: Epoch, _: u64, _: usize, _: Instant, _: Instant) {}

    fn on_packet_lost(&mut self, _: Epoch, _: u64, _: usize, _: Instant, _: Instant) {}

    fn cwnd(&self) -> u64 {
        self.0 as u64
    }
}

#[derive(Default)]
struct Recorder(Mutex<Vec<String>>);

impl Recorder {
    fn record(&self, event: String) {
        self.0.lock().unwrap().push(event);
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }

    fn count(&self, prefix: &str) -> usize {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.starts_with(prefix))
            .count()
    }
}

fn id(sid: StreamId) -> u64 {
    u64::from(sid)
}

impl ConnectionCallback for Recorder {
    fn on_new_bidirectional_stream(&self, stream_id: StreamId) {
        self.record(format!("new bidi {}", id(stream_id)));
    }

    fn on_new_unidirectional_stream(&self, stream_id: StreamId) {
        self.record(format!("new uni {}", id(stream_id)));
    }

    fn on_stop_sending(&self, stream_id: StreamId, error_code: VarInt) {
        self.record(format!("stop sending {} {error_code}", id(stream_id)));
    }

    fn on_connection_end(&self) {
        self.record("end".to_owned());
    }

    fn on_connection_error(&self, error: &QuicError) {
        self.record(format!("error {}", error.code()));
    }

    fn on_transport_ready(&self) {
        self.record("ready".to_owned());
    }

    fn on_app_rate_limited(&self) {
        self.record("app limited".to_owned());
    }

    fn on_bidirectional_streams_available(&self, available: u64) {
        self.record(format!("bidi available {available}"));
    }
}

impl ReadCallback for Recorder {
    fn read_available(&self, stream_id: StreamId) {
        self.record(format!("readable {}", id(stream_id)));
    }

    fn read_error(&self, stream_id: StreamId, error: &QuicError) {
        self.record(format!("read error {} {}", id(stream_id), error.code()));
    }
}

impl ByteEventCallback for Recorder {
    fn on_byte_event(&self, event: ByteEvent) {
        self.record(format!("{:?} {} {}", event.kind, id(event.stream_id), event.offset));
    }

    fn on_byte_event_canceled(&self, event: ByteEvent) {
        self.record(format!(
            "canceled {:?} {} {}",
            event.kind,
            id(event.stream_id),
            event.offset
        ));
    }
}

impl DeliveryCallback for Recorder {
    fn on_delivery_ack(&self, stream_id: StreamId, offset: u64, srtt: Duration) {
        self.record(format!("delivered {} {offset} {srtt:?}", id(stream_id)));
    }

    fn on_canceled(&self, stream_id: StreamId, offset: u64) {
        self.record(format!("delivery canceled {} {offset}", id(stream_id)));
    }
}

impl DataExpiredCallback for Recorder {
    fn on_data_expired(&self, stream_id: StreamId, offset: u64) {
        self.record(format!("expired {} {offset}", id(stream_id)));
    }
}

impl DataRejectedCallback for Recorder {
    fn on_data_rejected(&self, stream_id: StreamId, offset: u64) {
        self.record(format!("rejected {} {offset}", id(stream_id)));
    }
}

impl LoopDetectorCallback for Recorder {
    fn on_suspicious_write_loops(
        &self,
        count: u64,
        data_reason: WriteDataReason,
        no_write_reason: NoWriteReason,
        _context: &str,
    ) {
        self.record(format!("write loop {count} {data_reason} {no_write_reason}"));
    }

    fn on_suspicious_read_loops(&self, count: u64, no_read_reason: NoReadReason) {
        self.record(format!("read loop {count} {no_read_reason}"));
    }
}

impl Observer for Recorder {
    fn destroy(&self) {
        self.record("destroyed".to_owned());
    }

    fn close(&self, _error: Option<&QuicError>) {
        self.record("observer close".to_owned());
    }

    fn app_rate_limited(&self) {
        self.record("observer app limited".to_owned());
    }

    fn packet_loss_detected(&self, event: &LossEvent) {
        let lost: Vec<_> = event
            .lost_packets
            .iter()
            .map(|packet| (packet.packet_number, packet.lost_by_reorder_threshold))
            .collect();
        self.record(format!("loss {} {lost:?}", event.space));
    }

    fn rtt_sample_generated(&self, sample: &RttSample) {
        self.record(format!("rtt {} {:?}", sample.packet_number, sample.smoothed_rtt));
    }
}

const KEY: ConnKey = ConnKey(7);

fn cid(byte: u8) -> ConnectionId {
    ConnectionId::from_slice(&[byte; 8])
}

fn source() -> SourceIdentity {
    SourceIdentity::new(
        SocketAddr::from(([10, 0, 0, 1], 4433)),
        SocketAddr::from(([10, 0, 0, 2], 443)),
    )
}

fn endpoints(local_cid: ConnectionId) -> ConnectionEndpoints {
    ConnectionEndpoints {
        key: KEY,
        worker: WorkerId(0),
        local_cid,
        peer_cid: cid(2),
        source: Some(source()),
    }
}

fn client(settings: TransportSettings) -> Connection {
    Connection::connect(
        endpoints(cid(1)),
        settings,
        Box::new(AllKeys),
        Box::new(FixedWindow(usize::MAX)),
    )
}

fn server(local_cid: ConnectionId, settings: TransportSettings) -> Connection {
    Connection::accept(
        endpoints(local_cid),
        settings,
        Box::new(AllKeys),
        Box::new(FixedWindow(usize::MAX)),
    )
}

fn packet(pn: u64, dcid: ConnectionId, frames: Vec<Frame>) -> DecodedPacket {
    DecodedPacket {
        epoch: Epoch::Data,
        pn,
        dcid,
        scid: None,
        frames,
        size: 100,
    }
}

fn ack(largest: u64, first_range: u64) -> Frame {
    AckFrame {
        largest,
        delay: 0,
        first_range,
        ranges: vec![],
    }
    .into()
}

fn stream_bytes(packet: &Packet) -> usize {
    packet.stream_frames().map(|frame| frame.data.len()).sum()
}

#[test]
fn test_tx_event_fires_when_frontier_reached() {
    let recorder = Arc::new(Recorder::default());
    let mut conn = client(TransportSettings::default());
    conn.open_bidi_stream().unwrap();
    let sid = conn.open_bidi_stream().unwrap();
    assert_eq!(id(sid), 4);

    conn.write_chain(sid, &[0xab; 1000], true).unwrap();
    let callback: Weak<dyn ByteEventCallback> = Arc::<Recorder>::downgrade(&recorder);
    conn.register_tx_callback(sid, 999, callback).unwrap();

    let now = Instant::now();
    let first = conn.build_packet(Epoch::Data, 1200, 400, now).unwrap().unwrap();
    assert_eq!(stream_bytes(&first), 396);
    assert!(recorder.take().is_empty());

    let second = conn.build_packet(Epoch::Data, 1200, 400, now).unwrap().unwrap();
    assert_eq!(stream_bytes(&second), 394);
    assert!(recorder.take().is_empty());

    let third = conn.build_packet(Epoch::Data, 1200, 400, now).unwrap().unwrap();
    assert_eq!(stream_bytes(&third), 210);
    assert!(third.stream_frames().all(|frame| frame.fin));
    assert_eq!(recorder.take(), ["Tx 4 999"]);

    assert!(conn.build_packet(Epoch::Data, 1200, 400, now).unwrap().is_none());
    assert!(recorder.take().is_empty());
}

#[test]
fn test_event_registration_errors() {
    let recorder = Arc::new(Recorder::default());
    let mut conn = client(TransportSettings::default());
    let sid = conn.open_bidi_stream().unwrap();
    conn.write_chain(sid, &[0; 10], true).unwrap();

    let callback: Weak<dyn ByteEventCallback> = Arc::<Recorder>::downgrade(&recorder);
    assert!(matches!(
        conn.register_tx_callback(sid, 10, callback.clone()),
        Err(LocalError::InvalidOperation(..))
    ));
    conn.register_tx_callback(sid, 5, callback.clone()).unwrap();
    assert_eq!(
        conn.register_tx_callback(sid, 5, callback.clone()),
        Err(LocalError::DuplicateEvent)
    );
    let unknown = StreamId::new(Role::Client, Dir::Bi, 9);
    assert_eq!(
        conn.register_tx_callback(unknown, 0, callback),
        Err(LocalError::UnknownStream(unknown))
    );
}

#[test]
fn test_idle_writes_raise_one_alert() {
    let recorder = Arc::new(Recorder::default());
    let mut conn = client(TransportSettings::default());
    let callback: Weak<dyn LoopDetectorCallback> = Arc::<Recorder>::downgrade(&recorder);
    conn.set_loop_detector_callback(Some(callback));

    let now = Instant::now();
    for _ in 0..8 {
        assert!(conn.write_datagrams(now).unwrap().is_empty());
    }
    assert_eq!(recorder.take(), ["write loop 5 no_write empty_scheduler"]);
}

#[test]
fn test_congestion_limited_write_is_reported() {
    let recorder = Arc::new(Recorder::default());
    let settings = TransportSettings::builder()
        .loop_detector_threshold(1u64)
        .build()
        .unwrap();
    let mut conn = Connection::connect(
        endpoints(cid(1)),
        settings,
        Box::new(AllKeys),
        Box::new(FixedWindow(0)),
    );
    let callback: Weak<dyn LoopDetectorCallback> = Arc::<Recorder>::downgrade(&recorder);
    conn.set_loop_detector_callback(Some(callback));

    let sid = conn.open_uni_stream().unwrap();
    conn.write_chain(sid, b"blocked", false).unwrap();
    let built = conn
        .build_packet(Epoch::Data, 1200, 1200, Instant::now())
        .unwrap();
    assert!(built.is_none());
    assert_eq!(recorder.take(), ["write loop 1 stream congestion_limited"]);
}

#[test]
fn test_flow_blocked_write_is_reported() {
    let recorder = Arc::new(Recorder::default());
    let settings = TransportSettings::builder()
        .loop_detector_threshold(1u64)
        .initial_max_stream_data(10u64)
        .build()
        .unwrap();
    let mut conn = client(settings);
    let callback: Weak<dyn LoopDetectorCallback> = Arc::<Recorder>::downgrade(&recorder);
    conn.set_loop_detector_callback(Some(callback));

    let sid = conn.open_uni_stream().unwrap();
    conn.write_chain(sid, &[7; 100], false).unwrap();
    let now = Instant::now();
    let first = conn.build_packet(Epoch::Data, 1200, 1200, now).unwrap().unwrap();
    assert_eq!(stream_bytes(&first), 10);

    assert!(conn.build_packet(Epoch::Data, 1200, 1200, now).unwrap().is_none());
    assert_eq!(recorder.take(), ["write loop 1 stream flow_control_blocked"]);
}

#[test]
fn test_idle_open_stream_is_app_limited() {
    let recorder = Arc::new(Recorder::default());
    let settings = TransportSettings::builder()
        .loop_detector_threshold(1u64)
        .build()
        .unwrap();
    let mut conn = client(settings);
    let now = Instant::now();
    conn.recv_datagram(vec![packet(0, cid(1), vec![PingFrame.into()])], now)
        .unwrap();
    assert_eq!(conn.state(), ConnectionState::Established);
    let callback: Weak<dyn LoopDetectorCallback> = Arc::<Recorder>::downgrade(&recorder);
    conn.set_loop_detector_callback(Some(callback));

    conn.open_uni_stream().unwrap();
    while conn.build_packet(Epoch::Data, 1200, 1200, now).unwrap().is_some() {}
    assert_eq!(recorder.take(), ["write loop 1 no_write app_limited"]);
}

#[test]
fn test_socket_write_failures_raise_alert() {
    let recorder = Arc::new(Recorder::default());
    let settings = TransportSettings::builder()
        .loop_detector_threshold(2u64)
        .build()
        .unwrap();
    let mut conn = client(settings);
    let callback: Weak<dyn LoopDetectorCallback> = Arc::<Recorder>::downgrade(&recorder);
    conn.set_loop_detector_callback(Some(callback));

    conn.on_write_failure();
    assert!(recorder.take().is_empty());
    conn.on_write_failure();
    assert_eq!(recorder.take(), ["write loop 2 no_write socket_failure"]);
}

#[test]
fn test_path_response_is_padded() {
    let mut conn = client(TransportSettings::default());
    let now = Instant::now();
    let challenge = PathChallengeFrame { data: [9; 8] };
    conn.recv_datagram(vec![packet(0, cid(1), vec![challenge.into()])], now)
        .unwrap();

    let response = conn
        .build_packet(Epoch::Data, 1500, 1500, now)
        .unwrap()
        .unwrap();
    assert!(
        response
            .frames()
            .iter()
            .any(|frame| matches!(frame, Frame::PathResponse(r) if r.data == [9; 8]))
    );
    assert!(response.size() >= 1200);
    assert!(response.padding() > 0);
}

#[test]
fn test_empty_reads_raise_one_alert() {
    let recorder = Arc::new(Recorder::default());
    let settings = TransportSettings::builder()
        .loop_detector_threshold(3u64)
        .build()
        .unwrap();
    let mut conn = client(settings);
    let callback: Weak<dyn LoopDetectorCallback> = Arc::<Recorder>::downgrade(&recorder);
    conn.set_loop_detector_callback(Some(callback));

    let now = Instant::now();
    for _ in 0..4 {
        conn.recv_datagram(vec![], now).unwrap();
    }
    assert_eq!(recorder.take(), ["read loop 3 empty_data"]);

    // progress ends the streak
    conn.recv_datagram(vec![packet(0, cid(1), vec![PingFrame.into()])], now)
        .unwrap();
    for _ in 0..3 {
        conn.recv_datagram(vec![], now).unwrap();
    }
    assert_eq!(recorder.take(), ["read loop 3 empty_data"]);
}

#[test]
fn test_ack_samples_rtt_and_delivers() {
    let recorder = Arc::new(Recorder::default());
    let mut conn = client(TransportSettings::default());
    conn.observers().attach(recorder.clone()).unwrap();

    let sid = conn.open_bidi_stream().unwrap();
    conn.write_chain(sid, &[1; 100], false).unwrap();
    let callback: Weak<dyn DeliveryCallback> = Arc::<Recorder>::downgrade(&recorder);
    conn.register_delivery_callback(sid, 99, callback).unwrap();

    let sent_at = Instant::now();
    let built = conn.build_packet(Epoch::Data, 1200, 1200, sent_at).unwrap();
    assert_eq!(built.map(|packet| packet.pn()), Some(0));
    assert!(conn.bytes_in_flight() > 0);

    let acked_at = sent_at + Duration::from_millis(50);
    conn.recv_datagram(vec![packet(0, cid(1), vec![ack(0, 0)])], acked_at)
        .unwrap();
    assert_eq!(recorder.take(), ["rtt 0 50ms", "delivered 0 99 50ms"]);
    assert_eq!(conn.rtt().smoothed_rtt(), Duration::from_millis(50));
    assert_eq!(conn.bytes_in_flight(), 0);
    assert_eq!(conn.state(), ConnectionState::Established);
}

#[test]
fn test_reordered_ack_declares_loss() {
    let recorder = Arc::new(Recorder::default());
    let mut conn = client(TransportSettings::default());
    conn.observers().attach(recorder.clone()).unwrap();

    let sid = conn.open_bidi_stream().unwrap();
    conn.write_chain(sid, &[2; 1000], false).unwrap();
    let sent_at = Instant::now();
    for pn in 0..4 {
        let built = conn.build_packet(Epoch::Data, 1200, 200, sent_at).unwrap();
        assert_eq!(built.map(|packet| packet.pn()), Some(pn));
    }

    let acked_at = sent_at + Duration::from_millis(50);
    conn.recv_datagram(vec![packet(0, cid(1), vec![ack(3, 0)])], acked_at)
        .unwrap();
    assert_eq!(recorder.take(), ["rtt 3 50ms", "loss application [(0, true)]"]);
    // packets 1 and 2 are only lost once the loss delay expires
    assert!(conn.loss_timeout().is_some());

    let retransmit = conn
        .build_packet(Epoch::Data, 1200, 1200, acked_at)
        .unwrap()
        .unwrap();
    let first = retransmit.stream_frames().next().unwrap();
    assert_eq!(first.offset, 0);
    assert_eq!(first.data.len(), 196);
}

#[test]
fn test_pto_queues_ping() {
    let recorder = Arc::new(Recorder::default());
    let settings = TransportSettings::builder()
        .loop_detector_threshold(1u64)
        .build()
        .unwrap();
    let mut conn = client(settings);
    let callback: Weak<dyn LoopDetectorCallback> = Arc::<Recorder>::downgrade(&recorder);
    conn.set_loop_detector_callback(Some(callback));
    let sid = conn.open_bidi_stream().unwrap();
    conn.write_chain(sid, b"unacked", false).unwrap();
    let now = Instant::now();
    conn.build_packet(Epoch::Data, 1200, 1200, now).unwrap().unwrap();

    let deadline = conn.loss_timeout().unwrap();
    assert!(deadline > now);
    conn.on_loss_timeout(deadline);
    // no room for the ping yet
    assert!(conn.build_packet(Epoch::Data, 1200, 0, deadline).unwrap().is_none());
    assert_eq!(recorder.take(), ["write loop 1 probes no_frame"]);
    let ping = conn
        .build_packet(Epoch::Data, 1200, 1200, deadline)
        .unwrap()
        .unwrap();
    assert!(ping.frames().iter().any(|frame| matches!(frame, Frame::Ping(..))));
    // backed off
    assert!(conn.loss_timeout().unwrap() > deadline);
}

#[test]
fn test_write_datagrams_limits_packets_and_reports_app_limited() {
    let recorder = Arc::new(Recorder::default());
    let settings = TransportSettings::builder()
        .max_packets_per_write(2usize)
        .build()
        .unwrap();
    let mut conn = client(settings);
    conn.observers().attach(recorder.clone()).unwrap();
    let callback: Weak<dyn ConnectionCallback> = Arc::<Recorder>::downgrade(&recorder);
    conn.set_connection_callback(Some(callback));

    let sid = conn.open_uni_stream().unwrap();
    conn.write_chain(sid, &[3; 5000], true).unwrap();
    let now = Instant::now();

    let mut sizes = Vec::new();
    loop {
        let datagrams = conn.write_datagrams(now).unwrap();
        if datagrams.is_empty() {
            break;
        }
        assert!(datagrams.iter().all(|datagram| datagram.len() == 1));
        sizes.push(datagrams.len());
    }
    assert_eq!(sizes, [2, 2, 1]);
    assert_eq!(recorder.take(), ["observer app limited", "app limited"]);
}

#[test]
fn test_server_routing_lifecycle() {
    let recorder = Arc::new(Recorder::default());
    let router = Arc::new(ConnectionRouter::new(RouterConfig::default()));
    router.register_address(KEY, WorkerId(0), source()).unwrap();

    let generator = CidGenerator::new(WorkerId(0), 8).unwrap();
    let local_cid = generator.generate();
    let mut conn = server(local_cid, TransportSettings::default());
    conn.observers().attach(recorder.clone()).unwrap();
    conn.set_cid_generator(generator);
    let routing: Weak<dyn RoutingCallback> = Arc::<ConnectionRouter>::downgrade(&router);
    conn.set_routing_callback(routing).unwrap();
    assert_eq!(router.state(KEY), RouteState::CidAvailable);

    let now = Instant::now();
    conn.recv_datagram(vec![packet(0, local_cid, vec![PingFrame.into()])], now)
        .unwrap();
    assert_eq!(router.state(KEY), RouteState::CidBound);
    assert_eq!(conn.state(), ConnectionState::Established);
    // a second id was issued once established
    assert_eq!(conn.local_connection_ids().len(), 2);

    conn.close(Some(
        ApplicationError::new(VarInt::from_u32(3), "bye").into(),
    ));
    assert_eq!(conn.state(), ConnectionState::Closing);
    let close = conn.build_close_packet(1200, now).unwrap().unwrap();
    let frame = close
        .frames()
        .iter()
        .find_map(|frame| match frame {
            Frame::ConnectionClose(close) => Some(close.clone()),
            _ => None,
        })
        .unwrap();
    assert!(frame.is_application);
    assert_eq!(frame.error_code, VarInt::from_u32(3));

    let later = now + Duration::from_millis(1);
    let pings = (1..=5)
        .map(|pn| packet(pn, local_cid, vec![PingFrame.into()]))
        .collect();
    conn.recv_datagram(pings, later).unwrap();
    assert!(conn.build_close_packet(1200, later).unwrap().is_none());
    conn.recv_datagram(vec![packet(6, local_cid, vec![PingFrame.into()])], later)
        .unwrap();
    assert!(conn.build_close_packet(1200, later).unwrap().is_some());

    conn.on_drain_timeout();
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert!(conn.is_destroyed());
    assert_eq!(router.state(KEY), RouteState::Unbound);
    assert_eq!(
        router.route(&local_cid, &source(), true),
        RouteDecision::Drop(DropReason::RetiredConnectionId)
    );
    conn.on_drain_timeout();
    assert_eq!(recorder.count("destroyed"), 1);
    assert_eq!(recorder.count("observer close"), 1);
}

#[test]
fn test_dropped_connection_unbinds_and_destroys() {
    let recorder = Arc::new(Recorder::default());
    let router = Arc::new(ConnectionRouter::new(RouterConfig::default()));
    router.register_address(KEY, WorkerId(0), source()).unwrap();
    let local_cid = CidGenerator::new(WorkerId(0), 8).unwrap().generate();
    {
        let mut conn = server(local_cid, TransportSettings::default());
        conn.observers().attach(recorder.clone()).unwrap();
        let routing: Weak<dyn RoutingCallback> = Arc::<ConnectionRouter>::downgrade(&router);
        conn.set_routing_callback(routing).unwrap();
        assert_eq!(router.state(KEY), RouteState::CidAvailable);
        assert!(matches!(
            router.route(&local_cid, &source(), false),
            RouteDecision::Existing(..)
        ));
    }
    assert_eq!(recorder.count("destroyed"), 1);
    assert_eq!(router.state(KEY), RouteState::Unbound);
    assert_eq!(
        router.route(&local_cid, &source(), false),
        RouteDecision::Drop(DropReason::RetiredConnectionId)
    );
}

#[test]
fn test_unregistered_address_refuses_routing() {
    let router = Arc::new(ConnectionRouter::new(RouterConfig::default()));
    let mut conn = server(cid(1), TransportSettings::default());
    let routing: Weak<dyn RoutingCallback> = Arc::<ConnectionRouter>::downgrade(&router);
    assert!(conn.set_routing_callback(routing).is_err());
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert!(conn.is_destroyed());
}

#[test]
fn test_peer_close_drains() {
    let recorder = Arc::new(Recorder::default());
    let mut conn = client(TransportSettings::default());
    let callback: Weak<dyn ConnectionCallback> = Arc::<Recorder>::downgrade(&recorder);
    conn.set_connection_callback(Some(callback));
    conn.on_keys_changed();

    let close = ConnectionCloseFrame {
        error_code: VarInt::from_u32(0),
        frame_type: Some(FrameType::Padding),
        reason: String::new(),
        is_application: false,
    };
    let now = Instant::now();
    conn.recv_datagram(vec![packet(0, cid(1), vec![close.into()])], now)
        .unwrap();
    assert_eq!(conn.state(), ConnectionState::Draining);
    assert!(conn.error().is_none());
    assert_eq!(recorder.take(), ["ready", "end"]);
    assert_eq!(
        conn.build_packet(Epoch::Data, 1200, 1200, now).unwrap_err(),
        LocalError::ConnectionClosed
    );
    assert!(conn.loss_timeout().is_none());

    conn.on_drain_timeout();
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[test]
fn test_peer_application_close_is_an_error() {
    let recorder = Arc::new(Recorder::default());
    let mut conn = client(TransportSettings::default());
    let callback: Weak<dyn ConnectionCallback> = Arc::<Recorder>::downgrade(&recorder);
    conn.set_connection_callback(Some(callback));

    let close = ConnectionCloseFrame {
        error_code: VarInt::from_u32(42),
        frame_type: None,
        reason: "done".to_owned(),
        is_application: true,
    };
    conn.recv_datagram(vec![packet(0, cid(1), vec![close.into()])], Instant::now())
        .unwrap();
    assert_eq!(conn.error().map(QuicError::code), Some(VarInt::from_u32(42)));
    assert_eq!(recorder.take(), ["error 42"]);
}

#[test]
fn test_graceful_close_waits_for_acks() {
    let recorder = Arc::new(Recorder::default());
    let mut conn = client(TransportSettings::default());
    let callback: Weak<dyn ConnectionCallback> = Arc::<Recorder>::downgrade(&recorder);
    conn.set_connection_callback(Some(callback));
    conn.on_keys_changed();

    let sid = conn.open_bidi_stream().unwrap();
    conn.write_chain(sid, b"last words", false).unwrap();
    let now = Instant::now();
    conn.build_packet(Epoch::Data, 1200, 1200, now).unwrap().unwrap();

    conn.close(None);
    assert_eq!(conn.state(), ConnectionState::Established);
    assert_eq!(
        conn.write_chain(sid, b"more", false),
        Err(LocalError::ConnectionClosed)
    );
    assert_eq!(conn.open_bidi_stream(), Err(LocalError::ConnectionClosed));

    conn.recv_datagram(vec![packet(0, cid(1), vec![ack(0, 0)])], now)
        .unwrap();
    assert_eq!(conn.state(), ConnectionState::Closing);
    assert_eq!(recorder.take(), ["ready", "end"]);
    let close = conn.build_close_packet(1200, now).unwrap().unwrap();
    assert!(close.frames().iter().any(|frame| matches!(
        frame,
        Frame::ConnectionClose(close) if close.error_code == VarInt::from_u32(0)
    )));
}

#[test]
fn test_connection_ids_from_peer() {
    let mut conn = client(TransportSettings::default());
    let now = Instant::now();
    let new_id = |sequence: u32, retire_prior_to: u32, byte: u8| -> Frame {
        NewConnectionIdFrame {
            sequence: VarInt::from_u32(sequence),
            retire_prior_to: VarInt::from_u32(retire_prior_to),
            id: cid(byte),
            reset_token: ResetToken::random_gen(),
        }
        .into()
    };

    conn.recv_datagram(vec![packet(0, cid(1), vec![new_id(1, 0, 0x11)])], now)
        .unwrap();
    assert_eq!(conn.peer_cid(), cid(2));
    conn.recv_datagram(vec![packet(1, cid(1), vec![new_id(2, 2, 0x22)])], now)
        .unwrap();
    assert_eq!(conn.peer_cid(), cid(0x22));

    let built = conn
        .build_packet(Epoch::Data, 1200, 1200, now)
        .unwrap()
        .unwrap();
    let retired: Vec<_> = built
        .frames()
        .iter()
        .filter_map(|frame| match frame {
            Frame::RetireConnectionId(RetireConnectionIdFrame { sequence }) => {
                Some(sequence.into_inner())
            }
            _ => None,
        })
        .collect();
    assert_eq!(retired, [0, 1]);
}

#[test]
fn test_too_many_peer_connection_ids() {
    let mut conn = client(TransportSettings::default());
    let frames = (1..=2)
        .map(|sequence| {
            NewConnectionIdFrame {
                sequence: VarInt::from_u32(sequence),
                retire_prior_to: VarInt::from_u32(0),
                id: cid(0x30 + sequence as u8),
                reset_token: ResetToken::random_gen(),
            }
            .into()
        })
        .collect();
    let error = conn
        .recv_datagram(vec![packet(0, cid(1), frames)], Instant::now())
        .unwrap_err();
    assert_eq!(error.code(), VarInt::from(ErrorKind::ConnectionIdLimit));
    assert_eq!(conn.state(), ConnectionState::Closing);
}

#[test]
fn test_issue_and_retire_local_connection_ids() {
    let generator = CidGenerator::new(WorkerId(0), 8).unwrap();
    let local_cid = generator.generate();
    let mut conn = server(local_cid, TransportSettings::default());
    conn.set_cid_generator(generator);
    conn.on_keys_changed();
    let ids = conn.local_connection_ids();
    assert_eq!(ids.len(), 2);
    assert_eq!(conn.issue_connection_id(), Ok(None));

    let second = ids[1];
    let now = Instant::now();
    let retire = RetireConnectionIdFrame {
        sequence: VarInt::from_u32(0),
    };
    conn.recv_datagram(vec![packet(0, second.cid, vec![retire.into()])], now)
        .unwrap();
    let sequences: Vec<_> = conn
        .local_connection_ids()
        .iter()
        .map(|id| id.sequence)
        .collect();
    assert_eq!(sequences, [1, 2]);

    // retiring the id the packet is addressed to
    let retire = RetireConnectionIdFrame {
        sequence: VarInt::from_u32(1),
    };
    let error = conn
        .recv_datagram(vec![packet(1, second.cid, vec![retire.into()])], now)
        .unwrap_err();
    assert_eq!(error.code(), VarInt::from(ErrorKind::ProtocolViolation));
}

#[test]
fn test_retire_unissued_connection_id() {
    let mut conn = server(cid(1), TransportSettings::default());
    let retire = RetireConnectionIdFrame {
        sequence: VarInt::from_u32(99),
    };
    let error = conn
        .recv_datagram(vec![packet(0, cid(1), vec![retire.into()])], Instant::now())
        .unwrap_err();
    assert_eq!(error.code(), VarInt::from(ErrorKind::ProtocolViolation));
    assert_eq!(conn.state(), ConnectionState::Closing);
}

#[test]
fn test_partial_reliability() {
    let recorder = Arc::new(Recorder::default());
    let mut conn = client(TransportSettings::default());
    let expired: Weak<dyn DataExpiredCallback> = Arc::<Recorder>::downgrade(&recorder);
    conn.set_data_expired_callback(Some(expired));
    let rejected: Weak<dyn DataRejectedCallback> = Arc::<Recorder>::downgrade(&recorder);
    conn.set_data_rejected_callback(Some(rejected));

    let sid = conn.open_bidi_stream().unwrap();
    conn.write_chain(sid, &[4; 1000], false).unwrap();
    let callback: Weak<dyn ByteEventCallback> = Arc::<Recorder>::downgrade(&recorder);
    conn.register_tx_callback(sid, 100, callback.clone()).unwrap();
    conn.register_tx_callback(sid, 700, callback).unwrap();

    assert_eq!(conn.send_data_expired(sid, 500), Ok(Some(500)));
    assert_eq!(conn.send_data_expired(sid, 400), Ok(None));
    assert_eq!(recorder.take(), ["canceled Tx 0 100"]);

    let now = Instant::now();
    let built = conn
        .build_packet(Epoch::Data, 1200, 1200, now)
        .unwrap()
        .unwrap();
    assert!(matches!(
        built.frames().first(),
        Some(Frame::ExpiredStreamData(ExpiredStreamDataFrame {
            minimum_stream_offset: 500,
            ..
        }))
    ));
    let data = built.stream_frames().next().unwrap();
    assert_eq!(data.offset, 500);
    assert_eq!(data.data.len(), 500);
    assert_eq!(recorder.take(), ["Tx 0 700"]);

    let min = MinStreamDataFrame {
        stream_id: sid,
        maximum_data: VarInt::from_u32(1 << 20),
        minimum_stream_offset: 800,
    };
    let expired = ExpiredStreamDataFrame {
        stream_id: sid,
        minimum_stream_offset: 300,
    };
    conn.recv_datagram(
        vec![packet(0, cid(1), vec![min.into(), expired.into()])],
        now,
    )
    .unwrap();
    assert_eq!(recorder.take(), ["rejected 0 800", "expired 0 300"]);

    assert_eq!(conn.send_data_rejected(sid, 400), Ok(Some(400)));
    assert_eq!(conn.send_data_rejected(sid, 200), Ok(None));
    let built = conn
        .build_packet(Epoch::Data, 1200, 1200, now)
        .unwrap()
        .unwrap();
    assert!(built.frames().iter().any(|frame| matches!(
        frame,
        Frame::MinStreamData(MinStreamDataFrame {
            minimum_stream_offset: 400,
            ..
        })
    )));
}

#[test]
fn test_peer_opens_streams() {
    let recorder = Arc::new(Recorder::default());
    let mut conn = server(cid(1), TransportSettings::default());
    conn.on_keys_changed();
    let callback: Weak<dyn ConnectionCallback> = Arc::<Recorder>::downgrade(&recorder);
    conn.set_connection_callback(Some(callback));

    let sid = StreamId::new(Role::Client, Dir::Bi, 2);
    let frame = StreamFrame {
        stream_id: sid,
        offset: 0,
        data: bytes::Bytes::from_static(b"hello"),
        fin: true,
    };
    conn.recv_datagram(vec![packet(0, cid(1), vec![frame.into()])], Instant::now())
        .unwrap();
    assert_eq!(recorder.take(), ["new bidi 0", "new bidi 4", "new bidi 8"]);

    let callback: Weak<dyn ReadCallback> = Arc::<Recorder>::downgrade(&recorder);
    conn.set_read_callback(sid, Some(callback)).unwrap();
    assert_eq!(recorder.take(), ["readable 8"]);
    assert_eq!(conn.peek(sid).unwrap().len(), 1);

    let (data, fin) = conn.read(sid, 100).unwrap();
    assert_eq!(&data[..], b"hello");
    assert!(fin);
}

#[test]
fn test_peer_reset_reports_read_error() {
    let recorder = Arc::new(Recorder::default());
    let mut conn = server(cid(1), TransportSettings::default());
    let sid = StreamId::new(Role::Client, Dir::Uni, 0);
    let frame = StreamFrame {
        stream_id: sid,
        offset: 0,
        data: bytes::Bytes::from_static(b"partial"),
        fin: false,
    };
    let now = Instant::now();
    conn.recv_datagram(vec![packet(0, cid(1), vec![frame.into()])], now)
        .unwrap();
    let callback: Weak<dyn ReadCallback> = Arc::<Recorder>::downgrade(&recorder);
    conn.set_read_callback(sid, Some(callback)).unwrap();
    assert_eq!(recorder.take(), ["readable 2"]);

    let reset = qbase::frame::ResetStreamFrame {
        stream_id: sid,
        app_error_code: VarInt::from_u32(9),
        final_size: 7,
    };
    conn.recv_datagram(vec![packet(1, cid(1), vec![reset.into()])], now)
        .unwrap();
    assert_eq!(recorder.take(), ["read error 2 9"]);
    assert_eq!(conn.read(sid, 10), Err(LocalError::UnknownStream(sid)));
}

#[test]
fn test_stream_frame_on_send_only_stream() {
    let mut conn = client(TransportSettings::default());
    let sid = conn.open_uni_stream().unwrap();
    let frame = StreamFrame {
        stream_id: sid,
        offset: 0,
        data: bytes::Bytes::from_static(b"nope"),
        fin: false,
    };
    let error = conn
        .recv_datagram(vec![packet(0, cid(1), vec![frame.into()])], Instant::now())
        .unwrap_err();
    assert_eq!(error.code(), VarInt::from(ErrorKind::StreamState));
}

#[test]
fn test_connection_flow_control_violation() {
    let settings = TransportSettings::builder()
        .initial_max_data(100u64)
        .initial_max_stream_data(1000u64)
        .build()
        .unwrap();
    let mut conn = server(cid(1), settings);
    let frame = StreamFrame {
        stream_id: StreamId::new(Role::Client, Dir::Bi, 0),
        offset: 0,
        data: bytes::Bytes::from(vec![0; 200]),
        fin: false,
    };
    let now = Instant::now();
    let error = conn
        .recv_datagram(vec![packet(0, cid(1), vec![frame.into()])], now)
        .unwrap_err();
    assert!(matches!(
        &error,
        QuicError::Transport(error) if error.kind() == ErrorKind::FlowControl
    ));
    assert_eq!(conn.state(), ConnectionState::Closing);
    assert!(conn.build_close_packet(1200, now).unwrap().is_some());
}

#[test]
fn test_frame_outside_data_space() {
    let mut conn = server(cid(1), TransportSettings::default());
    let mut initial = packet(0, cid(1), vec![Frame::from(RetireConnectionIdFrame {
        sequence: VarInt::from_u32(0),
    })]);
    initial.epoch = Epoch::Initial;
    let error = conn
        .recv_datagram(vec![initial], Instant::now())
        .unwrap_err();
    assert_eq!(error.code(), VarInt::from(ErrorKind::ProtocolViolation));
}

#[test]
fn test_reset_cancels_events() {
    let recorder = Arc::new(Recorder::default());
    let mut conn = client(TransportSettings::default());
    let sid = conn.open_bidi_stream().unwrap();
    conn.write_chain(sid, &[5; 100], false).unwrap();
    let callback: Weak<dyn DeliveryCallback> = Arc::<Recorder>::downgrade(&recorder);
    conn.register_delivery_callback(sid, 50, callback).unwrap();

    conn.reset_stream(sid, VarInt::from_u32(1)).unwrap();
    assert_eq!(recorder.take(), ["delivery canceled 0 50"]);
    assert_eq!(
        conn.write_chain(sid, b"x", false),
        Err(LocalError::StreamClosed(sid))
    );
    let built = conn
        .build_packet(Epoch::Data, 1200, 1200, Instant::now())
        .unwrap()
        .unwrap();
    assert!(built
        .frames()
        .iter()
        .any(|frame| matches!(frame, Frame::ResetStream(..))));
    assert_eq!(built.stream_frames().count(), 0);
}
