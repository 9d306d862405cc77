use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use bytes::Bytes;
use derive_builder::Builder;
use getset::CopyGetters;
use qbase::{cid::ConnectionId, codec::PacketCodec};
use qinterface::{
    ConnKey, ConnectionRouter, DropReason, Route, RouteDecision, RouteError, RoutingCallback,
    SourceIdentity, WorkerId,
};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Smallest datagram a client Initial may arrive in.
pub const MIN_INITIAL_SIZE: usize = 1200;

#[derive(Builder, CopyGetters, Debug, Clone, PartialEq, Eq)]
#[builder(default, setter(into), build_fn(skip))]
pub struct DispatcherConfig {
    /// Datagrams each worker queue holds before dispatching waits, or
    /// fails for [`Dispatcher::try_dispatch`].
    #[getset(get_copy = "pub")]
    queue_depth: usize,
    /// Initial datagrams shorter than this never open a connection.
    #[getset(get_copy = "pub")]
    min_initial_size: usize,
    /// Datagrams dispatched between two purges of the router's expired
    /// denials; zero leaves purging to the caller.
    #[getset(get_copy = "pub")]
    purge_every: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_depth: 1024,
            min_initial_size: MIN_INITIAL_SIZE,
            purge_every: 4096,
        }
    }
}

impl DispatcherConfig {
    pub fn builder() -> DispatcherConfigBuilder {
        DispatcherConfigBuilder::default()
    }
}

impl DispatcherConfigBuilder {
    pub fn build(&self) -> Result<DispatcherConfig, DispatchError> {
        let default = DispatcherConfig::default();
        let config = DispatcherConfig {
            queue_depth: self.queue_depth.unwrap_or(default.queue_depth),
            min_initial_size: self.min_initial_size.unwrap_or(default.min_initial_size),
            purge_every: self.purge_every.unwrap_or(default.purge_every),
        };
        if config.queue_depth == 0 {
            return Err(DispatchError::InvalidConfig("queue depth must not be zero"));
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("{0} stopped receiving datagrams")]
    WorkerGone(WorkerId),
    #[error("the queue of {0} is full")]
    QueueFull(WorkerId),
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error("invalid dispatcher config: {0}")]
    InvalidConfig(&'static str),
}

/// A datagram as read from a shared socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub source: SourceIdentity,
    pub payload: Bytes,
}

impl Datagram {
    pub fn new(source: SourceIdentity, payload: impl Into<Bytes>) -> Self {
        Self {
            source,
            payload: payload.into(),
        }
    }
}

/// What a worker finds in its queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// For a connection the worker hosts.
    Existing { conn: ConnKey, datagram: Datagram },
    /// Opens `conn`. Its address already routes to the worker, so the
    /// datagrams following this one reach it before it issues any id.
    New {
        conn: ConnKey,
        dcid: ConnectionId,
        datagram: Datagram,
    },
    /// Addressed to an id of the worker that no connection owns, a
    /// stateless reset may answer it.
    Unroutable { dcid: ConnectionId, datagram: Datagram },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropCause {
    /// The codec found no destination id.
    NoConnectionId,
    /// An Initial in a datagram too short to open a connection.
    ShortInitial(usize),
    Route(DropReason),
}

/// Where [`Dispatcher::dispatch`] sent a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    Existing(Route),
    New(Route),
    Unroutable(WorkerId),
    Dropped(DropCause),
}

/// The receiving end of one worker queue.
#[derive(Debug)]
pub struct WorkerQueue {
    worker: WorkerId,
    rx: mpsc::Receiver<Incoming>,
}

impl WorkerQueue {
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// The next datagram, `None` once the dispatcher is gone.
    pub async fn recv(&mut self) -> Option<Incoming> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Incoming> {
        self.rx.try_recv().ok()
    }
}

/// Hands every datagram received by the server to the worker owning its
/// connection.
///
/// Known ids and addresses are looked up in the shared router. Ids issued
/// by a worker name it, so even those the router forgot go back to it. New
/// connections go to the worker picked by hashing their addresses; the
/// dispatcher routes the address right away and names the connection.
pub struct Dispatcher {
    router: Arc<ConnectionRouter>,
    codec: Arc<dyn PacketCodec>,
    config: DispatcherConfig,
    workers: Vec<mpsc::Sender<Incoming>>,
    next_conn: AtomicU64,
    dropped: AtomicU64,
    seen: AtomicU64,
}

impl Dispatcher {
    /// A dispatcher with one queue per worker of the router.
    pub fn new(
        router: Arc<ConnectionRouter>,
        codec: Arc<dyn PacketCodec>,
        config: DispatcherConfig,
    ) -> (Self, Vec<WorkerQueue>) {
        let (workers, queues) = (0..router.config().worker_count())
            .map(|worker| {
                let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
                let queue = WorkerQueue {
                    worker: WorkerId(worker),
                    rx,
                };
                (tx, queue)
            })
            .unzip();
        let dispatcher = Self {
            router,
            codec,
            config,
            workers,
            next_conn: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            seen: AtomicU64::new(0),
        };
        (dispatcher, queues)
    }

    pub fn router(&self) -> &Arc<ConnectionRouter> {
        &self.router
    }

    /// Datagrams dropped so far, full queues included.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Forget the retired ids and unbound connections whose denial is
    /// over. Also done every [`DispatcherConfig::purge_every`] datagrams.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let purged = self.router.purge_expired(now);
        if purged > 0 {
            tracing::debug!(target: "quic", purged, "expired connection ids purged");
        }
        purged
    }

    fn count_datagram(&self) {
        let every = self.config.purge_every;
        if every == 0 {
            return;
        }
        if self.seen.fetch_add(1, Ordering::Relaxed) % every == every - 1 {
            self.purge_expired(Instant::now());
        }
    }

    /// Route `datagram` and wait for room in the queue of its worker.
    pub async fn dispatch(&self, datagram: Datagram) -> Result<Dispatched, DispatchError> {
        self.count_datagram();
        let (worker, dispatched, incoming) = match self.resolve(datagram)? {
            Ok(forward) => forward,
            Err(cause) => return Ok(self.drop_datagram(cause)),
        };
        let Some(tx) = self.workers.get(worker.0 as usize) else {
            return Err(DispatchError::WorkerGone(worker));
        };
        if let Err(mpsc::error::SendError(incoming)) = tx.send(incoming).await {
            self.abandon(&incoming);
            return Err(DispatchError::WorkerGone(worker));
        }
        Ok(dispatched)
    }

    /// Like [`Dispatcher::dispatch`], but a full queue drops the datagram.
    pub fn try_dispatch(&self, datagram: Datagram) -> Result<Dispatched, DispatchError> {
        self.count_datagram();
        let (worker, dispatched, incoming) = match self.resolve(datagram)? {
            Ok(forward) => forward,
            Err(cause) => return Ok(self.drop_datagram(cause)),
        };
        let Some(tx) = self.workers.get(worker.0 as usize) else {
            return Err(DispatchError::WorkerGone(worker));
        };
        match tx.try_send(incoming) {
            Ok(()) => Ok(dispatched),
            Err(TrySendError::Full(incoming)) => {
                self.abandon(&incoming);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(target: "quic", %worker, "worker queue full, datagram dropped");
                Err(DispatchError::QueueFull(worker))
            }
            Err(TrySendError::Closed(incoming)) => {
                self.abandon(&incoming);
                Err(DispatchError::WorkerGone(worker))
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn resolve(
        &self,
        datagram: Datagram,
    ) -> Result<Result<(WorkerId, Dispatched, Incoming), DropCause>, DispatchError> {
        let Some(dcid) = self.codec.peek_dcid(&datagram.payload) else {
            return Ok(Err(DropCause::NoConnectionId));
        };
        let is_initial = self.codec.is_initial(&datagram.payload);
        let may_create = is_initial && datagram.payload.len() >= self.config.min_initial_size;

        let mut decision = self.router.route(&dcid, &datagram.source, may_create);
        if let RouteDecision::NewConnection(worker) = decision {
            let conn = ConnKey(self.next_conn.fetch_add(1, Ordering::Relaxed));
            match self.router.register_address(conn, worker, datagram.source) {
                Ok(()) => {
                    tracing::debug!(target: "quic", %conn, %worker, source = %datagram.source, %dcid, "new connection");
                    let route = Route { conn, worker };
                    let incoming = Incoming::New {
                        conn,
                        dcid,
                        datagram,
                    };
                    return Ok(Ok((worker, Dispatched::New(route), incoming)));
                }
                // another datagram of the same client opened it first
                Err(RouteError::AddressInUse(..)) => {
                    decision = self.router.route(&dcid, &datagram.source, false);
                }
                Err(error) => return Err(error.into()),
            }
        }

        match decision {
            RouteDecision::Existing(route) => {
                let incoming = Incoming::Existing {
                    conn: route.conn,
                    datagram,
                };
                Ok(Ok((route.worker, Dispatched::Existing(route), incoming)))
            }
            RouteDecision::Drop(DropReason::UnknownConnectionId) if !is_initial => {
                match self.router.worker_of(&dcid) {
                    Some(worker) => {
                        tracing::trace!(target: "quic", %worker, %dcid, "id of no connection");
                        let incoming = Incoming::Unroutable { dcid, datagram };
                        Ok(Ok((worker, Dispatched::Unroutable(worker), incoming)))
                    }
                    None => Ok(Err(DropCause::Route(DropReason::UnknownConnectionId))),
                }
            }
            RouteDecision::Drop(DropReason::UnknownConnectionId) if is_initial && !may_create => {
                tracing::trace!(target: "quic", %dcid, size = datagram.payload.len(), "initial too short");
                Ok(Err(DropCause::ShortInitial(datagram.payload.len())))
            }
            RouteDecision::Drop(reason) => Ok(Err(DropCause::Route(reason))),
            RouteDecision::NewConnection(..) => {
                Ok(Err(DropCause::Route(DropReason::UnknownConnectionId)))
            }
        }
    }

    fn drop_datagram(&self, cause: DropCause) -> Dispatched {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(target: "quic", ?cause, "datagram dropped");
        Dispatched::Dropped(cause)
    }

    /// A connection opened for a datagram its worker never got is unbound
    /// again, the next Initial of the client tries anew.
    fn abandon(&self, incoming: &Incoming) {
        let Incoming::New { conn, datagram, .. } = incoming else {
            return;
        };
        if let Err(error) = self
            .router
            .on_connection_unbound(*conn, datagram.source, &[])
        {
            tracing::warn!(target: "quic", %conn, %error, "failed to unbind abandoned connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, time::Duration};

    use bytes::BytesMut;
    use qbase::{
        cid::ConnectionIdData,
        codec::DecodedPacket,
        error::TransportError,
        packet::Packet,
    };
    use qinterface::{CidGenerator, RouteState, RouterConfig};

    use super::*;

    /// Datagrams of the form `[kind, dcid len, dcid.., padding..]`, kind 1
    /// being an Initial.
    struct TestCodec;

    impl PacketCodec for TestCodec {
        fn peek_dcid(&self, datagram: &[u8]) -> Option<ConnectionId> {
            let len = *datagram.get(1)? as usize;
            datagram.get(2..2 + len).map(ConnectionId::from_slice)
        }

        fn is_initial(&self, datagram: &[u8]) -> bool {
            datagram.first() == Some(&1)
        }

        fn decode(&self, _datagram: &[u8]) -> Result<Vec<DecodedPacket>, TransportError> {
            Ok(vec![])
        }

        fn encode(&self, _packet: &Packet, _buf: &mut BytesMut) -> Result<usize, TransportError> {
            Ok(0)
        }
    }

    fn datagram(kind: u8, dcid: &ConnectionId, size: usize, port: u16) -> Datagram {
        let mut payload = vec![kind, dcid.len() as u8];
        payload.extend_from_slice(dcid);
        payload.resize(size.max(payload.len()), 0);
        Datagram::new(source(port), payload)
    }

    fn initial(dcid: &ConnectionId, port: u16) -> Datagram {
        datagram(1, dcid, MIN_INITIAL_SIZE, port)
    }

    fn short(dcid: &ConnectionId, port: u16) -> Datagram {
        datagram(0, dcid, 64, port)
    }

    fn source(port: u16) -> SourceIdentity {
        SourceIdentity::new(
            SocketAddr::from(([192, 0, 2, 1], port)),
            SocketAddr::from(([192, 0, 2, 100], 443)),
        )
    }

    fn dispatcher(config: DispatcherConfig) -> (Dispatcher, Vec<WorkerQueue>) {
        let router = ConnectionRouter::new(
            RouterConfig::builder().worker_count(4u16).build().unwrap(),
        );
        Dispatcher::new(Arc::new(router), Arc::new(TestCodec), config)
    }

    #[tokio::test]
    async fn test_new_connection_follows_its_address() {
        let (dispatcher, mut queues) = dispatcher(DispatcherConfig::default());
        let client_dcid = ConnectionId::from_slice(&[0xcc; 8]);
        let expected = dispatcher.router().pick_worker(&source(5000));

        let dispatched = dispatcher.dispatch(initial(&client_dcid, 5000)).await.unwrap();
        let Dispatched::New(route) = dispatched else {
            panic!("unexpected {dispatched:?}");
        };
        assert_eq!(route.worker, expected);
        assert_eq!(dispatcher.router().state(route.conn), RouteState::AddressRouted);
        let queue = &mut queues[expected.0 as usize];
        assert!(matches!(
            queue.recv().await,
            Some(Incoming::New { conn, dcid, .. }) if conn == route.conn && dcid == client_dcid
        ));

        // the client keeps its own id until it learns ours
        let dispatched = dispatcher.dispatch(initial(&client_dcid, 5000)).await.unwrap();
        assert_eq!(dispatched, Dispatched::Existing(route));
        assert!(matches!(
            queue.recv().await,
            Some(Incoming::Existing { conn, .. }) if conn == route.conn
        ));
        assert_eq!(dispatcher.router().active_connections(), 1);
    }

    #[tokio::test]
    async fn test_issued_id_routes_to_its_worker() {
        let (dispatcher, mut queues) = dispatcher(DispatcherConfig::default());
        let router = dispatcher.router().clone();
        let conn = ConnKey(100);
        let cid = CidGenerator::new(WorkerId(2), 8).unwrap().generate();
        router.register_address(conn, WorkerId(2), source(5000)).unwrap();
        router
            .on_connection_id_available(conn, ConnectionIdData::new(cid, 1))
            .unwrap();
        router.on_connection_id_bound(conn).unwrap();

        // a migrated client is still found by the id
        let dispatched = dispatcher.dispatch(short(&cid, 6000)).await.unwrap();
        assert_eq!(
            dispatched,
            Dispatched::Existing(Route {
                conn,
                worker: WorkerId(2)
            })
        );
        assert!(matches!(
            queues[2].try_recv(),
            Some(Incoming::Existing { conn: c, .. }) if c == conn
        ));

        router
            .on_connection_unbound(conn, source(5000), &[ConnectionIdData::new(cid, 1)])
            .unwrap();
        let dispatched = dispatcher.dispatch(short(&cid, 6000)).await.unwrap();
        assert_eq!(
            dispatched,
            Dispatched::Dropped(DropCause::Route(DropReason::RetiredConnectionId))
        );
        // a retired id stays retired, whatever the size of the datagram
        let dispatched = dispatcher
            .dispatch(datagram(1, &cid, 300, 6000))
            .await
            .unwrap();
        assert_eq!(
            dispatched,
            Dispatched::Dropped(DropCause::Route(DropReason::RetiredConnectionId))
        );
        assert_eq!(dispatcher.dropped(), 2);
        assert!(queues.iter_mut().all(|queue| queue.try_recv().is_none()));
    }

    #[tokio::test]
    async fn test_unknown_tagged_id_goes_to_its_worker() {
        let (dispatcher, mut queues) = dispatcher(DispatcherConfig::default());
        let cid = CidGenerator::new(WorkerId(3), 8).unwrap().generate();

        let dispatched = dispatcher.dispatch(short(&cid, 5000)).await.unwrap();
        assert_eq!(dispatched, Dispatched::Unroutable(WorkerId(3)));
        assert!(matches!(
            queues[3].try_recv(),
            Some(Incoming::Unroutable { dcid, .. }) if dcid == cid
        ));

        let random = ConnectionId::from_slice(&[0x11; 5]);
        let dispatched = dispatcher.dispatch(short(&random, 5000)).await.unwrap();
        assert_eq!(
            dispatched,
            Dispatched::Dropped(DropCause::Route(DropReason::UnknownConnectionId))
        );
    }

    #[tokio::test]
    async fn test_short_initial_and_garbage_are_dropped() {
        let (dispatcher, mut queues) = dispatcher(DispatcherConfig::default());
        let dcid = ConnectionId::from_slice(&[0xcc; 8]);

        let dispatched = dispatcher.dispatch(datagram(1, &dcid, 300, 5000)).await.unwrap();
        assert_eq!(dispatched, Dispatched::Dropped(DropCause::ShortInitial(300)));
        let dispatched = dispatcher
            .dispatch(Datagram::new(source(5000), vec![1]))
            .await
            .unwrap();
        assert_eq!(dispatched, Dispatched::Dropped(DropCause::NoConnectionId));

        assert_eq!(dispatcher.dropped(), 2);
        assert_eq!(dispatcher.router().active_connections(), 0);
        assert!(queues.iter_mut().all(|queue| queue.try_recv().is_none()));
    }

    #[tokio::test]
    async fn test_full_queue_drops_and_abandons() {
        let config = DispatcherConfig::builder().queue_depth(1usize).build().unwrap();
        let (dispatcher, _queues) = dispatcher(config);
        let dcid = ConnectionId::from_slice(&[0xcc; 8]);

        let Ok(Dispatched::New(route)) = dispatcher.try_dispatch(initial(&dcid, 5000)) else {
            panic!("first initial should open a connection");
        };
        // same worker, same queue
        let port = (5001..)
            .find(|port| dispatcher.router().pick_worker(&source(*port)) == route.worker)
            .unwrap();
        assert_eq!(
            dispatcher.try_dispatch(initial(&dcid, port)),
            Err(DispatchError::QueueFull(route.worker))
        );
        assert_eq!(dispatcher.dropped(), 1);
        assert_eq!(dispatcher.router().active_connections(), 1);
        assert_eq!(dispatcher.router().state(route.conn), RouteState::AddressRouted);
    }

    #[tokio::test]
    async fn test_stopped_worker() {
        let (dispatcher, mut queues) = dispatcher(DispatcherConfig::default());
        let worker = dispatcher.router().pick_worker(&source(5000));
        queues.remove(worker.0 as usize);
        let dcid = ConnectionId::from_slice(&[0xcc; 8]);

        assert_eq!(
            dispatcher.dispatch(initial(&dcid, 5000)).await,
            Err(DispatchError::WorkerGone(worker))
        );
        assert_eq!(dispatcher.router().state(ConnKey(0)), RouteState::Unbound);
        assert_eq!(dispatcher.router().active_connections(), 0);
    }

    #[tokio::test]
    async fn test_expired_denials_are_purged_periodically() {
        let router = ConnectionRouter::new(
            RouterConfig::builder()
                .worker_count(4u16)
                .denylist_lifetime(Duration::ZERO)
                .build()
                .unwrap(),
        );
        let config = DispatcherConfig::builder().purge_every(2u64).build().unwrap();
        let (dispatcher, _queues) = Dispatcher::new(Arc::new(router), Arc::new(TestCodec), config);
        let router = dispatcher.router().clone();
        let conn = ConnKey(7);
        let cid = CidGenerator::new(WorkerId(1), 8).unwrap().generate();
        router.register_address(conn, WorkerId(1), source(5000)).unwrap();
        router
            .on_connection_id_available(conn, ConnectionIdData::new(cid, 0))
            .unwrap();
        router
            .on_connection_unbound(conn, source(5000), &[ConnectionIdData::new(cid, 0)])
            .unwrap();
        assert_eq!(router.state(conn), RouteState::Unbound);
        std::thread::sleep(Duration::from_millis(2));

        let garbage = || Datagram::new(source(6000), vec![0]);
        dispatcher.dispatch(garbage()).await.unwrap();
        assert_eq!(router.state(conn), RouteState::Unbound);
        dispatcher.dispatch(garbage()).await.unwrap();
        assert_eq!(router.state(conn), RouteState::Unrouted);
    }

    #[test]
    fn test_purge_on_demand() {
        let (dispatcher, _queues) = dispatcher(DispatcherConfig::default());
        let router = dispatcher.router().clone();
        let cid = CidGenerator::new(WorkerId(0), 8).unwrap().generate();
        router.register_address(ConnKey(1), WorkerId(0), source(5000)).unwrap();
        router
            .on_connection_id_available(ConnKey(1), ConnectionIdData::new(cid, 0))
            .unwrap();
        router
            .on_connection_unbound(ConnKey(1), source(5000), &[ConnectionIdData::new(cid, 0)])
            .unwrap();

        assert_eq!(dispatcher.purge_expired(Instant::now()), 0);
        let later = Instant::now() + router.config().denylist_lifetime() + Duration::from_secs(1);
        assert_eq!(dispatcher.purge_expired(later), 1);
        assert_eq!(router.state(ConnKey(1)), RouteState::Unrouted);
    }

    #[test]
    fn test_config() {
        assert_eq!(
            DispatcherConfig::builder().queue_depth(0usize).build(),
            Err(DispatchError::InvalidConfig("queue depth must not be zero"))
        );
        let config = DispatcherConfig::builder()
            .min_initial_size(1350usize)
            .build()
            .unwrap();
        assert_eq!(config.queue_depth(), 1024);
        assert_eq!(config.min_initial_size(), 1350);
        assert_eq!(config.purge_every(), 4096);
    }
}
