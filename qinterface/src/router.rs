use std::{
    hash::{DefaultHasher, Hash, Hasher},
    time::{Duration, Instant},
};

use dashmap::{DashMap, mapref::entry::Entry};
use derive_builder::Builder;
use getset::CopyGetters;
use qbase::cid::{ConnectionId, ConnectionIdData, MAX_CID_SIZE};
use thiserror::Error;

use crate::{
    ConnKey, SourceIdentity, WorkerId,
    cid_gen::{self, MIN_TAGGED_CID_SIZE},
};

/// Where a connection is in its routing lifecycle. It only moves forward:
///
/// `Unrouted -> AddressRouted -> CidAvailable -> CidBound -> Unbound`
///
/// `Unbound` may be entered from any routed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteState {
    /// Not known to the router.
    Unrouted,
    /// Reachable by the addresses of its first datagram only.
    AddressRouted,
    /// Reachable by its addresses and by the ids it issued.
    CidAvailable,
    /// Reachable by its ids only.
    CidBound,
    /// Not reachable any more, its ids are denylisted.
    Unbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Route {
    pub conn: ConnKey,
    pub worker: WorkerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum DropReason {
    #[display("retired connection id")]
    RetiredConnectionId,
    #[display("unknown connection id")]
    UnknownConnectionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// Deliver to the connection currently owning the id or address.
    Existing(Route),
    /// Nobody owns it, and it may open a connection on the given worker.
    NewConnection(WorkerId),
    Drop(DropReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("connection id {0} is owned by another connection")]
    Collision(ConnectionId),
    #[error("connection id {0} was retired recently")]
    Retired(ConnectionId),
    #[error("source {0} is already routed to another connection")]
    AddressInUse(SourceIdentity),
    #[error("{conn} cannot handle {event} while {from:?}")]
    InvalidTransition {
        conn: ConnKey,
        from: RouteState,
        event: &'static str,
    },
    #[error("{0} is unknown to the router")]
    UnknownConnection(ConnKey),
    #[error("connection id length {0} cannot carry a worker tag")]
    InvalidCidLength(usize),
    #[error("invalid router config: {0}")]
    InvalidConfig(&'static str),
}

/// Notifications a connection gives the routing layer about the ids it
/// owns. They are the only way the routing table of a connection changes
/// after its address was registered.
pub trait RoutingCallback: Send + Sync {
    /// `id` was issued by the connection and should route to it from now on.
    fn on_connection_id_available(&self, conn: ConnKey, id: ConnectionIdData)
    -> Result<(), RouteError>;

    /// The peer started using an issued id, address routing is over.
    fn on_connection_id_bound(&self, conn: ConnKey) -> Result<(), RouteError>;

    /// The peer retired `cid` with a RETIRE_CONNECTION_ID frame.
    fn on_connection_id_retired(&self, conn: ConnKey, cid: ConnectionId)
    -> Result<(), RouteError>;

    /// The connection finished draining. Every id it owns, `ids` and those
    /// the router knows about, and its address route are retired at once.
    fn on_connection_unbound(
        &self,
        conn: ConnKey,
        source: SourceIdentity,
        ids: &[ConnectionIdData],
    ) -> Result<(), RouteError>;
}

#[derive(Builder, CopyGetters, Debug, Clone, PartialEq)]
#[builder(default, setter(into), build_fn(skip))]
pub struct RouterConfig {
    /// How long a retired id keeps being dropped instead of opening a new
    /// connection.
    #[getset(get_copy = "pub")]
    denylist_lifetime: Duration,
    /// Length of the ids issued by this server.
    #[getset(get_copy = "pub")]
    cid_len: usize,
    #[getset(get_copy = "pub")]
    worker_count: u16,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            denylist_lifetime: Duration::from_secs(3),
            cid_len: 8,
            worker_count: 1,
        }
    }
}

impl RouterConfig {
    pub fn builder() -> RouterConfigBuilder {
        RouterConfigBuilder::default()
    }
}

impl RouterConfigBuilder {
    pub fn build(&self) -> Result<RouterConfig, RouteError> {
        let default = RouterConfig::default();
        let config = RouterConfig {
            denylist_lifetime: self.denylist_lifetime.unwrap_or(default.denylist_lifetime),
            cid_len: self.cid_len.unwrap_or(default.cid_len),
            worker_count: self.worker_count.unwrap_or(default.worker_count),
        };
        if !(MIN_TAGGED_CID_SIZE..=MAX_CID_SIZE).contains(&config.cid_len) {
            return Err(RouteError::InvalidCidLength(config.cid_len));
        }
        if config.worker_count == 0 {
            return Err(RouteError::InvalidConfig("at least one worker is required"));
        }
        Ok(config)
    }
}

#[derive(Debug)]
struct ConnRoutes {
    state: RouteState,
    worker: WorkerId,
    source: SourceIdentity,
    cids: Vec<ConnectionId>,
    unbound_at: Option<Instant>,
}

impl ConnRoutes {
    fn route(&self, conn: ConnKey) -> Route {
        Route {
            conn,
            worker: self.worker,
        }
    }
}

/// The routing table shared by every worker of a server.
///
/// Lookups are lock free for readers of different shards; every
/// transition of one connection happens under the lock of its entry, so
/// a datagram racing a transition reaches either the current owner or
/// nobody.
#[derive(Debug, Default)]
pub struct ConnectionRouter {
    config: RouterConfig,
    cid_routes: DashMap<ConnectionId, Route>,
    addr_routes: DashMap<SourceIdentity, Route>,
    conns: DashMap<ConnKey, ConnRoutes>,
    // retired id -> end of its denial
    denylist: DashMap<ConnectionId, Instant>,
}

impl ConnectionRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn state(&self, conn: ConnKey) -> RouteState {
        self.conns
            .get(&conn)
            .map_or(RouteState::Unrouted, |routes| routes.state)
    }

    /// Number of connections not yet unbound.
    pub fn active_connections(&self) -> usize {
        self.conns
            .iter()
            .filter(|routes| routes.state != RouteState::Unbound)
            .count()
    }

    /// Route the first datagram of `conn`, and all the following ones until
    /// it binds an id, by the addresses it came from.
    pub fn register_address(
        &self,
        conn: ConnKey,
        worker: WorkerId,
        source: SourceIdentity,
    ) -> Result<(), RouteError> {
        let vacant = match self.conns.entry(conn) {
            Entry::Vacant(vacant) => vacant,
            Entry::Occupied(occupied) => {
                return Err(RouteError::InvalidTransition {
                    conn,
                    from: occupied.get().state,
                    event: "register_address",
                });
            }
        };
        match self.addr_routes.entry(source) {
            Entry::Occupied(_) => return Err(RouteError::AddressInUse(source)),
            Entry::Vacant(route) => {
                route.insert(Route { conn, worker });
            }
        }
        vacant.insert(ConnRoutes {
            state: RouteState::AddressRouted,
            worker,
            source,
            cids: Vec::new(),
            unbound_at: None,
        });
        tracing::debug!(target: "quic", %conn, %worker, %source, "address routed");
        Ok(())
    }

    pub fn route(
        &self,
        dcid: &ConnectionId,
        source: &SourceIdentity,
        may_create: bool,
    ) -> RouteDecision {
        self.route_at(dcid, source, may_create, Instant::now())
    }

    /// Decide who receives a datagram addressed to `dcid`, an empty id
    /// meaning the datagram carries none.
    ///
    /// `may_create` tells whether the datagram could open a connection, as
    /// a client Initial does.
    pub fn route_at(
        &self,
        dcid: &ConnectionId,
        source: &SourceIdentity,
        may_create: bool,
        now: Instant,
    ) -> RouteDecision {
        if !dcid.is_empty() {
            if let Some(route) = self.cid_routes.get(dcid) {
                return RouteDecision::Existing(*route);
            }
            if self.is_denied(dcid, now) {
                tracing::trace!(target: "quic", %dcid, "drop datagram for retired id");
                return RouteDecision::Drop(DropReason::RetiredConnectionId);
            }
        }
        if let Some(route) = self.addr_routes.get(source) {
            return RouteDecision::Existing(*route);
        }
        if may_create {
            return RouteDecision::NewConnection(self.pick_worker(source));
        }
        RouteDecision::Drop(DropReason::UnknownConnectionId)
    }

    /// The worker a new connection from `source` goes to.
    pub fn pick_worker(&self, source: &SourceIdentity) -> WorkerId {
        let mut hasher = DefaultHasher::new();
        source.hash(&mut hasher);
        WorkerId((hasher.finish() % self.config.worker_count.max(1) as u64) as u16)
    }

    /// The worker named by a tagged id, if the id is one of ours.
    pub fn worker_of(&self, cid: &ConnectionId) -> Option<WorkerId> {
        cid_gen::worker_of(cid, self.config.cid_len)
            .filter(|worker| worker.0 < self.config.worker_count)
    }

    fn is_denied(&self, cid: &ConnectionId, now: Instant) -> bool {
        let Some(until) = self.denylist.get(cid).map(|until| *until) else {
            return false;
        };
        if until > now {
            return true;
        }
        self.denylist.remove_if(cid, |_, until| *until <= now);
        false
    }

    fn deny(&self, cid: ConnectionId, now: Instant) {
        self.denylist
            .insert(cid, now + self.config.denylist_lifetime);
    }

    /// Forget denylisted ids and unbound connections whose denial is over.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let before = self.denylist.len();
        self.denylist.retain(|_, until| *until > now);
        let lifetime = self.config.denylist_lifetime;
        self.conns.retain(|_, routes| {
            routes
                .unbound_at
                .is_none_or(|unbound_at| unbound_at + lifetime > now)
        });
        before - self.denylist.len()
    }
}

impl RoutingCallback for ConnectionRouter {
    fn on_connection_id_available(
        &self,
        conn: ConnKey,
        id: ConnectionIdData,
    ) -> Result<(), RouteError> {
        let mut routes = self
            .conns
            .get_mut(&conn)
            .ok_or(RouteError::UnknownConnection(conn))?;
        match routes.state {
            RouteState::AddressRouted | RouteState::CidAvailable | RouteState::CidBound => {}
            from => {
                return Err(RouteError::InvalidTransition {
                    conn,
                    from,
                    event: "connection id available",
                });
            }
        }
        if self.is_denied(&id.cid, Instant::now()) {
            return Err(RouteError::Retired(id.cid));
        }
        match self.cid_routes.entry(id.cid) {
            Entry::Occupied(owner) if owner.get().conn != conn => {
                tracing::warn!(target: "quic", %conn, cid = %id.cid, owner = %owner.get().conn, "connection id collision");
                return Err(RouteError::Collision(id.cid));
            }
            Entry::Occupied(_) => return Ok(()),
            Entry::Vacant(vacant) => {
                vacant.insert(routes.route(conn));
            }
        }
        routes.cids.push(id.cid);
        if routes.state == RouteState::AddressRouted {
            routes.state = RouteState::CidAvailable;
        }
        tracing::debug!(target: "quic", %conn, cid = %id.cid, sequence = id.sequence, "connection id available");
        Ok(())
    }

    fn on_connection_id_bound(&self, conn: ConnKey) -> Result<(), RouteError> {
        let mut routes = self
            .conns
            .get_mut(&conn)
            .ok_or(RouteError::UnknownConnection(conn))?;
        match routes.state {
            RouteState::CidAvailable => {
                self.addr_routes
                    .remove_if(&routes.source, |_, route| route.conn == conn);
                routes.state = RouteState::CidBound;
                tracing::debug!(target: "quic", %conn, source = %routes.source, "connection id bound");
                Ok(())
            }
            RouteState::CidBound => Ok(()),
            from => Err(RouteError::InvalidTransition {
                conn,
                from,
                event: "connection id bound",
            }),
        }
    }

    fn on_connection_id_retired(&self, conn: ConnKey, cid: ConnectionId) -> Result<(), RouteError> {
        let mut routes = self
            .conns
            .get_mut(&conn)
            .ok_or(RouteError::UnknownConnection(conn))?;
        match routes.state {
            RouteState::CidAvailable | RouteState::CidBound => {}
            RouteState::Unbound => return Ok(()),
            from => {
                return Err(RouteError::InvalidTransition {
                    conn,
                    from,
                    event: "connection id retired",
                });
            }
        }
        let Some(idx) = routes.cids.iter().position(|owned| *owned == cid) else {
            return Ok(());
        };
        routes.cids.swap_remove(idx);
        // denied before unrouted, a racing lookup never sees it free
        self.deny(cid, Instant::now());
        self.cid_routes.remove_if(&cid, |_, route| route.conn == conn);
        tracing::debug!(target: "quic", %conn, %cid, "connection id retired");
        Ok(())
    }

    fn on_connection_unbound(
        &self,
        conn: ConnKey,
        source: SourceIdentity,
        ids: &[ConnectionIdData],
    ) -> Result<(), RouteError> {
        let mut routes = self
            .conns
            .get_mut(&conn)
            .ok_or(RouteError::UnknownConnection(conn))?;
        if routes.state == RouteState::Unbound {
            return Ok(());
        }
        let now = Instant::now();
        let mut retired = std::mem::take(&mut routes.cids);
        retired.extend(ids.iter().map(|id| id.cid));
        retired.sort_unstable();
        retired.dedup();
        for cid in &retired {
            let owned = self
                .cid_routes
                .get(cid)
                .is_some_and(|route| route.conn == conn);
            if owned {
                self.deny(*cid, now);
                self.cid_routes.remove_if(cid, |_, route| route.conn == conn);
            }
        }
        for source in [routes.source, source] {
            self.addr_routes.remove_if(&source, |_, route| route.conn == conn);
        }
        routes.state = RouteState::Unbound;
        routes.unbound_at = Some(now);
        tracing::debug!(target: "quic", %conn, retired = retired.len(), "connection unbound");
        Ok(())
    }
}
