//! Connection id based routing of datagrams to the connections, and the
//! workers, of one server process.

use std::net::SocketAddr;

pub mod cid_gen;
pub mod router;

pub use cid_gen::CidGenerator;
pub use router::{
    ConnectionRouter, DropReason, Route, RouteDecision, RouteError, RouteState, RouterConfig,
    RouterConfigBuilder, RoutingCallback,
};

/// The index of a worker, which owns the connections routed to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, derive_more::Display)]
#[display("worker#{_0}")]
pub struct WorkerId(pub u16);

/// Names one connection instance of the process. Unlike connection ids, it
/// never changes and is never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
#[display("conn#{_0}")]
pub struct ConnKey(pub u64);

/// The pair of addresses a datagram travelled between, seen from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
#[display("{peer}->{local}")]
pub struct SourceIdentity {
    pub peer: SocketAddr,
    pub local: SocketAddr,
}

impl SourceIdentity {
    pub fn new(peer: SocketAddr, local: SocketAddr) -> Self {
        Self { peer, local }
    }
}
