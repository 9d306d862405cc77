//! A server side multiplexer of QUIC connections.
//!
//! One process shares its UDP sockets between many connections, spread
//! over several workers. The [`Dispatcher`] reads the destination
//! connection id of every datagram, asks the shared
//! [`ConnectionRouter`](qinterface::ConnectionRouter) who owns it, and
//! forwards the datagram to the queue of that worker. Each worker then
//! drives the connections it hosts without any locking.

pub mod dispatcher;

pub use dispatcher::{
    Datagram, DispatchError, Dispatched, Dispatcher, DispatcherConfig, DispatcherConfigBuilder,
    DropCause, Incoming, MIN_INITIAL_SIZE, WorkerQueue,
};
pub use qinterface::{
    CidGenerator, ConnKey, ConnectionRouter, RouterConfig, RouterConfigBuilder, SourceIdentity,
    WorkerId,
};
