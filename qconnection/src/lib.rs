//! The per connection half of the transport: packet scheduling, stream
//! state, loss recovery, connection ids and the application callbacks of
//! one QUIC connection, driven by the worker that owns it.

pub mod callback;
pub mod connection;
pub mod loop_detector;
pub mod scheduler;
pub mod settings;
pub mod transport;

pub use connection::{Connection, ConnectionEndpoints, ConnectionState};
pub use settings::{InvalidSettings, TransportSettings, TransportSettingsBuilder};

pub mod prelude {
    pub use qbase::{
        Epoch,
        cid::{ConnectionId, ConnectionIdData},
        error::{ApplicationError, LocalError, QuicError, TransportError},
        sid::{Dir, StreamId},
        varint::VarInt,
    };
    pub use qevent::{ArcObservers, Observer};
    pub use qrecovery::byte_event::{ByteEvent, ByteEventCallback, ByteEventKind, DeliveryCallback};

    pub use crate::{
        Connection, ConnectionEndpoints, ConnectionState, TransportSettings,
        callback::{
            ConnectionCallback, DataExpiredCallback, DataRejectedCallback, LoopDetectorCallback,
            PeekCallback, ReadCallback, WriteCallback,
        },
        loop_detector::{NoReadReason, NoWriteReason, WriteDataReason},
        transport::{CongestionController, NewReno},
    };
}
