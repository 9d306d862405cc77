//! The boundary to the collaborators that own the bytes on the wire.
//!
//! Header protection, packet protection and frame serialization live behind
//! these traits; the transport core only deals in [`Frame`]s and [`Packet`]s.

use bytes::BytesMut;

use crate::{
    Epoch,
    cid::ConnectionId,
    error::TransportError,
    frame::{CryptoFrame, Frame},
    packet::Packet,
};

/// One packet taken out of a datagram, already unprotected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPacket {
    pub epoch: Epoch,
    pub pn: u64,
    pub dcid: ConnectionId,
    /// Present in long header packets only.
    pub scid: Option<ConnectionId>,
    pub frames: Vec<Frame>,
    /// Bytes this packet occupied in the datagram.
    pub size: usize,
}

/// Frame and header encoding, implemented outside the transport core.
pub trait PacketCodec: Send + Sync {
    /// Read the destination connection id without removing protection, which
    /// is all the dispatcher needs to route the datagram.
    fn peek_dcid(&self, datagram: &[u8]) -> Option<ConnectionId>;

    /// Whether the datagram starts with a client Initial packet, the only
    /// kind that may open a connection.
    fn is_initial(&self, datagram: &[u8]) -> bool;

    /// Split a datagram into its coalesced packets.
    fn decode(&self, datagram: &[u8]) -> Result<Vec<DecodedPacket>, TransportError>;

    /// Serialize and protect a finalized packet into `buf`, returning the
    /// number of bytes appended.
    fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<usize, TransportError>;
}

/// The state of the cryptographic handshake as seen by the scheduler.
pub trait HandshakeKeys {
    /// Whether packets of `epoch` can be protected now.
    fn has_keys(&self, epoch: Epoch) -> bool;

    /// 1-RTT keys are confirmed and 0-RTT data can no longer be replayed.
    fn is_replay_safe(&self) -> bool {
        self.has_keys(Epoch::Data)
    }

    /// Handshake bytes received from the peer at `epoch`.
    fn on_crypto_frame(&mut self, _epoch: Epoch, _frame: &CryptoFrame) {}
}
