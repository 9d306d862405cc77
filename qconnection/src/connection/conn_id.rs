use std::{collections::BTreeMap, sync::Weak};

use qbase::{
    cid::{ConnectionId, ConnectionIdData, ResetToken},
    error::{ErrorKind, QuicError, TransportError},
    frame::{FrameType, NewConnectionIdFrame, RetireConnectionIdFrame},
    sid::Role,
    varint::VarInt,
};
use qinterface::{CidGenerator, RouteError, RoutingCallback};

use super::{Connection, upgrade};

/// Fresh ids tried before a collision is deemed fatal.
const MAX_ISSUE_ATTEMPTS: usize = 8;

/// The ids this endpoint issued and the peer may address it with.
#[derive(Debug)]
pub(super) struct LocalCids {
    initial: ConnectionId,
    active: BTreeMap<u64, ConnectionIdData>,
    next_sequence: u64,
}

impl LocalCids {
    pub(super) fn new(initial: ConnectionId) -> Self {
        Self {
            initial,
            active: BTreeMap::from([(0, ConnectionIdData::new(initial, 0))]),
            next_sequence: 1,
        }
    }

    /// The id of the long header packets, sequence number 0.
    pub(super) fn initial(&self) -> ConnectionId {
        self.initial
    }

    pub(super) fn ids(&self) -> Vec<ConnectionIdData> {
        self.active.values().copied().collect()
    }

    fn contains(&self, cid: &ConnectionId) -> bool {
        self.active.values().any(|id| id.cid == *cid)
    }
}

/// The ids the peer issued, the lowest active one addresses its packets.
#[derive(Debug)]
pub(super) struct PeerCids {
    active: BTreeMap<u64, ConnectionIdData>,
    retire_prior_to: u64,
    // a client switches to the id the server chose, once
    adopted: bool,
}

impl PeerCids {
    pub(super) fn new(initial: ConnectionId) -> Self {
        Self {
            active: BTreeMap::from([(0, ConnectionIdData::new(initial, 0))]),
            retire_prior_to: 0,
            adopted: false,
        }
    }

    pub(super) fn current(&self) -> ConnectionId {
        self.active
            .first_key_value()
            .map(|(_, id)| id.cid)
            .unwrap_or_default()
    }

    fn adopt(&mut self, cid: ConnectionId) {
        if !self.adopted {
            self.adopted = true;
            self.active.insert(0, ConnectionIdData::new(cid, 0));
        }
    }

    /// Store an id from a NEW_CONNECTION_ID frame, returning the sequence
    /// numbers to retire.
    fn on_new(&mut self, frame: &NewConnectionIdFrame, limit: u64) -> Result<Vec<u64>, TransportError> {
        let sequence = frame.sequence.into_inner();
        let retire_prior_to = frame.retire_prior_to.into_inner();
        if retire_prior_to > sequence {
            return Err(TransportError::new(
                ErrorKind::FrameEncoding,
                Some(FrameType::NewConnectionId),
                "retire prior to exceeds the sequence number",
            ));
        }
        if sequence < self.retire_prior_to {
            return Ok(vec![sequence]);
        }
        if let Some(known) = self.active.get(&sequence) {
            if known.cid != frame.id {
                return Err(TransportError::new(
                    ErrorKind::ProtocolViolation,
                    Some(FrameType::NewConnectionId),
                    "sequence number reused for another id",
                ));
            }
            return Ok(vec![]);
        }
        self.active.insert(
            sequence,
            ConnectionIdData::new(frame.id, sequence).with_token(frame.reset_token),
        );

        let mut retired = Vec::new();
        if retire_prior_to > self.retire_prior_to {
            self.retire_prior_to = retire_prior_to;
            let kept = self.active.split_off(&retire_prior_to);
            retired = std::mem::replace(&mut self.active, kept).into_keys().collect();
        }
        if self.active.len() as u64 > limit {
            return Err(TransportError::new(
                ErrorKind::ConnectionIdLimit,
                Some(FrameType::NewConnectionId),
                format!("more than {limit} active connection ids"),
            ));
        }
        Ok(retired)
    }
}

impl Connection {
    pub fn set_cid_generator(&mut self, generator: CidGenerator) {
        self.cid_gen = Some(generator);
    }

    /// Hand the routing layer the ids already issued. The address of the
    /// connection must have been registered with it before.
    pub fn set_routing_callback(&mut self, routing: Weak<dyn RoutingCallback>) -> Result<(), RouteError> {
        self.routing = Some(routing);
        let Some(routing) = upgrade(&self.routing) else {
            return Ok(());
        };
        for id in self.local_cids.ids() {
            if let Err(error) = routing.on_connection_id_available(self.key, id) {
                tracing::warn!(target: "quic", key = %self.key, %error, "connection id not routable");
                self.close_now(Some(
                    TransportError::with_default_fty(ErrorKind::Internal, "connection id not routable").into(),
                ));
                return Err(error);
            }
        }
        Ok(())
    }

    /// Issue one more id to the peer, unless it already holds as many as it
    /// accepts. Ids taken by another connection are replaced by fresh ones;
    /// running out of attempts closes the connection.
    pub fn issue_connection_id(&mut self) -> Result<Option<ConnectionIdData>, RouteError> {
        let generator = self
            .cid_gen
            .ok_or(RouteError::InvalidConfig("no connection id generator"))?;
        if self.local_cids.active.len() as u64 >= self.settings.active_connection_id_limit() {
            return Ok(None);
        }
        let routing = upgrade(&self.routing);
        let sequence = self.local_cids.next_sequence;
        let mut last_error = None;
        for _ in 0..MAX_ISSUE_ATTEMPTS {
            let id = ConnectionIdData::new(generator.generate(), sequence)
                .with_token(ResetToken::random_gen());
            if let Some(routing) = &routing {
                match routing.on_connection_id_available(self.key, id) {
                    Ok(()) => {}
                    Err(error @ (RouteError::Collision(..) | RouteError::Retired(..))) => {
                        tracing::debug!(target: "quic", key = %self.key, %error, "connection id taken, retrying");
                        last_error = Some(error);
                        continue;
                    }
                    Err(error) => return Err(error),
                }
            }
            self.local_cids.next_sequence += 1;
            self.local_cids.active.insert(sequence, id);
            self.tx.control.push_back(
                NewConnectionIdFrame {
                    sequence: VarInt::saturating_from_u64(sequence),
                    retire_prior_to: VarInt::from_u32(0),
                    id: id.cid,
                    reset_token: id.token.unwrap_or_else(ResetToken::random_gen),
                }
                .into(),
            );
            tracing::debug!(target: "quic", key = %self.key, cid = %id.cid, sequence, "connection id issued");
            return Ok(Some(id));
        }
        let error = last_error.unwrap_or(RouteError::InvalidConfig("no attempt made"));
        self.close_now(Some(
            TransportError::with_default_fty(ErrorKind::Internal, "connection id collision").into(),
        ));
        Err(error)
    }

    /// Issue ids until the peer holds as many as it accepts.
    pub(super) fn replenish_connection_ids(&mut self) {
        if self.cid_gen.is_none() {
            return;
        }
        loop {
            match self.issue_connection_id() {
                Ok(Some(..)) => {}
                Ok(None) => break,
                Err(error) => {
                    tracing::warn!(target: "quic", key = %self.key, %error, "failed to issue connection id");
                    break;
                }
            }
        }
    }

    /// A packet addressed to `dcid` arrived; the first one using an issued
    /// id ends routing by address. The first flight of a client is
    /// addressed to an id it chose itself, which never matches.
    pub(super) fn on_dcid(&mut self, dcid: &ConnectionId) {
        if self.bound || !self.local_cids.contains(dcid) {
            return;
        }
        let Some(routing) = upgrade(&self.routing) else {
            return;
        };
        self.bound = true;
        if let Err(error) = routing.on_connection_id_bound(self.key) {
            tracing::warn!(target: "quic", key = %self.key, %error, "failed to bind connection id");
        }
    }

    pub(super) fn on_peer_scid(&mut self, scid: ConnectionId) {
        if self.role == Role::Client {
            self.peer_cids.adopt(scid);
        }
    }

    pub(super) fn on_new_connection_id(&mut self, frame: &NewConnectionIdFrame) -> Result<(), TransportError> {
        let limit = self.settings.active_connection_id_limit();
        for sequence in self.peer_cids.on_new(frame, limit)? {
            self.tx.control.push_back(
                RetireConnectionIdFrame {
                    sequence: VarInt::saturating_from_u64(sequence),
                }
                .into(),
            );
        }
        Ok(())
    }

    pub(super) fn on_retire_connection_id(
        &mut self,
        sequence: u64,
        dcid: &ConnectionId,
    ) -> Result<(), QuicError> {
        if sequence >= self.local_cids.next_sequence {
            return Err(TransportError::new(
                ErrorKind::ProtocolViolation,
                Some(FrameType::RetireConnectionId),
                format!("connection id {sequence} was never issued"),
            )
            .into());
        }
        let Some(id) = self.local_cids.active.get(&sequence).copied() else {
            return Ok(());
        };
        if id.cid == *dcid {
            return Err(TransportError::new(
                ErrorKind::ProtocolViolation,
                Some(FrameType::RetireConnectionId),
                "retiring the id the packet was sent to",
            )
            .into());
        }
        self.local_cids.active.remove(&sequence);
        tracing::debug!(target: "quic", key = %self.key, cid = %id.cid, sequence, "connection id retired");
        if let Some(routing) = upgrade(&self.routing) {
            if let Err(error) = routing.on_connection_id_retired(self.key, id.cid) {
                tracing::warn!(target: "quic", key = %self.key, %error, "failed to retire connection id");
            }
        }
        self.replenish_connection_ids();
        Ok(())
    }
}
