use std::fmt;

use rand::Rng;

pub const MAX_CID_SIZE: usize = 20;
pub const RESET_TOKEN_SIZE: usize = 16;

/// An opaque connection identifier of at most [`MAX_CID_SIZE`] bytes.
///
/// Stored inline so that it is `Copy` and cheap to hash, which matters since
/// it is the key of the routing table.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Default, PartialOrd, Ord)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    /// Panics if `bytes` is longer than [`MAX_CID_SIZE`].
    pub fn from_slice(bytes: &[u8]) -> Self {
        assert!(bytes.len() <= MAX_CID_SIZE);
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        res
    }

    /// Generate a random connection ID of the given length.
    /// The cid maybe not unique, so it should be checked before use.
    pub fn random_gen(len: usize) -> Self {
        assert!(len <= MAX_CID_SIZE);
        let mut bytes = [0; MAX_CID_SIZE];
        rand::rng().fill(&mut bytes[..len]);
        Self {
            len: len as u8,
            bytes,
        }
    }

    /// The length-prefixed size of this id inside a frame.
    pub fn encoding_size(&self) -> usize {
        1 + self.len as usize
    }
}

impl std::ops::Deref for ConnectionId {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.bytes[0..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.iter() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// The stateless reset token announced together with a connection id.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct ResetToken([u8; RESET_TOKEN_SIZE]);

impl ResetToken {
    pub fn new(bytes: [u8; RESET_TOKEN_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn random_gen() -> Self {
        let mut bytes = [0; RESET_TOKEN_SIZE];
        rand::rng().fill(&mut bytes);
        Self(bytes)
    }
}

impl std::ops::Deref for ResetToken {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A connection id issued by one endpoint, with the sequence number it was
/// announced under and the token that travels with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionIdData {
    pub cid: ConnectionId,
    pub sequence: u64,
    pub token: Option<ResetToken>,
}

impl ConnectionIdData {
    pub fn new(cid: ConnectionId, sequence: u64) -> Self {
        Self {
            cid,
            sequence,
            token: None,
        }
    }

    pub fn with_token(mut self, token: ResetToken) -> Self {
        self.token = Some(token);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic]
    fn test_cid_from_large_slice() {
        ConnectionId::from_slice(&[0; MAX_CID_SIZE + 1]);
    }

    #[test]
    fn test_random_cid_len() {
        let cid = ConnectionId::random_gen(8);
        assert_eq!(cid.len(), 8);
        assert_eq!(cid.encoding_size(), 9);
        assert_eq!(ConnectionId::default().len(), 0);
    }

    #[test]
    fn test_display_is_hex() {
        let cid = ConnectionId::from_slice(&[0x01, 0xab, 0xff]);
        assert_eq!(cid.to_string(), "01abff");
    }
}
