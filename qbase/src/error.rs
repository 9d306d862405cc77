use std::borrow::Cow;

use thiserror::Error;

use crate::{frame::FrameType, sid::StreamId, varint::VarInt};

/// Transport error codes.
///
/// See [section-20.1](https://www.rfc-editor.org/rfc/rfc9000.html#section-20.1)
/// of [QUIC](https://www.rfc-editor.org/rfc/rfc9000.html).
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorKind {
    None,
    Internal,
    ConnectionRefused,
    FlowControl,
    StreamLimit,
    StreamState,
    FinalSize,
    FrameEncoding,
    TransportParameter,
    ConnectionIdLimit,
    ProtocolViolation,
    InvalidToken,
    Application,
    CryptoBufferExceeded,
    KeyUpdate,
    AeadLimitReached,
    NoViablePath,
    Crypto(u8),
}

impl From<ErrorKind> for VarInt {
    fn from(value: ErrorKind) -> Self {
        match value {
            ErrorKind::None => VarInt::from_u32(0x00),
            ErrorKind::Internal => VarInt::from_u32(0x01),
            ErrorKind::ConnectionRefused => VarInt::from_u32(0x02),
            ErrorKind::FlowControl => VarInt::from_u32(0x03),
            ErrorKind::StreamLimit => VarInt::from_u32(0x04),
            ErrorKind::StreamState => VarInt::from_u32(0x05),
            ErrorKind::FinalSize => VarInt::from_u32(0x06),
            ErrorKind::FrameEncoding => VarInt::from_u32(0x07),
            ErrorKind::TransportParameter => VarInt::from_u32(0x08),
            ErrorKind::ConnectionIdLimit => VarInt::from_u32(0x09),
            ErrorKind::ProtocolViolation => VarInt::from_u32(0x0a),
            ErrorKind::InvalidToken => VarInt::from_u32(0x0b),
            ErrorKind::Application => VarInt::from_u32(0x0c),
            ErrorKind::CryptoBufferExceeded => VarInt::from_u32(0x0d),
            ErrorKind::KeyUpdate => VarInt::from_u32(0x0e),
            ErrorKind::AeadLimitReached => VarInt::from_u32(0x0f),
            ErrorKind::NoViablePath => VarInt::from_u32(0x10),
            ErrorKind::Crypto(x) => VarInt::from_u32(0x0100 + x as u32),
        }
    }
}

impl ErrorKind {
    /// The kind carried by a transport CONNECTION_CLOSE, if the code is known.
    pub fn from_code(code: VarInt) -> Option<Self> {
        Some(match code.into_inner() {
            0x00 => ErrorKind::None,
            0x01 => ErrorKind::Internal,
            0x02 => ErrorKind::ConnectionRefused,
            0x03 => ErrorKind::FlowControl,
            0x04 => ErrorKind::StreamLimit,
            0x05 => ErrorKind::StreamState,
            0x06 => ErrorKind::FinalSize,
            0x07 => ErrorKind::FrameEncoding,
            0x08 => ErrorKind::TransportParameter,
            0x09 => ErrorKind::ConnectionIdLimit,
            0x0a => ErrorKind::ProtocolViolation,
            0x0b => ErrorKind::InvalidToken,
            0x0c => ErrorKind::Application,
            0x0d => ErrorKind::CryptoBufferExceeded,
            0x0e => ErrorKind::KeyUpdate,
            0x0f => ErrorKind::AeadLimitReached,
            0x10 => ErrorKind::NoViablePath,
            code @ 0x0100..=0x01ff => ErrorKind::Crypto((code - 0x0100) as u8),
            _ => return None,
        })
    }
}

/// A protocol level error, visible to the peer in a CONNECTION_CLOSE frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transport error {kind:?} in {frame_type:?}: {reason}")]
pub struct TransportError {
    kind: ErrorKind,
    frame_type: Option<FrameType>,
    reason: Cow<'static, str>,
}

impl TransportError {
    pub fn new<T: Into<Cow<'static, str>>>(
        kind: ErrorKind,
        frame_type: Option<FrameType>,
        reason: T,
    ) -> Self {
        Self {
            kind,
            frame_type,
            reason: reason.into(),
        }
    }

    pub fn with_default_fty<T: Into<Cow<'static, str>>>(kind: ErrorKind, reason: T) -> Self {
        Self::new(kind, None, reason)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn frame_type(&self) -> Option<FrameType> {
        self.frame_type
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// An error raised by the local application with an application defined code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("application error {code}: {reason}")]
pub struct ApplicationError {
    code: VarInt,
    reason: Cow<'static, str>,
}

impl ApplicationError {
    pub fn new<T: Into<Cow<'static, str>>>(code: VarInt, reason: T) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> VarInt {
        self.code
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// The errors a connection can be closed with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuicError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Application(#[from] ApplicationError),
}

impl QuicError {
    /// The error code carried in the CONNECTION_CLOSE frame.
    pub fn code(&self) -> VarInt {
        match self {
            QuicError::Transport(e) => e.kind().into(),
            QuicError::Application(e) => e.code(),
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            QuicError::Transport(e) => e.reason(),
            QuicError::Application(e) => e.reason(),
        }
    }

    pub fn is_application(&self) -> bool {
        matches!(self, QuicError::Application(..))
    }
}

/// Errors that stay on this endpoint: a request the caller can adjust and
/// retry. They are never sent to the peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocalError {
    #[error("frame of {needed} bytes rejected, only {remaining} bytes remaining")]
    Rejected { needed: usize, remaining: usize },
    #[error("byte event already registered")]
    DuplicateEvent,
    #[error("packet already finalized")]
    AlreadyFinalized,
    #[error("unknown stream {0}")]
    UnknownStream(StreamId),
    #[error("stream {0} can no longer be written")]
    StreamClosed(StreamId),
    #[error("connection is closing or closed")]
    ConnectionClosed,
    #[error(transparent)]
    StreamLimit(#[from] crate::sid::StreamIdError),
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),
}
