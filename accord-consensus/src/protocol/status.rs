//! Response envelope shared by every RPC.

use super::codec::{get_string, get_u64, get_u8, put_string, DecodeResult, ProtocolError, WireFormat};
use accord_common::types::{CorrelationId, LogIndex, Member, Term};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

use super::messages::MembershipPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Error,
    Ok,
}

impl Status {
    pub fn id(self) -> u8 {
        match self {
            Status::Error => 0,
            Status::Ok => 1,
        }
    }

    pub fn for_id(id: u8) -> DecodeResult<Self> {
        match id {
            0 => Ok(Status::Error),
            1 => Ok(Status::Ok),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }
}

/// Closed set of errors a caller can receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NoLeader,
    QueryFailure,
    CommandFailure,
    ApplicationError,
    IllegalMemberState,
    UnknownSession,
    InternalError,
    ConfigurationError,
}

impl ErrorKind {
    pub fn id(self) -> u8 {
        match self {
            ErrorKind::NoLeader => 1,
            ErrorKind::QueryFailure => 2,
            ErrorKind::CommandFailure => 3,
            ErrorKind::ApplicationError => 4,
            ErrorKind::IllegalMemberState => 5,
            ErrorKind::UnknownSession => 6,
            ErrorKind::InternalError => 7,
            ErrorKind::ConfigurationError => 8,
        }
    }

    pub fn for_id(id: u8) -> DecodeResult<Self> {
        match id {
            1 => Ok(ErrorKind::NoLeader),
            2 => Ok(ErrorKind::QueryFailure),
            3 => Ok(ErrorKind::CommandFailure),
            4 => Ok(ErrorKind::ApplicationError),
            5 => Ok(ErrorKind::IllegalMemberState),
            6 => Ok(ErrorKind::UnknownSession),
            7 => Ok(ErrorKind::InternalError),
            8 => Ok(ErrorKind::ConfigurationError),
            other => Err(ProtocolError::UnknownErrorKind(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ResponseError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ResponseError {}

impl WireFormat for ResponseError {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind.id());
        put_string(buf, &self.message);
    }

    fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        let kind = ErrorKind::for_id(get_u8(buf)?)?;
        let message = get_string(buf)?;
        Ok(Self { kind, message })
    }
}

/// Correlated response: a payload when OK, an error when ERROR, never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response<T> {
    id: CorrelationId,
    body: Result<T, ResponseError>,
}

impl<T> Response<T> {
    pub fn ok(id: CorrelationId, payload: T) -> Self {
        Self {
            id,
            body: Ok(payload),
        }
    }

    pub fn err(id: CorrelationId, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            id,
            body: Err(ResponseError::new(kind, message)),
        }
    }

    /// Assemble a response from loose parts, enforcing OK/ERROR exclusivity.
    pub fn from_parts(
        id: CorrelationId,
        status: Status,
        error: Option<ResponseError>,
        payload: Option<T>,
    ) -> DecodeResult<Self> {
        match (status, error, payload) {
            (Status::Ok, None, Some(payload)) => Ok(Self::ok(id, payload)),
            (Status::Ok, Some(_), _) => Err(ProtocolError::InvalidResponse(
                "OK response must not carry an error",
            )),
            (Status::Ok, None, None) => Err(ProtocolError::InvalidResponse(
                "OK response requires a payload",
            )),
            (Status::Error, Some(error), None) => Ok(Self { id, body: Err(error) }),
            (Status::Error, _, Some(_)) => Err(ProtocolError::InvalidResponse(
                "ERROR response must not carry a payload",
            )),
            (Status::Error, None, None) => Err(ProtocolError::InvalidResponse(
                "ERROR response requires an error",
            )),
        }
    }

    pub fn id(&self) -> CorrelationId {
        self.id
    }

    pub fn status(&self) -> Status {
        match self.body {
            Ok(_) => Status::Ok,
            Err(_) => Status::Error,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.body.is_ok()
    }

    pub fn payload(&self) -> Option<&T> {
        self.body.as_ref().ok()
    }

    pub fn error(&self) -> Option<&ResponseError> {
        self.body.as_ref().err()
    }

    pub fn into_result(self) -> Result<T, ResponseError> {
        self.body
    }
}

impl<T: WireFormat> WireFormat for Response<T> {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.id);
        buf.put_u8(self.status().id());
        match &self.body {
            Ok(payload) => payload.encode(buf),
            Err(error) => error.encode(buf),
        }
    }

    fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        let id = get_u64(buf)?;
        // branch on status before touching anything else
        match Status::for_id(get_u8(buf)?)? {
            Status::Ok => Ok(Self::ok(id, T::decode(buf)?)),
            Status::Error => Ok(Self {
                id,
                body: Err(ResponseError::decode(buf)?),
            }),
        }
    }
}

/// Join and leave responses report zeroes and no members on error.
impl Response<MembershipPayload> {
    pub fn index(&self) -> LogIndex {
        self.payload().map(|p| p.index).unwrap_or(0)
    }

    pub fn term(&self) -> Term {
        self.payload().map(|p| p.term).unwrap_or(0)
    }

    pub fn timestamp(&self) -> u64 {
        self.payload().map(|p| p.timestamp).unwrap_or(0)
    }

    pub fn members(&self) -> &[Member] {
        self.payload().map(|p| p.members.as_slice()).unwrap_or(&[])
    }
}
