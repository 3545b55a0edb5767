//! Field-by-field binary encoding shared by every message.
//!
//! All integers are big-endian. Strings and blobs are prefixed with a
//! `u32` length. Member collections and configurations carry a version
//! byte so their layout can evolve.

use accord_common::error::AccordError;
use accord_common::types::{Configuration, LogEntry, LogEntryType, Member, MemberRole};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const MEMBERS_VERSION: u8 = 1;
pub const CONFIGURATION_VERSION: u8 = 1;

/// A frame that cannot be decoded. Fatal to that frame only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("truncated frame: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("unknown response status {0}")]
    UnknownStatus(u8),

    #[error("unknown error type {0}")]
    UnknownErrorKind(u8),

    #[error("unknown member role {0}")]
    UnknownMemberRole(u8),

    #[error("unknown log entry type {0}")]
    UnknownEntryType(u8),

    #[error("invalid boolean flag {0}")]
    InvalidFlag(u8),

    #[error("unsupported {what} version {version}")]
    UnsupportedVersion { what: &'static str, version: u8 },

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    #[error("invalid response: {0}")]
    InvalidResponse(&'static str),
}

impl From<ProtocolError> for AccordError {
    fn from(err: ProtocolError) -> Self {
        AccordError::Protocol(err.to_string())
    }
}

pub type DecodeResult<T> = std::result::Result<T, ProtocolError>;

/// Symmetric binary encoding: `decode(encode(x)) == x`.
pub trait WireFormat: Sized {
    fn encode(&self, buf: &mut BytesMut);
    fn decode(buf: &mut Bytes) -> DecodeResult<Self>;
}

/// Encode a single value into its own buffer
pub fn to_bytes<T: WireFormat>(value: &T) -> Bytes {
    let mut buf = BytesMut::new();
    value.encode(&mut buf);
    buf.freeze()
}

/// Decode a value that must span the whole buffer
pub fn from_bytes<T: WireFormat>(mut bytes: Bytes) -> DecodeResult<T> {
    let value = T::decode(&mut bytes)?;
    ensure_consumed(&bytes)?;
    Ok(value)
}

pub(crate) fn ensure_consumed(buf: &Bytes) -> DecodeResult<()> {
    if buf.has_remaining() {
        return Err(ProtocolError::TrailingBytes(buf.remaining()));
    }
    Ok(())
}

fn ensure(buf: &Bytes, needed: usize) -> DecodeResult<()> {
    if buf.remaining() < needed {
        return Err(ProtocolError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

pub fn get_u8(buf: &mut Bytes) -> DecodeResult<u8> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn get_u32(buf: &mut Bytes) -> DecodeResult<u32> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

pub fn get_u64(buf: &mut Bytes) -> DecodeResult<u64> {
    ensure(buf, 8)?;
    Ok(buf.get_u64())
}

pub fn get_bool(buf: &mut Bytes) -> DecodeResult<bool> {
    match get_u8(buf)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(ProtocolError::InvalidFlag(other)),
    }
}

pub fn get_blob(buf: &mut Bytes) -> DecodeResult<Bytes> {
    let len = get_u32(buf)? as usize;
    ensure(buf, len)?;
    Ok(buf.split_to(len))
}

pub fn get_string(buf: &mut Bytes) -> DecodeResult<String> {
    let raw = get_blob(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
}

pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

pub fn put_blob(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

pub fn put_string(buf: &mut BytesMut, value: &str) {
    put_blob(buf, value.as_bytes());
}

impl WireFormat for Member {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.id);
        buf.put_u8(self.role.id());
        put_string(buf, &self.address);
    }

    fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        let id = get_u64(buf)?;
        let role_id = get_u8(buf)?;
        let role = MemberRole::for_id(role_id).ok_or(ProtocolError::UnknownMemberRole(role_id))?;
        let address = get_string(buf)?;
        Ok(Member { id, address, role })
    }
}

pub fn encode_members(members: &[Member], buf: &mut BytesMut) {
    buf.put_u8(MEMBERS_VERSION);
    buf.put_u32(members.len() as u32);
    for member in members {
        member.encode(buf);
    }
}

pub fn decode_members(buf: &mut Bytes) -> DecodeResult<Vec<Member>> {
    let version = get_u8(buf)?;
    if version != MEMBERS_VERSION {
        return Err(ProtocolError::UnsupportedVersion {
            what: "member collection",
            version,
        });
    }
    let count = get_u32(buf)? as usize;
    // cap the preallocation, a corrupt count must not allocate wildly
    let mut members = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        members.push(Member::decode(buf)?);
    }
    Ok(members)
}

impl WireFormat for Configuration {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(CONFIGURATION_VERSION);
        put_bool(buf, self.is_joint());
        encode_members(&self.members, buf);
        if let Some(outgoing) = &self.outgoing {
            encode_members(outgoing, buf);
        }
    }

    fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        let version = get_u8(buf)?;
        if version != CONFIGURATION_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                what: "configuration",
                version,
            });
        }
        let joint = get_bool(buf)?;
        let members = decode_members(buf)?;
        let outgoing = if joint {
            Some(decode_members(buf)?)
        } else {
            None
        };
        Ok(Configuration { members, outgoing })
    }
}

impl WireFormat for LogEntry {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.index);
        buf.put_u64(self.term);
        buf.put_u64(self.timestamp);
        buf.put_u8(self.entry_type.id());
        put_blob(buf, &self.data);
    }

    fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        let index = get_u64(buf)?;
        let term = get_u64(buf)?;
        let timestamp = get_u64(buf)?;
        let type_id = get_u8(buf)?;
        let entry_type =
            LogEntryType::for_id(type_id).ok_or(ProtocolError::UnknownEntryType(type_id))?;
        let data = get_blob(buf)?;
        Ok(LogEntry {
            index,
            term,
            timestamp,
            entry_type,
            data,
        })
    }
}
