//! Typed request/response pairs and their framing.

use super::codec::{
    decode_members, encode_members, ensure_consumed, get_blob, get_bool, get_u32, get_u64, get_u8,
    put_blob, put_bool, DecodeResult, ProtocolError, WireFormat,
};
use super::status::{ErrorKind, Response, Status};
use accord_common::types::{CorrelationId, LogEntry, LogIndex, Member, NodeId, Term};
use bytes::{BufMut, Bytes, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Join,
    Leave,
    Vote,
    Append,
    Command,
    Query,
}

impl MessageType {
    pub fn id(self) -> u8 {
        match self {
            MessageType::Join => 1,
            MessageType::Leave => 2,
            MessageType::Vote => 3,
            MessageType::Append => 4,
            MessageType::Command => 5,
            MessageType::Query => 6,
        }
    }

    pub fn for_id(id: u8) -> DecodeResult<Self> {
        match id {
            1 => Ok(MessageType::Join),
            2 => Ok(MessageType::Leave),
            3 => Ok(MessageType::Vote),
            4 => Ok(MessageType::Append),
            5 => Ok(MessageType::Command),
            6 => Ok(MessageType::Query),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// Ask the leader to admit a new member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub id: CorrelationId,
    pub member: Member,
}

/// Ask the leader to remove a member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveRequest {
    pub id: CorrelationId,
    pub member_id: NodeId,
}

/// RequestVote RPC: Candidate → Peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteRequest {
    pub id: CorrelationId,
    pub term: Term,
    pub candidate: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// Sent by leader to replicate log entries or as heartbeat
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendRequest {
    pub id: CorrelationId,
    pub term: Term,
    pub leader: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub commit_index: LogIndex,
}

impl AppendRequest {
    /// Index of the last entry this request covers
    pub fn last_index(&self) -> LogIndex {
        self.prev_log_index + self.entries.len() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub id: CorrelationId,
    pub command: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub id: CorrelationId,
    pub query: Bytes,
}

/// Result of a join or leave: where the configuration landed and who is in it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipPayload {
    pub index: LogIndex,
    pub term: Term,
    pub timestamp: u64,
    pub members: Vec<Member>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VotePayload {
    pub term: Term,
    pub voted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendPayload {
    pub term: Term,
    pub succeeded: bool,
    /// On success the last index matched; on rejection a hint for the leader
    pub log_index: LogIndex,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPayload {
    pub index: LogIndex,
    pub result: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPayload {
    pub index: LogIndex,
    pub result: Bytes,
}

pub type JoinResponse = Response<MembershipPayload>;
pub type LeaveResponse = Response<MembershipPayload>;
pub type VoteResponse = Response<VotePayload>;
pub type AppendResponse = Response<AppendPayload>;
pub type CommandResponse = Response<CommandPayload>;
pub type QueryResponse = Response<QueryPayload>;

impl WireFormat for JoinRequest {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.id);
        self.member.encode(buf);
    }

    fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        Ok(Self {
            id: get_u64(buf)?,
            member: Member::decode(buf)?,
        })
    }
}

impl WireFormat for LeaveRequest {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.id);
        buf.put_u64(self.member_id);
    }

    fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        Ok(Self {
            id: get_u64(buf)?,
            member_id: get_u64(buf)?,
        })
    }
}

impl WireFormat for VoteRequest {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.id);
        buf.put_u64(self.term);
        buf.put_u64(self.candidate);
        buf.put_u64(self.last_log_index);
        buf.put_u64(self.last_log_term);
    }

    fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        Ok(Self {
            id: get_u64(buf)?,
            term: get_u64(buf)?,
            candidate: get_u64(buf)?,
            last_log_index: get_u64(buf)?,
            last_log_term: get_u64(buf)?,
        })
    }
}

impl WireFormat for AppendRequest {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.id);
        buf.put_u64(self.term);
        buf.put_u64(self.leader);
        buf.put_u64(self.prev_log_index);
        buf.put_u64(self.prev_log_term);
        buf.put_u64(self.commit_index);
        buf.put_u32(self.entries.len() as u32);
        for entry in &self.entries {
            entry.encode(buf);
        }
    }

    fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        let id = get_u64(buf)?;
        let term = get_u64(buf)?;
        let leader = get_u64(buf)?;
        let prev_log_index = get_u64(buf)?;
        let prev_log_term = get_u64(buf)?;
        let commit_index = get_u64(buf)?;
        let count = get_u32(buf)? as usize;
        let mut entries = Vec::with_capacity(count.min(256));
        for _ in 0..count {
            entries.push(LogEntry::decode(buf)?);
        }
        Ok(Self {
            id,
            term,
            leader,
            prev_log_index,
            prev_log_term,
            entries,
            commit_index,
        })
    }
}

impl WireFormat for CommandRequest {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.id);
        put_blob(buf, &self.command);
    }

    fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        Ok(Self {
            id: get_u64(buf)?,
            command: get_blob(buf)?,
        })
    }
}

impl WireFormat for QueryRequest {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.id);
        put_blob(buf, &self.query);
    }

    fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        Ok(Self {
            id: get_u64(buf)?,
            query: get_blob(buf)?,
        })
    }
}

impl WireFormat for MembershipPayload {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.index);
        buf.put_u64(self.term);
        buf.put_u64(self.timestamp);
        encode_members(&self.members, buf);
    }

    fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        Ok(Self {
            index: get_u64(buf)?,
            term: get_u64(buf)?,
            timestamp: get_u64(buf)?,
            members: decode_members(buf)?,
        })
    }
}

impl WireFormat for VotePayload {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.term);
        put_bool(buf, self.voted);
    }

    fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        Ok(Self {
            term: get_u64(buf)?,
            voted: get_bool(buf)?,
        })
    }
}

impl WireFormat for AppendPayload {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.term);
        put_bool(buf, self.succeeded);
        buf.put_u64(self.log_index);
    }

    fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        Ok(Self {
            term: get_u64(buf)?,
            succeeded: get_bool(buf)?,
            log_index: get_u64(buf)?,
        })
    }
}

impl WireFormat for CommandPayload {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.index);
        put_blob(buf, &self.result);
    }

    fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        Ok(Self {
            index: get_u64(buf)?,
            result: get_blob(buf)?,
        })
    }
}

impl WireFormat for QueryPayload {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.index);
        put_blob(buf, &self.result);
    }

    fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        Ok(Self {
            index: get_u64(buf)?,
            result: get_blob(buf)?,
        })
    }
}

/// Every request the consensus core understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaftRequest {
    Join(JoinRequest),
    Leave(LeaveRequest),
    Vote(VoteRequest),
    Append(AppendRequest),
    Command(CommandRequest),
    Query(QueryRequest),
}

impl RaftRequest {
    pub fn id(&self) -> CorrelationId {
        match self {
            RaftRequest::Join(r) => r.id,
            RaftRequest::Leave(r) => r.id,
            RaftRequest::Vote(r) => r.id,
            RaftRequest::Append(r) => r.id,
            RaftRequest::Command(r) => r.id,
            RaftRequest::Query(r) => r.id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            RaftRequest::Join(_) => MessageType::Join,
            RaftRequest::Leave(_) => MessageType::Leave,
            RaftRequest::Vote(_) => MessageType::Vote,
            RaftRequest::Append(_) => MessageType::Append,
            RaftRequest::Command(_) => MessageType::Command,
            RaftRequest::Query(_) => MessageType::Query,
        }
    }
}

/// Every response the consensus core produces
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaftResponse {
    Join(JoinResponse),
    Leave(LeaveResponse),
    Vote(VoteResponse),
    Append(AppendResponse),
    Command(CommandResponse),
    Query(QueryResponse),
}

impl RaftResponse {
    pub fn id(&self) -> CorrelationId {
        match self {
            RaftResponse::Join(r) => r.id(),
            RaftResponse::Leave(r) => r.id(),
            RaftResponse::Vote(r) => r.id(),
            RaftResponse::Append(r) => r.id(),
            RaftResponse::Command(r) => r.id(),
            RaftResponse::Query(r) => r.id(),
        }
    }

    pub fn status(&self) -> Status {
        match self {
            RaftResponse::Join(r) => r.status(),
            RaftResponse::Leave(r) => r.status(),
            RaftResponse::Vote(r) => r.status(),
            RaftResponse::Append(r) => r.status(),
            RaftResponse::Command(r) => r.status(),
            RaftResponse::Query(r) => r.status(),
        }
    }

    /// ERROR response of the given kind for a request of type `message_type`
    pub fn error(
        message_type: MessageType,
        id: CorrelationId,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        match message_type {
            MessageType::Join => RaftResponse::Join(Response::err(id, kind, message)),
            MessageType::Leave => RaftResponse::Leave(Response::err(id, kind, message)),
            MessageType::Vote => RaftResponse::Vote(Response::err(id, kind, message)),
            MessageType::Append => RaftResponse::Append(Response::err(id, kind, message)),
            MessageType::Command => RaftResponse::Command(Response::err(id, kind, message)),
            MessageType::Query => RaftResponse::Query(Response::err(id, kind, message)),
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            RaftResponse::Join(_) => MessageType::Join,
            RaftResponse::Leave(_) => MessageType::Leave,
            RaftResponse::Vote(_) => MessageType::Vote,
            RaftResponse::Append(_) => MessageType::Append,
            RaftResponse::Command(_) => MessageType::Command,
            RaftResponse::Query(_) => MessageType::Query,
        }
    }
}

pub fn encode_request(request: &RaftRequest) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(request.message_type().id());
    match request {
        RaftRequest::Join(r) => r.encode(&mut buf),
        RaftRequest::Leave(r) => r.encode(&mut buf),
        RaftRequest::Vote(r) => r.encode(&mut buf),
        RaftRequest::Append(r) => r.encode(&mut buf),
        RaftRequest::Command(r) => r.encode(&mut buf),
        RaftRequest::Query(r) => r.encode(&mut buf),
    }
    buf.freeze()
}

pub fn decode_request(mut frame: Bytes) -> DecodeResult<RaftRequest> {
    let buf = &mut frame;
    let request = match MessageType::for_id(get_u8(buf)?)? {
        MessageType::Join => RaftRequest::Join(JoinRequest::decode(buf)?),
        MessageType::Leave => RaftRequest::Leave(LeaveRequest::decode(buf)?),
        MessageType::Vote => RaftRequest::Vote(VoteRequest::decode(buf)?),
        MessageType::Append => RaftRequest::Append(AppendRequest::decode(buf)?),
        MessageType::Command => RaftRequest::Command(CommandRequest::decode(buf)?),
        MessageType::Query => RaftRequest::Query(QueryRequest::decode(buf)?),
    };
    ensure_consumed(buf)?;
    Ok(request)
}

pub fn encode_response(response: &RaftResponse) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(response.message_type().id());
    match response {
        RaftResponse::Join(r) => r.encode(&mut buf),
        RaftResponse::Leave(r) => r.encode(&mut buf),
        RaftResponse::Vote(r) => r.encode(&mut buf),
        RaftResponse::Append(r) => r.encode(&mut buf),
        RaftResponse::Command(r) => r.encode(&mut buf),
        RaftResponse::Query(r) => r.encode(&mut buf),
    }
    buf.freeze()
}

pub fn decode_response(mut frame: Bytes) -> DecodeResult<RaftResponse> {
    let buf = &mut frame;
    let response = match MessageType::for_id(get_u8(buf)?)? {
        MessageType::Join => RaftResponse::Join(Response::decode(buf)?),
        MessageType::Leave => RaftResponse::Leave(Response::decode(buf)?),
        MessageType::Vote => RaftResponse::Vote(Response::decode(buf)?),
        MessageType::Append => RaftResponse::Append(Response::decode(buf)?),
        MessageType::Command => RaftResponse::Command(Response::decode(buf)?),
        MessageType::Query => RaftResponse::Query(Response::decode(buf)?),
    };
    ensure_consumed(buf)?;
    Ok(response)
}
