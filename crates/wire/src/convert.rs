//! Conversions between wire messages and `rally-state` types.
//!
//! Outbound conversions are infallible. Inbound ones validate identifiers,
//! timestamps, enum values, and required `oneof`/optional fields.

use rally_state::{Member, MemberId, PeerAddress, SessionCode, SessionView, Status};
use thiserror::Error;
use time::OffsetDateTime;

use crate::{
    MemberProto, MeshCounterIncrement, MeshEnvelope, MeshMemberChange, MeshSnapshot, MeshStarted,
    SessionStateProto, StatusProto, mesh_envelope,
};

/// Failure to decode or validate a wire message.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("protobuf decode failed: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid {field}: {value:?}")]
    InvalidValue { field: &'static str, value: String },
    #[error("unknown enum value {value} for `{field}`")]
    UnknownEnum { field: &'static str, value: i32 },
    #[error("frame exceeds limit of {max} bytes")]
    FrameTooLarge { max: usize },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

fn invalid(field: &'static str, value: impl Into<String>) -> WireError {
    WireError::InvalidValue {
        field,
        value: value.into(),
    }
}

// ============================================================================
// Primitives
// ============================================================================

pub fn timestamp_to_ms(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn timestamp_from_ms(ms: i64) -> Result<OffsetDateTime, WireError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .map_err(|_| invalid("timestamp", ms.to_string()))
}

pub fn parse_member_id(field: &'static str, raw: &str) -> Result<MemberId, WireError> {
    raw.parse().map_err(|_| invalid(field, raw))
}

fn parse_status(field: &'static str, raw: i32) -> Result<Status, WireError> {
    match StatusProto::try_from(raw) {
        Ok(StatusProto::Waiting) => Ok(Status::Waiting),
        Ok(StatusProto::Playing) => Ok(Status::Playing),
        Err(_) => Err(WireError::UnknownEnum { field, value: raw }),
    }
}

impl From<Status> for StatusProto {
    fn from(s: Status) -> Self {
        match s {
            Status::Waiting => StatusProto::Waiting,
            Status::Playing => StatusProto::Playing,
        }
    }
}

// ============================================================================
// Records
// ============================================================================

impl From<&Member> for MemberProto {
    fn from(m: &Member) -> Self {
        Self {
            id: m.id.to_string(),
            name: m.name.clone(),
            transport_address: m.transport_address.as_ref().map(|a| a.as_str().to_string()),
            joined_at_ms: timestamp_to_ms(m.joined_at),
        }
    }
}

impl TryFrom<MemberProto> for Member {
    type Error = WireError;

    fn try_from(m: MemberProto) -> Result<Self, Self::Error> {
        let transport_address = match m.transport_address {
            Some(raw) => Some(
                PeerAddress::new(raw.clone()).map_err(|_| invalid("transport_address", raw))?,
            ),
            None => None,
        };
        Ok(Self {
            id: parse_member_id("member.id", &m.id)?,
            name: m.name,
            transport_address,
            joined_at: timestamp_from_ms(m.joined_at_ms)?,
        })
    }
}

impl From<&SessionView> for SessionStateProto {
    fn from(v: &SessionView) -> Self {
        Self {
            id: v.id.to_string(),
            status: StatusProto::from(v.status) as i32,
            counter: v.counter,
            is_public: v.is_public,
            created_at_ms: timestamp_to_ms(v.created_at),
            creator_id: v.creator_id.to_string(),
            members: v.members.iter().map(MemberProto::from).collect(),
        }
    }
}

impl TryFrom<SessionStateProto> for SessionView {
    type Error = WireError;

    fn try_from(s: SessionStateProto) -> Result<Self, Self::Error> {
        let id = SessionCode::parse(&s.id).map_err(|_| invalid("state.id", s.id.clone()))?;
        let members: Result<Vec<Member>, _> =
            s.members.into_iter().map(TryInto::try_into).collect();
        Ok(Self {
            id,
            status: parse_status("state.status", s.status)?,
            counter: s.counter,
            is_public: s.is_public,
            created_at: timestamp_from_ms(s.created_at_ms)?,
            creator_id: parse_member_id("state.creator_id", &s.creator_id)?,
            members: members?,
        })
    }
}

/// Unwrap a required optional member and convert it.
pub fn required_member(member: Option<MemberProto>) -> Result<Member, WireError> {
    member.ok_or(WireError::MissingField("member"))?.try_into()
}

/// Unwrap a required optional state and convert it.
pub fn required_state(state: Option<SessionStateProto>) -> Result<SessionView, WireError> {
    state.ok_or(WireError::MissingField("state"))?.try_into()
}

// ============================================================================
// Mesh Messages
// ============================================================================

/// Decoded mesh payload, ready for the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshMessage {
    Snapshot {
        members: Vec<Member>,
        counter: u64,
        status: Status,
    },
    CounterIncrement {
        counter: u64,
        actor: MemberId,
    },
    MemberJoined(Member),
    MemberLeft(Member),
    Started(SessionView),
}

impl MeshMessage {
    /// Tag name, for logs.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Snapshot { .. } => "snapshot",
            Self::CounterIncrement { .. } => "counterIncrement",
            Self::MemberJoined(_) => "memberJoined",
            Self::MemberLeft(_) => "memberLeft",
            Self::Started(_) => "started",
        }
    }

    /// Decode a mesh frame body.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        use prost::Message;
        MeshEnvelope::decode(bytes)?.try_into()
    }

    /// Encode to a mesh frame body.
    pub fn encode(&self) -> Vec<u8> {
        use prost::Message;
        MeshEnvelope::from(self).encode_to_vec()
    }
}

impl From<&MeshMessage> for MeshEnvelope {
    fn from(m: &MeshMessage) -> Self {
        use mesh_envelope::Payload;
        let payload = match m {
            MeshMessage::Snapshot {
                members,
                counter,
                status,
            } => Payload::Snapshot(MeshSnapshot {
                members: members.iter().map(MemberProto::from).collect(),
                counter: *counter,
                status: StatusProto::from(*status) as i32,
            }),
            MeshMessage::CounterIncrement { counter, actor } => {
                Payload::CounterIncrement(MeshCounterIncrement {
                    counter: *counter,
                    actor: actor.to_string(),
                })
            }
            MeshMessage::MemberJoined(member) => Payload::MemberJoined(MeshMemberChange {
                member: Some(member.into()),
            }),
            MeshMessage::MemberLeft(member) => Payload::MemberLeft(MeshMemberChange {
                member: Some(member.into()),
            }),
            MeshMessage::Started(state) => Payload::Started(MeshStarted {
                state: Some(state.into()),
            }),
        };
        Self {
            payload: Some(payload),
        }
    }
}

impl TryFrom<MeshEnvelope> for MeshMessage {
    type Error = WireError;

    fn try_from(envelope: MeshEnvelope) -> Result<Self, Self::Error> {
        use mesh_envelope::Payload;
        match envelope.payload.ok_or(WireError::MissingField("payload"))? {
            Payload::Snapshot(s) => {
                let members: Result<Vec<Member>, _> =
                    s.members.into_iter().map(TryInto::try_into).collect();
                Ok(Self::Snapshot {
                    members: members?,
                    counter: s.counter,
                    status: parse_status("snapshot.status", s.status)?,
                })
            }
            Payload::CounterIncrement(c) => Ok(Self::CounterIncrement {
                counter: c.counter,
                actor: parse_member_id("actor", &c.actor)?,
            }),
            Payload::MemberJoined(c) => Ok(Self::MemberJoined(required_member(c.member)?)),
            Payload::MemberLeft(c) => Ok(Self::MemberLeft(required_member(c.member)?)),
            Payload::Started(s) => Ok(Self::Started(required_state(s.state)?)),
        }
    }
}
