//! Rally Wire Protocol Types
//!
//! This crate defines the shared Protobuf message types for both channels of
//! a Rally deployment. The authority and every participant MUST depend on
//! this crate so both ends agree on the schema.
//!
//! # Message Categories
//!
//! - **Authority Channel** (reliable + ordered): `AuthorityRequest` from a
//!   participant, `AuthorityEvent` pushed back (replies and broadcasts)
//! - **Mesh Channel** (best effort, per link): `MeshEnvelope` between
//!   participants, plus the `LinkHello` that opens a stream link
//!
//! Every union is a prost `oneof`, so receivers dispatch on the tag with a
//! plain `match`.

#![deny(unsafe_code)]

pub mod convert;
pub mod frame;

use prost::Message;

pub use convert::{MeshMessage, WireError};

// ============================================================================
// Shared Records
// ============================================================================

/// Session lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum StatusProto {
    Waiting = 0,
    Playing = 1,
}

/// A session member.
#[derive(Clone, PartialEq, Message)]
pub struct MemberProto {
    /// Member id (UUID, hyphenated).
    #[prost(string, tag = "1")]
    pub id: String,

    #[prost(string, tag = "2")]
    pub name: String,

    /// Peer link address, once the member has reported one.
    #[prost(string, optional, tag = "3")]
    pub transport_address: Option<String>,

    /// Join time, milliseconds since the Unix epoch.
    #[prost(int64, tag = "4")]
    pub joined_at_ms: i64,
}

/// Full session state as handed out by the authority.
#[derive(Clone, PartialEq, Message)]
pub struct SessionStateProto {
    #[prost(string, tag = "1")]
    pub id: String,

    #[prost(enumeration = "StatusProto", tag = "2")]
    pub status: i32,

    #[prost(uint64, tag = "3")]
    pub counter: u64,

    #[prost(bool, tag = "4")]
    pub is_public: bool,

    #[prost(int64, tag = "5")]
    pub created_at_ms: i64,

    #[prost(string, tag = "6")]
    pub creator_id: String,

    /// Members in join order.
    #[prost(message, repeated, tag = "7")]
    pub members: Vec<MemberProto>,
}

// ============================================================================
// Mesh Channel Messages
// ============================================================================

/// First frame on a stream peer link, sent by the connecting side.
///
/// Carries the connector's own listen address so the acceptor can key the
/// link by it.
#[derive(Clone, PartialEq, Message)]
pub struct LinkHello {
    #[prost(string, tag = "1")]
    pub listen_address: String,
}

/// Tagged union of everything sent over a mesh link.
#[derive(Clone, PartialEq, Message)]
pub struct MeshEnvelope {
    #[prost(oneof = "mesh_envelope::Payload", tags = "1, 2, 3, 4, 5")]
    pub payload: Option<mesh_envelope::Payload>,
}

pub mod mesh_envelope {
    /// Mesh payload variants.
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Payload {
        /// Sent once per newly opened link, by the opener.
        #[prost(message, tag = "1")]
        Snapshot(super::MeshSnapshot),
        /// Sent on every local increment.
        #[prost(message, tag = "2")]
        CounterIncrement(super::MeshCounterIncrement),
        #[prost(message, tag = "3")]
        MemberJoined(super::MeshMemberChange),
        #[prost(message, tag = "4")]
        MemberLeft(super::MeshMemberChange),
        #[prost(message, tag = "5")]
        Started(super::MeshStarted),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct MeshSnapshot {
    #[prost(message, repeated, tag = "1")]
    pub members: Vec<MemberProto>,

    #[prost(uint64, tag = "2")]
    pub counter: u64,

    #[prost(enumeration = "StatusProto", tag = "3")]
    pub status: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct MeshCounterIncrement {
    /// Counter value after the sender's increment.
    #[prost(uint64, tag = "1")]
    pub counter: u64,

    /// Member id of the incrementing participant.
    #[prost(string, tag = "2")]
    pub actor: String,
}

/// Body shared by the mesh `memberJoined` and `memberLeft` messages.
#[derive(Clone, PartialEq, Message)]
pub struct MeshMemberChange {
    #[prost(message, optional, tag = "1")]
    pub member: Option<MemberProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct MeshStarted {
    #[prost(message, optional, tag = "1")]
    pub state: Option<SessionStateProto>,
}

// ============================================================================
// Authority Channel: Requests
// ============================================================================

/// Participant to authority.
///
/// `request_id` is chosen by the sender and echoed in the direct reply's
/// `in_reply_to`. Zero means the sender does not correlate.
#[derive(Clone, PartialEq, Message)]
pub struct AuthorityRequest {
    #[prost(uint64, tag = "1")]
    pub request_id: u64,

    #[prost(oneof = "authority_request::Request", tags = "2, 3, 4, 5, 6, 7, 8")]
    pub request: Option<authority_request::Request>,
}

pub mod authority_request {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Request {
        #[prost(message, tag = "2")]
        CreateSession(super::CreateSession),
        #[prost(message, tag = "3")]
        JoinSession(super::JoinSession),
        #[prost(message, tag = "4")]
        UpdateTransportAddress(super::UpdateTransportAddress),
        #[prost(message, tag = "5")]
        StartSession(super::StartSession),
        #[prost(message, tag = "6")]
        LeaveSession(super::LeaveSession),
        #[prost(message, tag = "7")]
        IncrementCounter(super::IncrementCounter),
        #[prost(message, tag = "8")]
        GetSessionState(super::GetSessionState),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct CreateSession {
    #[prost(string, tag = "1")]
    pub name: String,

    #[prost(bool, tag = "2")]
    pub is_public: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct JoinSession {
    #[prost(string, tag = "1")]
    pub session_id: String,

    #[prost(string, tag = "2")]
    pub name: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct UpdateTransportAddress {
    #[prost(string, tag = "1")]
    pub address: String,
}

/// Requester is implied by the connection.
#[derive(Clone, PartialEq, Message)]
pub struct StartSession {}

#[derive(Clone, PartialEq, Message)]
pub struct LeaveSession {}

#[derive(Clone, PartialEq, Message)]
pub struct IncrementCounter {}

#[derive(Clone, PartialEq, Message)]
pub struct GetSessionState {}

// ============================================================================
// Authority Channel: Events
// ============================================================================

/// Rejection category carried by `ErrorEvent`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ErrorKind {
    Unspecified = 0,
    Validation = 1,
    NotFound = 2,
    AlreadyStarted = 3,
    PermissionDenied = 4,
    NotStarted = 5,
    NotInSession = 6,
    Malformed = 7,
}

/// Authority to participant.
///
/// `in_reply_to` is the `request_id` this event answers, or zero for a
/// broadcast the recipient did not ask for.
#[derive(Clone, PartialEq, Message)]
pub struct AuthorityEvent {
    #[prost(uint64, tag = "1")]
    pub in_reply_to: u64,

    #[prost(
        oneof = "authority_event::Event",
        tags = "2, 3, 4, 5, 6, 7, 8, 9, 10, 11"
    )]
    pub event: Option<authority_event::Event>,
}

pub mod authority_event {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Event {
        #[prost(message, tag = "2")]
        SessionCreated(super::SessionEntered),
        #[prost(message, tag = "3")]
        SessionJoined(super::SessionEntered),
        #[prost(message, tag = "4")]
        MemberJoined(super::MemberNotice),
        #[prost(message, tag = "5")]
        MemberAddressUpdated(super::MemberNotice),
        #[prost(message, tag = "6")]
        GameStarted(super::SessionStateNotice),
        #[prost(message, tag = "7")]
        MemberLeft(super::MemberNotice),
        #[prost(message, tag = "8")]
        SessionLeft(super::SessionLeft),
        #[prost(message, tag = "9")]
        CounterUpdated(super::CounterUpdated),
        #[prost(message, tag = "10")]
        SessionState(super::SessionStateNotice),
        #[prost(message, tag = "11")]
        Error(super::ErrorEvent),
    }
}

/// Reply to create or join. `member_id` is the recipient's own id.
#[derive(Clone, PartialEq, Message)]
pub struct SessionEntered {
    #[prost(string, tag = "1")]
    pub member_id: String,

    #[prost(message, optional, tag = "2")]
    pub state: Option<SessionStateProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct MemberNotice {
    #[prost(message, optional, tag = "1")]
    pub member: Option<MemberProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SessionStateNotice {
    #[prost(message, optional, tag = "1")]
    pub state: Option<SessionStateProto>,
}

/// Leave acknowledgement.
#[derive(Clone, PartialEq, Message)]
pub struct SessionLeft {}

#[derive(Clone, PartialEq, Message)]
pub struct CounterUpdated {
    #[prost(uint64, tag = "1")]
    pub counter: u64,

    /// Member id of the requester.
    #[prost(string, tag = "2")]
    pub updated_by: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ErrorEvent {
    #[prost(enumeration = "ErrorKind", tag = "1")]
    pub kind: i32,

    #[prost(string, tag = "2")]
    pub message: String,
}

// ============================================================================
// Constructors
// ============================================================================

impl AuthorityRequest {
    pub fn new(request_id: u64, request: authority_request::Request) -> Self {
        Self {
            request_id,
            request: Some(request),
        }
    }
}

impl AuthorityEvent {
    /// Unsolicited event.
    pub fn broadcast(event: authority_event::Event) -> Self {
        Self {
            in_reply_to: 0,
            event: Some(event),
        }
    }

    /// Direct answer to `request_id`.
    pub fn reply(request_id: u64, event: authority_event::Event) -> Self {
        Self {
            in_reply_to: request_id,
            event: Some(event),
        }
    }

    pub fn error(request_id: u64, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::reply(
            request_id,
            authority_event::Event::Error(ErrorEvent {
                kind: kind as i32,
                message: message.into(),
            }),
        )
    }

    /// Short tag name, for logs.
    pub fn kind_name(&self) -> &'static str {
        use authority_event::Event;
        match &self.event {
            Some(Event::SessionCreated(_)) => "sessionCreated",
            Some(Event::SessionJoined(_)) => "sessionJoined",
            Some(Event::MemberJoined(_)) => "memberJoined",
            Some(Event::MemberAddressUpdated(_)) => "memberAddressUpdated",
            Some(Event::GameStarted(_)) => "gameStarted",
            Some(Event::MemberLeft(_)) => "memberLeft",
            Some(Event::SessionLeft(_)) => "sessionLeft",
            Some(Event::CounterUpdated(_)) => "counterUpdated",
            Some(Event::SessionState(_)) => "sessionState",
            Some(Event::Error(_)) => "error",
            None => "empty",
        }
    }
}

impl ErrorEvent {
    /// Decoded kind; unknown values collapse to `Unspecified`.
    pub fn error_kind(&self) -> ErrorKind {
        ErrorKind::try_from(self.kind).unwrap_or(ErrorKind::Unspecified)
    }
}

// ============================================================================
// Tests
// ============================================================================
