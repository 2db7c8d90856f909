//! Rally State Core
//!
//! This crate holds the data model of a shared-counter session and the merge
//! rules that keep every participant's copy of it eventually consistent.
//!
//! # Architecture Constraints
//!
//! The State Core MUST NOT:
//! - Perform I/O operations (file, network, etc.)
//! - Read wall-clock time (timestamps are passed in by the caller)
//! - Hold references that outlive the owning `Session`
//!
//! Both the rendezvous authority and the participants build on these types,
//! so a single set of invariants governs both sides:
//!
//! - `creator_id` is fixed when the session is created and never changes.
//! - `status` only moves from `Waiting` to `Playing`.
//! - `counter` never decreases at any observer.
//! - Snapshot merges never remove a member; only explicit leave events do.

#![deny(unsafe_code)]

pub mod reconcile;

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

pub use reconcile::{MergeOutcome, Mirror};

// ============================================================================
// Identifiers
// ============================================================================

/// Number of characters in a freshly generated session code.
pub const SESSION_CODE_LEN: usize = 8;

/// Upper bound on accepted session code input.
const SESSION_CODE_MAX_INPUT: usize = 32;

/// Short, human-shareable session identifier.
///
/// Codes are upper-case; parsing folds user input to upper case so lookups
/// are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionCode(String);

impl SessionCode {
    /// Draw a fresh code from a random v4 UUID.
    pub fn generate() -> Self {
        let simple = Uuid::new_v4().simple().to_string();
        Self(simple[..SESSION_CODE_LEN].to_ascii_uppercase())
    }

    /// Parse a code typed or pasted by a user.
    pub fn parse(input: &str) -> Result<Self, SessionError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(SessionError::Validation("session id is required".into()));
        }
        if trimmed.len() > SESSION_CODE_MAX_INPUT
            || !trimmed.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(SessionError::Validation(format!(
                "malformed session id {trimmed:?}"
            )));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionCode {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Unique member identifier, assigned by the authority on join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(Uuid);

impl MemberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MemberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for MemberId {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| SessionError::Validation(format!("malformed member id {s:?}")))
    }
}

/// Opaque address of a participant's direct peer link endpoint.
///
/// Ordering is used only to break ties between simultaneous dials.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(address: impl Into<String>) -> Result<Self, SessionError> {
        let address = address.into();
        let trimmed = address.trim();
        if trimmed.is_empty() {
            return Err(SessionError::Validation("transport address is required".into()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Rejection reasons for session operations.
///
/// Every variant is produced before any mutation takes place.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("session {0} not found")]
    NotFound(SessionCode),
    #[error("session has already started")]
    AlreadyStarted,
    #[error("only the session creator can start the session")]
    PermissionDenied,
    #[error("session has not started yet")]
    NotStarted,
    #[error("member {0} is not part of this session")]
    NotMember(MemberId),
}

// ============================================================================
// Members
// ============================================================================

/// Default upper bound on display name length, in characters.
pub const DEFAULT_MAX_NAME_LEN: usize = 32;

/// Normalize and check a display name.
pub fn validate_name(name: &str, max_len: usize) -> Result<String, SessionError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(SessionError::Validation("user name is required".into()));
    }
    if trimmed.chars().count() > max_len {
        return Err(SessionError::Validation(format!(
            "user name exceeds {max_len} characters"
        )));
    }
    Ok(trimmed.to_string())
}

/// A participant of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: MemberId,
    pub name: String,
    pub transport_address: Option<PeerAddress>,
    pub joined_at: OffsetDateTime,
}

impl Member {
    /// Create a member with a fresh id and no transport address yet.
    pub fn new(name: impl Into<String>, joined_at: OffsetDateTime) -> Self {
        Self {
            id: MemberId::new(),
            name: name.into(),
            transport_address: None,
            joined_at,
        }
    }
}

// ============================================================================
// Session Status
// ============================================================================

/// Lifecycle status. `Playing` is terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Status {
    #[default]
    Waiting,
    Playing,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Playing => "playing",
        }
    }

    pub fn is_playing(&self) -> bool {
        matches!(self, Self::Playing)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Session View
// ============================================================================

/// Owned, point-in-time copy of a session's state.
///
/// This is what crosses the authority boundary: it carries no reference back
/// into the registry. `members` is in join order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    pub id: SessionCode,
    pub status: Status,
    pub counter: u64,
    pub is_public: bool,
    pub created_at: OffsetDateTime,
    pub creator_id: MemberId,
    pub members: Vec<Member>,
}

impl SessionView {
    pub fn member(&self, id: &MemberId) -> Option<&Member> {
        self.members.iter().find(|m| m.id == *id)
    }

    pub fn creator(&self) -> Option<&Member> {
        self.member(&self.creator_id)
    }
}

// ============================================================================
// Session (authoritative record)
// ============================================================================

/// Canonical per-game state, owned by the authority's registry.
///
/// All mutators check their preconditions before touching any field, so a
/// rejected call leaves the session exactly as it was.
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionCode,
    status: Status,
    counter: u64,
    is_public: bool,
    created_at: OffsetDateTime,
    creator_id: MemberId,
    /// Members in join order.
    members: IndexMap<MemberId, Member>,
}

impl Session {
    /// Create a session whose first member is its creator.
    pub fn new(
        id: SessionCode,
        creator: Member,
        is_public: bool,
        created_at: OffsetDateTime,
    ) -> Self {
        let creator_id = creator.id;
        let mut members = IndexMap::new();
        members.insert(creator_id, creator);
        Self {
            id,
            status: Status::Waiting,
            counter: 0,
            is_public,
            created_at,
            creator_id,
            members,
        }
    }

    pub fn id(&self) -> &SessionCode {
        &self.id
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn is_public(&self) -> bool {
        self.is_public
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    pub fn creator_id(&self) -> MemberId {
        self.creator_id
    }

    /// The creator, while still a member.
    pub fn creator(&self) -> Option<&Member> {
        self.members.get(&self.creator_id)
    }

    pub fn member(&self, id: &MemberId) -> Option<&Member> {
        self.members.get(id)
    }

    /// Members in join order.
    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Append a member. Rejected once the session is playing.
    pub fn add_member(&mut self, member: Member) -> Result<(), SessionError> {
        if self.status.is_playing() {
            return Err(SessionError::AlreadyStarted);
        }
        self.members.insert(member.id, member);
        Ok(())
    }

    /// Remove a member, keeping the join order of the rest.
    pub fn remove_member(&mut self, id: &MemberId) -> Option<Member> {
        self.members.shift_remove(id)
    }

    /// Record a member's peer link address and return the updated member.
    pub fn set_transport_address(
        &mut self,
        id: &MemberId,
        address: PeerAddress,
    ) -> Result<&Member, SessionError> {
        let member = self
            .members
            .get_mut(id)
            .ok_or(SessionError::NotMember(*id))?;
        member.transport_address = Some(address);
        Ok(member)
    }

    /// Transition `Waiting -> Playing`.
    ///
    /// The requester must be the creator; a second start is `AlreadyStarted`.
    pub fn start(&mut self, requester: &MemberId) -> Result<(), SessionError> {
        if *requester != self.creator_id {
            return Err(SessionError::PermissionDenied);
        }
        if self.status.is_playing() {
            return Err(SessionError::AlreadyStarted);
        }
        self.status = Status::Playing;
        Ok(())
    }

    /// Increment the canonical counter. Only allowed while playing.
    pub fn increment(&mut self) -> Result<u64, SessionError> {
        if !self.status.is_playing() {
            return Err(SessionError::NotStarted);
        }
        self.counter = self.counter.saturating_add(1);
        Ok(self.counter)
    }

    /// Owned copy of the current state.
    pub fn view(&self) -> SessionView {
        SessionView {
            id: self.id.clone(),
            status: self.status,
            counter: self.counter,
            is_public: self.is_public,
            created_at: self.created_at,
            creator_id: self.creator_id,
            members: self.members.values().cloned().collect(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
