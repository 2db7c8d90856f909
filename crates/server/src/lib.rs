//! Rally Rendezvous Authority
//!
//! The authority coordinates session creation, membership, and status
//! transitions. It owns:
//! - The session registry (one guarded slot per live session)
//! - The connection table (who is connected, and as which member)
//! - Request validation and dispatch
//! - Discovery feed notifications
//!
//! # Architecture
//!
//! Gameplay state does not flow through here in steady state: participants
//! replicate the counter directly over their mesh. The authority's counter is
//! only advanced by explicit `incrementCounter` requests.
//!
//! Every mutation of a session, and every broadcast caused by it, happens
//! while that session's slot is locked, so all members observe events for one
//! session in the same order.

#![deny(unsafe_code)]

pub mod connection;
pub mod discovery;
pub mod local;
pub mod net;
pub mod registry;
pub mod validation;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use prost::Message;
use rally_state::{
    DEFAULT_MAX_NAME_LEN, Member, MemberId, PeerAddress, Session, SessionCode, SessionError,
    SessionView,
};
use rally_wire::frame::DEFAULT_MAX_FRAME_LEN;
use rally_wire::{
    AuthorityEvent, AuthorityRequest, CounterUpdated, ErrorKind, MemberNotice, MemberProto,
    SessionEntered, SessionLeft, SessionStateNotice, SessionStateProto, authority_event::Event,
};
use serde::Deserialize;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info};

use connection::{ConnId, ConnectionTable, EventSender, Membership};
use discovery::{DiscoveryFeed, DiscoveryNotice, UnlistReason};
use registry::{Mutation, SessionRegistry, lock};
use validation::{Command, validate_request};

// ============================================================================
// Defaults
// ============================================================================

/// Default authority port.
pub const DEFAULT_PORT: u16 = 4700;

/// Default listen address.
pub const DEFAULT_LISTEN_ADDR: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, DEFAULT_PORT));

// ============================================================================
// Errors
// ============================================================================

/// Why an authority request was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorityError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("connection is not in a session")]
    NotInSession,
    #[error("malformed request: {0}")]
    Malformed(String),
}

impl AuthorityError {
    /// Wire category for the error reply.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Session(SessionError::Validation(_)) => ErrorKind::Validation,
            Self::Session(SessionError::NotFound(_)) => ErrorKind::NotFound,
            Self::Session(SessionError::AlreadyStarted) => ErrorKind::AlreadyStarted,
            Self::Session(SessionError::PermissionDenied) => ErrorKind::PermissionDenied,
            Self::Session(SessionError::NotStarted) => ErrorKind::NotStarted,
            Self::Session(SessionError::NotMember(_)) | Self::NotInSession => {
                ErrorKind::NotInSession
            }
            Self::Malformed(_) => ErrorKind::Malformed,
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Authority configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AuthorityConfig {
    pub listen_addr: SocketAddr,
    pub max_name_len: usize,
    pub max_frame_len: usize,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR,
            max_name_len: DEFAULT_MAX_NAME_LEN,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

// ============================================================================
// Event Builders
// ============================================================================

fn state_proto(view: &SessionView) -> Option<SessionStateProto> {
    Some(view.into())
}

fn member_notice(member: &Member) -> MemberNotice {
    MemberNotice {
        member: Some(MemberProto::from(member)),
    }
}

/// Wall-clock now, at the millisecond precision the wire carries.
fn now() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_millisecond(now.millisecond()).unwrap_or(now)
}

// ============================================================================
// Authority
// ============================================================================

/// The rendezvous authority.
pub struct Authority {
    config: AuthorityConfig,
    registry: SessionRegistry,
    connections: Mutex<ConnectionTable>,
    feed: Arc<dyn DiscoveryFeed>,
}

impl Authority {
    pub fn new(config: AuthorityConfig, feed: Arc<dyn DiscoveryFeed>) -> Self {
        Self {
            config,
            registry: SessionRegistry::new(),
            connections: Mutex::new(ConnectionTable::new()),
            feed,
        }
    }

    pub fn config(&self) -> &AuthorityConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    /// Register a new connection whose events go to `sender`.
    pub fn connect(&self, sender: EventSender) -> ConnId {
        let conn = lock(&self.connections).register(sender, now());
        debug!(conn, "authority connection opened");
        conn
    }

    /// Transport went away. Same effect as a leave.
    pub fn disconnect(&self, conn: ConnId) {
        let Some(connection) = lock(&self.connections).unregister(conn) else {
            return;
        };
        if let Some(membership) = &connection.membership {
            self.remove_member(membership);
        }
        debug!(
            conn,
            connected_for = %(now() - connection.connected_at),
            "authority connection closed"
        );
    }

    /// Decode and handle one raw request frame.
    pub fn handle_frame(&self, conn: ConnId, bytes: &[u8]) {
        match AuthorityRequest::decode(bytes) {
            Ok(request) => self.handle(conn, request),
            Err(err) => {
                debug!(conn, error = %err, "undecodable authority request");
                self.reply_error(conn, 0, &AuthorityError::Malformed(err.to_string()));
            }
        }
    }

    /// Handle one request. Rejections are answered with an error event.
    pub fn handle(&self, conn: ConnId, request: AuthorityRequest) {
        let request_id = request.request_id;
        let command = match validate_request(request.request, self.config.max_name_len) {
            Ok(command) => command,
            Err(err) => {
                debug!(conn, request_id, error = %err, "invalid request");
                self.reply_error(conn, request_id, &err);
                return;
            }
        };
        let kind = command.as_str();
        if let Err(err) = self.execute(conn, request_id, command) {
            debug!(conn, request_id, request = kind, error = %err, "request rejected");
            self.reply_error(conn, request_id, &err);
        }
    }

    fn execute(
        &self,
        conn: ConnId,
        request_id: u64,
        command: Command,
    ) -> Result<(), AuthorityError> {
        match command {
            Command::Create { name, is_public } => {
                self.create_session(conn, request_id, name, is_public)?;
            }
            Command::Join { code, name } => {
                self.join_session(conn, request_id, &code, name)?;
            }
            Command::UpdateTransportAddress { address } => {
                self.update_transport_address(conn, address)?;
            }
            Command::Start => {
                self.start_session(conn, request_id)?;
            }
            Command::Leave => {
                self.leave_session(conn, request_id);
            }
            Command::Increment => {
                self.increment_counter(conn, request_id)?;
            }
            Command::GetState => {
                let view = self.session_state(conn)?;
                self.reply(
                    conn,
                    request_id,
                    Event::SessionState(SessionStateNotice {
                        state: state_proto(&view),
                    }),
                );
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    /// Create a session with the caller as creator.
    ///
    /// A caller that is already a member of a session leaves it first.
    pub fn create_session(
        &self,
        conn: ConnId,
        request_id: u64,
        name: String,
        is_public: bool,
    ) -> Result<(MemberId, SessionView), AuthorityError> {
        self.leave_current(conn);

        let created_at = now();
        let creator = Member::new(name, created_at);
        let member_id = creator.id;
        let view = self.registry.create(creator, is_public, created_at);

        lock(&self.connections).bind(
            conn,
            Membership {
                session: view.id.clone(),
                member: member_id,
            },
        );
        self.reply(
            conn,
            request_id,
            Event::SessionCreated(SessionEntered {
                member_id: member_id.to_string(),
                state: state_proto(&view),
            }),
        );
        info!(session = %view.id, member = %member_id, public = is_public, "session created");

        if is_public {
            let creator_name = view.creator().map(|m| m.name.clone()).unwrap_or_default();
            self.announce(DiscoveryNotice::Listed {
                id: view.id.clone(),
                member_count: view.members.len(),
                created_at: view.created_at,
                creator_name,
            });
        }
        Ok((member_id, view))
    }

    /// Join an existing, still waiting session.
    pub fn join_session(
        &self,
        conn: ConnId,
        request_id: u64,
        code: &SessionCode,
        name: String,
    ) -> Result<(MemberId, SessionView), AuthorityError> {
        self.leave_current(conn);

        let member = Member::new(name, now());
        let member_id = member.id;
        let Mutation { value: view, .. } = self.registry.with_session(code, |session| {
            session.add_member(member.clone())?;
            let view = session.view();

            let connections = {
                let mut connections = lock(&self.connections);
                connections.bind(
                    conn,
                    Membership {
                        session: code.clone(),
                        member: member_id,
                    },
                );
                connections
            };
            connections.send(
                conn,
                AuthorityEvent::reply(
                    request_id,
                    Event::SessionJoined(SessionEntered {
                        member_id: member_id.to_string(),
                        state: state_proto(&view),
                    }),
                ),
            );
            broadcast_except(
                &connections,
                session,
                &member_id,
                Event::MemberJoined(member_notice(&member)),
            );
            Ok(view)
        })?;

        info!(session = %code, member = %member_id, members = view.members.len(), "member joined");
        Ok((member_id, view))
    }

    /// Record the caller's peer link address and tell everyone else.
    pub fn update_transport_address(
        &self,
        conn: ConnId,
        address: PeerAddress,
    ) -> Result<Member, AuthorityError> {
        let membership = self.membership(conn)?;
        let Mutation { value: member, .. } =
            self.registry.with_session(&membership.session, |session| {
                let member = session
                    .set_transport_address(&membership.member, address)?
                    .clone();
                broadcast_except(
                    &lock(&self.connections),
                    session,
                    &membership.member,
                    Event::MemberAddressUpdated(member_notice(&member)),
                );
                Ok(member)
            })?;

        debug!(
            session = %membership.session,
            member = %member.id,
            address = ?member.transport_address,
            "transport address updated"
        );
        Ok(member)
    }

    /// Start the caller's session. Creator only, once.
    pub fn start_session(
        &self,
        conn: ConnId,
        request_id: u64,
    ) -> Result<SessionView, AuthorityError> {
        let membership = self.membership(conn)?;
        let Mutation { value: view, .. } =
            self.registry.with_session(&membership.session, |session| {
                session.start(&membership.member)?;
                let view = session.view();

                let connections = lock(&self.connections);
                for member in session.members() {
                    let in_reply_to = if member.id == membership.member {
                        request_id
                    } else {
                        0
                    };
                    connections.send_to_member(
                        &member.id,
                        AuthorityEvent {
                            in_reply_to,
                            event: Some(Event::GameStarted(SessionStateNotice {
                                state: state_proto(&view),
                            })),
                        },
                    );
                }
                Ok(view)
            })?;

        info!(session = %view.id, members = view.members.len(), "session started");
        if view.is_public {
            self.announce(DiscoveryNotice::Unlisted {
                id: view.id.clone(),
                reason: UnlistReason::Started,
            });
        }
        Ok(view)
    }

    /// Leave the caller's session, if any. Always acknowledged.
    pub fn leave_session(&self, conn: ConnId, request_id: u64) -> Option<Member> {
        let removed = self.leave_current(conn);
        self.reply(conn, request_id, Event::SessionLeft(SessionLeft {}));
        removed
    }

    /// Advance the canonical counter and broadcast it to every member.
    pub fn increment_counter(&self, conn: ConnId, request_id: u64) -> Result<u64, AuthorityError> {
        let membership = self.membership(conn)?;
        let Mutation { value: counter, .. } =
            self.registry.with_session(&membership.session, |session| {
                let counter = session.increment()?;
                let connections = lock(&self.connections);
                for member in session.members() {
                    let in_reply_to = if member.id == membership.member {
                        request_id
                    } else {
                        0
                    };
                    connections.send_to_member(
                        &member.id,
                        AuthorityEvent {
                            in_reply_to,
                            event: Some(Event::CounterUpdated(CounterUpdated {
                                counter,
                                updated_by: membership.member.to_string(),
                            })),
                        },
                    );
                }
                Ok(counter)
            })?;

        debug!(session = %membership.session, counter, "counter incremented");
        Ok(counter)
    }

    /// Current state of the caller's session.
    pub fn session_state(&self, conn: ConnId) -> Result<SessionView, AuthorityError> {
        let membership = self.membership(conn)?;
        self.registry
            .view(&membership.session)
            .ok_or(AuthorityError::NotInSession)
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn membership(&self, conn: ConnId) -> Result<Membership, AuthorityError> {
        lock(&self.connections)
            .membership(conn)
            .ok_or(AuthorityError::NotInSession)
    }

    fn leave_current(&self, conn: ConnId) -> Option<Member> {
        let membership = lock(&self.connections).unbind(conn)?;
        self.remove_member(&membership)
    }

    /// Remove a member, notify the rest, destroy the session if it emptied.
    fn remove_member(&self, membership: &Membership) -> Option<Member> {
        let result = self.registry.with_session(&membership.session, |session| {
            let removed = session.remove_member(&membership.member);
            if let Some(member) = &removed {
                broadcast_except(
                    &lock(&self.connections),
                    session,
                    &member.id,
                    Event::MemberLeft(member_notice(member)),
                );
            }
            Ok(removed)
        });

        // The session may already be gone; nothing to undo then.
        let Ok(mutation) = result else {
            return None;
        };

        if let Some(member) = &mutation.value {
            info!(session = %membership.session, member = %member.id, "member left");
        }
        if let Some(destroyed) = mutation.destroyed {
            info!(session = %destroyed.id, "session destroyed");
            if destroyed.was_public {
                self.announce(DiscoveryNotice::Unlisted {
                    id: destroyed.id,
                    reason: UnlistReason::Emptied,
                });
            }
        }
        mutation.value
    }

    fn reply(&self, conn: ConnId, request_id: u64, event: Event) {
        lock(&self.connections).send(conn, AuthorityEvent::reply(request_id, event));
    }

    fn reply_error(&self, conn: ConnId, request_id: u64, err: &AuthorityError) {
        lock(&self.connections).send(
            conn,
            AuthorityEvent::error(request_id, err.kind(), err.to_string()),
        );
    }

    fn announce(&self, notice: DiscoveryNotice) {
        match &notice {
            DiscoveryNotice::Listed { id, .. } => info!(session = %id, "discovery: listed"),
            DiscoveryNotice::Unlisted { id, reason } => {
                info!(session = %id, %reason, "discovery: unlisted")
            }
        }
        self.feed.notify(notice);
    }
}

/// Send `event` to every member of `session` except `skip`.
fn broadcast_except(
    connections: &ConnectionTable,
    session: &Session,
    skip: &MemberId,
    event: Event,
) {
    for member in session.members().filter(|m| m.id != *skip) {
        connections.send_to_member(&member.id, AuthorityEvent::broadcast(event.clone()));
    }
}

// ============================================================================
// Tests
// ============================================================================
