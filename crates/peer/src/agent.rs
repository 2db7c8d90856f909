//! Client session agent.
//!
//! One task per joined session owns the `Mirror`, the `MeshManager`, and the
//! authority channel. Everything else talks to it through an `AgentHandle`:
//! commands go in over a queue, and the current view comes back over a
//! watch channel.
//!
//! Every remote input is folded into the mirror through the reconciler, no
//! matter which path it took:
//!
//! | Input | Effect |
//! |---|---|
//! | authority `memberJoined` | merge, forward over mesh, dial |
//! | authority `memberAddressUpdated` | replace address, dial |
//! | authority `gameStarted` | merge, forward over mesh, dial |
//! | authority `memberLeft` | remove, close link, forward over mesh |
//! | authority `counterUpdated` / `sessionState` | merge |
//! | mesh `snapshot` / `memberJoined` / `started` | merge, dial |
//! | mesh `counterIncrement` | counter merge |
//! | mesh `memberLeft` | remove, close link |
//!
//! Mesh-origin messages are never forwarded again. When the authority
//! channel ends, the agent keeps running on its open links.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use rally_state::{Member, MemberId, Mirror, PeerAddress, SessionError, SessionView};
use rally_wire::authority_event::Event;
use rally_wire::authority_request::Request;
use rally_wire::convert::{parse_member_id, required_member, required_state};
use rally_wire::{
    AuthorityEvent, AuthorityRequest, CreateSession, ErrorEvent, ErrorKind, GetSessionState,
    IncrementCounter, JoinSession, LeaveSession, MeshMessage, StartSession,
    UpdateTransportAddress, WireError,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::MeshConfig;
use crate::authority::AuthorityLink;
use crate::mesh::{Direction, MeshEvent, MeshManager};
use crate::transport::PeerTransport;

const COMMAND_QUEUE: usize = 64;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("authority channel unavailable")]
    AuthorityUnavailable,
    #[error("not in a session")]
    NotInSession,
    #[error("authority rejected the request ({kind:?}): {message}")]
    Rejected { kind: ErrorKind, message: String },
    #[error("session agent stopped")]
    Stopped,
    #[error(transparent)]
    State(#[from] SessionError),
    #[error("unexpected authority reply: {0}")]
    Protocol(&'static str),
    #[error(transparent)]
    Wire(#[from] WireError),
}

impl AgentError {
    fn rejected(error: &ErrorEvent) -> Self {
        match error.error_kind() {
            ErrorKind::NotInSession => Self::NotInSession,
            kind => Self::Rejected {
                kind,
                message: error.message.clone(),
            },
        }
    }
}

/// What the agent currently believes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentView {
    pub session: SessionView,
    /// Peers with an open mesh link, sorted.
    pub open_links: Vec<PeerAddress>,
    pub authority_up: bool,
}

type Reply<T> = oneshot::Sender<Result<T, AgentError>>;

enum Command {
    Increment(Reply<u64>),
    Request { request: Request, reply: Reply<Event> },
    Leave(oneshot::Sender<()>),
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable handle to a running agent.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<AgentView>,
    member_id: MemberId,
    local_address: PeerAddress,
}

impl AgentHandle {
    pub fn member_id(&self) -> MemberId {
        self.member_id
    }

    pub fn local_address(&self) -> &PeerAddress {
        &self.local_address
    }

    pub fn view(&self) -> AgentView {
        self.view.borrow().clone()
    }

    /// Wait until the view satisfies `pred`.
    pub async fn wait_for<F>(&self, mut pred: F) -> Result<AgentView, AgentError>
    where
        F: FnMut(&AgentView) -> bool,
    {
        let mut view = self.view.clone();
        let current = view
            .wait_for(|v| pred(v))
            .await
            .map_err(|_| AgentError::Stopped)?;
        Ok(current.clone())
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, AgentError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| AgentError::Stopped)?;
        rx.await.map_err(|_| AgentError::Stopped)?
    }

    async fn request(&self, request: Request) -> Result<Event, AgentError> {
        self.call(|reply| Command::Request { request, reply }).await
    }

    /// Local increment, broadcast to open links. Returns the new value.
    pub async fn increment(&self) -> Result<u64, AgentError> {
        self.call(Command::Increment).await
    }

    /// Ask the authority to increment its canonical counter.
    pub async fn increment_on_authority(&self) -> Result<u64, AgentError> {
        match self.request(Request::IncrementCounter(IncrementCounter {})).await? {
            Event::CounterUpdated(update) => Ok(update.counter),
            _ => Err(AgentError::Protocol("expected counterUpdated")),
        }
    }

    /// Start the session. Only the creator may.
    pub async fn start(&self) -> Result<SessionView, AgentError> {
        match self.request(Request::StartSession(StartSession {})).await? {
            Event::GameStarted(notice) => Ok(required_state(notice.state)?),
            _ => Err(AgentError::Protocol("expected gameStarted")),
        }
    }

    /// Fetch the authority's state and fold it in.
    pub async fn refresh(&self) -> Result<SessionView, AgentError> {
        match self.request(Request::GetSessionState(GetSessionState {})).await? {
            Event::SessionState(notice) => Ok(required_state(notice.state)?),
            _ => Err(AgentError::Protocol("expected sessionState")),
        }
    }

    /// Leave the session, close every link, and stop the agent.
    pub async fn leave(&self) -> Result<(), AgentError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Leave(tx))
            .await
            .map_err(|_| AgentError::Stopped)?;
        rx.await.map_err(|_| AgentError::Stopped)
    }
}

// ============================================================================
// Agent
// ============================================================================

pub struct SessionAgent {
    mirror: Mirror,
    mesh: MeshManager,
    requests: mpsc::UnboundedSender<AuthorityRequest>,
    events: mpsc::UnboundedReceiver<AuthorityEvent>,
    authority_up: bool,
    next_request_id: u64,
    pending: HashMap<u64, Reply<Event>>,
    commands: mpsc::Receiver<Command>,
    view: watch::Sender<AgentView>,
}

impl SessionAgent {
    /// Create a session on the authority and start its agent.
    pub async fn create(
        link: AuthorityLink,
        transport: Arc<dyn PeerTransport>,
        config: MeshConfig,
        name: &str,
        is_public: bool,
    ) -> Result<AgentHandle, AgentError> {
        let request = Request::CreateSession(CreateSession {
            name: name.to_string(),
            is_public,
        });
        Self::enter(link, transport, config, request).await
    }

    /// Join an existing session and start its agent.
    pub async fn join(
        link: AuthorityLink,
        transport: Arc<dyn PeerTransport>,
        config: MeshConfig,
        code: &str,
        name: &str,
    ) -> Result<AgentHandle, AgentError> {
        let request = Request::JoinSession(JoinSession {
            session_id: code.to_string(),
            name: name.to_string(),
        });
        Self::enter(link, transport, config, request).await
    }

    async fn enter(
        link: AuthorityLink,
        transport: Arc<dyn PeerTransport>,
        config: MeshConfig,
        request: Request,
    ) -> Result<AgentHandle, AgentError> {
        let AuthorityLink {
            requests,
            mut events,
        } = link;

        const ENTER_ID: u64 = 1;
        requests
            .send(AuthorityRequest::new(ENTER_ID, request))
            .map_err(|_| AgentError::AuthorityUnavailable)?;

        // Broadcasts that race ahead of the reply are replayed afterwards.
        let mut backlog = VecDeque::new();
        let (member_id, state) = loop {
            let event = events.recv().await.ok_or(AgentError::AuthorityUnavailable)?;
            if event.in_reply_to != ENTER_ID {
                backlog.push_back(event);
                continue;
            }
            match event.event {
                Some(Event::SessionCreated(entered)) | Some(Event::SessionJoined(entered)) => {
                    let member_id = parse_member_id("member_id", &entered.member_id)?;
                    break (member_id, required_state(entered.state)?);
                }
                Some(Event::Error(error)) => return Err(AgentError::rejected(&error)),
                _ => return Err(AgentError::Protocol("expected sessionCreated or sessionJoined")),
            }
        };

        let local_address = transport.local_address().clone();
        let mut mirror = Mirror::from_view(member_id, state);
        mirror.set_local_address(local_address.clone());
        info!(
            session = %mirror.id(),
            member = %member_id,
            members = mirror.member_count(),
            "entered session"
        );

        let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let mut agent = Self {
            mesh: MeshManager::new(transport, config),
            requests,
            events,
            authority_up: true,
            next_request_id: ENTER_ID + 1,
            pending: HashMap::new(),
            commands,
            view: watch::channel(AgentView {
                session: mirror.view(),
                open_links: Vec::new(),
                authority_up: true,
            })
            .0,
            mirror,
        };

        let report = agent.next_id();
        agent.send_request(
            report,
            Request::UpdateTransportAddress(UpdateTransportAddress {
                address: local_address.as_str().to_string(),
            }),
        );

        agent.mesh.start_accepting();
        for address in agent.mirror.peer_addresses() {
            agent.mesh.connect(&address);
        }
        while let Some(event) = backlog.pop_front() {
            agent.on_authority_event(event);
        }
        agent.publish();

        let handle = AgentHandle {
            commands: command_tx,
            view: agent.view.subscribe(),
            member_id,
            local_address,
        };
        tokio::spawn(agent.run());
        Ok(handle)
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.on_command(command) {
                            return;
                        }
                    }
                    None => {
                        self.shutdown();
                        return;
                    }
                },
                event = self.events.recv(), if self.authority_up => match event {
                    Some(event) => self.on_authority_event(event),
                    None => self.authority_lost(),
                },
                Some(event) = self.mesh.next_event() => self.on_mesh_event(event),
            }
            self.publish();
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    fn send_request(&mut self, request_id: u64, request: Request) -> bool {
        if !self.authority_up {
            return false;
        }
        if self.requests.send(AuthorityRequest::new(request_id, request)).is_err() {
            self.authority_lost();
            return false;
        }
        true
    }

    fn publish(&self) {
        let next = AgentView {
            session: self.mirror.view(),
            open_links: self.mesh.open_links(),
            authority_up: self.authority_up,
        };
        self.view.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn shutdown(&mut self) {
        let id = self.next_id();
        self.send_request(id, Request::LeaveSession(LeaveSession {}));
        self.mesh.close_all();
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(AgentError::Stopped));
        }
        info!(
            session = %self.mirror.id(),
            member = %self.mirror.local_member_id(),
            "left session"
        );
    }

    fn authority_lost(&mut self) {
        if !self.authority_up {
            return;
        }
        self.authority_up = false;
        warn!(
            session = %self.mirror.id(),
            open_links = self.mesh.open_links().len(),
            "authority channel lost, continuing on mesh links only"
        );
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(AgentError::AuthorityUnavailable));
        }
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    /// Returns false once the agent has shut down.
    fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::Increment(reply) => {
                let result = self.mirror.local_increment().map_err(AgentError::from);
                if let Ok(counter) = result {
                    let sent = self.mesh.broadcast(&MeshMessage::CounterIncrement {
                        counter,
                        actor: self.mirror.local_member_id(),
                    });
                    debug!(counter, links = sent, "local increment");
                }
                let _ = reply.send(result);
            }
            Command::Request { request, reply } => {
                let id = self.next_id();
                if self.send_request(id, request) {
                    self.pending.insert(id, reply);
                } else {
                    let _ = reply.send(Err(AgentError::AuthorityUnavailable));
                }
            }
            Command::Leave(done) => {
                self.shutdown();
                let _ = done.send(());
                return false;
            }
        }
        true
    }

    // ------------------------------------------------------------------------
    // Authority events
    // ------------------------------------------------------------------------

    fn on_authority_event(&mut self, event: AuthorityEvent) {
        let AuthorityEvent { in_reply_to, event } = event;
        let Some(event) = event else {
            warn!("authority event without payload");
            return;
        };

        if let Err(e) = self.apply_authority_event(&event) {
            warn!(error = %e, kind = event_name(&event), "bad authority event");
        }

        if in_reply_to == 0 {
            return;
        }
        match self.pending.remove(&in_reply_to) {
            Some(reply) => {
                let result = match event {
                    Event::Error(error) => Err(AgentError::rejected(&error)),
                    other => Ok(other),
                };
                let _ = reply.send(result);
            }
            None => {
                if let Event::Error(error) = &event {
                    warn!(
                        request = in_reply_to,
                        message = %error.message,
                        "authority rejected request"
                    );
                }
            }
        }
    }

    fn apply_authority_event(&mut self, event: &Event) -> Result<(), WireError> {
        match event {
            Event::MemberJoined(notice) => {
                let member = required_member(notice.member.clone())?;
                info!(
                    session = %self.mirror.id(),
                    member = %member.id,
                    name = %member.name,
                    "member joined"
                );
                self.mesh.broadcast(&MeshMessage::MemberJoined(member.clone()));
                self.mirror.apply_member_joined(member.clone());
                self.dial([member.id]);
            }
            Event::MemberAddressUpdated(notice) => {
                let member = required_member(notice.member.clone())?;
                let outcome = self.mirror.apply_address_update(member);
                self.dial(outcome.addresses_learned.iter().map(|m| m.id));
            }
            Event::GameStarted(notice) => {
                let state = required_state(notice.state.clone())?;
                self.mesh.broadcast(&MeshMessage::Started(state.clone()));
                self.apply_started(state);
            }
            Event::MemberLeft(notice) => {
                let member = required_member(notice.member.clone())?;
                self.member_departed(&member);
                self.mesh.broadcast(&MeshMessage::MemberLeft(member));
            }
            Event::CounterUpdated(update) => {
                self.merge_counter(update.counter);
            }
            Event::SessionState(notice) => {
                let state = required_state(notice.state.clone())?;
                let ids: Vec<_> = state.members.iter().map(|m| m.id).collect();
                self.mirror
                    .apply_snapshot(state.members, state.counter, state.status);
                self.dial(ids);
            }
            Event::SessionCreated(_)
            | Event::SessionJoined(_)
            | Event::SessionLeft(_)
            | Event::Error(_) => {}
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Mesh events
    // ------------------------------------------------------------------------

    fn on_mesh_event(&mut self, event: MeshEvent) {
        match event {
            MeshEvent::LinkOpened {
                remote,
                direction: Direction::Outbound,
            } => {
                let snapshot = MeshMessage::Snapshot {
                    members: self.mirror.members().cloned().collect(),
                    counter: self.mirror.counter(),
                    status: self.mirror.status(),
                };
                if let Err(e) = self.mesh.send(&remote, &snapshot) {
                    warn!(peer = %remote, error = %e, "snapshot send failed");
                }
            }
            MeshEvent::LinkOpened { .. } | MeshEvent::LinkClosed { .. } => {}
            MeshEvent::Message { remote, message } => {
                debug!(peer = %remote, tag = message.tag(), "mesh message");
                self.on_mesh_message(message);
            }
        }
    }

    fn on_mesh_message(&mut self, message: MeshMessage) {
        match message {
            MeshMessage::Snapshot {
                members,
                counter,
                status,
            } => {
                let ids: Vec<_> = members.iter().map(|m| m.id).collect();
                let outcome = self.mirror.apply_snapshot(members, counter, status);
                debug!(
                    counter = self.mirror.counter(),
                    added = outcome.members_added.len(),
                    "snapshot merged"
                );
                if outcome.started {
                    info!(session = %self.mirror.id(), "session started (via mesh)");
                }
                self.dial(ids);
            }
            MeshMessage::CounterIncrement { counter, actor } => {
                debug!(counter, actor = %actor, "remote increment");
                self.merge_counter(counter);
            }
            MeshMessage::MemberJoined(member) => {
                let id = member.id;
                let outcome = self.mirror.apply_member_joined(member);
                for added in &outcome.members_added {
                    info!(member = %added.id, name = %added.name, "member joined (via mesh)");
                }
                self.dial([id]);
            }
            MeshMessage::MemberLeft(member) => self.member_departed(&member),
            MeshMessage::Started(state) => self.apply_started(state),
        }
    }

    // ------------------------------------------------------------------------
    // Shared folds
    // ------------------------------------------------------------------------

    fn merge_counter(&mut self, counter: u64) {
        let before = self.mirror.counter();
        if self.mirror.merge_counter(counter) {
            debug!(from = before, to = counter, "counter advanced");
        }
    }

    fn apply_started(&mut self, state: SessionView) {
        let ids: Vec<_> = state.members.iter().map(|m| m.id).collect();
        let outcome = self.mirror.apply_started_state(state);
        if outcome.started {
            info!(session = %self.mirror.id(), "session started");
        }
        self.dial(ids);
    }

    fn member_departed(&mut self, member: &Member) {
        let Some(removed) = self.mirror.apply_member_left(&member.id) else {
            return;
        };
        info!(
            session = %self.mirror.id(),
            member = %removed.id,
            name = %removed.name,
            "member left"
        );
        if let Some(address) = removed
            .transport_address
            .as_ref()
            .or(member.transport_address.as_ref())
        {
            self.mesh.close(address);
        }
    }

    /// Dial the known address of each listed member. Members without an
    /// address yet are skipped until one arrives.
    fn dial(&mut self, ids: impl IntoIterator<Item = MemberId>) {
        for id in ids {
            if id == self.mirror.local_member_id() {
                continue;
            }
            let address = self
                .mirror
                .member(&id)
                .and_then(|m| m.transport_address.clone());
            if let Some(address) = address {
                self.mesh.connect(&address);
            }
        }
    }
}

fn event_name(event: &Event) -> &'static str {
    AuthorityEvent::broadcast(event.clone()).kind_name()
}
