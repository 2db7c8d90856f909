//! End-to-end sessions: an in-process authority, several agents, and an
//! in-memory peer network.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rally_peer::memory::{MemoryNetwork, MemoryTransport};
use rally_peer::tcp::TcpTransport;
use rally_peer::{
    AgentError, AgentHandle, AgentView, AuthorityLink, MeshConfig, PeerLink, PeerTransport,
    SessionAgent,
};
use rally_server::discovery::{BroadcastFeed, DiscoveryNotice, UnlistReason};
use rally_server::local::{LocalChannel, attach};
use rally_server::{Authority, AuthorityConfig, net};
use rally_state::{PeerAddress, SessionError, Status};
use rally_wire::authority_event::Event;
use rally_wire::authority_request::Request;
use rally_wire::frame::DEFAULT_MAX_FRAME_LEN;
use rally_wire::{
    AuthorityRequest, ErrorKind, JoinSession, LeaveSession, MeshMessage, UpdateTransportAddress,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// How long a link must stay silent before it counts as drained.
const QUIET: Duration = Duration::from_millis(200);

struct World {
    authority: Arc<Authority>,
    notices: broadcast::Receiver<DiscoveryNotice>,
    net: MemoryNetwork,
}

impl World {
    fn new() -> Self {
        let feed = BroadcastFeed::default();
        let notices = feed.subscribe();
        Self {
            authority: Arc::new(Authority::new(AuthorityConfig::default(), Arc::new(feed))),
            notices,
            net: MemoryNetwork::new(),
        }
    }

    fn link(&self) -> AuthorityLink {
        let LocalChannel {
            requests, events, ..
        } = attach(&self.authority);
        AuthorityLink::new(requests, events)
    }

    async fn create(&self, name: &str, is_public: bool) -> AgentHandle {
        let transport = self.net.endpoint(&format!("mem://{name}")).unwrap();
        SessionAgent::create(self.link(), Arc::new(transport), config(), name, is_public)
            .await
            .unwrap()
    }

    async fn join(&self, code: &str, name: &str) -> Result<AgentHandle, AgentError> {
        self.join_via(self.link(), code, name).await
    }

    async fn join_via(
        &self,
        link: AuthorityLink,
        code: &str,
        name: &str,
    ) -> Result<AgentHandle, AgentError> {
        let transport = self.net.endpoint(&format!("mem://{name}")).unwrap();
        SessionAgent::join(link, Arc::new(transport), config(), code, name).await
    }

    async fn notice(&mut self) -> DiscoveryNotice {
        tokio::time::timeout(WAIT, self.notices.recv())
            .await
            .expect("discovery notice")
            .unwrap()
    }
}

fn config() -> MeshConfig {
    MeshConfig {
        connect_timeout_ms: 500,
        connect_attempts: 2,
        backoff_base_ms: 20,
        ..Default::default()
    }
}

fn addr(s: &str) -> PeerAddress {
    PeerAddress::new(s).unwrap()
}

fn code(handle: &AgentHandle) -> String {
    handle.view().session.id.to_string()
}

async fn settle<F>(handle: &AgentHandle, pred: F) -> AgentView
where
    F: FnMut(&AgentView) -> bool,
{
    tokio::time::timeout(WAIT, handle.wait_for(pred))
        .await
        .expect("view did not settle")
        .unwrap()
}

/// Wait until every handle has an open link to every other.
async fn meshed(handles: &[&AgentHandle]) {
    let peers = handles.len() - 1;
    for handle in handles {
        settle(handle, |v| v.open_links.len() == peers).await;
    }
}

/// Authority link that can be cut on the participant's side while the
/// authority keeps the connection, and so the membership, alive.
fn severable_link(
    authority: &Arc<Authority>,
) -> (AuthorityLink, oneshot::Sender<()>, JoinHandle<LocalChannel>) {
    let mut local = attach(authority);
    let (request_tx, mut request_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cut_tx, mut cut_rx) = oneshot::channel();

    let relay = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut cut_rx => break,
                Some(request) = request_rx.recv() => {
                    let _ = local.requests.send(request);
                }
                Some(event) = local.events.recv() => {
                    let _ = event_tx.send(event);
                }
            }
        }
        local
    });
    (AuthorityLink::new(request_tx, event_rx), cut_tx, relay)
}

/// A member with no agent behind it: its own authority channel and a bare
/// memory endpoint, driven step by step so tests can see exactly what each
/// agent puts on the wire.
struct Bystander {
    transport: MemoryTransport,
    channel: LocalChannel,
    links: HashMap<PeerAddress, PeerLink>,
}

impl Bystander {
    /// Join `code` and report a transport address, which makes every agent
    /// in the session dial in.
    async fn join(world: &World, code: &str, name: &str) -> Self {
        let transport = world.net.endpoint(&format!("mem://{name}")).unwrap();
        let mut channel = attach(&world.authority);

        let join = Request::JoinSession(JoinSession {
            session_id: code.to_string(),
            name: name.to_string(),
        });
        channel.requests.send(AuthorityRequest::new(1, join)).unwrap();
        loop {
            let event = timeout(WAIT, channel.events.recv())
                .await
                .expect("join reply")
                .unwrap();
            if event.in_reply_to == 1 {
                assert!(matches!(event.event, Some(Event::SessionJoined(_))));
                break;
            }
        }

        let report = Request::UpdateTransportAddress(UpdateTransportAddress {
            address: transport.local_address().as_str().to_string(),
        });
        channel.requests.send(AuthorityRequest::new(2, report)).unwrap();
        Self {
            transport,
            channel,
            links: HashMap::new(),
        }
    }

    /// Accept `count` inbound links.
    async fn accept_links(&mut self, count: usize) {
        for _ in 0..count {
            let link = timeout(WAIT, self.transport.accept())
                .await
                .expect("inbound link")
                .unwrap();
            self.links.insert(link.remote.clone(), link);
        }
    }

    /// Next message from `remote`, or `None` once that link has closed.
    async fn next_from(&mut self, remote: &PeerAddress) -> Option<MeshMessage> {
        let link = self.links.get_mut(remote).expect("no link from that peer");
        match timeout(WAIT, link.receiver.recv()).await.expect("mesh message") {
            Some(Ok(bytes)) => Some(MeshMessage::decode(&bytes).unwrap()),
            Some(Err(e)) => panic!("link from {remote} failed: {e}"),
            None => None,
        }
    }

    /// Everything `remote` has sent so far.
    async fn drain_from(&mut self, remote: &PeerAddress) -> Vec<MeshMessage> {
        let link = self.links.get_mut(remote).expect("no link from that peer");
        let mut messages = Vec::new();
        while let Ok(Some(Ok(bytes))) = timeout(QUIET, link.receiver.recv()).await {
            messages.push(MeshMessage::decode(&bytes).unwrap());
        }
        messages
    }

    /// Leave through the authority while every mesh link stays up.
    fn leave(&self) {
        let leave = Request::LeaveSession(LeaveSession {});
        self.channel.requests.send(AuthorityRequest::new(3, leave)).unwrap();
    }
}

#[tokio::test]
async fn test_create_join_start_increment() {
    let mut world = World::new();

    let alice = world.create("alice", true).await;
    let view = alice.view().session;
    assert_eq!(view.status, Status::Waiting);
    assert_eq!(view.counter, 0);
    assert_eq!(view.members.len(), 1);
    assert_eq!(view.creator_id, alice.member_id());
    assert!(matches!(world.notice().await, DiscoveryNotice::Listed { member_count: 1, .. }));

    let bob = world.join(&code(&alice), "bob").await.unwrap();
    let joined = bob.view().session;
    let names: Vec<_> = joined.members.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, ["alice", "bob"]);
    settle(&alice, |v| v.session.members.len() == 2).await;
    meshed(&[&alice, &bob]).await;
    assert_eq!(alice.view().open_links, vec![addr("mem://bob")]);
    assert_eq!(bob.view().open_links, vec![addr("mem://alice")]);

    let started = alice.start().await.unwrap();
    assert_eq!(started.status, Status::Playing);
    settle(&bob, |v| v.session.status == Status::Playing).await;
    match world.notice().await {
        DiscoveryNotice::Unlisted { reason, .. } => assert_eq!(reason, UnlistReason::Started),
        other => panic!("unexpected notice {other:?}"),
    }

    assert_eq!(alice.increment().await.unwrap(), 1);
    settle(&bob, |v| v.session.counter == 1).await;

    assert_eq!(bob.increment().await.unwrap(), 2);
    settle(&alice, |v| v.session.counter == 2).await;
}

#[tokio::test]
async fn test_start_rules() {
    let world = World::new();
    let alice = world.create("alice", false).await;
    let bob = world.join(&code(&alice), "bob").await.unwrap();

    let err = bob.start().await.unwrap_err();
    assert!(matches!(
        err,
        AgentError::Rejected {
            kind: ErrorKind::PermissionDenied,
            ..
        }
    ));

    alice.start().await.unwrap();
    let err = alice.start().await.unwrap_err();
    assert!(matches!(
        err,
        AgentError::Rejected {
            kind: ErrorKind::AlreadyStarted,
            ..
        }
    ));

    // Late joiners are turned away.
    let err = world.join(&code(&alice), "carol").await.unwrap_err();
    assert!(matches!(
        err,
        AgentError::Rejected {
            kind: ErrorKind::AlreadyStarted,
            ..
        }
    ));
}

#[tokio::test]
async fn test_join_unknown_session() {
    let world = World::new();
    let err = world.join("NOPE1234", "bob").await.unwrap_err();
    assert!(matches!(
        err,
        AgentError::Rejected {
            kind: ErrorKind::NotFound,
            ..
        }
    ));
}

#[tokio::test]
async fn test_create_rejects_blank_name() {
    let world = World::new();
    let transport = world.net.endpoint("mem://blank").unwrap();
    let err = SessionAgent::create(world.link(), Arc::new(transport), config(), "   ", true)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AgentError::Rejected {
            kind: ErrorKind::Validation,
            ..
        }
    ));
    assert!(world.authority.registry().is_empty());
}

#[tokio::test]
async fn test_local_increment_requires_playing() {
    let world = World::new();
    let alice = world.create("alice", false).await;
    assert!(matches!(
        alice.increment().await,
        Err(AgentError::State(SessionError::NotStarted))
    ));
}

#[tokio::test]
async fn test_three_way_mesh() {
    let world = World::new();
    let alice = world.create("alice", false).await;
    let bob = world.join(&code(&alice), "bob").await.unwrap();
    let carol = world.join(&code(&alice), "carol").await.unwrap();

    meshed(&[&alice, &bob, &carol]).await;
    for handle in [&alice, &bob, &carol] {
        settle(handle, |v| v.session.members.len() == 3).await;
    }

    alice.start().await.unwrap();
    settle(&carol, |v| v.session.status == Status::Playing).await;
    let value = carol.increment().await.unwrap();
    for handle in [&alice, &bob] {
        settle(handle, |v| v.session.counter >= value).await;
    }
}

#[tokio::test]
async fn test_member_leave_closes_link_and_destroys_empty_session() {
    let mut world = World::new();
    let alice = world.create("alice", true).await;
    world.notice().await;
    let bob = world.join(&code(&alice), "bob").await.unwrap();
    meshed(&[&alice, &bob]).await;

    bob.leave().await.unwrap();
    let view = settle(&alice, |v| v.session.members.len() == 1 && v.open_links.is_empty()).await;
    assert_eq!(view.session.members[0].id, alice.member_id());
    assert!(matches!(bob.increment().await, Err(AgentError::Stopped)));

    alice.leave().await.unwrap();
    match world.notice().await {
        DiscoveryNotice::Unlisted { reason, .. } => assert_eq!(reason, UnlistReason::Emptied),
        other => panic!("unexpected notice {other:?}"),
    }
    assert!(world.authority.registry().is_empty());
}

#[tokio::test]
async fn test_authority_increment_reaches_everyone() {
    let world = World::new();
    let alice = world.create("alice", false).await;
    let bob = world.join(&code(&alice), "bob").await.unwrap();

    let err = alice.increment_on_authority().await.unwrap_err();
    assert!(matches!(
        err,
        AgentError::Rejected {
            kind: ErrorKind::NotStarted,
            ..
        }
    ));

    alice.start().await.unwrap();
    assert_eq!(bob.increment_on_authority().await.unwrap(), 1);
    settle(&alice, |v| v.session.counter == 1).await;

    let state = alice.refresh().await.unwrap();
    assert_eq!(state.counter, 1);
    assert_eq!(state.status, Status::Playing);
}

#[tokio::test]
async fn test_degraded_mode_after_authority_loss() {
    let world = World::new();
    let alice = world.create("alice", false).await;
    let (link, cut, relay) = severable_link(&world.authority);
    let bob = world.join_via(link, &code(&alice), "bob").await.unwrap();
    meshed(&[&alice, &bob]).await;
    alice.start().await.unwrap();
    settle(&bob, |v| v.session.status == Status::Playing).await;

    cut.send(()).unwrap();
    let _authority_side = relay.await.unwrap();
    settle(&bob, |v| !v.authority_up).await;

    assert!(matches!(bob.refresh().await, Err(AgentError::AuthorityUnavailable)));

    // Existing mesh links keep carrying gameplay state.
    let value = bob.increment().await.unwrap();
    settle(&alice, |v| v.session.counter == value).await;
    assert_eq!(bob.view().open_links, vec![addr("mem://alice")]);
}

#[tokio::test]
async fn test_opening_side_sends_one_snapshot() {
    let world = World::new();
    let alice = world.create("alice", false).await;
    let bob = world.join(&code(&alice), "bob").await.unwrap();
    meshed(&[&alice, &bob]).await;

    let mut dave = Bystander::join(&world, &code(&alice), "dave").await;
    dave.accept_links(2).await;
    let (a, b) = (addr("mem://alice"), addr("mem://bob"));

    for remote in [&a, &b] {
        match dave.next_from(remote).await {
            Some(MeshMessage::Snapshot {
                members,
                counter,
                status,
            }) => {
                let mut names: Vec<_> = members.iter().map(|m| m.name.as_str()).collect();
                names.sort_unstable();
                assert_eq!(names, ["alice", "bob", "dave"]);
                assert_eq!(counter, 0);
                assert_eq!(status, Status::Waiting);
            }
            other => panic!("expected a snapshot from {remote}, got {other:?}"),
        }
    }

    alice.start().await.unwrap();
    settle(&bob, |v| v.session.status == Status::Playing).await;
    assert_eq!(alice.increment().await.unwrap(), 1);

    // Later traffic on the same link is ordinary gossip.
    let rest = dave.drain_from(&a).await;
    assert!(rest.iter().any(|m| matches!(m, MeshMessage::Started(_))));
    assert!(
        rest.iter()
            .any(|m| matches!(m, MeshMessage::CounterIncrement { counter: 1, .. }))
    );
    assert!(!rest.iter().any(|m| matches!(m, MeshMessage::Snapshot { .. })));
}

#[tokio::test]
async fn test_isolated_member_catches_up_from_snapshot() {
    let world = World::new();
    let alice = world.create("alice", false).await;
    let bob = world.join(&code(&alice), "bob").await.unwrap();
    let (link, cut, relay) = severable_link(&world.authority);
    let carol = world.join_via(link, &code(&alice), "carol").await.unwrap();
    meshed(&[&alice, &bob, &carol]).await;

    cut.send(()).unwrap();
    let _authority_side = relay.await.unwrap();
    settle(&carol, |v| !v.authority_up).await;

    let carol_addr = addr("mem://carol");
    world.net.isolate(&carol_addr);
    settle(&carol, |v| v.open_links.is_empty()).await;
    for handle in [&alice, &bob] {
        settle(handle, |v| v.open_links.len() == 1).await;
    }

    // Start redials carol; those dials fail while she is isolated.
    alice.start().await.unwrap();
    for _ in 0..3 {
        alice.increment().await.unwrap();
    }
    settle(&bob, |v| v.session.status == Status::Playing && v.session.counter == 3).await;
    let behind = carol.view().session;
    assert_eq!(behind.status, Status::Waiting);
    assert_eq!(behind.counter, 0);

    // Nothing is broadcast after this point, so whatever link reaches carol
    // first can only bring the state in its opening snapshot.
    world.net.heal(&carol_addr);
    alice.refresh().await.unwrap();
    let view = settle(&carol, |v| {
        v.session.status == Status::Playing && v.session.counter == 3
    })
    .await;
    assert!(!view.authority_up);
}

#[tokio::test]
async fn test_member_left_forwarded_to_member_without_authority() {
    let world = World::new();
    let alice = world.create("alice", false).await;
    let (link, cut, relay) = severable_link(&world.authority);
    let bob = world.join_via(link, &code(&alice), "bob").await.unwrap();
    meshed(&[&alice, &bob]).await;

    let mut dave = Bystander::join(&world, &code(&alice), "dave").await;
    dave.accept_links(2).await;
    let mut carol = Bystander::join(&world, &code(&alice), "carol").await;
    carol.accept_links(2).await;
    for handle in [&alice, &bob] {
        settle(handle, |v| v.session.members.len() == 4 && v.open_links.len() == 3).await;
    }

    cut.send(()).unwrap();
    let _authority_side = relay.await.unwrap();
    settle(&bob, |v| !v.authority_up).await;

    let (a, b) = (addr("mem://alice"), addr("mem://bob"));
    dave.drain_from(&b).await;

    // Carol's mesh links stay up; only alice hears the leave from the
    // authority, and bob only through her.
    carol.leave();
    let view = settle(&bob, |v| {
        v.session.members.len() == 3 && !v.open_links.contains(&addr("mem://carol"))
    })
    .await;
    assert!(view.session.members.iter().all(|m| m.name != "carol"));
    assert!(!view.authority_up);

    // Bob tore down his link to carol.
    while carol.next_from(&b).await.is_some() {}

    let from_alice = dave.drain_from(&a).await;
    assert!(
        from_alice
            .iter()
            .any(|m| matches!(m, MeshMessage::MemberLeft(member) if member.name == "carol"))
    );
    let from_bob = dave.drain_from(&b).await;
    assert!(
        !from_bob
            .iter()
            .any(|m| matches!(m, MeshMessage::MemberLeft(_))),
        "forwarded event was forwarded again: {from_bob:?}"
    );
}

#[tokio::test]
async fn test_concurrent_increments_converge() {
    let world = World::new();
    let alice = world.create("alice", false).await;
    let bob = world.join(&code(&alice), "bob").await.unwrap();
    meshed(&[&alice, &bob]).await;
    alice.start().await.unwrap();
    settle(&bob, |v| v.session.status == Status::Playing).await;

    let (a, b) = tokio::join!(alice.increment(), bob.increment());
    let top = a.unwrap().max(b.unwrap());

    // Max-merge: both settle on the highest value either produced, which
    // may absorb one of the two increments.
    for handle in [&alice, &bob] {
        let view = settle(handle, |v| v.session.counter == top).await;
        assert!((1..=2).contains(&view.session.counter));
    }
}

async fn tcp_peer() -> TcpTransport {
    TcpTransport::bind("127.0.0.1:0".parse().unwrap(), None, DEFAULT_MAX_FRAME_LEN)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_tcp_end_to_end() {
    let authority_config = AuthorityConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        ..Default::default()
    };
    let authority = Arc::new(Authority::new(
        authority_config,
        Arc::new(BroadcastFeed::default()),
    ));
    let listener = net::bind(&authority).await.unwrap();
    let authority_addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(net::serve(Arc::clone(&authority), listener));

    let link = AuthorityLink::connect(&authority_addr, DEFAULT_MAX_FRAME_LEN)
        .await
        .unwrap();
    let alice = SessionAgent::create(link, Arc::new(tcp_peer().await), config(), "alice", true)
        .await
        .unwrap();

    let link = AuthorityLink::connect(&authority_addr, DEFAULT_MAX_FRAME_LEN)
        .await
        .unwrap();
    let bob = SessionAgent::join(link, Arc::new(tcp_peer().await), config(), &code(&alice), "bob")
        .await
        .unwrap();

    meshed(&[&alice, &bob]).await;
    assert_eq!(alice.view().open_links, vec![bob.local_address().clone()]);
    alice.start().await.unwrap();
    settle(&bob, |v| v.session.status == Status::Playing).await;
    bob.increment().await.unwrap();
    settle(&alice, |v| v.session.counter == 1).await;
}
