//! Peer mesh manager.
//!
//! Keeps at most one link per remote address. Connects, accepts, and reads
//! run as independent tasks that report back through one internal queue;
//! the owner drains that queue with [`MeshManager::next_event`] and is the
//! only code that touches the link table.
//!
//! Link lifecycle: `Connecting -> Open -> {Closed | Errored}`. Closed and
//! errored links are dropped from the table immediately.
//!
//! When both sides dial each other at once, each side keeps the link that
//! was initiated by the lower of the two addresses and drops the other.
//! Every link carries a `LinkId`, and reports from a superseded link are
//! ignored.

use std::collections::HashMap;
use std::sync::Arc;

use rally_state::PeerAddress;
use rally_wire::MeshMessage;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::MeshConfig;
use crate::transport::{LinkReceiver, LinkSender, PeerLink, PeerTransport, TransportError};

/// Identifies one link instance. Never reused within a manager.
pub type LinkId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Open,
    Closed,
    Errored,
}

/// Which side initiated a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// What the owner of the mesh needs to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    /// A link reached `Open`. The outbound side sends the snapshot.
    LinkOpened {
        remote: PeerAddress,
        direction: Direction,
    },
    /// A decoded payload arrived.
    Message {
        remote: PeerAddress,
        message: MeshMessage,
    },
    /// A link left the table. `state` is `Closed` or `Errored`.
    LinkClosed {
        remote: PeerAddress,
        state: LinkState,
        error: Option<TransportError>,
    },
}

/// Reports from background tasks.
enum Note {
    Connected { id: LinkId, link: PeerLink },
    ConnectFailed { id: LinkId, remote: PeerAddress, error: TransportError },
    Accepted { link: PeerLink },
    AcceptStopped { error: TransportError },
    Frame { id: LinkId, remote: PeerAddress, bytes: Vec<u8> },
    Ended { id: LinkId, remote: PeerAddress, error: Option<TransportError> },
}

struct LinkEntry {
    id: LinkId,
    state: LinkState,
    direction: Direction,
    sender: Option<LinkSender>,
    /// Connect task while connecting, reader task once open.
    task: JoinHandle<()>,
}

pub struct MeshManager {
    transport: Arc<dyn PeerTransport>,
    config: MeshConfig,
    links: HashMap<PeerAddress, LinkEntry>,
    next_link_id: LinkId,
    notes_tx: mpsc::UnboundedSender<Note>,
    notes_rx: mpsc::UnboundedReceiver<Note>,
    accept_task: Option<JoinHandle<()>>,
}

impl MeshManager {
    pub fn new(transport: Arc<dyn PeerTransport>, config: MeshConfig) -> Self {
        let (notes_tx, notes_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            config,
            links: HashMap::new(),
            next_link_id: 0,
            notes_tx,
            notes_rx,
            accept_task: None,
        }
    }

    pub fn local_address(&self) -> &PeerAddress {
        self.transport.local_address()
    }

    /// Current state of the link to `remote`, if any.
    pub fn state(&self, remote: &PeerAddress) -> Option<LinkState> {
        self.links.get(remote).map(|e| e.state)
    }

    /// Addresses with an open link, sorted.
    pub fn open_links(&self) -> Vec<PeerAddress> {
        let mut open: Vec<_> = self
            .links
            .iter()
            .filter(|(_, e)| e.state == LinkState::Open)
            .map(|(addr, _)| addr.clone())
            .collect();
        open.sort();
        open
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    fn next_id(&mut self) -> LinkId {
        self.next_link_id += 1;
        self.next_link_id
    }

    /// Start accepting inbound links. Idempotent.
    pub fn start_accepting(&mut self) {
        if self.accept_task.is_some() {
            return;
        }
        let transport = Arc::clone(&self.transport);
        let notes = self.notes_tx.clone();
        self.accept_task = Some(tokio::spawn(async move {
            loop {
                match transport.accept().await {
                    Ok(link) => {
                        if notes.send(Note::Accepted { link }).is_err() {
                            return;
                        }
                    }
                    Err(error) => {
                        let _ = notes.send(Note::AcceptStopped { error });
                        return;
                    }
                }
            }
        }));
    }

    /// Dial `remote` unless it is us or a link to it already exists.
    ///
    /// Returns true if a new connection attempt was started.
    pub fn connect(&mut self, remote: &PeerAddress) -> bool {
        if remote == self.local_address() || self.links.contains_key(remote) {
            return false;
        }

        let id = self.next_id();
        let task = tokio::spawn(dial(
            Arc::clone(&self.transport),
            remote.clone(),
            self.config.clone(),
            id,
            self.notes_tx.clone(),
        ));
        self.links.insert(
            remote.clone(),
            LinkEntry {
                id,
                state: LinkState::Connecting,
                direction: Direction::Outbound,
                sender: None,
                task,
            },
        );
        info!(peer = %remote, link = id, "link connecting");
        true
    }

    /// Send one message to one peer.
    pub fn send(&self, remote: &PeerAddress, message: &MeshMessage) -> Result<(), TransportError> {
        let sender = self
            .links
            .get(remote)
            .and_then(|e| e.sender.as_ref())
            .ok_or(TransportError::Closed)?;
        sender.send(message.encode())
    }

    /// Fire-and-forget to every open link. Returns how many accepted it.
    pub fn broadcast(&self, message: &MeshMessage) -> usize {
        let bytes = message.encode();
        let mut sent = 0;
        for (remote, entry) in &self.links {
            let Some(sender) = &entry.sender else {
                continue;
            };
            match sender.send(bytes.clone()) {
                Ok(()) => sent += 1,
                Err(e) => {
                    let tag = message.tag();
                    debug!(peer = %remote, error = %e, tag, "broadcast send failed");
                }
            }
        }
        sent
    }

    /// Close the link to `remote`, if any. No event is emitted.
    pub fn close(&mut self, remote: &PeerAddress) -> bool {
        match self.links.remove(remote) {
            Some(entry) => {
                entry.task.abort();
                info!(peer = %remote, link = entry.id, "link closed locally");
                true
            }
            None => false,
        }
    }

    /// Close every link and stop accepting.
    pub fn close_all(&mut self) {
        for (remote, entry) in self.links.drain() {
            entry.task.abort();
            debug!(peer = %remote, link = entry.id, "link closed locally");
        }
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }

    /// Wait for the next event. Cancel safe.
    pub async fn next_event(&mut self) -> Option<MeshEvent> {
        loop {
            let note = self.notes_rx.recv().await?;
            if let Some(event) = self.process(note) {
                return Some(event);
            }
        }
    }

    fn is_current(&self, remote: &PeerAddress, id: LinkId) -> bool {
        self.links.get(remote).is_some_and(|e| e.id == id)
    }

    fn open(&mut self, id: LinkId, link: PeerLink, direction: Direction) -> MeshEvent {
        let PeerLink {
            remote,
            sender,
            receiver,
        } = link;
        let task = tokio::spawn(read_link(id, remote.clone(), receiver, self.notes_tx.clone()));
        if let Some(old) = self.links.insert(
            remote.clone(),
            LinkEntry {
                id,
                state: LinkState::Open,
                direction,
                sender: Some(sender),
                task,
            },
        ) {
            // Same id means this is the connect task finishing.
            if old.id != id {
                old.task.abort();
                debug!(peer = %remote, old = old.id, new = id, "link superseded");
            }
        }
        info!(peer = %remote, link = id, ?direction, "link open");
        MeshEvent::LinkOpened { remote, direction }
    }

    fn process(&mut self, note: Note) -> Option<MeshEvent> {
        match note {
            Note::Connected { id, link } => {
                if !self.is_current(&link.remote, id) {
                    debug!(peer = %link.remote, link = id, "dropping superseded outbound link");
                    return None;
                }
                Some(self.open(id, link, Direction::Outbound))
            }

            Note::ConnectFailed { id, remote, error } => {
                if !self.is_current(&remote, id) {
                    return None;
                }
                self.links.remove(&remote);
                warn!(peer = %remote, link = id, %error, "link errored while connecting");
                Some(MeshEvent::LinkClosed {
                    remote,
                    state: LinkState::Errored,
                    error: Some(error),
                })
            }

            Note::Accepted { link } => {
                let remote = link.remote.clone();
                if &remote == self.local_address() {
                    return None;
                }
                if let Some(existing) = self.links.get(&remote) {
                    // A redial from the same remote replaces its old link.
                    // Otherwise keep the link initiated by the lower address.
                    let inbound_wins = existing.direction == Direction::Inbound
                        || remote < *self.local_address();
                    if !inbound_wins {
                        debug!(peer = %remote, "dropping duplicate inbound link");
                        return None;
                    }
                }
                let id = self.next_id();
                Some(self.open(id, link, Direction::Inbound))
            }

            Note::AcceptStopped { error } => {
                warn!(%error, "peer transport stopped accepting");
                self.accept_task = None;
                None
            }

            Note::Frame { id, remote, bytes } => {
                if !self.is_current(&remote, id) {
                    return None;
                }
                match MeshMessage::decode(&bytes) {
                    Ok(message) => Some(MeshEvent::Message { remote, message }),
                    Err(e) => {
                        warn!(peer = %remote, error = %e, "undecodable mesh payload");
                        None
                    }
                }
            }

            Note::Ended { id, remote, error } => {
                if !self.is_current(&remote, id) {
                    debug!(peer = %remote, link = id, "ignoring close of superseded link");
                    return None;
                }
                self.links.remove(&remote);
                let state = match &error {
                    None => {
                        info!(peer = %remote, link = id, "link closed");
                        LinkState::Closed
                    }
                    Some(e) => {
                        warn!(peer = %remote, link = id, error = %e, "link errored");
                        LinkState::Errored
                    }
                };
                Some(MeshEvent::LinkClosed {
                    remote,
                    state,
                    error,
                })
            }
        }
    }
}

impl Drop for MeshManager {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// Connect with a per-attempt timeout and exponential backoff between
/// attempts.
async fn dial(
    transport: Arc<dyn PeerTransport>,
    remote: PeerAddress,
    config: MeshConfig,
    id: LinkId,
    notes: mpsc::UnboundedSender<Note>,
) {
    let attempts = config.connect_attempts.max(1);
    let mut delay = config.backoff_base();
    let mut last_error = TransportError::Unreachable(remote.clone());

    for attempt in 1..=attempts {
        match tokio::time::timeout(config.connect_timeout(), transport.connect(&remote)).await {
            Ok(Ok(link)) => {
                let _ = notes.send(Note::Connected { id, link });
                return;
            }
            Ok(Err(e)) => last_error = e,
            Err(_) => last_error = TransportError::Timeout(remote.clone()),
        }
        debug!(peer = %remote, attempt, error = %last_error, "connect attempt failed");
        if attempt < attempts {
            tokio::time::sleep(delay).await;
            delay = delay.saturating_mul(2);
        }
    }

    let _ = notes.send(Note::ConnectFailed {
        id,
        remote,
        error: last_error,
    });
}

async fn read_link(
    id: LinkId,
    remote: PeerAddress,
    mut receiver: LinkReceiver,
    notes: mpsc::UnboundedSender<Note>,
) {
    loop {
        let note = match receiver.recv().await {
            Some(Ok(bytes)) => Note::Frame {
                id,
                remote: remote.clone(),
                bytes,
            },
            Some(Err(error)) => {
                let _ = notes.send(Note::Ended {
                    id,
                    remote,
                    error: Some(error),
                });
                return;
            }
            None => {
                let _ = notes.send(Note::Ended {
                    id,
                    remote,
                    error: None,
                });
                return;
            }
        };
        if notes.send(note).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;
    use rally_state::MemberId;
    use std::time::Duration;

    fn addr(s: &str) -> PeerAddress {
        PeerAddress::new(s).unwrap()
    }

    fn fast_config() -> MeshConfig {
        MeshConfig {
            connect_timeout_ms: 200,
            connect_attempts: 2,
            backoff_base_ms: 10,
            ..Default::default()
        }
    }

    fn manager(net: &MemoryNetwork, address: &str) -> MeshManager {
        let transport = net.endpoint(address).unwrap();
        MeshManager::new(Arc::new(transport), fast_config())
    }

    async fn next(mesh: &mut MeshManager) -> MeshEvent {
        tokio::time::timeout(Duration::from_secs(2), mesh.next_event())
            .await
            .expect("mesh event")
            .expect("mesh open")
    }

    fn increment(counter: u64) -> MeshMessage {
        MeshMessage::CounterIncrement {
            counter,
            actor: MemberId::new(),
        }
    }

    #[tokio::test]
    async fn test_connect_opens_both_sides() {
        let net = MemoryNetwork::new();
        let mut a = manager(&net, "mem://a");
        let mut b = manager(&net, "mem://b");
        b.start_accepting();

        assert!(a.connect(&addr("mem://b")));
        assert_eq!(a.state(&addr("mem://b")), Some(LinkState::Connecting));

        assert_eq!(
            next(&mut a).await,
            MeshEvent::LinkOpened {
                remote: addr("mem://b"),
                direction: Direction::Outbound,
            }
        );
        assert_eq!(
            next(&mut b).await,
            MeshEvent::LinkOpened {
                remote: addr("mem://a"),
                direction: Direction::Inbound,
            }
        );
        assert_eq!(a.open_links(), vec![addr("mem://b")]);
    }

    #[tokio::test]
    async fn test_duplicate_connect_is_noop() {
        let net = MemoryNetwork::new();
        let mut a = manager(&net, "mem://a");
        let mut b = manager(&net, "mem://b");
        b.start_accepting();

        assert!(a.connect(&addr("mem://b")));
        assert!(!a.connect(&addr("mem://b")));
        next(&mut a).await;
        assert!(!a.connect(&addr("mem://b")));
        assert_eq!(a.link_count(), 1);

        next(&mut b).await;
        assert_eq!(b.link_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_to_self_is_skipped() {
        let net = MemoryNetwork::new();
        let mut a = manager(&net, "mem://a");
        assert!(!a.connect(&addr("mem://a")));
        assert_eq!(a.link_count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_open_links() {
        let net = MemoryNetwork::new();
        let mut a = manager(&net, "mem://a");
        let mut b = manager(&net, "mem://b");
        b.start_accepting();
        a.connect(&addr("mem://b"));
        next(&mut a).await;
        next(&mut b).await;

        let msg = increment(4);
        assert_eq!(a.broadcast(&msg), 1);
        assert_eq!(
            next(&mut b).await,
            MeshEvent::Message {
                remote: addr("mem://a"),
                message: msg,
            }
        );
    }

    #[tokio::test]
    async fn test_unreachable_peer_errors_after_retries() {
        let net = MemoryNetwork::new();
        let mut a = manager(&net, "mem://a");
        a.connect(&addr("mem://ghost"));

        let event = next(&mut a).await;
        assert_eq!(
            event,
            MeshEvent::LinkClosed {
                remote: addr("mem://ghost"),
                state: LinkState::Errored,
                error: Some(TransportError::Unreachable(addr("mem://ghost"))),
            }
        );
        assert_eq!(a.link_count(), 0);
        // A later attempt is allowed again.
        assert!(a.connect(&addr("mem://ghost")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_reaches_late_listener() {
        let net = MemoryNetwork::new();
        let transport = net.endpoint("mem://a").unwrap();
        let config = MeshConfig {
            connect_attempts: 3,
            backoff_base_ms: 100,
            ..Default::default()
        };
        let mut a = MeshManager::new(Arc::new(transport), config);
        a.connect(&addr("mem://late"));

        // First attempt fails; the peer shows up before the retry.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut late = manager(&net, "mem://late");
        late.start_accepting();

        assert_eq!(
            next(&mut a).await,
            MeshEvent::LinkOpened {
                remote: addr("mem://late"),
                direction: Direction::Outbound,
            }
        );
    }

    #[tokio::test]
    async fn test_remote_close_removes_link() {
        let net = MemoryNetwork::new();
        let mut a = manager(&net, "mem://a");
        let mut b = manager(&net, "mem://b");
        b.start_accepting();
        a.connect(&addr("mem://b"));
        next(&mut a).await;
        next(&mut b).await;

        assert!(b.close(&addr("mem://a")));
        assert_eq!(
            next(&mut a).await,
            MeshEvent::LinkClosed {
                remote: addr("mem://b"),
                state: LinkState::Closed,
                error: None,
            }
        );
        assert!(a.open_links().is_empty());
    }

    #[tokio::test]
    async fn test_fault_isolated_to_one_link() {
        let net = MemoryNetwork::new();
        let mut a = manager(&net, "mem://a");
        let mut b = manager(&net, "mem://b");
        let mut c = manager(&net, "mem://c");
        b.start_accepting();
        c.start_accepting();
        a.connect(&addr("mem://b"));
        a.connect(&addr("mem://c"));
        next(&mut a).await;
        next(&mut a).await;
        next(&mut b).await;
        next(&mut c).await;

        net.sever(&addr("mem://a"), &addr("mem://b"));
        let closed = next(&mut a).await;
        assert!(matches!(
            closed,
            MeshEvent::LinkClosed {
                ref remote,
                state: LinkState::Errored,
                ..
            } if *remote == addr("mem://b")
        ));

        // The other link still carries traffic.
        assert_eq!(a.open_links(), vec![addr("mem://c")]);
        a.broadcast(&increment(1));
        assert!(matches!(next(&mut c).await, MeshEvent::Message { .. }));
    }

    #[tokio::test]
    async fn test_simultaneous_dial_keeps_one_link() {
        let net = MemoryNetwork::new();
        let mut a = manager(&net, "mem://a");
        let mut b = manager(&net, "mem://b");
        a.start_accepting();
        b.start_accepting();

        a.connect(&addr("mem://b"));
        b.connect(&addr("mem://a"));

        // Let both sides settle.
        for _ in 0..20 {
            tokio::select! {
                Some(_) = a.next_event() => {}
                Some(_) = b.next_event() => {}
                _ = tokio::time::sleep(Duration::from_millis(50)) => break,
            }
        }

        assert_eq!(a.open_links(), vec![addr("mem://b")]);
        assert_eq!(b.open_links(), vec![addr("mem://a")]);

        // The surviving link works in both directions.
        a.broadcast(&increment(7));
        let got = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(MeshEvent::Message { message, .. }) = b.next_event().await {
                    return message;
                }
            }
        })
        .await
        .unwrap();
        assert!(matches!(got, MeshMessage::CounterIncrement { counter: 7, .. }));
    }

    #[tokio::test]
    async fn test_close_all_drops_everything() {
        let net = MemoryNetwork::new();
        let mut a = manager(&net, "mem://a");
        let mut b = manager(&net, "mem://b");
        b.start_accepting();
        a.connect(&addr("mem://b"));
        next(&mut a).await;
        next(&mut b).await;

        a.close_all();
        assert_eq!(a.link_count(), 0);
        assert!(matches!(
            next(&mut b).await,
            MeshEvent::LinkClosed { state: LinkState::Closed, .. }
        ));
    }
}
