//! In-process peer transport.
//!
//! A `MemoryNetwork` is a shared switchboard; each `MemoryTransport` is one
//! endpoint on it. Links are pairs of unbounded channels. The network can
//! sever a link or isolate an endpoint to simulate transport faults.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rally_state::PeerAddress;
use tokio::sync::mpsc;

use crate::transport::{Inbound, LinkReceiver, LinkSender, PeerLink, PeerTransport, TransportError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Fault injection handle for one direction of one link.
struct Tap {
    from: PeerAddress,
    to: PeerAddress,
    tx: mpsc::WeakUnboundedSender<Inbound>,
}

struct Endpoint {
    generation: u64,
    incoming: mpsc::UnboundedSender<PeerLink>,
}

#[derive(Default)]
struct Switchboard {
    endpoints: HashMap<PeerAddress, Endpoint>,
    taps: Vec<Tap>,
    isolated: HashSet<PeerAddress>,
    generation: u64,
}

impl Switchboard {
    /// Inject a reset into every live tap matching `pred`.
    fn reset(&mut self, pred: impl Fn(&Tap) -> bool) -> usize {
        self.taps.retain(|tap| tap.tx.strong_count() > 0);
        let mut reset = 0;
        for tap in &self.taps {
            if !pred(tap) {
                continue;
            }
            if let Some(tx) = tap.tx.upgrade() {
                if tx.send(Err(TransportError::Reset)).is_ok() {
                    reset += 1;
                }
            }
        }
        reset
    }
}

/// Shared in-memory network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<Switchboard>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint at `address`. Re-registering replaces the old one.
    pub fn endpoint(&self, address: &str) -> Result<MemoryTransport, TransportError> {
        let address = PeerAddress::new(address).map_err(|e| TransportError::Io(e.to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = {
            let mut board = lock(&self.inner);
            board.generation += 1;
            let generation = board.generation;
            board.endpoints.insert(
                address.clone(),
                Endpoint {
                    generation,
                    incoming: tx,
                },
            );
            generation
        };
        Ok(MemoryTransport {
            address,
            generation,
            network: self.clone(),
            incoming: tokio::sync::Mutex::new(rx),
        })
    }

    /// Inject a reset into every live link between `a` and `b`.
    pub fn sever(&self, a: &PeerAddress, b: &PeerAddress) -> usize {
        lock(&self.inner)
            .reset(|tap| (&tap.from == a && &tap.to == b) || (&tap.from == b && &tap.to == a))
    }

    /// Reset every live link of `address` and refuse new ones to or from it
    /// until [`heal`](Self::heal).
    pub fn isolate(&self, address: &PeerAddress) -> usize {
        let mut board = lock(&self.inner);
        board.isolated.insert(address.clone());
        board.reset(|tap| &tap.from == address || &tap.to == address)
    }

    pub fn heal(&self, address: &PeerAddress) {
        lock(&self.inner).isolated.remove(address);
    }

    /// Build a link pair and return (dialer side, acceptor side).
    fn pair(&self, dialer: &PeerAddress, acceptor: &PeerAddress) -> (PeerLink, PeerLink) {
        let (to_acceptor, acceptor_rx) = mpsc::unbounded_channel();
        let (to_dialer, dialer_rx) = mpsc::unbounded_channel();

        let mut board = lock(&self.inner);
        board.taps.retain(|tap| tap.tx.strong_count() > 0);
        board.taps.push(Tap {
            from: dialer.clone(),
            to: acceptor.clone(),
            tx: to_acceptor.downgrade(),
        });
        board.taps.push(Tap {
            from: acceptor.clone(),
            to: dialer.clone(),
            tx: to_dialer.downgrade(),
        });

        let dialer_side = PeerLink {
            remote: acceptor.clone(),
            sender: LinkSender::new(to_acceptor),
            receiver: LinkReceiver::new(dialer_rx),
        };
        let acceptor_side = PeerLink {
            remote: dialer.clone(),
            sender: LinkSender::new(to_dialer),
            receiver: LinkReceiver::new(acceptor_rx),
        };
        (dialer_side, acceptor_side)
    }
}

/// One endpoint on a `MemoryNetwork`.
pub struct MemoryTransport {
    address: PeerAddress,
    generation: u64,
    network: MemoryNetwork,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<PeerLink>>,
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    fn local_address(&self) -> &PeerAddress {
        &self.address
    }

    async fn connect(&self, remote: &PeerAddress) -> Result<PeerLink, TransportError> {
        let endpoint = {
            let board = lock(&self.network.inner);
            if board.isolated.contains(&self.address) || board.isolated.contains(remote) {
                None
            } else {
                board.endpoints.get(remote).map(|e| e.incoming.clone())
            }
        }
        .ok_or_else(|| TransportError::Unreachable(remote.clone()))?;

        let (ours, theirs) = self.network.pair(&self.address, remote);
        if endpoint.send(theirs).is_err() {
            return Err(TransportError::Refused(remote.clone()));
        }
        Ok(ours)
    }

    async fn accept(&self) -> Result<PeerLink, TransportError> {
        self.incoming.lock().await.recv().await.ok_or(TransportError::Closed)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        let mut board = lock(&self.network.inner);
        // Only unregister if the slot is still ours.
        if board
            .endpoints
            .get(&self.address)
            .is_some_and(|e| e.generation == self.generation)
        {
            board.endpoints.remove(&self.address);
        }
    }
}
