//! The direct peer link capability.
//!
//! A `PeerTransport` has an address others can dial, can dial others, and
//! accepts inbound links. Each `PeerLink` carries opaque byte payloads in
//! both directions; framing and encoding are above this layer.

use async_trait::async_trait;
use rally_state::PeerAddress;
use thiserror::Error;
use tokio::sync::mpsc;

/// Failure on a peer link or while establishing one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(PeerAddress),
    #[error("peer {0} refused the link")]
    Refused(PeerAddress),
    #[error("link to {0} timed out")]
    Timeout(PeerAddress),
    #[error("link closed")]
    Closed,
    #[error("link reset")]
    Reset,
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                Self::Reset
            }
            ErrorKind::UnexpectedEof => Self::Closed,
            _ => Self::Io(e.to_string()),
        }
    }
}

/// One item on a link's inbound side.
pub type Inbound = Result<Vec<u8>, TransportError>;

/// Sending half of a link. Cheap to clone; the link closes when every clone
/// is dropped.
#[derive(Debug, Clone)]
pub struct LinkSender {
    tx: mpsc::UnboundedSender<Inbound>,
}

impl LinkSender {
    pub fn new(tx: mpsc::UnboundedSender<Inbound>) -> Self {
        Self { tx }
    }

    /// Queue a payload. Does not wait for delivery.
    pub fn send(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.tx.send(Ok(payload)).map_err(|_| TransportError::Closed)
    }
}

/// Receiving half of a link.
#[derive(Debug)]
pub struct LinkReceiver {
    rx: mpsc::UnboundedReceiver<Inbound>,
}

impl LinkReceiver {
    pub fn new(rx: mpsc::UnboundedReceiver<Inbound>) -> Self {
        Self { rx }
    }

    /// Next payload. `None` once the remote closed the link cleanly.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.rx.recv().await
    }
}

/// An established link to one remote participant.
#[derive(Debug)]
pub struct PeerLink {
    /// The remote's own listen address, whichever side dialed.
    pub remote: PeerAddress,
    pub sender: LinkSender,
    pub receiver: LinkReceiver,
}

#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    /// Address other participants dial to reach this one.
    fn local_address(&self) -> &PeerAddress;

    /// Dial a remote participant.
    async fn connect(&self, remote: &PeerAddress) -> Result<PeerLink, TransportError>;

    /// Wait for the next inbound link. An error means the transport is done
    /// accepting.
    async fn accept(&self) -> Result<PeerLink, TransportError>;
}
