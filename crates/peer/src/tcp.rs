//! TCP peer transport.
//!
//! Every link is a TCP stream of length-prefixed frames. The dialer's first
//! frame is a `LinkHello` naming its own listen address, so the acceptor can
//! key the link by the address the rest of the session knows it by.
//!
//! A background task owns the listener. Each accepted stream waits for its
//! hello on its own task, so a silent or slow dialer never holds up the
//! links queued behind it.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use rally_state::PeerAddress;
use rally_wire::frame::{FrameSink, FrameStream};
use rally_wire::{LinkHello, WireError};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::transport::{LinkReceiver, LinkSender, PeerLink, PeerTransport, TransportError};

/// How long an accepted stream has to present its hello.
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a failed `accept` before polling the listener again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct TcpTransport {
    local: PeerAddress,
    max_frame_len: usize,
    accepted: Mutex<mpsc::UnboundedReceiver<PeerLink>>,
    acceptor: JoinHandle<()>,
}

impl TcpTransport {
    /// Bind `addr`. `advertise` overrides the address reported to others,
    /// which is otherwise the bound socket address.
    pub async fn bind(
        addr: SocketAddr,
        advertise: Option<PeerAddress>,
        max_frame_len: usize,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local = match advertise {
            Some(address) => address,
            None => PeerAddress::new(listener.local_addr()?.to_string())
                .map_err(|e| TransportError::Io(e.to_string()))?,
        };
        debug!(peer = %local, "peer transport listening");

        let (links, accepted) = mpsc::unbounded_channel();
        let acceptor = tokio::spawn(accept_loop(listener, max_frame_len, links));
        Ok(Self {
            local,
            max_frame_len,
            accepted: Mutex::new(accepted),
            acceptor,
        })
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    max_frame_len: usize,
    links: mpsc::UnboundedSender<PeerLink>,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "peer accept error");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        if links.is_closed() {
            return;
        }

        let links = links.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(HELLO_TIMEOUT, greet(stream, max_frame_len)).await {
                Ok(Ok(link)) => {
                    let _ = links.send(link);
                }
                Ok(Err(e)) => {
                    debug!(%addr, error = %e, "dropping peer stream without a valid hello");
                }
                Err(_) => debug!(%addr, "peer stream sent no hello in time"),
            }
        });
    }
}

/// Read the dialer's hello off a freshly accepted stream.
async fn greet(stream: TcpStream, max_frame_len: usize) -> Result<PeerLink, TransportError> {
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    let mut frames = FrameStream::new(reader, max_frame_len);
    let hello: LinkHello = frames
        .recv()
        .await
        .map_err(wire_error)?
        .ok_or(TransportError::Closed)?;
    let remote =
        PeerAddress::new(hello.listen_address).map_err(|e| TransportError::Io(e.to_string()))?;
    Ok(spawn_link(frames, FrameSink::new(writer, max_frame_len), remote))
}

fn spawn_link(
    mut frames: FrameStream<OwnedReadHalf>,
    mut sink: FrameSink<OwnedWriteHalf>,
    remote: PeerAddress,
) -> PeerLink {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(Ok(payload)) = out_rx.recv().await {
            if sink.send_bytes(payload).await.is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        loop {
            match frames.recv_bytes().await {
                Ok(Some(bytes)) => {
                    if in_tx.send(Ok(bytes.to_vec())).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = in_tx.send(Err(wire_error(e)));
                    break;
                }
            }
        }
    });

    PeerLink {
        remote,
        sender: LinkSender::new(out_tx),
        receiver: LinkReceiver::new(in_rx),
    }
}

fn wire_error(e: WireError) -> TransportError {
    match e {
        WireError::Io(e) => e.into(),
        other => TransportError::Io(other.to_string()),
    }
}

fn connect_error(remote: &PeerAddress, e: std::io::Error) -> TransportError {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::ConnectionRefused => TransportError::Refused(remote.clone()),
        ErrorKind::TimedOut => TransportError::Timeout(remote.clone()),
        _ => TransportError::Unreachable(remote.clone()),
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    fn local_address(&self) -> &PeerAddress {
        &self.local
    }

    async fn connect(&self, remote: &PeerAddress) -> Result<PeerLink, TransportError> {
        let stream = TcpStream::connect(remote.as_str())
            .await
            .map_err(|e| connect_error(remote, e))?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();

        let mut sink = FrameSink::new(writer, self.max_frame_len);
        let hello = LinkHello {
            listen_address: self.local.as_str().to_string(),
        };
        sink.send(&hello).await.map_err(wire_error)?;

        let frames = FrameStream::new(reader, self.max_frame_len);
        Ok(spawn_link(frames, sink, remote.clone()))
    }

    async fn accept(&self) -> Result<PeerLink, TransportError> {
        self.accepted
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rally_wire::frame::DEFAULT_MAX_FRAME_LEN;

    async fn transport() -> TcpTransport {
        TcpTransport::bind("127.0.0.1:0".parse().unwrap(), None, DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_hello_names_the_dialer() {
        let a = transport().await;
        let b = transport().await;
        let b_addr = b.local_address().clone();

        let mut dialed = a.connect(&b_addr).await.unwrap();
        let mut accepted = b.accept().await.unwrap();

        assert_eq!(&accepted.remote, a.local_address());
        assert_eq!(dialed.remote, b_addr);

        dialed.sender.send(b"hi".to_vec()).unwrap();
        assert_eq!(accepted.receiver.recv().await.unwrap().unwrap(), b"hi");

        drop(accepted);
        // Remote closed: clean end or reset, never a payload.
        assert!(!matches!(dialed.receiver.recv().await, Some(Ok(_))));
    }

    #[tokio::test]
    async fn test_silent_stream_does_not_hold_up_accept() {
        let a = transport().await;
        let b = transport().await;

        // Connected first, never says hello.
        let _silent = TcpStream::connect(b.local_address().as_str()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let _dialed = a.connect(b.local_address()).await.unwrap();
        let accepted = tokio::time::timeout(Duration::from_secs(1), b.accept())
            .await
            .expect("accept waited on the silent stream")
            .unwrap();
        assert_eq!(&accepted.remote, a.local_address());
    }

    #[tokio::test]
    async fn test_blank_hello_is_dropped() {
        let a = transport().await;
        let b = transport().await;

        let (_reader, writer) = TcpStream::connect(b.local_address().as_str())
            .await
            .unwrap()
            .into_split();
        let mut sink = FrameSink::new(writer, DEFAULT_MAX_FRAME_LEN);
        sink.send(&LinkHello {
            listen_address: String::new(),
        })
        .await
        .unwrap();

        let _dialed = a.connect(b.local_address()).await.unwrap();
        let accepted = tokio::time::timeout(Duration::from_secs(1), b.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&accepted.remote, a.local_address());
    }

    #[tokio::test]
    async fn test_refused_when_nothing_listens() {
        let a = transport().await;
        let gone = {
            let t = transport().await;
            t.local_address().clone()
        };
        // The listener closes with its acceptor task.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = a.connect(&gone).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Refused(_) | TransportError::Unreachable(_)
        ));
    }
}
