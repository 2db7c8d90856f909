//! TCP front end for the authority channel.
//!
//! One task per connection. Inbound frames are decoded and dispatched in
//! arrival order; outbound events are drained from the connection's queue by
//! a separate writer task.

use std::net::SocketAddr;
use std::sync::Arc;

use rally_wire::WireError;
use rally_wire::frame::{FrameSink, FrameStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::Authority;

/// Bind the configured listen address.
pub async fn bind(authority: &Authority) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(authority.config().listen_addr).await?;
    info!(addr = %listener.local_addr()?, "authority listening");
    Ok(listener)
}

/// Accept connections forever.
pub async fn serve(authority: Arc<Authority>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(%addr, "incoming authority connection");
                let authority = Arc::clone(&authority);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(authority, stream, addr).await {
                        warn!(%addr, error = %e, "authority connection error");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "accept error");
            }
        }
    }
}

async fn handle_connection(
    authority: Arc<Authority>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), WireError> {
    stream.set_nodelay(true)?;
    let max_frame_len = authority.config().max_frame_len;
    let (reader, writer) = stream.into_split();
    let mut frames = FrameStream::new(reader, max_frame_len);
    let mut sink = FrameSink::new(writer, max_frame_len);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = authority.connect(tx);
    info!(conn, %addr, "participant connected");

    let writer_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Err(e) = sink.send(&event).await {
                debug!(conn, error = %e, "authority write failed");
                break;
            }
        }
    });

    let result = loop {
        match frames.recv_bytes().await {
            Ok(Some(bytes)) => authority.handle_frame(conn, &bytes),
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    // Dropping the connection drops its queue, which ends the writer.
    authority.disconnect(conn);
    let _ = writer_task.await;
    info!(conn, %addr, "participant disconnected");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AuthorityConfig;
    use crate::discovery::BroadcastFeed;
    use rally_wire::authority_event::Event;
    use rally_wire::authority_request::Request;
    use rally_wire::frame::DEFAULT_MAX_FRAME_LEN;
    use rally_wire::{AuthorityEvent, AuthorityRequest, CreateSession};

    #[tokio::test]
    async fn test_create_over_tcp() {
        let config = AuthorityConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let authority = Arc::new(Authority::new(config, Arc::new(BroadcastFeed::default())));
        let listener = bind(&authority).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(Arc::clone(&authority), listener));

        let (reader, writer) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut frames = FrameStream::new(reader, DEFAULT_MAX_FRAME_LEN);
        let mut sink = FrameSink::new(writer, DEFAULT_MAX_FRAME_LEN);
        let create = Request::CreateSession(CreateSession {
            name: "Alice".into(),
            is_public: false,
        });
        sink.send(&AuthorityRequest::new(1, create)).await.unwrap();

        let event: AuthorityEvent = frames.recv().await.unwrap().unwrap();
        assert_eq!(event.in_reply_to, 1);
        assert!(matches!(event.event, Some(Event::SessionCreated(_))));
        assert_eq!(authority.registry().len(), 1);

        // Closing the socket removes the only member.
        drop(sink);
        drop(frames);
        for _ in 0..100 {
            if authority.registry().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(authority.registry().is_empty());
    }
}
